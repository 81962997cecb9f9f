//! A review pipeline that pauses for a human, is edited, and resumes.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use pipewright_core::error::Result;
use pipewright_core::traits::Collaborator;
use pipewright_core::types::{ExpectedFormat, InvokeOptions};
use pipewright_flow::checkpoint::steps::{MODIFICATIONS_KEY, RESUMED_FROM_KEY};
use pipewright_flow::{
    CheckpointReader, CheckpointRequest, CheckpointSelector, CheckpointWriter, Graph,
    LoadCheckpoint, RetryPolicy, SaveCheckpoint, SharedStore, Step, StoreKey,
};
use pipewright_test_utils::{config_from_toml, MockCollaborator, TestWorkspace};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Route {
    Continue,
    Pause,
    WriteLetter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Requirements {
    required: Vec<String>,
}

const REQUIREMENTS: StoreKey<Requirements> = StoreKey::new("requirements");
const LETTER: StoreKey<String> = StoreKey::new("letter");

/// Asks the collaborator to extract requirements from the posting.
struct Extract {
    collaborator: Arc<dyn Collaborator>,
}

impl Step<Route> for Extract {
    type Prep = String;
    type Exec = Requirements;

    fn name(&self) -> &str {
        "extract"
    }

    fn prep(&self, store: &SharedStore) -> Result<String> {
        store.require_as("extract", "posting")
    }

    fn exec<'a>(&'a self, posting: &'a String) -> BoxFuture<'a, Result<Requirements>> {
        Box::pin(async move {
            let opts = InvokeOptions::default().with_format(ExpectedFormat::Yaml);
            let reply = self.collaborator.invoke(posting, &opts).await?;
            Ok(serde_json::from_value(reply.into_structured()?)?)
        })
    }

    fn post(&self, store: &mut SharedStore, _prep: String, reqs: Requirements) -> Result<Route> {
        store.write(REQUIREMENTS, &reqs)?;
        Ok(Route::Continue)
    }
}

/// Writes a letter from whatever requirements are in the store.
struct Letter;

impl Step<Route> for Letter {
    type Prep = Requirements;
    type Exec = String;

    fn name(&self) -> &str {
        "letter"
    }

    fn prep(&self, store: &SharedStore) -> Result<Requirements> {
        store.read_required("letter", REQUIREMENTS)
    }

    fn exec<'a>(&'a self, reqs: &'a Requirements) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Ok(format!("I bring {}.", reqs.required.join(" and "))) })
    }

    fn post(&self, store: &mut SharedStore, _prep: Requirements, letter: String) -> Result<Route> {
        store.write(LETTER, &letter)?;
        Ok(Route::Continue)
    }
}

#[tokio::test]
async fn test_pause_edit_resume() {
    let ws = TestWorkspace::new();
    let config = config_from_toml(&format!(
        "[checkpoint]\nroot_dir = '{}'\npause_after_save = true\nclear_store_on_resume = true\n\n[retry]\nmax_retries = 1\n",
        ws.root().display()
    ));
    let mock = Arc::new(
        MockCollaborator::new()
            .fail("503 Service Unavailable")
            .reply("required:\n  - Rust\n  - COBOL\n"),
    );

    // First run: extract, then save and pause for review.
    let save = SaveCheckpoint::new(
        "save_review",
        CheckpointWriter::from_config(&config.checkpoint),
        CheckpointRequest::new("application", "requirements")
            .keys(["requirements", "posting"])
            .instruction("Delete requirements that do not apply."),
        &Route::WriteLetter,
        Route::Continue,
    )
    .unwrap()
    .on_pause(Route::Pause);

    let first = Graph::builder("application")
        .step(Extract {
            collaborator: mock.clone(),
        })
        .step(save)
        .step(Letter)
        .then("extract", "save_review")
        .on("save_review", Route::Continue, "letter")
        .default_retry(RetryPolicy::from(&config.retry))
        .build()
        .unwrap();

    let mut store = SharedStore::new();
    store.set_str("posting", "Senior Rust engineer, some COBOL.");
    let result = first.execute(&mut store).await.unwrap();

    assert_eq!(result.executed(), vec!["extract", "save_review"]);
    assert_eq!(result.skipped, vec!["letter"]);
    assert_eq!(result.last_action, Some(Route::Pause));
    assert!(store.get("letter").is_none());

    // The reviewer drops COBOL.
    let output = ws.output_file("application", "requirements");
    let mut doc: serde_json::Value =
        serde_yaml_ng::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(doc["# instructions"], "Delete requirements that do not apply.");
    doc["requirements"]["required"] = json!(["Rust"]);
    ws.write(
        "outputs/application_requirements.yaml",
        &serde_yaml_ng::to_string(&doc).unwrap(),
    );

    // Second run in a fresh process: load, then write the letter.
    let resume = Graph::builder("application-resume")
        .step(LoadCheckpoint::<Route>::from_config(
            "resume",
            &config.checkpoint,
            "application",
            CheckpointSelector::AutoDetect,
        ))
        .step(Letter)
        .on("resume", Route::WriteLetter, "letter")
        .build()
        .unwrap();

    let mut resumed = SharedStore::new();
    resumed.set_str("scratch", "left over from another run");
    let result = resume.execute(&mut resumed).await.unwrap();

    assert_eq!(result.executed(), vec!["resume", "letter"]);
    assert!(!resumed.contains("scratch"));
    assert_eq!(resumed.read(LETTER).unwrap().as_deref(), Some("I bring Rust."));
    assert_eq!(
        resumed.read(REQUIREMENTS).unwrap(),
        Some(Requirements {
            required: vec!["Rust".into()]
        })
    );
    assert!(resumed.get_str(RESUMED_FROM_KEY).is_some());
    assert_eq!(
        resumed.get(MODIFICATIONS_KEY).unwrap()[0],
        json!({
            "path": "requirements.required",
            "action": "list_size_changed",
            "original": ["Rust", "COBOL"],
            "modified": ["Rust"],
        })
    );
    // One transport failure, retried under the configured default policy.
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn test_resume_without_checkpoint_is_not_found() {
    let ws = TestWorkspace::new();
    let graph = Graph::builder("resume")
        .step(LoadCheckpoint::<Route>::new(
            "resume",
            CheckpointReader::new(ws.root()),
            "application",
            CheckpointSelector::AutoDetect,
        ))
        .build()
        .unwrap();

    let err = graph.execute(&mut SharedStore::new()).await.unwrap_err();
    assert!(err.is_not_found());
}
