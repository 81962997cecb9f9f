use std::collections::BTreeMap;
use std::marker::PhantomData;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;

use pipewright_core::config::CheckpointConfig;
use pipewright_core::error::{FlowError, Result};

use super::reader::{CheckpointReader, CheckpointSelector, LoadedCheckpoint};
use super::writer::{CheckpointAction, CheckpointRequest, CheckpointWriter, SavedCheckpoint};
use crate::action::{action_label, parse_action, Action};
use crate::step::Step;
use crate::store::SharedStore;

/// Store key holding the path of the last checkpoint written.
pub const LAST_CHECKPOINT_KEY: &str = "last_checkpoint";
/// Store key holding the path of the checkpoint a run resumed from.
pub const RESUMED_FROM_KEY: &str = "resumed_from";
/// Store key holding the reviewer edits applied on resume.
pub const MODIFICATIONS_KEY: &str = "checkpoint_modifications";

/// Persists declared store keys and routes on whether to pause.
pub struct SaveCheckpoint<A: Action> {
    name: String,
    writer: CheckpointWriter,
    request: CheckpointRequest,
    on_continue: A,
    on_pause: A,
}

impl<A: Action> SaveCheckpoint<A> {
    /// `next_action` is what a resumed run routes with; `on_continue` is what
    /// this run routes with after saving.
    pub fn new(
        name: impl Into<String>,
        writer: CheckpointWriter,
        request: CheckpointRequest,
        next_action: &A,
        on_continue: A,
    ) -> Result<Self> {
        let name = name.into();
        request.validate()?;
        let request = request
            .next_action(action_label(next_action)?)
            .node_class(name.clone());
        Ok(Self {
            name,
            writer,
            request,
            on_pause: on_continue.clone(),
            on_continue,
        })
    }

    /// Route with `action` when the writer asks to pause.
    pub fn on_pause(mut self, action: A) -> Self {
        self.on_pause = action;
        self
    }
}

impl<A: Action> Step<A> for SaveCheckpoint<A> {
    type Prep = BTreeMap<String, Value>;
    type Exec = SavedCheckpoint;

    fn name(&self) -> &str {
        &self.name
    }

    fn prep(&self, store: &SharedStore) -> Result<Self::Prep> {
        Ok(store.project(&self.request.keys))
    }

    fn exec<'a>(&'a self, state: &'a Self::Prep) -> BoxFuture<'a, Result<SavedCheckpoint>> {
        Box::pin(async move {
            self.writer
                .save_projection(state.clone(), &self.request, Utc::now())
        })
    }

    fn post(&self, store: &mut SharedStore, _state: Self::Prep, saved: SavedCheckpoint) -> Result<A> {
        store.set_str(LAST_CHECKPOINT_KEY, saved.checkpoint_path.display().to_string());
        Ok(match saved.action {
            CheckpointAction::Continue => self.on_continue.clone(),
            CheckpointAction::Pause => self.on_pause.clone(),
        })
    }
}

/// Restores a checkpoint (with reviewer edits) and routes with its `next_action`.
pub struct LoadCheckpoint<A: Action> {
    name: String,
    reader: CheckpointReader,
    flow: String,
    selector: CheckpointSelector,
    clear_first: bool,
    _action: PhantomData<fn() -> A>,
}

impl<A: Action> LoadCheckpoint<A> {
    pub fn new(
        name: impl Into<String>,
        reader: CheckpointReader,
        flow: impl Into<String>,
        selector: CheckpointSelector,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            flow: flow.into(),
            selector,
            clear_first: false,
            _action: PhantomData,
        }
    }

    /// Reader and store handling taken from `[checkpoint]` settings.
    pub fn from_config(
        name: impl Into<String>,
        config: &CheckpointConfig,
        flow: impl Into<String>,
        selector: CheckpointSelector,
    ) -> Self {
        Self::new(name, CheckpointReader::from_config(config), flow, selector)
            .clear_first(config.clear_store_on_resume)
    }

    /// Empty the store before splicing in the restored state.
    pub fn clear_first(mut self, clear: bool) -> Self {
        self.clear_first = clear;
        self
    }
}

impl<A: Action> Step<A> for LoadCheckpoint<A> {
    type Prep = ();
    type Exec = LoadedCheckpoint;

    fn name(&self) -> &str {
        &self.name
    }

    fn prep(&self, _store: &SharedStore) -> Result<()> {
        Ok(())
    }

    fn exec<'a>(&'a self, _prep: &'a ()) -> BoxFuture<'a, Result<LoadedCheckpoint>> {
        Box::pin(async move { self.reader.load(&self.flow, &self.selector) })
    }

    fn post(&self, store: &mut SharedStore, _prep: (), loaded: LoadedCheckpoint) -> Result<A> {
        let label = loaded.next_action();
        let action = parse_action::<A>(label).ok_or_else(|| FlowError::UnknownAction {
            step: self.name.clone(),
            action: label.to_string(),
        })?;

        loaded.apply_to(store, self.clear_first);
        store.set_str(RESUMED_FROM_KEY, loaded.path.display().to_string());
        store.set(MODIFICATIONS_KEY, serde_json::to_value(&loaded.modifications)?);
        Ok(action)
    }
}
