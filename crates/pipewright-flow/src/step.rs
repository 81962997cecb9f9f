//! The three-phase step lifecycle and its local retry loop.
//!
//! A step reads the store in `prep`, does its heavy work in `exec` (usually a
//! collaborator call), and writes results back in `post`. `exec` only ever
//! sees what `prep` produced, so it is safe to run concurrently with other
//! steps' `exec`.

use std::marker::PhantomData;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use pipewright_core::config::RetryConfig;
use pipewright_core::error::{FlowError, Result};

use crate::action::Action;
use crate::store::SharedStore;

/// Retry configuration for a step's `exec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub wait: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(max_retries: u32, wait: Duration) -> Self {
        Self { max_retries, wait }
    }

    /// Total number of `exec` invocations this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.wait())
    }
}

/// An atomic, retryable unit of pipeline work.
pub trait Step<A: Action>: Send + Sync + 'static {
    /// What `prep` hands to `exec`.
    type Prep: Send + Sync + 'static;
    /// What `exec` hands to `post`.
    type Exec: Send + 'static;

    /// Unique name within a graph.
    fn name(&self) -> &str;

    /// Retry policy for `exec`. `None` uses the policy of whatever runs the
    /// step (a graph's default, or a single attempt).
    fn retry(&self) -> Option<RetryPolicy> {
        None
    }

    /// Read what the step needs from the store.
    fn prep(&self, store: &SharedStore) -> Result<Self::Prep>;

    /// Do the work. Must not depend on anything but `prep`.
    fn exec<'a>(&'a self, prep: &'a Self::Prep) -> BoxFuture<'a, Result<Self::Exec>>;

    /// Deterministic substitute once retries are exhausted. `None` propagates
    /// the failure and aborts the run.
    fn exec_fallback(&self, prep: &Self::Prep, error: &FlowError) -> Option<Self::Exec> {
        let _ = (prep, error);
        None
    }

    /// Write results into the store and pick the next route.
    fn post(&self, store: &mut SharedStore, prep: Self::Prep, exec: Self::Exec) -> Result<A>;
}

/// Run `exec` under the step's retry policy, falling back when exhausted.
///
/// Contract and not-found errors are returned as is on the first attempt:
/// they are neither retried nor offered to `exec_fallback`.
pub(crate) async fn exec_with_retry<A, S>(
    step: &S,
    prep: &S::Prep,
    default_retry: RetryPolicy,
) -> Result<S::Exec>
where
    A: Action,
    S: Step<A>,
{
    let policy = step.retry().unwrap_or(default_retry);
    let mut attempt: u32 = 0;

    let last_err = loop {
        attempt += 1;
        match step.exec(prep).await {
            Ok(out) => {
                if attempt > 1 {
                    debug!(step = step.name(), attempt, "Step succeeded after retry");
                }
                return Ok(out);
            }
            Err(e) if e.is_contract_violation() || e.is_not_found() => {
                error!(step = step.name(), attempt, error = %e, "Step exec failed, not retryable");
                return Err(e);
            }
            Err(e) if attempt <= policy.max_retries => {
                warn!(
                    step = step.name(),
                    attempt,
                    max_attempts = policy.max_attempts(),
                    wait_ms = policy.wait.as_millis() as u64,
                    error = %e,
                    "Step exec failed, retrying"
                );
                if !policy.wait.is_zero() {
                    tokio::time::sleep(policy.wait).await;
                }
            }
            Err(e) => break e,
        }
    };

    if let Some(fallback) = step.exec_fallback(prep, &last_err) {
        warn!(
            step = step.name(),
            attempts = attempt,
            error = %last_err,
            "Step exhausted retries, using fallback"
        );
        return Ok(fallback);
    }

    error!(step = step.name(), attempts = attempt, error = %last_err, "Step failed");
    Err(FlowError::StepFailed {
        step: step.name().to_string(),
        attempts: attempt,
        message: last_err.to_string(),
    })
}

/// Drive one step through prep → exec → post against `store`.
pub async fn run_step<A, S>(step: &S, store: &mut SharedStore) -> Result<A>
where
    A: Action,
    S: Step<A>,
{
    let prep = step.prep(store)?;
    let exec = exec_with_retry::<A, S>(step, &prep, RetryPolicy::none()).await?;
    step.post(store, prep, exec)
}

// ---------------------------------------------------------------------------
// Type-erased lifecycle used by the graph scheduler
// ---------------------------------------------------------------------------

/// A step with its associated types hidden, so graphs can hold mixed steps.
pub(crate) trait DynStep<A: Action>: Send + Sync {
    fn name(&self) -> &str;

    /// Run `prep`, returning a handle that can execute without the store.
    /// `default_retry` applies when the step has no policy of its own.
    fn prepare<'s>(
        &'s self,
        store: &SharedStore,
        default_retry: RetryPolicy,
    ) -> Result<Box<dyn Prepared<'s, A> + 's>>;
}

/// A step whose `prep` has run.
pub(crate) trait Prepared<'s, A: Action>: Send {
    fn execute(self: Box<Self>) -> BoxFuture<'s, Result<Box<dyn Executed<A> + 's>>>;
}

/// A step whose `exec` has run; only `post` remains.
pub(crate) trait Executed<A: Action>: Send {
    fn post(self: Box<Self>, store: &mut SharedStore) -> Result<A>;
}

pub(crate) struct Erased<S>(pub S);

struct PreparedStep<'s, S: Step<A>, A: Action> {
    step: &'s S,
    prep: S::Prep,
    default_retry: RetryPolicy,
    _action: PhantomData<fn() -> A>,
}

struct ExecutedStep<'s, S: Step<A>, A: Action> {
    step: &'s S,
    prep: S::Prep,
    exec: S::Exec,
    _action: PhantomData<fn() -> A>,
}

impl<A: Action, S: Step<A>> DynStep<A> for Erased<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn prepare<'s>(
        &'s self,
        store: &SharedStore,
        default_retry: RetryPolicy,
    ) -> Result<Box<dyn Prepared<'s, A> + 's>> {
        let prep = self.0.prep(store)?;
        Ok(Box::new(PreparedStep {
            step: &self.0,
            prep,
            default_retry,
            _action: PhantomData,
        }))
    }
}

impl<'s, A: Action, S: Step<A>> Prepared<'s, A> for PreparedStep<'s, S, A> {
    fn execute(self: Box<Self>) -> BoxFuture<'s, Result<Box<dyn Executed<A> + 's>>> {
        Box::pin(async move {
            let PreparedStep {
                step,
                prep,
                default_retry,
                ..
            } = *self;
            let exec = exec_with_retry::<A, S>(step, &prep, default_retry).await?;
            Ok(Box::new(ExecutedStep {
                step,
                prep,
                exec,
                _action: PhantomData,
            }) as Box<dyn Executed<A> + 's>)
        })
    }
}

impl<'s, A: Action, S: Step<A>> Executed<A> for ExecutedStep<'s, S, A> {
    fn post(self: Box<Self>, store: &mut SharedStore) -> Result<A> {
        let ExecutedStep { step, prep, exec, .. } = *self;
        step.post(store, prep, exec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Route {
        Done,
    }

    /// Fails `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        policy: RetryPolicy,
        fallback: Option<String>,
        /// Error to fail with instead of a collaborator failure.
        error: Option<fn() -> FlowError>,
    }

    impl Flaky {
        fn new(failures: u32, max_retries: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                policy: RetryPolicy::new(max_retries, Duration::ZERO),
                fallback: None,
                error: None,
            }
        }
    }

    impl Step<Route> for Flaky {
        type Prep = String;
        type Exec = String;

        fn name(&self) -> &str {
            "flaky"
        }

        fn retry(&self) -> Option<RetryPolicy> {
            Some(self.policy)
        }

        fn prep(&self, store: &SharedStore) -> Result<String> {
            Ok(store.get_str("input").unwrap_or("none").to_string())
        }

        fn exec<'a>(&'a self, prep: &'a String) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.failures {
                    Err(match self.error {
                        Some(make) => make(),
                        None => FlowError::Collaborator(format!("attempt {n} failed")),
                    })
                } else {
                    Ok(format!("processed {prep}"))
                }
            })
        }

        fn exec_fallback(&self, _prep: &String, _error: &FlowError) -> Option<String> {
            self.fallback.clone()
        }

        fn post(&self, store: &mut SharedStore, _prep: String, exec: String) -> Result<Route> {
            store.set_str("output", exec);
            Ok(Route::Done)
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let step = Flaky::new(0, 0);
        let mut store = SharedStore::new();
        store.set_str("input", "cv");
        let action = run_step::<Route, _>(&step, &mut store).await.unwrap();
        assert_eq!(action, Route::Done);
        assert_eq!(store.get_str("output"), Some("processed cv"));
        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_within_retry_budget() {
        let step = Flaky::new(2, 2);
        let mut store = SharedStore::new();
        run_step::<Route, _>(&step, &mut store).await.unwrap();
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_str("output"), Some("processed none"));
    }

    #[tokio::test]
    async fn test_exhaustion_invokes_n_plus_one_times() {
        let step = Flaky::new(u32::MAX, 3);
        let mut store = SharedStore::new();
        let err = run_step::<Route, _>(&step, &mut store).await.unwrap_err();
        assert_eq!(step.calls.load(Ordering::SeqCst), 4);
        match err {
            FlowError::StepFailed { step, attempts, .. } => {
                assert_eq!(step, "flaky");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
        assert!(store.get("output").is_none());
    }

    #[tokio::test]
    async fn test_fallback_after_exhaustion() {
        let mut step = Flaky::new(u32::MAX, 1);
        step.fallback = Some("default summary".into());
        let mut store = SharedStore::new();
        run_step::<Route, _>(&step, &mut store).await.unwrap();
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_str("output"), Some("default summary"));
    }

    #[tokio::test]
    async fn test_contract_error_is_neither_retried_nor_replaced() {
        let mut step = Flaky::new(u32::MAX, 2);
        step.fallback = Some("default".into());
        step.error = Some(|| FlowError::IncompatibleVersion {
            found: "2.0".into(),
            supported_major: 1,
        });
        let mut store = SharedStore::new();

        let err = run_step::<Route, _>(&step, &mut store).await.unwrap_err();

        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, FlowError::IncompatibleVersion { ref found, .. } if found == "2.0"));
        assert!(store.get("output").is_none());
    }

    #[tokio::test]
    async fn test_not_found_is_returned_after_one_attempt() {
        let mut step = Flaky::new(u32::MAX, 3);
        step.fallback = Some("default".into());
        step.error = Some(|| FlowError::CheckpointNotFound {
            flow: "cv".into(),
            selector: "auto_detect".into(),
        });
        let mut store = SharedStore::new();

        let err = run_step::<Route, _>(&step, &mut store).await.unwrap_err();

        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_step_policy_overrides_default() {
        let step = Flaky::new(1, 1);
        let prep = String::new();
        exec_with_retry::<Route, _>(&step, &prep, RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_wait_between_attempts() {
        let mut step = Flaky::new(2, 2);
        step.policy.wait = Duration::from_secs(5);
        let started = tokio::time::Instant::now();
        let mut store = SharedStore::new();
        run_step::<Route, _>(&step, &mut store).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_retries: 2,
            wait_ms: 100,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.wait, Duration::from_millis(100));
    }
}
