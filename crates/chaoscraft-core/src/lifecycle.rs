//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Experiment lifecycle state machine over the store and executor."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
//! Every transition follows the same protocol: read the record, claim it by
//! moving it into an in-flight state with a compare-and-swap at the read
//! version, run the executor once, then settle with a second compare-and-swap
//! at the claimed version. Whoever wins the claim owns the experiment until it
//! settles; everyone else gets a conflict. No in-process locks are involved, so
//! several engines may share one store.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chaoscraft_store::{
    Experiment, ExperimentSpec, ExperimentState, ExperimentStore, LastError, ListFilter,
    NewExperiment, Operation, StoreError,
};
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ConflictReason, EffectError, LifecycleError, Result};
use crate::executor::InjectionExecutor;
use crate::metrics::{LifecycleMetrics, TransitionOutcome};
use crate::retry::RetryPolicy;

/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Tunables for [`LifecycleEngine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Upper bound on a single executor call; expiry leaves the effect unknown.
    pub effect_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            effect_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of [`LifecycleEngine::create`].
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub experiment: Experiment,
    /// True when an idempotency key matched an earlier create.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    operation: Operation,
    in_flight: ExperimentState,
    settled: ExperimentState,
}

impl Transition {
    const START: Transition = Transition {
        operation: Operation::Start,
        in_flight: ExperimentState::Starting,
        settled: ExperimentState::Running,
    };

    const STOP: Transition = Transition {
        operation: Operation::Stop,
        in_flight: ExperimentState::Stopping,
        settled: ExperimentState::Stopped,
    };

    fn accepts(&self, state: ExperimentState) -> bool {
        match self.operation {
            Operation::Start => matches!(
                state,
                ExperimentState::Pending | ExperimentState::Stopped | ExperimentState::Failed
            ),
            Operation::Stop => state == ExperimentState::Running,
            Operation::Recover => false,
        }
    }
}

/// Sole writer of experiment state.
#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn ExperimentStore>,
    executor: Arc<dyn InjectionExecutor>,
    settings: EngineSettings,
    metrics: Option<LifecycleMetrics>,
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("store", &self.store.backend())
            .field("executor", &self.executor.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        executor: Arc<dyn InjectionExecutor>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            executor,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LifecycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate and persist a new `pending` experiment.
    ///
    /// A repeated idempotency key returns the original record when the spec
    /// matches; a different spec, or a key whose experiment has since been
    /// deleted, is a conflict.
    pub async fn create(
        &self,
        spec: ExperimentSpec,
        idempotency_key: Option<String>,
    ) -> Result<CreateOutcome> {
        let mut problems = spec.validation_errors();
        let idempotency_key = idempotency_key.map(|key| key.trim().to_owned());
        if let Some(key) = idempotency_key.as_deref() {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                problems.push(format!(
                    "idempotency key must be between 1 and {} bytes",
                    MAX_IDEMPOTENCY_KEY_LEN
                ));
            }
        }
        if !problems.is_empty() {
            return Err(LifecycleError::Validation(problems));
        }

        let new = NewExperiment {
            spec,
            idempotency_key,
        };
        let store = &self.store;
        let created = {
            let new = new.clone();
            self.with_retry("create", move || store.create(new.clone()))
                .await
        };

        match created {
            Ok(experiment) => {
                info!(
                    experiment_id = %experiment.id,
                    version = experiment.version,
                    state = %experiment.state,
                    fault = experiment.spec.fault.label(),
                    "experiment created"
                );
                Ok(CreateOutcome {
                    experiment,
                    replayed: false,
                })
            }
            Err(StoreError::DuplicateIdempotencyKey { key, existing }) => {
                self.replay(new.spec, key, existing).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replay(
        &self,
        spec: ExperimentSpec,
        key: String,
        existing: Uuid,
    ) -> Result<CreateOutcome> {
        let original = match self.get(existing).await {
            Ok(original) => original,
            Err(LifecycleError::NotFound(_)) => {
                return Err(LifecycleError::conflict(
                    ConflictReason::IdempotencyKeyRetired,
                    format!(
                        "idempotency key {:?} belonged to experiment {}, which has been deleted",
                        key, existing
                    ),
                ));
            }
            Err(err) => return Err(err),
        };
        if original.spec != spec {
            return Err(LifecycleError::conflict(
                ConflictReason::IdempotencyMismatch,
                format!(
                    "idempotency key {:?} was used for experiment {} with a different spec",
                    key, existing
                ),
            ));
        }
        info!(experiment_id = %existing, "idempotent create replayed");
        Ok(CreateOutcome {
            experiment: original,
            replayed: true,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Experiment> {
        let store = &self.store;
        self.with_retry("get", move || store.get(id))
            .await
            .map_err(LifecycleError::from)
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Experiment>> {
        let store = &self.store;
        self.with_retry("list", move || async move { store.list(&filter).await })
            .await
            .map_err(LifecycleError::from)
    }

    /// Count every record matching `state`, ignoring any page limit.
    pub async fn count(&self, state: Option<ExperimentState>) -> Result<usize> {
        let store = &self.store;
        self.with_retry("count", move || store.count(state))
            .await
            .map_err(LifecycleError::from)
    }

    /// Remove an experiment that is pending, stopped or failed.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let store = &self.store;
        self.with_retry("delete", move || store.delete(id))
            .await
            .map_err(LifecycleError::from)?;
        info!(experiment_id = %id, "experiment deleted");
        Ok(())
    }

    /// `pending | stopped | failed → starting → running | failed`.
    pub async fn start(&self, id: Uuid) -> Result<Experiment> {
        self.transition(Transition::START, id).await
    }

    /// `running → stopping → stopped | failed`.
    pub async fn stop(&self, id: Uuid) -> Result<Experiment> {
        self.transition(Transition::STOP, id).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await.map_err(LifecycleError::from)
    }

    async fn transition(&self, transition: Transition, id: Uuid) -> Result<Experiment> {
        let operation = transition.operation.as_str();
        let result = self.run_transition(transition, id).await;
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => TransitionOutcome::Succeeded,
                Err(LifecycleError::Effect { .. }) => TransitionOutcome::EffectFailed,
                Err(LifecycleError::Inconsistency { .. }) => TransitionOutcome::Inconsistent,
                Err(LifecycleError::StoreTransient(_)) | Err(LifecycleError::StoreFatal(_)) => {
                    TransitionOutcome::StoreError
                }
                Err(_) => TransitionOutcome::Rejected,
            };
            metrics.record_transition(operation, outcome);
        }
        result
    }

    async fn run_transition(&self, transition: Transition, id: Uuid) -> Result<Experiment> {
        let operation = transition.operation;
        let current = self.get(id).await?;

        if current.state.is_in_flight() {
            warn!(
                experiment_id = %id,
                version = current.version,
                state = %current.state,
                operation = operation.as_str(),
                "transition rejected: another transition is in flight"
            );
            return Err(LifecycleError::conflict(
                ConflictReason::InFlight,
                format!(
                    "experiment {} is {}; retry once the current transition settles",
                    id, current.state
                ),
            ));
        }
        if !transition.accepts(current.state) {
            return Err(LifecycleError::conflict(
                ConflictReason::InvalidTransition,
                format!("cannot {} experiment {} while {}", operation, id, current.state),
            ));
        }

        let claimed = self
            .swap(
                id,
                current.version,
                transition.in_flight,
                current.last_error.clone(),
                "claim",
            )
            .await
            .map_err(LifecycleError::from)?;
        info!(
            experiment_id = %id,
            version = claimed.version,
            state = %claimed.state,
            operation = operation.as_str(),
            "transition claimed"
        );

        let effect = self.run_effect(operation, &claimed).await;

        let (state, last_error) = match &effect {
            Ok(()) => (transition.settled, None),
            Err(err) => (
                ExperimentState::Failed,
                Some(LastError::new(operation, err.message.clone(), err.is_unknown())),
            ),
        };

        let settled = match self
            .swap(id, claimed.version, state, last_error, "settle")
            .await
        {
            Ok(settled) => settled,
            Err(store_err) => {
                let outcome = match &effect {
                    Ok(()) => "succeeded",
                    Err(err) if err.is_unknown() => "ended with unknown outcome",
                    Err(_) => "failed",
                };
                error!(
                    experiment_id = %id,
                    version = claimed.version,
                    state = %claimed.state,
                    operation = operation.as_str(),
                    intended_state = %state,
                    error = %store_err,
                    "effect outcome could not be recorded"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_inconsistency();
                }
                return Err(LifecycleError::Inconsistency {
                    id,
                    message: format!(
                        "{} effect {} but recording {} failed: {}",
                        operation, outcome, state, store_err
                    ),
                });
            }
        };

        match effect {
            Ok(()) => {
                info!(
                    experiment_id = %id,
                    version = settled.version,
                    state = %settled.state,
                    operation = operation.as_str(),
                    "transition settled"
                );
                Ok(settled)
            }
            Err(source) => {
                warn!(
                    experiment_id = %id,
                    version = settled.version,
                    state = %settled.state,
                    operation = operation.as_str(),
                    outcome = source.outcome.as_str(),
                    error = %source,
                    "injection effect failed"
                );
                Err(LifecycleError::Effect {
                    experiment: Box::new(settled),
                    source,
                })
            }
        }
    }

    async fn run_effect(
        &self,
        operation: Operation,
        claimed: &Experiment,
    ) -> std::result::Result<(), EffectError> {
        let started = Instant::now();
        let call = async {
            match operation {
                Operation::Stop => self.executor.remove(claimed.id, &claimed.spec).await,
                _ => self.executor.apply(claimed.id, &claimed.spec).await,
            }
        };
        let effect = match timeout(self.settings.effect_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EffectError::unknown(format!(
                "{} did not complete within {:?}",
                self.executor.name(),
                self.settings.effect_timeout
            ))),
        };
        if let Some(metrics) = &self.metrics {
            let outcome = match &effect {
                Ok(()) => "ok",
                Err(err) => err.outcome.as_str(),
            };
            metrics.observe_effect(operation.as_str(), outcome, started.elapsed());
        }
        effect
    }

    /// Stop running experiments whose duration bound has elapsed since they
    /// entered `running`. Returns the records that were stopped.
    pub async fn stop_expired(&self, now: DateTime<Utc>) -> Result<Vec<Experiment>> {
        let running = self
            .list(ListFilter::with_state(ExperimentState::Running))
            .await?;
        let mut stopped = Vec::new();
        for experiment in running {
            let Some(bound) = experiment.spec.duration() else {
                continue;
            };
            let age = (now - experiment.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < bound {
                continue;
            }
            info!(
                experiment_id = %experiment.id,
                version = experiment.version,
                duration_sec = bound.as_secs(),
                "duration elapsed; stopping experiment"
            );
            match self.stop(experiment.id).await {
                Ok(record) => stopped.push(record),
                Err(err @ LifecycleError::Conflict { .. }) | Err(err @ LifecycleError::NotFound(_)) => {
                    info!(experiment_id = %experiment.id, error = %err, "expired experiment already moved on");
                }
                Err(err) => {
                    warn!(experiment_id = %experiment.id, error = %err, "failed to stop expired experiment");
                }
            }
        }
        Ok(stopped)
    }

    /// Move experiments stuck in `starting`/`stopping` for longer than
    /// `older_than` to `failed`, flagging the effect state as unknown.
    pub async fn recover_stale(&self, older_than: Duration) -> Result<Vec<Experiment>> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        for state in [ExperimentState::Starting, ExperimentState::Stopping] {
            for experiment in self.list(ListFilter::with_state(state)).await? {
                let age = (now - experiment.updated_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age < older_than {
                    continue;
                }
                let last_error = LastError::new(
                    Operation::Recover,
                    format!(
                        "transition abandoned while {} for {}s; fault may still be active",
                        experiment.state,
                        age.as_secs()
                    ),
                    true,
                );
                match self
                    .swap(
                        experiment.id,
                        experiment.version,
                        ExperimentState::Failed,
                        Some(last_error),
                        "recover",
                    )
                    .await
                {
                    Ok(record) => {
                        warn!(
                            experiment_id = %record.id,
                            version = record.version,
                            state = %record.state,
                            "recovered stale in-flight experiment"
                        );
                        recovered.push(record);
                    }
                    Err(StoreError::VersionConflict { .. }) | Err(StoreError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(recovered)
    }

    async fn swap(
        &self,
        id: Uuid,
        expected_version: u64,
        state: ExperimentState,
        last_error: Option<LastError>,
        operation: &'static str,
    ) -> std::result::Result<Experiment, StoreError> {
        let store = &self.store;
        self.with_retry(operation, move || {
            store.compare_and_swap(id, expected_version, state, last_error.clone())
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> std::result::Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let metrics = self.metrics.as_ref();
        self.settings
            .retry
            .run(operation, call, || {
                if let Some(metrics) = metrics {
                    metrics.inc_store_retry(operation);
                }
            })
            .await
    }
}
