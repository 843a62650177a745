//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Prometheus instrumentation for lifecycle transitions and store retries."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use chaoscraft_metrics::prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};
use chaoscraft_metrics::SharedRegistry;

/// Outcome label attached to `chaoscraft_transitions_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Succeeded,
    EffectFailed,
    Rejected,
    StoreError,
    Inconsistent,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Succeeded => "succeeded",
            TransitionOutcome::EffectFailed => "effect_failed",
            TransitionOutcome::Rejected => "rejected",
            TransitionOutcome::StoreError => "store_error",
            TransitionOutcome::Inconsistent => "inconsistent",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleMetrics {
    transitions_total: IntCounterVec,
    effect_duration: HistogramVec,
    store_retries_total: IntCounterVec,
    inconsistencies_total: IntCounter,
}

impl LifecycleMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "chaoscraft_transitions_total",
                "Lifecycle transitions attempted, by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let effect_duration = HistogramVec::new(
            HistogramOpts::new(
                "chaoscraft_effect_duration_seconds",
                "Time spent inside the injection executor",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(effect_duration.clone()))?;

        let store_retries_total = IntCounterVec::new(
            Opts::new(
                "chaoscraft_store_retries_total",
                "Store calls repeated after a transient error",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(store_retries_total.clone()))?;

        let inconsistencies_total = IntCounter::with_opts(Opts::new(
            "chaoscraft_inconsistencies_total",
            "Effects whose outcome could not be recorded in the store",
        ))?;
        registry.register(Box::new(inconsistencies_total.clone()))?;

        Ok(Self {
            transitions_total,
            effect_duration,
            store_retries_total,
            inconsistencies_total,
        })
    }

    pub fn record_transition(&self, operation: &str, outcome: TransitionOutcome) {
        self.transitions_total
            .with_label_values(&[operation, outcome.as_str()])
            .inc();
    }

    pub fn observe_effect(&self, operation: &str, outcome: &str, elapsed: Duration) {
        self.effect_duration
            .with_label_values(&[operation, outcome])
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_store_retry(&self, operation: &str) {
        self.store_retries_total.with_label_values(&[operation]).inc();
    }

    pub fn inc_inconsistency(&self) {
        self.inconsistencies_total.inc();
    }
}
