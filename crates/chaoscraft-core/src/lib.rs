//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Experiment lifecycle engine and injection executor boundary."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
//! Lifecycle orchestration for chaos experiments.
//!
//! [`LifecycleEngine`] is the only writer of experiment state. It serialises
//! transitions per experiment through the store's compare-and-swap and calls
//! an [`InjectionExecutor`] at most once per accepted transition.

pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod metrics;
pub mod retry;
pub mod sweeper;

pub use error::{ConflictReason, EffectError, EffectOutcome, ErrorKind, LifecycleError, Result};
pub use executor::{
    DryRunExecutor, EffectAction, ExecutorCall, HttpExecutor, InjectionExecutor, ScriptedExecutor,
};
pub use lifecycle::{CreateOutcome, EngineSettings, LifecycleEngine};
pub use metrics::{LifecycleMetrics, TransitionOutcome};
pub use retry::RetryPolicy;
pub use sweeper::{MaintenanceSweeper, SweepReport};
