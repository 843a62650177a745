//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Shared primitives and utilities for the control plane."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
//! Shared primitives for the ChaosCraft control plane workspace.
//! This crate exposes configuration loading, tracing setup, and version
//! metadata consumed by the daemon and the API surface.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    ApiConfig, AppConfig, Environment, ExecutorConfig, ExecutorKind, LifecycleConfig,
    LoadedAppConfig, LoggingConfig, MetricsConfig, StoreConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use version::{VersionInfo, SERVICE_NAME};
