//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Shared primitives and utilities for the control plane."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use serde::Serialize;

/// Service name reported by health, readiness and version endpoints.
pub const SERVICE_NAME: &str = "chaoscraft-control-plane";

/// Build metadata for the running binary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub service: String,
    pub semver: String,
    pub profile: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            service: SERVICE_NAME.to_owned(),
            semver: env!("CARGO_PKG_VERSION").to_owned(),
            profile: if cfg!(debug_assertions) {
                "debug".to_owned()
            } else {
                "release".to_owned()
            },
        }
    }

    /// Short form used in CLI output and logs.
    pub fn cli_string(&self) -> String {
        format!("{} {}", self.service, self.semver)
    }

    pub fn extended(&self) -> String {
        format!("{} {} ({})", self.service, self.semver, self.profile)
    }
}
