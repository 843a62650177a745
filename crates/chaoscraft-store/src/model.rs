//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Experiment records, fault specifications, and lifecycle states."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest accepted experiment name.
pub const MAX_NAME_LEN: usize = 128;
/// Upper bound for the optional duration of an experiment (seven days).
pub const MAX_DURATION_SEC: u64 = 7 * 24 * 60 * 60;
/// Upper bound for injected network latency.
pub const MAX_LATENCY_MS: u64 = 60_000;
/// Signals a `process_kill` fault may deliver.
pub const ALLOWED_SIGNALS: &[&str] = &["SIGKILL", "SIGTERM", "SIGINT", "SIGSTOP"];

fn default_signal() -> String {
    "SIGKILL".to_owned()
}

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ExperimentState {
    pub const ALL: [ExperimentState; 6] = [
        ExperimentState::Pending,
        ExperimentState::Starting,
        ExperimentState::Running,
        ExperimentState::Stopping,
        ExperimentState::Stopped,
        ExperimentState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentState::Pending => "pending",
            ExperimentState::Starting => "starting",
            ExperimentState::Running => "running",
            ExperimentState::Stopping => "stopping",
            ExperimentState::Stopped => "stopped",
            ExperimentState::Failed => "failed",
        }
    }

    /// True while an injection or removal effect may be executing.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ExperimentState::Starting | ExperimentState::Stopping)
    }

    /// States from which a record may be removed.
    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            ExperimentState::Pending | ExperimentState::Stopped | ExperimentState::Failed
        )
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperimentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown experiment state: {}", s))
    }
}

/// Lifecycle operation that produced a [`LastError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    /// Reconciliation of a transition abandoned by a crashed writer.
    Recover,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Recover => "recover",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of the most recent failed transition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub operation: Operation,
    pub message: String,
    /// Set when the executor outcome is unknown and the fault may still be active.
    #[serde(default)]
    pub unknown_effect_state: bool,
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    pub fn new(operation: Operation, message: impl Into<String>, unknown_effect_state: bool) -> Self {
        Self {
            operation,
            message: message.into(),
            unknown_effect_state,
            occurred_at: Utc::now(),
        }
    }
}

/// Fault to inject, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
    NetworkLatency {
        latency_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
    PacketLoss {
        percentage: f64,
    },
    NetworkPartition {
        /// Peers cut off from the target; empty isolates it entirely.
        #[serde(default)]
        peers: Vec<String>,
    },
    ProcessKill {
        process: String,
        #[serde(default = "default_signal")]
        signal: String,
    },
    CpuStress {
        cores: u32,
        load_percent: u8,
    },
    MemoryStress {
        megabytes: u64,
    },
}

impl FaultKind {
    pub fn label(&self) -> &'static str {
        match self {
            FaultKind::NetworkLatency { .. } => "network_latency",
            FaultKind::PacketLoss { .. } => "packet_loss",
            FaultKind::NetworkPartition { .. } => "network_partition",
            FaultKind::ProcessKill { .. } => "process_kill",
            FaultKind::CpuStress { .. } => "cpu_stress",
            FaultKind::MemoryStress { .. } => "memory_stress",
        }
    }

    fn collect_problems(&self, problems: &mut Vec<String>) {
        match self {
            FaultKind::NetworkLatency {
                latency_ms,
                jitter_ms,
            } => {
                if *latency_ms == 0 || *latency_ms > MAX_LATENCY_MS {
                    problems.push(format!(
                        "fault.latency_ms must be between 1 and {}",
                        MAX_LATENCY_MS
                    ));
                }
                if jitter_ms > latency_ms {
                    problems.push("fault.jitter_ms must not exceed fault.latency_ms".to_owned());
                }
            }
            FaultKind::PacketLoss { percentage } => {
                if !(percentage.is_finite() && *percentage > 0.0 && *percentage <= 100.0) {
                    problems.push("fault.percentage must be within (0, 100]".to_owned());
                }
            }
            FaultKind::NetworkPartition { peers } => {
                if peers.iter().any(|peer| peer.trim().is_empty()) {
                    problems.push("fault.peers must not contain empty entries".to_owned());
                }
            }
            FaultKind::ProcessKill { process, signal } => {
                if process.trim().is_empty() {
                    problems.push("fault.process must not be empty".to_owned());
                }
                if !ALLOWED_SIGNALS.contains(&signal.as_str()) {
                    problems.push(format!(
                        "fault.signal must be one of {}",
                        ALLOWED_SIGNALS.join(", ")
                    ));
                }
            }
            FaultKind::CpuStress {
                cores,
                load_percent,
            } => {
                if *cores == 0 {
                    problems.push("fault.cores must be at least 1".to_owned());
                }
                if *load_percent == 0 || *load_percent > 100 {
                    problems.push("fault.load_percent must be between 1 and 100".to_owned());
                }
            }
            FaultKind::MemoryStress { megabytes } => {
                if *megabytes == 0 {
                    problems.push("fault.megabytes must be at least 1".to_owned());
                }
            }
        }
    }
}

/// Selects the workload the fault is applied to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
}

/// Immutable description of the fault an experiment injects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub fault: FaultKind,
    pub target: TargetSelector,
    /// Optional bound after which a running experiment is stopped automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u64>,
}

impl ExperimentSpec {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_sec.map(Duration::from_secs)
    }

    /// Every problem found in the spec; empty when the spec is well formed.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let name = self.name.trim();
        if name.is_empty() {
            problems.push("name must not be empty".to_owned());
        } else if name.chars().count() > MAX_NAME_LEN {
            problems.push(format!("name must be at most {} characters", MAX_NAME_LEN));
        }

        self.fault.collect_problems(&mut problems);

        let target = &self.target;
        if target.labels.is_empty() && target.instances.is_empty() {
            problems.push("target must select at least one label or instance".to_owned());
        }
        if target
            .labels
            .iter()
            .any(|(key, value)| key.trim().is_empty() || value.trim().is_empty())
        {
            problems.push("target.labels must not contain empty keys or values".to_owned());
        }
        if target.instances.iter().any(|instance| instance.trim().is_empty()) {
            problems.push("target.instances must not contain empty entries".to_owned());
        }

        if let Some(duration) = self.duration_sec {
            if duration == 0 || duration > MAX_DURATION_SEC {
                problems.push(format!(
                    "duration_sec must be between 1 and {}",
                    MAX_DURATION_SEC
                ));
            }
        }
        problems
    }
}

/// Durable experiment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub spec: ExperimentSpec,
    pub state: ExperimentState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Experiment {
    /// Build the initial `pending` record for a freshly allocated id.
    pub fn pending(id: Uuid, spec: ExperimentSpec, idempotency_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            state: ExperimentState::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
            last_error: None,
            idempotency_key,
        }
    }
}

/// Input to [`crate::ExperimentStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewExperiment {
    pub spec: ExperimentSpec,
    pub idempotency_key: Option<String>,
}

impl NewExperiment {
    pub fn new(spec: ExperimentSpec) -> Self {
        Self {
            spec,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Filter accepted by [`crate::ExperimentStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub state: Option<ExperimentState>,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn with_state(state: ExperimentState) -> Self {
        Self {
            state: Some(state),
            limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn latency_spec() -> ExperimentSpec {
        serde_json::from_value(json!({
            "name": "checkout latency",
            "fault": {"type": "network_latency", "latency_ms": 250, "jitter_ms": 50},
            "target": {"namespace": "shop", "labels": {"app": "checkout"}},
            "duration_sec": 300
        }))
        .unwrap()
    }

    #[test]
    fn well_formed_spec_has_no_problems() {
        assert!(latency_spec().validation_errors().is_empty());
        assert_eq!(latency_spec().duration(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn process_kill_defaults_signal() {
        let fault: FaultKind =
            serde_json::from_value(json!({"type": "process_kill", "process": "nginx"})).unwrap();
        assert_eq!(
            fault,
            FaultKind::ProcessKill {
                process: "nginx".into(),
                signal: "SIGKILL".into(),
            }
        );
    }

    #[test]
    fn validation_reports_every_problem() {
        let spec = ExperimentSpec {
            name: "   ".into(),
            description: None,
            fault: FaultKind::PacketLoss { percentage: 140.0 },
            target: TargetSelector::default(),
            duration_sec: Some(0),
        };
        let problems = spec.validation_errors();
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.starts_with("name")));
        assert!(problems.iter().any(|p| p.contains("percentage")));
        assert!(problems.iter().any(|p| p.starts_with("target")));
        assert!(problems.iter().any(|p| p.starts_with("duration_sec")));
    }

    #[test]
    fn unknown_signal_rejected() {
        let mut spec = latency_spec();
        spec.fault = FaultKind::ProcessKill {
            process: "redis-server".into(),
            signal: "SIGHUP".into(),
        };
        let problems = spec.validation_errors();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("SIGKILL"));
    }

    #[test]
    fn state_helpers_match_lifecycle_table() {
        use ExperimentState::*;
        let in_flight: Vec<_> = ExperimentState::ALL
            .into_iter()
            .filter(ExperimentState::is_in_flight)
            .collect();
        assert_eq!(in_flight, vec![Starting, Stopping]);

        let deletable: Vec<_> = ExperimentState::ALL
            .into_iter()
            .filter(ExperimentState::is_deletable)
            .collect();
        assert_eq!(deletable, vec![Pending, Stopped, Failed]);
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("Running".parse::<ExperimentState>(), Ok(ExperimentState::Running));
        assert!("paused".parse::<ExperimentState>().is_err());
    }

    #[test]
    fn record_serialises_state_in_lowercase() {
        let record = Experiment::pending(Uuid::new_v4(), latency_spec(), Some("k-1".into()));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["state"], json!("pending"));
        assert_eq!(value["version"], json!(1));
        assert_eq!(value["idempotency_key"], json!("k-1"));
        assert!(value.get("last_error").is_none());
    }
}
