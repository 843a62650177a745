//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Injection executor boundary and its dry-run, HTTP and scripted implementations."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
//! The executor is the only place a fault physically touches a target. It is
//! invoked at most once per transition attempt and never while a store
//! transaction is open.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chaoscraft_store::ExperimentSpec;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EffectError;

/// Direction of an executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectAction {
    Apply,
    Remove,
}

impl EffectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectAction::Apply => "apply",
            EffectAction::Remove => "remove",
        }
    }
}

/// Applies and removes faults on target workloads.
#[async_trait]
pub trait InjectionExecutor: Send + Sync + 'static {
    async fn apply(&self, id: Uuid, spec: &ExperimentSpec) -> Result<(), EffectError>;

    async fn remove(&self, id: Uuid, spec: &ExperimentSpec) -> Result<(), EffectError>;

    fn name(&self) -> &'static str;
}

/// Executor that only logs; used for local development.
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

#[async_trait]
impl InjectionExecutor for DryRunExecutor {
    async fn apply(&self, id: Uuid, spec: &ExperimentSpec) -> Result<(), EffectError> {
        info!(
            experiment_id = %id,
            fault = spec.fault.label(),
            namespace = spec.target.namespace.as_deref().unwrap_or("-"),
            instances = spec.target.instances.len(),
            "dry-run: fault applied"
        );
        Ok(())
    }

    async fn remove(&self, id: Uuid, spec: &ExperimentSpec) -> Result<(), EffectError> {
        info!(
            experiment_id = %id,
            fault = spec.fault.label(),
            "dry-run: fault removed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

#[derive(Serialize)]
struct EffectRequest<'a> {
    experiment_id: Uuid,
    action: EffectAction,
    spec: &'a ExperimentSpec,
}

const MAX_ERROR_BODY: usize = 512;

/// Executor delegating to a remote injection agent over HTTP.
///
/// `POST {endpoint}/faults/{id}/apply|remove` with the experiment spec as JSON.
/// 2xx succeeds, 4xx is a definite failure, 5xx and read timeouts leave the
/// effect unknown, and connection failures mean the request never arrived.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .context("failed to build injection agent http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(
        &self,
        action: EffectAction,
        id: Uuid,
        spec: &ExperimentSpec,
    ) -> Result<(), EffectError> {
        let url = format!("{}/faults/{}/{}", self.endpoint, id, action.as_str());
        let mut request = self.client.post(&url).json(&EffectRequest {
            experiment_id: id,
            action,
            spec,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| classify_transport(&url, err))?;
        let status = response.status();
        if status.is_success() {
            debug!(experiment_id = %id, action = action.as_str(), %status, "injection agent accepted");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        let message = format!("injection agent returned {} for {}: {}", status, url, body.trim());
        warn!(experiment_id = %id, action = action.as_str(), %status, "injection agent rejected request");
        if status.is_client_error() {
            Err(EffectError::failed(message))
        } else {
            Err(EffectError::unknown(message))
        }
    }
}

fn classify_transport(url: &str, err: reqwest::Error) -> EffectError {
    if err.is_connect() {
        EffectError::failed(format!("injection agent unreachable at {}: {}", url, err))
    } else if err.is_timeout() {
        EffectError::unknown(format!("injection agent timed out at {}: {}", url, err))
    } else {
        EffectError::unknown(format!("injection agent request to {} failed: {}", url, err))
    }
}

#[async_trait]
impl InjectionExecutor for HttpExecutor {
    async fn apply(&self, id: Uuid, spec: &ExperimentSpec) -> Result<(), EffectError> {
        self.call(EffectAction::Apply, id, spec).await
    }

    async fn remove(&self, id: Uuid, spec: &ExperimentSpec) -> Result<(), EffectError> {
        self.call(EffectAction::Remove, id, spec).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// One recorded invocation of a [`ScriptedExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorCall {
    pub action: EffectAction,
    pub experiment_id: Uuid,
}

/// Executor replaying queued outcomes, for tests and demos.
///
/// Calls without a queued outcome succeed. An optional gate holds every call
/// until [`ScriptedExecutor::open_gate`] is invoked.
#[derive(Debug)]
pub struct ScriptedExecutor {
    apply_script: Mutex<VecDeque<Result<(), EffectError>>>,
    remove_script: Mutex<VecDeque<Result<(), EffectError>>>,
    calls: Mutex<Vec<ExecutorCall>>,
    call_count: watch::Sender<usize>,
    gate: Option<watch::Sender<bool>>,
    delay: Option<Duration>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            apply_script: Mutex::new(VecDeque::new()),
            remove_script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            call_count: watch::channel(0).0,
            gate: None,
            delay: None,
        }
    }

    /// Hold every call until the gate is opened.
    pub fn gated(mut self) -> Self {
        self.gate = Some(watch::channel(false).0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script_apply(&self, outcome: Result<(), EffectError>) {
        self.apply_script.lock().push_back(outcome);
    }

    pub fn script_remove(&self, outcome: Result<(), EffectError>) {
        self.remove_script.lock().push_back(outcome);
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.send_replace(true);
        }
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, action: EffectAction) -> usize {
        self.calls.lock().iter().filter(|c| c.action == action).count()
    }

    /// Resolve once at least `n` calls have been entered.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    async fn invoke(&self, action: EffectAction, id: Uuid) -> Result<(), EffectError> {
        self.calls.lock().push(ExecutorCall {
            action,
            experiment_id: id,
        });
        self.call_count.send_modify(|count| *count += 1);

        if let Some(gate) = &self.gate {
            let mut rx = gate.subscribe();
            let _ = rx.wait_for(|open| *open).await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let script = match action {
            EffectAction::Apply => &self.apply_script,
            EffectAction::Remove => &self.remove_script,
        };
        let outcome = script.lock().pop_front();
        outcome.unwrap_or(Ok(()))
    }
}

#[async_trait]
impl InjectionExecutor for ScriptedExecutor {
    async fn apply(&self, id: Uuid, _spec: &ExperimentSpec) -> Result<(), EffectError> {
        self.invoke(EffectAction::Apply, id).await
    }

    async fn remove(&self, id: Uuid, _spec: &ExperimentSpec) -> Result<(), EffectError> {
        self.invoke(EffectAction::Remove, id).await
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
