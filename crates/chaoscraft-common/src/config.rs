//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Shared primitives and utilities for the control plane."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_store_url() -> String {
    "sqlite://chaoscraft.db".to_owned()
}

fn default_auto_migrate() -> bool {
    true
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_effect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(25)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "CHAOSCRAFT_CONFIG";

    /// Load configuration from disk, respecting the `CHAOSCRAFT_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Environment overrides (`DATABASE_URL`, `PORT`, `LOG_LEVEL`, `ENVIRONMENT`,
    /// `CHAOSCRAFT_EXECUTOR_TOKEN`) are applied after the file is parsed and before
    /// validation, so a deployment can run with no file at all.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let source = match std::env::var(Self::ENV_CONFIG_PATH) {
            Ok(env_path) if !env_path.trim().is_empty() => Some(PathBuf::from(env_path)),
            _ => candidates
                .iter()
                .map(|candidate| candidate.as_ref())
                .find(|candidate| candidate.exists())
                .map(Path::to_path_buf),
        };

        let mut config = match &source {
            Some(path) => Self::parse_file(path)?,
            None => {
                debug!("no configuration file found; using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(LoadedAppConfig { config, source })
    }

    fn parse_file(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply the conventional container environment variables on top of the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup("DATABASE_URL") {
            self.store.url = url;
        }
        if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
            self.api.listen.set_port(port);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(environment) = lookup("ENVIRONMENT").and_then(|value| value.parse().ok()) {
            self.environment = environment;
        }
        if let Some(token) = lookup("CHAOSCRAFT_EXECUTOR_TOKEN") {
            self.executor.token = Some(token);
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.trim().is_empty() {
            return Err(anyhow!("store url must not be empty"));
        }
        self.executor.validate()?;
        if self.executor.effect_timeout >= self.api.request_timeout {
            return Err(anyhow!(
                "executor effect_timeout ({}s) must be shorter than api request_timeout ({}s)",
                self.executor.effect_timeout.as_secs_f64(),
                self.api.request_timeout.as_secs_f64()
            ));
        }
        self.lifecycle.validate(self.executor.effect_timeout)?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Deployment environment, mirrored from the `ENVIRONMENT` variable.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite://<path>`, `sqlite::memory:` or `memory://`.
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_auto_migrate")]
    pub auto_migrate: bool,
    #[serde(default = "default_busy_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            auto_migrate: default_auto_migrate(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    #[default]
    DryRun,
    Http,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub kind: ExecutorKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_effect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub effect_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            endpoint: None,
            token: None,
            effect_timeout: default_effect_timeout(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.effect_timeout.is_zero() {
            return Err(anyhow!("executor effect_timeout must be greater than zero"));
        }
        if self.kind == ExecutorKind::Http {
            let endpoint = self.endpoint.as_deref().map(str::trim).unwrap_or_default();
            if endpoint.is_empty() {
                return Err(anyhow!("http executor requires an endpoint"));
            }
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(anyhow!(
                    "executor endpoint '{}' must be an http(s) url",
                    endpoint
                ));
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_base_delay: Duration,
    #[serde(default = "default_retry_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_jitter: Duration,
    #[serde(default = "default_sweep_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,
    /// Experiments stuck in `starting`/`stopping` longer than this are failed by the sweeper.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub recover_stale_after: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay: default_retry_base_delay(),
            retry_jitter: default_retry_jitter(),
            sweep_interval: default_sweep_interval(),
            recover_stale_after: None,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self, effect_timeout: Duration) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(anyhow!("lifecycle retry_attempts must be at least 1"));
        }
        if self.sweep_interval.is_zero() {
            return Err(anyhow!("lifecycle sweep_interval must be greater than zero"));
        }
        if let Some(stale) = self.recover_stale_after {
            if stale <= effect_timeout {
                return Err(anyhow!(
                    "lifecycle recover_stale_after ({}s) must exceed the executor effect_timeout ({}s)",
                    stale.as_secs_f64(),
                    effect_timeout.as_secs_f64()
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// When set, a daily rolling JSON log file is written here as well.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
