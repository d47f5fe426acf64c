use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct GatewayConfig {
    /// Root URL of the gateway API, e.g. <https://agave.example.org>
    #[serde(default)]
    pub base_url: Option<String>,
    /// Storage system id used in file URLs.
    #[serde(default = "default_storage_system")]
    pub storage_system: String,
    /// OAuth client name registered while authenticating.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_token_scope")]
    pub token_scope: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Initial working directory.
    #[serde(default = "default_home_dir")]
    pub home_dir: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            storage_system: default_storage_system(),
            client_name: default_client_name(),
            token_scope: default_token_scope(),
            request_timeout_ms: default_request_timeout_ms(),
            home_dir: default_home_dir(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TaskConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Job input that receives the remote working directory.
    #[serde(default = "default_job_input_name")]
    pub job_input_name: String,
    /// Ask the gateway to archive job outputs.
    #[serde(default = "default_archive")]
    pub archive: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            job_input_name: default_job_input_name(),
            archive: default_archive(),
        }
    }
}

impl TaskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

fn default_storage_system() -> String {
    "data-storage".to_string()
}
fn default_client_name() -> String {
    "sgw".to_string()
}
fn default_token_scope() -> String {
    "PRODUCTION".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_home_dir() -> String {
    "/".to_string()
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_job_input_name() -> String {
    "inputDirectory".to_string()
}
fn default_archive() -> bool {
    true
}

pub const ENV_BASE_URL: &str = "SGW_BASE_URL";
pub const ENV_STORAGE_SYSTEM: &str = "SGW_STORAGE_SYSTEM";
pub const ENV_CLIENT_NAME: &str = "SGW_CLIENT_NAME";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "SGW_REQUEST_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "SGW_POLL_INTERVAL_MS";

impl Config {
    /// Overlays `SGW_*` environment variables. Unparsable numbers are
    /// reported rather than silently ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty(ENV_BASE_URL) {
            self.gateway.base_url = Some(url);
        }
        if let Some(system) = env_nonempty(ENV_STORAGE_SYSTEM) {
            self.gateway.storage_system = system;
        }
        if let Some(name) = env_nonempty(ENV_CLIENT_NAME) {
            self.gateway.client_name = name;
        }
        if let Some(ms) = env_nonempty(ENV_REQUEST_TIMEOUT_MS) {
            self.gateway.request_timeout_ms = ms
                .parse()
                .with_context(|| format!("{ENV_REQUEST_TIMEOUT_MS}={ms:?} is not a number"))?;
        }
        if let Some(ms) = env_nonempty(ENV_POLL_INTERVAL_MS) {
            self.tasks.poll_interval_ms = ms
                .parse()
                .with_context(|| format!("{ENV_POLL_INTERVAL_MS}={ms:?} is not a number"))?;
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

/// Parses and validates a TOML document. Every schema violation is reported
/// in one message.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content).context("config is not valid TOML")?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

/// Reads `path`, validates it, then applies environment overrides.
pub fn load_config(path: &str) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
    let mut cfg = parse_config(&content).with_context(|| format!("loading config {path}"))?;
    cfg.apply_env_overrides()?;
    Ok(cfg)
}
