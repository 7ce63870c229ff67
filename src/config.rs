//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Commsmap configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory (database, logs).
    pub data_dir: PathBuf,

    /// Adapter instances keyed by instance name.
    pub adapters: BTreeMap<String, AdapterInstance>,

    /// Compute engine settings.
    pub compute: ComputeConfig,

    /// Webhook receiver settings.
    pub webhook: WebhookConfig,

    /// LLM provider settings.
    pub llm: LlmConfig,
}

/// One configured adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInstance {
    /// Adapter type tag (`eve`, `gogcli`, `gogcli_calendar`, `gogcli_contacts`,
    /// `aix`, `bird`).
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub options: AdapterOptions,
}

/// Per-type adapter options. Unknown keys are preserved in `extra` so that a
/// newer binary never drops what an older one wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// Account identifier (`gogcli` family).
    pub account: Option<String>,

    /// Fetch worker count (`gogcli`).
    pub workers: Option<usize>,

    /// Queries per second against the external service (`gogcli`).
    pub qps: Option<u32>,

    /// Source directory or file (`aix`).
    pub source: Option<PathBuf>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Compute engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Worker pool size per flow.
    pub workers: usize,

    /// Embedding batch size ceiling.
    pub batch_size: usize,

    /// Batch writer flush size.
    pub write_batch: usize,

    /// Batch writer flush interval in milliseconds.
    pub flush_interval_ms: u64,

    /// Job attempts before a job goes dead.
    pub max_attempts: u32,

    /// Lease TTL in seconds.
    pub lease_ttl_secs: u64,

    /// Per-API-call timeout in seconds.
    pub api_timeout_secs: u64,

    /// Pin rate and concurrency to fixed limits instead of adapting.
    pub disable_adaptive: bool,

    /// Hard ceiling for effective RPM, regardless of recovery growth.
    pub rpm_ceiling: u32,

    /// Initial requests-per-minute per model. Falls back to `default_rpm`.
    pub model_rpm: BTreeMap<String, u32>,

    /// Initial RPM for models without a tier entry.
    pub default_rpm: u32,

    /// Pre-load conversations for pending analysis jobs before workers start.
    pub preload: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            write_batch: 32,
            flush_interval_ms: 500,
            max_attempts: 3,
            lease_ttl_secs: 300,
            api_timeout_secs: 60,
            disable_adaptive: false,
            rpm_ceiling: 600,
            model_rpm: BTreeMap::new(),
            default_rpm: 60,
            preload: false,
        }
    }
}

/// Webhook receiver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    pub path: String,

    /// Bearer token; `None` disables auth.
    pub token: Option<String>,

    /// Minimum seconds between triggered syncs per adapter.
    pub debounce_seconds: u64,

    /// Pin the trigger to one adapter instance. When unset, every enabled
    /// adapter of the matching type is triggered.
    pub adapter: Option<String>,

    /// Adapter type to select when no pin is set.
    pub adapter_type: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            path: "/hooks/sync".to_string(),
            token: None,
            debounce_seconds: 60,
            adapter: None,
            adapter_type: None,
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Completion endpoint base URL (Anthropic-style messages API).
    pub completion_base_url: String,

    /// Embedding endpoint base URL (OpenAI-style embeddings API).
    pub embedding_base_url: String,

    /// API key. `COMMSMAP_API_KEY` overrides the file value.
    pub api_key: Option<String>,

    /// Default completion model for seeded analysis types.
    pub completion_model: String,

    /// Default embedding model.
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            completion_base_url: "https://api.anthropic.com".to_string(),
            embedding_base_url: "https://api.openai.com".to_string(),
            api_key: None,
            completion_model: "claude-3-5-haiku-latest".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// On-disk layout of `config.toml`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    adapters: BTreeMap<String, AdapterInstance>,
    #[serde(default)]
    compute: ComputeConfig,
    #[serde(default)]
    webhook: WebhookConfig,
    #[serde(default)]
    llm: LlmConfig,
}

impl Config {
    /// Load configuration from the default locations.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        Self::load_from_path(&config_path)
    }

    /// Load from a specific config file path. A missing file yields the
    /// defaults with an empty adapter set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
                path: path.display().to_string(),
                reason: error.to_string(),
            })?;
            toml::from_str::<ConfigFile>(&raw).map_err(|error| ConfigError::Load {
                path: path.display().to_string(),
                reason: error.to_string(),
            })?
        } else {
            ConfigFile::default()
        };

        let data_dir = Self::default_data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let mut llm = file.llm;
        if let Ok(key) = std::env::var("COMMSMAP_API_KEY") {
            llm.api_key = Some(key);
        }

        let config = Self {
            data_dir,
            adapters: file.adapters,
            compute: file.compute,
            webhook: file.webhook,
            llm,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, instance) in &self.adapters {
            if !crate::adapter::KNOWN_TYPES.contains(&instance.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "adapter {name} has unknown type {}",
                    instance.kind
                ))
                .into());
            }
            if instance.kind.starts_with("gogcli") && instance.options.account.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "adapter {name} ({}) requires options.account",
                    instance.kind
                ))
                .into());
            }
        }
        if self.compute.workers == 0 {
            return Err(ConfigError::Invalid("compute.workers must be at least 1".into()).into());
        }
        if self.compute.batch_size == 0 {
            return Err(ConfigError::Invalid("compute.batch_size must be at least 1".into()).into());
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("commsmap"))
            .unwrap_or_else(|| PathBuf::from("./config"))
            .join("config.toml")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("commsmap"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Path of the event store database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("comms.db")
    }

    /// Directory holding the rotating sync log.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Enabled adapter instances, in stable name order.
    pub fn enabled_adapters(&self) -> impl Iterator<Item = (&String, &AdapterInstance)> {
        self.adapters.iter().filter(|(_, a)| a.enabled)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_adapter_map_and_preserves_unknown_option_keys() {
        let raw = indoc! {r#"
            [adapters."gmail-a@x.com"]
            type = "gogcli"
            enabled = true
            options = { account = "a@x.com", workers = 4, qps = 5, shard = "b" }

            [adapters.imessage]
            type = "eve"

            [compute]
            workers = 8

            [webhook]
            port = 9090
            token = "s3cret"
        "#};

        let file: ConfigFile = toml::from_str(raw).expect("config should parse");
        assert_eq!(file.adapters.len(), 2);

        let gmail = &file.adapters["gmail-a@x.com"];
        assert_eq!(gmail.kind, "gogcli");
        assert_eq!(gmail.options.account.as_deref(), Some("a@x.com"));
        assert_eq!(gmail.options.workers, Some(4));
        assert_eq!(
            gmail.options.extra.get("shard").and_then(|v| v.as_str()),
            Some("b")
        );

        let imessage = &file.adapters["imessage"];
        assert!(imessage.enabled, "enabled should default to true");
        assert_eq!(imessage.kind, "eve");

        assert_eq!(file.compute.workers, 8);
        assert_eq!(file.compute.batch_size, 100);
        assert_eq!(file.webhook.port, 9090);
        assert_eq!(file.webhook.token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn unknown_adapter_type_is_rejected() {
        let mut adapters = BTreeMap::new();
        adapters.insert(
            "mystery".to_string(),
            AdapterInstance {
                kind: "carrier_pigeon".to_string(),
                enabled: true,
                options: AdapterOptions::default(),
            },
        );
        let config = Config {
            data_dir: std::env::temp_dir(),
            adapters,
            compute: ComputeConfig::default(),
            webhook: WebhookConfig::default(),
            llm: LlmConfig::default(),
        };

        assert!(config.validate().is_err());
    }
}
