//! Adapter runtime: the uniform driver interface plus the registry that maps
//! configured instances onto concrete drivers.

pub mod aix;
pub mod bird;
pub mod eve;
pub mod gogcli;
pub mod gogcli_calendar;
pub mod gogcli_contacts;

use crate::config::{AdapterInstance, Config};
use crate::error::{ConfigError, Result, SyncError};
use crate::store::Store;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Adapter type tags the registry knows how to build.
pub const KNOWN_TYPES: [&str; 6] = [
    "eve",
    "gogcli",
    "gogcli_calendar",
    "gogcli_contacts",
    "aix",
    "bird",
];

/// Prerequisite check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Readiness {
    Ready,
    Missing { what: String, remediation: String },
}

/// Counts and telemetry one adapter run reports back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterResult {
    pub events_created: u64,
    pub events_updated: u64,
    pub persons_created: u64,
    pub threads: u64,
    pub attachments: u64,
    pub reactions: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub perf: BTreeMap<String, serde_json::Value>,
    /// Opaque resume cursor to persist for the next incremental run.
    pub cursor: Option<String>,
}

/// Everything a driver needs for one run: the store, the resume cursor, a
/// cancellation token, and a progress reporter bound to its job row.
pub struct SyncContext {
    pub store: Store,
    pub cursor: Option<String>,
    pub cancel: CancellationToken,
    adapter_name: String,
    lease_ttl_secs: u64,
}

impl SyncContext {
    pub fn new(
        store: Store,
        adapter_name: &str,
        cursor: Option<String>,
        cancel: CancellationToken,
        lease_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            cursor,
            cancel,
            adapter_name: adapter_name.to_string(),
            lease_ttl_secs,
        }
    }

    /// Advance the run's phase and progress map on the sync job row.
    pub async fn report(&self, phase: &str, progress: serde_json::Value) -> Result<()> {
        self.store
            .update_sync_progress(&self.adapter_name, phase, &progress, self.lease_ttl_secs)
            .await
    }

    /// Bail out if the run was cancelled. Drivers call this at every I/O
    /// boundary.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// The uniform driver interface. Drivers MUST be re-entrant: re-running
/// against unchanged inputs produces the same terminal state.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Configured instance name.
    fn name(&self) -> &str;

    /// Adapter type tag.
    fn kind(&self) -> &'static str;

    /// Check external preconditions (binaries, files, credentials).
    async fn prerequisites(&self) -> Readiness;

    /// Pull from the external source into the store. `full` re-reads from
    /// channel origin; otherwise the context's cursor bounds the fetch.
    async fn sync(&self, ctx: &SyncContext, full: bool) -> Result<AdapterResult>;
}

/// Build the driver for one configured instance.
pub fn build(name: &str, instance: &AdapterInstance, config: &Config) -> Result<Arc<dyn Adapter>> {
    let adapter: Arc<dyn Adapter> = match instance.kind.as_str() {
        "eve" => Arc::new(eve::EveAdapter::new(name, &instance.options)),
        "gogcli" => Arc::new(gogcli::GogcliAdapter::new(name, &instance.options)?),
        "gogcli_calendar" => {
            Arc::new(gogcli_calendar::GogcliCalendarAdapter::new(name, &instance.options)?)
        }
        "gogcli_contacts" => {
            Arc::new(gogcli_contacts::GogcliContactsAdapter::new(name, &instance.options)?)
        }
        "aix" => Arc::new(aix::AixAdapter::new(name, &instance.options)?),
        "bird" => Arc::new(bird::BirdAdapter::new(name, &config.data_dir)),
        other => return Err(ConfigError::UnknownAdapter(other.to_string()).into()),
    };
    Ok(adapter)
}

/// Build drivers for every enabled instance, in stable name order.
pub fn build_enabled(config: &Config) -> Result<Vec<Arc<dyn Adapter>>> {
    config
        .enabled_adapters()
        .map(|(name, instance)| build(name, instance, config))
        .collect()
}
