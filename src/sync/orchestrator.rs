//! The sync orchestrator: runs selected adapters sequentially, tracks their
//! job rows, and publishes `sync.completed` per adapter. A single adapter
//! failure never aborts the batch.

use crate::adapter::{self, Adapter, Readiness, SyncContext};
use crate::bus;
use crate::config::Config;
use crate::error::{ConfigError, Result, SyncError};
use crate::store::sync_jobs::SyncJob;
use crate::store::Store;
use crate::sync::{AdapterRunReport, Selector, SyncResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Lease TTL for sync job rows; renewed on every progress report.
const SYNC_LEASE_TTL_SECS: u64 = 600;

pub struct Orchestrator {
    store: Store,
    config: Config,
    /// Per-adapter in-process serialization, alongside the DB-level guard.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(store: Store, config: Config) -> Self {
        Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_for(&self, adapter: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(adapter.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn select(&self, selector: &Selector) -> Result<Vec<Arc<dyn Adapter>>> {
        match selector {
            Selector::All => adapter::build_enabled(&self.config),
            Selector::One(name) => {
                let instance = self
                    .config
                    .adapters
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownAdapter(name.clone()))?;
                if !instance.enabled {
                    return Ok(Vec::new());
                }
                Ok(vec![adapter::build(name, instance, &self.config)?])
            }
        }
    }

    /// Run the selected adapters sequentially. Returns the aggregate result;
    /// per-adapter failures are reported, not raised.
    pub async fn run(
        &self,
        selector: &Selector,
        full: bool,
        cancel: CancellationToken,
    ) -> Result<SyncResult> {
        let adapters = self.select(selector)?;
        if adapters.is_empty() {
            return Ok(SyncResult::empty());
        }

        let mut reports = Vec::with_capacity(adapters.len());
        for driver in adapters {
            if cancel.is_cancelled() {
                reports.push(AdapterRunReport {
                    adapter: driver.name().to_string(),
                    ok: false,
                    result: None,
                    error: Some(SyncError::Cancelled.to_string()),
                });
                continue;
            }
            reports.push(self.run_one(driver.as_ref(), full, cancel.clone()).await);
        }

        Ok(SyncResult {
            ok: reports.iter().all(|r| r.ok),
            adapters: reports,
        })
    }

    async fn run_one(
        &self,
        driver: &dyn Adapter,
        full: bool,
        cancel: CancellationToken,
    ) -> AdapterRunReport {
        let name = driver.name().to_string();

        // In-process mutex first; the DB claim below guards cross-process.
        let lock = self.lock_for(&name);
        let Ok(_guard) = lock.try_lock() else {
            return AdapterRunReport {
                adapter: name.clone(),
                ok: false,
                result: None,
                error: Some(SyncError::Busy(name).to_string()),
            };
        };

        match self.run_locked(driver, &name, full, cancel).await {
            Ok(result) => AdapterRunReport {
                adapter: name,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(error) => {
                tracing::warn!(adapter = %name, %error, "adapter sync failed");
                AdapterRunReport {
                    adapter: name,
                    ok: false,
                    result: None,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn run_locked(
        &self,
        driver: &dyn Adapter,
        name: &str,
        full: bool,
        cancel: CancellationToken,
    ) -> Result<crate::adapter::AdapterResult> {
        if !self.store.claim_sync_job(name, SYNC_LEASE_TTL_SECS).await? {
            return Err(SyncError::Busy(name.to_string()).into());
        }

        let outcome = self.drive(driver, name, full, cancel).await;

        match &outcome {
            Ok(result) => {
                self.store
                    .finish_sync_job(name, true, result.cursor.as_deref(), None)
                    .await?;
                self.store
                    .publish_bus_event(
                        bus::SYNC_COMPLETED,
                        Some(name),
                        None,
                        serde_json::json!({
                            "ok": true,
                            "events_created": result.events_created,
                            "persons_created": result.persons_created,
                            "duration_ms": result.duration_ms,
                        }),
                    )
                    .await?;
                tracing::info!(
                    adapter = %name,
                    events = result.events_created,
                    persons = result.persons_created,
                    "sync completed"
                );
            }
            Err(error) => {
                self.store
                    .finish_sync_job(name, false, None, Some(&error.to_string()))
                    .await?;
                self.store
                    .publish_bus_event(
                        bus::SYNC_COMPLETED,
                        Some(name),
                        None,
                        serde_json::json!({ "ok": false, "error": error.to_string() }),
                    )
                    .await?;
            }
        }

        outcome
    }

    async fn drive(
        &self,
        driver: &dyn Adapter,
        name: &str,
        full: bool,
        cancel: CancellationToken,
    ) -> Result<crate::adapter::AdapterResult> {
        if let Readiness::Missing { what, remediation } = driver.prerequisites().await {
            return Err(SyncError::NotReady {
                name: name.to_string(),
                missing: what,
                remediation,
            }
            .into());
        }

        let cursor = if full {
            None
        } else {
            self.store
                .get_sync_job(name)
                .await?
                .and_then(|job| job.cursor)
        };

        let ctx = SyncContext::new(
            self.store.clone(),
            name,
            cursor,
            cancel,
            SYNC_LEASE_TTL_SECS,
        );
        driver.sync(&ctx, full).await
    }

    /// Current job rows for `sync status`.
    pub async fn status(&self) -> Result<Vec<SyncJob>> {
        self.store.list_sync_jobs().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterInstance, AdapterOptions, ComputeConfig, LlmConfig, WebhookConfig};
    use std::collections::BTreeMap;

    fn config_with(adapters: BTreeMap<String, AdapterInstance>) -> Config {
        Config {
            data_dir: std::env::temp_dir(),
            adapters,
            compute: ComputeConfig::default(),
            webhook: WebhookConfig::default(),
            llm: LlmConfig::default(),
        }
    }

    #[tokio::test]
    async fn empty_adapter_set_is_vacuously_ok() {
        let store = Store::in_memory().await.expect("store");
        let orchestrator = Orchestrator::new(store, config_with(BTreeMap::new()));

        let result = orchestrator
            .run(&Selector::All, false, CancellationToken::new())
            .await
            .expect("run");
        assert!(result.ok);
        assert!(result.adapters.is_empty());
    }

    #[tokio::test]
    async fn unknown_selector_is_invalid_input() {
        let store = Store::in_memory().await.expect("store");
        let orchestrator = Orchestrator::new(store, config_with(BTreeMap::new()));

        let result = orchestrator
            .run(
                &Selector::One("nope".to_string()),
                false,
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn adapter_failure_does_not_abort_the_batch() {
        let mut adapters = BTreeMap::new();
        // aix with a missing source directory fails prerequisites.
        adapters.insert(
            "broken-aix".to_string(),
            AdapterInstance {
                kind: "aix".to_string(),
                enabled: true,
                options: AdapterOptions {
                    source: Some(std::path::PathBuf::from("/definitely/not/here")),
                    ..Default::default()
                },
            },
        );

        let store = Store::in_memory().await.expect("store");
        let orchestrator = Orchestrator::new(store.clone(), config_with(adapters));

        let result = orchestrator
            .run(&Selector::All, false, CancellationToken::new())
            .await
            .expect("run returns an aggregate, not an error");
        assert!(!result.ok);
        assert_eq!(result.adapters.len(), 1);
        assert!(result.adapters[0].error.is_some());

        // The job row records the terminal error state.
        let job = store
            .get_sync_job("broken-aix")
            .await
            .expect("get")
            .expect("row exists");
        assert_eq!(job.status, crate::store::sync_jobs::SyncStatus::Error);
        assert!(job.last_error.is_some());

        // And the failure was published on the bus.
        let bus_events = store.list_bus_events(0, 10).await.expect("bus");
        assert!(bus_events.iter().any(|e| e.event_type == bus::SYNC_COMPLETED));
    }
}
