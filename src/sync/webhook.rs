//! Webhook receiver: a small HTTP server that turns authenticated POST/PUT
//! requests into debounced sync runs. The request payload is discarded; the
//! adapter's own cursor reconstructs what to fetch.

use crate::sync::{Orchestrator, Selector};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Maximum accepted request body.
const BODY_LIMIT_BYTES: usize = 256 * 1024;

pub struct WebhookState {
    orchestrator: Arc<Orchestrator>,
    token: Option<String>,
    debounce: Duration,
    /// Pinned adapter instance, when configured.
    adapter_pin: Option<String>,
    /// Adapter type filter applied when no pin is set.
    adapter_type: Option<String>,
    last_trigger: Mutex<HashMap<String, Instant>>,
}

impl WebhookState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let webhook = orchestrator.config().webhook.clone();
        Self {
            orchestrator,
            token: webhook.token,
            debounce: Duration::from_secs(webhook.debounce_seconds),
            adapter_pin: webhook.adapter,
            adapter_type: webhook.adapter_type,
            last_trigger: Mutex::new(HashMap::new()),
        }
    }

    /// Bearer token check: `Authorization: Bearer <t>` or `?token=<t>`.
    /// No configured token means open access.
    pub fn authorize(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        let header_token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let query_token = query.get("token").map(String::as_str);
        header_token == Some(expected.as_str()) || query_token == Some(expected.as_str())
    }

    /// Adapter instances this receiver targets.
    fn target_adapters(&self) -> Vec<String> {
        if let Some(pin) = &self.adapter_pin {
            return vec![pin.clone()];
        }
        self.orchestrator
            .config()
            .enabled_adapters()
            .filter(|(_, instance)| {
                self.adapter_type
                    .as_deref()
                    .is_none_or(|t| instance.kind == t)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Apply the skip rules and spawn a sync task per surviving adapter.
    /// Returns the adapters actually triggered.
    pub async fn trigger(self: &Arc<Self>) -> Vec<String> {
        let mut triggered = Vec::new();

        for adapter in self.target_adapters() {
            // Skip while a sync is already running.
            if let Ok(Some(job)) = self.orchestrator.store().get_sync_job(&adapter).await
                && job.status == crate::store::sync_jobs::SyncStatus::Running
                && job.lease_expires_at.is_some_and(|t| t > crate::now_ts())
            {
                tracing::debug!(%adapter, "webhook skip: sync already running");
                continue;
            }

            // Debounce window.
            {
                let mut last = self.last_trigger.lock().expect("debounce map poisoned");
                if let Some(previous) = last.get(&adapter)
                    && previous.elapsed() < self.debounce
                {
                    tracing::debug!(%adapter, "webhook skip: inside debounce window");
                    continue;
                }
                last.insert(adapter.clone(), Instant::now());
            }

            let orchestrator = self.orchestrator.clone();
            let name = adapter.clone();
            tokio::spawn(async move {
                let result = orchestrator
                    .run(&Selector::One(name.clone()), false, CancellationToken::new())
                    .await;
                if let Err(error) = result {
                    tracing::warn!(adapter = %name, %error, "webhook-triggered sync failed");
                }
            });
            triggered.push(adapter);
        }

        triggered
    }
}

async fn handle(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    _body: axum::body::Bytes,
) -> (StatusCode, &'static str) {
    if !state.authorize(&headers, &query) {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n");
    }
    let triggered = state.trigger().await;
    tracing::info!(adapters = triggered.len(), "webhook accepted");
    (StatusCode::OK, "ok\n")
}

/// Bind and serve the receiver until the shutdown signal fires.
pub async fn serve(
    state: Arc<WebhookState>,
    shutdown: CancellationToken,
) -> crate::Result<tokio::task::JoinHandle<()>> {
    let config = state.orchestrator.config().webhook.clone();
    let app = Router::new()
        .route(&config.path, post(handle).put(handle))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(state);

    let bind: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|error| {
            crate::error::ConfigError::Invalid(format!("invalid webhook bind address: {error}"))
        })?;
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, path = %config.path, "webhook receiver listening");

    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!(%error, "webhook server exited with error");
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterInstance, AdapterOptions, Config, ComputeConfig, LlmConfig, WebhookConfig};
    use crate::store::Store;
    use std::collections::BTreeMap;

    async fn state_with_pin(debounce_seconds: u64, pin: &str) -> Arc<WebhookState> {
        let config = Config {
            data_dir: std::env::temp_dir(),
            adapters: BTreeMap::new(),
            compute: ComputeConfig::default(),
            webhook: WebhookConfig {
                debounce_seconds,
                adapter: Some(pin.to_string()),
                ..Default::default()
            },
            llm: LlmConfig::default(),
        };
        let store = Store::in_memory().await.expect("store");
        Arc::new(WebhookState::new(Arc::new(Orchestrator::new(store, config))))
    }

    async fn state_with_adapter(debounce_seconds: u64, token: Option<&str>) -> Arc<WebhookState> {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut adapters = BTreeMap::new();
        adapters.insert(
            "aix-main".to_string(),
            AdapterInstance {
                kind: "aix".to_string(),
                enabled: true,
                options: AdapterOptions {
                    source: Some(dir.path().to_path_buf()),
                    ..Default::default()
                },
            },
        );
        // Leak the tempdir so the adapter's source survives the test body.
        std::mem::forget(dir);

        let config = Config {
            data_dir: std::env::temp_dir(),
            adapters,
            compute: ComputeConfig::default(),
            webhook: WebhookConfig {
                debounce_seconds,
                token: token.map(str::to_string),
                ..Default::default()
            },
            llm: LlmConfig::default(),
        };
        let store = Store::in_memory().await.expect("store");
        Arc::new(WebhookState::new(Arc::new(Orchestrator::new(store, config))))
    }

    #[tokio::test]
    async fn burst_inside_debounce_window_triggers_once() {
        let state = state_with_adapter(60, None).await;

        let mut total = 0;
        for _ in 0..100 {
            total += state.trigger().await.len();
        }
        assert_eq!(total, 1, "only the first request in the window may trigger");
    }

    #[tokio::test]
    async fn zero_debounce_retriggers() {
        // A pinned adapter with no job row sidesteps run-state timing.
        let state = state_with_pin(0, "pinned").await;
        assert_eq!(state.trigger().await.len(), 1);
        assert_eq!(state.trigger().await.len(), 1);
    }

    #[tokio::test]
    async fn trigger_after_window_fires_again() {
        let state = state_with_pin(60, "pinned").await;
        assert_eq!(state.trigger().await.len(), 1);
        assert_eq!(state.trigger().await.len(), 0, "inside the window");

        // Age the last trigger past the window by hand.
        state
            .last_trigger
            .lock()
            .expect("map")
            .insert("pinned".to_string(), Instant::now() - Duration::from_secs(61));
        assert_eq!(state.trigger().await.len(), 1, "window lapsed");
    }

    #[tokio::test]
    async fn token_is_accepted_from_header_or_query() {
        let state = state_with_adapter(60, Some("s3cret")).await;

        let mut headers = HeaderMap::new();
        let empty = HashMap::new();
        assert!(!state.authorize(&headers, &empty));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer s3cret".parse().expect("header value"),
        );
        assert!(state.authorize(&headers, &empty));

        let query: HashMap<String, String> =
            [("token".to_string(), "s3cret".to_string())].into_iter().collect();
        assert!(state.authorize(&HeaderMap::new(), &query));

        let wrong: HashMap<String, String> =
            [("token".to_string(), "wrong".to_string())].into_iter().collect();
        assert!(!state.authorize(&HeaderMap::new(), &wrong));
    }
}
