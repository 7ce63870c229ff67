//! Per-adapter sync job rows: status, phase, cursor, progress, and the
//! DB-level guard serializing concurrent orchestrator invocations.

use crate::error::Result;
use crate::store::Store;
use crate::now_ts;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

/// Sync job state for one adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Running,
    Ok,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Running => "running",
            SyncStatus::Ok => "ok",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(SyncStatus::Idle),
            "running" => Some(SyncStatus::Running),
            "ok" => Some(SyncStatus::Ok),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One adapter's sync job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub adapter: String,
    pub status: SyncStatus,
    pub phase: Option<String>,
    pub cursor: Option<String>,
    pub progress: serde_json::Value,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub started_at: Option<i64>,
    pub updated_at: i64,
}

fn sync_job_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SyncJob> {
    let status: String = row.try_get("status").context("failed to read sync status")?;
    let progress: String = row.try_get("progress").unwrap_or_else(|_| "{}".to_string());
    Ok(SyncJob {
        adapter: row.try_get("adapter").context("failed to read adapter")?,
        status: SyncStatus::parse(&status)
            .with_context(|| format!("invalid sync status in database: {status}"))?,
        phase: row.try_get("phase").ok(),
        cursor: row.try_get("cursor").ok(),
        progress: serde_json::from_str(&progress)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        last_error: row.try_get("last_error").ok(),
        lease_expires_at: row.try_get("lease_expires_at").ok(),
        started_at: row.try_get("started_at").ok(),
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

impl Store {
    /// Claim the adapter's job row for a new run. Fails (returns false) when
    /// another live run holds it; stale leases are broken.
    pub async fn claim_sync_job(&self, adapter: &str, lease_ttl_secs: u64) -> Result<bool> {
        let now = now_ts();

        sqlx::query(
            "INSERT INTO sync_jobs (adapter, status, updated_at) VALUES (?, 'idle', ?)
             ON CONFLICT(adapter) DO NOTHING",
        )
        .bind(adapter)
        .bind(now)
        .execute(self.pool())
        .await
        .context("failed to ensure sync job row")?;

        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'running', phase = 'starting',
                 last_error = NULL, lease_expires_at = ?, started_at = ?, updated_at = ?
             WHERE adapter = ?
               AND (status != 'running' OR lease_expires_at IS NULL OR lease_expires_at < ?)",
        )
        .bind(now + lease_ttl_secs as i64)
        .bind(now)
        .bind(now)
        .bind(adapter)
        .bind(now)
        .execute(self.pool())
        .await
        .context("failed to claim sync job")?;

        Ok(result.rows_affected() > 0)
    }

    /// Advance the run's phase and progress; also renews the lease.
    pub async fn update_sync_progress(
        &self,
        adapter: &str,
        phase: &str,
        progress: &serde_json::Value,
        lease_ttl_secs: u64,
    ) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE sync_jobs SET phase = ?, progress = ?, lease_expires_at = ?, updated_at = ?
             WHERE adapter = ?",
        )
        .bind(phase)
        .bind(progress.to_string())
        .bind(now + lease_ttl_secs as i64)
        .bind(now)
        .bind(adapter)
        .execute(self.pool())
        .await
        .context("failed to update sync progress")?;
        Ok(())
    }

    /// Terminal write for a run: status, cursor, error.
    pub async fn finish_sync_job(
        &self,
        adapter: &str,
        ok: bool,
        cursor: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let status = if ok { SyncStatus::Ok } else { SyncStatus::Error };
        sqlx::query(
            "UPDATE sync_jobs SET status = ?, phase = 'done',
                 cursor = COALESCE(?, cursor), last_error = ?,
                 lease_expires_at = NULL, updated_at = ?
             WHERE adapter = ?",
        )
        .bind(status.as_str())
        .bind(cursor)
        .bind(error)
        .bind(now_ts())
        .bind(adapter)
        .execute(self.pool())
        .await
        .context("failed to finish sync job")?;
        Ok(())
    }

    pub async fn get_sync_job(&self, adapter: &str) -> Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE adapter = ?")
            .bind(adapter)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch sync job")?;
        row.map(sync_job_from_row).transpose()
    }

    pub async fn list_sync_jobs(&self) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs ORDER BY adapter")
            .fetch_all(self.pool())
            .await
            .context("failed to list sync jobs")?;
        rows.into_iter().map(sync_job_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_fails_until_finished() {
        let store = Store::in_memory().await.expect("store should open");

        assert!(store.claim_sync_job("gmail-a", 300).await.expect("claim"));
        assert!(
            !store.claim_sync_job("gmail-a", 300).await.expect("claim"),
            "concurrent claim must be rejected"
        );

        store
            .finish_sync_job("gmail-a", true, Some("cursor-1"), None)
            .await
            .expect("finish");

        assert!(
            store.claim_sync_job("gmail-a", 300).await.expect("claim"),
            "claim should succeed after finish"
        );

        let job = store
            .get_sync_job("gmail-a")
            .await
            .expect("get")
            .expect("row exists");
        assert_eq!(job.status, SyncStatus::Running);
        assert_eq!(job.cursor.as_deref(), Some("cursor-1"));
    }

    #[tokio::test]
    async fn stale_lease_is_broken() {
        let store = Store::in_memory().await.expect("store should open");
        assert!(store.claim_sync_job("eve", 300).await.expect("claim"));

        sqlx::query("UPDATE sync_jobs SET lease_expires_at = ? WHERE adapter = 'eve'")
            .bind(now_ts() - 5)
            .execute(store.pool())
            .await
            .expect("expire");

        assert!(
            store.claim_sync_job("eve", 300).await.expect("claim"),
            "stale running lease should be reclaimable"
        );
    }
}
