//! Durable compute job queue with lease-based ownership.
//!
//! Leases replace in-memory worker ownership: a crashed worker's jobs are
//! reclaimed by the next `lease` call once the lease expires.

use crate::error::Result;
use crate::store::Store;
use crate::{fingerprint, new_id, now_ts};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// Kind of AI work a job represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analysis,
    EmbeddingConversation,
    EmbeddingFacet,
    EmbeddingPerson,
}

impl JobKind {
    pub const EMBEDDING: [JobKind; 3] = [
        JobKind::EmbeddingConversation,
        JobKind::EmbeddingFacet,
        JobKind::EmbeddingPerson,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Analysis => "analysis",
            JobKind::EmbeddingConversation => "embedding_conversation",
            JobKind::EmbeddingFacet => "embedding_facet",
            JobKind::EmbeddingPerson => "embedding_person",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analysis" => Some(JobKind::Analysis),
            "embedding_conversation" => Some(JobKind::EmbeddingConversation),
            "embedding_facet" => Some(JobKind::EmbeddingFacet),
            "embedding_person" => Some(JobKind::EmbeddingPerson),
            _ => None,
        }
    }

    pub fn is_embedding(self) -> bool {
        !matches!(self, JobKind::Analysis)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "leased" => Some(JobStatus::Leased),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A leased unit of AI work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub entity_id: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub lease_expires_at: Option<i64>,
    pub worker_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let kind: String = row.try_get("kind").context("failed to read job kind")?;
    let status: String = row.try_get("status").context("failed to read job status")?;
    let params: String = row.try_get("params").unwrap_or_else(|_| "{}".to_string());
    Ok(Job {
        id: row.try_get("id").context("failed to read job id")?,
        kind: JobKind::parse(&kind).with_context(|| format!("invalid job kind in database: {kind}"))?,
        entity_id: row.try_get("entity_id").context("failed to read entity_id")?,
        params: serde_json::from_str(&params)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        status: JobStatus::parse(&status)
            .with_context(|| format!("invalid job status in database: {status}"))?,
        lease_expires_at: row.try_get("lease_expires_at").ok(),
        worker_id: row.try_get("worker_id").ok(),
        attempts: row.try_get::<i64, _>("attempts").unwrap_or(0) as u32,
        last_error: row.try_get("last_error").ok(),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

/// Mark a job succeeded inside the caller's result-application transaction.
pub async fn mark_succeeded(conn: &mut SqliteConnection, job_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE compute_jobs SET status = 'succeeded', lease_expires_at = NULL,
             worker_id = NULL, last_error = NULL, updated_at = ?
         WHERE id = ?",
    )
    .bind(now_ts())
    .bind(job_id)
    .execute(&mut *conn)
    .await
    .context("failed to mark job succeeded")?;
    Ok(())
}

impl Store {
    /// Insert a pending job unless an equivalent one is already in flight.
    /// Returns true when a new row was created.
    pub async fn enqueue_job(
        &self,
        kind: JobKind,
        entity_id: &str,
        params: serde_json::Value,
    ) -> Result<bool> {
        let params_text = params.to_string();
        let params_hash = fingerprint(params_text.as_bytes());
        let now = now_ts();

        let result = sqlx::query(
            "INSERT INTO compute_jobs (id, kind, entity_id, params, params_hash, status, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?, 'pending', ?, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM compute_jobs
                 WHERE kind = ? AND entity_id = ? AND params_hash = ?
                   AND status IN ('pending', 'leased')
             )",
        )
        .bind(new_id())
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(&params_text)
        .bind(&params_hash)
        .bind(now)
        .bind(now)
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(&params_hash)
        .execute(self.pool())
        .await
        .context("failed to enqueue job")?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically lease the oldest pending job of `kind`. Expired leases are
    /// reclaimed here.
    pub async fn lease_job(
        &self,
        kind: JobKind,
        worker_id: &str,
        ttl_secs: u64,
    ) -> Result<Option<Job>> {
        let now = now_ts();
        let row = sqlx::query(
            "UPDATE compute_jobs SET
                 status = 'leased',
                 lease_expires_at = ?,
                 worker_id = ?,
                 attempts = attempts + 1,
                 updated_at = ?
             WHERE id = (
                 SELECT id FROM compute_jobs
                 WHERE kind = ?
                   AND (status = 'pending'
                        OR (status = 'leased' AND lease_expires_at < ?))
                 ORDER BY created_at, id LIMIT 1
             )
             RETURNING *",
        )
        .bind(now + ttl_secs as i64)
        .bind(worker_id)
        .bind(now)
        .bind(kind.as_str())
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .context("failed to lease job")?;

        row.map(job_from_row).transpose()
    }

    /// Lease up to `limit` embedding jobs sharing one model. The model of the
    /// oldest leaseable job picks the batch.
    pub async fn lease_embedding_batch(
        &self,
        kind: JobKind,
        worker_id: &str,
        ttl_secs: u64,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let now = now_ts();
        let model: Option<String> = sqlx::query_scalar(
            "SELECT json_extract(params, '$.model') FROM compute_jobs
             WHERE kind = ?
               AND (status = 'pending' OR (status = 'leased' AND lease_expires_at < ?))
             ORDER BY created_at, id LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .context("failed to pick batch model")?;

        let Some(model) = model else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "UPDATE compute_jobs SET
                 status = 'leased',
                 lease_expires_at = ?,
                 worker_id = ?,
                 attempts = attempts + 1,
                 updated_at = ?
             WHERE id IN (
                 SELECT id FROM compute_jobs
                 WHERE kind = ?
                   AND json_extract(params, '$.model') = ?
                   AND (status = 'pending'
                        OR (status = 'leased' AND lease_expires_at < ?))
                 ORDER BY created_at, id LIMIT ?
             )
             RETURNING *",
        )
        .bind(now + ttl_secs as i64)
        .bind(worker_id)
        .bind(now)
        .bind(kind.as_str())
        .bind(&model)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .context("failed to lease embedding batch")?;

        rows.into_iter().map(job_from_row).collect()
    }

    /// Record a failure. Retriable failures return the job to `pending` until
    /// attempts are exhausted (then `dead`); non-retriable failures are
    /// terminal `failed`.
    pub async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        retriable: bool,
        max_attempts: u32,
    ) -> Result<JobStatus> {
        let attempts: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM compute_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(self.pool())
                .await
                .context("failed to read job attempts")?;
        let Some(attempts) = attempts else {
            return Err(crate::error::ComputeError::JobNotFound(job_id.to_string()).into());
        };

        let next = if !retriable {
            JobStatus::Failed
        } else if attempts >= max_attempts as i64 {
            JobStatus::Dead
        } else {
            JobStatus::Pending
        };

        sqlx::query(
            "UPDATE compute_jobs SET status = ?, last_error = ?,
                 lease_expires_at = NULL, worker_id = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(next.as_str())
        .bind(error)
        .bind(now_ts())
        .bind(job_id)
        .execute(self.pool())
        .await
        .context("failed to record job failure")?;

        Ok(next)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM compute_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch job")?;
        row.map(job_from_row).transpose()
    }

    pub async fn count_jobs(&self, kind: JobKind, status: JobStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM compute_jobs WHERE kind = ? AND status = ?")
            .bind(kind.as_str())
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await
            .context("failed to count jobs")
            .map_err(Into::into)
    }

    /// Entity ids of pending jobs, used by the pre-load warm phase.
    pub async fn pending_entity_ids(&self, kind: JobKind) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT entity_id FROM compute_jobs WHERE kind = ? AND status = 'pending'
             ORDER BY created_at",
        )
        .bind(kind.as_str())
        .fetch_all(self.pool())
        .await
        .context("failed to list pending entities")
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_enqueue_yields_one_pending_row() {
        let store = Store::in_memory().await.expect("store should open");
        let params = serde_json::json!({ "model": "m1" });

        let first = store
            .enqueue_job(JobKind::Analysis, "conv-1", params.clone())
            .await
            .expect("enqueue");
        let second = store
            .enqueue_job(JobKind::Analysis, "conv-1", params)
            .await
            .expect("enqueue again");

        assert!(first);
        assert!(!second);
        assert_eq!(
            store
                .count_jobs(JobKind::Analysis, JobStatus::Pending)
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn lease_picks_oldest_and_reclaims_expired() {
        let store = Store::in_memory().await.expect("store should open");
        store
            .enqueue_job(JobKind::Analysis, "conv-1", serde_json::json!({}))
            .await
            .expect("enqueue");

        let job = store
            .lease_job(JobKind::Analysis, "w1", 300)
            .await
            .expect("lease")
            .expect("job should be available");
        assert_eq!(job.status, JobStatus::Leased);
        assert_eq!(job.attempts, 1);

        // Still leased: nothing to hand out.
        assert!(
            store
                .lease_job(JobKind::Analysis, "w2", 300)
                .await
                .expect("lease")
                .is_none()
        );

        // Expire the lease by hand; the next lease reclaims it.
        sqlx::query("UPDATE compute_jobs SET lease_expires_at = ? WHERE id = ?")
            .bind(now_ts() - 10)
            .bind(&job.id)
            .execute(store.pool())
            .await
            .expect("expire lease");

        let reclaimed = store
            .lease_job(JobKind::Analysis, "w2", 300)
            .await
            .expect("lease")
            .expect("expired job should be reclaimed");
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn failing_past_max_attempts_goes_dead() {
        let store = Store::in_memory().await.expect("store should open");
        store
            .enqueue_job(JobKind::Analysis, "conv-1", serde_json::json!({}))
            .await
            .expect("enqueue");

        for attempt in 1..=3 {
            let job = store
                .lease_job(JobKind::Analysis, "w1", 300)
                .await
                .expect("lease")
                .expect("job available");
            let status = store
                .fail_job(&job.id, "api exploded", true, 3)
                .await
                .expect("fail");
            if attempt < 3 {
                assert_eq!(status, JobStatus::Pending, "attempt {attempt} should retry");
            } else {
                assert_eq!(status, JobStatus::Dead, "attempt {attempt} should be dead");
            }
        }

        // Dead jobs are never leased again.
        assert!(
            store
                .lease_job(JobKind::Analysis, "w1", 300)
                .await
                .expect("lease")
                .is_none()
        );
    }

    #[tokio::test]
    async fn embedding_batch_groups_by_model() {
        let store = Store::in_memory().await.expect("store should open");
        for i in 0..3 {
            store
                .enqueue_job(
                    JobKind::EmbeddingConversation,
                    &format!("conv-{i}"),
                    serde_json::json!({ "model": "small" }),
                )
                .await
                .expect("enqueue small");
        }
        store
            .enqueue_job(
                JobKind::EmbeddingConversation,
                "conv-x",
                serde_json::json!({ "model": "large" }),
            )
            .await
            .expect("enqueue large");

        let batch = store
            .lease_embedding_batch(JobKind::EmbeddingConversation, "w1", 300, 10)
            .await
            .expect("lease batch");
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|j| j.params["model"] == "small"));
    }
}
