//! Transactional batch writer: collects per-job result tuples and applies
//! each batch under one write transaction together with the jobs' terminal
//! status. Saturating the queue slows leasing, which is the intended
//! backpressure.

use crate::bus;
use crate::compute::stats::EngineStats;
use crate::error::Result;
use crate::store::{analysis, embeddings, jobs, Store};
use anyhow::Context as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// One completed job's result, ready to commit.
#[derive(Debug)]
pub enum WriteItem {
    Analysis {
        job_id: String,
        conversation_id: String,
        analysis_type: String,
        output: serde_json::Value,
        facets: Vec<(String, String, f64, String)>,
    },
    Embedding {
        job_id: String,
        entity_type: String,
        entity_id: String,
        model: String,
        vector: Vec<f64>,
    },
}

impl WriteItem {
    fn is_analysis(&self) -> bool {
        matches!(self, WriteItem::Analysis { .. })
    }
}

/// Sender half handed to workers. Dropping every clone flushes and stops the
/// writer task.
#[derive(Clone)]
pub struct BatchWriter {
    tx: mpsc::Sender<WriteItem>,
}

impl BatchWriter {
    pub async fn submit(&self, item: WriteItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow::anyhow!("batch writer has shut down").into())
    }
}

/// Spawn the writer task. Batches flush at `batch_size` or on the flush
/// timer, whichever comes first.
pub fn spawn(
    store: Store,
    stats: Arc<EngineStats>,
    batch_size: usize,
    flush_interval: Duration,
) -> (BatchWriter, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WriteItem>(batch_size.max(1) * 2);

    let handle = tokio::spawn(async move {
        let mut pending: Vec<WriteItem> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some(item) => {
                            pending.push(item);
                            if pending.len() >= batch_size {
                                flush(&store, &stats, &mut pending).await;
                            }
                        }
                        None => {
                            // Every sender dropped: final flush, then exit.
                            flush(&store, &stats, &mut pending).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        flush(&store, &stats, &mut pending).await;
                    }
                }
            }
        }
    });

    (BatchWriter { tx }, handle)
}

async fn flush(store: &Store, stats: &EngineStats, pending: &mut Vec<WriteItem>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<WriteItem> = std::mem::take(pending);
    let started = Instant::now();

    match apply_batch(store, &batch).await {
        Ok(()) => {
            let elapsed = started.elapsed();
            for item in &batch {
                if item.is_analysis() {
                    stats.analysis.db_write.observe(elapsed);
                    stats.analysis.succeeded.fetch_add(1, Ordering::SeqCst);
                } else {
                    stats.embedding.db_write.observe(elapsed);
                    stats.embedding.succeeded.fetch_add(1, Ordering::SeqCst);
                }
            }
            tracing::debug!(items = batch.len(), "batch committed");
        }
        Err(error) => {
            // The transaction rolled back; release the jobs for retry. Lease
            // expiry covers a crash before this point.
            tracing::warn!(%error, items = batch.len(), "batch write failed, releasing jobs");
            for item in &batch {
                let job_id = match item {
                    WriteItem::Analysis { job_id, .. } => job_id,
                    WriteItem::Embedding { job_id, .. } => job_id,
                };
                if let Err(release_error) = store
                    .fail_job(job_id, &error.to_string(), true, u32::MAX)
                    .await
                {
                    tracing::error!(job = %job_id, %release_error, "failed to release job");
                }
            }
        }
    }
}

async fn apply_batch(store: &Store, batch: &[WriteItem]) -> Result<()> {
    let mut tx = store.begin().await?;

    for item in batch {
        match item {
            WriteItem::Analysis {
                job_id,
                conversation_id,
                analysis_type,
                output,
                facets,
            } => {
                let run_id =
                    analysis::apply_run(&mut tx, conversation_id, analysis_type, output, facets)
                        .await?;
                bus::publish(
                    &mut tx,
                    bus::ANALYSIS_COMPLETED,
                    None,
                    None,
                    serde_json::json!({
                        "conversation": conversation_id,
                        "analysis_type": analysis_type,
                        "run": run_id,
                        "facets": facets.len(),
                    }),
                )
                .await?;
                jobs::mark_succeeded(&mut tx, job_id).await?;
            }
            WriteItem::Embedding {
                job_id,
                entity_type,
                entity_id,
                model,
                vector,
            } => {
                embeddings::upsert_embedding(&mut tx, entity_type, entity_id, model, vector)
                    .await?;
                jobs::mark_succeeded(&mut tx, job_id).await?;
            }
        }
    }

    tx.commit().await.context("failed to commit result batch")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::jobs::{JobKind, JobStatus};

    async fn seeded_store() -> (Store, String) {
        let store = Store::in_memory().await.expect("store");
        store
            .enqueue_job(
                JobKind::EmbeddingConversation,
                "conv-1",
                serde_json::json!({ "model": "small" }),
            )
            .await
            .expect("enqueue");
        let job = store
            .lease_job(JobKind::EmbeddingConversation, "w1", 300)
            .await
            .expect("lease")
            .expect("job");
        (store, job.id)
    }

    #[tokio::test]
    async fn result_and_job_status_commit_together() {
        let (store, job_id) = seeded_store().await;
        let stats = Arc::new(EngineStats::default());
        let (writer, handle) = spawn(store.clone(), stats.clone(), 10, Duration::from_millis(50));

        writer
            .submit(WriteItem::Embedding {
                job_id: job_id.clone(),
                entity_type: "conversation".to_string(),
                entity_id: "conv-1".to_string(),
                model: "small".to_string(),
                vector: vec![0.25, -1.0],
            })
            .await
            .expect("submit");

        drop(writer);
        handle.await.expect("writer task");

        let job = store.get_job(&job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(store.count_embeddings().await.expect("count"), 1);
        assert_eq!(stats.embedding.succeeded.load(Ordering::SeqCst), 1);
    }
}
