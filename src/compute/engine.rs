//! The compute engine: a bounded worker pool draining the durable job queue
//! through the rate-limited LLM API, with results funneled into the
//! transactional batch writer.

use crate::compute::facets;
use crate::compute::limiter::{FlowController, Outcome};
use crate::compute::llm::LlmClient;
use crate::compute::stats::{EngineStats, StatsSnapshot};
use crate::compute::writer::{self, BatchWriter, WriteItem};
use crate::config::{ComputeConfig, LlmConfig};
use crate::error::{ComputeError, Error, Result};
use crate::store::analysis::AnalysisType;
use crate::store::jobs::{Job, JobKind, JobStatus};
use crate::store::Store;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Conversation cache capacity (entries).
const CACHE_CAPACITY: u64 = 10_000;

pub struct ComputeEngine {
    store: Store,
    config: ComputeConfig,
    llm: Arc<LlmClient>,
    stats: Arc<EngineStats>,
    cache: moka::future::Cache<String, Arc<String>>,
}

impl ComputeEngine {
    pub fn new(store: Store, config: ComputeConfig, llm_config: LlmConfig) -> Result<Self> {
        let llm = Arc::new(LlmClient::new(
            llm_config,
            Duration::from_secs(config.api_timeout_secs),
        )?);
        Ok(Self {
            store,
            config,
            llm,
            stats: Arc::new(EngineStats::default()),
            cache: moka::future::Cache::new(CACHE_CAPACITY),
        })
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    fn initial_rpm(&self, model: &str) -> u32 {
        self.config
            .model_rpm
            .get(model)
            .copied()
            .unwrap_or(self.config.default_rpm)
            .min(self.config.rpm_ceiling)
    }

    /// Process every queued job to a terminal state, then return the stats
    /// snapshot.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<StatsSnapshot> {
        if self.config.preload {
            self.preload().await?;
        }

        // Seed each flow's controller from the model tier of its oldest
        // pending job.
        let analysis_model = self.oldest_model(JobKind::Analysis).await?;
        let embedding_model = self.oldest_model(JobKind::EmbeddingConversation).await?;
        let analysis_controller = Arc::new(FlowController::new(
            self.initial_rpm(analysis_model.as_deref().unwrap_or("")),
            self.config.rpm_ceiling,
            self.config.workers,
            !self.config.disable_adaptive,
        ));
        let embedding_controller = Arc::new(FlowController::new(
            self.initial_rpm(embedding_model.as_deref().unwrap_or("")),
            self.config.rpm_ceiling,
            self.config.workers,
            !self.config.disable_adaptive,
        ));

        let (batch_writer, writer_handle) = writer::spawn(
            self.store.clone(),
            self.stats.clone(),
            self.config.write_batch,
            Duration::from_millis(self.config.flush_interval_ms),
        );

        let mut workers = Vec::new();
        for index in 0..self.config.workers {
            let engine = self.clone();
            let controller = analysis_controller.clone();
            let writer = batch_writer.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                engine
                    .analysis_worker(&format!("analysis-{index}"), controller, writer, cancel)
                    .await;
            }));
        }
        for index in 0..self.config.workers.clamp(1, 2) {
            let engine = self.clone();
            let controller = embedding_controller.clone();
            let writer = batch_writer.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                engine
                    .embedding_worker(&format!("embedding-{index}"), controller, writer, cancel)
                    .await;
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }

        // Workers are done; dropping the last sender flushes the writer.
        drop(batch_writer);
        let _ = writer_handle.await;

        Ok(self.stats.snapshot(
            Some(analysis_controller.effective_rpm()),
            Some(embedding_controller.effective_rpm()),
        ))
    }

    /// Model tier of the oldest pending job of `kind`, used to seed the
    /// flow's initial RPM.
    async fn oldest_model(&self, kind: JobKind) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT json_extract(params, '$.model') FROM compute_jobs
             WHERE kind = ? AND status = 'pending'
             ORDER BY created_at, id LIMIT 1",
        )
        .bind(kind.as_str())
        .fetch_optional(self.store.pool())
        .await
        .map(|model: Option<Option<String>>| model.flatten())
        .map_err(|error| crate::store::translate(error).into())
    }

    /// Warm the conversation cache for every pending analysis job.
    async fn preload(&self) -> Result<()> {
        let ids = self.store.pending_entity_ids(JobKind::Analysis).await?;
        let total = ids.len();
        for id in ids {
            if let Some(text) = self.store.conversation_text(&id).await? {
                self.cache.insert(id, Arc::new(text)).await;
            }
        }
        tracing::info!(conversations = total, "pre-loaded analysis inputs");
        Ok(())
    }

    async fn conversation_text(&self, conversation_id: &str) -> Result<Option<Arc<String>>> {
        if let Some(text) = self.cache.get(conversation_id).await {
            return Ok(Some(text));
        }
        match self.store.conversation_text(conversation_id).await? {
            Some(text) => {
                let text = Arc::new(text);
                self.cache
                    .insert(conversation_id.to_string(), text.clone())
                    .await;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    async fn flow_drained(&self, kinds: &[JobKind], in_flight: u64) -> bool {
        if in_flight > 0 {
            return false;
        }
        for kind in kinds {
            let pending = self
                .store
                .count_jobs(*kind, JobStatus::Pending)
                .await
                .unwrap_or(1);
            if pending > 0 {
                return false;
            }
        }
        true
    }

    async fn analysis_worker(
        &self,
        worker_id: &str,
        controller: Arc<FlowController>,
        writer: BatchWriter,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let job = match self
                .store
                .lease_job(JobKind::Analysis, worker_id, self.config.lease_ttl_secs)
                .await
            {
                Ok(job) => job,
                Err(error) => {
                    tracing::warn!(%error, "analysis lease failed");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                }
            };

            let Some(job) = job else {
                let in_flight = self.stats.analysis.in_flight.load(Ordering::SeqCst);
                if self.flow_drained(&[JobKind::Analysis], in_flight).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            self.stats.analysis.in_flight.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            let outcome = self.process_analysis(&job, &controller, &writer).await;
            self.stats.analysis.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.stats.analysis.overall.observe(started.elapsed());

            if let Err(error) = outcome {
                self.handle_failure(&job, &self.stats.analysis, error).await;
            }
        }
    }

    async fn process_analysis(
        &self,
        job: &Job,
        controller: &FlowController,
        writer: &BatchWriter,
    ) -> Result<()> {
        let type_name = job
            .params
            .get("analysis_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ComputeError::Api("job params missing analysis_type".to_string()))?
            .to_string();
        let definition = self
            .store
            .get_analysis_type(&type_name)
            .await?
            .ok_or(ComputeError::UnknownAnalysisType(type_name))?;

        let Some(text) = self.conversation_text(&job.entity_id).await? else {
            self.stats.analysis.skipped.fetch_add(1, Ordering::SeqCst);
            self.store
                .fail_job(
                    &job.id,
                    "conversation has no text",
                    false,
                    self.config.max_attempts,
                )
                .await?;
            return Ok(());
        };

        let prompt = render_prompt(&definition, &job.entity_id, &text)?;

        let slot = controller.acquire().await;
        let api_started = Instant::now();
        let response = self.llm.complete_json(&definition.model, &prompt).await;
        let api_latency = api_started.elapsed();
        drop(slot);
        self.stats.analysis.api_call.observe(api_latency);
        controller.record(outcome_of(&response), api_latency);

        let (output, raw) = response?;

        if let Err(error) = facets::validate_output(&definition.output_schema, &output) {
            // Schema failures are terminal; the raw output is preserved on
            // the run for later replay.
            let mut tx = self.store.begin().await?;
            crate::store::analysis::record_failed_run(
                &mut tx,
                &job.entity_id,
                &definition.name,
                Some(&raw),
                &error.to_string(),
            )
            .await?;
            tx.commit().await.map_err(crate::store::translate)?;
            return Err(error);
        }

        let materialized = facets::materialize(&definition, &output);
        writer
            .submit(WriteItem::Analysis {
                job_id: job.id.clone(),
                conversation_id: job.entity_id.clone(),
                analysis_type: definition.name.clone(),
                output,
                facets: materialized,
            })
            .await
    }

    async fn embedding_worker(
        &self,
        worker_id: &str,
        controller: Arc<FlowController>,
        writer: BatchWriter,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut leased_any = false;
            for kind in JobKind::EMBEDDING {
                if cancel.is_cancelled() {
                    break;
                }
                let batch = match self
                    .store
                    .lease_embedding_batch(
                        kind,
                        worker_id,
                        self.config.lease_ttl_secs,
                        self.config.batch_size,
                    )
                    .await
                {
                    Ok(batch) => batch,
                    Err(error) => {
                        tracing::warn!(%error, "embedding lease failed");
                        continue;
                    }
                };
                if batch.is_empty() {
                    continue;
                }
                leased_any = true;

                self.stats
                    .embedding
                    .in_flight
                    .fetch_add(batch.len() as u64, Ordering::SeqCst);
                let started = Instant::now();
                self.process_embedding_batch(kind, batch, &controller, &writer)
                    .await;
                self.stats.embedding.overall.observe(started.elapsed());
            }

            if !leased_any {
                let in_flight = self.stats.embedding.in_flight.load(Ordering::SeqCst);
                if self
                    .flow_drained(&JobKind::EMBEDDING, in_flight)
                    .await
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    async fn process_embedding_batch(
        &self,
        kind: JobKind,
        batch: Vec<Job>,
        controller: &Arc<FlowController>,
        writer: &BatchWriter,
    ) {
        // Resolve input texts first; jobs without a source entity fail
        // terminally and drop out of the batch.
        let mut items: Vec<(Job, String)> = Vec::with_capacity(batch.len());
        for job in batch {
            match self.embedding_text(kind, &job.entity_id).await {
                Ok(Some(text)) => items.push((job, text)),
                Ok(None) => {
                    self.stats.embedding.skipped.fetch_add(1, Ordering::SeqCst);
                    self.stats.embedding.in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = self
                        .store
                        .fail_job(&job.id, "entity has no text", false, self.config.max_attempts)
                        .await;
                }
                Err(error) => {
                    self.stats.embedding.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.handle_failure(&job, &self.stats.embedding, error).await;
                }
            }
        }
        if items.is_empty() {
            return;
        }

        let model = items[0]
            .0
            .params
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("text-embedding-3-small")
            .to_string();
        let texts: Vec<String> = items.iter().map(|(_, text)| text.clone()).collect();

        let slot = controller.acquire().await;
        let api_started = Instant::now();
        let response = self.llm.embed_batch(&model, &texts).await;
        let api_latency = api_started.elapsed();
        drop(slot);
        self.stats.embedding.api_call.observe(api_latency);
        controller.record(outcome_of(&response), api_latency);

        match response {
            Ok(vectors) => {
                for ((job, _), vector) in items.iter().zip(vectors) {
                    self.stats.embedding.in_flight.fetch_sub(1, Ordering::SeqCst);
                    let submitted = writer
                        .submit(WriteItem::Embedding {
                            job_id: job.id.clone(),
                            entity_type: entity_type_of(kind).to_string(),
                            entity_id: job.entity_id.clone(),
                            model: model.clone(),
                            vector,
                        })
                        .await;
                    if let Err(error) = submitted {
                        self.handle_failure(job, &self.stats.embedding, error).await;
                    }
                }
            }
            Err(error) if items.len() > 1 => {
                // Batch failure degrades to per-item calls so valid items
                // still commit.
                tracing::warn!(%error, batch = items.len(), "embedding batch failed, retrying per item");
                for (job, text) in items {
                    self.stats.embedding.in_flight.fetch_sub(1, Ordering::SeqCst);
                    let slot = controller.acquire().await;
                    let item_started = Instant::now();
                    let single = self.llm.embed_batch(&model, std::slice::from_ref(&text)).await;
                    let item_latency = item_started.elapsed();
                    drop(slot);
                    self.stats.embedding.api_call.observe(item_latency);
                    controller.record(outcome_of(&single), item_latency);

                    match single {
                        Ok(mut vectors) => {
                            let vector = vectors.pop().unwrap_or_default();
                            let submitted = writer
                                .submit(WriteItem::Embedding {
                                    job_id: job.id.clone(),
                                    entity_type: entity_type_of(kind).to_string(),
                                    entity_id: job.entity_id.clone(),
                                    model: model.clone(),
                                    vector,
                                })
                                .await;
                            if let Err(error) = submitted {
                                self.handle_failure(&job, &self.stats.embedding, error).await;
                            }
                        }
                        Err(item_error) => {
                            self.handle_failure(&job, &self.stats.embedding, item_error).await;
                        }
                    }
                }
            }
            Err(error) => {
                for (job, _) in items {
                    self.stats.embedding.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.handle_failure(&job, &self.stats.embedding, Error::Compute(
                        ComputeError::Transient(error.to_string()),
                    ))
                    .await;
                }
            }
        }
    }

    async fn embedding_text(&self, kind: JobKind, entity_id: &str) -> Result<Option<String>> {
        match kind {
            JobKind::EmbeddingConversation => {
                Ok(self.conversation_text(entity_id).await?.map(|t| t.as_ref().clone()))
            }
            JobKind::EmbeddingFacet => {
                let row: Option<(String, String)> = sqlx::query_as(
                    "SELECT facet_type, value FROM facets WHERE id = ?",
                )
                .bind(entity_id)
                .fetch_optional(self.store.pool())
                .await
                .map_err(crate::store::translate)?;
                Ok(row.map(|(facet_type, value)| format!("{facet_type}: {value}")))
            }
            JobKind::EmbeddingPerson => {
                let Some(person) = self.store.get_person(entity_id).await? else {
                    return Ok(None);
                };
                let facts = self.store.facts_for_person(entity_id).await?;
                let mut text = person.canonical_name;
                for fact in facts.iter().take(50) {
                    text.push_str(&format!("\n{}: {}", fact.fact_type, fact.value));
                }
                Ok(Some(text))
            }
            JobKind::Analysis => Ok(None),
        }
    }

    async fn handle_failure(
        &self,
        job: &Job,
        flow: &crate::compute::stats::FlowStats,
        error: Error,
    ) {
        let retriable = match &error {
            Error::Compute(compute) => compute.is_retriable(),
            Error::Storage(storage) => {
                matches!(storage, crate::error::StorageError::Busy(_))
            }
            _ => false,
        };

        if let Error::Compute(ComputeError::RateLimited { retry_after }) = &error
            && let Some(seconds) = retry_after
        {
            tokio::time::sleep(Duration::from_secs((*seconds).min(60))).await;
        }

        match self
            .store
            .fail_job(&job.id, &error.to_string(), retriable, self.config.max_attempts)
            .await
        {
            Ok(JobStatus::Dead) => {
                flow.dead.fetch_add(1, Ordering::SeqCst);
                tracing::error!(job = %job.id, %error, "job is dead after max attempts");
            }
            Ok(_) => {
                flow.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(job = %job.id, %error, "job attempt failed");
            }
            Err(fail_error) => {
                tracing::error!(job = %job.id, %fail_error, "failed to record job failure");
            }
        }
    }
}

fn entity_type_of(kind: JobKind) -> &'static str {
    match kind {
        JobKind::EmbeddingConversation => "conversation",
        JobKind::EmbeddingFacet => "facet",
        JobKind::EmbeddingPerson => "person",
        JobKind::Analysis => "conversation",
    }
}

fn outcome_of<T>(response: &Result<T>) -> Outcome {
    match response {
        Ok(_) => Outcome::Success,
        Err(Error::Compute(ComputeError::RateLimited { .. })) => Outcome::RateLimited,
        Err(_) => Outcome::Error,
    }
}

fn render_prompt(definition: &AnalysisType, conversation_id: &str, text: &str) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.add_template("prompt", &definition.prompt_template)
        .map_err(|error| ComputeError::Api(format!("invalid prompt template: {error}")))?;
    let template = env
        .get_template("prompt")
        .map_err(|error| ComputeError::Api(error.to_string()))?;
    template
        .render(minijinja::context! {
            conversation => text,
            conversation_id => conversation_id,
        })
        .map_err(|error| ComputeError::Api(format!("prompt render failed: {error}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_template_renders_conversation() {
        let definition = AnalysisType {
            name: "insights".to_string(),
            version: 1,
            prompt_template: "Analyze this:\n{{ conversation }}".to_string(),
            output_schema: serde_json::json!({}),
            facet_mappings: vec![],
            model: "m".to_string(),
        };
        let prompt =
            render_prompt(&definition, "c1", "[1] received: hi").expect("render should work");
        assert!(prompt.contains("[1] received: hi"));
    }

    #[test]
    fn outcomes_classify_for_the_controller() {
        let ok: Result<()> = Ok(());
        assert_eq!(outcome_of(&ok), Outcome::Success);

        let limited: Result<()> =
            Err(ComputeError::RateLimited { retry_after: Some(2) }.into());
        assert_eq!(outcome_of(&limited), Outcome::RateLimited);

        let broken: Result<()> = Err(ComputeError::Api("boom".to_string()).into());
        assert_eq!(outcome_of(&broken), Outcome::Error);
    }
}
