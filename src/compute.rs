//! Compute: the durable AI job pipeline. Enqueue analysis/embedding work,
//! then drain it with the engine.

pub mod engine;
pub mod facets;
pub mod limiter;
pub mod llm;
pub mod stats;
pub mod writer;

use crate::config::Config;
use crate::error::Result;
use crate::store::analysis::{AnalysisType, FacetMapping};
use crate::store::jobs::JobKind;
use crate::store::Store;

pub use engine::ComputeEngine;
pub use stats::StatsSnapshot;

/// Built-in analysis type seeded on first use: extracts topics, sentiment,
/// and mentioned people from a conversation.
pub fn default_analysis_type(model: &str) -> AnalysisType {
    AnalysisType {
        name: "conversation_insights".to_string(),
        version: 1,
        prompt_template: concat!(
            "You are analyzing a personal conversation log. Respond with a ",
            "single JSON object and nothing else.\n\n",
            "Schema: {\"topics\": [string], \"sentiment\": string, ",
            "\"people\": [{\"name\": string, \"employer\": string?}]}\n\n",
            "Conversation:\n{{ conversation }}",
        )
        .to_string(),
        output_schema: serde_json::json!({
            "type": "object",
            "required": ["topics", "sentiment"],
            "properties": {
                "topics": { "type": "array", "items": { "type": "string" } },
                "sentiment": { "type": "string" },
                "people": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {
                            "name": { "type": "string" },
                            "employer": { "type": "string" },
                        }
                    }
                },
            }
        }),
        facet_mappings: vec![
            FacetMapping {
                path: "topics[]".to_string(),
                facet_type: "topic".to_string(),
                confidence: 0.7,
            },
            FacetMapping {
                path: "sentiment".to_string(),
                facet_type: "sentiment".to_string(),
                confidence: 0.6,
            },
            FacetMapping {
                path: "people[].name".to_string(),
                facet_type: "mentioned_person".to_string(),
                confidence: 0.7,
            },
            FacetMapping {
                path: "people[].employer".to_string(),
                facet_type: "mentioned_employer".to_string(),
                confidence: 0.6,
            },
        ],
        model: model.to_string(),
    }
}

/// Make sure at least one analysis type exists.
pub async fn ensure_analysis_types(store: &Store, model: &str) -> Result<()> {
    if store.list_analysis_types().await?.is_empty() {
        store
            .upsert_analysis_type(&default_analysis_type(model))
            .await?;
    }
    Ok(())
}

/// Queue analysis jobs. With `ids`, exactly those conversations; otherwise
/// every conversation lacking a successful run for each analysis type.
/// Returns the number of jobs actually inserted.
pub async fn enqueue_analysis(
    store: &Store,
    config: &Config,
    ids: Option<Vec<String>>,
) -> Result<usize> {
    ensure_analysis_types(store, &config.llm.completion_model).await?;
    let types = store.list_analysis_types().await?;
    let mut queued = 0;

    for definition in &types {
        let conversation_ids: Vec<String> = match &ids {
            Some(ids) => ids.clone(),
            None => sqlx::query_scalar(
                "SELECT c.id FROM conversations c
                 LEFT JOIN analysis_runs r
                     ON r.conversation_id = c.id
                    AND r.analysis_type = ?
                    AND r.status = 'succeeded'
                 WHERE r.id IS NULL
                 ORDER BY c.started_at",
            )
            .bind(&definition.name)
            .fetch_all(store.pool())
            .await
            .map_err(crate::store::translate)?,
        };

        for conversation_id in conversation_ids {
            let created = store
                .enqueue_job(
                    JobKind::Analysis,
                    &conversation_id,
                    serde_json::json!({
                        "analysis_type": definition.name,
                        "model": definition.model,
                    }),
                )
                .await?;
            queued += created as usize;
        }
    }

    Ok(queued)
}

/// Queue embedding jobs for entities without a stored vector for the
/// configured model. Returns the number inserted.
pub async fn enqueue_embeddings(
    store: &Store,
    config: &Config,
    kind: JobKind,
    ids: Option<Vec<String>>,
) -> Result<usize> {
    let model = &config.llm.embedding_model;
    let (entity_type, source_sql) = match kind {
        JobKind::EmbeddingConversation => ("conversation", "SELECT id FROM conversations"),
        JobKind::EmbeddingFacet => ("facet", "SELECT id FROM facets"),
        JobKind::EmbeddingPerson => {
            ("person", "SELECT id FROM persons WHERE merged_into IS NULL")
        }
        JobKind::Analysis => {
            return Err(crate::error::ComputeError::Api(
                "analysis jobs are queued via enqueue_analysis".to_string(),
            )
            .into());
        }
    };

    let entity_ids: Vec<String> = match ids {
        Some(ids) => ids,
        None => {
            let sql = format!(
                "{source_sql} EXCEPT SELECT entity_id FROM embeddings
                 WHERE entity_type = ? AND model = ?"
            );
            sqlx::query_scalar(&sql)
                .bind(entity_type)
                .bind(model)
                .fetch_all(store.pool())
                .await
                .map_err(crate::store::translate)?
        }
    };

    let mut queued = 0;
    for entity_id in entity_ids {
        let created = store
            .enqueue_job(kind, &entity_id, serde_json::json!({ "model": model }))
            .await?;
        queued += created as usize;
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ComputeConfig, LlmConfig, WebhookConfig};
    use crate::store::jobs::JobStatus;
    use std::collections::BTreeMap;

    fn test_config() -> Config {
        Config {
            data_dir: std::env::temp_dir(),
            adapters: BTreeMap::new(),
            compute: ComputeConfig::default(),
            webhook: WebhookConfig::default(),
            llm: LlmConfig::default(),
        }
    }

    #[tokio::test]
    async fn enqueue_embeddings_by_ids_dedupes() {
        let store = Store::in_memory().await.expect("store");
        let config = test_config();

        let first = enqueue_embeddings(
            &store,
            &config,
            JobKind::EmbeddingConversation,
            Some(vec!["c1".to_string(), "c2".to_string()]),
        )
        .await
        .expect("enqueue");
        assert_eq!(first, 2);

        let second = enqueue_embeddings(
            &store,
            &config,
            JobKind::EmbeddingConversation,
            Some(vec!["c1".to_string()]),
        )
        .await
        .expect("enqueue again");
        assert_eq!(second, 0, "in-flight duplicate must not enqueue");

        assert_eq!(
            store
                .count_jobs(JobKind::EmbeddingConversation, JobStatus::Pending)
                .await
                .expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn ensure_analysis_types_seeds_once() {
        let store = Store::in_memory().await.expect("store");
        ensure_analysis_types(&store, "m1").await.expect("seed");
        ensure_analysis_types(&store, "m2").await.expect("seed again");

        let types = store.list_analysis_types().await.expect("list");
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].model, "m1", "existing definition is kept");
    }
}
