//! Analysis type definitions, runs, and facets.

use crate::error::Result;
use crate::store::Store;
use crate::{new_id, now_ts};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// Versioned analysis definition: prompt, output schema, facet mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisType {
    pub name: String,
    pub version: i64,
    pub prompt_template: String,
    pub output_schema: serde_json::Value,
    pub facet_mappings: Vec<FacetMapping>,
    pub model: String,
}

/// One JSON-path → facet-type mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetMapping {
    pub path: String,
    pub facet_type: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One analysis execution over a conversation.
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub id: String,
    pub conversation_id: String,
    pub analysis_type: String,
    pub status: RunStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Structured extracted value from a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facet {
    pub id: String,
    pub analysis_run_id: String,
    pub facet_type: String,
    pub value: String,
    pub confidence: f64,
    pub source_path: String,
    pub created_at: i64,
}

fn analysis_type_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AnalysisType> {
    let schema: String = row
        .try_get("output_schema")
        .context("failed to read output_schema")?;
    let mappings: String = row
        .try_get("facet_mappings")
        .unwrap_or_else(|_| "[]".to_string());
    Ok(AnalysisType {
        name: row.try_get("name").context("failed to read name")?,
        version: row.try_get("version").unwrap_or(1),
        prompt_template: row
            .try_get("prompt_template")
            .context("failed to read prompt_template")?,
        output_schema: serde_json::from_str(&schema).context("invalid output schema json")?,
        facet_mappings: serde_json::from_str(&mappings).context("invalid facet mappings json")?,
        model: row.try_get("model").context("failed to read model")?,
    })
}

fn run_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AnalysisRun> {
    let status: String = row.try_get("status").context("failed to read run status")?;
    let output: Option<String> = row.try_get("output").ok();
    Ok(AnalysisRun {
        id: row.try_get("id").context("failed to read run id")?,
        conversation_id: row
            .try_get("conversation_id")
            .context("failed to read conversation_id")?,
        analysis_type: row
            .try_get("analysis_type")
            .context("failed to read analysis_type")?,
        status: RunStatus::parse(&status)
            .with_context(|| format!("invalid run status in database: {status}"))?,
        output: output.and_then(|o| serde_json::from_str(&o).ok()),
        error: row.try_get("error").ok(),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

/// Write a successful run plus its facets inside the caller's transaction.
/// One run per (conversation, type): a re-run replaces output and facets.
pub async fn apply_run(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    analysis_type: &str,
    output: &serde_json::Value,
    facets: &[(String, String, f64, String)],
) -> Result<String> {
    let now = now_ts();

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM analysis_runs WHERE conversation_id = ? AND analysis_type = ?",
    )
    .bind(conversation_id)
    .bind(analysis_type)
    .fetch_optional(&mut *conn)
    .await
    .context("failed to look up analysis run")?;

    let run_id = match existing {
        Some(id) => {
            sqlx::query(
                "UPDATE analysis_runs SET status = 'succeeded', output = ?, error = NULL, updated_at = ?
                 WHERE id = ?",
            )
            .bind(output.to_string())
            .bind(now)
            .bind(&id)
            .execute(&mut *conn)
            .await
            .context("failed to update analysis run")?;
            sqlx::query("DELETE FROM facets WHERE analysis_run_id = ?")
                .bind(&id)
                .execute(&mut *conn)
                .await
                .context("failed to clear stale facets")?;
            id
        }
        None => {
            let id = new_id();
            sqlx::query(
                "INSERT INTO analysis_runs (id, conversation_id, analysis_type, status, output, created_at, updated_at)
                 VALUES (?, ?, ?, 'succeeded', ?, ?, ?)",
            )
            .bind(&id)
            .bind(conversation_id)
            .bind(analysis_type)
            .bind(output.to_string())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("failed to insert analysis run")?;
            id
        }
    };

    for (facet_type, value, confidence, source_path) in facets {
        sqlx::query(
            "INSERT INTO facets (id, analysis_run_id, facet_type, value, confidence, source_path, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(&run_id)
        .bind(facet_type)
        .bind(value)
        .bind(confidence)
        .bind(source_path)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("failed to insert facet")?;
    }

    Ok(run_id)
}

/// Record a failed run, preserving the raw output for later replay.
pub async fn record_failed_run(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    analysis_type: &str,
    raw_output: Option<&str>,
    error: &str,
) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        "INSERT INTO analysis_runs (id, conversation_id, analysis_type, status, output, error, created_at, updated_at)
         VALUES (?, ?, ?, 'failed', ?, ?, ?, ?)
         ON CONFLICT(conversation_id, analysis_type) DO UPDATE SET
             status = 'failed', output = excluded.output,
             error = excluded.error, updated_at = excluded.updated_at",
    )
    .bind(new_id())
    .bind(conversation_id)
    .bind(analysis_type)
    .bind(raw_output)
    .bind(error)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("failed to record failed run")?;
    Ok(())
}

impl Store {
    /// Register or update an analysis type definition.
    pub async fn upsert_analysis_type(&self, definition: &AnalysisType) -> Result<()> {
        sqlx::query(
            "INSERT INTO analysis_types (name, version, prompt_template, output_schema, facet_mappings, model)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 version = excluded.version,
                 prompt_template = excluded.prompt_template,
                 output_schema = excluded.output_schema,
                 facet_mappings = excluded.facet_mappings,
                 model = excluded.model",
        )
        .bind(&definition.name)
        .bind(definition.version)
        .bind(&definition.prompt_template)
        .bind(definition.output_schema.to_string())
        .bind(serde_json::to_string(&definition.facet_mappings).context("failed to serialize mappings")?)
        .bind(&definition.model)
        .execute(self.pool())
        .await
        .context("failed to upsert analysis type")?;
        Ok(())
    }

    pub async fn get_analysis_type(&self, name: &str) -> Result<Option<AnalysisType>> {
        let row = sqlx::query("SELECT * FROM analysis_types WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch analysis type")?;
        row.map(analysis_type_from_row).transpose()
    }

    pub async fn list_analysis_types(&self) -> Result<Vec<AnalysisType>> {
        let rows = sqlx::query("SELECT * FROM analysis_types ORDER BY name")
            .fetch_all(self.pool())
            .await
            .context("failed to list analysis types")?;
        rows.into_iter().map(analysis_type_from_row).collect()
    }

    pub async fn get_run(
        &self,
        conversation_id: &str,
        analysis_type: &str,
    ) -> Result<Option<AnalysisRun>> {
        let row = sqlx::query(
            "SELECT * FROM analysis_runs WHERE conversation_id = ? AND analysis_type = ?",
        )
        .bind(conversation_id)
        .bind(analysis_type)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch analysis run")?;
        row.map(run_from_row).transpose()
    }

    pub async fn facets_for_run(&self, run_id: &str) -> Result<Vec<Facet>> {
        let rows = sqlx::query("SELECT * FROM facets WHERE analysis_run_id = ? ORDER BY created_at")
            .bind(run_id)
            .fetch_all(self.pool())
            .await
            .context("failed to list facets")?;
        rows.into_iter()
            .map(|row| {
                Ok(Facet {
                    id: row.try_get("id").context("failed to read facet id")?,
                    analysis_run_id: row
                        .try_get("analysis_run_id")
                        .context("failed to read run id")?,
                    facet_type: row
                        .try_get("facet_type")
                        .context("failed to read facet_type")?,
                    value: row.try_get("value").context("failed to read value")?,
                    confidence: row.try_get("confidence").unwrap_or(0.0),
                    source_path: row
                        .try_get("source_path")
                        .context("failed to read source_path")?,
                    created_at: row.try_get("created_at").context("failed to read created_at")?,
                })
            })
            .collect()
    }

    /// Facets of succeeded runs paired with their conversation, for the
    /// resolver's fact-folding pass.
    pub async fn facets_with_conversations(&self) -> Result<Vec<(Facet, String)>> {
        let rows = sqlx::query(
            "SELECT f.*, r.conversation_id FROM facets f
             JOIN analysis_runs r ON r.id = f.analysis_run_id
             WHERE r.status = 'succeeded'
             ORDER BY f.created_at, f.id",
        )
        .fetch_all(self.pool())
        .await
        .context("failed to list facets")?;
        rows.into_iter()
            .map(|row| {
                let conversation_id: String = row
                    .try_get("conversation_id")
                    .context("failed to read conversation_id")?;
                Ok((
                    Facet {
                        id: row.try_get("id").context("failed to read facet id")?,
                        analysis_run_id: row
                            .try_get("analysis_run_id")
                            .context("failed to read run id")?,
                        facet_type: row
                            .try_get("facet_type")
                            .context("failed to read facet_type")?,
                        value: row.try_get("value").context("failed to read value")?,
                        confidence: row.try_get("confidence").unwrap_or(0.0),
                        source_path: row
                            .try_get("source_path")
                            .context("failed to read source_path")?,
                        created_at: row.try_get("created_at").context("failed to read created_at")?,
                    },
                    conversation_id,
                ))
            })
            .collect()
    }
}
