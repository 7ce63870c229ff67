//! Facts and the unattributed-fact pool.

use crate::error::Result;
use crate::store::Store;
use crate::{new_id, now_ts};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// Where a fact came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    HardIdentity,
    Analysis,
    Manual,
    Import,
}

impl FactSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FactSource::HardIdentity => "hard_identity",
            FactSource::Analysis => "analysis",
            FactSource::Manual => "manual",
            FactSource::Import => "import",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hard_identity" => Some(FactSource::HardIdentity),
            "analysis" => Some(FactSource::Analysis),
            "manual" => Some(FactSource::Manual),
            "import" => Some(FactSource::Import),
            _ => None,
        }
    }
}

impl std::fmt::Display for FactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A claim about a person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub person_id: String,
    pub category: String,
    pub fact_type: String,
    pub value: String,
    pub confidence: f64,
    pub source: FactSource,
    pub evidence: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A fact whose owning person could not be determined at extraction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnattributedFact {
    pub id: String,
    pub category: String,
    pub fact_type: String,
    pub value: String,
    pub confidence: f64,
    pub shared_by_person_id: Option<String>,
    pub context: Option<String>,
    pub candidate_person_ids: Vec<String>,
    pub resolved_person_id: Option<String>,
    pub created_at: i64,
}

/// Insert a fact, idempotent on (person, type, value). A re-insert refreshes
/// confidence (keeping the max) and recency. Returns true only when a new
/// row was created.
#[allow(clippy::too_many_arguments)]
pub async fn insert_fact(
    conn: &mut SqliteConnection,
    person_id: &str,
    category: &str,
    fact_type: &str,
    value: &str,
    confidence: f64,
    source: FactSource,
    evidence: Option<serde_json::Value>,
) -> Result<bool> {
    let now = now_ts();
    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM facts WHERE person_id = ? AND fact_type = ? AND value = ?",
    )
    .bind(person_id)
    .bind(fact_type)
    .bind(value)
    .fetch_optional(&mut *conn)
    .await
    .context("failed to check fact natural key")?;

    if let Some(id) = existing {
        sqlx::query(
            "UPDATE facts SET confidence = MAX(confidence, ?), updated_at = ? WHERE id = ?",
        )
        .bind(confidence)
        .bind(now)
        .bind(&id)
        .execute(&mut *conn)
        .await
        .context("failed to refresh fact")?;
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO facts (id, person_id, category, fact_type, value, confidence, source, evidence, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(person_id)
    .bind(category)
    .bind(fact_type)
    .bind(value)
    .bind(confidence)
    .bind(source.as_str())
    .bind(evidence.map(|e| e.to_string()))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("failed to insert fact")?;

    Ok(true)
}

/// Record a fact that cannot be attributed yet.
pub async fn insert_unattributed(
    conn: &mut SqliteConnection,
    fact: &UnattributedFact,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO unattributed_facts
             (id, category, fact_type, value, confidence, shared_by_person_id, context, candidate_person_ids, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&fact.id)
    .bind(&fact.category)
    .bind(&fact.fact_type)
    .bind(&fact.value)
    .bind(fact.confidence)
    .bind(&fact.shared_by_person_id)
    .bind(&fact.context)
    .bind(serde_json::to_string(&fact.candidate_person_ids).context("failed to serialize candidates")?)
    .bind(fact.created_at)
    .execute(&mut *conn)
    .await
    .context("failed to insert unattributed fact")?;
    Ok(())
}

fn fact_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Fact> {
    let source: String = row.try_get("source").context("failed to read fact source")?;
    let evidence: Option<String> = row.try_get("evidence").ok();
    Ok(Fact {
        id: row.try_get("id").context("failed to read fact id")?,
        person_id: row.try_get("person_id").context("failed to read person_id")?,
        category: row.try_get("category").context("failed to read category")?,
        fact_type: row.try_get("fact_type").context("failed to read fact_type")?,
        value: row.try_get("value").context("failed to read value")?,
        confidence: row.try_get("confidence").unwrap_or(0.0),
        source: FactSource::parse(&source)
            .with_context(|| format!("invalid fact source in database: {source}"))?,
        evidence: evidence.and_then(|e| serde_json::from_str(&e).ok()),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

fn unattributed_from_row(row: sqlx::sqlite::SqliteRow) -> Result<UnattributedFact> {
    let candidates: String = row
        .try_get("candidate_person_ids")
        .unwrap_or_else(|_| "[]".to_string());
    Ok(UnattributedFact {
        id: row.try_get("id").context("failed to read id")?,
        category: row.try_get("category").context("failed to read category")?,
        fact_type: row.try_get("fact_type").context("failed to read fact_type")?,
        value: row.try_get("value").context("failed to read value")?,
        confidence: row.try_get("confidence").unwrap_or(0.0),
        shared_by_person_id: row.try_get("shared_by_person_id").ok(),
        context: row.try_get("context").ok(),
        candidate_person_ids: serde_json::from_str(&candidates).unwrap_or_default(),
        resolved_person_id: row.try_get("resolved_person_id").ok(),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
    })
}

impl Store {
    pub async fn facts_for_person(&self, person_id: &str) -> Result<Vec<Fact>> {
        let rows = sqlx::query(
            "SELECT * FROM facts WHERE person_id = ? ORDER BY confidence DESC, updated_at DESC",
        )
        .bind(person_id)
        .fetch_all(self.pool())
        .await
        .context("failed to list facts")?;
        rows.into_iter().map(fact_from_row).collect()
    }

    /// The best current claim for one fact type, reconciled by confidence
    /// then recency.
    pub async fn best_fact(&self, person_id: &str, fact_type: &str) -> Result<Option<Fact>> {
        let row = sqlx::query(
            "SELECT * FROM facts WHERE person_id = ? AND fact_type = ?
             ORDER BY confidence DESC, updated_at DESC LIMIT 1",
        )
        .bind(person_id)
        .bind(fact_type)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch best fact")?;
        row.map(fact_from_row).transpose()
    }

    pub async fn insert_fact(
        &self,
        person_id: &str,
        category: &str,
        fact_type: &str,
        value: &str,
        confidence: f64,
        source: FactSource,
        evidence: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let inserted = insert_fact(
            &mut tx, person_id, category, fact_type, value, confidence, source, evidence,
        )
        .await?;
        tx.commit().await.context("failed to commit fact insert")?;
        Ok(inserted)
    }

    pub async fn unresolved_facts(&self, limit: i64) -> Result<Vec<UnattributedFact>> {
        let rows = sqlx::query(
            "SELECT * FROM unattributed_facts WHERE resolved_person_id IS NULL
             ORDER BY created_at LIMIT ?",
        )
        .bind(limit.clamp(1, 10_000))
        .fetch_all(self.pool())
        .await
        .context("failed to list unattributed facts")?;
        rows.into_iter().map(unattributed_from_row).collect()
    }

    /// Attribute an unattributed fact to a person: marks the pool row resolved
    /// and materializes the fact, atomically.
    pub async fn attribute_fact(&self, unattributed_id: &str, person_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT * FROM unattributed_facts WHERE id = ?")
            .bind(unattributed_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to fetch unattributed fact")?;
        let Some(row) = row else {
            return Err(crate::error::StorageError::NotFound {
                kind: "unattributed_fact",
                id: unattributed_id.to_string(),
            }
            .into());
        };
        let fact = unattributed_from_row(row)?;

        insert_fact(
            &mut tx,
            person_id,
            &fact.category,
            &fact.fact_type,
            &fact.value,
            fact.confidence,
            FactSource::Analysis,
            fact.context
                .as_deref()
                .map(|c| serde_json::json!({ "context": c })),
        )
        .await?;

        sqlx::query("UPDATE unattributed_facts SET resolved_person_id = ? WHERE id = ?")
            .bind(person_id)
            .bind(unattributed_id)
            .execute(&mut *tx)
            .await
            .context("failed to mark unattributed fact resolved")?;

        tx.commit().await.context("failed to commit attribution")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Channel;

    #[tokio::test]
    async fn fact_insert_is_idempotent_and_keeps_max_confidence() {
        let store = Store::in_memory().await.expect("store should open");
        let person = store
            .attach_person(Channel::Email, "kim@x.com", Some("Kim"))
            .await
            .expect("attach");

        store
            .insert_fact(
                &person.person_id,
                "work",
                "employer",
                "Initrode",
                0.9,
                FactSource::Analysis,
                None,
            )
            .await
            .expect("first insert");
        store
            .insert_fact(
                &person.person_id,
                "work",
                "employer",
                "Initrode",
                0.5,
                FactSource::Analysis,
                None,
            )
            .await
            .expect("second insert");

        let best = store
            .best_fact(&person.person_id, "employer")
            .await
            .expect("query")
            .expect("fact should exist");
        assert!((best.confidence - 0.9).abs() < f64::EPSILON);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM facts WHERE person_id = ? AND fact_type = 'employer'",
        )
        .bind(&person.person_id)
        .fetch_one(store.pool())
        .await
        .expect("count");
        assert_eq!(count, 1);
    }
}
