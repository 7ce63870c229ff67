//! Schema DDL and versioned migration.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;

const SCHEMA_VERSION: i64 = 1;

const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS persons (
    id TEXT PRIMARY KEY,
    canonical_name TEXT NOT NULL,
    display_name TEXT,
    is_me INTEGER NOT NULL DEFAULT 0,
    merged_into TEXT REFERENCES persons(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS persons_merged_into ON persons(merged_into);

CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    person_id TEXT NOT NULL REFERENCES persons(id),
    channel TEXT NOT NULL,
    identifier TEXT NOT NULL,
    raw_identifier TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    provenance TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    UNIQUE(channel, identifier)
);
CREATE INDEX IF NOT EXISTS identities_person ON identities(person_id);

CREATE TABLE IF NOT EXISTS person_tags (
    person_id TEXT NOT NULL REFERENCES persons(id),
    tag TEXT NOT NULL,
    PRIMARY KEY (person_id, tag)
);

CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    external_id TEXT NOT NULL,
    title TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(channel, external_id)
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    adapter TEXT NOT NULL,
    external_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    content_types TEXT NOT NULL DEFAULT '[]',
    content TEXT,
    direction TEXT NOT NULL,
    thread_id TEXT REFERENCES threads(id),
    reply_to TEXT,
    payload_hash TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(adapter, external_id)
);
CREATE INDEX IF NOT EXISTS events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS events_thread ON events(thread_id);
CREATE INDEX IF NOT EXISTS events_channel_ts ON events(channel, timestamp);

CREATE TABLE IF NOT EXISTS participants (
    event_id TEXT NOT NULL REFERENCES events(id),
    person_id TEXT NOT NULL REFERENCES persons(id),
    role TEXT NOT NULL,
    PRIMARY KEY (event_id, person_id, role)
);
CREATE INDEX IF NOT EXISTS participants_person ON participants(person_id);

CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    person_id TEXT NOT NULL REFERENCES persons(id),
    category TEXT NOT NULL,
    fact_type TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL,
    source TEXT NOT NULL,
    evidence TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(person_id, fact_type, value)
);
CREATE INDEX IF NOT EXISTS facts_type_value ON facts(fact_type, value);

CREATE TABLE IF NOT EXISTS unattributed_facts (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    fact_type TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL,
    shared_by_person_id TEXT,
    context TEXT,
    candidate_person_ids TEXT NOT NULL DEFAULT '[]',
    resolved_person_id TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS unattributed_unresolved
    ON unattributed_facts(resolved_person_id) WHERE resolved_person_id IS NULL;

CREATE TABLE IF NOT EXISTS merge_proposals (
    id TEXT PRIMARY KEY,
    source_person_id TEXT NOT NULL REFERENCES persons(id),
    target_person_id TEXT NOT NULL REFERENCES persons(id),
    proposal_type TEXT NOT NULL,
    score REAL NOT NULL,
    evidence TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    auto_eligible INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS merge_proposals_pending_pair
    ON merge_proposals(source_person_id, target_person_id, proposal_type)
    WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS merge_proposals_status ON merge_proposals(status);

CREATE TABLE IF NOT EXISTS compute_jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT '{}',
    params_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    lease_expires_at INTEGER,
    worker_id TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS compute_jobs_inflight
    ON compute_jobs(kind, entity_id, params_hash)
    WHERE status IN ('pending', 'leased');
CREATE INDEX IF NOT EXISTS compute_jobs_pending
    ON compute_jobs(kind, created_at) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS analysis_types (
    name TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    prompt_template TEXT NOT NULL,
    output_schema TEXT NOT NULL,
    facet_mappings TEXT NOT NULL DEFAULT '[]',
    model TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS analysis_runs (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    analysis_type TEXT NOT NULL REFERENCES analysis_types(name),
    status TEXT NOT NULL,
    output TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(conversation_id, analysis_type)
);

CREATE TABLE IF NOT EXISTS facets (
    id TEXT PRIMARY KEY,
    analysis_run_id TEXT NOT NULL REFERENCES analysis_runs(id),
    facet_type TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL,
    source_path TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS facets_run ON facets(analysis_run_id);

CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    model TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(entity_type, entity_id, model)
);

CREATE TABLE IF NOT EXISTS chunk_definitions (
    name TEXT PRIMARY KEY,
    channel TEXT,
    strategy TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    description TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    definition TEXT NOT NULL REFERENCES chunk_definitions(name),
    channel TEXT,
    thread_id TEXT,
    first_event_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(definition, first_event_id)
);

CREATE TABLE IF NOT EXISTS conversation_events (
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    event_id TEXT NOT NULL REFERENCES events(id),
    position INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, event_id),
    UNIQUE(conversation_id, position)
);

CREATE TABLE IF NOT EXISTS bus_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    adapter TEXT,
    comms_event_id TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_jobs (
    adapter TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'idle',
    phase TEXT,
    cursor TEXT,
    progress TEXT NOT NULL DEFAULT '{}',
    last_error TEXT,
    lease_expires_at INTEGER,
    started_at INTEGER,
    updated_at INTEGER NOT NULL
);
"#;

/// Create or upgrade the schema. Each version applies as one batch; the
/// recorded version is bumped in the same pass.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await
            .unwrap_or(None);
    let current: i64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);

    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    if current < 1 {
        sqlx::raw_sql(MIGRATION_V1)
            .execute(pool)
            .await
            .context("failed to apply schema v1")?;
    }

    sqlx::query(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await
    .context("failed to record schema version")?;

    Ok(())
}
