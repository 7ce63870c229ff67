//! Embedding vectors, stored as tight little-endian f64 blobs.

use crate::error::Result;
use crate::store::Store;
use crate::{new_id, now_ts};
use anyhow::Context as _;
use sqlx::{Row as _, SqliteConnection};

/// A stored semantic vector.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub model: String,
    pub vector: Vec<f64>,
    pub created_at: i64,
}

/// Encode a vector as a tight little-endian f64 blob.
pub fn encode_vector(vector: &[f64]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 8);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a blob back into f64s. `dim = len / 8`; trailing partial floats are
/// rejected.
pub fn decode_vector(blob: &[u8]) -> Result<Vec<f64>> {
    if blob.len() % 8 != 0 {
        return Err(crate::error::StorageError::Corrupt(format!(
            "embedding blob length {} is not a multiple of 8",
            blob.len()
        ))
        .into());
    }
    Ok(blob
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes")))
        .collect())
}

/// Upsert a vector inside the caller's transaction, keyed on
/// (entity type, entity id, model).
pub async fn upsert_embedding(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: &str,
    model: &str,
    vector: &[f64],
) -> Result<()> {
    sqlx::query(
        "INSERT INTO embeddings (id, entity_type, entity_id, model, dim, vector, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(entity_type, entity_id, model) DO UPDATE SET
             dim = excluded.dim, vector = excluded.vector, created_at = excluded.created_at",
    )
    .bind(new_id())
    .bind(entity_type)
    .bind(entity_id)
    .bind(model)
    .bind(vector.len() as i64)
    .bind(encode_vector(vector))
    .bind(now_ts())
    .execute(&mut *conn)
    .await
    .context("failed to upsert embedding")?;
    Ok(())
}

impl Store {
    pub async fn get_embedding(
        &self,
        entity_type: &str,
        entity_id: &str,
        model: &str,
    ) -> Result<Option<Embedding>> {
        let row = sqlx::query(
            "SELECT * FROM embeddings WHERE entity_type = ? AND entity_id = ? AND model = ?",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(model)
        .fetch_optional(self.pool())
        .await
        .context("failed to fetch embedding")?;

        row.map(|row| {
            let blob: Vec<u8> = row.try_get("vector").context("failed to read vector blob")?;
            Ok(Embedding {
                id: row.try_get("id").context("failed to read embedding id")?,
                entity_type: row
                    .try_get("entity_type")
                    .context("failed to read entity_type")?,
                entity_id: row
                    .try_get("entity_id")
                    .context("failed to read entity_id")?,
                model: row.try_get("model").context("failed to read model")?,
                vector: decode_vector(&blob)?,
                created_at: row.try_get("created_at").context("failed to read created_at")?,
            })
        })
        .transpose()
    }

    pub async fn count_embeddings(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(self.pool())
            .await
            .context("failed to count embeddings")
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_codec_is_tight_little_endian() {
        let vector = vec![0.0, 1.5, -2.25];
        let blob = encode_vector(&vector);
        assert_eq!(blob.len(), 24);
        assert_eq!(&blob[8..16], &1.5f64.to_le_bytes());

        let decoded = decode_vector(&blob).expect("decode should succeed");
        assert_eq!(decoded, vector);
    }

    #[test]
    fn ragged_blob_is_rejected() {
        assert!(decode_vector(&[0u8; 9]).is_err());
    }

    #[tokio::test]
    async fn upsert_replaces_by_natural_key() {
        let store = Store::in_memory().await.expect("store should open");

        let mut tx = store.begin().await.expect("begin");
        upsert_embedding(&mut tx, "conversation", "conv-1", "small", &[1.0, 2.0])
            .await
            .expect("insert");
        upsert_embedding(&mut tx, "conversation", "conv-1", "small", &[3.0])
            .await
            .expect("replace");
        tx.commit().await.expect("commit");

        let stored = store
            .get_embedding("conversation", "conv-1", "small")
            .await
            .expect("get")
            .expect("embedding exists");
        assert_eq!(stored.vector, vec![3.0]);
        assert_eq!(store.count_embeddings().await.expect("count"), 1);
    }
}
