//! Persons and identities: the canonical actor graph.
//!
//! `merged_into` is the union-find parent pointer; an active person is a tree
//! root. [`find_root`] compresses paths with a write-back inside the caller's
//! transaction, so reads after a merge converge to one hop.

use crate::error::{Result, StorageError};
use crate::resolve::normalize::normalize_identifier;
use crate::store::Store;
use crate::{Channel, new_id, now_ts};
use anyhow::Context as _;
use sqlx::{Row as _, SqliteConnection};

/// Canonical actor.
#[derive(Debug, Clone)]
pub struct Person {
    pub id: String,
    pub canonical_name: String,
    pub display_name: Option<String>,
    pub is_me: bool,
    pub merged_into: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Channel-scoped external handle belonging to one active person.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub person_id: String,
    pub channel: Channel,
    pub identifier: String,
    pub raw_identifier: String,
    pub confidence: f64,
    /// Identity ids folded into this one by merges, oldest first.
    pub provenance: Vec<String>,
    pub created_at: i64,
}

/// Result of attaching an identifier to the person graph.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub person_id: String,
    pub created_person: bool,
    pub created_identity: bool,
}

/// Collapse whitespace runs; the canonical-name normalization shared by every
/// adapter.
pub fn canonical_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Follow `merged_into` pointers to the active root, compressing the path
/// with a write-back inside the active transaction.
pub async fn find_root(conn: &mut SqliteConnection, person_id: &str) -> Result<String> {
    let mut chain = Vec::new();
    let mut current = person_id.to_string();

    loop {
        let parent: Option<Option<String>> =
            sqlx::query_scalar("SELECT merged_into FROM persons WHERE id = ?")
                .bind(&current)
                .fetch_optional(&mut *conn)
                .await
                .context("failed to read merged_into")?;

        let Some(parent) = parent else {
            return Err(StorageError::NotFound {
                kind: "person",
                id: current,
            }
            .into());
        };

        match parent {
            Some(next) => {
                chain.push(current.clone());
                current = next;
            }
            None => break,
        }
    }

    // Re-point every traversed tombstone directly at the root.
    for hop in &chain {
        sqlx::query("UPDATE persons SET merged_into = ? WHERE id = ? AND merged_into != ?")
            .bind(&current)
            .bind(hop)
            .bind(&current)
            .execute(&mut *conn)
            .await
            .context("failed to compress merge path")?;
    }

    Ok(current)
}

/// Fact type a channel's identifier materializes as.
pub fn hard_fact_type(channel: Channel) -> &'static str {
    match channel {
        Channel::Email | Channel::Gmail => "email_address",
        Channel::Sms | Channel::Imessage => "phone_number",
        Channel::Slack => "slack_id",
        _ => "handle",
    }
}

/// Attach a (channel, raw identifier) pair to the graph, creating the person
/// when the identifier is new. Idempotent on (channel, normalized identifier).
pub async fn attach_person(
    conn: &mut SqliteConnection,
    channel: Channel,
    raw_identifier: &str,
    display_name: Option<&str>,
) -> Result<AttachOutcome> {
    let identifier = normalize_identifier(channel, raw_identifier);

    let existing: Option<String> =
        sqlx::query_scalar("SELECT person_id FROM identities WHERE channel = ? AND identifier = ?")
            .bind(channel.as_str())
            .bind(&identifier)
            .fetch_optional(&mut *conn)
            .await
            .context("failed to look up identity")?;

    if let Some(person_id) = existing {
        let root = find_root(conn, &person_id).await?;
        return Ok(AttachOutcome {
            person_id: root,
            created_person: false,
            created_identity: false,
        });
    }

    let now = now_ts();
    let person_id = new_id();
    let name = display_name
        .map(canonical_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| identifier.clone());

    sqlx::query(
        "INSERT INTO persons (id, canonical_name, display_name, is_me, created_at, updated_at)
         VALUES (?, ?, ?, 0, ?, ?)",
    )
    .bind(&person_id)
    .bind(&name)
    .bind(display_name.map(canonical_name))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("failed to insert person")?;

    insert_identity(conn, &person_id, channel, &identifier, raw_identifier).await?;

    Ok(AttachOutcome {
        person_id,
        created_person: true,
        created_identity: true,
    })
}

/// Attach every identifier of one actor. The first identifier resolves (or
/// creates) the person; each remaining one becomes an identity on that person
/// when free. An identifier already owned by a different active person keeps
/// its identity there, and the value is recorded as a `hard_identity` fact on
/// this person instead, which is exactly what the hard-collision phase needs
/// to reunite the two.
pub async fn attach_person_identifiers(
    conn: &mut SqliteConnection,
    identifiers: &[(Channel, String)],
    display_name: Option<&str>,
) -> Result<AttachOutcome> {
    let Some((first_channel, first_raw)) = identifiers.first() else {
        return Err(StorageError::Constraint(
            "at least one identifier is required to attach a person".to_string(),
        )
        .into());
    };

    let outcome = attach_person(conn, *first_channel, first_raw, display_name).await?;

    for (channel, raw) in &identifiers[1..] {
        let identifier = normalize_identifier(*channel, raw);
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT person_id FROM identities WHERE channel = ? AND identifier = ?",
        )
        .bind(channel.as_str())
        .bind(&identifier)
        .fetch_optional(&mut *conn)
        .await
        .context("failed to look up identity")?;

        match owner {
            None => {
                insert_identity(conn, &outcome.person_id, *channel, &identifier, raw).await?;
            }
            Some(owner) => {
                let root = find_root(conn, &owner).await?;
                if root != outcome.person_id {
                    crate::store::facts::insert_fact(
                        conn,
                        &outcome.person_id,
                        "contact",
                        hard_fact_type(*channel),
                        &identifier,
                        1.0,
                        crate::store::facts::FactSource::HardIdentity,
                        Some(serde_json::json!({ "channel": channel.as_str() })),
                    )
                    .await?;
                }
            }
        }
    }

    Ok(outcome)
}

/// Insert an identity row plus its `hard_identity` fact. The fact carries the
/// identifier value so the resolver can match on it later.
pub async fn insert_identity(
    conn: &mut SqliteConnection,
    person_id: &str,
    channel: Channel,
    identifier: &str,
    raw_identifier: &str,
) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        "INSERT INTO identities (id, person_id, channel, identifier, raw_identifier, confidence, created_at)
         VALUES (?, ?, ?, ?, ?, 1.0, ?)",
    )
    .bind(new_id())
    .bind(person_id)
    .bind(channel.as_str())
    .bind(identifier)
    .bind(raw_identifier)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("failed to insert identity")?;

    crate::store::facts::insert_fact(
        conn,
        person_id,
        "contact",
        hard_fact_type(channel),
        identifier,
        1.0,
        crate::store::facts::FactSource::HardIdentity,
        Some(serde_json::json!({ "channel": channel.as_str() })),
    )
    .await?;

    Ok(())
}

fn person_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Person> {
    Ok(Person {
        id: row.try_get("id").context("failed to read person id")?,
        canonical_name: row
            .try_get("canonical_name")
            .context("failed to read canonical_name")?,
        display_name: row.try_get("display_name").ok(),
        is_me: row.try_get::<i64, _>("is_me").unwrap_or(0) != 0,
        merged_into: row.try_get("merged_into").ok(),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

fn identity_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Identity> {
    let channel: String = row.try_get("channel").context("failed to read channel")?;
    let provenance: String = row.try_get("provenance").unwrap_or_else(|_| "[]".to_string());
    Ok(Identity {
        id: row.try_get("id").context("failed to read identity id")?,
        person_id: row
            .try_get("person_id")
            .context("failed to read person_id")?,
        channel: Channel::parse(&channel)
            .with_context(|| format!("invalid channel in database: {channel}"))?,
        identifier: row
            .try_get("identifier")
            .context("failed to read identifier")?,
        raw_identifier: row
            .try_get("raw_identifier")
            .context("failed to read raw_identifier")?,
        confidence: row.try_get("confidence").unwrap_or(1.0),
        provenance: serde_json::from_str(&provenance).unwrap_or_default(),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
    })
}

impl Store {
    pub async fn get_person(&self, id: &str) -> Result<Option<Person>> {
        let row = sqlx::query("SELECT * FROM persons WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch person")?;
        row.map(person_from_row).transpose()
    }

    pub async fn list_active_persons(&self) -> Result<Vec<Person>> {
        let rows = sqlx::query(
            "SELECT * FROM persons WHERE merged_into IS NULL ORDER BY canonical_name, id",
        )
        .fetch_all(self.pool())
        .await
        .context("failed to list active persons")?;
        rows.into_iter().map(person_from_row).collect()
    }

    pub async fn identities_for_person(&self, person_id: &str) -> Result<Vec<Identity>> {
        let rows = sqlx::query("SELECT * FROM identities WHERE person_id = ? ORDER BY created_at")
            .bind(person_id)
            .fetch_all(self.pool())
            .await
            .context("failed to list identities")?;
        rows.into_iter().map(identity_from_row).collect()
    }

    /// Attach an identifier outside any larger transaction.
    pub async fn attach_person(
        &self,
        channel: Channel,
        raw_identifier: &str,
        display_name: Option<&str>,
    ) -> Result<AttachOutcome> {
        let mut tx = self.begin().await?;
        let outcome = attach_person(&mut tx, channel, raw_identifier, display_name).await?;
        tx.commit().await.context("failed to commit attach")?;
        Ok(outcome)
    }

    /// Attach one actor's full identifier set outside any larger transaction.
    pub async fn attach_person_identifiers(
        &self,
        identifiers: &[(Channel, String)],
        display_name: Option<&str>,
    ) -> Result<AttachOutcome> {
        let mut tx = self.begin().await?;
        let outcome = attach_person_identifiers(&mut tx, identifiers, display_name).await?;
        tx.commit().await.context("failed to commit attach")?;
        Ok(outcome)
    }

    pub async fn find_root(&self, person_id: &str) -> Result<String> {
        let mut tx = self.begin().await?;
        let root = find_root(&mut tx, person_id).await?;
        tx.commit().await.context("failed to commit path compression")?;
        Ok(root)
    }

    pub async fn mark_me(&self, person_id: &str) -> Result<()> {
        sqlx::query("UPDATE persons SET is_me = 1, updated_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(person_id)
            .execute(self.pool())
            .await
            .context("failed to mark person as me")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_is_idempotent_on_normalized_identifier() {
        let store = Store::in_memory().await.expect("store should open");

        let first = store
            .attach_person(Channel::Email, "Alice@X.com", Some("Alice Ng"))
            .await
            .expect("attach should succeed");
        assert!(first.created_person);

        let second = store
            .attach_person(Channel::Email, "alice@x.com", None)
            .await
            .expect("attach should succeed");
        assert!(!second.created_person);
        assert_eq!(second.person_id, first.person_id);

        let persons = store.list_active_persons().await.expect("list should work");
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].canonical_name, "Alice Ng");
    }

    #[tokio::test]
    async fn identifier_set_yields_one_person_with_every_identity() {
        let store = Store::in_memory().await.expect("store should open");

        let outcome = store
            .attach_person_identifiers(
                &[
                    (Channel::Email, "alice@x.com".to_string()),
                    (Channel::Sms, "+15551110000".to_string()),
                ],
                Some("Alice Ng"),
            )
            .await
            .expect("attach should succeed");
        assert!(outcome.created_person);

        let persons = store.list_active_persons().await.expect("list should work");
        assert_eq!(persons.len(), 1, "one actor must mint one person");

        let identities = store
            .identities_for_person(&outcome.person_id)
            .await
            .expect("identities");
        assert_eq!(identities.len(), 2);
    }

    #[tokio::test]
    async fn identifier_owned_elsewhere_becomes_a_collision_fact() {
        let store = Store::in_memory().await.expect("store should open");

        // The phone already belongs to another person.
        let other = store
            .attach_person(Channel::Sms, "+15551110000", Some("Mystery"))
            .await
            .expect("attach other");

        let outcome = store
            .attach_person_identifiers(
                &[
                    (Channel::Email, "alice@x.com".to_string()),
                    (Channel::Sms, "+15551110000".to_string()),
                ],
                Some("Alice Ng"),
            )
            .await
            .expect("attach should succeed");
        assert_ne!(outcome.person_id, other.person_id);

        // The phone identity stays put; the new person carries the value as
        // a hard-identity fact so the resolver can propose the merge.
        let identities = store
            .identities_for_person(&outcome.person_id)
            .await
            .expect("identities");
        assert_eq!(identities.len(), 1);

        let phone_fact = store
            .best_fact(&outcome.person_id, "phone_number")
            .await
            .expect("query")
            .expect("fact exists");
        assert_eq!(phone_fact.value, "+15551110000");
        assert_eq!(
            phone_fact.source,
            crate::store::facts::FactSource::HardIdentity
        );
    }

    #[tokio::test]
    async fn find_root_follows_and_compresses_merge_chain() {
        let store = Store::in_memory().await.expect("store should open");
        let a = store
            .attach_person(Channel::Email, "a@x.com", None)
            .await
            .expect("attach a");
        let b = store
            .attach_person(Channel::Email, "b@x.com", None)
            .await
            .expect("attach b");
        let c = store
            .attach_person(Channel::Email, "c@x.com", None)
            .await
            .expect("attach c");

        // a -> b -> c by hand.
        sqlx::query("UPDATE persons SET merged_into = ? WHERE id = ?")
            .bind(&b.person_id)
            .bind(&a.person_id)
            .execute(store.pool())
            .await
            .expect("link a->b");
        sqlx::query("UPDATE persons SET merged_into = ? WHERE id = ?")
            .bind(&c.person_id)
            .bind(&b.person_id)
            .execute(store.pool())
            .await
            .expect("link b->c");

        let root = store.find_root(&a.person_id).await.expect("find root");
        assert_eq!(root, c.person_id);

        // Path compression rewired a directly to c.
        let parent: Option<String> =
            sqlx::query_scalar("SELECT merged_into FROM persons WHERE id = ?")
                .bind(&a.person_id)
                .fetch_one(store.pool())
                .await
                .expect("read parent");
        assert_eq!(parent.as_deref(), Some(c.person_id.as_str()));
    }
}
