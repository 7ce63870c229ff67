//! Contacts adapter: folds `gogcli contacts list --json` cards into the
//! person graph. Cards with a hard identifier may create persons; cards
//! without one only enrich persons that already resolve.

use crate::adapter::gogcli::binary_on_path;
use crate::adapter::{Adapter, AdapterResult, Readiness, SyncContext};
use crate::config::AdapterOptions;
use crate::error::{ConfigError, Result, SyncError};
use crate::store::facts::FactSource;
use crate::Channel;
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

#[derive(Debug, Deserialize)]
struct ContactCard {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    phones: Vec<String>,
    #[serde(default)]
    organization: Option<String>,
    #[serde(default)]
    birthday: Option<String>,
}

pub struct GogcliContactsAdapter {
    name: String,
    account: String,
}

impl GogcliContactsAdapter {
    pub fn new(name: &str, options: &AdapterOptions) -> Result<Self> {
        let account = options.account.clone().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "adapter {name} (gogcli_contacts) requires options.account"
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            account,
        })
    }
}

#[async_trait]
impl Adapter for GogcliContactsAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "gogcli_contacts"
    }

    async fn prerequisites(&self) -> Readiness {
        if binary_on_path("gogcli") {
            Readiness::Ready
        } else {
            Readiness::Missing {
                what: "gogcli binary".to_string(),
                remediation: "install gogcli and authenticate the account".to_string(),
            }
        }
    }

    async fn sync(&self, ctx: &SyncContext, _full: bool) -> Result<AdapterResult> {
        let started = Instant::now();
        ctx.report("fetching", serde_json::json!({})).await?;
        ctx.check_cancelled()?;

        let output = tokio::process::Command::new("gogcli")
            .arg("contacts")
            .arg("list")
            .arg("--account")
            .arg(&self.account)
            .arg("--json")
            .output()
            .await
            .context("failed to run gogcli; is it installed?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Other(anyhow::anyhow!(
                "gogcli contacts list failed for {}: {}",
                self.account,
                stderr.trim()
            ))
            .into());
        }
        let cards: Vec<ContactCard> = serde_json::from_slice(&output.stdout)
            .context("gogcli contacts list produced invalid JSON")?;

        let mut result = AdapterResult::default();
        let mut facts_written: u64 = 0;

        for card in &cards {
            ctx.check_cancelled()?;

            // Every identifier on a card belongs to one human, so the whole
            // set attaches as one person.
            let identifiers: Vec<(Channel, String)> = card
                .emails
                .iter()
                .map(|email| (Channel::Email, email.clone()))
                .chain(card.phones.iter().map(|phone| (Channel::Sms, phone.clone())))
                .collect();
            if identifiers.is_empty() {
                // No hard identifier: nothing to safely attach to.
                continue;
            }

            let outcome = ctx
                .store
                .attach_person_identifiers(&identifiers, card.name.as_deref())
                .await?;
            result.persons_created += outcome.created_person as u64;
            let person_id = outcome.person_id;

            if let Some(name) = card.name.as_deref().filter(|n| !n.trim().is_empty()) {
                facts_written += ctx
                    .store
                    .insert_fact(
                        &person_id,
                        "profile",
                        "full_name",
                        name,
                        0.95,
                        FactSource::Import,
                        Some(serde_json::json!({ "adapter": self.name })),
                    )
                    .await? as u64;
            }
            if let Some(organization) = card.organization.as_deref() {
                facts_written += ctx
                    .store
                    .insert_fact(
                        &person_id,
                        "work",
                        "employer",
                        organization,
                        0.9,
                        FactSource::Import,
                        None,
                    )
                    .await? as u64;
            }
            if let Some(birthday) = card.birthday.as_deref() {
                facts_written += ctx
                    .store
                    .insert_fact(
                        &person_id,
                        "profile",
                        "birthdate",
                        birthday,
                        0.95,
                        FactSource::Import,
                        None,
                    )
                    .await? as u64;
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
            .perf
            .insert("cards".to_string(), serde_json::json!(cards.len()));
        result
            .perf
            .insert("facts".to_string(), serde_json::json!(facts_written));
        Ok(result)
    }
}
