//! The three-phase resolver: hard collisions, compound matches, weighted
//! soft-evidence accumulation. Every invocation runs the phases in order and
//! upserts pending merge proposals.

use crate::error::Result;
use crate::store::proposals::{self, ProposalType};
use crate::store::Store;
use crate::resolve::normalize::{email_domain, is_generic_domain, phone_area_code};
use anyhow::Context as _;
use sqlx::Row as _;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Tunables for the resolver phases.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Soft-evidence proposal threshold.
    pub theta_soft: f64,

    /// Minimum matched compound predicates for a Phase B proposal.
    pub compound_min_predicates: usize,

    /// Compound score needed for auto-eligibility (plus one hard predicate).
    pub compound_auto_threshold: f64,

    /// Jaro-Winkler floor below which names carry no weight.
    pub name_similarity_floor: f64,

    /// How long a rejection suppresses re-proposal of the same pair.
    pub rejection_suppress_secs: i64,

    /// Soft-evidence weights; their sum bounds the Phase C score.
    pub w_name: f64,
    pub w_domain_location: f64,
    pub w_employer: f64,
    pub w_density: f64,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            theta_soft: 0.6,
            compound_min_predicates: 1,
            compound_auto_threshold: 0.9,
            name_similarity_floor: 0.85,
            rejection_suppress_secs: 90 * 24 * 3600,
            w_name: 0.35,
            w_domain_location: 0.20,
            w_employer: 0.20,
            w_density: 0.25,
        }
    }
}

/// Per-person fact snapshot the phases work from.
#[derive(Debug, Default, Clone)]
struct PersonFacts {
    canonical_name: String,
    created_at: i64,
    full_names: BTreeSet<String>,
    birthdates: BTreeSet<String>,
    employers: BTreeSet<String>,
    cities: BTreeSet<String>,
    emails: BTreeSet<String>,
    phones: BTreeSet<String>,
}

impl PersonFacts {
    fn domains(&self) -> BTreeSet<String> {
        self.emails
            .iter()
            .filter_map(|e| email_domain(e))
            .filter(|d| !is_generic_domain(d))
            .map(str::to_string)
            .collect()
    }

    fn area_codes(&self) -> BTreeSet<String> {
        self.phones
            .iter()
            .filter_map(|p| phone_area_code(p))
            .map(str::to_string)
            .collect()
    }
}

async fn load_person_facts(store: &Store) -> Result<HashMap<String, PersonFacts>> {
    let mut map: HashMap<String, PersonFacts> = HashMap::new();

    let persons = sqlx::query(
        "SELECT id, canonical_name, created_at FROM persons WHERE merged_into IS NULL",
    )
    .fetch_all(store.pool())
    .await
    .context("failed to load active persons")?;
    for row in persons {
        let id: String = row.try_get("id").context("failed to read person id")?;
        let entry = map.entry(id).or_default();
        entry.canonical_name = row.try_get("canonical_name").unwrap_or_default();
        entry.created_at = row.try_get("created_at").unwrap_or(0);
    }

    let facts = sqlx::query(
        "SELECT f.person_id, f.fact_type, f.value FROM facts f
         JOIN persons p ON p.id = f.person_id
         WHERE p.merged_into IS NULL
           AND f.fact_type IN ('full_name', 'birthdate', 'employer', 'city',
                               'email_address', 'phone_number', 'slack_id')",
    )
    .fetch_all(store.pool())
    .await
    .context("failed to load resolution facts")?;

    for row in facts {
        let person_id: String = row.try_get("person_id").context("failed to read person_id")?;
        let fact_type: String = row.try_get("fact_type").context("failed to read fact_type")?;
        let value: String = row.try_get("value").context("failed to read value")?;
        let Some(entry) = map.get_mut(&person_id) else {
            continue;
        };
        let value_lower = value.to_lowercase();
        match fact_type.as_str() {
            "full_name" => {
                entry.full_names.insert(value_lower);
            }
            "birthdate" => {
                entry.birthdates.insert(value_lower);
            }
            "employer" => {
                entry.employers.insert(value_lower);
            }
            "city" => {
                entry.cities.insert(value_lower);
            }
            "email_address" => {
                entry.emails.insert(value_lower);
            }
            "phone_number" => {
                entry.phones.insert(value);
            }
            _ => {}
        }
    }

    Ok(map)
}

/// Run all three phases; returns the number of proposals written or refreshed.
pub async fn run_phases(store: &Store, options: &ResolverOptions) -> Result<usize> {
    let mut proposed = 0;
    proposed += phase_hard_collisions(store).await?;

    let snapshot = load_person_facts(store).await?;
    proposed += phase_compound(store, options, &snapshot).await?;
    proposed += phase_soft(store, options, &snapshot).await?;
    Ok(proposed)
}

/// Phase A: active persons sharing a hard identifier value. Only facts
/// minted from identities themselves qualify; an address or number merely
/// quoted in a message body (source `import`) is a mention, not a handle,
/// and must never drive an auto-merge.
async fn phase_hard_collisions(store: &Store) -> Result<usize> {
    let rows = sqlx::query(
        "SELECT f.fact_type, f.value, f.person_id, p.created_at FROM facts f
         JOIN persons p ON p.id = f.person_id
         WHERE p.merged_into IS NULL
           AND f.source = 'hard_identity'
           AND f.fact_type IN ('email_address', 'phone_number', 'slack_id')
         ORDER BY f.fact_type, f.value, p.created_at, p.id",
    )
    .fetch_all(store.pool())
    .await
    .context("failed to scan hard identifiers")?;

    let mut groups: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for row in rows {
        let fact_type: String = row.try_get("fact_type").context("failed to read fact_type")?;
        let value: String = row.try_get("value").context("failed to read value")?;
        let person_id: String = row.try_get("person_id").context("failed to read person_id")?;
        let members = groups.entry((fact_type, value)).or_default();
        if !members.contains(&person_id) {
            members.push(person_id);
        }
    }

    let mut proposed = 0;
    for ((fact_type, value), members) in groups {
        if members.len() < 2 {
            continue;
        }
        tracing::debug!(%fact_type, %value, persons = members.len(), "hard identifier collision");

        // Oldest person wins as target.
        let target = &members[0];
        let evidence = serde_json::json!([{ "fact_type": fact_type, "value": value }]);
        let mut tx = store.begin().await?;
        for source in &members[1..] {
            proposals::upsert_proposal(
                &mut tx,
                source,
                target,
                ProposalType::HardCollision,
                1.0,
                &evidence,
                true,
            )
            .await?;
            proposed += 1;
        }
        tx.commit().await.context("failed to commit hard proposals")?;
    }
    Ok(proposed)
}

/// Phase B compound predicates: (weight, needs-hard-identifier).
fn compound_predicates(a: &PersonFacts, b: &PersonFacts) -> Vec<(&'static str, f64, bool)> {
    let mut matched = Vec::new();
    let shared_name = !a.full_names.is_disjoint(&b.full_names);

    if shared_name && !a.birthdates.is_disjoint(&b.birthdates) {
        matched.push(("full_name+birthdate", 0.5, false));
    }
    if shared_name
        && !a.employers.is_disjoint(&b.employers)
        && !a.cities.is_disjoint(&b.cities)
    {
        matched.push(("full_name+employer+city", 0.45, false));
    }
    if shared_name && !a.area_codes().is_disjoint(&b.area_codes()) {
        matched.push(("full_name+phone_area", 0.45, true));
    }
    matched
}

/// Phase B: propose when persons agree on enough compound predicates.
async fn phase_compound(
    store: &Store,
    options: &ResolverOptions,
    snapshot: &HashMap<String, PersonFacts>,
) -> Result<usize> {
    // Candidate pairs share at least one full legal name.
    let mut by_name: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, facts) in snapshot {
        for name in &facts.full_names {
            by_name.entry(name.as_str()).or_default().push(id.as_str());
        }
    }

    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut proposed = 0;
    for members in by_name.values() {
        for (i, a_id) in members.iter().enumerate() {
            for b_id in &members[i + 1..] {
                let (a_id, b_id) = order_pair(snapshot, a_id, b_id);
                if !seen.insert((a_id.to_string(), b_id.to_string())) {
                    continue;
                }
                let a = &snapshot[a_id];
                let b = &snapshot[b_id];

                let matched = compound_predicates(a, b);
                if matched.len() < options.compound_min_predicates {
                    continue;
                }
                let score: f64 = matched.iter().map(|(_, w, _)| w).sum::<f64>().min(1.0);
                let has_hard = matched.iter().any(|(_, _, hard)| *hard);
                let auto = score >= options.compound_auto_threshold && has_hard;

                if store
                    .recently_rejected(a_id, b_id, options.rejection_suppress_secs)
                    .await?
                {
                    tracing::debug!(source = %b_id, target = %a_id, "pair suppressed by rejection");
                    continue;
                }

                let evidence = serde_json::json!(
                    matched
                        .iter()
                        .map(|(name, weight, _)| serde_json::json!({ "predicate": name, "weight": weight }))
                        .collect::<Vec<_>>()
                );
                let mut tx = store.begin().await?;
                proposals::upsert_proposal(
                    &mut tx,
                    b_id,
                    a_id,
                    ProposalType::Compound,
                    score,
                    &evidence,
                    auto,
                )
                .await?;
                tx.commit().await.context("failed to commit compound proposal")?;
                proposed += 1;
            }
        }
    }
    Ok(proposed)
}

/// Phase C: weighted soft-evidence accumulation. Never auto-eligible.
async fn phase_soft(
    store: &Store,
    options: &ResolverOptions,
    snapshot: &HashMap<String, PersonFacts>,
) -> Result<usize> {
    let ids: Vec<&String> = snapshot.keys().collect();
    let mut proposed = 0;

    for (i, a_id) in ids.iter().enumerate() {
        for b_id in &ids[i + 1..] {
            let a = &snapshot[*a_id];
            let b = &snapshot[*b_id];

            let name_similarity = strsim::jaro_winkler(
                &a.canonical_name.to_lowercase(),
                &b.canonical_name.to_lowercase(),
            );
            let name_hit = name_similarity >= options.name_similarity_floor;

            let shared_domain = !a.domains().is_disjoint(&b.domains());
            let shared_location = !a.cities.is_disjoint(&b.cities);
            let domain_hit = shared_domain && shared_location;

            let employer_hit = !a.employers.is_disjoint(&b.employers);

            // Cheap signals first; only pairs with some signal pay for the
            // co-participation query.
            let base = name_hit as u8 + domain_hit as u8 + employer_hit as u8;
            if base == 0 {
                continue;
            }

            let shared = store.shared_event_count(a_id, b_id).await?;
            let a_events = store.event_count_for_person(a_id).await?;
            let b_events = store.event_count_for_person(b_id).await?;
            let density = if shared > 0 {
                (shared as f64 / a_events.min(b_events).max(1) as f64).clamp(0.0, 1.0)
            } else {
                0.0
            };

            let score = options.w_name * (name_hit as u8) as f64
                + options.w_domain_location * (domain_hit as u8) as f64
                + options.w_employer * (employer_hit as u8) as f64
                + options.w_density * density;

            if score < options.theta_soft {
                continue;
            }
            if store
                .recently_rejected(a_id, b_id, options.rejection_suppress_secs)
                .await?
            {
                continue;
            }

            let (target, source) = order_pair(snapshot, a_id, b_id);
            let proposal_type = match (name_hit, domain_hit, employer_hit) {
                (true, false, false) => ProposalType::NameSimilarity,
                (false, true, false) => ProposalType::SharedDomain,
                _ => ProposalType::SoftAccum,
            };
            let evidence = serde_json::json!([{
                "name_similarity": name_similarity,
                "shared_domain_location": domain_hit,
                "shared_employer": employer_hit,
                "co_participation_density": density,
            }]);

            let mut tx = store.begin().await?;
            proposals::upsert_proposal(
                &mut tx,
                source,
                target,
                proposal_type,
                score,
                &evidence,
                false,
            )
            .await?;
            tx.commit().await.context("failed to commit soft proposal")?;
            proposed += 1;
        }
    }
    Ok(proposed)
}

/// Stable target/source ordering: older person survives.
fn order_pair<'a>(
    snapshot: &HashMap<String, PersonFacts>,
    a: &'a str,
    b: &'a str,
) -> (&'a str, &'a str) {
    let a_created = snapshot.get(a).map(|f| f.created_at).unwrap_or(0);
    let b_created = snapshot.get(b).map(|f| f.created_at).unwrap_or(0);
    if (a_created, a) <= (b_created, b) {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::facts::FactSource;
    use crate::store::proposals::ProposalStatus;
    use crate::Channel;

    async fn person_with(
        store: &Store,
        email: &str,
        name: &str,
        facts: &[(&str, &str)],
    ) -> String {
        let outcome = store
            .attach_person(Channel::Email, email, Some(name))
            .await
            .expect("attach");
        for (fact_type, value) in facts {
            store
                .insert_fact(
                    &outcome.person_id,
                    "profile",
                    fact_type,
                    value,
                    0.9,
                    FactSource::Import,
                    None,
                )
                .await
                .expect("fact");
        }
        outcome.person_id
    }

    /// A fact as the identity graph itself mints it.
    async fn hard_fact(store: &Store, person_id: &str, fact_type: &str, value: &str) {
        store
            .insert_fact(
                person_id,
                "contact",
                fact_type,
                value,
                1.0,
                FactSource::HardIdentity,
                None,
            )
            .await
            .expect("hard fact");
    }

    #[tokio::test]
    async fn hard_collision_proposes_auto_merge_with_score_one() {
        let store = Store::in_memory().await.expect("store");
        let a = person_with(&store, "a@x.com", "A", &[]).await;
        let b = person_with(&store, "b@y.com", "B", &[]).await;
        hard_fact(&store, &a, "phone_number", "+15552223333").await;
        hard_fact(&store, &b, "phone_number", "+15552223333").await;

        let proposed = run_phases(&store, &ResolverOptions::default())
            .await
            .expect("phases");
        assert!(proposed >= 1);

        let pending = store
            .list_proposals(Some(ProposalStatus::Pending), 10)
            .await
            .expect("list");
        let hard = pending
            .iter()
            .find(|p| p.proposal_type == ProposalType::HardCollision)
            .expect("hard collision proposal");
        assert!((hard.score - 1.0).abs() < f64::EPSILON);
        assert!(hard.auto_eligible);
        assert!(
            (hard.source_person_id == a && hard.target_person_id == b)
                || (hard.source_person_id == b && hard.target_person_id == a)
        );
    }

    #[tokio::test]
    async fn compound_name_birthdate_and_phone_area_is_auto() {
        let store = Store::in_memory().await.expect("store");
        person_with(
            &store,
            "jd@x.com",
            "J Doe",
            &[
                ("full_name", "Jane Doe"),
                ("birthdate", "1990-04-01"),
                ("phone_number", "+15551234567"),
            ],
        )
        .await;
        person_with(
            &store,
            "jane@w.com",
            "Jane",
            &[
                ("full_name", "Jane Doe"),
                ("birthdate", "1990-04-01"),
                ("phone_number", "+15559876543"),
            ],
        )
        .await;

        run_phases(&store, &ResolverOptions::default())
            .await
            .expect("phases");

        let pending = store
            .list_proposals(Some(ProposalStatus::Pending), 10)
            .await
            .expect("list");
        let compound = pending
            .iter()
            .find(|p| p.proposal_type == ProposalType::Compound)
            .expect("compound proposal");
        // name+birthdate (0.5) + name+phone_area (0.45) = 0.95, with a hard
        // predicate, so it is auto-eligible.
        assert!(compound.score >= 0.9);
        assert!(compound.auto_eligible);
    }

    #[tokio::test]
    async fn soft_accumulation_needs_threshold_and_never_auto() {
        let store = Store::in_memory().await.expect("store");
        person_with(
            &store,
            "jo.smith@initrode.com",
            "Jo Smith",
            &[("employer", "Initrode"), ("city", "Portland")],
        )
        .await;
        person_with(
            &store,
            "josmith@initrode.com",
            "Jo Smyth",
            &[("employer", "Initrode"), ("city", "Portland")],
        )
        .await;

        run_phases(&store, &ResolverOptions::default())
            .await
            .expect("phases");

        let pending = store
            .list_proposals(Some(ProposalStatus::Pending), 10)
            .await
            .expect("list");
        let soft = pending
            .iter()
            .find(|p| {
                matches!(
                    p.proposal_type,
                    ProposalType::SoftAccum | ProposalType::NameSimilarity
                )
            })
            .expect("soft proposal");
        assert!(soft.score >= 0.6);
        assert!(!soft.auto_eligible);
    }

    #[tokio::test]
    async fn quoted_pii_never_triggers_a_hard_collision() {
        let store = Store::in_memory().await.expect("store");
        // Both people quoted the same support number in a message body; the
        // resulting import-sourced facts must stay inert.
        person_with(&store, "a@x.com", "A", &[]).await;
        person_with(&store, "b@y.com", "B", &[]).await;
        for person in store.list_active_persons().await.expect("list") {
            store
                .insert_fact(
                    &person.id,
                    "contact",
                    "phone_number",
                    "+15559990000",
                    0.6,
                    FactSource::Import,
                    None,
                )
                .await
                .expect("import fact");
        }

        run_phases(&store, &ResolverOptions::default())
            .await
            .expect("phases");

        let pending = store
            .list_proposals(Some(ProposalStatus::Pending), 10)
            .await
            .expect("list");
        assert!(
            !pending
                .iter()
                .any(|p| p.proposal_type == ProposalType::HardCollision),
            "import-sourced mentions must not produce hard collisions"
        );
    }

    #[tokio::test]
    async fn rejection_suppresses_reproposal() {
        let store = Store::in_memory().await.expect("store");
        let a = person_with(&store, "a@x.com", "A", &[]).await;
        let b = person_with(&store, "b@y.com", "B", &[]).await;
        hard_fact(&store, &a, "phone_number", "+15550001111").await;
        hard_fact(&store, &b, "phone_number", "+15550001111").await;

        run_phases(&store, &ResolverOptions::default())
            .await
            .expect("phases");
        let pending = store
            .list_proposals(Some(ProposalStatus::Pending), 10)
            .await
            .expect("list");
        // Phase A ignores rejection history (hard identifiers always
        // surface); reject the compound/soft path instead by checking the
        // suppression query directly.
        let proposal = &pending[0];
        store
            .set_proposal_status(&proposal.id, ProposalStatus::Rejected)
            .await
            .expect("reject");

        assert!(
            store
                .recently_rejected(
                    &proposal.source_person_id,
                    &proposal.target_person_id,
                    90 * 24 * 3600
                )
                .await
                .expect("check")
        );
    }
}
