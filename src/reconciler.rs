//! # Reconciler
//!
//! Turns an [`Observation`] into the identity of its cluster. The pass is
//! read → plan → commit:
//!
//! 1. find every row matching the email or phone;
//! 2. fetch the full clusters of every root those rows claim, following links
//!    up and down until the set is closed;
//! 3. union the working set and pick the most senior primary as the root;
//! 4. plan relinks for every other member not already a secondary of that root,
//!    and one secondary insert carrying only the values the cluster lacks;
//! 5. commit the plan as one batch and report the post-commit cluster.
//!
//! A stale plan is rejected by the store as a conflict and the whole pass is
//! repeated against current state.

use crate::config::ReconcileConfig;
use crate::dsu::LinkForest;
use crate::error::{ReconcileError, StoreError};
use crate::matcher;
use crate::model::{Contact, ContactId, IdentityView, NewContact, Observation};
use crate::store::{ContactBatch, ContactStore, Relink};
use crate::view::identity_view;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a reconciliation did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing matched; a new primary was created.
    CreatedPrimary(ContactId),
    /// The observation carried no new information and joined no clusters.
    Unchanged,
    /// Clusters were merged and/or a secondary was inserted.
    Linked {
        inserted: Option<ContactId>,
        relinked: usize,
    },
}

impl Outcome {
    pub fn wrote(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

/// Result of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub view: IdentityView,
    pub outcome: Outcome,
}

/// Mutations required to fold a working set into one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// The canonical primary, as read.
    pub root: Contact,
    pub batch: ContactBatch,
}

/// Plan the merge of `working` (the full clusters touched by `observation`).
///
/// Every member other than the root that is not already a secondary of the root
/// gets a relink, which also flattens members of a demoted primary onto the new
/// root. The insert carries only the email/phone values absent from the set.
pub fn plan_merge(
    observation: &Observation,
    working: &[Contact],
) -> Result<MergePlan, ReconcileError> {
    let mut forest = LinkForest::from_contacts(working);
    let root_id = forest
        .merge_all(working.iter().map(|c| c.id))
        .ok_or_else(|| ReconcileError::Inconsistent("empty working set".to_string()))?;
    let root = working
        .iter()
        .find(|c| c.id == root_id)
        .cloned()
        .ok_or_else(|| ReconcileError::Inconsistent(format!("root {root_id} not in working set")))?;

    let mut relinks = Vec::new();
    if !root.is_primary() || root.linked_id.is_some() {
        relinks.push(Relink::to_primary(&root));
    }
    for contact in working {
        if contact.id == root_id {
            continue;
        }
        if !contact.has_link(crate::model::LinkPrecedence::Secondary, Some(root_id)) {
            relinks.push(Relink::to_secondary(contact, root_id));
        }
    }

    let new_email = observation
        .email()
        .filter(|email| !working.iter().any(|c| c.email.as_deref() == Some(*email)));
    let new_phone = observation
        .phone_number()
        .filter(|phone| !working.iter().any(|c| c.phone_number.as_deref() == Some(*phone)));
    let insert = if new_email.is_some() || new_phone.is_some() {
        Some(NewContact::secondary(
            root_id,
            new_email.map(str::to_string),
            new_phone.map(str::to_string),
        ))
    } else {
        None
    };

    Ok(MergePlan {
        root,
        batch: ContactBatch {
            root: Some(root_id),
            relinks,
            insert,
        },
    })
}

/// Stateful reconciliation over a [`ContactStore`].
#[derive(Debug, Clone)]
pub struct Reconciler<S> {
    store: S,
    config: ReconcileConfig,
}

impl<S: ContactStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ReconcileConfig::default())
    }

    pub fn with_config(store: S, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconcile with no deadline.
    pub fn reconcile(&self, observation: &Observation) -> Result<Reconciliation, ReconcileError> {
        self.reconcile_until(observation, None)
    }

    /// Reconcile, abandoning the pass without writing if `deadline` passes
    /// before the commit starts. A committed pass is final.
    #[instrument(level = "debug", skip(self, observation))]
    pub fn reconcile_until(
        &self,
        observation: &Observation,
        deadline: Option<Instant>,
    ) -> Result<Reconciliation, ReconcileError> {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.attempt(observation, deadline) {
                Err(ReconcileError::Store(StoreError::Conflict(kind))) => {
                    warn!(attempt, %kind, "commit conflict; re-reading current state");
                }
                other => return other,
            }
        }
        Err(ReconcileError::ConflictRetriesExhausted { attempts })
    }

    fn attempt(
        &self,
        observation: &Observation,
        deadline: Option<Instant>,
    ) -> Result<Reconciliation, ReconcileError> {
        let matches = matcher::find_matches(&self.store, observation)?;
        if matches.is_empty() {
            check_deadline(deadline)?;
            let receipt = self.store.commit(ContactBatch {
                root: None,
                relinks: Vec::new(),
                insert: Some(NewContact::primary(
                    observation.email().map(str::to_string),
                    observation.phone_number().map(str::to_string),
                )),
            })?;
            let created = receipt.inserted.ok_or_else(|| {
                ReconcileError::Inconsistent("commit did not return the new primary".to_string())
            })?;
            info!(contact = %created.id, "created primary contact");
            return Ok(Reconciliation {
                view: identity_view(&created, std::slice::from_ref(&created)),
                outcome: Outcome::CreatedPrimary(created.id),
            });
        }

        let working = self.collect_working_set(&matches)?;
        let plan = plan_merge(observation, &working)?;
        if plan.batch.is_empty() {
            debug!(root = %plan.root.id, members = working.len(), "observation already known");
            return Ok(Reconciliation {
                view: identity_view(&plan.root, &working),
                outcome: Outcome::Unchanged,
            });
        }

        check_deadline(deadline)?;
        let root_id = plan.root.id;
        let receipt = self.store.commit(plan.batch)?;
        if receipt.relinked > 0 {
            info!(root = %root_id, relinked = receipt.relinked, "merged clusters");
        }
        if let Some(inserted) = &receipt.inserted {
            debug!(root = %root_id, contact = %inserted.id, "linked new secondary");
        }

        let members = self.store.find_clusters(&[root_id])?;
        let primary = members
            .iter()
            .find(|c| c.id == root_id)
            .ok_or_else(|| {
                ReconcileError::Inconsistent(format!("root {root_id} vanished after commit"))
            })?;
        Ok(Reconciliation {
            view: identity_view(primary, &members),
            outcome: Outcome::Linked {
                inserted: receipt.inserted.map(|c| c.id),
                relinked: receipt.relinked,
            },
        })
    }

    /// Fetch the full clusters of every root the matches claim, closed over
    /// links in both directions: a member's link target is fetched, and so are
    /// the dependents of every member, so legacy chains come in whole.
    fn collect_working_set(&self, matches: &[Contact]) -> Result<Vec<Contact>, ReconcileError> {
        let mut members: BTreeMap<ContactId, Contact> = BTreeMap::new();
        let mut expanded: BTreeSet<ContactId> = BTreeSet::new();
        let mut frontier: Vec<ContactId> = matcher::root_ids(matches).into_iter().collect();
        while !frontier.is_empty() {
            expanded.extend(frontier.iter().copied());
            let mut next = BTreeSet::new();
            for contact in self.store.find_clusters(&frontier)? {
                if let Some(linked) = contact.linked_id {
                    if !expanded.contains(&linked) {
                        next.insert(linked);
                    }
                }
                if !expanded.contains(&contact.id) {
                    next.insert(contact.id);
                }
                members.insert(contact.id, contact);
            }
            frontier = next.into_iter().collect();
        }
        Ok(members.into_values().collect())
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), ReconcileError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(ReconcileError::DeadlineExceeded),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinkPrecedence;
    use crate::store::MemoryStore;
    use time::{Duration, OffsetDateTime};

    fn row(
        id: u64,
        created_secs: i64,
        email: Option<&str>,
        phone: Option<&str>,
        linked: Option<u64>,
    ) -> Contact {
        let created = OffsetDateTime::UNIX_EPOCH + Duration::seconds(created_secs);
        Contact {
            id: ContactId(id),
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            linked_id: linked.map(ContactId),
            link_precedence: if linked.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            created_at: created,
            updated_at: created,
            deleted_at: None,
        }
    }

    fn obs(email: Option<&str>, phone: Option<&str>) -> Observation {
        Observation::new(email, phone).unwrap()
    }

    #[test]
    fn test_plan_known_observation_is_empty() {
        let working = vec![
            row(1, 10, Some("a@x.com"), Some("111"), None),
            row(2, 20, None, Some("222"), Some(1)),
        ];
        let plan = plan_merge(&obs(Some("a@x.com"), Some("222")), &working).unwrap();
        assert_eq!(plan.root.id, ContactId(1));
        assert!(plan.batch.is_empty());
    }

    #[test]
    fn test_plan_inserts_only_new_field() {
        let working = vec![row(1, 10, Some("a@x.com"), Some("111"), None)];
        let plan = plan_merge(&obs(Some("a@x.com"), Some("222")), &working).unwrap();
        assert!(plan.batch.relinks.is_empty());
        assert_eq!(
            plan.batch.insert,
            Some(NewContact::secondary(ContactId(1), None, Some("222".into())))
        );
    }

    #[test]
    fn test_plan_demotes_younger_primary_and_its_secondaries() {
        let working = vec![
            row(1, 10, Some("a@x.com"), None, None),
            row(2, 20, None, Some("222"), None),
            row(3, 30, Some("c@x.com"), None, Some(2)),
            row(4, 40, Some("d@x.com"), None, Some(1)),
        ];
        let plan = plan_merge(&obs(Some("a@x.com"), Some("222")), &working).unwrap();
        assert_eq!(plan.root.id, ContactId(1));
        let relinked: Vec<_> = plan.batch.relinks.iter().map(|r| r.id).collect();
        assert_eq!(relinked, vec![ContactId(2), ContactId(3)]);
        assert!(plan
            .batch
            .relinks
            .iter()
            .all(|r| r.linked_id == Some(ContactId(1))
                && r.precedence == LinkPrecedence::Secondary));
        assert!(plan.batch.insert.is_none());
    }

    #[test]
    fn test_plan_prefers_older_created_at_over_smaller_id() {
        let working = vec![
            row(1, 50, Some("a@x.com"), None, None),
            row(2, 10, None, Some("222"), None),
        ];
        let plan = plan_merge(&obs(Some("a@x.com"), Some("222")), &working).unwrap();
        assert_eq!(plan.root.id, ContactId(2));
        assert_eq!(plan.batch.relinks.len(), 1);
        assert_eq!(plan.batch.relinks[0].id, ContactId(1));
    }

    #[test]
    fn test_plan_promotes_orphaned_secondary() {
        let working = vec![row(5, 10, Some("a@x.com"), None, Some(1))];
        let plan = plan_merge(&obs(Some("a@x.com"), None), &working).unwrap();
        assert_eq!(plan.root.id, ContactId(5));
        assert_eq!(plan.batch.relinks, vec![Relink::to_primary(&working[0])]);
    }

    #[test]
    fn test_reconcile_follows_chained_roots() {
        let store = MemoryStore::new();
        store
            .import(vec![
                row(1, 10, Some("a@x.com"), None, None),
                row(2, 20, Some("b@x.com"), None, Some(1)),
                row(3, 30, None, Some("333"), Some(2)),
            ])
            .unwrap();
        let reconciler = Reconciler::new(store);
        let result = reconciler.reconcile(&obs(None, Some("333"))).unwrap();
        assert_eq!(result.view.primary_id, ContactId(1));
        assert_eq!(result.view.secondary_ids, vec![ContactId(2), ContactId(3)]);
        let relinked = reconciler.store().get(ContactId(3)).unwrap().unwrap();
        assert_eq!(relinked.linked_id, Some(ContactId(1)));
    }

    #[test]
    fn test_merge_over_chain_matched_at_top() {
        let store = MemoryStore::new();
        store
            .import(vec![
                row(1, 10, Some("a@x.com"), None, None),
                row(2, 20, Some("b@x.com"), None, Some(1)),
                row(3, 30, None, Some("333"), Some(2)),
                row(5, 0, None, Some("555"), None),
            ])
            .unwrap();
        let reconciler = Reconciler::new(store);
        let result = reconciler
            .reconcile(&obs(Some("a@x.com"), Some("555")))
            .unwrap();

        assert_eq!(result.view.primary_id, ContactId(5));
        assert_eq!(
            result.view.secondary_ids,
            vec![ContactId(1), ContactId(2), ContactId(3)]
        );
        for id in [1, 2, 3] {
            let member = reconciler.store().get(ContactId(id)).unwrap().unwrap();
            assert!(member.has_link(LinkPrecedence::Secondary, Some(ContactId(5))));
        }
    }

    #[test]
    fn test_expired_deadline_writes_nothing() {
        let reconciler = Reconciler::new(MemoryStore::new());
        let err = reconciler
            .reconcile_until(&obs(Some("a@x.com"), None), Some(Instant::now()))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::DeadlineExceeded));
        assert!(reconciler.store().is_empty());
    }

    #[test]
    fn test_outcome_reports_writes() {
        assert!(Outcome::CreatedPrimary(ContactId(1)).wrote());
        assert!(!Outcome::Unchanged.wrote());
    }
}
