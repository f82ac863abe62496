//! # Store Module
//!
//! The storage collaborator contract for reconciliation plus an in-memory
//! implementation. A store answers two lookups (exact email/phone match and
//! cluster fetch by root ids) and applies a [`ContactBatch`] atomically: either
//! every relink and the insert become visible, or nothing does.

use crate::error::{ConflictKind, StoreError};
use crate::model::{Contact, ContactId, LinkPrecedence, NewContact};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Rewrite of one existing row's role and link.
///
/// The expected fields carry the state the decision was computed from; a
/// store rejects the whole batch when the row no longer matches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relink {
    pub id: ContactId,
    pub expected_precedence: LinkPrecedence,
    pub expected_linked_id: Option<ContactId>,
    pub precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

impl Relink {
    /// Demote (or re-point) `contact` to a secondary of `root`.
    pub fn to_secondary(contact: &Contact, root: ContactId) -> Self {
        Self {
            id: contact.id,
            expected_precedence: contact.link_precedence,
            expected_linked_id: contact.linked_id,
            precedence: LinkPrecedence::Secondary,
            linked_id: Some(root),
        }
    }

    /// Promote `contact` to a primary with no link.
    pub fn to_primary(contact: &Contact) -> Self {
        Self {
            id: contact.id,
            expected_precedence: contact.link_precedence,
            expected_linked_id: contact.linked_id,
            precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }
}

/// The mutations of one reconciliation, applied as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactBatch {
    /// Root that must be a live primary once the batch is applied.
    pub root: Option<ContactId>,
    pub relinks: Vec<Relink>,
    pub insert: Option<NewContact>,
}

impl ContactBatch {
    pub fn is_empty(&self) -> bool {
        self.relinks.is_empty() && self.insert.is_none()
    }
}

/// What a successful commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub inserted: Option<Contact>,
    pub relinked: usize,
}

/// Relational-style storage for contact rows.
pub trait ContactStore: Send + Sync {
    /// Live rows whose email equals `email` or whose phone equals `phone_number`.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError>;

    /// Live rows whose id is one of `roots` or whose `linked_id` is one of `roots`.
    fn find_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, StoreError>;

    /// Point lookup, including soft-deleted rows.
    fn get(&self, id: ContactId) -> Result<Option<Contact>, StoreError>;

    /// Apply relinks and the optional insert atomically.
    fn commit(&self, batch: ContactBatch) -> Result<CommitReceipt, StoreError>;

    /// Restore rows verbatim (migrations, fixtures). Existing ids are overwritten.
    fn import(&self, rows: Vec<Contact>) -> Result<(), StoreError>;

    /// Number of stored rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connectivity probe used at startup and by health checks.
    fn ping(&self) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<S: ContactStore + ?Sized> ContactStore for Arc<S> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        (**self).find_by_email_or_phone(email, phone_number)
    }

    fn find_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, StoreError> {
        (**self).find_clusters(roots)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        (**self).get(id)
    }

    fn commit(&self, batch: ContactBatch) -> Result<CommitReceipt, StoreError> {
        (**self).commit(batch)
    }

    fn import(&self, rows: Vec<Contact>) -> Result<(), StoreError> {
        (**self).import(rows)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn ping(&self) -> Result<(), StoreError> {
        (**self).ping()
    }

    fn flush(&self) -> Result<(), StoreError> {
        (**self).flush()
    }
}

/// Index access shared by the store implementations.
pub(crate) trait ContactIndex {
    fn row(&self, id: ContactId) -> Result<Option<Contact>, StoreError>;
    fn ids_with_email(&self, email: &str) -> Result<Vec<ContactId>, StoreError>;
    fn ids_with_phone(&self, phone_number: &str) -> Result<Vec<ContactId>, StoreError>;
    fn ids_linked_to(&self, root: ContactId) -> Result<Vec<ContactId>, StoreError>;
}

/// Before/after image of one row touched by a commit.
#[derive(Debug, Clone)]
pub(crate) struct RowChange {
    pub before: Option<Contact>,
    pub after: Contact,
}

/// A validated batch, ready to be written.
#[derive(Debug, Clone)]
pub(crate) struct PlannedCommit {
    pub changes: Vec<RowChange>,
    pub inserted: Option<ContactId>,
    pub next_id: u64,
}

impl PlannedCommit {
    pub fn receipt(&self) -> CommitReceipt {
        let inserted = self.inserted.and_then(|id| {
            self.changes
                .iter()
                .find(|change| change.after.id == id)
                .map(|change| change.after.clone())
        });
        CommitReceipt {
            inserted,
            relinked: self
                .changes
                .iter()
                .filter(|change| change.before.is_some())
                .count(),
        }
    }
}

pub(crate) fn lookup_matches<I: ContactIndex + ?Sized>(
    index: &I,
    email: Option<&str>,
    phone_number: Option<&str>,
) -> Result<Vec<Contact>, StoreError> {
    let mut ids = Vec::new();
    if let Some(email) = email {
        ids.extend(index.ids_with_email(email)?);
    }
    if let Some(phone_number) = phone_number {
        ids.extend(index.ids_with_phone(phone_number)?);
    }
    load_live(index, ids)
}

pub(crate) fn lookup_clusters<I: ContactIndex + ?Sized>(
    index: &I,
    roots: &[ContactId],
) -> Result<Vec<Contact>, StoreError> {
    let mut ids = Vec::with_capacity(roots.len());
    for &root in roots {
        ids.push(root);
        ids.extend(index.ids_linked_to(root)?);
    }
    load_live(index, ids)
}

fn load_live<I: ContactIndex + ?Sized>(
    index: &I,
    mut ids: Vec<ContactId>,
) -> Result<Vec<Contact>, StoreError> {
    ids.sort_unstable();
    ids.dedup();
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = index.row(id)? {
            if row.is_live() {
                rows.push(row);
            }
        }
    }
    Ok(rows)
}

/// Validate `batch` against the current index state and compute the rows to write.
pub(crate) fn plan_commit<I: ContactIndex + ?Sized>(
    index: &I,
    batch: &ContactBatch,
    next_id: u64,
    now: OffsetDateTime,
) -> Result<PlannedCommit, StoreError> {
    let mut changes = Vec::with_capacity(batch.relinks.len() + 1);

    for relink in &batch.relinks {
        let current = index
            .row(relink.id)?
            .filter(Contact::is_live)
            .ok_or(StoreError::Conflict(ConflictKind::Missing(relink.id)))?;
        if !current.has_link(relink.expected_precedence, relink.expected_linked_id) {
            return Err(StoreError::Conflict(ConflictKind::StaleLink(relink.id)));
        }
        let mut after = current.clone();
        after.link_precedence = relink.precedence;
        after.linked_id = relink.linked_id;
        after.updated_at = now;
        changes.push(RowChange {
            before: Some(current),
            after,
        });
    }

    // A demoted row must take every live dependent with it, or the cluster
    // would be left with a secondary pointing at a secondary.
    for relink in &batch.relinks {
        if relink.precedence != LinkPrecedence::Secondary {
            continue;
        }
        for child in index.ids_linked_to(relink.id)? {
            if batch.relinks.iter().any(|other| other.id == child) {
                continue;
            }
            if index.row(child)?.is_some_and(|row| row.is_live()) {
                return Err(StoreError::Conflict(ConflictKind::StaleLink(child)));
            }
        }
    }

    if let Some(root) = batch.root {
        let planned = changes
            .iter()
            .find(|change| change.after.id == root)
            .map(|change| change.after.clone());
        let root_row = match planned {
            Some(row) => row,
            None => index
                .row(root)?
                .filter(Contact::is_live)
                .ok_or(StoreError::Conflict(ConflictKind::Missing(root)))?,
        };
        if !root_row.is_primary() {
            return Err(StoreError::Conflict(ConflictKind::RootDemoted(root)));
        }
    }

    let mut next_id = next_id;
    let mut inserted = None;
    if let Some(new) = &batch.insert {
        match new.link_precedence {
            LinkPrecedence::Primary => {
                let existing =
                    lookup_matches(index, new.email.as_deref(), new.phone_number.as_deref())?;
                if !existing.is_empty() {
                    return Err(StoreError::Conflict(ConflictKind::AlreadyMatched));
                }
            }
            LinkPrecedence::Secondary => {
                let root = new.linked_id.ok_or_else(|| {
                    StoreError::Corrupt("secondary insert without linked id".to_string())
                })?;
                let siblings = lookup_clusters(index, &[root])?;
                let duplicate = siblings
                    .iter()
                    .chain(changes.iter().map(|change| &change.after))
                    .any(|row| {
                        row.linked_id == Some(root)
                            && row.email == new.email
                            && row.phone_number == new.phone_number
                    });
                if duplicate {
                    return Err(StoreError::Conflict(ConflictKind::DuplicateInsert));
                }
            }
        }
        let id = ContactId(next_id);
        next_id += 1;
        changes.push(RowChange {
            before: None,
            after: new.clone().into_contact(id, now),
        });
        inserted = Some(id);
    }

    Ok(PlannedCommit {
        changes,
        inserted,
        next_id,
    })
}

#[derive(Debug)]
struct StoreState {
    contacts: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, Vec<ContactId>>,
    by_phone: HashMap<String, Vec<ContactId>>,
    by_linked: FxHashMap<ContactId, Vec<ContactId>>,
    next_id: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            contacts: BTreeMap::new(),
            by_email: HashMap::new(),
            by_phone: HashMap::new(),
            by_linked: FxHashMap::default(),
            next_id: 1,
        }
    }

    fn install(&mut self, planned: PlannedCommit) {
        for change in planned.changes {
            self.install_row(change.before.as_ref(), change.after);
        }
        self.next_id = self.next_id.max(planned.next_id);
    }

    fn install_row(&mut self, before: Option<&Contact>, after: Contact) {
        if let Some(before) = before {
            remove_id(&mut self.by_email, before.email.as_deref(), before.id);
            remove_id(&mut self.by_phone, before.phone_number.as_deref(), before.id);
            if let Some(linked) = before.linked_id {
                if let Some(ids) = self.by_linked.get_mut(&linked) {
                    ids.retain(|id| *id != before.id);
                }
            }
        }
        if let Some(email) = &after.email {
            self.by_email.entry(email.clone()).or_default().push(after.id);
        }
        if let Some(phone) = &after.phone_number {
            self.by_phone.entry(phone.clone()).or_default().push(after.id);
        }
        if let Some(linked) = after.linked_id {
            self.by_linked.entry(linked).or_default().push(after.id);
        }
        self.contacts.insert(after.id, after);
    }
}

fn remove_id(index: &mut HashMap<String, Vec<ContactId>>, key: Option<&str>, id: ContactId) {
    if let Some(key) = key {
        if let Some(ids) = index.get_mut(key) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }
}

impl ContactIndex for StoreState {
    fn row(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        Ok(self.contacts.get(&id).cloned())
    }

    fn ids_with_email(&self, email: &str) -> Result<Vec<ContactId>, StoreError> {
        Ok(self.by_email.get(email).cloned().unwrap_or_default())
    }

    fn ids_with_phone(&self, phone_number: &str) -> Result<Vec<ContactId>, StoreError> {
        Ok(self.by_phone.get(phone_number).cloned().unwrap_or_default())
    }

    fn ids_linked_to(&self, root: ContactId) -> Result<Vec<ContactId>, StoreError> {
        Ok(self.by_linked.get(&root).cloned().unwrap_or_default())
    }
}

/// In-process contact store.
///
/// Lookups share a read lock; only the validate-and-install section of a
/// commit takes the write lock.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
        }
    }

    /// All rows ordered by id, including soft-deleted ones.
    pub fn snapshot(&self) -> Vec<Contact> {
        self.state.read().contacts.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactStore for MemoryStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        lookup_matches(&*self.state.read(), email, phone_number)
    }

    fn find_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, StoreError> {
        lookup_clusters(&*self.state.read(), roots)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        self.state.read().row(id)
    }

    fn commit(&self, batch: ContactBatch) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.write();
        let planned = plan_commit(&*state, &batch, state.next_id, OffsetDateTime::now_utc())?;
        let receipt = planned.receipt();
        state.install(planned);
        Ok(receipt)
    }

    fn import(&self, rows: Vec<Contact>) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for row in rows {
            let before = state.contacts.get(&row.id).cloned();
            state.next_id = state.next_id.max(row.id.0 + 1);
            state.install_row(before.as_ref(), row);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.read().contacts.len()
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
