//! # Disjoint Set Union over contact links
//!
//! Each contact in a working set is a node and `linked_id` is a parent pointer.
//! Unions always keep the most senior root (primaries before secondaries, then
//! oldest `created_at`, then smallest id), so once every touched component is
//! merged the surviving root is the canonical primary of the merged cluster.

use crate::model::{Contact, ContactId, LinkPrecedence};
use rustc_hash::FxHashMap;
use time::OffsetDateTime;

/// Ordering used to pick a cluster's canonical root. Smaller is more senior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Seniority {
    /// Secondaries only win when a component has no live primary.
    pub secondary: bool,
    pub created_at: OffsetDateTime,
    pub id: ContactId,
}

impl Seniority {
    pub fn of(contact: &Contact) -> Self {
        Self {
            secondary: contact.link_precedence == LinkPrecedence::Secondary,
            created_at: contact.created_at,
            id: contact.id,
        }
    }
}

/// Union-find forest keyed by contact id.
#[derive(Debug, Clone, Default)]
pub struct LinkForest {
    parent: FxHashMap<ContactId, ContactId>,
    seniority: FxHashMap<ContactId, Seniority>,
    component_count: usize,
}

impl LinkForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a forest from a working set, unioning every row with the row its
    /// `linked_id` names. Links to rows outside the set are ignored.
    pub fn from_contacts(contacts: &[Contact]) -> Self {
        let mut forest = Self::new();
        for contact in contacts {
            forest.add_contact(contact);
        }
        for contact in contacts {
            if let Some(linked) = contact.linked_id {
                if forest.contains(linked) {
                    forest.union(contact.id, linked);
                }
            }
        }
        forest
    }

    pub fn add_contact(&mut self, contact: &Contact) {
        if self.parent.insert(contact.id, contact.id).is_none() {
            self.component_count += 1;
        }
        self.seniority.insert(contact.id, Seniority::of(contact));
    }

    pub fn contains(&self, id: ContactId) -> bool {
        self.parent.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    /// Find the root of `id` with path halving. Unknown ids are their own root.
    pub fn find(&mut self, id: ContactId) -> ContactId {
        let mut current = id;
        loop {
            let Some(&parent) = self.parent.get(&current) else {
                return current;
            };
            if parent == current {
                return current;
            }
            let grandparent = self.parent.get(&parent).copied().unwrap_or(parent);
            self.parent.insert(current, grandparent);
            current = grandparent;
        }
    }

    /// Merge the components of `a` and `b`; returns the surviving root.
    pub fn union(&mut self, a: ContactId, b: ContactId) -> ContactId {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return root_a;
        }
        let (senior, junior) = if self.is_senior(root_a, root_b) {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        self.parent.insert(junior, senior);
        self.component_count = self.component_count.saturating_sub(1);
        senior
    }

    /// Merge every listed node into one component and return its root.
    pub fn merge_all<I>(&mut self, ids: I) -> Option<ContactId>
    where
        I: IntoIterator<Item = ContactId>,
    {
        let mut root = None;
        for id in ids {
            root = Some(match root {
                None => self.find(id),
                Some(current) => self.union(current, id),
            });
        }
        root
    }

    /// Distinct roots, in id order.
    pub fn roots(&mut self) -> Vec<ContactId> {
        let mut ids: Vec<ContactId> = self.parent.keys().copied().collect();
        ids.sort_unstable();
        let mut roots: Vec<ContactId> = ids.into_iter().map(|id| self.find(id)).collect();
        roots.sort_unstable();
        roots.dedup();
        roots
    }

    fn is_senior(&self, a: ContactId, b: ContactId) -> bool {
        match (self.seniority.get(&a), self.seniority.get(&b)) {
            (Some(left), Some(right)) => left <= right,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => a <= b,
        }
    }
}
