//! Exact-match lookup of contacts touched by an observation.

use crate::error::StoreError;
use crate::model::{Contact, ContactId, Observation};
use crate::store::ContactStore;
use std::collections::BTreeSet;

/// Every live contact whose email equals the observation's email or whose phone
/// equals its phone number. Pure read; no fuzzy matching.
pub fn find_matches<S>(store: &S, observation: &Observation) -> Result<Vec<Contact>, StoreError>
where
    S: ContactStore + ?Sized,
{
    store.find_by_email_or_phone(observation.email(), observation.phone_number())
}

/// Cluster handles claimed by a set of matched rows: a primary's own id, or a
/// secondary's `linked_id`.
pub fn root_ids(matches: &[Contact]) -> BTreeSet<ContactId> {
    matches.iter().map(Contact::root_id).collect()
}
