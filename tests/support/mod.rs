use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use unicontact::test_support::InstrumentedStore;
use unicontact::{Contact, ContactId, ContactStore, MemoryStore, ReconcileConfig, Unicontact};

/// A facade plus a handle on the instrumented store behind it.
#[allow(dead_code)]
pub fn instrumented() -> (Unicontact, Arc<InstrumentedStore<MemoryStore>>) {
    instrumented_with(ReconcileConfig::default())
}

#[allow(dead_code)]
pub fn instrumented_with(
    config: ReconcileConfig,
) -> (Unicontact, Arc<InstrumentedStore<MemoryStore>>) {
    let store = Arc::new(InstrumentedStore::new(MemoryStore::new()));
    let shared: Arc<dyn ContactStore> = store.clone();
    (Unicontact::from_shared(shared, config), store)
}

/// Check the structural invariants of a full store snapshot:
/// every secondary points at a live primary, and no two secondaries of one
/// primary carry the same (email, phone) pair.
#[allow(dead_code)]
pub fn assert_well_formed(rows: &[Contact]) {
    let by_id: BTreeMap<ContactId, &Contact> = rows.iter().map(|c| (c.id, c)).collect();
    let mut seen = BTreeSet::new();
    for row in rows {
        if row.is_primary() {
            assert!(row.linked_id.is_none(), "primary {} has a link", row.id);
            continue;
        }
        let linked = row
            .linked_id
            .unwrap_or_else(|| panic!("secondary {} has no link", row.id));
        let target = by_id
            .get(&linked)
            .unwrap_or_else(|| panic!("secondary {} links to missing {}", row.id, linked));
        assert!(target.is_primary(), "secondary {} links to secondary {}", row.id, linked);
        assert!(
            seen.insert((row.email.clone(), row.phone_number.clone(), linked)),
            "duplicate secondary {:?}/{:?} under {}",
            row.email,
            row.phone_number,
            linked
        );
    }
}

/// Ids of every primary in a snapshot.
#[allow(dead_code)]
pub fn primaries(rows: &[Contact]) -> Vec<ContactId> {
    rows.iter().filter(|c| c.is_primary()).map(|c| c.id).collect()
}
