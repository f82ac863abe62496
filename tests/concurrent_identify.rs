mod support;

use std::sync::{Arc, Barrier};
use std::thread;

use support::{assert_well_formed, primaries};
use tempfile::tempdir;
use unicontact::{
    ContactId, ContactStore, MemoryStore, PersistentStore, ReconcileConfig, Unicontact,
};

const THREADS: usize = 8;

fn racing_config() -> ReconcileConfig {
    ReconcileConfig {
        max_conflict_retries: 64,
    }
}

/// Every thread observes the same email with its own phone, all released at once.
fn race_on_shared_email(unicontact: &Unicontact) -> anyhow::Result<()> {
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let unicontact = unicontact.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unicontact.identify(Some("shared@x.com"), Some(&format!("555-{i}")))
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("identify thread panicked")?;
    }
    Ok(())
}

#[test]
fn racing_observations_form_one_cluster_in_memory() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn ContactStore> = store.clone();
    let unicontact = Unicontact::from_shared(shared, racing_config());

    race_on_shared_email(&unicontact)?;

    let rows = store.snapshot();
    assert_eq!(primaries(&rows).len(), 1);
    assert_eq!(rows.len(), THREADS);
    assert_well_formed(&rows);

    let view = unicontact.identify(Some("shared@x.com"), None)?;
    assert_eq!(view.emails, vec!["shared@x.com"]);
    assert_eq!(view.phone_numbers.len(), THREADS);
    assert_eq!(view.secondary_ids.len(), THREADS - 1);
    Ok(())
}

#[test]
fn racing_identical_observations_insert_once() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn ContactStore> = store.clone();
    let unicontact = Unicontact::from_shared(shared, racing_config());
    unicontact.identify(Some("a@x.com"), None)?;

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let unicontact = unicontact.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unicontact.identify(Some("a@x.com"), Some("111"))
            })
        })
        .collect();
    let mut views = Vec::new();
    for handle in handles {
        views.push(handle.join().expect("identify thread panicked")?);
    }

    assert_eq!(store.snapshot().len(), 2);
    for view in &views {
        assert_eq!(view.primary_id, ContactId(1));
        assert_eq!(view.secondary_ids, vec![ContactId(2)]);
    }
    Ok(())
}

#[test]
fn racing_merges_settle_under_oldest_primary() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn ContactStore> = store.clone();
    let unicontact = Unicontact::from_shared(shared, racing_config());
    for i in 0..THREADS {
        unicontact.identify(Some(&format!("user{i}@x.com")), Some(&format!("{i}00")))?;
    }

    // Each thread bridges cluster i with cluster i + 1.
    let barrier = Arc::new(Barrier::new(THREADS - 1));
    let handles: Vec<_> = (0..THREADS - 1)
        .map(|i| {
            let unicontact = unicontact.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unicontact.identify(
                    Some(&format!("user{i}@x.com")),
                    Some(&format!("{}00", i + 1)),
                )
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("identify thread panicked")?;
    }

    let rows = store.snapshot();
    assert_eq!(primaries(&rows), vec![ContactId(1)]);
    assert_eq!(rows.len(), THREADS);
    assert_well_formed(&rows);
    Ok(())
}

#[test]
fn racing_observations_form_one_cluster_on_disk() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(PersistentStore::open(dir.path().join("store"))?);
    let shared: Arc<dyn ContactStore> = store.clone();
    let unicontact = Unicontact::from_shared(shared, racing_config());

    race_on_shared_email(&unicontact)?;

    let root = unicontact.identify(Some("shared@x.com"), None)?.primary_id;
    let rows = store.find_clusters(&[root])?;
    assert_eq!(rows.len(), THREADS);
    assert_eq!(store.len(), THREADS);
    assert_eq!(primaries(&rows), vec![root]);
    assert_well_formed(&rows);
    Ok(())
}
