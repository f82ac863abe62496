mod support;

use std::time::Instant;

use support::{assert_well_formed, instrumented, instrumented_with};
use unicontact::test_support::Fault;
use unicontact::{ContactId, Observation, ReconcileConfig, ReconcileError, StoreError};

#[test]
fn conflict_is_retried_against_fresh_state() -> anyhow::Result<()> {
    let (unicontact, store) = instrumented();
    unicontact.identify(Some("a@x.com"), None)?;

    store.inject(Fault::Conflict);
    let view = unicontact.identify(Some("a@x.com"), Some("111"))?;

    assert_eq!(view.primary_id, ContactId(1));
    assert_eq!(view.phone_numbers, vec!["111"]);
    assert_eq!(unicontact.contact_count(), 2);
    Ok(())
}

#[test]
fn exhausted_retries_fail_without_writing() {
    let config = ReconcileConfig {
        max_conflict_retries: 2,
    };
    let (unicontact, store) = instrumented_with(config);
    for _ in 0..3 {
        store.inject(Fault::Conflict);
    }

    let err = unicontact.identify(Some("a@x.com"), None).unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::ConflictRetriesExhausted { attempts: 3 }
    ));
    assert!(!err.is_client_error());
    assert_eq!(store.commit_count(), 0);
    assert_eq!(unicontact.contact_count(), 0);
}

#[test]
fn unavailable_store_surfaces_and_leaves_state_untouched() -> anyhow::Result<()> {
    let (unicontact, store) = instrumented();
    unicontact.identify(Some("a@x.com"), None)?;
    unicontact.identify(None, Some("222"))?;
    let before = store.inner().snapshot();

    store.inject(Fault::Unavailable);
    let err = unicontact
        .identify(Some("a@x.com"), Some("222"))
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Store(StoreError::Unavailable(_))
    ));
    assert_eq!(store.inner().snapshot(), before);

    // The next attempt completes the merge.
    let view = unicontact.identify(Some("a@x.com"), Some("222"))?;
    assert_eq!(view.primary_id, ContactId(1));
    assert_eq!(view.secondary_ids, vec![ContactId(2)]);
    Ok(())
}

#[test]
fn expired_deadline_abandons_before_commit() -> anyhow::Result<()> {
    let (unicontact, store) = instrumented();
    unicontact.identify(Some("a@x.com"), None)?;
    unicontact.identify(None, Some("222"))?;
    let before = store.inner().snapshot();
    let commits = store.commit_count();

    let bridge = Observation::new(Some("a@x.com"), Some("333"))?;
    let err = unicontact
        .reconcile(&bridge, Some(Instant::now()))
        .unwrap_err();
    assert!(matches!(err, ReconcileError::DeadlineExceeded));
    assert_eq!(store.commit_count(), commits);
    assert_eq!(store.inner().snapshot(), before);

    let fresh = Observation::new(Some("new@x.com"), None)?;
    let err = unicontact
        .reconcile(&fresh, Some(Instant::now()))
        .unwrap_err();
    assert!(matches!(err, ReconcileError::DeadlineExceeded));
    assert_eq!(unicontact.contact_count(), 2);
    assert_well_formed(&store.inner().snapshot());
    Ok(())
}

#[test]
fn known_observation_succeeds_even_past_deadline() -> anyhow::Result<()> {
    let (unicontact, store) = instrumented();
    unicontact.identify(Some("a@x.com"), Some("111"))?;
    let commits = store.commit_count();

    let known = Observation::new(Some("a@x.com"), None)?;
    let result = unicontact.reconcile(&known, Some(Instant::now()))?;
    assert_eq!(result.view.primary_id, ContactId(1));
    assert_eq!(store.commit_count(), commits);
    Ok(())
}
