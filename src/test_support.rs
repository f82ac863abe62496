//! Helpers shared by integration tests and benchmarks.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ConflictKind, StoreError};
use crate::model::{Contact, ContactId, Observation};
use crate::store::{CommitReceipt, ContactBatch, ContactStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A failure to inject into the next commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Unavailable,
}

/// Store wrapper that counts traffic and can fail upcoming commits.
pub struct InstrumentedStore<S> {
    inner: S,
    reads: AtomicUsize,
    commits: AtomicUsize,
    faults: Mutex<VecDeque<Fault>>,
    offline: AtomicBool,
}

impl<S: ContactStore> InstrumentedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            faults: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next commit (after any already queued faults).
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// While offline, `ping` fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Commits that reached the inner store.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn reset_counts(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.commits.store(0, Ordering::SeqCst);
    }
}

impl<S: ContactStore> ContactStore for InstrumentedStore<S> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_email_or_phone(email, phone_number)
    }

    fn find_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.find_clusters(roots)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(id)
    }

    fn commit(&self, batch: ContactBatch) -> Result<CommitReceipt, StoreError> {
        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(match fault {
                Fault::Conflict => StoreError::Conflict(ConflictKind::DuplicateInsert),
                Fault::Unavailable => StoreError::Unavailable("injected fault".to_string()),
            });
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(batch)
    }

    fn import(&self, rows: Vec<Contact>) -> Result<(), StoreError> {
        self.inner.import(rows)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn ping(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "connection refused by 10.0.0.7:5432".to_string(),
            ));
        }
        self.inner.ping()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
}

/// Seeded stream of observations drawn from small email/phone pools so that
/// clusters form, grow and merge.
pub fn generate_observations(
    count: usize,
    email_pool: usize,
    phone_pool: usize,
    seed: u64,
) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut observations = Vec::with_capacity(count);
    while observations.len() < count {
        let email = rng
            .random_bool(0.8)
            .then(|| format!("user{:04}@example.com", rng.random_range(0..email_pool.max(1))));
        let phone = rng
            .random_bool(0.8)
            .then(|| format!("555{:05}", rng.random_range(0..phone_pool.max(1))));
        if let Ok(observation) = Observation::new(email.as_deref(), phone.as_deref()) {
            observations.push(observation);
        }
    }
    observations
}
