//! # Unicontact
//!
//! Identity reconciliation for partial contact records.
//!
//! Every observation carries an email, a phone number, or both. Observations
//! that share either attribute belong to one identity cluster with a single
//! canonical primary (its oldest record) and any number of secondaries. When an
//! observation bridges two clusters they merge under the older primary, and new
//! information is recorded as a new secondary, all in one atomic commit.

pub mod config;
pub mod dsu;
pub mod error;
pub mod matcher;
pub mod model;
pub mod persistence;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod test_support;
pub mod view;

// Re-export main types for convenience
pub use config::{ReconcileConfig, UniContactConfig};
pub use error::{ReconcileError, StoreError, ValidationError};
pub use model::{Contact, ContactId, IdentityView, LinkPrecedence, Observation};
pub use persistence::PersistentStore;
pub use reconciler::{Outcome, Reconciler, Reconciliation};
pub use store::{ContactStore, MemoryStore};

use std::sync::Arc;
use std::time::Instant;

/// Main API: a cheaply clonable handle over a shared store.
#[derive(Clone)]
pub struct Unicontact {
    reconciler: Arc<Reconciler<Arc<dyn ContactStore>>>,
}

impl Unicontact {
    /// Create an instance backed by an in-memory store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Create an instance with a custom store implementation.
    pub fn with_store<S>(store: S) -> Self
    where
        S: ContactStore + 'static,
    {
        Self::with_store_and_config(store, ReconcileConfig::default())
    }

    pub fn with_store_and_config<S>(store: S, config: ReconcileConfig) -> Self
    where
        S: ContactStore + 'static,
    {
        Self::from_shared(Arc::new(store), config)
    }

    /// Share an already type-erased store.
    pub fn from_shared(store: Arc<dyn ContactStore>, config: ReconcileConfig) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::with_config(store, config)),
        }
    }

    /// Reconcile one observation. Fails with a validation error, before any
    /// store access, when both values are absent or blank.
    pub fn identify(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<IdentityView, ReconcileError> {
        let observation = Observation::new(email, phone_number)?;
        Ok(self.reconciler.reconcile(&observation)?.view)
    }

    /// Reconcile with an optional commit deadline and report what changed.
    pub fn reconcile(
        &self,
        observation: &Observation,
        deadline: Option<Instant>,
    ) -> Result<Reconciliation, ReconcileError> {
        self.reconciler.reconcile_until(observation, deadline)
    }

    pub fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        self.store().get(id)
    }

    pub fn contact_count(&self) -> usize {
        self.store().len()
    }

    pub fn store(&self) -> &dyn ContactStore {
        self.reconciler.store().as_ref()
    }
}

impl Default for Unicontact {
    fn default() -> Self {
        Self::new()
    }
}
