//! Error types for contact reconciliation.

use crate::model::ContactId;
use std::fmt;
use thiserror::Error;

/// Neither an email nor a phone number was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Either email or phoneNumber must be provided")]
pub struct ValidationError;

/// Why a commit was rejected without applying anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A row changed role or link after it was read.
    StaleLink(ContactId),
    /// A row named by the batch no longer exists (or was soft-deleted).
    Missing(ContactId),
    /// The chosen root is no longer a primary.
    RootDemoted(ContactId),
    /// An identical (email, phone, linked) row already exists.
    DuplicateInsert,
    /// A new primary was planned but the observation now matches existing rows.
    AlreadyMatched,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::StaleLink(id) => write!(f, "{id} was relinked concurrently"),
            ConflictKind::Missing(id) => write!(f, "{id} no longer exists"),
            ConflictKind::RootDemoted(id) => write!(f, "{id} is no longer a primary"),
            ConflictKind::DuplicateInsert => f.write_str("identical contact already linked"),
            ConflictKind::AlreadyMatched => f.write_str("observation already matches a contact"),
        }
    }
}

/// Failures reported by a [`crate::store::ContactStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("commit conflict: {0}")]
    Conflict(ConflictKind),
    #[error("storage engine error: {0}")]
    Engine(#[from] rocksdb::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Failures of a reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("deadline exceeded before commit")]
    DeadlineExceeded,
    #[error("gave up after {attempts} conflicting commits")]
    ConflictRetriesExhausted { attempts: u32 },
    #[error("inconsistent cluster: {0}")]
    Inconsistent(String),
}

impl ReconcileError {
    /// Errors caused by the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ReconcileError::Validation(_))
    }
}
