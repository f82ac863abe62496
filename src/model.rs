//! # Data Model
//!
//! Core data structures for contact reconciliation: the persisted contact row,
//! the validated observation that drives a reconciliation, and the identity view
//! returned to callers.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Store-assigned surrogate key for a contact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Role of a contact inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPrecedence::Primary => f.write_str("primary"),
            LinkPrecedence::Secondary => f.write_str("secondary"),
        }
    }
}

/// A persisted contact row.
///
/// `linked_id` is set iff `link_precedence` is `Secondary`, and always points at
/// the primary of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Soft-deleted rows are invisible to matching and clustering.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// The cluster handle this row claims: its own id when primary, else `linked_id`.
    pub fn root_id(&self) -> ContactId {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(linked)) => linked,
            _ => self.id,
        }
    }

    /// Ordering key for canonical-primary selection: oldest first, ties by id.
    pub fn age_key(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }

    /// Whether the row already has the given role and link.
    pub fn has_link(&self, precedence: LinkPrecedence, linked_id: Option<ContactId>) -> bool {
        self.link_precedence == precedence && self.linked_id == linked_id
    }
}

/// A row to be inserted; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    pub fn secondary(
        root: ContactId,
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(root),
            link_precedence: LinkPrecedence::Secondary,
        }
    }

    pub(crate) fn into_contact(self, id: ContactId, now: OffsetDateTime) -> Contact {
        Contact {
            id,
            email: self.email,
            phone_number: self.phone_number,
            linked_id: self.linked_id,
            link_precedence: self.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// One reconciliation request: an email and/or a phone number.
///
/// Construction trims both values and treats empty strings as absent, so an
/// `Observation` always carries at least one non-empty attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, ValidationError> {
        let email = normalize(email);
        let phone_number = normalize(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "email={} phone={}",
            self.email().unwrap_or("-"),
            self.phone_number().unwrap_or("-")
        )
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// The consolidated identity of one cluster, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    #[serde(rename = "primaryContactId")]
    pub primary_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    #[serde(rename = "secondaryContactIds")]
    pub secondary_ids: Vec<ContactId>,
}
