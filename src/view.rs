//! Response formatting for a resolved cluster.

use crate::model::{Contact, IdentityView};

/// Build the caller-facing view of a cluster.
///
/// The primary's own email and phone lead their lists; the remaining distinct
/// values follow in member age order. `secondary_ids` lists every other member
/// in id order.
pub fn identity_view(primary: &Contact, members: &[Contact]) -> IdentityView {
    let mut ordered: Vec<&Contact> = members.iter().filter(|c| c.id != primary.id).collect();
    ordered.sort_by_key(|c| c.age_key());

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    for contact in std::iter::once(primary).chain(ordered.iter().copied()) {
        push_distinct(&mut emails, contact.email.as_deref());
        push_distinct(&mut phone_numbers, contact.phone_number.as_deref());
    }

    let mut secondary_ids: Vec<_> = ordered.iter().map(|c| c.id).collect();
    secondary_ids.sort_unstable();

    IdentityView {
        primary_id: primary.id,
        emails,
        phone_numbers,
        secondary_ids,
    }
}

fn push_distinct(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContactId, LinkPrecedence};
    use time::{Duration, OffsetDateTime};

    fn row(id: u64, email: Option<&str>, phone: Option<&str>, linked: Option<u64>) -> Contact {
        let created = OffsetDateTime::UNIX_EPOCH + Duration::seconds(id as i64);
        Contact {
            id: ContactId(id),
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            linked_id: linked.map(ContactId),
            link_precedence: if linked.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            created_at: created,
            updated_at: created,
            deleted_at: None,
        }
    }

    #[test]
    fn test_primary_values_lead() {
        let primary = row(1, Some("a@x.com"), Some("111"), None);
        let members = vec![
            row(3, Some("c@x.com"), Some("333"), Some(1)),
            primary.clone(),
            row(2, Some("b@x.com"), None, Some(1)),
        ];
        let view = identity_view(&primary, &members);
        assert_eq!(view.primary_id, ContactId(1));
        assert_eq!(view.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(view.phone_numbers, vec!["111", "333"]);
        assert_eq!(view.secondary_ids, vec![ContactId(2), ContactId(3)]);
    }

    #[test]
    fn test_values_are_deduplicated() {
        let primary = row(1, Some("a@x.com"), None, None);
        let members = vec![
            primary.clone(),
            row(2, Some("a@x.com"), Some("222"), Some(1)),
            row(3, None, Some("222"), Some(1)),
        ];
        let view = identity_view(&primary, &members);
        assert_eq!(view.emails, vec!["a@x.com"]);
        assert_eq!(view.phone_numbers, vec!["222"]);
    }

    #[test]
    fn test_lone_primary() {
        let primary = row(1, None, Some("111"), None);
        let view = identity_view(&primary, std::slice::from_ref(&primary));
        assert!(view.emails.is_empty());
        assert_eq!(view.phone_numbers, vec!["111"]);
        assert!(view.secondary_ids.is_empty());
    }
}
