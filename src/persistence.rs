//! RocksDB-backed contact store.
//!
//! Rows live in the `contacts` column family keyed by big-endian id and encoded
//! with bincode. Secondary indices on email, phone and linked id are key-only
//! column families whose keys end with the row id. Every commit is a single
//! `WriteBatch` holding the row images, their index keys and the id sequence,
//! so a crash never exposes half a merge.

use crate::error::StoreError;
use crate::model::{Contact, ContactId};
use crate::store::{
    lookup_clusters, lookup_matches, plan_commit, CommitReceipt, ContactBatch, ContactIndex,
    ContactStore,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::OffsetDateTime;
use tracing::info;

const CF_CONTACTS: &str = "contacts";
const CF_METADATA: &str = "metadata";
const CF_INDEX_EMAIL: &str = "index_email";
const CF_INDEX_PHONE: &str = "index_phone";
const CF_INDEX_LINKED: &str = "index_linked";

const KEY_NEXT_CONTACT_ID: &[u8] = b"next_contact_id";
const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentOpenOptions {
    pub repair: bool,
}

/// Durable [`ContactStore`]. Reads go straight to RocksDB; commits are
/// validated and written under a single commit lock that also owns the id
/// sequence.
pub struct PersistentStore {
    db: DB,
    next_id: Mutex<u64>,
    len: AtomicUsize,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;

        let (len, max_id) = scan_contacts(&db)?;
        let stored_next = load_metadata::<u64>(&db, KEY_NEXT_CONTACT_ID)?.unwrap_or(1);
        let next_id = stored_next.max(max_id + 1);
        info!(
            path = %path.as_ref().display(),
            contacts = len,
            next_id,
            "opened contact store"
        );

        Ok(Self {
            db,
            next_id: Mutex::new(next_id),
            len: AtomicUsize::new(len),
        })
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn index(&self) -> DbIndex<'_> {
        DbIndex { db: &self.db }
    }

    fn stage_row(
        &self,
        batch: &mut WriteBatch,
        before: Option<&Contact>,
        after: &Contact,
    ) -> Result<(), StoreError> {
        let contacts_cf = column_family(&self.db, CF_CONTACTS)?;
        let email_cf = column_family(&self.db, CF_INDEX_EMAIL)?;
        let phone_cf = column_family(&self.db, CF_INDEX_PHONE)?;
        let linked_cf = column_family(&self.db, CF_INDEX_LINKED)?;

        if let Some(before) = before {
            if let Some(email) = &before.email {
                batch.delete_cf(email_cf, encode_string_index(email, before.id));
            }
            if let Some(phone) = &before.phone_number {
                batch.delete_cf(phone_cf, encode_string_index(phone, before.id));
            }
            if let Some(linked) = before.linked_id {
                batch.delete_cf(linked_cf, encode_linked_index(linked, before.id));
            }
        }

        batch.put_cf(contacts_cf, after.id.0.to_be_bytes(), bincode::serialize(after)?);
        if let Some(email) = &after.email {
            batch.put_cf(email_cf, encode_string_index(email, after.id), []);
        }
        if let Some(phone) = &after.phone_number {
            batch.put_cf(phone_cf, encode_string_index(phone, after.id), []);
        }
        if let Some(linked) = after.linked_id {
            batch.put_cf(linked_cf, encode_linked_index(linked, after.id), []);
        }
        Ok(())
    }

    fn stage_next_id(&self, batch: &mut WriteBatch, next_id: u64) -> Result<(), StoreError> {
        let metadata_cf = column_family(&self.db, CF_METADATA)?;
        batch.put_cf(metadata_cf, KEY_NEXT_CONTACT_ID, bincode::serialize(&next_id)?);
        Ok(())
    }
}

impl ContactStore for PersistentStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        lookup_matches(&self.index(), email, phone_number)
    }

    fn find_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, StoreError> {
        lookup_clusters(&self.index(), roots)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        self.index().row(id)
    }

    fn commit(&self, batch: ContactBatch) -> Result<CommitReceipt, StoreError> {
        let mut next_id = self.next_id.lock();
        let planned = plan_commit(&self.index(), &batch, *next_id, OffsetDateTime::now_utc())?;

        let mut write = WriteBatch::default();
        for change in &planned.changes {
            self.stage_row(&mut write, change.before.as_ref(), &change.after)?;
        }
        self.stage_next_id(&mut write, planned.next_id)?;
        self.db.write(write)?;

        *next_id = planned.next_id;
        if planned.inserted.is_some() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        Ok(planned.receipt())
    }

    fn import(&self, rows: Vec<Contact>) -> Result<(), StoreError> {
        let mut next_id = self.next_id.lock();
        let index = self.index();
        let mut write = WriteBatch::default();
        let mut added = 0;
        let mut sequence = *next_id;
        for row in &rows {
            let before = index.row(row.id)?;
            if before.is_none() {
                added += 1;
            }
            self.stage_row(&mut write, before.as_ref(), row)?;
            sequence = sequence.max(row.id.0 + 1);
        }
        self.stage_next_id(&mut write, sequence)?;
        self.db.write(write)?;

        *next_id = sequence;
        self.len.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn ping(&self) -> Result<(), StoreError> {
        let metadata_cf = column_family(&self.db, CF_METADATA)?;
        match self.db.get_cf(metadata_cf, KEY_MANIFEST)? {
            Some(_) => Ok(()),
            None => Err(StoreError::Unavailable("storage manifest missing".to_string())),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

struct DbIndex<'a> {
    db: &'a DB,
}

impl DbIndex<'_> {
    fn scan_ids(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<ContactId>, StoreError> {
        let cf = column_family(self.db, cf_name)?;
        let mut ids = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(id) = decode_trailing_id(&key, prefix.len()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

impl ContactIndex for DbIndex<'_> {
    fn row(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        let contacts_cf = column_family(self.db, CF_CONTACTS)?;
        match self.db.get_cf(contacts_cf, id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn ids_with_email(&self, email: &str) -> Result<Vec<ContactId>, StoreError> {
        self.scan_ids(CF_INDEX_EMAIL, &encode_string_prefix(email))
    }

    fn ids_with_phone(&self, phone_number: &str) -> Result<Vec<ContactId>, StoreError> {
        self.scan_ids(CF_INDEX_PHONE, &encode_string_prefix(phone_number))
    }

    fn ids_linked_to(&self, root: ContactId) -> Result<Vec<ContactId>, StoreError> {
        self.scan_ids(CF_INDEX_LINKED, &root.0.to_be_bytes())
    }
}

fn column_family<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Corrupt(format!("missing column family {name}")))
}

fn open_db(path: &Path) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CONTACTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_EMAIL, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_PHONE, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_LINKED, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}

/// Row count and highest id currently stored.
fn scan_contacts(db: &DB) -> Result<(usize, u64)> {
    let contacts_cf = db
        .cf_handle(CF_CONTACTS)
        .ok_or_else(|| anyhow!("missing contacts column family"))?;
    let mut count = 0;
    let mut max_id = 0;
    for entry in db.iterator_cf(contacts_cf, IteratorMode::Start) {
        let (key, _) = entry?;
        let bytes = <[u8; 8]>::try_from(&key[..]).map_err(|_| anyhow!("malformed contact key"))?;
        let id = u64::from_be_bytes(bytes);
        count += 1;
        max_id = max_id.max(id);
    }
    Ok((count, max_id))
}

// Length-prefixed so that one value is never a key prefix of another.
fn encode_string_prefix(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + value.len() + 8);
    key.extend_from_slice(&(value.len() as u32).to_be_bytes());
    key.extend_from_slice(value.as_bytes());
    key
}

fn encode_string_index(value: &str, id: ContactId) -> Vec<u8> {
    let mut key = encode_string_prefix(value);
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn encode_linked_index(root: ContactId, id: ContactId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&root.0.to_be_bytes());
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn decode_trailing_id(key: &[u8], prefix_len: usize) -> Option<ContactId> {
    if key.len() != prefix_len + 8 {
        return None;
    }
    Some(ContactId(u64::from_be_bytes(
        key[prefix_len..prefix_len + 8].try_into().ok()?,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkPrecedence, NewContact};
    use crate::store::Relink;
    use tempfile::tempdir;

    #[test]
    fn test_string_index_round_trip() {
        let key = encode_string_index("a@x.com", ContactId(42));
        let prefix = encode_string_prefix("a@x.com");
        assert!(key.starts_with(&prefix));
        assert_eq!(decode_trailing_id(&key, prefix.len()), Some(ContactId(42)));
        assert!(!key.starts_with(&encode_string_prefix("a@x.co")));
    }

    #[test]
    fn test_commit_and_lookup() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = PersistentStore::open(dir.path())?;
        store.ping()?;

        let first = store
            .commit(ContactBatch {
                insert: Some(NewContact::primary(Some("a@x.com".into()), None)),
                ..Default::default()
            })?
            .inserted
            .expect("inserted");
        let second = store
            .commit(ContactBatch {
                insert: Some(NewContact::primary(None, Some("222".into()))),
                ..Default::default()
            })?
            .inserted
            .expect("inserted");
        assert_eq!(first.id, ContactId(1));
        assert_eq!(second.id, ContactId(2));

        let receipt = store.commit(ContactBatch {
            root: Some(first.id),
            relinks: vec![Relink::to_secondary(&second, first.id)],
            insert: None,
        })?;
        assert_eq!(receipt.relinked, 1);

        let matched = store.find_by_email_or_phone(None, Some("222"))?;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].link_precedence, LinkPrecedence::Secondary);
        assert_eq!(matched[0].linked_id, Some(first.id));

        let cluster = store.find_clusters(&[first.id])?;
        assert_eq!(cluster.len(), 2);
        assert!(store.find_clusters(&[second.id])?.len() == 1);
        Ok(())
    }

    #[test]
    fn test_sequence_survives_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        {
            let store = PersistentStore::open(dir.path())?;
            store.commit(ContactBatch {
                insert: Some(NewContact::primary(Some("a@x.com".into()), None)),
                ..Default::default()
            })?;
            store.flush()?;
        }
        let store = PersistentStore::open(dir.path())?;
        assert_eq!(store.len(), 1);
        let receipt = store.commit(ContactBatch {
            insert: Some(NewContact::primary(Some("b@x.com".into()), None)),
            ..Default::default()
        })?;
        assert_eq!(receipt.inserted.expect("inserted").id, ContactId(2));
        Ok(())
    }
}
