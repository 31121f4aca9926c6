use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::fs::File;
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subject::SubjectId;

pub mod errors;
pub(crate) mod crypto;
mod record;

pub use crypto::{derive_subject_key, KeyMaterial, MasterKey};
pub use record::{KeyRecord, State, WRAPPED_KEY_TOMBSTONE};

use crate::key_store::crypto::{raw_decrypt, raw_encrypt, wrap_subject_key};
use crate::key_store::errors::*;

/*
erasure discipline:
keys are always re-derivable from (master key, subject id), so deleting bytes
erases nothing. the revocation flag below is the only gate; every key lookup
must pass through it before any cipher text can be opened.
*/

/// Key record table. The single shared mutable resource of this crate: the
/// record map lives behind one mutex so first-use creation is an atomic
/// insert-or-fetch and revocation is a monotonic flip, both race-safe.
pub struct Store {
    master_key: MasterKey,
    records: Mutex<HashMap<SubjectId, KeyRecord>>,
    persistence: Option<(PathBuf, File)>,  // data dir, lock file
}

impl Store {
    const FILE_NAME: &'static str = "pii-keys.dat";
    const LOCK_NAME: &'static str = ".lock";

    pub fn new(master_key: MasterKey) -> Store {
        Store {
            master_key,
            records: Mutex::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence<T>(master_key: MasterKey, path: T) -> Result<Store, IoError> where T: AsRef<Path> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(IoError::new(IoErrorKind::NotFound, "persistence path is not a dir"));
        }
        let lock_path = path.join(Store::LOCK_NAME);
        let lock_file = File::create(lock_path)?;
        lock_file.try_lock_exclusive()
            .map_err(|_| IoError::new(IoErrorKind::WouldBlock, "key record store in use"))?;
        let persistence = Some((path.to_path_buf(), lock_file));

        let data_path = path.join(Store::FILE_NAME);
        let data_file = match File::open(&data_path) {
            Ok(data_file) => data_file,
            Err(e) => {
                if e.kind() == IoErrorKind::NotFound {
                    info!("Key record file does not exist");
                    let mut store = Store::new(master_key);
                    store.persistence = persistence;
                    return Ok(store);
                }
                return Err(e);
            }
        };

        let data_size = data_file.metadata()?.len() as usize;
        let mut data_contents = Vec::with_capacity(data_size);
        let mut data_reader = BufReader::new(data_file);
        data_reader.read_to_end(&mut data_contents)?;
        raw_decrypt(&mut data_contents, master_key.key_material(), b"")
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "master key incorrect or invalid store"))?;
        serde_json::from_reader(data_contents.as_slice())
            .map_err(IoError::from)
            .and_then(|portable_records: PortableRecords| {
                let records = collect_records(portable_records)
                    .map_err(|e| IoError::new(IoErrorKind::InvalidData, e))?;
                info!("Loaded {} key records", records.len());
                let mut store = Store::new(master_key);
                store.records = Mutex::new(records);
                store.persistence = persistence;
                Ok(store)
            })
    }

    fn lock_records(&self) -> MutexGuard<HashMap<SubjectId, KeyRecord>> {
        // a panicking caller cannot leave the map half-updated, so a
        // poisoned lock is recoverable
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic lookup-or-insert for a subject's key. The losing side of a
    /// concurrent first use transparently receives the winner's record.
    /// The derived key is returned by value and never cached; on the found
    /// path it is re-derived rather than unwrapped from the stored copy.
    pub fn get_or_create(&self, subject_id: &SubjectId) -> Result<(Uuid, KeyMaterial), GetOrCreateKeyError> {
        let mut records = self.lock_records();
        if let Some(record) = records.get(subject_id) {
            if record.is_revoked() {
                return Err(GetOrCreateKeyError::Revoked);
            }
            let key_material = derive_subject_key(&self.master_key, subject_id)
                .or(Err(GetOrCreateKeyError::Derivation))?;
            return Ok((record.record_id().to_owned(), key_material));
        }
        let key_material = derive_subject_key(&self.master_key, subject_id)
            .or(Err(GetOrCreateKeyError::Derivation))?;
        let wrapped_key = wrap_subject_key(&key_material, &self.master_key, subject_id)
            .or(Err(GetOrCreateKeyError::Wrap))?;
        let record = KeyRecord::new(subject_id.to_owned(), Some(wrapped_key));
        let record_id = record.record_id().to_owned();
        info!("Created key record {} for subject {}", &record_id, subject_id);
        records.insert(subject_id.to_owned(), record);
        self.persist_records(&records)
            .map_err(|e| {
                error!("Cannot persist key records: {}", e);
                GetOrCreateKeyError::Storage
            })?;
        Ok((record_id, key_material))
    }

    /// Lookup-only derivation for the decrypt path; never creates a record.
    pub fn active_key(&self, subject_id: &SubjectId) -> Result<KeyMaterial, ActiveKeyError> {
        let records = self.lock_records();
        match records.get(subject_id) {
            None => Err(ActiveKeyError::NotFound),
            Some(record) if record.is_revoked() => Err(ActiveKeyError::Revoked),
            Some(_) => {
                derive_subject_key(&self.master_key, subject_id)
                    .or(Err(ActiveKeyError::Derivation))
            },
        }
    }

    /// Idempotent erasure: flips the record to revoked and scrubs its
    /// wrapped key material. Absence is treated as already erased, not an
    /// error, so a scheduled sweep and a manual request can race safely.
    /// Returns whether this call performed the flip.
    pub fn revoke(&self, subject_id: &SubjectId) -> Result<bool, RevokeKeyError> {
        let mut records = self.lock_records();
        let newly_revoked = match records.get_mut(subject_id) {
            None => {
                debug!("No key record for subject {}, already erased", subject_id);
                false
            },
            Some(record) => {
                let flipped = record.revoke();
                if flipped {
                    info!("Revoked key record {} for subject {}", record.record_id(), subject_id);
                }
                flipped
            },
        };
        if newly_revoked {
            self.persist_records(&records)
                .map_err(|e| {
                    error!("Cannot persist key records: {}", e);
                    RevokeKeyError::Storage
                })?;
        }
        Ok(newly_revoked)
    }

    /// Forensic view of a subject's record, wrapped key material included.
    /// This is the only consumer of the wrapped copy.
    pub fn inspect(&self, subject_id: &SubjectId) -> Option<KeyRecord> {
        self.lock_records().get(subject_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    pub fn persist(&self) -> Result<bool, IoError> {
        let records = self.lock_records();
        self.persist_records(&records)
    }

    fn persist_records(&self, records: &HashMap<SubjectId, KeyRecord>) -> Result<bool, IoError> {
        if let Some((path, _)) = &self.persistence {
            let data_path = path.join(Store::FILE_NAME);
            let data_file = File::create(data_path)?;
            let portable_records = PortableRecords { records: records.values().cloned().collect() };
            let mut data_contents = serde_json::to_vec(&portable_records)
                .map_err(IoError::from)?;
            raw_encrypt(&mut data_contents, self.master_key.key_material(), b"")
                .map_err(|_| IoError::new(IoErrorKind::InvalidData, "cannot encrypt key records"))?;
            let mut data_writer = BufWriter::new(data_file);
            data_writer.write_all(&data_contents)?;
            info!("Saved {} key records", portable_records.records.len());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.persist().unwrap_or_else(|e| {
            error!("Cannot persist key records: {}", e);
            false
        });
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(f, "Store(records: {})", self.len())
    }
}

fn collect_records(portable_records: PortableRecords) -> Result<HashMap<SubjectId, KeyRecord>, LoadRecordsError> {
    if portable_records.records.iter().any(|record| record.verify_integrity().is_err()) {
        return Err(LoadRecordsError::InvalidRecords);
    }
    let mut records = HashMap::with_capacity(portable_records.records.len());
    for record in portable_records.records {
        let subject_id = record.subject_id().to_owned();
        if records.insert(subject_id, record).is_some() {
            return Err(LoadRecordsError::DuplicateSubjects);
        }
    }
    Ok(records)
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct PortableRecords {
    records: Vec<KeyRecord>,
}

impl Debug for PortableRecords {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(f, "PortableRecords(records: {})", self.records.len())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    const MASTER_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn master_key() -> MasterKey {
        MasterKey::from_hex(MASTER_HEX).unwrap()
    }

    fn subject() -> SubjectId {
        SubjectId::from_phone("0901234567")
    }

    #[test]
    fn get_or_create_reuses_record() {
        let store = Store::new(master_key());
        assert!(store.is_empty());
        let (record_id, key_material) = store.get_or_create(&subject()).unwrap();
        assert_eq!(store.len(), 1);
        let (record_id_again, key_material_again) = store.get_or_create(&subject()).unwrap();
        assert_eq!(record_id_again, record_id);
        assert_eq!(key_material_again, key_material);
        assert_eq!(store.len(), 1);

        let other = SubjectId::from_phone("0909999999");
        let (other_record_id, other_key_material) = store.get_or_create(&other).unwrap();
        assert_ne!(other_record_id, record_id);
        assert_ne!(other_key_material, key_material);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn active_key_never_creates() {
        let store = Store::new(master_key());
        assert_eq!(store.active_key(&subject()).err(), Some(ActiveKeyError::NotFound));
        assert!(store.is_empty());
        let (_, key_material) = store.get_or_create(&subject()).unwrap();
        assert_eq!(store.active_key(&subject()).unwrap(), key_material);
        store.revoke(&subject()).unwrap();
        assert_eq!(store.active_key(&subject()).err(), Some(ActiveKeyError::Revoked));
    }

    #[test]
    fn revoked_subject_cannot_be_reborn() {
        let store = Store::new(master_key());
        let (record_id, _) = store.get_or_create(&subject()).unwrap();
        store.revoke(&subject()).unwrap();
        assert_eq!(store.get_or_create(&subject()).err(), Some(GetOrCreateKeyError::Revoked));
        // the record survives revocation as a tombstoned row
        assert_eq!(store.len(), 1);
        let record = store.inspect(&subject()).unwrap();
        assert_eq!(record.record_id(), &record_id);
        assert!(record.is_revoked());
        assert_eq!(record.wrapped_key(), Some(WRAPPED_KEY_TOMBSTONE));
    }

    #[test]
    fn revoke_is_idempotent() {
        let store = Store::new(master_key());
        // revoking a subject that never existed is a no-op
        assert!(!store.revoke(&subject()).unwrap());
        assert!(store.is_empty());

        store.get_or_create(&subject()).unwrap();
        assert!(store.revoke(&subject()).unwrap());
        assert!(!store.revoke(&subject()).unwrap());
        assert!(store.inspect(&subject()).unwrap().is_revoked());
    }

    #[test]
    fn wrapped_copy_is_issued_and_scrubbed() {
        let store = Store::new(master_key());
        store.get_or_create(&subject()).unwrap();
        let record = store.inspect(&subject()).unwrap();
        let wrapped_key = record.wrapped_key().unwrap();
        assert_ne!(wrapped_key, WRAPPED_KEY_TOMBSTONE);
        // the wrapped copy opens under the master key and matches re-derivation
        let mut data = base64::decode(wrapped_key).unwrap();
        assert!(raw_decrypt(&mut data, master_key().key_material(), subject().as_str().as_bytes()).is_ok());
        let derived = derive_subject_key(&master_key(), &subject()).unwrap();
        assert_eq!(data.as_slice(), &derived[..]);

        store.revoke(&subject()).unwrap();
        assert_eq!(store.inspect(&subject()).unwrap().wrapped_key(), Some(WRAPPED_KEY_TOMBSTONE));
    }

    #[test]
    fn concurrent_first_use_creates_one_record() {
        let store = Arc::new(Store::new(master_key()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get_or_create(&subject()).unwrap())
            })
            .collect();
        let results: Vec<(Uuid, KeyMaterial)> = handles.into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(store.len(), 1);
        let (record_id, key_material) = &results[0];
        for (other_record_id, other_key_material) in &results {
            assert_eq!(other_record_id, record_id);
            assert_eq!(other_key_material, key_material);
        }
    }

    #[test]
    fn concurrent_revoke_and_sweep() {
        let store = Arc::new(Store::new(master_key()));
        store.get_or_create(&subject()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.revoke(&subject()))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert!(store.inspect(&subject()).unwrap().is_revoked());
    }

    #[test]
    fn persistence() {
        let tmp_dir = tempdir::TempDir::new("pii-shred").expect("cannot make temp dir");
        let tmp_dir_path = tmp_dir.path().to_owned();

        let store = Store::with_persistence(master_key(), &tmp_dir).unwrap();
        let (record_id, key_material) = store.get_or_create(&subject()).unwrap();
        drop(store);

        let store = Store::with_persistence(master_key(), &tmp_dir).unwrap();
        assert!(Store::with_persistence(master_key(), &tmp_dir).is_err(), "store should be locked");
        assert_eq!(store.len(), 1);
        let record = store.inspect(&subject()).unwrap();
        assert_eq!(record.record_id(), &record_id);
        assert!(!record.is_revoked());
        assert_eq!(store.active_key(&subject()).unwrap(), key_material);
        store.revoke(&subject()).unwrap();
        drop(store);

        // revocation must survive a restart
        let store = Store::with_persistence(master_key(), &tmp_dir).unwrap();
        assert!(store.inspect(&subject()).unwrap().is_revoked());
        assert_eq!(store.get_or_create(&subject()).err(), Some(GetOrCreateKeyError::Revoked));
        drop(store);

        let other_master = MasterKey::from_hex("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff").unwrap();
        assert!(Store::with_persistence(other_master, &tmp_dir).is_err(), "store should not open with wrong master key");

        tmp_dir.close().unwrap_or_else(|e| {
            eprintln!("cannot delete temp dir {}: {}", tmp_dir_path.display(), e);
        });
    }
}
