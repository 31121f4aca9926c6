use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{decrypt_field, encrypt_field, EncryptedField};
use crate::key_store::errors::{ActiveKeyError, GetOrCreateKeyError};
use crate::key_store::Store;
use crate::subject::SubjectId;

define_error!(EncryptPiiError; SubjectRevoked="subject has been erased", Derivation="cannot derive subject key", Storage="cannot persist key records", Encryption="cannot encrypt field");

// field labels bound as additional data so attribute cipher texts cannot be
// swapped within a bundle
const NAME_LABEL: &[u8] = b"name";
const PHONE_LABEL: &[u8] = b"phone";
const CONDITION_LABEL: &[u8] = b"condition";
const NOTES_LABEL: &[u8] = b"notes";

/// The four patient attributes this subsystem protects.
#[derive(Clone, PartialEq, Eq)]
pub struct PlaintextPii {
    pub name: String,
    pub phone: String,
    pub condition: String,
    pub notes: String,
}

impl Debug for PlaintextPii {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        // plain patient data must never reach logs
        write!(f, "PlaintextPii(<redacted>)")
    }
}

/// Encrypted rendition of one patient's PII, owned by the external booking
/// row. Whether it can ever be opened again is governed entirely by the
/// subject's key record, not by anything stored here.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PiiBundle {
    subject_id: SubjectId,
    key_record_id: Uuid,
    name: EncryptedField,
    phone: EncryptedField,
    condition: EncryptedField,
    notes: EncryptedField,
}

impl PiiBundle {
    #[inline]
    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    #[inline]
    pub fn key_record_id(&self) -> &Uuid {
        &self.key_record_id
    }
}

/// Composes hashing, key management and the envelope cipher into the two
/// operations the booking flows call. Authorisation and audit logging around
/// them belong to the callers.
pub struct PiiCodec {
    store: Arc<Store>,
}

impl PiiCodec {
    pub fn new(store: Arc<Store>) -> PiiCodec {
        PiiCodec { store }
    }

    /// Encrypts the four fields independently under the subject's key; each
    /// seal uses its own nonce so cipher texts carry no cross-field
    /// correlation. Key store failures propagate as hard errors: proceeding
    /// without a key would mean losing data or storing plain text.
    pub fn encrypt_fields(&self, pii: &PlaintextPii) -> Result<PiiBundle, EncryptPiiError> {
        let subject_id = SubjectId::from_phone(&pii.phone);
        let (key_record_id, key_material) = self.store.get_or_create(&subject_id)
            .map_err(|e| match e {
                GetOrCreateKeyError::Revoked => EncryptPiiError::SubjectRevoked,
                GetOrCreateKeyError::Derivation => EncryptPiiError::Derivation,
                GetOrCreateKeyError::Wrap => EncryptPiiError::Encryption,
                GetOrCreateKeyError::Storage => EncryptPiiError::Storage,
            })?;
        let seal = |plain_text: &str, label: &[u8]| {
            encrypt_field(plain_text, &key_material, label)
                .or(Err(EncryptPiiError::Encryption))
        };
        Ok(PiiBundle {
            name: seal(&pii.name, NAME_LABEL)?,
            phone: seal(&pii.phone, PHONE_LABEL)?,
            condition: seal(&pii.condition, CONDITION_LABEL)?,
            notes: seal(&pii.notes, NOTES_LABEL)?,
            subject_id,
            key_record_id,
        })
    }

    /// Missing record, revoked record and failed authentication all collapse
    /// to `None`: a caller must not be able to tell a patient who exercised
    /// their erasure right apart from tampered cipher text.
    pub fn decrypt_fields(&self, bundle: &PiiBundle) -> Option<PlaintextPii> {
        let key_material = match self.store.active_key(&bundle.subject_id) {
            Ok(key_material) => key_material,
            Err(ActiveKeyError::NotFound) | Err(ActiveKeyError::Revoked) => return None,
            Err(e) => {
                error!("Cannot obtain key for subject {}: {}", &bundle.subject_id, e);
                return None;
            },
        };
        let open = |field: &EncryptedField, label: &[u8]| {
            decrypt_field(field, &key_material, label)
                .map_err(|e| warn!("Cannot open field for subject {}: {}", &bundle.subject_id, e))
                .ok()
        };
        Some(PlaintextPii {
            name: open(&bundle.name, NAME_LABEL)?,
            phone: open(&bundle.phone, PHONE_LABEL)?,
            condition: open(&bundle.condition, CONDITION_LABEL)?,
            notes: open(&bundle.notes, NOTES_LABEL)?,
        })
    }
}
