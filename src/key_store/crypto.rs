use std::convert::TryInto;
use std::fmt::{Debug, Formatter, Result as FormatResult};

use base64::encode as b64encode;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};

use crate::key_store::errors::*;
use crate::subject::SubjectId;

// length of key material for AES_256_GCM
pub const KEY_MATERIAL_LEN: usize = 32;  // AES_256_GCM.key_len()
// length to extend encrypted data for AES_256_GCM
const TAG_LEN: usize = 16;  // AES_256_GCM.tag_len()
// length of AES_256_GCM nonce
const NONCE_LEN: usize = 12;  // AES_256_GCM.nonce_len()

pub const MIN_ENCRYPTED_DATA_LEN: usize = TAG_LEN + NONCE_LEN;

// context string binding derived keys to this subsystem; changing it orphans all cipher text
const SUBJECT_KEY_INFO: &[u8] = b"booking-pii/subject-key/v1";

pub type KeyMaterial = [u8; KEY_MATERIAL_LEN];

/// Process-wide root secret. Loaded once at start-up, read-only afterwards,
/// never persisted or printed by this crate.
pub struct MasterKey(KeyMaterial);

impl MasterKey {
    pub fn from_hex(hex_str: &str) -> Result<MasterKey, ConfigurationError> {
        let hex_str = hex_str.trim();
        if hex_str.is_empty() {
            return Err(ConfigurationError::Missing);
        }
        if hex_str.len() != 2 * KEY_MATERIAL_LEN {
            return Err(ConfigurationError::Malformed);
        }
        let bytes = hex::decode(hex_str)
            .or(Err(ConfigurationError::Malformed))?;
        let key_material = bytes.as_slice().try_into()
            .or(Err(ConfigurationError::Malformed))?;
        Ok(MasterKey(key_material))
    }

    #[inline]
    pub(crate) fn key_material(&self) -> &KeyMaterial {
        &self.0
    }
}

impl Debug for MasterKey {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        // key bytes must never reach logs
        write!(f, "MasterKey(..)")
    }
}

/// HKDF-SHA256 with the subject id as salt. Deterministic: the same master
/// key and subject always yield the same key, so derived keys are never
/// stored for reuse and erasure must go through the revocation gate instead.
pub fn derive_subject_key(master_key: &MasterKey, subject_id: &SubjectId) -> Result<KeyMaterial, DeriveKeyError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, subject_id.as_str().as_bytes());
    let prk = salt.extract(master_key.key_material());
    let okm = prk
        .expand(&[SUBJECT_KEY_INFO], hkdf::HKDF_SHA256)
        .or(Err(DeriveKeyError))?;
    let mut key_material = [0u8; KEY_MATERIAL_LEN];
    okm.fill(&mut key_material)
        .or(Err(DeriveKeyError))?;
    Ok(key_material)
}

/// Forensic copy of a freshly issued subject key, sealed under the master key
/// with the subject id as additional data. Never unwrapped on the hot path.
pub fn wrap_subject_key(key_material: &KeyMaterial, master_key: &MasterKey, subject_id: &SubjectId) -> Result<String, WrapKeyError> {
    let mut data = key_material.to_vec();
    raw_encrypt(&mut data, master_key.key_material(), subject_id.as_str().as_bytes())
        .or(Err(WrapKeyError))?;
    Ok(b64encode(&data))
}

pub fn raw_decrypt(data: &mut Vec<u8>, key: &KeyMaterial, aad: &[u8]) -> Result<(), RawDecryptError> {
    // NB: data must end with tag and nonce
    let len = data.len();
    if len < MIN_ENCRYPTED_DATA_LEN {
        return Err(RawDecryptError::Length);
    }
    let nonce_offset = len - NONCE_LEN;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[nonce_offset..]);
    data.truncate(nonce_offset);
    let opening_key = UnboundKey::new(&AES_256_GCM, key)
        .map(LessSafeKey::new)
        .or(Err(RawDecryptError::InvalidKey))?;
    let plain_text_len = opening_key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), data)
        .or(Err(RawDecryptError::Error))?
        .len();
    data.truncate(plain_text_len);
    Ok(())
}

pub fn raw_encrypt(data: &mut Vec<u8>, key: &KeyMaterial, aad: &[u8]) -> Result<(), RawEncryptError> {
    // NB: extends data with tag and nonce; nonce is random per call and never reused
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new().fill(&mut nonce).expect("cannot generate nonce");
    let sealing_key = UnboundKey::new(&AES_256_GCM, key)
        .map(LessSafeKey::new)
        .or(Err(RawEncryptError::InvalidKey))?;
    sealing_key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), data)
        .or(Err(RawEncryptError::Error))?;
    data.extend_from_slice(&nonce);
    Ok(())
}
