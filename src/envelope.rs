use std::fmt::{Debug, Formatter, Result as FormatResult};

use base64::{decode as b64decode, encode as b64encode};
use serde::{Deserialize, Serialize};

use crate::key_store::crypto::{raw_decrypt, raw_encrypt, KeyMaterial, MIN_ENCRYPTED_DATA_LEN};

define_error!(EncryptFieldError = "cannot encrypt field");
define_error!(DecryptFieldError; Encoding="invalid field encoding", Authentication="cannot authenticate field", Utf8="field is not valid utf-8");

/// A single encrypted PII attribute, encoded as one opaque string:
/// base64 of cipher text extended with tag and nonce.
/// Fields of the same bundle are independent cipher texts and are never
/// recombined.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct EncryptedField(String);

impl EncryptedField {
    /// Rehydrate a value previously produced by [`encrypt_field`], e.g. one
    /// read back from a booking row.
    pub fn from_encoded<T>(encoded: T) -> EncryptedField where T: Into<String> {
        EncryptedField(encoded.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for EncryptedField {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        // cipher text is opaque; the length is enough for diagnostics
        write!(f, "EncryptedField({} chars)", self.0.len())
    }
}

pub fn encrypt_field(plain_text: &str, key: &KeyMaterial, aad: &[u8]) -> Result<EncryptedField, EncryptFieldError> {
    let mut data = plain_text.as_bytes().to_vec();
    raw_encrypt(&mut data, key, aad)
        .or(Err(EncryptFieldError))?;
    Ok(EncryptedField(b64encode(&data)))
}

/// Verifies the authentication tag before returning anything: on failure no
/// partial plain text escapes.
pub fn decrypt_field(field: &EncryptedField, key: &KeyMaterial, aad: &[u8]) -> Result<String, DecryptFieldError> {
    let mut data = b64decode(&field.0)
        .or(Err(DecryptFieldError::Encoding))?;
    if data.len() < MIN_ENCRYPTED_DATA_LEN {
        return Err(DecryptFieldError::Encoding);
    }
    raw_decrypt(&mut data, key, aad)
        .or(Err(DecryptFieldError::Authentication))?;
    String::from_utf8(data)
        .or(Err(DecryptFieldError::Utf8))
}
