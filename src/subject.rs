use std::convert::TryFrom;
use std::fmt::{Debug, Display, Formatter, Result as FormatResult};
use std::str::FromStr;

use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};

define_error!(ParseSubjectIdError; Length="subject id must be 64 characters", Encoding="subject id must be lowercase hex");

/// Pseudonymous patient identifier: SHA-256 of the normalised phone number.
/// Deterministic, so the same patient always maps to the same key record
/// without the raw phone number ever being stored.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    /// Normalisation is whitespace trimming only; no failure modes.
    pub fn from_phone(phone: &str) -> SubjectId {
        let digest = digest(&SHA256, phone.trim().as_bytes());
        SubjectId(hex::encode(digest.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SubjectId {
    type Err = ParseSubjectIdError;

    fn from_str(subject_id: &str) -> Result<SubjectId, ParseSubjectIdError> {
        if subject_id.len() != 64 {
            return Err(ParseSubjectIdError::Length);
        }
        if !subject_id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(ParseSubjectIdError::Encoding);
        }
        Ok(SubjectId(String::from(subject_id)))
    }
}

impl TryFrom<String> for SubjectId {
    type Error = ParseSubjectIdError;

    fn try_from(subject_id: String) -> Result<SubjectId, ParseSubjectIdError> {
        subject_id.parse()
    }
}

impl From<SubjectId> for String {
    fn from(subject_id: SubjectId) -> String {
        subject_id.0
    }
}

impl Display for SubjectId {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(f, "{}", &self.0)
    }
}

impl Debug for SubjectId {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        Display::fmt(self, f)
    }
}
