use std::fmt::{Debug, Display, Formatter, Result as FormatResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subject::SubjectId;

// fixed value overwriting wrapped key material once a subject is erased
pub const WRAPPED_KEY_TOMBSTONE: &str = "<shredded>";

/// One row per subject. Created on first encryption, flagged on revocation,
/// never physically removed.
#[derive(Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct KeyRecord {
    record_id: Uuid,
    subject_id: SubjectId,
    created: DateTime<Utc>,
    state: State,
    wrapped_key: Option<String>,
}

impl KeyRecord {
    pub fn new(subject_id: SubjectId, wrapped_key: Option<String>) -> KeyRecord {
        KeyRecord {
            record_id: Uuid::new_v4(),
            subject_id,
            created: Utc::now(),
            state: State::Active,
            wrapped_key,
        }
    }

    #[inline]
    pub fn record_id(&self) -> &Uuid {
        &self.record_id
    }

    #[inline]
    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    #[inline]
    pub fn created(&self) -> &DateTime<Utc> {
        &self.created
    }

    #[inline]
    pub fn state(&self) -> &State {
        &self.state
    }

    #[inline]
    pub fn wrapped_key(&self) -> Option<&str> {
        self.wrapped_key.as_deref()
    }

    pub fn is_revoked(&self) -> bool {
        if let State::Revoked(_) = self.state {
            true
        } else {
            false
        }
    }

    pub fn revoked_at(&self) -> Option<&DateTime<Utc>> {
        match self.state {
            State::Revoked(ref date) => Some(date),
            State::Active => None,
        }
    }

    /// Monotonic: flips `Active` to `Revoked` and scrubs the wrapped key
    /// material; a repeat call changes nothing. Returns whether this call
    /// performed the flip. There is no inverse operation.
    pub fn revoke(&mut self) -> bool {
        if self.is_revoked() {
            return false;
        }
        self.state = State::Revoked(Utc::now());
        if self.wrapped_key.is_some() {
            self.wrapped_key = Some(String::from(WRAPPED_KEY_TOMBSTONE));
        }
        true
    }

    pub fn verify_integrity(&self) -> Result<(), ()> {
        // should be called on de-serialisation
        let ok = match self.state {
            State::Active => self.wrapped_key.as_deref() != Some(WRAPPED_KEY_TOMBSTONE),
            State::Revoked(_) => match self.wrapped_key.as_deref() {
                None => true,
                Some(wrapped_key) => wrapped_key == WRAPPED_KEY_TOMBSTONE,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(())
        }
    }
}

impl Display for KeyRecord {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(f, "{} ({})", self.subject_id, self.state)
    }
}

impl Debug for KeyRecord {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        Display::fmt(self, f)
    }
}

/// `Active` is entered at most once per subject; `Revoked` is absorbing.
/// No other states or transitions exist.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub enum State {
    Active,
    Revoked(DateTime<Utc>),
}

impl State {
    pub fn name(&self) -> &str {
        match self {
            State::Active => "Active",
            State::Revoked(_) => "Revoked",
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        match self {
            State::Active => write!(f, "active"),
            State::Revoked(date) => write!(f, "revoked {}", date),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> SubjectId {
        SubjectId::from_phone("0901234567")
    }

    #[test]
    fn basics() {
        let record = KeyRecord::new(subject(), Some(String::from("d3JhcHBlZA==")));
        assert!(record.verify_integrity().is_ok());
        assert_eq!(record.subject_id(), &subject());
        assert_eq!(record.state(), &State::Active);
        assert_eq!(record.state().name(), "Active");
        assert!(!record.is_revoked());
        assert!(record.revoked_at().is_none());
        assert_eq!(record.wrapped_key(), Some("d3JhcHBlZA=="));
        assert_eq!(format!("{}", record), format!("{} (active)", subject()));
    }

    #[test]
    fn revoke_is_monotonic() {
        let mut record = KeyRecord::new(subject(), Some(String::from("d3JhcHBlZA==")));
        assert!(record.revoke());
        assert!(record.is_revoked());
        assert!(record.revoked_at().is_some());
        assert_eq!(record.wrapped_key(), Some(WRAPPED_KEY_TOMBSTONE));
        assert!(record.verify_integrity().is_ok());

        let revoked_at = record.revoked_at().cloned();
        assert!(!record.revoke());
        assert_eq!(record.revoked_at().cloned(), revoked_at);
        assert_eq!(record.state().name(), "Revoked");
    }

    #[test]
    fn revoke_without_wrapped_key() {
        let mut record = KeyRecord::new(subject(), None);
        assert!(record.revoke());
        assert_eq!(record.wrapped_key(), None);
        assert!(record.verify_integrity().is_ok());
    }

    #[test]
    fn integrity() {
        let json = serde_json::to_string(&KeyRecord::new(subject(), None)).unwrap();
        let record: KeyRecord = serde_json::from_str(&json).unwrap();
        assert!(record.verify_integrity().is_ok());

        // a revoked record must not retain wrapped key material
        let mut record = KeyRecord::new(subject(), Some(String::from("d3JhcHBlZA==")));
        assert!(record.revoke());
        let json = serde_json::to_string(&record).unwrap();
        let tampered = json.replace(WRAPPED_KEY_TOMBSTONE, "d3JhcHBlZA==");
        let record: KeyRecord = serde_json::from_str(&tampered).unwrap();
        assert!(record.verify_integrity().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let mut record = KeyRecord::new(subject(), Some(String::from("d3JhcHBlZA==")));
        assert!(record.revoke());
        let json = serde_json::to_string(&record).unwrap();
        let restored: KeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.record_id(), record.record_id());
        assert_eq!(restored.subject_id(), record.subject_id());
        assert!(restored.is_revoked());
        assert_eq!(restored.wrapped_key(), Some(WRAPPED_KEY_TOMBSTONE));
    }
}
