use std::sync::Arc;

use crate::key_store::errors::RevokeKeyError;
use crate::key_store::Store;
use crate::subject::SubjectId;

/// The one way to destroy access to a subject's data. Both external
/// triggers — the scheduled expiry sweep and the administrative erase
/// action — funnel into [`Store::revoke`]; no secondary code path exists, so
/// the erasure guarantee stays auditable.
pub struct Revoker {
    store: Arc<Store>,
}

impl Revoker {
    pub fn new(store: Arc<Store>) -> Revoker {
        Revoker { store }
    }

    /// Administrative "erase this patient" action.
    pub fn erase(&self, subject_id: &SubjectId) -> Result<(), RevokeKeyError> {
        self.store.revoke(subject_id).map(|_| ())
    }

    /// Periodic sweep input: subjects with zero remaining active bookings.
    /// Subjects already revoked or never seen count as erased and are
    /// skipped. Returns how many records this pass newly revoked.
    pub fn sweep<I>(&self, subject_ids: I) -> Result<usize, RevokeKeyError> where I: IntoIterator<Item = SubjectId> {
        let mut revoked = 0;
        for subject_id in subject_ids {
            if self.store.revoke(&subject_id)? {
                revoked += 1;
            }
        }
        if revoked > 0 {
            info!("Expiry sweep revoked {} subjects", revoked);
        }
        Ok(revoked)
    }
}
