define_error!(ConfigurationError; Missing="master key is missing", Malformed="master key must be 64 hex characters");

define_error!(RawDecryptError; Length="invalid length", InvalidKey="invalid key", Error="cannot decrypt");
define_error!(RawEncryptError; InvalidKey="invalid key", Error="cannot encrypt");
define_error!(DeriveKeyError = "cannot derive subject key");
define_error!(WrapKeyError = "cannot wrap subject key");

define_error!(GetOrCreateKeyError; Revoked="subject has been erased", Derivation="cannot derive subject key", Wrap="cannot wrap subject key", Storage="cannot persist key records");
define_error!(ActiveKeyError; NotFound="no key record for subject", Revoked="subject has been erased", Derivation="cannot derive subject key");
define_error!(RevokeKeyError; Storage="cannot persist key records");

define_error!(AddRecordError; DuplicateSubject="key record already exists for subject");
define_error!(LoadRecordsError; InvalidRecords="some records are invalid", DuplicateSubjects="some subjects appear more than once");
