use std::env;

use crate::key_store::errors::ConfigurationError;
use crate::key_store::MasterKey;

/// Reads the master key from the environment at process start. Fails fast on
/// a missing or malformed value; there is no degraded mode without a key.
pub fn master_key_from_env(var: &str) -> Result<MasterKey, ConfigurationError> {
    let hex_str = env::var(var)
        .or(Err(ConfigurationError::Missing))?;
    MasterKey::from_hex(&hex_str)
}
