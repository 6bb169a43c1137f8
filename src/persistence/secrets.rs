//! Secret storage for saved-connection passwords.
//!
//! Uses the OS keyring when it is available; otherwise passwords stay in
//! the connections file in plaintext and a warning is logged. Keyring
//! availability is probed once per instance.

use keyring::Entry;
use tracing::{debug, warn};

use crate::error::{DbRheoError, Result};

const SERVICE_NAME: &str = "dbrheo";

/// Keyring-backed secret storage with plaintext fallback.
#[derive(Debug, Clone)]
pub struct SecretStorage {
    keyring_available: bool,
}

impl Default for SecretStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStorage {
    /// Creates a storage instance, probing keyring availability.
    pub fn new() -> Self {
        let keyring_available = Self::probe_keyring();
        if !keyring_available {
            warn!("OS keyring unavailable; connection passwords will be stored in plaintext");
        }
        Self { keyring_available }
    }

    /// A storage instance that never touches the OS keyring (tests).
    pub fn plaintext_only() -> Self {
        Self {
            keyring_available: false,
        }
    }

    /// Probes whether the OS keyring is available and persistent.
    fn probe_keyring() -> bool {
        let test_entry = match Entry::new(SERVICE_NAME, "__probe__") {
            Ok(e) => e,
            Err(e) => {
                debug!("Keyring probe: failed to create entry: {}", e);
                return false;
            }
        };

        // Mock credential backends are non-persistent.
        if format!("{test_entry:?}").contains("MockCredential") {
            debug!("Keyring probe: mock backend detected, treating as unavailable");
            return false;
        }

        match test_entry.set_password("test") {
            Ok(()) => {
                let _ = test_entry.delete_credential();
                true
            }
            Err(e) => {
                debug!("Keyring probe: failed to set password: {}", e);
                false
            }
        }
    }

    /// Whether secrets go to the OS keyring.
    pub fn is_secure(&self) -> bool {
        self.keyring_available
    }

    /// Stores a password for an alias. Returns false when the keyring is
    /// unavailable and the caller must persist the value itself.
    pub fn store(&self, alias: &str, password: &str) -> Result<bool> {
        if !self.keyring_available {
            return Ok(false);
        }
        let entry = Entry::new(SERVICE_NAME, alias)
            .map_err(|e| DbRheoError::config(format!("Failed to create keyring entry: {e}")))?;
        entry
            .set_password(password)
            .map_err(|e| DbRheoError::config(format!("Failed to store secret: {e}")))?;
        Ok(true)
    }

    /// Retrieves a password for an alias, if the keyring holds one.
    pub fn retrieve(&self, alias: &str) -> Option<String> {
        if !self.keyring_available {
            return None;
        }
        Entry::new(SERVICE_NAME, alias)
            .ok()
            .and_then(|entry| entry.get_password().ok())
    }

    /// Deletes the password for an alias, ignoring absence.
    pub fn delete(&self, alias: &str) {
        if !self.keyring_available {
            return;
        }
        if let Ok(entry) = Entry::new(SERVICE_NAME, alias) {
            let _ = entry.delete_credential();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_only_never_stores() {
        let storage = SecretStorage::plaintext_only();
        assert!(!storage.is_secure());
        assert!(!storage.store("alias", "secret").unwrap());
        assert!(storage.retrieve("alias").is_none());
    }
}
