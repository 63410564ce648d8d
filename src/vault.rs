//! Master-key vault and per-droplet settings store.
//!
//! The vault never holds the passphrase itself, only a [`KeyDigest`]. Droplet
//! settings are kept next to it, undigested, and are only reachable while the
//! vault is unlocked.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::droplet::{ConfigError, Settings};
use crate::identifier::Identifier;

/// SHA-256 digest of the master passphrase, hex-encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyDigest(String);

impl std::fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyDigest(..)")
    }
}

impl KeyDigest {
    /// Digest a passphrase.
    pub fn of(key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a stored hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] unless `digest` is 64 hex characters.
    pub fn from_hex(digest: &str) -> Result<Self, ConfigError> {
        let decoded = hex::decode(digest)
            .map_err(|e| ConfigError::Malformed(format!("auth_key_digest: {e}")))?;
        if decoded.len() != 32 {
            return Err(ConfigError::Malformed(
                "auth_key_digest: expected a 32-byte digest".to_owned(),
            ));
        }
        Ok(Self(digest.to_ascii_lowercase()))
    }

    /// Hex form, as persisted.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Compare without short-circuiting on the first differing byte.
    pub fn matches(&self, other: &Self) -> bool {
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// The configuration record guarding the vault: the digest of the master key.
///
/// Replaced wholesale on key change, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    auth_key_digest: KeyDigest,
}

impl Configuration {
    /// Configuration for a new passphrase.
    pub fn from_key(key: &str) -> Self {
        Self {
            auth_key_digest: KeyDigest::of(key),
        }
    }

    /// Configuration loaded from a stored digest.
    pub fn from_digest(auth_key_digest: KeyDigest) -> Self {
        Self { auth_key_digest }
    }

    /// Stored digest.
    pub fn auth_key_digest(&self) -> &KeyDigest {
        &self.auth_key_digest
    }
}

/// Provider type plus settings blob of one droplet, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletRecord {
    /// Provider type.
    pub provider: String,
    /// Settings blob.
    pub settings: Settings,
}

/// Holds the key digest and the droplet settings it protects.
#[derive(Debug)]
pub struct CredentialVault {
    configuration: RwLock<Option<Arc<Configuration>>>,
    records: RwLock<BTreeMap<Identifier, DropletRecord>>,
    unlocked: AtomicBool,
}

impl Default for CredentialVault {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVault {
    /// Vault with no key set yet (first run).
    pub fn new() -> Self {
        Self {
            configuration: RwLock::new(None),
            records: RwLock::new(BTreeMap::new()),
            unlocked: AtomicBool::new(false),
        }
    }

    /// Locked vault restored from persisted state.
    pub fn restore(configuration: Configuration, records: BTreeMap<Identifier, DropletRecord>) -> Self {
        Self {
            configuration: RwLock::new(Some(Arc::new(configuration))),
            records: RwLock::new(records),
            unlocked: AtomicBool::new(false),
        }
    }

    /// Whether a master key has been set.
    pub fn has_key(&self) -> bool {
        self.configuration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Current configuration, if a key is set.
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.configuration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check a candidate passphrase; a match unlocks the vault.
    ///
    /// Returns `false` when no key has been set.
    pub fn unlock(&self, candidate: &str) -> bool {
        let Some(configuration) = self.configuration() else {
            warn!("unlock attempted before a master key was set");
            return false;
        };
        let matched = configuration
            .auth_key_digest()
            .matches(&KeyDigest::of(candidate));
        if matched {
            self.unlocked.store(true, Ordering::Release);
            info!("vault unlocked");
        } else {
            warn!("vault unlock rejected");
        }
        matched
    }

    /// Replace the master key. The vault is unlocked afterwards.
    pub fn set_key(&self, new_key: &str) {
        let configuration = Arc::new(Configuration::from_key(new_key));
        *self
            .configuration
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(configuration);
        self.unlocked.store(true, Ordering::Release);
        info!("master key set");
    }

    /// Close the settings gate.
    pub fn lock(&self) {
        self.unlocked.store(false, Ordering::Release);
    }

    /// Whether settings are currently reachable.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Acquire)
    }

    fn ensure_unlocked(&self) -> Result<(), ConfigError> {
        if self.is_unlocked() {
            Ok(())
        } else {
            Err(ConfigError::Locked)
        }
    }

    /// Settings record of one droplet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] while locked.
    pub fn record(&self, id: Identifier) -> Result<Option<DropletRecord>, ConfigError> {
        self.ensure_unlocked()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    /// All settings records, keyed by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] while locked.
    pub fn records(&self) -> Result<BTreeMap<Identifier, DropletRecord>, ConfigError> {
        self.ensure_unlocked()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    /// Store or replace a droplet's settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] while locked.
    pub fn put_record(&self, id: Identifier, record: DropletRecord) -> Result<(), ConfigError> {
        self.ensure_unlocked()?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record);
        Ok(())
    }

    /// Forget a droplet's settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] while locked.
    pub fn remove_record(&self, id: Identifier) -> Result<Option<DropletRecord>, ConfigError> {
        self.ensure_unlocked()?;
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id))
    }

    /// Identifiers with stored settings. Not gated: identifiers are not secret.
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}
