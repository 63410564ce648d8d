//! Persisted state: the key digest plus every droplet's settings.
//!
//! Stored as pretty JSON. Identifiers are map keys in decimal form, so a
//! document that is loaded and saved without edits comes back equivalent.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::enforce_private_file_permissions;
use crate::droplet::ConfigError;
use crate::identifier::Identifier;
use crate::vault::{Configuration, CredentialVault, DropletRecord, KeyDigest};

/// On-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Hex digest of the master key.
    pub auth_key_digest: String,
    /// Droplet records keyed by identifier.
    #[serde(default)]
    pub droplets: BTreeMap<String, DropletRecord>,
}

impl StateDocument {
    /// Validate and split into configuration and typed records.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] on a bad digest, or on an identifier
    /// key that is not in canonical decimal form (`"04"`, `" 4"`, `"+4"`).
    pub fn into_parts(self) -> Result<(Configuration, BTreeMap<Identifier, DropletRecord>), ConfigError> {
        let digest = KeyDigest::from_hex(&self.auth_key_digest)?;
        let mut records = BTreeMap::new();
        for (key, record) in self.droplets {
            let id: Identifier = key
                .parse()
                .map_err(|e| ConfigError::Malformed(format!("droplet key `{key}`: {e}")))?;
            if id.to_string() != key {
                return Err(ConfigError::Malformed(format!(
                    "droplet key `{key}` is not canonical, expected `{id}`"
                )));
            }
            if records.insert(id, record).is_some() {
                return Err(ConfigError::Malformed(format!("droplet {id} listed twice")));
            }
        }
        Ok((Configuration::from_digest(digest), records))
    }

    /// Build a document from configuration and records.
    pub fn from_parts(configuration: &Configuration, records: &BTreeMap<Identifier, DropletRecord>) -> Self {
        Self {
            auth_key_digest: configuration.auth_key_digest().as_hex().to_owned(),
            droplets: records
                .iter()
                .map(|(id, record)| (id.to_string(), record.clone()))
                .collect(),
        }
    }

    /// Snapshot an unlocked vault.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] while locked, or
    /// [`ConfigError::Missing`] if no key has been set.
    pub fn from_vault(vault: &CredentialVault) -> Result<Self, ConfigError> {
        let records = vault.records()?;
        let configuration = vault
            .configuration()
            .ok_or_else(|| ConfigError::Missing("auth_key_digest".to_owned()))?;
        Ok(Self::from_parts(&configuration, &records))
    }
}

/// Load the state document, or `None` if the file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(path: &Path) -> anyhow::Result<Option<StateDocument>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state at {}", path.display()))?;
    let document: StateDocument = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse state at {}", path.display()))?;
    debug!(path = %path.display(), droplets = document.droplets.len(), "state loaded");
    Ok(Some(document))
}

/// Write the state document through a temporary file and rename, so a crash
/// never leaves a half-written document behind.
///
/// # Errors
///
/// Returns an error if serialization or any filesystem step fails.
pub fn save_state(path: &Path, document: &StateDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(document).context("failed to serialize state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    enforce_private_file_permissions(&tmp)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move state into {}", path.display()))?;
    debug!(path = %path.display(), droplets = document.droplets.len(), "state saved");
    Ok(())
}
