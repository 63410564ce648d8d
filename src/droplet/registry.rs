//! Owning collection of configured droplets.
//!
//! Mutated from the interactive side only. The scheduler takes a
//! [`DropletRegistry::snapshot`] once per cycle and never holds the lock
//! across a poll.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::lifecycle::{LifecycleState, ManagedDroplet};
use crate::identifier::Identifier;

/// Registry mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A live droplet already serves this provider/credential pair.
    #[error("droplet {existing} already serves {provider} credential `{credential}`")]
    Duplicate {
        /// Droplet holding the credential.
        existing: Identifier,
        /// Provider type.
        provider: String,
        /// Shared credential key.
        credential: String,
    },
    /// The identifier is already registered.
    #[error("identifier {0} is already registered")]
    IdentifierInUse(Identifier),
    /// No droplet with this identifier.
    #[error("no droplet with identifier {0}")]
    NotFound(Identifier),
}

/// Identifier → droplet map.
#[derive(Debug, Default)]
pub struct DropletRegistry {
    entries: RwLock<HashMap<Identifier, Arc<ManagedDroplet>>>,
}

fn conflict(
    entries: &HashMap<Identifier, Arc<ManagedDroplet>>,
    candidate: &ManagedDroplet,
    ignore: Option<Identifier>,
) -> Option<RegistryError> {
    entries
        .values()
        .filter(|existing| Some(existing.id()) != ignore)
        .filter(|existing| existing.provider() == candidate.provider())
        .find_map(|existing| {
            candidate
                .credential_keys()
                .iter()
                .find(|key| existing.credential_keys().contains(key))
                .map(|key| RegistryError::Duplicate {
                    existing: existing.id(),
                    provider: candidate.provider().to_owned(),
                    credential: key.clone(),
                })
        })
}

impl DropletRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a droplet under its own identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdentifierInUse`] or [`RegistryError::Duplicate`].
    pub fn insert(&self, droplet: Arc<ManagedDroplet>) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = droplet.id();
        if entries.contains_key(&id) {
            return Err(RegistryError::IdentifierInUse(id));
        }
        if let Some(err) = conflict(&entries, &droplet, None) {
            return Err(err);
        }
        info!(droplet = %id, provider = %droplet.provider(), "droplet registered");
        entries.insert(id, droplet);
        Ok(())
    }

    /// Swap the droplet registered under the new droplet's identifier.
    ///
    /// The previous droplet is retired (excluded from future cycles, in-flight
    /// work cancelled) and returned so the caller can release it off the
    /// interactive thread.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or [`RegistryError::Duplicate`]; the
    /// registry is unchanged on error.
    pub fn replace(&self, droplet: Arc<ManagedDroplet>) -> Result<Arc<ManagedDroplet>, RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = droplet.id();
        if !entries.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        if let Some(err) = conflict(&entries, &droplet, Some(id)) {
            return Err(err);
        }
        let previous = entries
            .insert(id, droplet)
            .ok_or(RegistryError::NotFound(id))?;
        previous.retire();
        info!(droplet = %id, "droplet replaced");
        Ok(previous)
    }

    /// Remove and retire a droplet.
    ///
    /// Resource release is left to the caller via [`ManagedDroplet::destroy`].
    pub fn remove(&self, id: Identifier) -> Option<Arc<ManagedDroplet>> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(ref droplet) = removed {
            droplet.retire();
            info!(droplet = %id, "droplet removed");
        }
        removed
    }

    /// Look up one droplet.
    pub fn get(&self, id: Identifier) -> Option<Arc<ManagedDroplet>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// All droplets sorted by identifier. The lock is released on return.
    pub fn snapshot(&self) -> Vec<Arc<ManagedDroplet>> {
        let mut all: Vec<Arc<ManagedDroplet>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|droplet| droplet.id());
        debug!(count = all.len(), "registry snapshot taken");
        all
    }

    /// Initialized droplets sorted by identifier.
    pub fn initialized(&self) -> Vec<Arc<ManagedDroplet>> {
        self.snapshot()
            .into_iter()
            .filter(|droplet| droplet.state() == LifecycleState::Initialized)
            .collect()
    }

    /// Number of registered droplets.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and retire every droplet, returning them for release.
    pub fn drain(&self) -> Vec<Arc<ManagedDroplet>> {
        let mut drained: Vec<Arc<ManagedDroplet>> = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, droplet)| droplet)
            .collect();
        drained.sort_by_key(|droplet| droplet.id());
        for droplet in &drained {
            droplet.retire();
        }
        drained
    }
}
