//! Droplet abstraction layer.
//!
//! Defines the [`Droplet`] trait every message source implements, the
//! recoverable errors it may report, and the [`ProviderCatalog`] that turns a
//! provider type plus a [`Settings`] blob into a live droplet.
//!
//! Lifecycle rules (initialize before poll, idempotent destroy, no overlapping
//! polls, per-droplet dedup) are enforced by [`lifecycle::ManagedDroplet`], so
//! provider implementations only deal with their own transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ripple::Ripple;

pub mod lifecycle;
pub mod mail;
pub mod registry;
pub mod settings;

pub use settings::{ConfigError, Settings};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The droplet could not establish its backing session.
///
/// Recoverable: the droplet stays uninitialized and may be retried or
/// reconfigured.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The provider rejected the credentials.
    #[error("bad credentials: {0}")]
    BadCredentials(String),
    /// The endpoint could not be reached.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    /// Settings are present but cannot be used to connect.
    #[error("malformed settings: {0}")]
    MalformedSettings(String),
}

/// Transient failure during one poll cycle. The droplet stays initialized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The droplet did not report before the cycle deadline.
    #[error("poll timed out after {0:?}")]
    Timeout(Duration),
    /// Transport failure while fetching.
    #[error("transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A pluggable message source.
///
/// `initialize` and `poll` may block on network I/O; callers run them on
/// worker tasks only. Transport failures inside `poll` are returned as
/// [`PollError`], never panics.
#[async_trait]
pub trait Droplet: Send + Sync {
    /// Provider type string, matching the factory that built this droplet.
    fn provider(&self) -> &str;

    /// Credential identities served by this droplet (e.g. account addresses).
    ///
    /// Two live droplets of the same provider must not share any key.
    fn credential_keys(&self) -> Vec<String>;

    /// Establish the backing session.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] when the session cannot be opened.
    async fn initialize(&mut self) -> Result<(), InitError>;

    /// Fetch messages that arrived since the last successful poll.
    ///
    /// # Errors
    ///
    /// Returns [`PollError`] on transient transport failure.
    async fn poll(&mut self) -> Result<Vec<Ripple>, PollError>;

    /// Release connections and handles. Must tolerate repeated calls.
    async fn destroy(&mut self);

    /// Current serializable configuration.
    fn settings(&self) -> Settings;
}

/// Builds droplets of one provider type from settings.
pub trait DropletFactory: Send + Sync {
    /// Provider type this factory serves.
    fn provider(&self) -> &str;

    /// Validate a settings blob without building anything.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first problem found.
    fn validate(&self, settings: &Settings) -> Result<(), ConfigError>;

    /// Build an uninitialized droplet from validated settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings cannot be used.
    fn create(&self, settings: Settings) -> Result<Box<dyn Droplet>, ConfigError>;
}

/// Provider type → factory lookup.
#[derive(Default, Clone)]
pub struct ProviderCatalog {
    factories: HashMap<String, Arc<dyn DropletFactory>>,
}

impl std::fmt::Debug for ProviderCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCatalog")
            .field("providers", &self.providers())
            .finish()
    }
}

impl ProviderCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every provider shipped in this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(mail::MailDropletFactory::new(
            mail::maildir::MAILDIR_PROVIDER,
            Arc::new(mail::maildir::MaildirTransport::new()),
        )));
        catalog
    }

    /// Register a factory, replacing any previous one for the same provider.
    pub fn register(&mut self, factory: Arc<dyn DropletFactory>) {
        self.factories
            .insert(factory.provider().to_owned(), factory);
    }

    /// Registered provider types, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate settings for a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] or the factory's validation error.
    pub fn validate(&self, provider: &str, settings: &Settings) -> Result<(), ConfigError> {
        settings.validate_common()?;
        self.factory(provider)?.validate(settings)
    }

    /// Validate and build a droplet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the provider is unknown or settings are invalid.
    pub fn build(&self, provider: &str, settings: Settings) -> Result<Box<dyn Droplet>, ConfigError> {
        self.validate(provider, &settings)?;
        self.factory(provider)?.create(settings)
    }

    fn factory(&self, provider: &str) -> Result<&Arc<dyn DropletFactory>, ConfigError> {
        self.factories
            .get(provider)
            .ok_or_else(|| ConfigError::UnknownProvider(provider.to_owned()))
    }
}
