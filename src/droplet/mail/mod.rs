//! Mail-family droplets.
//!
//! Wire protocols plug in behind [`MailTransport`]; everything above the
//! transport is shared. Each account is served by a [`link::MailboxLink`],
//! which owns the session, the uid high-water mark and the message → ripple
//! conversion. Two droplets compose it:
//! - [`MailDroplet`]: one account.
//! - [`composite::CompositeMailDroplet`]: several accounts of the same
//!   provider under one configuration.
//!
//! [`MailDropletFactory`] picks between them: settings carrying an `accounts`
//! array build a composite, otherwise a single-account droplet.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConfigError, Droplet, DropletFactory, InitError, PollError, Settings};
use crate::ripple::Ripple;

pub mod composite;
pub mod link;
pub mod maildir;

pub use composite::CompositeMailDroplet;
pub use link::MailboxLink;

// ---------------------------------------------------------------------------
// Transport boundary
// ---------------------------------------------------------------------------

/// One message as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Transport-assigned uid, increasing within one mailbox.
    pub uid: u64,
    /// Sender as displayed.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Receive time.
    pub received_at: DateTime<Utc>,
}

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Endpoint could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// I/O or protocol failure on an established session.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<TransportError> for InitError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Auth(msg) => Self::BadCredentials(msg),
            TransportError::Unreachable(msg) | TransportError::Io(msg) => Self::Unreachable(msg),
        }
    }
}

impl From<TransportError> for PollError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Opens sessions against one kind of mail store.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Open an authenticated session for `account`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the store rejects or cannot be reached.
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, TransportError>;
}

/// An open session to one mailbox.
#[async_trait]
pub trait MailSession: Send + Sync {
    /// Messages with uid strictly greater than `after_uid` (all when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on transport failure.
    async fn fetch_since(&mut self, after_uid: Option<u64>) -> Result<Vec<MailMessage>, TransportError>;

    /// Close the session. Must tolerate repeated calls.
    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Credentials and endpoint of one mail account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAccount {
    /// Account address; also the duplicate-detection key.
    pub address: String,
    /// Server address or local path, transport-specific.
    pub endpoint: String,
    /// Password or token, if the transport needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl std::fmt::Debug for MailAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailAccount")
            .field("address", &self.address)
            .field("endpoint", &self.endpoint)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl MailAccount {
    /// Duplicate-detection key.
    pub fn credential_key(&self) -> String {
        self.address.trim().to_lowercase()
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: format!("{field}.address"),
                reason: "must not be empty".to_owned(),
            });
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: format!("{field}.endpoint"),
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

/// Settings key holding a composite droplet's account list.
pub const ACCOUNTS_FIELD: &str = "accounts";

/// Extract the accounts a settings blob describes.
///
/// Single-account settings carry `address`, `endpoint` and optional `secret`
/// as top-level fields; composite settings carry an `accounts` array.
///
/// # Errors
///
/// Returns [`ConfigError`] on missing fields, an empty account list, or the
/// same address listed twice.
pub fn accounts_from_settings(settings: &Settings) -> Result<Vec<MailAccount>, ConfigError> {
    let accounts = match settings.fields.get(ACCOUNTS_FIELD) {
        Some(raw) => {
            let accounts: Vec<MailAccount> =
                serde_json::from_value(raw.clone()).map_err(|e| ConfigError::Invalid {
                    field: ACCOUNTS_FIELD.to_owned(),
                    reason: e.to_string(),
                })?;
            if accounts.is_empty() {
                return Err(ConfigError::Invalid {
                    field: ACCOUNTS_FIELD.to_owned(),
                    reason: "at least one account is required".to_owned(),
                });
            }
            accounts
        }
        None => vec![MailAccount {
            address: settings.require_str("address")?.to_owned(),
            endpoint: settings.require_str("endpoint")?.to_owned(),
            secret: settings.str_field("secret").map(str::to_owned),
        }],
    };

    let mut seen = HashSet::new();
    for (index, account) in accounts.iter().enumerate() {
        account.validate(&format!("{ACCOUNTS_FIELD}[{index}]"))?;
        if !seen.insert(account.credential_key()) {
            return Err(ConfigError::Invalid {
                field: ACCOUNTS_FIELD.to_owned(),
                reason: format!("account `{}` listed twice", account.address),
            });
        }
    }
    Ok(accounts)
}

// ---------------------------------------------------------------------------
// Single-account droplet
// ---------------------------------------------------------------------------

/// Droplet serving one mail account.
pub struct MailDroplet {
    provider: String,
    settings: Settings,
    link: MailboxLink,
}

impl MailDroplet {
    /// Build an uninitialized droplet.
    pub fn new(
        provider: impl Into<String>,
        settings: Settings,
        account: MailAccount,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            provider: provider.into(),
            settings,
            link: MailboxLink::new(account, transport),
        }
    }
}

#[async_trait]
impl Droplet for MailDroplet {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn credential_keys(&self) -> Vec<String> {
        vec![self.link.account().credential_key()]
    }

    async fn initialize(&mut self) -> Result<(), InitError> {
        self.link.open().await
    }

    async fn poll(&mut self) -> Result<Vec<Ripple>, PollError> {
        let messages = self.link.fetch().await?;
        Ok(messages.into_iter().map(link::to_ripple).collect())
    }

    async fn destroy(&mut self) {
        self.link.close().await;
    }

    fn settings(&self) -> Settings {
        self.settings.clone()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Factory for one mail provider type over a given transport.
pub struct MailDropletFactory {
    provider: String,
    transport: Arc<dyn MailTransport>,
}

impl MailDropletFactory {
    /// Factory registering under `provider`.
    pub fn new(provider: impl Into<String>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            provider: provider.into(),
            transport,
        }
    }
}

impl DropletFactory for MailDropletFactory {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn validate(&self, settings: &Settings) -> Result<(), ConfigError> {
        accounts_from_settings(settings).map(|_| ())
    }

    fn create(&self, settings: Settings) -> Result<Box<dyn Droplet>, ConfigError> {
        let composite = settings.fields.contains_key(ACCOUNTS_FIELD);
        let mut accounts = accounts_from_settings(&settings)?;
        let transport = Arc::clone(&self.transport);
        if composite {
            return Ok(Box::new(CompositeMailDroplet::new(
                self.provider.clone(),
                settings,
                accounts,
                transport,
            )));
        }
        let account = accounts
            .pop()
            .ok_or_else(|| ConfigError::Missing("address".to_owned()))?;
        Ok(Box::new(MailDroplet::new(
            self.provider.clone(),
            settings,
            account,
            transport,
        )))
    }
}
