//! Per-account mail session helper shared by the mail droplets.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{MailAccount, MailMessage, MailSession, MailTransport};
use crate::droplet::{InitError, PollError};
use crate::ripple::Ripple;

/// One account's session plus the highest uid already fetched.
///
/// A failed fetch drops the session; the next fetch reconnects.
pub struct MailboxLink {
    account: MailAccount,
    transport: Arc<dyn MailTransport>,
    session: Option<Box<dyn MailSession>>,
    high_water: Option<u64>,
}

impl MailboxLink {
    /// Unconnected link.
    pub fn new(account: MailAccount, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            account,
            transport,
            session: None,
            high_water: None,
        }
    }

    /// Account served by this link.
    pub fn account(&self) -> &MailAccount {
        &self.account
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open the session.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] mapped from the transport failure.
    pub async fn open(&mut self) -> Result<(), InitError> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = self.transport.connect(&self.account).await?;
        info!(account = %self.account.address, "mail session opened");
        self.session = Some(session);
        Ok(())
    }

    /// Messages newer than the high-water mark, oldest first.
    ///
    /// The mark only advances when the fetch succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Transport`] if reconnecting or fetching fails.
    pub async fn fetch(&mut self) -> Result<Vec<MailMessage>, PollError> {
        let session = match self.session {
            Some(ref mut session) => session,
            None => {
                debug!(account = %self.account.address, "reconnecting mail session");
                let session = self.transport.connect(&self.account).await?;
                self.session.insert(session)
            }
        };

        match session.fetch_since(self.high_water).await {
            Ok(mut messages) => {
                messages.sort_by_key(|m| m.uid);
                if let Some(last) = messages.last() {
                    self.high_water = Some(self.high_water.map_or(last.uid, |hw| hw.max(last.uid)));
                }
                Ok(messages)
            }
            Err(e) => {
                warn!(account = %self.account.address, error = %e, "mail fetch failed, dropping session");
                if let Some(mut session) = self.session.take() {
                    session.close().await;
                }
                Err(e.into())
            }
        }
    }

    /// Close the session if open. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            info!(account = %self.account.address, "mail session closed");
        }
    }
}

/// Normalize a mail message, keeping its uid as the ripple id.
pub fn to_ripple(message: MailMessage) -> Ripple {
    to_ripple_with_id(message.uid, message)
}

/// Normalize a mail message under an explicit ripple id.
pub fn to_ripple_with_id(id: u64, message: MailMessage) -> Ripple {
    Ripple::new(
        id,
        message.from,
        message.subject,
        message.body,
        message.received_at.timestamp_millis(),
    )
}
