//! Several accounts of one provider behind a single droplet.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::link::{self, MailboxLink};
use super::{MailAccount, MailTransport};
use crate::droplet::{Droplet, InitError, PollError, Settings};
use crate::ripple::Ripple;

/// Multi-account mail droplet.
///
/// Uids are only unique per mailbox, so each `(account, uid)` pair is mapped
/// to a droplet-local ripple id allocated in arrival order.
pub struct CompositeMailDroplet {
    provider: String,
    settings: Settings,
    links: Vec<MailboxLink>,
    local_ids: HashMap<(usize, u64), u64>,
    next_local_id: u64,
}

impl CompositeMailDroplet {
    /// Build an uninitialized composite droplet.
    pub fn new(
        provider: impl Into<String>,
        settings: Settings,
        accounts: Vec<MailAccount>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let links = accounts
            .into_iter()
            .map(|account| MailboxLink::new(account, Arc::clone(&transport)))
            .collect();
        Self {
            provider: provider.into(),
            settings,
            links,
            local_ids: HashMap::new(),
            next_local_id: 0,
        }
    }

    fn local_id(&mut self, account: usize, uid: u64) -> u64 {
        let next = &mut self.next_local_id;
        *self.local_ids.entry((account, uid)).or_insert_with(|| {
            let id = *next;
            *next = next.saturating_add(1);
            id
        })
    }

    async fn close_all(&mut self) {
        for link in &mut self.links {
            link.close().await;
        }
    }
}

#[async_trait]
impl Droplet for CompositeMailDroplet {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn credential_keys(&self) -> Vec<String> {
        self.links
            .iter()
            .map(|link| link.account().credential_key())
            .collect()
    }

    /// All accounts or none: a failure closes the sessions already opened.
    async fn initialize(&mut self) -> Result<(), InitError> {
        for index in 0..self.links.len() {
            let Some(link) = self.links.get_mut(index) else {
                break;
            };
            if let Err(e) = link.open().await {
                let address = link.account().address.clone();
                self.close_all().await;
                return Err(match e {
                    InitError::BadCredentials(msg) => InitError::BadCredentials(format!("{address}: {msg}")),
                    InitError::Unreachable(msg) => InitError::Unreachable(format!("{address}: {msg}")),
                    InitError::MalformedSettings(msg) => {
                        InitError::MalformedSettings(format!("{address}: {msg}"))
                    }
                });
            }
        }
        Ok(())
    }

    /// Accounts that fail are logged and skipped; the poll only fails when
    /// every account failed.
    async fn poll(&mut self) -> Result<Vec<Ripple>, PollError> {
        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for (index, link) in self.links.iter_mut().enumerate() {
            match link.fetch().await {
                Ok(messages) => fetched.extend(messages.into_iter().map(|m| (index, m))),
                Err(e) => {
                    warn!(account = %link.account().address, error = %e, "composite account poll failed");
                    failures.push(e);
                }
            }
        }

        if failures.len() == self.links.len() {
            if let Some(e) = failures.pop() {
                return Err(e);
            }
        }

        Ok(fetched
            .into_iter()
            .map(|(index, message)| {
                let id = self.local_id(index, message.uid);
                link::to_ripple_with_id(id, message)
            })
            .collect())
    }

    async fn destroy(&mut self) {
        self.close_all().await;
    }

    fn settings(&self) -> Settings {
        self.settings.clone()
    }
}
