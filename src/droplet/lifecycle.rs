//! Lifecycle enforcement around a raw [`Droplet`].
//!
//! [`ManagedDroplet`] owns the adapter and tracks:
//! - the state machine `Uninitialized → Initialized → Destroyed`,
//! - the busy flag that keeps polls of one droplet from overlapping,
//! - the ids already emitted, so re-sent messages are suppressed,
//! - ripples whose poll finished after nobody was waiting for them,
//! - a cancellation token fired on destroy.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Droplet, InitError, PollError, Settings};
use crate::identifier::Identifier;
use crate::interactive::{self, LongOperationError};
use crate::ripple::Ripple;

/// Lifecycle state of a droplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Built but no session established yet.
    Uninitialized,
    /// Session established; eligible for polling.
    Initialized,
    /// Resources released. Terminal.
    Destroyed,
}

impl LifecycleState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Initialized => 1,
            Self::Destroyed => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            _ => Self::Destroyed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Destroyed => "destroyed",
        })
    }
}

/// An operation was invoked in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{operation}` is not valid while the droplet is {state}")]
pub struct IllegalStateError {
    /// Rejected operation.
    pub operation: &'static str,
    /// State at the time of the call.
    pub state: LifecycleState,
}

/// Errors from lifecycle operations on a [`ManagedDroplet`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropletError {
    /// Recoverable session failure.
    #[error(transparent)]
    Init(#[from] InitError),
    /// Lifecycle contract violation.
    #[error(transparent)]
    IllegalState(#[from] IllegalStateError),
    /// Threading contract violation.
    #[error(transparent)]
    LongOperation(#[from] LongOperationError),
}

impl DropletError {
    /// Whether this is a programming/integration fault rather than a runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::Init(_))
    }
}

/// Result of one poll attempt that did not violate the lifecycle contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// New, previously unseen ripples in feed order (possibly empty).
    Ripples(Vec<Ripple>),
    /// Transient failure; the droplet stays initialized.
    Failed(PollError),
    /// Another poll of this droplet is still in flight.
    Skipped,
    /// The droplet was destroyed while the poll ran; the result was dropped.
    Discarded,
}

/// Snapshot of a droplet's user-visible status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropletStatus {
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Whether a poll is in flight.
    pub busy: bool,
    /// Most recent init or poll failure, cleared on success.
    pub last_error: Option<String>,
}

struct Inner {
    droplet: Box<dyn Droplet>,
    seen: HashSet<u64>,
}

impl Inner {
    fn keep_unseen(&mut self, ripples: Vec<Ripple>) -> Vec<Ripple> {
        let mut fresh: Vec<Ripple> = ripples
            .into_iter()
            .filter(|ripple| self.seen.insert(ripple.id()))
            .collect();
        fresh.sort_unstable();
        fresh
    }
}

/// A droplet plus the bookkeeping that enforces its contract.
pub struct ManagedDroplet {
    id: Identifier,
    provider: String,
    credential_keys: Vec<String>,
    settings: Settings,
    state: AtomicU8,
    busy: AtomicBool,
    released: AtomicBool,
    cancel: CancellationToken,
    last_poll_started: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    deferred: Mutex<Vec<Ripple>>,
    inner: tokio::sync::Mutex<Inner>,
}

impl fmt::Debug for ManagedDroplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDroplet")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManagedDroplet {
    /// Wrap a freshly built, uninitialized droplet.
    pub fn new(id: Identifier, droplet: Box<dyn Droplet>) -> Self {
        Self {
            id,
            provider: droplet.provider().to_owned(),
            credential_keys: droplet.credential_keys(),
            settings: droplet.settings(),
            state: AtomicU8::new(LifecycleState::Uninitialized.as_u8()),
            busy: AtomicBool::new(false),
            released: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            last_poll_started: Mutex::new(None),
            last_error: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
            inner: tokio::sync::Mutex::new(Inner {
                droplet,
                seen: HashSet::new(),
            }),
        }
    }

    /// Registry identifier.
    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Provider type.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Credential identities, used for duplicate detection.
    pub fn credential_keys(&self) -> &[String] {
        &self.credential_keys
    }

    /// Settings the droplet was built from. Valid in every state.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a poll is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// User-visible status snapshot.
    pub fn status(&self) -> DropletStatus {
        DropletStatus {
            state: self.state(),
            busy: self.is_busy(),
            last_error: lock(&self.last_error).clone(),
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: LifecycleState,
    ) -> Result<(), IllegalStateError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(IllegalStateError { operation, state })
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn record_error(&self, message: Option<String>) {
        *lock(&self.last_error) = message;
    }

    /// Establish the droplet's session.
    ///
    /// # Errors
    ///
    /// - [`DropletError::LongOperation`] on the interactive thread.
    /// - [`DropletError::IllegalState`] unless the droplet is uninitialized.
    /// - [`DropletError::Init`] when the adapter fails; the droplet stays
    ///   uninitialized and may be retried.
    pub async fn initialize(&self) -> Result<(), DropletError> {
        interactive::forbid("initialize")?;
        self.expect_state("initialize", LifecycleState::Uninitialized)?;

        let mut inner = self.inner.lock().await;
        // A concurrent initialize may have finished while we waited.
        self.expect_state("initialize", LifecycleState::Uninitialized)?;

        let result = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = inner.droplet.initialize() => Some(result),
        };

        match result {
            Some(Ok(())) => {
                if self.transition(LifecycleState::Uninitialized, LifecycleState::Initialized) {
                    self.record_error(None);
                    info!(droplet = %self.id, provider = %self.provider, "droplet initialized");
                    Ok(())
                } else {
                    // Destroyed mid-initialize: release the session we just opened.
                    inner.droplet.destroy().await;
                    Err(IllegalStateError {
                        operation: "initialize",
                        state: self.state(),
                    }
                    .into())
                }
            }
            Some(Err(e)) => {
                warn!(droplet = %self.id, provider = %self.provider, error = %e, "droplet initialization failed");
                self.record_error(Some(e.to_string()));
                Err(e.into())
            }
            None => Err(IllegalStateError {
                operation: "initialize",
                state: self.state(),
            }
            .into()),
        }
    }

    /// Mark the droplet busy. Returns `None` if a poll is already in flight.
    pub fn try_begin_poll(self: &Arc<Self>) -> Option<PollPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollPermit {
                droplet: Arc::clone(self),
            })
    }

    /// Poll once, taking the busy flag for the duration.
    ///
    /// Returns [`PollOutcome::Skipped`] if another poll is in flight.
    ///
    /// # Errors
    ///
    /// - [`DropletError::LongOperation`] on the interactive thread.
    /// - [`DropletError::IllegalState`] unless the droplet is initialized.
    pub async fn poll(self: &Arc<Self>) -> Result<PollOutcome, DropletError> {
        interactive::forbid("poll")?;
        self.expect_state("poll", LifecycleState::Initialized)?;
        match self.try_begin_poll() {
            Some(permit) => self.poll_with(&permit).await,
            None => Ok(PollOutcome::Skipped),
        }
    }

    /// Poll once under a permit obtained from [`ManagedDroplet::try_begin_poll`].
    ///
    /// The droplet stays busy until the caller drops the permit. Ripples handed
    /// back through [`ManagedDroplet::defer`] are returned with the next
    /// successful poll.
    ///
    /// # Errors
    ///
    /// Same as [`ManagedDroplet::poll`].
    pub async fn poll_with(&self, permit: &PollPermit) -> Result<PollOutcome, DropletError> {
        debug_assert!(std::ptr::eq(Arc::as_ptr(&permit.droplet), self));
        interactive::forbid("poll")?;
        self.expect_state("poll", LifecycleState::Initialized)?;

        *lock(&self.last_poll_started) = Some(Instant::now());

        let mut inner = self.inner.lock().await;
        let result = tokio::select! {
            () = self.cancel.cancelled() => None,
            result = inner.droplet.poll() => Some(result),
        };

        let outcome = match result {
            _ if self.state() == LifecycleState::Destroyed => {
                debug!(droplet = %self.id, "discarding poll result of destroyed droplet");
                PollOutcome::Discarded
            }
            None => PollOutcome::Discarded,
            Some(Ok(ripples)) => {
                self.record_error(None);
                let mut fresh = inner.keep_unseen(ripples);
                let deferred = std::mem::take(&mut *lock(&self.deferred));
                if !deferred.is_empty() {
                    fresh.extend(deferred);
                    fresh.sort_unstable();
                }
                debug!(droplet = %self.id, count = fresh.len(), "poll completed");
                PollOutcome::Ripples(fresh)
            }
            Some(Err(e)) => {
                warn!(droplet = %self.id, provider = %self.provider, error = %e, "poll failed");
                self.record_error(Some(e.to_string()));
                PollOutcome::Failed(e)
            }
        };
        drop(inner);
        Ok(outcome)
    }

    /// Hand back ripples from a poll whose result reached nobody.
    ///
    /// Their ids are already marked seen, so the provider will not repeat
    /// them. Dropped if the droplet is destroyed.
    pub fn defer(&self, ripples: Vec<Ripple>) {
        if ripples.is_empty() || self.state() == LifecycleState::Destroyed {
            return;
        }
        debug!(droplet = %self.id, count = ripples.len(), "deferring late ripples to the next poll");
        lock(&self.deferred).extend(ripples);
    }

    /// Whether this droplet should be polled at `now`.
    ///
    /// Droplets without an interval override follow the scheduler cadence.
    pub fn is_due(&self, now: Instant) -> bool {
        let Some(secs) = self.settings.poll_interval_secs else {
            return true;
        };
        match *lock(&self.last_poll_started) {
            None => true,
            Some(started) => now.saturating_duration_since(started) >= Duration::from_secs(secs),
        }
    }

    /// Move to `Destroyed` and cancel any in-flight work without waiting.
    ///
    /// Returns `true` on the first call.
    pub fn retire(&self) -> bool {
        let previous = self
            .state
            .swap(LifecycleState::Destroyed.as_u8(), Ordering::AcqRel);
        self.cancel.cancel();
        let first = LifecycleState::from_u8(previous) != LifecycleState::Destroyed;
        if first {
            info!(droplet = %self.id, provider = %self.provider, "droplet retired");
        }
        first
    }

    /// Retire the droplet and release its resources. Idempotent, never fails.
    pub async fn destroy(&self) {
        self.retire();
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.droplet.destroy().await;
        debug!(droplet = %self.id, "droplet resources released");
    }
}

/// Proof that the holder owns the droplet's single poll slot.
///
/// Dropping it marks the droplet idle again.
#[derive(Debug)]
pub struct PollPermit {
    droplet: Arc<ManagedDroplet>,
}

impl PollPermit {
    /// The droplet this permit belongs to.
    pub fn droplet(&self) -> &Arc<ManagedDroplet> {
        &self.droplet
    }
}

impl Drop for PollPermit {
    fn drop(&mut self) {
        self.droplet.busy.store(false, Ordering::Release);
    }
}
