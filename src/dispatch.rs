//! Observer registry and the toolkit-neutral event payloads it carries.
//!
//! Four categories flow through an [`EventHub`]:
//! - [`ConfigDialogEvent`]: delete, cancel or apply from a droplet's dialog
//! - [`UnlockEvent`]: login attempts and first-run key setup
//! - [`DropletViewEvent`]: per-droplet view actions
//! - [`CoreEvent`]: merged ripples and droplet status, raised by the core
//!
//! Delivery is synchronous, in subscription order. Each dispatch iterates a
//! snapshot of the listener list, so unsubscribing from inside a listener is
//! safe and takes effect from the next dispatch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::droplet::lifecycle::DropletStatus;
use crate::droplet::{ConfigError, InitError, PollError, Settings};
use crate::identifier::Identifier;
use crate::ripple::TaggedRipple;

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered listener list for one event type.
pub struct Dispatcher<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E> fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<E> Dispatcher<E> {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener in subscription order.
    ///
    /// Listeners are taken from a snapshot made when the call starts: one
    /// unsubscribed mid-dispatch, by itself or by another listener, still
    /// receives the current event and is skipped from the next dispatch on.
    ///
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// Actions raised by a droplet's configuration dialog.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigDialogEvent {
    /// Delete the droplet.
    Delete {
        /// Target droplet.
        droplet: Identifier,
    },
    /// Discard pending edits.
    Cancel {
        /// Target droplet.
        droplet: Identifier,
    },
    /// Commit revised settings.
    Apply {
        /// Target droplet.
        droplet: Identifier,
        /// Revised settings blob.
        settings: Settings,
    },
}

/// Actions raised by the unlock view.
#[derive(Clone, PartialEq, Eq)]
pub enum UnlockEvent {
    /// Login attempt.
    Login {
        /// Passphrase typed by the user.
        candidate_key: String,
    },
    /// First-run (or change-of) master key.
    SetKey {
        /// The new passphrase.
        new_key: String,
    },
}

impl fmt::Debug for UnlockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login { .. } => f.write_str("Login { candidate_key: [REDACTED] }"),
            Self::SetKey { .. } => f.write_str("SetKey { new_key: [REDACTED] }"),
        }
    }
}

/// Actions raised by a droplet's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropletViewEvent {
    /// Open the droplet's configuration dialog.
    OpenConfiguration {
        /// Target droplet.
        droplet: Identifier,
    },
}

/// Events raised by the core toward observers.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// Merged, display-ordered ripples from one poll cycle.
    Ripples {
        /// Cycle number.
        cycle: u64,
        /// New ripples in feed order.
        ripples: Vec<TaggedRipple>,
    },
    /// A droplet finished initializing.
    Initialized {
        /// Droplet.
        droplet: Identifier,
    },
    /// A droplet failed to initialize.
    InitFailed {
        /// Droplet.
        droplet: Identifier,
        /// Cause.
        error: InitError,
    },
    /// A droplet reported a transient poll failure or missed the cycle deadline.
    PollFailed {
        /// Droplet.
        droplet: Identifier,
        /// Cause.
        error: PollError,
    },
    /// A droplet was removed and released.
    Destroyed {
        /// Droplet.
        droplet: Identifier,
    },
    /// A droplet's settings were replaced.
    Reconfigured {
        /// Droplet.
        droplet: Identifier,
    },
    /// A configuration edit was rejected; the previous settings stand.
    ConfigRejected {
        /// Droplet.
        droplet: Identifier,
        /// Why.
        error: ConfigError,
    },
    /// Settings for a configuration dialog the user asked to open.
    ConfigurationOpened {
        /// Droplet.
        droplet: Identifier,
        /// Provider type.
        provider: String,
        /// Current settings.
        settings: Settings,
        /// Current status.
        status: DropletStatus,
    },
    /// Result of a login attempt.
    UnlockResult {
        /// Whether the candidate key matched.
        unlocked: bool,
    },
}

/// One dispatcher per event category.
#[derive(Debug, Default)]
pub struct EventHub {
    /// Configuration-dialog actions.
    pub config_dialog: Dispatcher<ConfigDialogEvent>,
    /// Unlock-view actions.
    pub unlock: Dispatcher<UnlockEvent>,
    /// Per-droplet view actions.
    pub droplet_view: Dispatcher<DropletViewEvent>,
    /// Core-to-observer events.
    pub core: Dispatcher<CoreEvent>,
}

impl EventHub {
    /// Hub with no listeners.
    pub fn new() -> Self {
        Self::default()
    }
}
