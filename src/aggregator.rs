//! The interactive-facing facade.
//!
//! [`Aggregator`] wires the vault, provider catalog, registry, scheduler and
//! event hub together. Methods that only touch in-memory state (add, remove,
//! apply, unlock) are safe on the interactive thread. Methods that reach a
//! droplet's transport (`initialize_droplet`, `poll_now`) are async and must
//! run on worker tasks; [`Aggregator::spawn_initialize_all`] and
//! [`Aggregator::start_polling`] do that dispatch.
//!
//! Core events raised from any thread are queued and delivered to
//! `events().core` listeners by [`Aggregator::pump_events`], or consumed
//! directly from [`Aggregator::take_event_receiver`].

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::dispatch::{ConfigDialogEvent, CoreEvent, DropletViewEvent, EventHub, UnlockEvent};
use crate::droplet::lifecycle::{DropletError, LifecycleState, ManagedDroplet};
use crate::droplet::registry::{DropletRegistry, RegistryError};
use crate::droplet::{ConfigError, ProviderCatalog, Settings};
use crate::identifier::{Identifier, IdentifierService};
use crate::scheduler::{CycleReport, PollScheduler};
use crate::state::StateDocument;
use crate::vault::{CredentialVault, DropletRecord};

/// Errors surfaced to the interactive collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    /// Configuration payload rejected or vault locked.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Registry refused the change.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Lifecycle or threading failure.
    #[error(transparent)]
    Droplet(#[from] DropletError),
    /// No droplet with this identifier.
    #[error("no droplet with identifier {0}")]
    NotFound(Identifier),
}

// ---------------------------------------------------------------------------
// Setup contract
// ---------------------------------------------------------------------------

/// Result of presenting a setup surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupOutcome {
    /// The user filled in a new droplet.
    Accepted {
        /// Provider type chosen.
        provider: String,
        /// Initial settings.
        settings: Settings,
    },
    /// The user backed out.
    Cancelled,
}

/// A UI surface that collects a new droplet's provider and settings.
pub trait SetupSurface {
    /// Present the surface. `providers` lists the registered provider types.
    fn present(&mut self, providers: &[String]) -> SetupOutcome;
}

// ---------------------------------------------------------------------------
// Polling handle
// ---------------------------------------------------------------------------

/// Running scheduler task.
#[derive(Debug)]
pub struct PollingHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollingHandle {
    /// Signal the scheduler to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "poll scheduler task ended abnormally");
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Core facade owning every aggregation component.
pub struct Aggregator {
    catalog: ProviderCatalog,
    vault: Arc<CredentialVault>,
    registry: Arc<DropletRegistry>,
    ids: Arc<IdentifierService>,
    scheduler: Arc<PollScheduler>,
    hub: EventHub,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CoreEvent>>>,
    runtime: Handle,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("catalog", &self.catalog)
            .field("droplets", &self.registry.len())
            .field("unlocked", &self.vault.is_unlocked())
            .finish()
    }
}

impl Aggregator {
    /// Assemble the core from explicit parts.
    pub fn new(
        catalog: ProviderCatalog,
        vault: Arc<CredentialVault>,
        ids: Arc<IdentifierService>,
        polling: PollingConfig,
        runtime: Handle,
    ) -> Self {
        let registry = Arc::new(DropletRegistry::new());
        let scheduler = Arc::new(PollScheduler::new(Arc::clone(&registry), polling));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            catalog,
            vault,
            registry,
            ids,
            scheduler,
            hub: EventHub::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            runtime,
        }
    }

    /// Assemble the core from a persisted document (`None` on first run).
    ///
    /// The vault starts locked; droplets are built on the first successful
    /// unlock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] if the document is invalid.
    pub fn restore(
        catalog: ProviderCatalog,
        document: Option<StateDocument>,
        polling: PollingConfig,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        let vault = match document {
            Some(document) => {
                let (configuration, records) = document.into_parts()?;
                CredentialVault::restore(configuration, records)
            }
            None => CredentialVault::new(),
        };
        let ids = IdentifierService::starting_after(vault.identifiers());
        Ok(Self::new(catalog, Arc::new(vault), Arc::new(ids), polling, runtime))
    }

    /// Subscribe the core's own handlers to the UI-facing dispatchers.
    ///
    /// Handlers hold a weak reference, so the hub does not keep the
    /// aggregator alive.
    pub fn wire_listeners(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let w = weak.clone();
        self.hub.config_dialog.subscribe(move |event| {
            if let Some(core) = w.upgrade() {
                // Rejections are reported as CoreEvent::ConfigRejected.
                let _ = core.handle_config_dialog(event);
            }
        });
        let w = weak.clone();
        self.hub.unlock.subscribe(move |event| {
            if let Some(core) = w.upgrade() {
                let _ = core.handle_unlock(event);
            }
        });
        self.hub.droplet_view.subscribe(move |event| {
            if let Some(core) = weak.upgrade() {
                core.handle_droplet_view(event);
            }
        });
    }

    /// Event dispatchers.
    pub fn events(&self) -> &EventHub {
        &self.hub
    }

    /// The droplet registry.
    pub fn registry(&self) -> &Arc<DropletRegistry> {
        &self.registry
    }

    /// The credential vault.
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Registered provider types.
    pub fn providers(&self) -> Vec<String> {
        self.catalog.providers()
    }

    fn emit(&self, event: CoreEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("core event dropped, no receiver");
        }
    }

    /// Deliver queued core events to `events().core` listeners.
    ///
    /// Call from the interactive thread. Returns the number of events
    /// delivered; zero once the receiver has been taken.
    pub fn pump_events(&self) -> usize {
        let mut queued = Vec::new();
        if let Some(rx) = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            while let Ok(event) = rx.try_recv() {
                queued.push(event);
            }
        }
        for event in &queued {
            self.hub.core.dispatch(event);
        }
        queued.len()
    }

    /// Take the core event stream for async consumption.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<CoreEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // -- vault -------------------------------------------------------------

    /// Check a passphrase; a match unlocks the vault and builds any stored
    /// droplets not yet registered.
    pub fn unlock(&self, candidate_key: &str) -> bool {
        let unlocked = self.vault.unlock(candidate_key);
        self.emit(CoreEvent::UnlockResult { unlocked });
        if unlocked {
            self.load_droplets();
        }
        unlocked
    }

    /// Set the master key. Allowed on first run or while unlocked.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] when a key exists and the vault is locked.
    pub fn set_key(&self, new_key: &str) -> Result<(), AggregatorError> {
        if self.vault.has_key() && !self.vault.is_unlocked() {
            return Err(ConfigError::Locked.into());
        }
        if new_key.is_empty() {
            return Err(ConfigError::Invalid {
                field: "master_key".to_owned(),
                reason: "must not be empty".to_owned(),
            }
            .into());
        }
        self.vault.set_key(new_key);
        self.load_droplets();
        Ok(())
    }

    /// Build and register every stored droplet that is not registered yet.
    ///
    /// Records that no longer validate are reported and skipped; they stay
    /// in the vault untouched. Returns the number of droplets registered.
    pub fn load_droplets(&self) -> usize {
        let records = match self.vault.records() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "cannot load droplets");
                return 0;
            }
        };
        let mut loaded = 0usize;
        for (id, record) in records {
            if self.registry.get(id).is_some() {
                continue;
            }
            let built = self
                .catalog
                .build(&record.provider, record.settings)
                .map_err(AggregatorError::from)
                .and_then(|droplet| {
                    self.registry
                        .insert(Arc::new(ManagedDroplet::new(id, droplet)))
                        .map_err(AggregatorError::from)
                });
            match built {
                Ok(()) => loaded = loaded.saturating_add(1),
                Err(AggregatorError::Config(error)) => {
                    warn!(droplet = %id, error = %error, "stored droplet settings rejected");
                    self.emit(CoreEvent::ConfigRejected { droplet: id, error });
                }
                Err(e) => warn!(droplet = %id, error = %e, "stored droplet not registered"),
            }
        }
        info!(loaded, "stored droplets loaded");
        loaded
    }

    /// Snapshot the vault for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Locked`] while locked.
    pub fn state_document(&self) -> Result<StateDocument, ConfigError> {
        StateDocument::from_vault(&self.vault)
    }

    // -- droplet management --------------------------------------------------

    /// Validate, build and register a new droplet.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError`] if the vault is locked, the settings are
    /// invalid, or the droplet duplicates an existing one.
    pub fn add_droplet(&self, provider: &str, settings: Settings) -> Result<Identifier, AggregatorError> {
        if !self.vault.is_unlocked() {
            return Err(ConfigError::Locked.into());
        }
        let droplet = self.catalog.build(provider, settings.clone())?;
        let id = self.ids.next_identifier();
        self.registry
            .insert(Arc::new(ManagedDroplet::new(id, droplet)))?;
        self.vault.put_record(
            id,
            DropletRecord {
                provider: provider.to_owned(),
                settings,
            },
        )?;
        info!(droplet = %id, provider, "droplet added");
        Ok(id)
    }

    /// Run a setup surface and register the droplet it produces.
    ///
    /// Returns `Ok(None)` when the user cancels.
    ///
    /// # Errors
    ///
    /// Same as [`Aggregator::add_droplet`].
    pub fn setup_droplet(&self, surface: &mut dyn SetupSurface) -> Result<Option<Identifier>, AggregatorError> {
        match surface.present(&self.providers()) {
            SetupOutcome::Accepted { provider, settings } => {
                self.add_droplet(&provider, settings).map(Some)
            }
            SetupOutcome::Cancelled => {
                debug!("droplet setup cancelled");
                Ok(None)
            }
        }
    }

    /// Remove a droplet, forget its settings and release it on a worker.
    ///
    /// An in-flight poll is cancelled or its result discarded.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::NotFound`] or [`ConfigError::Locked`].
    pub fn remove_droplet(&self, id: Identifier) -> Result<(), AggregatorError> {
        if !self.vault.is_unlocked() {
            return Err(ConfigError::Locked.into());
        }
        let droplet = self.registry.remove(id).ok_or(AggregatorError::NotFound(id))?;
        self.vault.remove_record(id)?;
        self.release(droplet);
        Ok(())
    }

    /// Validate revised settings and swap in a fresh droplet built from them.
    ///
    /// On any error the existing droplet and its stored settings are left
    /// exactly as they were.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError`] describing the rejection.
    pub fn apply_settings(&self, id: Identifier, settings: Settings) -> Result<(), AggregatorError> {
        let result = self.try_apply(id, settings);
        if let Err(AggregatorError::Config(ref error)) = result {
            warn!(droplet = %id, error = %error, "configuration edit rejected");
            self.emit(CoreEvent::ConfigRejected {
                droplet: id,
                error: error.clone(),
            });
        }
        result
    }

    fn try_apply(&self, id: Identifier, settings: Settings) -> Result<(), AggregatorError> {
        let record = self
            .vault
            .record(id)?
            .ok_or(AggregatorError::NotFound(id))?;
        let droplet = self.catalog.build(&record.provider, settings.clone())?;
        // Store first: a locked vault must leave the live droplet in place.
        self.vault.put_record(
            id,
            DropletRecord {
                provider: record.provider.clone(),
                settings,
            },
        )?;
        let previous = match self.registry.replace(Arc::new(ManagedDroplet::new(id, droplet))) {
            Ok(previous) => previous,
            Err(e) => {
                if let Err(restore) = self.vault.put_record(id, record) {
                    error!(droplet = %id, error = %restore, "could not restore settings of rejected apply");
                }
                return Err(e.into());
            }
        };
        self.release(previous);
        self.emit(CoreEvent::Reconfigured { droplet: id });
        Ok(())
    }

    fn release(&self, droplet: Arc<ManagedDroplet>) {
        let events = self.events_tx.clone();
        self.runtime.spawn(async move {
            droplet.destroy().await;
            let _ = events.send(CoreEvent::Destroyed {
                droplet: droplet.id(),
            });
        });
    }

    // -- event handlers ------------------------------------------------------

    /// React to a configuration-dialog action.
    ///
    /// # Errors
    ///
    /// Returns the rejection for `Delete` and `Apply`.
    pub fn handle_config_dialog(&self, event: &ConfigDialogEvent) -> Result<(), AggregatorError> {
        match event {
            ConfigDialogEvent::Delete { droplet } => self.remove_droplet(*droplet),
            ConfigDialogEvent::Cancel { droplet } => {
                debug!(droplet = %droplet, "configuration edit cancelled");
                Ok(())
            }
            ConfigDialogEvent::Apply { droplet, settings } => {
                self.apply_settings(*droplet, settings.clone())
            }
        }
    }

    /// React to an unlock-view action. Returns whether the vault is unlocked.
    ///
    /// # Errors
    ///
    /// Returns the rejection of a key change.
    pub fn handle_unlock(&self, event: &UnlockEvent) -> Result<bool, AggregatorError> {
        match event {
            UnlockEvent::Login { candidate_key } => Ok(self.unlock(candidate_key)),
            UnlockEvent::SetKey { new_key } => self.set_key(new_key).map(|()| true),
        }
    }

    /// React to a droplet view action.
    pub fn handle_droplet_view(&self, event: &DropletViewEvent) {
        match event {
            DropletViewEvent::OpenConfiguration { droplet } => self.open_configuration(*droplet),
        }
    }

    /// Publish a droplet's current settings and status for its dialog.
    pub fn open_configuration(&self, id: Identifier) {
        let Some(droplet) = self.registry.get(id) else {
            warn!(droplet = %id, "open configuration for unknown droplet");
            return;
        };
        match self.vault.record(id) {
            Ok(Some(record)) => self.emit(CoreEvent::ConfigurationOpened {
                droplet: id,
                provider: record.provider,
                settings: record.settings,
                status: droplet.status(),
            }),
            Ok(None) => warn!(droplet = %id, "droplet has no stored settings"),
            Err(error) => self.emit(CoreEvent::ConfigRejected { droplet: id, error }),
        }
    }

    // -- worker-side operations ----------------------------------------------

    /// Initialize one droplet. Must run on a worker.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::Droplet`] with the init failure or contract
    /// violation; init failures are also emitted as [`CoreEvent::InitFailed`].
    pub async fn initialize_droplet(&self, id: Identifier) -> Result<(), AggregatorError> {
        let droplet = self.registry.get(id).ok_or(AggregatorError::NotFound(id))?;
        match droplet.initialize().await {
            Ok(()) => {
                self.emit(CoreEvent::Initialized { droplet: id });
                Ok(())
            }
            Err(DropletError::Init(error)) => {
                self.emit(CoreEvent::InitFailed {
                    droplet: id,
                    error: error.clone(),
                });
                Err(DropletError::Init(error).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Initialize every uninitialized droplet on the worker pool.
    pub fn spawn_initialize_all(self: &Arc<Self>) -> JoinHandle<()> {
        let core = Arc::clone(self);
        self.runtime.spawn(async move {
            let pending: Vec<Identifier> = core
                .registry
                .snapshot()
                .iter()
                .filter(|droplet| {
                    droplet.state() == LifecycleState::Uninitialized
                })
                .map(|droplet| droplet.id())
                .collect();
            let tasks: Vec<JoinHandle<()>> = pending
                .into_iter()
                .map(|id| {
                    let core = Arc::clone(&core);
                    tokio::spawn(async move {
                        if let Err(e) = core.initialize_droplet(id).await {
                            debug!(droplet = %id, error = %e, "initialization did not complete");
                        }
                    })
                })
                .collect();
            for task in tasks {
                let _ = task.await;
            }
        })
    }

    /// Run one poll cycle now and emit its events. Must run on a worker.
    pub async fn poll_now(&self) -> CycleReport {
        let report = self.scheduler.run_cycle().await;
        for event in report.events() {
            self.emit(event);
        }
        report
    }

    /// Start the recurring poll scheduler on the worker pool.
    pub fn start_polling(&self) -> PollingHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&self.scheduler);
        let task = self
            .runtime
            .spawn(scheduler.run(self.events_tx.clone(), shutdown_rx));
        PollingHandle { shutdown_tx, task }
    }

    /// Remove and release every droplet. Stored settings are kept.
    pub async fn shutdown(&self) {
        for droplet in self.registry.drain() {
            droplet.destroy().await;
        }
        info!("aggregator shut down");
    }
}
