//! Poll scheduling.
//!
//! Runs as a background Tokio task, ticking at the configured interval. Each
//! tick snapshots the registry, starts one poll per idle initialized droplet
//! on the worker pool, waits until every poll reported or the cycle deadline
//! passed, then merges the ripples into feed order.
//!
//! A droplet whose previous poll is still in flight is skipped for the cycle,
//! never queued. A poll that misses the deadline keeps running; its droplet
//! stays busy and is skipped until it finishes. Ripples from such a late poll
//! are handed back to the droplet and delivered by its next cycle.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::dispatch::CoreEvent;
use crate::droplet::lifecycle::{DropletError, LifecycleState, PollOutcome};
use crate::droplet::registry::DropletRegistry;
use crate::droplet::PollError;
use crate::identifier::Identifier;
use crate::ripple::{self, Ripple, TaggedRipple};

/// What happened during one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// New ripples from every droplet, merged into feed order.
    pub ripples: Vec<TaggedRipple>,
    /// Droplets that reported successfully.
    pub polled: Vec<Identifier>,
    /// Droplets skipped because a previous poll was still in flight.
    pub skipped: Vec<Identifier>,
    /// Droplets that reported a transient failure, deadline misses included.
    pub failed: Vec<(Identifier, PollError)>,
    /// Droplets that missed the cycle deadline.
    pub timed_out: Vec<Identifier>,
    /// Droplets destroyed while their poll was in flight.
    pub discarded: Vec<Identifier>,
    /// Contract violations raised by a poll.
    pub violations: Vec<(Identifier, DropletError)>,
}

impl CycleReport {
    /// Observer events for this cycle: the ripple batch first, then one event
    /// per failure.
    pub fn events(&self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        if !self.ripples.is_empty() {
            events.push(CoreEvent::Ripples {
                cycle: self.cycle,
                ripples: self.ripples.clone(),
            });
        }
        events.extend(self.failed.iter().map(|(droplet, error)| CoreEvent::PollFailed {
            droplet: *droplet,
            error: error.clone(),
        }));
        events
    }
}

fn settle(
    report: &mut CycleReport,
    batches: &mut Vec<(Identifier, Vec<Ripple>)>,
    id: Identifier,
    outcome: Result<PollOutcome, DropletError>,
) {
    match outcome {
        Ok(PollOutcome::Ripples(ripples)) => {
            report.polled.push(id);
            batches.push((id, ripples));
        }
        Ok(PollOutcome::Failed(e)) => report.failed.push((id, e)),
        Ok(PollOutcome::Skipped) => report.skipped.push(id),
        Ok(PollOutcome::Discarded) => report.discarded.push(id),
        Err(DropletError::IllegalState(e)) if e.state == LifecycleState::Destroyed => {
            report.discarded.push(id);
        }
        Err(e) => {
            error!(droplet = %id, error = %e, "poll violated the droplet contract");
            report.violations.push((id, e));
        }
    }
}

/// Drives poll cycles over a registry.
#[derive(Debug)]
pub struct PollScheduler {
    registry: Arc<DropletRegistry>,
    polling: PollingConfig,
    workers: Arc<Semaphore>,
    cycles: AtomicU64,
}

impl PollScheduler {
    /// Scheduler over `registry` with a worker pool of `polling.workers`.
    pub fn new(registry: Arc<DropletRegistry>, polling: PollingConfig) -> Self {
        let workers = Arc::new(Semaphore::new(polling.worker_count()));
        Self {
            registry,
            polling,
            workers,
            cycles: AtomicU64::new(0),
        }
    }

    /// Polling configuration in effect.
    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    /// Run one poll cycle and wait for it to settle.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        let now = Instant::now();
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<(Identifier, Result<PollOutcome, DropletError>)>();
        let mut pending = BTreeSet::new();

        for droplet in self.registry.initialized() {
            let id = droplet.id();
            if !droplet.is_due(now) {
                continue;
            }
            let Some(permit) = droplet.try_begin_poll() else {
                debug!(droplet = %id, cycle, "previous poll still in flight, skipping");
                report.skipped.push(id);
                continue;
            };

            pending.insert(id);
            let workers = Arc::clone(&self.workers);
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match workers.acquire_owned().await {
                    Ok(_slot) => droplet.poll_with(&permit).await,
                    Err(_) => Ok(PollOutcome::Discarded),
                };
                // The receiver closes once the cycle deadline passed.
                if let Err(mpsc::error::SendError((_, Ok(PollOutcome::Ripples(late))))) =
                    tx.send((id, outcome))
                {
                    droplet.defer(late);
                }
                drop(permit);
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.polling.cycle_timeout());
        tokio::pin!(deadline);

        let mut batches: Vec<(Identifier, Vec<Ripple>)> = Vec::new();
        while !pending.is_empty() {
            tokio::select! {
                received = rx.recv() => {
                    let Some((id, outcome)) = received else { break };
                    pending.remove(&id);
                    settle(&mut report, &mut batches, id, outcome);
                }
                () = &mut deadline => {
                    warn!(cycle, pending = pending.len(), "cycle deadline passed");
                    break;
                }
            }
        }

        // Results already queued still count; later senders defer to the droplet.
        rx.close();
        while let Ok((id, outcome)) = rx.try_recv() {
            pending.remove(&id);
            settle(&mut report, &mut batches, id, outcome);
        }

        report.timed_out = pending.into_iter().collect();
        for id in &report.timed_out {
            report
                .failed
                .push((*id, PollError::Timeout(self.polling.cycle_timeout())));
        }
        report.ripples = ripple::merge(batches);
        debug!(
            cycle,
            ripples = report.ripples.len(),
            polled = report.polled.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "poll cycle settled"
        );
        report
    }

    /// Run cycles until shutdown, forwarding each cycle's events.
    ///
    /// Exits when the shutdown signal is received, its channel closes, or
    /// the event receiver is dropped.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::UnboundedSender<CoreEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let interval = self.polling.interval();
        info!(interval_secs = interval.as_secs(), "poll scheduler started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    for event in report.events() {
                        if events.send(event).is_err() {
                            info!("event receiver dropped, poll scheduler stopping");
                            return;
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("poll scheduler shutting down");
                        break;
                    }
                }
            }
        }

        info!("poll scheduler stopped");
    }
}
