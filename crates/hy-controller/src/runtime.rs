//! Work queue driving [`ExperimentController`] passes.
//!
//! Keys are experiment names. A key is reconciled by at most one task at a
//! time; a key enqueued while its pass is in flight is marked dirty and run
//! again right after. Passes for different keys run concurrently up to
//! `max_concurrent_reconciles`. Each key has at most one pending delayed
//! requeue; scheduling again only moves its deadline earlier.

use hy_types::{HyError, TransientIoError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::controller::{ExperimentController, ReconcileOutcome};
use crate::events::ControllerEvent;

/// Cloneable sender side of the work queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl QueueHandle {
    /// Queue a pass for `name`. Returns false once the runtime is gone.
    pub fn enqueue(&self, name: impl Into<String>) -> bool {
        self.tx.send(name.into()).is_ok()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    scheduled: HashMap<String, Instant>,
}

impl QueueState {
    /// Claim `name` for a pass; a key already in flight is marked dirty.
    /// Starting a pass cancels the key's pending delayed requeue.
    fn start(&mut self, name: &str) -> bool {
        if self.in_flight.contains(name) {
            self.dirty.insert(name.to_string());
            false
        } else {
            self.in_flight.insert(name.to_string());
            self.scheduled.remove(name);
            true
        }
    }

    /// Record a delayed requeue. Returns false when an equal or earlier one
    /// is already pending.
    fn schedule(&mut self, name: &str, deadline: Instant) -> bool {
        match self.scheduled.get(name) {
            Some(pending) if *pending <= deadline => false,
            _ => {
                self.scheduled.insert(name.to_string(), deadline);
                true
            }
        }
    }

    /// A timer for `deadline` fired. Returns true when it is still the
    /// key's pending requeue.
    fn fire(&mut self, name: &str, deadline: Instant) -> bool {
        if self.scheduled.get(name) == Some(&deadline) {
            self.scheduled.remove(name);
            true
        } else {
            false
        }
    }

    /// Release `name`. Returns true when it was enqueued during the pass.
    fn finish(&mut self, name: &str) -> bool {
        self.in_flight.remove(name);
        self.dirty.remove(name)
    }

    fn record_failure(&mut self, name: &str) -> u32 {
        let failures = self.failures.entry(name.to_string()).or_insert(0);
        *failures += 1;
        *failures
    }

    fn reset_failures(&mut self, name: &str) {
        self.failures.remove(name);
    }
}

pub struct ControllerRuntime {
    controller: Arc<ExperimentController>,
    config: ControllerConfig,
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ControllerRuntime {
    pub fn new(controller: Arc<ExperimentController>, config: ControllerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            controller,
            config,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            tx: self.tx.clone(),
        }
    }

    /// Process the queue until `shutdown` turns true, then wait for the
    /// passes already running.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles));
        let mut tasks = JoinSet::new();
        let mut resync = tokio::time::interval(self.config.resync_interval());
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            max_concurrent = self.config.max_concurrent_reconciles,
            "controller runtime started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = resync.tick() => self.resync().await,
                Some(name) = self.rx.recv() => {
                    if !state.lock().start(&name) {
                        debug!(experiment = %name, "pass in flight; marked dirty");
                        continue;
                    }
                    tasks.spawn(process(
                        self.controller.clone(),
                        self.config.clone(),
                        state.clone(),
                        semaphore.clone(),
                        self.tx.clone(),
                        name,
                    ));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(%err, "reconcile task panicked");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "controller runtime shutting down");
        while tasks.join_next().await.is_some() {}
    }

    /// Enqueue every experiment that still needs work.
    async fn resync(&self) {
        match self.controller.store().list_experiments().await {
            Ok(experiments) => {
                for experiment in experiments
                    .iter()
                    .filter(|e| !e.is_terminal() || e.deletion_requested)
                {
                    let _ = self.tx.send(experiment.name().to_string());
                }
            }
            Err(err) => warn!(%err, "resync failed"),
        }
    }
}

async fn process(
    controller: Arc<ExperimentController>,
    config: ControllerConfig,
    state: Arc<Mutex<QueueState>>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<String>,
    name: String,
) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        state.lock().finish(&name);
        return;
    };

    let result = match tokio::time::timeout(config.reconcile_timeout(), controller.reconcile(&name)).await {
        Ok(result) => result,
        Err(_) => Err(TransientIoError::Timeout {
            timeout_ms: config.reconcile_timeout_ms,
        }
        .into()),
    };

    let (requeue, failed) = match result {
        Ok(ReconcileOutcome::Requeue(delay)) => {
            state.lock().reset_failures(&name);
            (Some(delay), false)
        }
        Ok(ReconcileOutcome::Done) => {
            state.lock().reset_failures(&name);
            (None, false)
        }
        Err(HyError::Config(err)) => {
            warn!(experiment = %name, %err, "reconcile rejected configuration; not retrying");
            state.lock().reset_failures(&name);
            (None, false)
        }
        Err(err) => {
            let failures = state.lock().record_failure(&name);
            let delay = config.backoff(failures);
            warn!(
                experiment = %name,
                %err,
                failures,
                retry_in_ms = delay.as_millis() as u64,
                "reconcile failed"
            );
            controller.emit(ControllerEvent::ReconcileFailed {
                experiment: name.clone(),
                error: err.to_string(),
            });
            (Some(delay), true)
        }
    };

    let dirty = state.lock().finish(&name);
    match requeue {
        Some(delay) if failed => schedule(state, tx, name, delay),
        _ if dirty => {
            let _ = tx.send(name);
        }
        Some(delay) => schedule(state, tx, name, delay),
        None => {}
    }
}

fn schedule(
    state: Arc<Mutex<QueueState>>,
    tx: mpsc::UnboundedSender<String>,
    name: String,
    delay: Duration,
) {
    let deadline = Instant::now() + delay;
    if !state.lock().schedule(&name, deadline) {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if state.lock().fire(&name, deadline) {
            let _ = tx.send(name);
        }
    });
}
