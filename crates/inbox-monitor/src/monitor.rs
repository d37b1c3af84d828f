//! Polling ingestion loop
//!
//! `start()` seeds the known ids with the current unread backlog and spawns
//! a task that polls every `poll_interval`. Ticks run one after another on
//! that task, so a slow tick delays the next one instead of overlapping it.
//! Every provider call goes through the `ApiGate`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mail_api::{ApiError, ApiGate, MailApi};
use oauth_session::now_millis;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Page size for unread listings
    pub max_results: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_results: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
    /// `stop()` arrived while the backlog was being seeded
    Cancelled,
}

impl StartOutcome {
    pub fn label(self) -> &'static str {
        match self {
            StartOutcome::Started => "started",
            StartOutcome::AlreadyActive => "already-active",
            StartOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotActive,
}

impl StopOutcome {
    pub fn label(self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::NotActive => "not-active",
        }
    }
}

/// An active monitoring session.
struct Running {
    started_at: u64,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Phase {
    Idle,
    /// Seeding the backlog; `attempt` tells a start apart from a later one
    Starting {
        attempt: Uuid,
        cancel: watch::Sender<bool>,
    },
    Running(Running),
}

struct Inner {
    gate: ApiGate,
    api: Arc<dyn MailApi>,
    dispatcher: Dispatcher,
    config: MonitorConfig,
    phase: tokio::sync::Mutex<Phase>,
    active: AtomicBool,
    known: Mutex<HashSet<String>>,
}

/// Watches the inbox and dispatches notifications for new messages.
///
/// Cheap to clone; all clones share one monitoring session.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn new(
        gate: ApiGate,
        api: Arc<dyn MailApi>,
        dispatcher: Dispatcher,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate,
                api,
                dispatcher,
                config,
                phase: tokio::sync::Mutex::new(Phase::Idle),
                active: AtomicBool::new(false),
                known: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn gate(&self) -> &ApiGate {
        &self.inner.gate
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Start monitoring.
    ///
    /// Idempotent: while a session is active or starting this reports
    /// `AlreadyActive` and leaves the known ids, start time and timer alone.
    /// A credential store failure while seeding is fatal; any other seeding
    /// failure is logged and polling starts anyway. Seeding may wait on the
    /// consent screen, so the session lock is not held meanwhile and a
    /// `stop()` during seeding abandons the start (`Cancelled`).
    pub async fn start(&self) -> Result<StartOutcome> {
        let attempt = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut phase = self.inner.phase.lock().await;
            if !matches!(*phase, Phase::Idle) {
                debug!("monitoring already active");
                return Ok(StartOutcome::AlreadyActive);
            }
            *phase = Phase::Starting {
                attempt,
                cancel: cancel_tx,
            };
        }

        // Seed on its own task so a caller that goes away can't strand the
        // `Starting` phase; only `stop()` abandons a start
        let monitor = self.clone();
        let seeding = tokio::spawn(async move { monitor.finish_start(attempt, cancel_rx).await });
        match seeding.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(StartOutcome::Cancelled),
        }
    }

    async fn finish_start(
        &self,
        attempt: Uuid,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<StartOutcome> {
        let started_at = now_millis();
        self.inner.known().clear();

        let seeded = tokio::select! {
            seeded = self.inner.seed() => Some(seeded),
            _ = cancel.changed() => None,
        };

        let mut phase = self.inner.phase.lock().await;
        let still_ours = matches!(&*phase, Phase::Starting { attempt: a, .. } if *a == attempt);
        let Some(seeded) = seeded.filter(|_| still_ours) else {
            info!("monitoring stopped while starting");
            return Ok(StartOutcome::Cancelled);
        };

        match seeded {
            Ok(count) => info!(backlog = count, "seeded known messages with the unread backlog"),
            Err(e) if e.is_store_failure() => {
                *phase = Phase::Idle;
                warn!(error = %e, "credential store unavailable, not starting monitoring");
                return Err(MonitorError::Store(e));
            }
            Err(e) => warn!(error = %e, "initial unread listing failed, polling anyway"),
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_poll_task(self.inner.clone(), started_at, stop_rx);
        *phase = Phase::Running(Running {
            started_at,
            stop: stop_tx,
            task,
        });
        self.inner.active.store(true, Ordering::SeqCst);

        info!(
            started_at,
            poll_interval_secs = self.inner.config.poll_interval.as_secs(),
            "monitoring started"
        );
        Ok(StartOutcome::Started)
    }

    /// Stop monitoring.
    ///
    /// No further tick is scheduled. A tick already running finishes on its
    /// own. Known ids are kept until the next `start()`. A start still
    /// seeding is abandoned.
    pub async fn stop(&self) -> StopOutcome {
        match self.halt().await {
            Phase::Idle => StopOutcome::NotActive,
            _ => StopOutcome::Stopped,
        }
    }

    /// Stop monitoring and wait up to `grace` for an in-flight tick.
    pub async fn shutdown(&self, grace: Duration) {
        let Phase::Running(running) = self.halt().await else {
            return;
        };
        if tokio::time::timeout(grace, running.task).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "poll task did not finish in time");
        }
    }

    /// Take the current phase and signal it to end.
    async fn halt(&self) -> Phase {
        let previous = std::mem::replace(&mut *self.inner.phase.lock().await, Phase::Idle);
        match &previous {
            Phase::Idle => {}
            Phase::Starting { cancel, .. } => {
                let _ = cancel.send(true);
                info!("monitoring start abandoned");
            }
            Phase::Running(running) => {
                self.inner.active.store(false, Ordering::SeqCst);
                // The poll task also exits if the sender is gone
                let _ = running.stop.send(true);
                info!(known = self.known_count(), "monitoring stopped");
            }
        }
        previous
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Start of the active session, epoch millis.
    pub async fn started_at(&self) -> Option<u64> {
        match &*self.inner.phase.lock().await {
            Phase::Running(running) => Some(running.started_at),
            _ => None,
        }
    }

    pub fn known_count(&self) -> usize {
        self.inner.known().len()
    }

    /// Run one poll now, outside the timer.
    pub async fn poll_once(&self) {
        let Some(started_at) = self.started_at().await else {
            debug!("monitoring not active, nothing to poll");
            return;
        };
        self.inner.tick(started_at).await;
    }
}

fn spawn_poll_task(
    inner: Arc<Inner>,
    started_at: u64,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick: the backlog was just seeded
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => inner.tick(started_at).await,
            }
        }
        debug!("poll task exited");
    })
}

impl Inner {
    fn known(&self) -> MutexGuard<'_, HashSet<String>> {
        self.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn list_unread(&self, after: Option<u64>) -> std::result::Result<Vec<String>, ApiError> {
        let api = self.api.clone();
        let max_results = self.config.max_results;
        self.gate
            .call("list_unread", move |token| {
                let api = api.clone();
                async move { api.list_unread(&token, after, max_results).await }
            })
            .await
    }

    /// Record the current unread backlog as known. Returns its size.
    async fn seed(&self) -> std::result::Result<usize, ApiError> {
        let backlog = self.list_unread(None).await?;
        let count = backlog.len();
        self.known().extend(backlog);
        self.report_unread(count);
        Ok(count)
    }

    /// Ids in `listed` not seen before, claimed as known in one step.
    fn claim_new(&self, listed: Vec<String>) -> Vec<String> {
        let mut known = self.known();
        listed
            .into_iter()
            .filter(|id| known.insert(id.clone()))
            .collect()
    }

    async fn tick(&self, started_at: u64) {
        let tick = Uuid::new_v4();

        let listed = match self.list_unread(Some(started_at)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(%tick, error = %e, "listing new messages failed, skipping tick");
                metrics::counter!("monitor_ticks_total", "outcome" => "error").increment(1);
                return;
            }
        };

        let fresh = self.claim_new(listed);
        if !fresh.is_empty() {
            info!(%tick, count = fresh.len(), "new messages");
        }

        let mut outcome = if fresh.is_empty() { "idle" } else { "processed" };
        for id in &fresh {
            match self.process(tick, id).await {
                Ok(()) => {}
                Err(e @ ApiError::Unauthenticated(_)) => {
                    warn!(%tick, error = %e, "lost the session mid-tick, ending tick early");
                    outcome = "error";
                    break;
                }
                Err(e) => {
                    warn!(%tick, message_id = %id, error = %e, "fetching message failed");
                    metrics::counter!("monitor_messages_total", "action" => "fetch_failed")
                        .increment(1);
                }
            }
        }

        match self.list_unread(None).await {
            Ok(all) => self.report_unread(all.len()),
            Err(e) => debug!(%tick, error = %e, "unread count unavailable this tick"),
        }
        metrics::counter!("monitor_ticks_total", "outcome" => outcome).increment(1);
    }

    async fn process(&self, tick: Uuid, id: &str) -> std::result::Result<(), ApiError> {
        let api = self.api.clone();
        let owned = id.to_string();
        let details = self
            .gate
            .call("get_message", move |token| {
                let api = api.clone();
                let id = owned.clone();
                async move { api.get_message(&token, &id).await }
            })
            .await?;

        let outcome = self.dispatcher.dispatch(details).await;
        debug!(%tick, message_id = id, outcome = outcome.label(), "message processed");
        metrics::counter!("monitor_messages_total", "action" => outcome.label()).increment(1);
        Ok(())
    }

    fn report_unread(&self, count: usize) {
        metrics::gauge!("monitor_unread_messages").set(count as f64);
        self.dispatcher.notifier().unread_count(count);
    }
}
