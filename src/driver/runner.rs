//! Run orchestration: queue lifecycle, worker pool, finalization.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, Span, error, info, warn};
use uuid::Uuid;

use crate::client::ExecutionClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gate::PauseGate;
use crate::model::{ItemOutcome, ItemState, Payload, QueueSnapshot, QueueState, RunState, WorkItem};
use crate::store::WorkItemStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_item_span};
use crate::tracking::{FailureLog, TrackingFields, TrackingSink, fields, now_stamp};

/// Timing and concurrency knobs for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of items in flight at once.
    pub max_workers: usize,
    /// Delay between two status polls of a running execution.
    pub poll_interval: Duration,
    /// Log a heartbeat every this many polls while still running.
    pub heartbeat_every: u32,
    /// Status calls attempted before an item is failed.
    pub status_attempts: u32,
    pub status_retry_delay: Duration,
    /// Gap between two consecutive launches.
    pub launch_stagger: Duration,
    /// How often the pause gate re-checks the clock.
    pub pause_poll_interval: Duration,
    /// Give up on an execution still running after this long. `None` polls forever.
    pub poll_deadline: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: Duration::from_secs(5),
            heartbeat_every: 12,
            status_attempts: 5,
            status_retry_delay: Duration::from_secs(1),
            launch_stagger: Duration::from_secs(1),
            pause_poll_interval: Duration::from_secs(60),
            poll_deadline: None,
        }
    }
}

impl RunConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.max_thread,
            poll_deadline: config.poll_deadline,
            ..Self::default()
        }
    }
}

/// Counters for one invocation of the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Processed before this run plus pending at its start.
    pub total_items: u64,
    pub processed_this_run: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Shared mutable queue state. Only ever touched with the ledger lock held.
pub(super) struct QueueLedger {
    pub(super) state: QueueState,
    pub(super) pending: Vec<WorkItem>,
    pub(super) run_state: RunState,
    pub(super) summary: RunSummary,
}

impl QueueLedger {
    fn idle() -> Self {
        Self {
            state: QueueState::default(),
            pending: Vec::new(),
            run_state: RunState::NotStarted,
            summary: RunSummary::default(),
        }
    }

    fn start(snapshot: QueueSnapshot) -> Self {
        let total_items = snapshot.total_items();
        Self {
            state: snapshot.state,
            pending: snapshot.items,
            run_state: RunState::Running,
            summary: RunSummary {
                total_items,
                ..RunSummary::default()
            },
        }
    }

    /// Move `identifier` from pending to processed. False if it is not pending.
    fn complete(&mut self, identifier: u64) -> bool {
        let Some(pos) = self.pending.iter().position(|i| i.identifier == identifier) else {
            return false;
        };
        if !self.state.record(identifier) {
            return false;
        }
        self.pending.remove(pos);
        true
    }
}

/// Sticky stop request. Unlike a bare `Notify`, late observers still see it.
#[derive(Default)]
pub(super) struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(super) fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub(super) async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// The queue driver. Cheap to clone; clones share the same queue.
pub struct QueueRunner {
    pub(super) run_id: Uuid,
    pub(super) store: Arc<WorkItemStore>,
    pub(super) client: Arc<dyn ExecutionClient>,
    pub(super) tracking: Arc<dyn TrackingSink>,
    pub(super) failures: Option<Arc<FailureLog>>,
    pub(super) gate: Arc<PauseGate>,
    pub(super) config: Arc<RunConfig>,
    pub(super) ledger: Arc<Mutex<QueueLedger>>,
    pub(super) shutdown: Arc<Shutdown>,
}

impl Clone for QueueRunner {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id,
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            tracking: Arc::clone(&self.tracking),
            failures: self.failures.clone(),
            gate: Arc::clone(&self.gate),
            config: Arc::clone(&self.config),
            ledger: Arc::clone(&self.ledger),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl QueueRunner {
    pub fn new(
        store: WorkItemStore,
        client: Arc<dyn ExecutionClient>,
        tracking: Arc<dyn TrackingSink>,
        config: RunConfig,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            store: Arc::new(store),
            client,
            tracking,
            failures: None,
            gate: Arc::new(PauseGate::disabled()),
            config: Arc::new(config),
            ledger: Arc::new(Mutex::new(QueueLedger::idle())),
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    pub fn with_gate(mut self, gate: PauseGate) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    pub fn with_failure_log(mut self, log: FailureLog) -> Self {
        self.failures = Some(Arc::new(log));
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn store(&self) -> &WorkItemStore {
        &self.store
    }

    /// Stop the current run. No new item is launched, items still waiting
    /// or polling are left pending, and any finalization already under way
    /// completes, so the save file stays consistent for a resume.
    pub fn shutdown(&self) {
        info!("shutdown requested, stopping launches");
        self.shutdown.trigger();
    }

    pub async fn run_state(&self) -> RunState {
        self.ledger.lock().await.run_state
    }

    /// First run: build the queue from `content`, then drive it.
    pub async fn init_queue(&self, content: Vec<Payload>) -> Result<RunSummary> {
        if content.is_empty() {
            error!("There is nothing to process. Please verify the content given to the queue.");
            return Err(Error::EmptyQueue);
        }
        self.store.create(content).await?;
        self.run(false).await
    }

    /// Drive whatever the working file currently holds.
    pub async fn run_queue(&self) -> Result<RunSummary> {
        self.run(false).await
    }

    /// Crash recovery: restore the working file from the save file, rewrite
    /// the embedded refresh token if one is given, then drive the queue.
    pub async fn resume_queue(&self, refresh_token: Option<&SecretString>) -> Result<RunSummary> {
        let save = &self.store.paths().save;
        if !self.store.save_exists().await {
            return Err(Error::CorruptQueue {
                path: save.clone(),
                reason: "no save file to resume from".to_string(),
            });
        }
        self.store.restore_from_save().await?;

        if let Some(token) = refresh_token {
            if let Err(e) = self.store.refresh_token(token.expose_secret()).await {
                return Err(self.abort_unreadable(e, true).await);
            }
        }
        self.run(true).await
    }

    async fn abort_unreadable(&self, e: Error, resume: bool) -> Error {
        if !e.is_structural() {
            return e;
        }
        if resume {
            error!(
                error = %e,
                "Resume is impossible, the queue file is corrupted. Deleting it, please relaunch executions."
            );
            if let Err(rm) = self.store.discard_working().await {
                warn!("could not delete corrupted queue file: {rm}");
            }
        } else {
            error!(error = %e, "Items to process are wrong. Please verify the queue file shaping.");
        }
        e
    }

    async fn run(&self, resume: bool) -> Result<RunSummary> {
        let snapshot = match self.store.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.abort_unreadable(e, resume).await),
        };
        let pending = snapshot.items.clone();
        let total = snapshot.total_items();
        *self.ledger.lock().await = QueueLedger::start(snapshot);

        self.store.mirror_to_save().await?;
        self.store.snapshot_initial().await?;

        info!(
            run_id = %self.run_id,
            resume,
            total,
            "Number of planned executions: {}",
            pending.len()
        );
        info!("Starting new executions...");

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        for (index, item) in pending.into_iter().enumerate() {
            if self.shutdown.is_triggered() {
                break;
            }
            if index > 0 && !self.config.launch_stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.launch_stagger) => {}
                    _ = self.shutdown.wait() => break,
                }
            }
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| Error::Other(format!("worker pool closed: {e}")))?
                }
                _ = self.shutdown.wait() => break,
            };
            let runner = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                runner.run_worker(item).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker task failed: {e}");
            }
        }
        info!("Executions ended.");

        let (summary, remaining) = {
            let mut ledger = self.ledger.lock().await;
            if ledger.pending.is_empty() {
                ledger.run_state = RunState::Drained;
            }
            (ledger.summary.clone(), ledger.pending.len())
        };

        if remaining == 0 {
            self.store.remove_run_files().await?;
        } else {
            warn!(remaining, "queue not drained, keeping queue files for resume");
        }
        Ok(summary)
    }

    /// One item end to end. Processing runs in its own task so that a panic
    /// is turned into a failed outcome like any other per-item error, and so
    /// that a shutdown can drop it. Finalization is never raced with shutdown.
    async fn run_worker(&self, item: WorkItem) {
        let span = start_item_span(&self.run_id, item.identifier);

        let runner = self.clone();
        let task_item = item.clone();
        let mut processing = tokio::spawn(
            async move { runner.process_item(&task_item).await }.instrument(span.clone()),
        );
        let joined = tokio::select! {
            biased;
            joined = &mut processing => joined,
            _ = self.shutdown.wait() => {
                processing.abort();
                span.in_scope(|| warn!("item {} interrupted, left pending", item.identifier));
                return;
            }
        };
        let (reached, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                span.in_scope(|| error!("worker for item {} panicked: {e}", item.identifier));
                (ItemState::Pending, ItemOutcome::failed(format!("worker panicked: {e}")))
            }
        };

        self.finalize(&item, reached, outcome)
            .instrument(span.clone())
            .await;
    }

    /// Record a terminal outcome: ledger, queue file, save mirror, tracking
    /// record and progress line, all under the ledger lock.
    async fn finalize(&self, item: &WorkItem, reached: ItemState, outcome: ItemOutcome) {
        let to = outcome.state();
        if !reached.can_transition_to(to) {
            warn!(identifier = item.identifier, "unexpected transition {reached} -> {to}");
        }
        record_state_transition(&Span::current(), reached, to);

        let mut ledger = self.ledger.lock().await;
        if !ledger.complete(item.identifier) {
            warn!(identifier = item.identifier, "item already finalized, ignoring");
            return;
        }
        ledger.summary.processed_this_run += 1;
        if outcome.is_success() {
            ledger.summary.succeeded += 1;
        } else {
            ledger.summary.failed += 1;
        }

        match self.store.persist(&ledger.state, &ledger.pending).await {
            Ok(()) => {
                if let Err(e) = self.store.mirror_to_save().await {
                    error!("failed to mirror queue to save file: {e}");
                }
            }
            Err(e) => error!("failed to persist queue: {e}"),
        }

        let mut record = TrackingFields::new();
        record.insert(
            fields::EXECUTION_STATUS.to_string(),
            outcome.tracking_status().to_string(),
        );
        record.insert(fields::EXECUTION_END_TIME.to_string(), now_stamp());
        if let ItemOutcome::Failed { reason, details, .. } = &outcome {
            record.insert(fields::EXECUTION_ERROR.to_string(), reason.clone());
            if let Some(log) = &self.failures {
                if let Err(e) = log.append(item, reason, details.as_deref()).await {
                    warn!("could not write failure log: {e}");
                }
            }
            error!(
                identifier = item.identifier,
                reason = %reason,
                "item {} failed",
                item.identifier
            );
        }
        if let Err(e) = self.tracking.record(item.identifier, record).await {
            warn!(identifier = item.identifier, "could not update tracking record: {e}");
        }

        let label = if outcome.is_success() { "succeeded" } else { "failed" };
        metrics::items_processed().add(1, &[KeyValue::new("outcome", label)]);

        info!(
            "{} out of {} items processed.",
            ledger.state.nb_processed_items, ledger.summary.total_items
        );
    }
}
