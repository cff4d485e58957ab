//! Drives restore intents owned by this replica through their phases.
//!
//! A pump task turns store watch events into `RestoreOperation`s, keeps only
//! intents labelled with our replica UID, and feeds a keyed work queue. A
//! periodic resync re-announces every owned intent as `Sync`, which is what
//! moves an intent from Init into execution. Workers re-read the intent from
//! the store and act on its current phase only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use volmgr_core::{
    classify_update, plan_step, ClusterStore, ObjectKey, RestoreExecutor, RestoreIntent,
    RestoreOperation, RestorePhase, RestoreStatus, RestoreStep, StoreEvent, WatchEventKind,
};

use crate::work_queue::{ControllerHandle, WorkQueue};

/// Reason recorded when an execution was cut short by a restart.
pub const INTERRUPTED_REASON: &str = "restore interrupted before completion";

/// Configuration for the restore controller.
#[derive(Clone, Copy, Debug)]
pub struct RestoreControllerConfig {
    /// Worker tasks; distinct intents are processed in parallel.
    pub workers: usize,
    /// Every owned intent is re-queued as `Sync` at this interval.
    pub resync_interval: Duration,
    /// Delay before an item whose store write failed is retried.
    pub retry_delay: Duration,
    /// Attempts at recording the outcome of an executed restore.
    pub outcome_write_attempts: usize,
}

impl Default for RestoreControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            outcome_write_attempts: 5,
        }
    }
}

pub struct RestoreContext {
    pub store: Arc<dyn ClusterStore>,
    pub executor: Arc<dyn RestoreExecutor>,
    pub namespace: String,
    /// Identity of this replica process; only intents carrying it are handled.
    pub replica_uid: String,
}

struct Controller {
    ctx: Arc<RestoreContext>,
    queue: Arc<WorkQueue<ObjectKey, RestoreOperation>>,
    cfg: RestoreControllerConfig,
    /// Outcomes of executed restores whose status write has not landed yet.
    /// While an entry exists the intent is still InProgress in the store, and
    /// the entry, not the interrupted-restore rule, decides its final phase.
    unrecorded: Mutex<HashMap<ObjectKey, RestoreStatus>>,
}

/// Spawn the pump and the workers.
pub fn spawn(ctx: Arc<RestoreContext>, cfg: RestoreControllerConfig) -> ControllerHandle {
    let controller = Arc::new(Controller {
        ctx,
        queue: Arc::new(WorkQueue::new()),
        cfg,
        unrecorded: Mutex::new(HashMap::new()),
    });
    let (stop_tx, stop_rx) = watch::channel(false);

    // Subscribe before the initial listing so no change slips between them.
    let events = controller.ctx.store.watch();
    let mut tasks = Vec::with_capacity(cfg.workers + 1);
    tasks.push(tokio::spawn(pump(controller.clone(), events, stop_rx)));
    for worker in 0..cfg.workers.max(1) {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move { controller.run_worker(worker).await }));
    }
    tracing::info!(
        replica_uid = %controller.ctx.replica_uid,
        workers = cfg.workers.max(1),
        "restore controller started"
    );
    ControllerHandle::new(stop_tx, tasks)
}

async fn pump(
    controller: Arc<Controller>,
    mut events: broadcast::Receiver<StoreEvent>,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(err) = controller.enqueue_all(RestoreOperation::Add).await {
        tracing::warn!(error = ?err, "initial restore listing failed");
    }
    let mut ticker = tokio::time::interval(controller.cfg.resync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial listing covered it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = controller.enqueue_all(RestoreOperation::Sync).await {
                    tracing::warn!(error = ?err, "restore resync failed");
                }
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Restore { kind, old, new }) => controller.dispatch(kind, old, new),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "restore watch lagged, resyncing");
                    if let Err(err) = controller.enqueue_all(RestoreOperation::Sync).await {
                        tracing::warn!(error = ?err, "restore resync failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    controller.queue.shut_down();
}

impl Controller {
    fn owns(&self, intent: &RestoreIntent) -> bool {
        intent.is_owned_by(&self.ctx.replica_uid)
    }

    fn dispatch(&self, kind: WatchEventKind, old: Option<RestoreIntent>, new: RestoreIntent) {
        if !self.owns(&new) {
            return;
        }
        let op = match (kind, old) {
            (WatchEventKind::Added, _) => Some(RestoreOperation::Add),
            (WatchEventKind::Modified, Some(old)) => classify_update(&old, &new),
            (WatchEventKind::Modified, None) => Some(RestoreOperation::Sync),
            (WatchEventKind::Deleted, _) => Some(RestoreOperation::Destroy),
        };
        if let Some(op) = op {
            self.queue.add(new.key(), op);
        }
    }

    async fn enqueue_all(&self, op: RestoreOperation) -> anyhow::Result<()> {
        let intents = self
            .ctx
            .store
            .list_restores(&self.ctx.namespace)
            .await
            .context("list restore intents")?;
        for intent in intents.iter().filter(|i| self.owns(i)) {
            self.queue.add(intent.key(), op);
        }
        Ok(())
    }

    async fn run_worker(&self, worker: usize) {
        while let Some((key, ops)) = self.queue.get().await {
            for (idx, op) in ops.iter().enumerate() {
                if let Err(err) = self.process(&key, *op).await {
                    tracing::warn!(worker, restore = %key, ?op, error = ?err, "restore step failed");
                    self.queue
                        .add_all_after(key.clone(), ops[idx..].to_vec(), self.cfg.retry_delay);
                    break;
                }
            }
            self.queue.done(&key);
        }
    }

    async fn process(&self, key: &ObjectKey, op: RestoreOperation) -> anyhow::Result<()> {
        let intent = match self.ctx.store.get_restore(key).await {
            Ok(intent) => intent,
            Err(err) if err.is_not_found() => {
                tracing::debug!(restore = %key, ?op, "restore intent no longer exists");
                self.unrecorded_outcomes().remove(key);
                return Ok(());
            }
            Err(err) => return Err(err).with_context(|| format!("load restore intent {key}")),
        };

        let held_outcome = self.unrecorded_outcomes().contains_key(key);
        if held_outcome {
            return self.record_outcome(key).await;
        }

        match plan_step(&intent, op) {
            RestoreStep::Noop => {
                tracing::trace!(restore = %key, ?op, phase = intent.phase().as_str(), "nothing to do");
                Ok(())
            }
            RestoreStep::MarkInit => {
                self.transition(key, RestorePhase::Pending, RestoreStatus::new(RestorePhase::Init))
                    .await?;
                Ok(())
            }
            RestoreStep::MarkInvalid(reason) => {
                tracing::warn!(restore = %key, %reason, "restore intent is invalid");
                self.transition(
                    key,
                    RestorePhase::Pending,
                    RestoreStatus::with_reason(RestorePhase::Invalid, reason),
                )
                .await?;
                Ok(())
            }
            RestoreStep::MarkInterrupted => {
                tracing::warn!(restore = %key, "found restore left in progress");
                self.transition(
                    key,
                    RestorePhase::InProgress,
                    RestoreStatus::with_reason(RestorePhase::Failed, INTERRUPTED_REASON),
                )
                .await?;
                Ok(())
            }
            RestoreStep::Execute => self.execute(key, &intent).await,
        }
    }

    /// Init -> InProgress -> Done | Failed.
    async fn execute(&self, key: &ObjectKey, intent: &RestoreIntent) -> anyhow::Result<()> {
        let started = self
            .transition(key, RestorePhase::Init, RestoreStatus::new(RestorePhase::InProgress))
            .await?;
        if !started {
            return Ok(());
        }
        tracing::info!(
            restore = %key,
            volume = %intent.spec.volume_name,
            backup = %intent.spec.backup_name,
            "restore started"
        );

        let outcome = match self.ctx.executor.execute(intent).await {
            Ok(()) => {
                tracing::info!(restore = %key, "restore completed");
                RestoreStatus::new(RestorePhase::Done)
            }
            Err(err) => {
                tracing::warn!(restore = %key, error = ?err, "restore failed");
                RestoreStatus::with_reason(RestorePhase::Failed, format!("{err:#}"))
            }
        };

        self.unrecorded_outcomes().insert(key.clone(), outcome);
        self.record_outcome(key).await
    }

    fn unrecorded_outcomes(&self) -> MutexGuard<'_, HashMap<ObjectKey, RestoreStatus>> {
        self.unrecorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the outcome held for `key`, retrying a bounded number of times.
    /// On failure the outcome stays held and the caller's retry writes it.
    async fn record_outcome(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let attempts = self.cfg.outcome_write_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let held = self.unrecorded_outcomes().get(key).cloned();
            let Some(outcome) = held else {
                return Ok(());
            };
            match self.transition(key, RestorePhase::InProgress, outcome).await {
                Ok(_) => {
                    // Either written now, or the phase already moved on.
                    self.unrecorded_outcomes().remove(key);
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(restore = %key, attempt, error = ?err, "outcome write failed");
                    last_err = Some(err);
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no outcome write attempted"))
            .context(format!("record outcome of restore {key}")))
    }

    /// Re-read the intent and replace its status if it is still in `from`.
    /// Returns whether the write happened.
    async fn transition(
        &self,
        key: &ObjectKey,
        from: RestorePhase,
        to: RestoreStatus,
    ) -> anyhow::Result<bool> {
        let mut current = self
            .ctx
            .store
            .get_restore(key)
            .await
            .with_context(|| format!("reload restore intent {key}"))?;
        if current.phase() != from {
            tracing::debug!(
                restore = %key,
                expected = from.as_str(),
                found = current.phase().as_str(),
                "restore phase moved, skipping write"
            );
            return Ok(false);
        }
        let to_phase = to.phase;
        current.status = to;
        self.ctx
            .store
            .update_restore_status(current)
            .await
            .with_context(|| format!("write status of restore intent {key}"))?;
        tracing::info!(
            restore = %key,
            from = from.as_str(),
            to = to_phase.as_str(),
            "restore phase changed"
        );
        Ok(true)
    }
}
