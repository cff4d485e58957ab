//! Keeps a disruption budget in place for the pool instances behind each volume.
//!
//! Replica placement changes and volume record changes queue the volume; a
//! periodic resync queues every volume in the namespace.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use volmgr_core::budget::{backing_pools, budget_selector};
use volmgr_core::types::POOL_CLUSTER_LABEL;
use volmgr_core::{plan_budget, ClusterStore, LabelSelector, ObjectKey, StoreEvent};

use crate::work_queue::{ControllerHandle, WorkQueue};

/// Configuration for the budget controller.
#[derive(Clone, Copy, Debug)]
pub struct BudgetControllerConfig {
    pub workers: usize,
    /// Every volume is reconciled again at this interval.
    pub resync_interval: Duration,
    /// Delay before a failed reconcile is retried.
    pub retry_delay: Duration,
}

impl Default for BudgetControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            resync_interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(2),
        }
    }
}

struct Controller {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    queue: Arc<WorkQueue<ObjectKey, ()>>,
    cfg: BudgetControllerConfig,
}

pub fn spawn(
    store: Arc<dyn ClusterStore>,
    namespace: String,
    cfg: BudgetControllerConfig,
) -> ControllerHandle {
    let events = store.watch();
    let controller = Arc::new(Controller {
        store,
        namespace,
        queue: Arc::new(WorkQueue::new()),
        cfg,
    });
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks = Vec::with_capacity(cfg.workers + 1);
    tasks.push(tokio::spawn(pump(controller.clone(), events, stop_rx)));
    for _ in 0..cfg.workers.max(1) {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move { controller.run_worker().await }));
    }
    ControllerHandle::new(stop_tx, tasks)
}

async fn pump(
    controller: Arc<Controller>,
    mut events: broadcast::Receiver<StoreEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(controller.cfg.resync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => controller.enqueue_all().await,
            event = events.recv() => match event {
                Ok(StoreEvent::VolumeReplica { replica, .. }) => {
                    if let Some(volume) = replica.volume() {
                        controller
                            .queue
                            .add(ObjectKey::new(&replica.meta.namespace, volume), ());
                    }
                }
                Ok(StoreEvent::Volume { key, .. }) => controller.queue.add(key, ()),
                Ok(StoreEvent::Restore { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "budget watch lagged, resyncing");
                    controller.enqueue_all().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    controller.queue.shut_down();
}

impl Controller {
    async fn enqueue_all(&self) {
        match self.store.list_volumes(&self.namespace).await {
            Ok(volumes) => {
                for volume in volumes {
                    self.queue.add(volume.key(), ());
                }
            }
            Err(err) => tracing::warn!(error = ?err, "budget resync listing failed"),
        }
    }

    async fn run_worker(&self) {
        while let Some((key, _)) = self.queue.get().await {
            if key.namespace == self.namespace {
                if let Err(err) = reconcile_volume(self.store.as_ref(), &key).await {
                    tracing::warn!(volume = %key, error = ?err, "budget reconcile failed");
                    self.queue.add_after(key.clone(), (), self.cfg.retry_delay);
                }
            }
            self.queue.done(&key);
        }
    }
}

/// Make sure a budget covers exactly the pools backing `volume`.
///
/// Returns the name of the budget in effect, or `None` when the volume has no
/// placed replicas yet.
pub async fn reconcile_volume(
    store: &dyn ClusterStore,
    volume: &ObjectKey,
) -> anyhow::Result<Option<String>> {
    let replicas = store
        .list_volume_replicas(&volume.namespace, &volume.name)
        .await
        .with_context(|| format!("list replicas of {volume}"))?;
    let Some((cluster, pools)) =
        backing_pools(&replicas).with_context(|| format!("backing pools of {volume}"))?
    else {
        tracing::debug!(volume = %volume, "no replicas placed yet");
        return Ok(None);
    };

    let instances = store
        .list_pool_instances(&volume.namespace, &budget_selector(&pools))
        .await
        .context("list pool instances")?;
    if instances.len() < pools.len() {
        tracing::warn!(
            volume = %volume,
            expected = pools.len(),
            found = instances.len(),
            "some backing pool instances are not registered"
        );
    }

    let cluster_selector = LabelSelector::default().with_label(POOL_CLUSTER_LABEL, &cluster);
    let existing = store
        .list_disruption_budgets(&volume.namespace, &cluster_selector)
        .await
        .context("list disruption budgets")?;
    if let Some(budget) = existing.iter().find(|b| b.covered_pools() == pools) {
        tracing::debug!(volume = %volume, budget = %budget.meta.name, "reusing disruption budget");
        return Ok(Some(budget.meta.name.clone()));
    }

    let budget = plan_budget(&volume.namespace, &cluster, &pools);
    let name = budget.meta.name.clone();
    match store.create_disruption_budget(budget).await {
        Ok(_) => {
            tracing::info!(
                volume = %volume,
                budget = %name,
                pool_cluster = %cluster,
                pools = pools.len(),
                "created disruption budget"
            );
        }
        Err(err) if err.is_already_exists() => {
            // Same name must mean same pool set; anything else leaves the
            // volume uncovered.
            let holder = store
                .list_disruption_budgets(&volume.namespace, &LabelSelector::default())
                .await
                .context("list disruption budgets")?
                .into_iter()
                .find(|b| b.meta.name == name);
            match holder {
                Some(existing) if existing.covered_pools() == pools => {
                    tracing::debug!(
                        volume = %volume,
                        budget = %name,
                        "disruption budget already exists"
                    );
                }
                _ => anyhow::bail!(
                    "disruption budget {name} already exists over a different pool set"
                ),
            }
        }
        Err(err) => return Err(err).with_context(|| format!("create disruption budget {name}")),
    }
    Ok(Some(name))
}
