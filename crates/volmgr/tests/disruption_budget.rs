//! Disruption budgets created by the budget controller.
//!
//! Test flow:
//! 1) Register pool instances and place volume replicas on them.
//! 2) Run the budget controller and wait for a budget to appear.
//! 3) Check the budget's selector against every pool instance in the store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, IO_TIMEOUT, NAMESPACE};
use volmgr::budget_controller::{self, BudgetControllerConfig};
use volmgr::FileClusterStore;
use volmgr_core::{PoolInstance, VolumeReplica};

fn controller_config() -> BudgetControllerConfig {
    BudgetControllerConfig {
        workers: 2,
        resync_interval: Duration::from_millis(50),
        retry_delay: Duration::from_millis(20),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn budget_selects_exactly_the_backing_pools() {
    let store = Arc::new(FileClusterStore::in_memory());
    for pool in ["p1", "p2", "p3", "p4"] {
        store
            .put_pool_instance(PoolInstance::new(NAMESPACE, pool, "c1"))
            .expect("pool");
    }
    let handle = budget_controller::spawn(store.clone(), NAMESPACE.into(), controller_config());

    for pool in ["p1", "p2", "p3"] {
        store
            .put_volume_replica(VolumeReplica::new(NAMESPACE, "v1", pool, "c1"))
            .expect("replica");
    }
    let created = wait_until(IO_TIMEOUT, || async {
        store
            .state()
            .budgets
            .values()
            .any(|b| b.covered_pools().len() == 3)
    })
    .await;
    assert!(created, "budget for three pools never appeared");

    let state = store.state();
    let budget = state
        .budgets
        .values()
        .find(|b| b.covered_pools().len() == 3)
        .expect("budget");
    assert_eq!(budget.spec.max_unavailable, 1);
    assert_eq!(budget.pool_cluster(), Some("c1"));

    let selected: Vec<&str> = state
        .pool_instances
        .values()
        .filter(|p| budget.spec.selector.matches(&p.meta.labels))
        .map(|p| p.meta.name.as_str())
        .collect();
    assert_eq!(selected, vec!["p1", "p2", "p3"]);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_reconciles_keep_a_single_budget() {
    let store = Arc::new(FileClusterStore::in_memory());
    for pool in ["p1", "p2"] {
        store
            .put_pool_instance(PoolInstance::new(NAMESPACE, pool, "c1"))
            .expect("pool");
        store
            .put_volume_replica(VolumeReplica::new(NAMESPACE, "v1", pool, "c1"))
            .expect("replica");
    }
    let handle = budget_controller::spawn(store.clone(), NAMESPACE.into(), controller_config());
    // Replica events land before the controller existed; the volume record
    // brings the volume into the periodic resync.
    store
        .put_volume(volmgr_core::VolumeReplicationRecord::provisioned(
            &common::volume_key(),
            2,
        ))
        .expect("volume");

    let created = wait_until(IO_TIMEOUT, || async { !store.state().budgets.is_empty() }).await;
    assert!(created);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.state().budgets.len(), 1);

    handle.shutdown().await;
}
