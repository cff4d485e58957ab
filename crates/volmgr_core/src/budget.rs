//! Disruption-budget planning for the pool instances backing a volume.
//!
//! At most one backing pool may be voluntarily disrupted at a time, whatever
//! the volume's replication factor.

use std::collections::BTreeSet;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{
    LabelSelector, Labels, ObjectMeta, SelectorOperator, VolumeReplica, APP_LABEL, POOL_APP,
    POOL_CLUSTER_LABEL, POOL_INSTANCE_LABEL,
};

/// Budget-wide unavailability limit.
pub const BUDGET_MAX_UNAVAILABLE: u32 = 1;
/// Prefix of the per-pool boolean label on budget objects.
pub const POOL_BUDGET_LABEL_PREFIX: &str = "pool.volmgr.io/";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub selector: LabelSelector,
    pub max_unavailable: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDisruptionBudget {
    pub meta: ObjectMeta,
    pub spec: BudgetSpec,
}

impl PoolDisruptionBudget {
    /// Pool instances named by the selector's pool-instance `In` requirement.
    pub fn covered_pools(&self) -> BTreeSet<String> {
        self.spec
            .selector
            .match_expressions
            .iter()
            .filter(|req| req.key == POOL_INSTANCE_LABEL && req.operator == SelectorOperator::In)
            .flat_map(|req| req.values.iter().cloned())
            .collect()
    }

    pub fn pool_cluster(&self) -> Option<&str> {
        self.meta.label(POOL_CLUSTER_LABEL)
    }
}

/// Fixed app label AND pool-instance label in `pools`.
pub fn budget_selector(pools: &BTreeSet<String>) -> LabelSelector {
    LabelSelector::default()
        .with_label(APP_LABEL, POOL_APP)
        .with_requirement(
            POOL_INSTANCE_LABEL,
            SelectorOperator::In,
            pools.iter().cloned().collect(),
        )
}

/// One boolean label per pool plus the owning pool-cluster label.
pub fn budget_labels(pool_cluster: &str, pools: &BTreeSet<String>) -> Labels {
    let mut labels: Labels = pools
        .iter()
        .map(|pool| (pool_budget_label(pool), "true".to_string()))
        .collect();
    labels.insert(POOL_CLUSTER_LABEL.to_string(), pool_cluster.to_string());
    labels
}

pub fn pool_budget_label(pool: &str) -> String {
    format!("{POOL_BUDGET_LABEL_PREFIX}{pool}")
}

/// Deterministic name for the budget covering `pools`: the pool cluster plus
/// the first 16 hex chars of a SHA-256 over the sorted pool names.
pub fn budget_name(pool_cluster: &str, pools: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for pool in pools {
        hasher.update(pool.as_bytes());
        hasher.update([0u8]);
    }
    let hash = hasher.finalize();
    format!("{pool_cluster}-{}", hex::encode(&hash[..8]))
}

pub fn plan_budget(
    namespace: &str,
    pool_cluster: &str,
    pools: &BTreeSet<String>,
) -> PoolDisruptionBudget {
    let mut meta = ObjectMeta::new(namespace, budget_name(pool_cluster, pools));
    meta.labels = budget_labels(pool_cluster, pools);
    PoolDisruptionBudget {
        meta,
        spec: BudgetSpec {
            selector: budget_selector(pools),
            max_unavailable: BUDGET_MAX_UNAVAILABLE,
        },
    }
}

/// Pool cluster and pool set backing `replicas`. `None` when there are none.
///
/// All replicas of a volume must live in a single pool cluster.
pub fn backing_pools(
    replicas: &[VolumeReplica],
) -> anyhow::Result<Option<(String, BTreeSet<String>)>> {
    let mut cluster: Option<&str> = None;
    let mut pools = BTreeSet::new();
    for replica in replicas {
        let (Some(pool), Some(replica_cluster)) = (replica.pool_instance(), replica.pool_cluster())
        else {
            bail!("replica {} is missing pool labels", replica.meta.key());
        };
        match cluster {
            Some(existing) if existing != replica_cluster => {
                bail!(
                    "replicas span pool clusters {existing} and {replica_cluster}; expected one"
                );
            }
            _ => cluster = Some(replica_cluster),
        }
        pools.insert(pool.to_string());
    }
    Ok(cluster.map(|c| (c.to_string(), pools)))
}
