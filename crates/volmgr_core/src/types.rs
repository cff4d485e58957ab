//! Cluster object model shared by the target server and the controllers.
//!
//! Every object carries an `ObjectMeta` with the optimistic-concurrency token
//! (`resource_version`) assigned by the store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::ReplicaUpdate;

/// Fixed application label carried by every pool instance.
pub const APP_LABEL: &str = "app";
/// Value of `APP_LABEL` on pool instances.
pub const POOL_APP: &str = "volmgr-pool";
/// Pool-instance identity label.
pub const POOL_INSTANCE_LABEL: &str = "volmgr.io/pool-instance";
/// Owning pool-cluster label.
pub const POOL_CLUSTER_LABEL: &str = "volmgr.io/pool-cluster";
/// Volume a replica object belongs to.
pub const VOLUME_LABEL: &str = "volmgr.io/volume";
/// Replica process entitled to act on a restore intent.
pub const REPLICA_UID_LABEL: &str = "volmgr.io/replica-uid";

pub type Labels = BTreeMap<String, String>;

/// Replica identity -> replica storage GUID.
pub type KnownReplicas = BTreeMap<String, String>;

/// Namespaced object identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    /// Version token bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            labels: Labels::new(),
            resource_version: 0,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDetails {
    #[serde(default)]
    pub known_replicas: KnownReplicas,
}

/// Desired replica topology of a volume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub replication_factor: u32,
    pub consistency_factor: u32,
    /// Replica count the volume was provisioned with; bounds `known_replicas`.
    pub desired_replication_factor: u32,
    #[serde(default)]
    pub replica_details: ReplicaDetails,
}

/// Observed replica topology of a volume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    #[serde(default)]
    pub replica_details: ReplicaDetails,
}

/// Per-volume replication record (one per volume, never deleted on its own).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReplicationRecord {
    pub meta: ObjectMeta,
    pub spec: VolumeSpec,
    #[serde(default)]
    pub status: VolumeStatus,
}

impl VolumeReplicationRecord {
    /// Freshly provisioned record: no replica has reported yet, so RF/CF are 0.
    pub fn provisioned(key: &ObjectKey, desired_replication_factor: u32) -> Self {
        Self {
            meta: ObjectMeta::new(&key.namespace, &key.name),
            spec: VolumeSpec {
                replication_factor: 0,
                consistency_factor: 0,
                desired_replication_factor,
                replica_details: ReplicaDetails::default(),
            },
            status: VolumeStatus::default(),
        }
    }

    pub fn with_factors(mut self, replication_factor: u32, consistency_factor: u32) -> Self {
        self.spec.replication_factor = replication_factor;
        self.spec.consistency_factor = consistency_factor;
        self
    }

    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn known_replicas(&self) -> &KnownReplicas {
        &self.spec.replica_details.known_replicas
    }

    /// Apply an already validated update to both the desired and observed views.
    pub fn apply_replica_update(&mut self, update: &ReplicaUpdate) {
        self.spec.replication_factor = update.replication_factor;
        self.spec.consistency_factor = update.consistency_factor;
        self.spec
            .replica_details
            .known_replicas
            .insert(update.replica_id.clone(), update.replica_guid.clone());
        self.status
            .replica_details
            .known_replicas
            .insert(update.replica_id.clone(), update.replica_guid.clone());
    }
}

/// Pool instance hosting volume replicas. Identity lives entirely in labels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInstance {
    pub meta: ObjectMeta,
}

impl PoolInstance {
    pub fn new(namespace: &str, name: &str, pool_cluster: &str) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name)
                .with_label(APP_LABEL, POOL_APP)
                .with_label(POOL_INSTANCE_LABEL, name)
                .with_label(POOL_CLUSTER_LABEL, pool_cluster),
        }
    }
}

/// One replica of a volume placed on a pool instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReplica {
    pub meta: ObjectMeta,
}

impl VolumeReplica {
    pub fn new(namespace: &str, volume: &str, pool_instance: &str, pool_cluster: &str) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, format!("{volume}-{pool_instance}"))
                .with_label(VOLUME_LABEL, volume)
                .with_label(POOL_INSTANCE_LABEL, pool_instance)
                .with_label(POOL_CLUSTER_LABEL, pool_cluster),
        }
    }

    pub fn volume(&self) -> Option<&str> {
        self.meta.label(VOLUME_LABEL)
    }

    pub fn pool_instance(&self) -> Option<&str> {
        self.meta.label(POOL_INSTANCE_LABEL)
    }

    pub fn pool_cluster(&self) -> Option<&str> {
        self.meta.label(POOL_CLUSTER_LABEL)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Label selector: every `match_labels` pair AND every requirement must hold.
/// An empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: Labels,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_requirement(
        mut self,
        key: impl Into<String>,
        operator: SelectorOperator,
        values: Vec<String>,
    ) -> Self {
        self.match_expressions.push(SelectorRequirement {
            key: key.into(),
            operator,
            values,
        });
        self
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|req| req.matches(labels))
    }
}
