//! Cluster-store boundary.
//!
//! The store is the system of record for volume, restore, replica, pool and
//! budget objects. Writes are conditional on `ObjectMeta::resource_version`;
//! a stale writer gets `StoreError::Conflict` and must re-fetch.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::budget::PoolDisruptionBudget;
use crate::restore::RestoreIntent;
use crate::types::{
    LabelSelector, ObjectKey, PoolInstance, VolumeReplica, VolumeReplicationRecord,
};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },
    #[error("{kind} {key} changed concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },
    #[error("store unavailable: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// Change notification published by the store after a successful write.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Volume {
        kind: WatchEventKind,
        key: ObjectKey,
    },
    Restore {
        kind: WatchEventKind,
        old: Option<RestoreIntent>,
        new: RestoreIntent,
    },
    VolumeReplica {
        kind: WatchEventKind,
        replica: VolumeReplica,
    },
}

#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    async fn get_volume(&self, key: &ObjectKey) -> Result<VolumeReplicationRecord, StoreError>;

    /// Conditional update; returns the stored record with its new version.
    async fn update_volume(
        &self,
        record: VolumeReplicationRecord,
    ) -> Result<VolumeReplicationRecord, StoreError>;

    async fn list_volumes(&self, namespace: &str)
        -> Result<Vec<VolumeReplicationRecord>, StoreError>;

    async fn get_restore(&self, key: &ObjectKey) -> Result<RestoreIntent, StoreError>;

    async fn list_restores(&self, namespace: &str) -> Result<Vec<RestoreIntent>, StoreError>;

    /// Conditional write of the status group only; the spec group is kept as stored.
    async fn update_restore_status(
        &self,
        intent: RestoreIntent,
    ) -> Result<RestoreIntent, StoreError>;

    async fn list_volume_replicas(
        &self,
        namespace: &str,
        volume: &str,
    ) -> Result<Vec<VolumeReplica>, StoreError>;

    async fn list_pool_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PoolInstance>, StoreError>;

    /// Budgets whose own labels match `selector`.
    async fn list_disruption_budgets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PoolDisruptionBudget>, StoreError>;

    async fn create_disruption_budget(
        &self,
        budget: PoolDisruptionBudget,
    ) -> Result<PoolDisruptionBudget, StoreError>;

    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}
