//! Control-plane core for replicated block volumes.
//!
//! This crate holds the object model, the quorum-safety validator, the restore
//! transition table and the disruption-budget planner. The API surface is
//! intentionally small: the node crate supplies a `ClusterStore` and a
//! `RestoreExecutor`, then drives requests and reconciliations through the pure
//! functions exported here.

pub mod budget;
pub mod restore;
pub mod store;
pub mod types;
pub mod validate;
pub mod wire;

pub use budget::{plan_budget, BudgetSpec, PoolDisruptionBudget, BUDGET_MAX_UNAVAILABLE};
pub use restore::{
    classify_update, plan_step, RestoreExecutor, RestoreIntent, RestoreOperation, RestorePhase,
    RestoreSpec, RestoreStatus, RestoreStep,
};
pub use store::{ClusterStore, StoreError, StoreEvent, WatchEventKind};
pub use types::{
    KnownReplicas, LabelSelector, Labels, ObjectKey, ObjectMeta, PoolInstance, ReplicaDetails,
    SelectorOperator, SelectorRequirement, VolumeReplica, VolumeReplicationRecord, VolumeSpec,
    VolumeStatus,
};
pub use validate::{validate_replica_update, validate_request_fields, ValidationError};
pub use wire::{ReplicaUpdate, Reply, WireError};
