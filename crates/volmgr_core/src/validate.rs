//! Quorum-safety validation for replica-membership updates.
//!
//! Checks run in a fixed order and the first failure wins. Replication and
//! consistency factors only ever grow, so a retried request with equal or
//! larger values is always accepted again.

use thiserror::Error;

use crate::types::VolumeReplicationRecord;
use crate::wire::ReplicaUpdate;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("volume name is empty")]
    EmptyVolumeName,
    #[error("replica id is empty")]
    EmptyReplicaId,
    #[error("replica guid is empty")]
    EmptyReplicaGuid,
    #[error("replica id {0:?} contains whitespace or control characters")]
    UnprintableReplicaId(String),
    #[error("replica guid {0:?} contains whitespace or control characters")]
    UnprintableReplicaGuid(String),
    #[error("replication factor is zero")]
    ZeroReplicationFactor,
    #[error("consistency factor is zero")]
    ZeroConsistencyFactor,
    #[error("replica set is full ({known}/{desired}), cannot add replica {replica_id}")]
    ReplicaSetFull {
        replica_id: String,
        known: usize,
        desired: u32,
    },
    #[error("replication factor cannot shrink from {current} to {requested}")]
    ReplicationFactorShrink { current: u32, requested: u32 },
    #[error("consistency factor cannot shrink from {current} to {requested}")]
    ConsistencyFactorShrink { current: u32, requested: u32 },
    #[error("consistency factor {consistency_factor} exceeds replication factor {replication_factor}")]
    ConsistencyAboveReplication {
        replication_factor: u32,
        consistency_factor: u32,
    },
}

impl ValidationError {
    /// Malformed input as opposed to a quorum-safety violation.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ValidationError::EmptyVolumeName
                | ValidationError::EmptyReplicaId
                | ValidationError::EmptyReplicaGuid
                | ValidationError::UnprintableReplicaId(_)
                | ValidationError::UnprintableReplicaGuid(_)
                | ValidationError::ZeroReplicationFactor
                | ValidationError::ZeroConsistencyFactor
        )
    }
}

/// Record-independent checks; run before the volume record is fetched.
pub fn validate_request_fields(update: &ReplicaUpdate) -> Result<(), ValidationError> {
    if update.volume_name.is_empty() {
        return Err(ValidationError::EmptyVolumeName);
    }
    if update.replica_id.is_empty() {
        return Err(ValidationError::EmptyReplicaId);
    }
    if update.replica_guid.is_empty() {
        return Err(ValidationError::EmptyReplicaGuid);
    }
    // Both end up as tokens of a `Replica <id> <guid>` config line.
    if !is_config_token(&update.replica_id) {
        return Err(ValidationError::UnprintableReplicaId(update.replica_id.clone()));
    }
    if !is_config_token(&update.replica_guid) {
        return Err(ValidationError::UnprintableReplicaGuid(update.replica_guid.clone()));
    }
    if update.replication_factor == 0 {
        return Err(ValidationError::ZeroReplicationFactor);
    }
    if update.consistency_factor == 0 {
        return Err(ValidationError::ZeroConsistencyFactor);
    }
    Ok(())
}

fn is_config_token(value: &str) -> bool {
    !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Validate `update` against the currently persisted `record`.
pub fn validate_replica_update(
    record: &VolumeReplicationRecord,
    update: &ReplicaUpdate,
) -> Result<(), ValidationError> {
    validate_request_fields(update)?;

    let known = record.known_replicas();
    let desired = record.spec.desired_replication_factor;
    if !known.contains_key(&update.replica_id) && known.len() >= desired as usize {
        return Err(ValidationError::ReplicaSetFull {
            replica_id: update.replica_id.clone(),
            known: known.len(),
            desired,
        });
    }

    if update.replication_factor < record.spec.replication_factor {
        return Err(ValidationError::ReplicationFactorShrink {
            current: record.spec.replication_factor,
            requested: update.replication_factor,
        });
    }
    if update.consistency_factor < record.spec.consistency_factor {
        return Err(ValidationError::ConsistencyFactorShrink {
            current: record.spec.consistency_factor,
            requested: update.consistency_factor,
        });
    }
    if update.consistency_factor > update.replication_factor {
        return Err(ValidationError::ConsistencyAboveReplication {
            replication_factor: update.replication_factor,
            consistency_factor: update.consistency_factor,
        });
    }
    Ok(())
}
