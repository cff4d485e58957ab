//! Restore-intent model and its level-triggered transition table.
//!
//! The table only looks at the intent's current phase and the operation kind,
//! never at the transition that produced the event. Done, Failed and Invalid
//! are never left once reached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ObjectKey, ObjectMeta, REPLICA_UID_LABEL};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestorePhase {
    #[default]
    Pending,
    Init,
    InProgress,
    Done,
    Failed,
    Invalid,
}

impl RestorePhase {
    /// Done and Failed are the outcomes of an executed restore.
    pub fn is_terminal(self) -> bool {
        matches!(self, RestorePhase::Done | RestorePhase::Failed)
    }

    /// Phases in which no further transition is ever taken.
    pub fn is_final(self) -> bool {
        self.is_terminal() || self == RestorePhase::Invalid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestorePhase::Pending => "Pending",
            RestorePhase::Init => "Init",
            RestorePhase::InProgress => "InProgress",
            RestorePhase::Done => "Done",
            RestorePhase::Failed => "Failed",
            RestorePhase::Invalid => "Invalid",
        }
    }
}

/// Spec field group of an intent. Written by whoever requests the restore.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSpec {
    pub volume_name: String,
    pub backup_name: String,
    /// Remote endpoint the executor pulls backup data from.
    #[serde(default)]
    pub restore_source: String,
}

impl RestoreSpec {
    /// Reason the spec cannot be acted on, if any.
    pub fn invalid_reason(&self) -> Option<String> {
        if self.volume_name.is_empty() {
            return Some("restore intent has no volume name".to_string());
        }
        if self.backup_name.is_empty() {
            return Some("restore intent has no backup name".to_string());
        }
        None
    }
}

/// Status field group of an intent. Written only by the restore controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStatus {
    #[serde(default)]
    pub phase: RestorePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl RestoreStatus {
    pub fn new(phase: RestorePhase) -> Self {
        Self {
            phase,
            reason: String::new(),
        }
    }

    pub fn with_reason(phase: RestorePhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreIntent {
    pub meta: ObjectMeta,
    pub spec: RestoreSpec,
    #[serde(default)]
    pub status: RestoreStatus,
}

impl RestoreIntent {
    pub fn new(meta: ObjectMeta, spec: RestoreSpec) -> Self {
        Self {
            meta,
            spec,
            status: RestoreStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.meta.key()
    }

    pub fn phase(&self) -> RestorePhase {
        self.status.phase
    }

    pub fn is_pending(&self) -> bool {
        self.status.phase == RestorePhase::Pending
    }

    pub fn owner_replica_uid(&self) -> Option<&str> {
        self.meta.label(REPLICA_UID_LABEL)
    }

    pub fn is_owned_by(&self, replica_uid: &str) -> bool {
        self.owner_replica_uid() == Some(replica_uid)
    }
}

/// Kind of observed change, dispatched to one handler each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RestoreOperation {
    Add,
    Modify,
    Sync,
    Destroy,
}

/// Classify a modification of `old` into `new`.
///
/// Equal versions are a resync; a pure status change is our own write and is
/// dropped; anything touching the spec group is a modify.
pub fn classify_update(old: &RestoreIntent, new: &RestoreIntent) -> Option<RestoreOperation> {
    if old.meta.resource_version == new.meta.resource_version {
        return Some(RestoreOperation::Sync);
    }
    if old.spec == new.spec && old.meta.labels == new.meta.labels {
        return None;
    }
    Some(RestoreOperation::Modify)
}

/// Action chosen for an intent in its current phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreStep {
    Noop,
    /// Pending -> Init.
    MarkInit,
    /// Pending -> Invalid with a reason.
    MarkInvalid(String),
    /// Init -> InProgress -> Done | Failed.
    Execute,
    /// InProgress found without a running execution: the previous attempt was
    /// cut short (process restart), so it is failed instead of re-run.
    MarkInterrupted,
}

pub fn plan_step(intent: &RestoreIntent, op: RestoreOperation) -> RestoreStep {
    match op {
        // Reserved: spec edits and deletions carry no semantics yet.
        RestoreOperation::Modify | RestoreOperation::Destroy => RestoreStep::Noop,
        RestoreOperation::Add | RestoreOperation::Sync => match intent.status.phase {
            RestorePhase::Pending => match intent.spec.invalid_reason() {
                Some(reason) => RestoreStep::MarkInvalid(reason),
                None => RestoreStep::MarkInit,
            },
            RestorePhase::Init if op == RestoreOperation::Sync => RestoreStep::Execute,
            RestorePhase::Init => RestoreStep::Noop,
            RestorePhase::InProgress => RestoreStep::MarkInterrupted,
            RestorePhase::Done | RestorePhase::Failed | RestorePhase::Invalid => RestoreStep::Noop,
        },
    }
}

/// The data-transfer primitive that performs a restore for one replica.
#[async_trait]
pub trait RestoreExecutor: Send + Sync + 'static {
    async fn execute(&self, intent: &RestoreIntent) -> anyhow::Result<()>;
}
