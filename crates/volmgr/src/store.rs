//! File-backed cluster store used by a standalone node and by tests.
//!
//! All objects live in one `StoreState` guarded by an `RwLock` and persisted as
//! pretty JSON after every successful write. Each write bumps a store-wide
//! version counter that becomes the object's `resource_version`; conditional
//! writes compare against it. Watchers get change events over a broadcast
//! channel.
//!
//! The file is read once at open, so a running node must be its only writer.
//! Other processes change the store through the node's admin socket.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use volmgr_core::budget::PoolDisruptionBudget;
use volmgr_core::{
    ClusterStore, LabelSelector, ObjectKey, PoolInstance, RestoreIntent, StoreError, StoreEvent,
    VolumeReplica, VolumeReplicationRecord, WatchEventKind,
};

const WATCH_CAPACITY: usize = 1024;

const VOLUME: &str = "volume";
const RESTORE: &str = "restore";
const BUDGET: &str = "disruption budget";

/// Serialized form of the store. Maps are keyed by `namespace/name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub version: u64,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeReplicationRecord>,
    #[serde(default)]
    pub restores: BTreeMap<String, RestoreIntent>,
    #[serde(default)]
    pub volume_replicas: BTreeMap<String, VolumeReplica>,
    #[serde(default)]
    pub pool_instances: BTreeMap<String, PoolInstance>,
    #[serde(default)]
    pub budgets: BTreeMap<String, PoolDisruptionBudget>,
}

impl StoreState {
    fn next_version(&mut self) -> u64 {
        self.version = self.version.saturating_add(1);
        self.version
    }
}

#[derive(Clone)]
pub struct FileClusterStore {
    state: Arc<RwLock<StoreState>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<StoreEvent>,
}

impl FileClusterStore {
    /// Load the store from `path`, or start empty if the file does not exist.
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<StoreState>(&data)
                .with_context(|| format!("parse store file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("read store file {}", path.display()))
            }
        };
        let store = Self::from_state(state, Some(path));
        store.persist(&store.state())?;
        Ok(store)
    }

    /// Store without a backing file.
    pub fn in_memory() -> Self {
        Self::from_state(StoreState::default(), None)
    }

    fn from_state(state: StoreState, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
            events,
        }
    }

    pub fn state(&self) -> StoreState {
        self.state.read().unwrap().clone()
    }

    fn persist(&self, state: &StoreState) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create store dir")?;
        }
        let data = serde_json::to_vec_pretty(state).context("serialize store state")?;
        fs::write(path, data).context("write store state")?;
        Ok(())
    }

    /// Apply `f` to a copy of the state and install it only once persisted.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = self.state.write().unwrap();
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.persist(&next)
            .map_err(|err| StoreError::Transport(format!("{err:#}")))?;
        *state = next;
        Ok(out)
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine: nothing is watching yet.
        let _ = self.events.send(event);
    }

    /// Create or replace a volume record (provisioning path).
    pub fn put_volume(
        &self,
        mut record: VolumeReplicationRecord,
    ) -> anyhow::Result<VolumeReplicationRecord> {
        let key = record.key();
        let (stored, existed) = self.mutate(|state| {
            record.meta.resource_version = state.next_version();
            let existed = state
                .volumes
                .insert(key.to_string(), record.clone())
                .is_some();
            Ok((record, existed))
        })?;
        let kind = if existed {
            WatchEventKind::Modified
        } else {
            WatchEventKind::Added
        };
        self.publish(StoreEvent::Volume { kind, key });
        Ok(stored)
    }

    /// Create a volume record along with the pool instances and replica
    /// placements behind it. An existing volume is never replaced.
    pub fn provision_volume(
        &self,
        key: &ObjectKey,
        replicas: u32,
        placements: &[(String, String)],
    ) -> anyhow::Result<VolumeReplicationRecord> {
        let (record, placed) = self.mutate(|state| {
            if state.volumes.contains_key(&key.to_string()) {
                return Err(StoreError::AlreadyExists { kind: VOLUME, key: key.clone() });
            }
            let mut placed = Vec::with_capacity(placements.len());
            for (pool, cluster) in placements {
                let mut instance = PoolInstance::new(&key.namespace, pool, cluster);
                instance.meta.resource_version = state.next_version();
                state
                    .pool_instances
                    .insert(instance.meta.key().to_string(), instance);

                let mut replica = VolumeReplica::new(&key.namespace, &key.name, pool, cluster);
                replica.meta.resource_version = state.next_version();
                let existed = state
                    .volume_replicas
                    .insert(replica.meta.key().to_string(), replica.clone())
                    .is_some();
                placed.push((replica, existed));
            }
            let mut record = VolumeReplicationRecord::provisioned(key, replicas);
            record.meta.resource_version = state.next_version();
            state.volumes.insert(key.to_string(), record.clone());
            Ok((record, placed))
        })?;

        for (replica, existed) in placed {
            let kind = if existed {
                WatchEventKind::Modified
            } else {
                WatchEventKind::Added
            };
            self.publish(StoreEvent::VolumeReplica { kind, replica });
        }
        self.publish(StoreEvent::Volume {
            kind: WatchEventKind::Added,
            key: key.clone(),
        });
        Ok(record)
    }

    pub fn create_restore(&self, mut intent: RestoreIntent) -> anyhow::Result<RestoreIntent> {
        let key = intent.key();
        let stored = self.mutate(|state| {
            if state.restores.contains_key(&key.to_string()) {
                return Err(StoreError::AlreadyExists { kind: RESTORE, key: key.clone() });
            }
            intent.meta.resource_version = state.next_version();
            state.restores.insert(key.to_string(), intent.clone());
            Ok(intent)
        })?;
        self.publish(StoreEvent::Restore {
            kind: WatchEventKind::Added,
            old: None,
            new: stored.clone(),
        });
        Ok(stored)
    }

    /// Replace the spec group of a restore intent, as an external actor would.
    pub fn update_restore_spec(&self, intent: RestoreIntent) -> anyhow::Result<RestoreIntent> {
        let key = intent.key();
        let (old, new) = self.mutate(|state| {
            let version = state.next_version();
            let stored = state
                .restores
                .get_mut(&key.to_string())
                .ok_or_else(|| StoreError::NotFound { kind: RESTORE, key: key.clone() })?;
            let old = stored.clone();
            stored.spec = intent.spec.clone();
            stored.meta.labels = intent.meta.labels.clone();
            stored.meta.resource_version = version;
            Ok((old, stored.clone()))
        })?;
        self.publish(StoreEvent::Restore {
            kind: WatchEventKind::Modified,
            old: Some(old),
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn delete_restore(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let removed = self.mutate(|state| {
            state
                .restores
                .remove(&key.to_string())
                .ok_or_else(|| StoreError::NotFound { kind: RESTORE, key: key.clone() })
        })?;
        self.publish(StoreEvent::Restore {
            kind: WatchEventKind::Deleted,
            old: None,
            new: removed,
        });
        Ok(())
    }

    pub fn put_volume_replica(&self, mut replica: VolumeReplica) -> anyhow::Result<()> {
        let key = replica.meta.key();
        let (replica, existed) = self.mutate(|state| {
            replica.meta.resource_version = state.next_version();
            let existed = state
                .volume_replicas
                .insert(key.to_string(), replica.clone())
                .is_some();
            Ok((replica, existed))
        })?;
        let kind = if existed {
            WatchEventKind::Modified
        } else {
            WatchEventKind::Added
        };
        self.publish(StoreEvent::VolumeReplica { kind, replica });
        Ok(())
    }

    pub fn put_pool_instance(&self, mut pool: PoolInstance) -> anyhow::Result<()> {
        let key = pool.meta.key();
        self.mutate(|state| {
            pool.meta.resource_version = state.next_version();
            state.pool_instances.insert(key.to_string(), pool);
            Ok(())
        })?;
        Ok(())
    }
}

fn in_namespace(key: &str, namespace: &str) -> bool {
    key.split_once('/').is_some_and(|(ns, _)| ns == namespace)
}

#[async_trait]
impl ClusterStore for FileClusterStore {
    async fn get_volume(&self, key: &ObjectKey) -> Result<VolumeReplicationRecord, StoreError> {
        self.state
            .read()
            .unwrap()
            .volumes
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: VOLUME, key: key.clone() })
    }

    async fn update_volume(
        &self,
        mut record: VolumeReplicationRecord,
    ) -> Result<VolumeReplicationRecord, StoreError> {
        let key = record.key();
        let stored = self.mutate(|state| {
            let current = state
                .volumes
                .get(&key.to_string())
                .ok_or_else(|| StoreError::NotFound { kind: VOLUME, key: key.clone() })?;
            if current.meta.resource_version != record.meta.resource_version {
                return Err(StoreError::Conflict {
                    kind: VOLUME,
                    key: key.clone(),
                    expected: record.meta.resource_version,
                    actual: current.meta.resource_version,
                });
            }
            record.meta.resource_version = state.next_version();
            state.volumes.insert(key.to_string(), record.clone());
            Ok(record)
        })?;
        self.publish(StoreEvent::Volume {
            kind: WatchEventKind::Modified,
            key,
        });
        Ok(stored)
    }

    async fn list_volumes(
        &self,
        namespace: &str,
    ) -> Result<Vec<VolumeReplicationRecord>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .volumes
            .iter()
            .filter(|(k, _)| in_namespace(k, namespace))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get_restore(&self, key: &ObjectKey) -> Result<RestoreIntent, StoreError> {
        self.state
            .read()
            .unwrap()
            .restores
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: RESTORE, key: key.clone() })
    }

    async fn list_restores(&self, namespace: &str) -> Result<Vec<RestoreIntent>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .restores
            .iter()
            .filter(|(k, _)| in_namespace(k, namespace))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn update_restore_status(
        &self,
        intent: RestoreIntent,
    ) -> Result<RestoreIntent, StoreError> {
        let key = intent.key();
        let (old, new) = self.mutate(|state| {
            let version = state.next_version();
            let stored = state
                .restores
                .get_mut(&key.to_string())
                .ok_or_else(|| StoreError::NotFound { kind: RESTORE, key: key.clone() })?;
            if stored.meta.resource_version != intent.meta.resource_version {
                return Err(StoreError::Conflict {
                    kind: RESTORE,
                    key: key.clone(),
                    expected: intent.meta.resource_version,
                    actual: stored.meta.resource_version,
                });
            }
            let old = stored.clone();
            stored.status = intent.status.clone();
            stored.meta.resource_version = version;
            Ok((old, stored.clone()))
        })?;
        self.publish(StoreEvent::Restore {
            kind: WatchEventKind::Modified,
            old: Some(old),
            new: new.clone(),
        });
        Ok(new)
    }

    async fn list_volume_replicas(
        &self,
        namespace: &str,
        volume: &str,
    ) -> Result<Vec<VolumeReplica>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .volume_replicas
            .iter()
            .filter(|(k, r)| in_namespace(k, namespace) && r.volume() == Some(volume))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn list_pool_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PoolInstance>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .pool_instances
            .iter()
            .filter(|(k, p)| in_namespace(k, namespace) && selector.matches(&p.meta.labels))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn list_disruption_budgets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PoolDisruptionBudget>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .budgets
            .iter()
            .filter(|(k, b)| in_namespace(k, namespace) && selector.matches(&b.meta.labels))
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn create_disruption_budget(
        &self,
        mut budget: PoolDisruptionBudget,
    ) -> Result<PoolDisruptionBudget, StoreError> {
        let key = budget.meta.key();
        self.mutate(|state| {
            if state.budgets.contains_key(&key.to_string()) {
                return Err(StoreError::AlreadyExists { kind: BUDGET, key: key.clone() });
            }
            budget.meta.resource_version = state.next_version();
            state.budgets.insert(key.to_string(), budget.clone());
            Ok(budget)
        })
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
