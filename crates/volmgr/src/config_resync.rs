//! Periodic re-render of one volume's record into the target config file.
//!
//! Repairs the file when a replica update reached the store but the file
//! write that followed it failed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use volmgr_core::{ClusterStore, ObjectKey};

use crate::config_file::{self, ConfigFileWriter};

#[derive(Clone, Copy, Debug)]
pub struct ConfigResyncConfig {
    pub interval: Duration,
}

/// Spawn the resync loop; it exits when `stop` flips or its sender drops.
pub fn spawn(
    store: Arc<dyn ClusterStore>,
    writer: ConfigFileWriter,
    volume: ObjectKey,
    cfg: ConfigResyncConfig,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = resync_once(store.as_ref(), &writer, &volume).await {
                        tracing::warn!(volume = %volume, error = ?err, "config file resync failed");
                    }
                }
            }
        }
    })
}

/// Upsert the persisted record of `volume` into the config file.
pub async fn resync_once(
    store: &dyn ClusterStore,
    writer: &ConfigFileWriter,
    volume: &ObjectKey,
) -> anyhow::Result<()> {
    let record = store
        .get_volume(volume)
        .await
        .with_context(|| format!("load volume record {volume}"))?;
    if record.known_replicas().is_empty() {
        // Nothing reported yet; zero factors would only clutter the file.
        return Ok(());
    }
    writer
        .apply_blocking(config_file::record_lines(&record))
        .await
        .with_context(|| format!("write config for {volume}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileClusterStore;
    use volmgr_core::{ReplicaUpdate, VolumeReplicationRecord};

    #[tokio::test]
    async fn heals_a_stale_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("istgt.conf");
        std::fs::write(&conf, "  ReplicationFactor 1\n").expect("seed");

        let store = FileClusterStore::in_memory();
        let key = ObjectKey::new("default", "v1");
        let mut record = VolumeReplicationRecord::provisioned(&key, 3);
        record.apply_replica_update(&ReplicaUpdate {
            volume_name: "v1".into(),
            replica_id: "r1".into(),
            replica_guid: "g1".into(),
            replication_factor: 3,
            consistency_factor: 2,
        });
        store.put_volume(record).expect("provision");

        resync_once(&store, &ConfigFileWriter::new(&conf), &key)
            .await
            .expect("resync");
        let text = std::fs::read_to_string(&conf).expect("read");
        assert_eq!(text, "  ReplicationFactor 3\nConsistencyFactor 2\nReplica r1 g1\n");
    }

    #[tokio::test]
    async fn record_without_replicas_leaves_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("istgt.conf");
        std::fs::write(&conf, "[Global]\n").expect("seed");

        let store = FileClusterStore::in_memory();
        let key = ObjectKey::new("default", "v1");
        store
            .put_volume(VolumeReplicationRecord::provisioned(&key, 3))
            .expect("provision");

        resync_once(&store, &ConfigFileWriter::new(&conf), &key)
            .await
            .expect("resync");
        assert_eq!(std::fs::read_to_string(&conf).expect("read"), "[Global]\n");
    }
}
