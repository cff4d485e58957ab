//! Unix-socket server for replica-membership updates from the storage target.
//!
//! Every connection carries one request and gets one `Ok`/`Err` reply. The
//! volume record is updated first, then the same values are upserted into the
//! target's config file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use volmgr_core::wire::{TargetServerCodec, MAX_REQUEST_BYTES};
use volmgr_core::{
    validate_replica_update, validate_request_fields, ClusterStore, ObjectKey, ReplicaUpdate,
    Reply, VolumeReplicationRecord,
};

use crate::config_file::{self, ConfigFileWriter};
use crate::listener;

/// Tuning for the target server.
#[derive(Clone, Copy, Debug)]
pub struct TargetServerConfig {
    /// Attempts at the read-validate-write cycle when the record changes
    /// underneath us.
    pub update_retries: usize,
    /// Request size limit before the end-of-message marker.
    pub max_request_bytes: usize,
}

impl Default for TargetServerConfig {
    fn default() -> Self {
        Self {
            update_retries: 5,
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }
}

/// Shared state handed to every connection task.
pub struct TargetContext {
    pub store: Arc<dyn ClusterStore>,
    pub writer: ConfigFileWriter,
    /// Namespace the volume records live in.
    pub namespace: String,
    pub cfg: TargetServerConfig,
}

/// Serve `socket_path` until `shutdown` resolves.
///
/// A stale socket file is removed first. Connections still in flight when
/// shutdown fires are allowed to finish.
pub async fn run<F>(
    socket_path: PathBuf,
    ctx: Arc<TargetContext>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    listener::serve(socket_path, "target", shutdown, move |socket| {
        handle_conn(socket, ctx.clone())
    })
    .await
}

async fn handle_conn(socket: UnixStream, ctx: Arc<TargetContext>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, TargetServerCodec::new(ctx.cfg.max_request_bytes));
    let reply = match framed.next().await {
        None => {
            tracing::warn!("target connection closed before sending a request");
            Reply::Err
        }
        Some(Err(err)) => {
            tracing::warn!(error = %err, "rejecting unreadable replication request");
            Reply::Err
        }
        Some(Ok(update)) => match apply_update(&ctx, &update).await {
            Ok(()) => Reply::Ok,
            Err(err) => {
                tracing::warn!(
                    volume = %update.volume_name,
                    replica = %update.replica_id,
                    error = ?err,
                    "rejecting replication request"
                );
                Reply::Err
            }
        },
    };
    framed.send(reply).await.context("send reply")?;
    Ok(())
}

/// Validate `update` against the stored record, persist it and mirror it into
/// the config file.
pub async fn apply_update(ctx: &TargetContext, update: &ReplicaUpdate) -> anyhow::Result<()> {
    validate_request_fields(update)?;
    let key = ObjectKey::new(&ctx.namespace, &update.volume_name);
    let record = persist_update(ctx, &key, update).await?;

    ctx.writer
        .apply_blocking(config_file::update_lines(update))
        .await
        .with_context(|| format!("volume {key} persisted but config file not updated"))?;

    tracing::info!(
        volume = %key,
        replica = %update.replica_id,
        replication_factor = update.replication_factor,
        consistency_factor = update.consistency_factor,
        known_replicas = record.known_replicas().len(),
        "replica update applied"
    );
    Ok(())
}

async fn persist_update(
    ctx: &TargetContext,
    key: &ObjectKey,
    update: &ReplicaUpdate,
) -> anyhow::Result<VolumeReplicationRecord> {
    let attempts = ctx.cfg.update_retries.max(1);
    for attempt in 1..=attempts {
        let current = ctx
            .store
            .get_volume(key)
            .await
            .with_context(|| format!("load volume record {key}"))?;
        validate_replica_update(&current, update)?;

        let mut next = current.clone();
        next.apply_replica_update(update);
        if next == current {
            return Ok(current);
        }
        match ctx.store.update_volume(next).await {
            Ok(stored) => return Ok(stored),
            Err(err) if err.is_conflict() && attempt < attempts => {
                tracing::debug!(volume = %key, attempt, "volume record changed, retrying");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("update volume record {key}"));
            }
        }
    }
    anyhow::bail!("volume record {key} kept changing after {attempts} attempts")
}
