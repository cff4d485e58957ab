//! Admin socket of a running node.
//!
//! Protocol: newline-delimited JSON over a Unix socket, any number of requests
//! per connection.
//!
//! Request format: `{"op": "provision", ...}\n`
//! Response format: `{"ok": <value>}\n` or `{"err": "<message>"}\n`
//!
//! Every change to the node's store from outside the process goes through
//! here, so the node stays the only writer of its store file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};
use volmgr_core::types::REPLICA_UID_LABEL;
use volmgr_core::{ObjectKey, ObjectMeta, RestoreIntent, RestoreSpec};

use crate::listener;
use crate::store::FileClusterStore;

/// Longest request line accepted.
pub const MAX_ADMIN_LINE: usize = 64 * 1024;

/// Replica placement on a pool instance, written `<pool>@<cluster>` on the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub pool: String,
    pub cluster: String,
}

impl FromStr for Placement {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('@') {
            Some((pool, cluster)) if !pool.is_empty() && !cluster.is_empty() => Ok(Self {
                pool: pool.to_string(),
                cluster: cluster.to_string(),
            }),
            _ => anyhow::bail!("placement {raw:?} is not <pool>@<cluster>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    /// Create a volume record and place its replicas.
    Provision {
        volume: String,
        replicas: u32,
        #[serde(default)]
        placements: Vec<Placement>,
    },
    /// Ask the replica identified by `replica_uid` to restore a backup.
    CreateRestore {
        name: String,
        replica_uid: String,
        volume: String,
        backup: String,
        #[serde(default)]
        source: String,
    },
    /// Dump the whole store.
    State,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdminResponse {
    Ok { ok: serde_json::Value },
    Err { err: String },
}

impl AdminResponse {
    pub fn into_result(self) -> anyhow::Result<serde_json::Value> {
        match self {
            AdminResponse::Ok { ok } => Ok(ok),
            AdminResponse::Err { err } => Err(anyhow::anyhow!(err)),
        }
    }
}

pub struct AdminContext {
    pub store: Arc<FileClusterStore>,
    /// Namespace new objects are created in.
    pub namespace: String,
}

/// Serve the admin socket until `shutdown` resolves.
pub async fn run<F>(
    socket_path: PathBuf,
    ctx: Arc<AdminContext>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    listener::serve(socket_path, "admin", shutdown, move |socket| {
        handle_conn(socket, ctx.clone())
    })
    .await
}

async fn handle_conn(socket: UnixStream, ctx: Arc<AdminContext>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_ADMIN_LINE));
    while let Some(line) = framed.next().await {
        let (response, fatal) = match line {
            Ok(line) => (respond(&ctx, &line), None),
            // The codec cannot resync after an oversized or broken line.
            Err(err) => (
                AdminResponse::Err {
                    err: format!("unreadable admin request: {err}"),
                },
                Some(err),
            ),
        };
        let text = serde_json::to_string(&response).context("encode admin response")?;
        framed.send(text).await.context("send admin response")?;
        if let Some(err) = fatal {
            return Err(err).context("read admin request");
        }
    }
    Ok(())
}

fn respond(ctx: &AdminContext, line: &str) -> AdminResponse {
    let request = match serde_json::from_str::<AdminRequest>(line) {
        Ok(request) => request,
        Err(err) => {
            return AdminResponse::Err {
                err: format!("invalid admin request: {err}"),
            }
        }
    };
    match handle_request(ctx, request) {
        Ok(ok) => AdminResponse::Ok { ok },
        Err(err) => {
            tracing::warn!(error = ?err, "admin request failed");
            AdminResponse::Err {
                err: format!("{err:#}"),
            }
        }
    }
}

/// Apply one admin request to the store.
pub fn handle_request(
    ctx: &AdminContext,
    request: AdminRequest,
) -> anyhow::Result<serde_json::Value> {
    match request {
        AdminRequest::Provision {
            volume,
            replicas,
            placements,
        } => {
            if volume.is_empty() {
                anyhow::bail!("volume name is empty");
            }
            if replicas == 0 {
                anyhow::bail!("replicas must be at least 1");
            }
            let key = ObjectKey::new(&ctx.namespace, &volume);
            let placements: Vec<(String, String)> = placements
                .into_iter()
                .map(|p| (p.pool, p.cluster))
                .collect();
            let record = ctx.store.provision_volume(&key, replicas, &placements)?;
            tracing::info!(
                volume = %key,
                replicas,
                placements = placements.len(),
                "volume provisioned"
            );
            Ok(serde_json::to_value(record)?)
        }
        AdminRequest::CreateRestore {
            name,
            replica_uid,
            volume,
            backup,
            source,
        } => {
            if name.is_empty() {
                anyhow::bail!("restore name is empty");
            }
            if replica_uid.is_empty() {
                anyhow::bail!("replica uid is empty");
            }
            let meta = ObjectMeta::new(&ctx.namespace, &name)
                .with_label(REPLICA_UID_LABEL, &replica_uid);
            let intent = ctx.store.create_restore(RestoreIntent::new(
                meta,
                RestoreSpec {
                    volume_name: volume,
                    backup_name: backup,
                    restore_source: source,
                },
            ))?;
            tracing::info!(restore = %intent.key(), %replica_uid, "restore intent created");
            Ok(serde_json::to_value(intent)?)
        }
        AdminRequest::State => Ok(serde_json::to_value(ctx.store.state())?),
    }
}

/// Send one request to the admin socket at `socket_path`.
pub async fn request(
    socket_path: &Path,
    request: &AdminRequest,
) -> anyhow::Result<serde_json::Value> {
    let socket = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect {}", socket_path.display()))?;
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(usize::MAX));
    let text = serde_json::to_string(request).context("encode admin request")?;
    framed.send(text).await.context("send admin request")?;
    let line = match framed.next().await {
        Some(line) => line.context("read admin response")?,
        None => anyhow::bail!("admin connection closed without a response"),
    };
    let response: AdminResponse =
        serde_json::from_str(&line).context("parse admin response")?;
    response.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AdminContext {
        AdminContext {
            store: Arc::new(FileClusterStore::in_memory()),
            namespace: "default".to_string(),
        }
    }

    #[test]
    fn placement_needs_pool_and_cluster() {
        assert_eq!(
            "p1@c1".parse::<Placement>().expect("parse"),
            Placement {
                pool: "p1".into(),
                cluster: "c1".into()
            }
        );
        assert!("p1".parse::<Placement>().is_err());
        assert!("@c1".parse::<Placement>().is_err());
        assert!("p1@".parse::<Placement>().is_err());
    }

    #[test]
    fn request_wire_shape() {
        let parsed: AdminRequest = serde_json::from_str(
            r#"{"op":"create_restore","name":"r-1","replica_uid":"u1","volume":"v1","backup":"b1"}"#,
        )
        .expect("parse");
        assert_eq!(
            parsed,
            AdminRequest::CreateRestore {
                name: "r-1".into(),
                replica_uid: "u1".into(),
                volume: "v1".into(),
                backup: "b1".into(),
                source: String::new(),
            }
        );
        let state: AdminRequest = serde_json::from_str(r#"{"op":"state"}"#).expect("parse");
        assert_eq!(state, AdminRequest::State);
    }

    #[test]
    fn provision_refuses_to_overwrite() {
        let ctx = context();
        let provision = AdminRequest::Provision {
            volume: "v1".into(),
            replicas: 3,
            placements: vec!["p1@c1".parse().expect("p1"), "p2@c1".parse().expect("p2")],
        };
        handle_request(&ctx, provision.clone()).expect("provision");
        let err = handle_request(&ctx, provision).expect_err("second provision");
        assert!(format!("{err:#}").contains("already exists"));

        let state = ctx.store.state();
        assert_eq!(state.volume_replicas.len(), 2);
        assert_eq!(state.pool_instances.len(), 2);
        assert_eq!(state.volumes["default/v1"].spec.desired_replication_factor, 3);
    }

    #[test]
    fn restore_intent_is_labelled_for_its_replica() {
        let ctx = context();
        let created = handle_request(
            &ctx,
            AdminRequest::CreateRestore {
                name: "restore-1".into(),
                replica_uid: "uid-1".into(),
                volume: "v1".into(),
                backup: "snap-1".into(),
                source: "10.0.0.1:9000".into(),
            },
        )
        .expect("create");
        let intent: RestoreIntent = serde_json::from_value(created).expect("intent");
        assert!(intent.is_owned_by("uid-1"));
        assert!(intent.is_pending());

        let missing_owner = AdminRequest::CreateRestore {
            name: "restore-2".into(),
            replica_uid: String::new(),
            volume: "v1".into(),
            backup: "snap-1".into(),
            source: String::new(),
        };
        assert!(handle_request(&ctx, missing_owner).is_err());
    }

    #[test]
    fn bad_lines_get_an_error_response() {
        let ctx = context();
        let response = respond(&ctx, "not json");
        assert!(matches!(response, AdminResponse::Err { .. }));
        let response = respond(&ctx, r#"{"op":"provision","volume":"v1","replicas":0}"#);
        assert!(matches!(response, AdminResponse::Err { err } if err.contains("at least 1")));
    }
}
