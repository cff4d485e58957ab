//! Admin client for a running node: provision volumes, request restores,
//! inspect the store, or send a replica update by hand.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use volmgr::admin::{self, AdminRequest, Placement};
use volmgr_core::wire::TargetClientCodec;
use volmgr_core::{ReplicaUpdate, Reply};

#[derive(Parser)]
#[command(name = "volctl")]
#[command(about = "Admin client for the volmgr node", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct AdminTarget {
    #[arg(long, env = "VOLMGR_ADMIN_SOCKET", default_value = "/var/run/volmgr/admin.sock")]
    admin_socket: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Send one replica-membership update over the target socket.
    Register {
        #[arg(long, env = "VOLMGR_SOCKET_PATH", default_value = "/var/run/volmgr/target.sock")]
        socket_path: PathBuf,
        #[arg(long)]
        volume: String,
        #[arg(long)]
        replica_id: String,
        #[arg(long)]
        replica_guid: String,
        #[arg(long)]
        replication_factor: u32,
        #[arg(long)]
        consistency_factor: u32,
    },
    /// Create a volume record and place its replicas.
    Provision {
        #[command(flatten)]
        target: AdminTarget,
        #[arg(long)]
        volume: String,
        /// Number of replicas the volume is provisioned with.
        #[arg(long, default_value_t = 3)]
        replicas: u32,
        /// Replica placement as `<pool-instance>@<pool-cluster>`; repeatable.
        #[arg(long = "placement")]
        placements: Vec<Placement>,
    },
    /// Ask one replica to restore a backup.
    Restore {
        #[command(flatten)]
        target: AdminTarget,
        /// Name of the restore intent.
        #[arg(long)]
        name: String,
        #[arg(long)]
        replica_uid: String,
        #[arg(long)]
        volume: String,
        #[arg(long)]
        backup: String,
        /// Remote endpoint the backup is pulled from.
        #[arg(long, default_value = "")]
        source: String,
    },
    /// Print the node's store, or one volume record from it.
    State {
        #[command(flatten)]
        target: AdminTarget,
        /// Only print the record of this volume (`namespace/name`).
        #[arg(long)]
        volume: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Register {
            socket_path,
            volume,
            replica_id,
            replica_guid,
            replication_factor,
            consistency_factor,
        } => {
            let update = ReplicaUpdate {
                volume_name: volume,
                replica_id,
                replica_guid,
                replication_factor,
                consistency_factor,
            };
            let reply = register(&socket_path, &update).await?;
            println!("{}", reply.as_str());
            if reply == Reply::Err {
                std::process::exit(1);
            }
        }
        Command::Provision {
            target,
            volume,
            replicas,
            placements,
        } => {
            let record = admin::request(
                &target.admin_socket,
                &AdminRequest::Provision {
                    volume,
                    replicas,
                    placements,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Restore {
            target,
            name,
            replica_uid,
            volume,
            backup,
            source,
        } => {
            let intent = admin::request(
                &target.admin_socket,
                &AdminRequest::CreateRestore {
                    name,
                    replica_uid,
                    volume,
                    backup,
                    source,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&intent)?);
        }
        Command::State { target, volume } => {
            let state = admin::request(&target.admin_socket, &AdminRequest::State).await?;
            let shown = match volume {
                Some(key) => state
                    .get("volumes")
                    .and_then(|volumes| volumes.get(&key))
                    .with_context(|| format!("volume {key} not found"))?,
                None => &state,
            };
            println!("{}", serde_json::to_string_pretty(shown)?);
        }
    }
    Ok(())
}

async fn register(socket_path: &Path, update: &ReplicaUpdate) -> anyhow::Result<Reply> {
    let socket = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect {}", socket_path.display()))?;
    let mut framed = Framed::new(socket, TargetClientCodec);
    framed.send(update).await.context("send update")?;
    match framed.next().await {
        Some(reply) => Ok(reply.context("read reply")?),
        None => anyhow::bail!("connection closed without a reply"),
    }
}
