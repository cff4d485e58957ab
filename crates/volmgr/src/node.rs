//! Node runtime: wires the store, the sockets and the controllers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use volmgr_core::{ClusterStore, ObjectKey};

use crate::admin::{self, AdminContext};
use crate::budget_controller::{self, BudgetControllerConfig};
use crate::config_file::ConfigFileWriter;
use crate::config_resync::{self, ConfigResyncConfig};
use crate::restore_controller::{self, RestoreContext, RestoreControllerConfig};
use crate::restore_executor::CommandRestoreExecutor;
use crate::store::FileClusterStore;
use crate::target_server::{self, TargetContext, TargetServerConfig};

/// CLI options for running a node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    /// Unix socket the storage target sends replica updates to.
    #[arg(long, env = "VOLMGR_SOCKET_PATH", default_value = "/var/run/volmgr/target.sock")]
    pub socket_path: PathBuf,

    /// Unix socket `volctl` uses to provision volumes and request restores.
    #[arg(long, env = "VOLMGR_ADMIN_SOCKET", default_value = "/var/run/volmgr/admin.sock")]
    pub admin_socket: PathBuf,

    /// Storage target configuration file kept in sync with accepted updates.
    #[arg(long, env = "VOLMGR_CONFIG_FILE", default_value = "/usr/local/etc/istgt/istgt.conf")]
    pub config_file: PathBuf,

    #[arg(long, env = "VOLMGR_STORE_PATH", default_value = "/var/lib/volmgr/store.json")]
    pub store_path: PathBuf,

    /// Namespace holding volume, restore and budget objects.
    #[arg(long, env = "VOLMGR_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Identity of this replica process. Restore intents labelled with it are
    /// executed here; without it the restore controller does not run.
    #[arg(long, env = "VOLMGR_REPLICA_UID")]
    pub replica_uid: Option<String>,

    /// Volume served by the local target, used by the config resync loop.
    #[arg(long, env = "VOLMGR_VOLUME")]
    pub volume: Option<String>,

    /// Read-validate-write attempts per replica update before giving up.
    #[arg(long, env = "VOLMGR_UPDATE_RETRIES", default_value_t = 5)]
    pub update_retries: usize,

    #[arg(long, env = "VOLMGR_RESTORE_WORKERS", default_value_t = 2)]
    pub restore_workers: usize,

    /// Interval at which every owned restore intent is re-examined.
    #[arg(long, env = "VOLMGR_RESTORE_RESYNC_MS", default_value_t = 30_000)]
    pub restore_resync_ms: u64,

    /// Program invoked as `<program> <volume> <backup> <source>` to restore.
    #[arg(long, env = "VOLMGR_RESTORE_COMMAND", default_value = "volmgr-restore")]
    pub restore_command: PathBuf,

    #[arg(long, env = "VOLMGR_BUDGET_WORKERS", default_value_t = 1)]
    pub budget_workers: usize,

    #[arg(long, env = "VOLMGR_BUDGET_RESYNC_MS", default_value_t = 60_000)]
    pub budget_resync_ms: u64,

    /// Backoff before a failed controller item is retried.
    #[arg(long, env = "VOLMGR_RETRY_DELAY_MS", default_value_t = 1_000)]
    pub retry_delay_ms: u64,

    /// Re-render the volume record into the config file at this interval.
    /// Requires `--volume`. `0` disables it.
    #[arg(long, env = "VOLMGR_CONFIG_RESYNC_INTERVAL_MS", default_value_t = 0)]
    pub config_resync_interval_ms: u64,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Run a node until ctrl-c.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a node until `shutdown` resolves or one of its sockets fails.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    if args.config_resync_interval_ms > 0 && args.volume.is_none() {
        anyhow::bail!("--config-resync-interval-ms requires --volume");
    }

    let file_store =
        Arc::new(FileClusterStore::load_or_init(&args.store_path).context("open cluster store")?);
    let store: Arc<dyn ClusterStore> = file_store.clone();
    let writer = ConfigFileWriter::new(&args.config_file);
    let retry_delay = millis(args.retry_delay_ms);

    let restore = match &args.replica_uid {
        Some(replica_uid) => Some(restore_controller::spawn(
            Arc::new(RestoreContext {
                store: store.clone(),
                executor: Arc::new(CommandRestoreExecutor::new(&args.restore_command)),
                namespace: args.namespace.clone(),
                replica_uid: replica_uid.clone(),
            }),
            RestoreControllerConfig {
                workers: args.restore_workers,
                resync_interval: millis(args.restore_resync_ms),
                retry_delay,
                ..RestoreControllerConfig::default()
            },
        )),
        None => {
            tracing::warn!("no replica uid configured; restore controller disabled");
            None
        }
    };

    let budgets = budget_controller::spawn(
        store.clone(),
        args.namespace.clone(),
        BudgetControllerConfig {
            workers: args.budget_workers,
            resync_interval: millis(args.budget_resync_ms),
            retry_delay,
        },
    );

    let (resync_stop, resync_stop_rx) = watch::channel(false);
    let resync = match (&args.volume, args.config_resync_interval_ms) {
        (Some(volume), ms) if ms > 0 => Some(config_resync::spawn(
            store.clone(),
            writer.clone(),
            ObjectKey::new(&args.namespace, volume),
            ConfigResyncConfig {
                interval: millis(ms),
            },
            resync_stop_rx,
        )),
        _ => None,
    };

    let ctx = Arc::new(TargetContext {
        store: store.clone(),
        writer,
        namespace: args.namespace.clone(),
        cfg: TargetServerConfig {
            update_retries: args.update_retries,
            ..TargetServerConfig::default()
        },
    });
    let admin_ctx = Arc::new(AdminContext {
        store: file_store,
        namespace: args.namespace.clone(),
    });

    // Either socket failing stops the other one too.
    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };
    let signal = async {
        tokio::select! {
            res = shutdown => {
                if let Err(err) = res {
                    tracing::warn!(error = ?err, "shutdown signal failed; stopping");
                }
                tracing::info!("shutdown requested");
            }
            _ = stopped(stop_rx.clone()) => {}
        }
        let _ = stop_tx.send(true);
    };
    let target = async {
        let served =
            target_server::run(args.socket_path.clone(), ctx, stopped(stop_rx.clone())).await;
        if let Err(err) = &served {
            tracing::error!(error = ?err, "target server stopped with error");
        }
        let _ = stop_tx.send(true);
        served
    };
    let admin = async {
        let served =
            admin::run(args.admin_socket.clone(), admin_ctx, stopped(stop_rx.clone())).await;
        if let Err(err) = &served {
            tracing::error!(error = ?err, "admin server stopped with error");
        }
        let _ = stop_tx.send(true);
        served
    };
    let ((), served, admin_served) = tokio::join!(signal, target, admin);

    let _ = resync_stop.send(true);
    if let Some(task) = resync {
        if let Err(err) = task.await {
            tracing::warn!(error = ?err, "config resync task failed");
        }
    }
    if let Some(restore) = restore {
        restore.shutdown().await;
    }
    budgets.shutdown().await;
    tracing::info!("node stopped");
    served.and(admin_served)
}
