//! Shared helpers for integration tests.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use volmgr::config_file::ConfigFileWriter;
use volmgr::target_server::{self, TargetContext, TargetServerConfig};
use volmgr::FileClusterStore;
use volmgr_core::wire::TargetClientCodec;
use volmgr_core::{
    ClusterStore, LabelSelector, ObjectKey, PoolDisruptionBudget, PoolInstance, ReplicaUpdate,
    Reply, RestoreExecutor, RestoreIntent, RestorePhase, StoreError, StoreEvent, VolumeReplica,
    VolumeReplicationRecord,
};

/// Timeout for socket readiness and controller progress.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub const NAMESPACE: &str = "default";
pub const VOLUME: &str = "v1";

/// Config file contents before any replica reported.
pub const SEED_CONFIG: &str = "[LogicalUnit1]\n  TargetName v1\n  LUN0 Storage /dev/zvol/pool/v1\n";

pub fn volume_key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, VOLUME)
}

pub fn update(replica: &str, rf: u32, cf: u32) -> ReplicaUpdate {
    ReplicaUpdate {
        volume_name: VOLUME.to_string(),
        replica_id: replica.to_string(),
        replica_guid: format!("guid-{replica}"),
        replication_factor: rf,
        consistency_factor: cf,
    }
}

/// Target server running in-process over a temp directory.
pub struct TargetFixture {
    pub dir: TempDir,
    pub store: Arc<FileClusterStore>,
    pub socket_path: PathBuf,
    pub config_path: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TargetFixture {
    /// Provision `v1` with `desired` replicas and start serving.
    pub async fn start(desired: u32) -> Self {
        Self::start_over(desired, |store| -> Arc<dyn ClusterStore> { store }).await
    }

    /// Like `start`, but the server talks to whatever `wrap` builds around the
    /// backing store.
    pub async fn start_over<W>(desired: u32, wrap: W) -> Self
    where
        W: FnOnce(Arc<FileClusterStore>) -> Arc<dyn ClusterStore>,
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("target.sock");
        let config_path = dir.path().join("istgt.conf");
        std::fs::write(&config_path, SEED_CONFIG).expect("seed config");

        let store = Arc::new(FileClusterStore::in_memory());
        store
            .put_volume(VolumeReplicationRecord::provisioned(&volume_key(), desired))
            .expect("provision volume");

        let ctx = Arc::new(TargetContext {
            store: wrap(store.clone()),
            writer: ConfigFileWriter::new(&config_path),
            namespace: NAMESPACE.to_string(),
            cfg: TargetServerConfig::default(),
        });
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(target_server::run(socket_path.clone(), ctx, async move {
            let _ = stop_rx.await;
        }));
        wait_for_socket(&socket_path).await;

        Self {
            dir,
            store,
            socket_path,
            config_path,
            stop: Some(stop_tx),
            task,
        }
    }

    pub fn config_text(&self) -> String {
        std::fs::read_to_string(&self.config_path).expect("read config file")
    }

    pub async fn record(&self) -> VolumeReplicationRecord {
        self.store.get_volume(&volume_key()).await.expect("volume record")
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.expect("target server task")
    }
}

/// Wait until something accepts connections on `path`.
pub async fn wait_for_socket(path: &Path) {
    let ready = wait_until(IO_TIMEOUT, || async { UnixStream::connect(path).await.is_ok() }).await;
    assert!(ready, "socket {} never became ready", path.display());
}

/// One request through the client codec.
pub async fn send_update(socket_path: &Path, update: &ReplicaUpdate) -> Reply {
    let socket = UnixStream::connect(socket_path).await.expect("connect");
    let mut framed = Framed::new(socket, TargetClientCodec);
    framed.send(update).await.expect("send update");
    framed
        .next()
        .await
        .expect("reply before close")
        .expect("decodable reply")
}

/// Write raw bytes, close the write half and return everything the server sent.
pub async fn send_raw(socket_path: &Path, bytes: &[u8]) -> String {
    let mut socket = UnixStream::connect(socket_path).await.expect("connect");
    socket.write_all(bytes).await.expect("write");
    socket.shutdown().await.expect("half close");
    let mut out = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, socket.read_to_end(&mut out))
        .await
        .expect("server replied in time")
        .expect("read reply");
    String::from_utf8(out).expect("utf8 reply")
}

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Executor that records calls and returns a canned outcome after `delay`.
pub struct MockExecutor {
    calls: AtomicUsize,
    delay: Duration,
    failure: Option<String>,
}

impl MockExecutor {
    pub fn succeeding() -> Arc<Self> {
        Self::succeeding_after(Duration::from_millis(20))
    }

    pub fn succeeding_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failure: None,
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            failure: Some(message.to_string()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestoreExecutor for MockExecutor {
    async fn execute(&self, _intent: &RestoreIntent) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.failure {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }
}

/// Store wrapper that injects write failures in front of a `FileClusterStore`.
pub struct FaultyStore {
    pub inner: Arc<FileClusterStore>,
    volume_conflicts: AtomicUsize,
    /// Factors written to the backing record each time a conflict is injected,
    /// standing in for a concurrent writer.
    concurrent_factors: Mutex<Option<(u32, u32)>>,
    status_failures: Mutex<Option<(RestorePhase, usize)>>,
    volume_reads: AtomicUsize,
    volume_writes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<FileClusterStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            volume_conflicts: AtomicUsize::new(0),
            concurrent_factors: Mutex::new(None),
            status_failures: Mutex::new(None),
            volume_reads: AtomicUsize::new(0),
            volume_writes: AtomicUsize::new(0),
        })
    }

    /// Answer the next `count` volume writes with `Conflict`.
    pub fn conflict_volume_writes(&self, count: usize) {
        self.volume_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn raise_factors_on_conflict(&self, replication_factor: u32, consistency_factor: u32) {
        *self.concurrent_factors.lock().unwrap() = Some((replication_factor, consistency_factor));
    }

    /// Fail the next `count` restore status writes that move to `phase`.
    pub fn fail_status_writes(&self, phase: RestorePhase, count: usize) {
        *self.status_failures.lock().unwrap() = Some((phase, count));
    }

    pub fn volume_reads(&self) -> usize {
        self.volume_reads.load(Ordering::SeqCst)
    }

    pub fn volume_writes(&self) -> usize {
        self.volume_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterStore for FaultyStore {
    async fn get_volume(&self, key: &ObjectKey) -> Result<VolumeReplicationRecord, StoreError> {
        self.volume_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_volume(key).await
    }

    async fn update_volume(
        &self,
        record: VolumeReplicationRecord,
    ) -> Result<VolumeReplicationRecord, StoreError> {
        self.volume_writes.fetch_add(1, Ordering::SeqCst);
        let inject = self
            .volume_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !inject {
            return self.inner.update_volume(record).await;
        }
        let key = record.key();
        let concurrent = *self.concurrent_factors.lock().unwrap();
        if let Some((rf, cf)) = concurrent {
            let current = self.inner.get_volume(&key).await?;
            self.inner
                .put_volume(current.with_factors(rf, cf))
                .map_err(|err| StoreError::Transport(err.to_string()))?;
        }
        Err(StoreError::Conflict {
            kind: "volume",
            key,
            expected: record.meta.resource_version,
            actual: record.meta.resource_version + 1,
        })
    }

    async fn list_volumes(
        &self,
        namespace: &str,
    ) -> Result<Vec<VolumeReplicationRecord>, StoreError> {
        self.inner.list_volumes(namespace).await
    }

    async fn get_restore(&self, key: &ObjectKey) -> Result<RestoreIntent, StoreError> {
        self.inner.get_restore(key).await
    }

    async fn list_restores(&self, namespace: &str) -> Result<Vec<RestoreIntent>, StoreError> {
        self.inner.list_restores(namespace).await
    }

    async fn update_restore_status(
        &self,
        intent: RestoreIntent,
    ) -> Result<RestoreIntent, StoreError> {
        {
            let mut failures = self.status_failures.lock().unwrap();
            if let Some((phase, remaining)) = failures.as_mut() {
                if *phase == intent.status.phase && *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Transport("timeout".into()));
                }
            }
        }
        self.inner.update_restore_status(intent).await
    }

    async fn list_volume_replicas(
        &self,
        namespace: &str,
        volume: &str,
    ) -> Result<Vec<VolumeReplica>, StoreError> {
        self.inner.list_volume_replicas(namespace, volume).await
    }

    async fn list_pool_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PoolInstance>, StoreError> {
        self.inner.list_pool_instances(namespace, selector).await
    }

    async fn list_disruption_budgets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PoolDisruptionBudget>, StoreError> {
        self.inner.list_disruption_budgets(namespace, selector).await
    }

    async fn create_disruption_budget(
        &self,
        budget: PoolDisruptionBudget,
    ) -> Result<PoolDisruptionBudget, StoreError> {
        self.inner.create_disruption_budget(budget).await
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.watch()
    }
}
