//! Accept loop shared by the node's Unix sockets.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

/// Serve `socket_path` with one `handler` task per connection until
/// `shutdown` resolves.
///
/// A stale socket file is removed before binding; failing to remove it is
/// fatal. Connections still in flight when shutdown fires are allowed to
/// finish, then the socket file is removed.
pub async fn serve<F, H, Fut>(
    socket_path: PathBuf,
    name: &'static str,
    shutdown: F,
    handler: H,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
    H: Fn(UnixStream) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    remove_stale_socket(&socket_path, name)?;
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind {name} socket {}", socket_path.display()))?;
    tracing::info!(socket = name, path = %socket_path.display(), "listening");

    tokio::pin!(shutdown);
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => {
                    let conn = handler(socket);
                    conns.spawn(async move {
                        if let Err(err) = conn.await {
                            tracing::debug!(socket = name, error = ?err, "connection closed");
                        }
                    });
                }
                Err(err) if is_transient_accept_error(&err) => {
                    tracing::warn!(socket = name, error = ?err, "transient accept error");
                }
                Err(err) => return Err(err).with_context(|| format!("accept on {name} socket")),
            },
        }
    }

    drop(listener);
    while conns.join_next().await.is_some() {}
    if let Err(err) = std::fs::remove_file(&socket_path) {
        tracing::debug!(socket = name, error = ?err, "socket cleanup failed");
    }
    tracing::info!(socket = name, "stopped");
    Ok(())
}

fn remove_stale_socket(path: &Path, name: &str) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(socket = name, path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("remove stale {name} socket {}", path.display()))
        }
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unremovable_stale_socket_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A non-empty directory at the socket path cannot be unlinked.
        let path = dir.path().join("busy.sock");
        std::fs::create_dir(&path).expect("dir");
        std::fs::write(path.join("keep"), b"x").expect("file");

        let handler = |_socket| async { Ok::<(), anyhow::Error>(()) };
        let err = serve(path, "test", std::future::pending::<()>(), handler)
            .await
            .expect_err("bind must not be attempted");
        assert!(format!("{err:#}").contains("remove stale test socket"));
    }
}
