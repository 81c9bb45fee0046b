//! Serves one install-time configuration file over HTTP for the duration of
//! a session.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use axum::Router;
use px_common::{Error, Result};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{error, info};

/// The fixed name clients fetch the file under.
pub const PRESEED_FILE_NAME: &str = "preseed.cfg";

/// How long shutdown waits for the server task to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Copies a preseed configuration file into a private directory and serves
/// it from a background task until `shutdown` is called.
pub struct PreseedServer {
    url: String,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    _workdir: TempDir,
}

impl PreseedServer {
    /// Starts serving `file` as `http://<address>:<port>/preseed.cfg`.
    /// Binding to port 0 picks a free port; `url()` reports the real one.
    pub async fn serve(file: &Path, address: Ipv4Addr, port: u16) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("pxeup-preseed-")
            .tempdir()?;
        tokio::fs::copy(file, workdir.path().join(PRESEED_FILE_NAME)).await?;
        info!(
            "preseed configuration copied to {}",
            workdir.path().display()
        );

        let listener = TcpListener::bind(SocketAddr::from((address, port))).await?;
        let bound = listener.local_addr()?;
        let url = format!("http://{}:{}/{PRESEED_FILE_NAME}", bound.ip(), bound.port());

        let app = Router::new().fallback_service(ServeDir::new(workdir.path()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("preseed server error: {e}");
            }
        });

        info!("serving preseed config at {url}");
        Ok(Self {
            url,
            shutdown_tx,
            task,
            _workdir: workdir,
        })
    }

    /// The preseed file URL for the installer.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Asks the server task to finish and joins it, bounded.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        let abort = self.task.abort_handle();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(Error::Other(anyhow!(
                "preseed server task failed: {join_err}"
            ))),
            Err(_) => {
                abort.abort();
                Err(Error::Other(anyhow!(
                    "preseed server did not shut down within {SHUTDOWN_TIMEOUT:?}"
                )))
            }
        }
    }
}
