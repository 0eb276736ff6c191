//! Control server

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use postern_common::{Signal, internal};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, Result,
    protocol::{read_frame, write_frame},
};

/// Time a client gets to send its request, and to read the response
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns requests into responses against the running server.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

pub struct ControlServer {
    socket_path: PathBuf,
    handler: Arc<dyn CommandHandler>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl ControlServer {
    pub fn new(socket_path: impl Into<PathBuf>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing one left behind by a process that died.
    ///
    /// # Errors
    /// If another instance is listening on the socket, or it cannot be bound.
    pub async fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Socket already in use by running instance: {}",
                        self.socket_path.display()
                    ),
                )));
            }

            internal!(
                level = INFO,
                "Removing stale control socket {}",
                self.socket_path.display()
            );
            tokio::fs::remove_file(&self.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            let mut permissions = tokio::fs::metadata(&self.socket_path).await?.permissions();
            permissions.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, permissions).await?;
        }

        Ok(listener)
    }

    /// Bind the socket and serve requests until shutdown.
    pub async fn run(&self, shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve requests on `listener` until shutdown, then remove the socket.
    pub async fn serve(
        &self,
        listener: UnixListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<()> {
        internal!(
            level = INFO,
            "Control socket listening on {}",
            self.socket_path.display()
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(async move {
                            if let Err(err) = Self::handle_connection(stream, handler.as_ref()).await {
                                internal!(level = WARN, "Control connection failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        internal!(level = ERROR, "Failed to accept control connection: {err}");
                    }
                },
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Control socket shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(err) = tokio::fs::remove_file(&self.socket_path).await {
            internal!(
                level = WARN,
                "Failed to remove control socket {}: {err}",
                self.socket_path.display()
            );
        }

        Ok(())
    }

    async fn handle_connection(mut stream: UnixStream, handler: &dyn CommandHandler) -> Result<()> {
        let request: Request = tokio::time::timeout(IO_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| ControlError::Timeout)??;

        internal!("Control request: {request:?}");

        let response = if request.version == PROTOCOL_VERSION {
            handler.handle_request(request).await.unwrap_or_else(|err| {
                internal!(level = WARN, "Control request failed: {err}");
                Response::error(err.to_string())
            })
        } else {
            Response::error(
                ControlError::Version {
                    server: PROTOCOL_VERSION,
                    client: request.version,
                }
                .to_string(),
            )
        };

        tokio::time::timeout(IO_TIMEOUT, write_frame(&mut stream, &response))
            .await
            .map_err(|_| ControlError::Timeout)?
    }
}
