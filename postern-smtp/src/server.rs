use std::sync::Arc;

use futures_util::future::join_all;
use postern_common::{Signal, internal};
use postern_spool::MailStore;
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    SmtpConfig, UsersRepository,
    session::{Session, SessionContext},
};

/// Accepts SMTP clients and runs a [`Session`] task for each.
#[derive(Debug, Clone)]
pub struct SmtpServer {
    context: SessionContext,
}

impl SmtpServer {
    pub fn new(
        config: SmtpConfig,
        store: Arc<dyn MailStore>,
        users: Arc<dyn UsersRepository>,
    ) -> Self {
        Self {
            context: SessionContext {
                config: Arc::new(config),
                store,
                users,
            },
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.context.config
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self, shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.context.config.listen).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve clients from an already bound listener. On shutdown, stops
    /// accepting and waits for every session to finish.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        internal!(level = INFO, "SMTP listening on {local}");

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "SMTP listener {local} received shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept connection on {local}: {err}");
                            continue;
                        }
                    };

                    internal!(level = DEBUG, "Connection received on {local} from {peer}");
                    let session = Session::new(stream, peer, self.context.clone());
                    let signal = shutdown.resubscribe();

                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                    sessions.push(tokio::spawn(async move {
                        // Outcome is logged by the session itself
                        let _ = session.run(signal).await;
                    }));
                }
            }
        }

        internal!(level = INFO, "SMTP listener {local} stopped");
        Ok(())
    }
}
