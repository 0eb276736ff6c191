use std::{net::SocketAddr, sync::Arc};

use postern_common::{Signal, internal, outgoing, status::Status};
use postern_spool::MailStore;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};

use crate::{
    UsersRepository,
    config::SmtpConfig,
    connection::{Connection, Line, MAX_COMMAND_LINE},
    error::{SessionError, SessionResult},
    reply::Reply,
    state::SessionState,
};

mod data;
mod handlers;

/// Everything a session needs besides its socket. Shared by all sessions
/// of one server.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub config: Arc<SmtpConfig>,
    pub store: Arc<dyn MailStore>,
    pub users: Arc<dyn UsersRepository>,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    pub(crate) state: SessionState,
    context: SessionContext,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(stream: Stream, peer: SocketAddr, context: SessionContext) -> Self {
        Self {
            peer,
            connection: Connection::new(stream),
            state: SessionState::default(),
            context,
        }
    }

    fn greeting(&self) -> Reply {
        let config = &self.context.config;
        Reply::new(
            Status::ServiceReady,
            format!(
                "{} SMTP Server ({}) ready {}",
                config.hostname,
                config.software,
                chrono::Utc::now().to_rfc2822()
            ),
        )
    }

    /// Serve the client until it quits, disconnects, idles out, or the
    /// server shuts down.
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> SessionResult<()> {
        internal!("Connected {}", self.peer);

        let result = match self.send(&self.greeting()).await {
            Ok(()) => self.command_loop(&mut signal).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => internal!("Connection with {} closed", self.peer),
            Err(err) if err.is_disconnect() => {
                internal!(level = DEBUG, "Connection with {} ended: {err}", self.peer);
            }
            Err(err) => internal!(level = WARN, "Connection with {} failed: {err}", self.peer),
        }

        result
    }

    async fn command_loop(&mut self, signal: &mut broadcast::Receiver<Signal>) -> SessionResult<()> {
        let mut line = Vec::with_capacity(MAX_COMMAND_LINE);

        loop {
            let read = tokio::select! {
                _ = signal.recv() => {
                    let reply = Reply::new(
                        Status::Unavailable,
                        format!("{} Service shutting down", self.context.config.hostname),
                    );
                    // Best effort, the client may already be gone
                    let _ = self.send(&reply).await;
                    return Err(SessionError::Shutdown);
                }
                read = self.read_line(&mut line, MAX_COMMAND_LINE) => read?,
            };

            match read {
                Line::Eof => return Ok(()),
                Line::TooLong => {
                    self.send(&Reply::new(Status::Unrecognised, "Line too long"))
                        .await?;
                }
                Line::Complete(_) => {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if self.dispatch(&text).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Read a line, closing the session if the client stays idle too long.
    async fn read_line(&mut self, buf: &mut Vec<u8>, limit: usize) -> SessionResult<Line> {
        let idle = self.context.config.idle_timeout();

        if let Ok(read) = tokio::time::timeout(idle, self.connection.read_line(buf, limit)).await {
            Ok(read?)
        } else {
            internal!(
                level = WARN,
                "Connection from {} timed out after {}s",
                self.peer,
                idle.as_secs()
            );
            let reply = Reply::new(
                Status::Unavailable,
                format!("{} Connection timed out", self.context.config.hostname),
            );
            let _ = self.send(&reply).await;
            Err(SessionError::Timeout(idle.as_secs()))
        }
    }

    async fn read_chunk(&mut self, buf: &mut Vec<u8>, limit: usize) -> SessionResult<usize> {
        let idle = self.context.config.idle_timeout();

        match tokio::time::timeout(idle, self.connection.read_chunk(buf, limit)).await {
            Ok(Ok(0)) => Err(SessionError::Disconnected),
            Ok(read) => Ok(read?),
            Err(_) => Err(SessionError::Timeout(idle.as_secs())),
        }
    }

    async fn send(&mut self, reply: &Reply) -> SessionResult<()> {
        outgoing!("{reply}");
        self.connection.send(reply).await.map_err(|err| {
            internal!(level = ERROR, "Failed to send response: {err}");
            SessionError::from(err)
        })
    }
}
