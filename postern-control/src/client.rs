//! Client side of the control socket

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::net::UnixStream;

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, ResponsePayload, Result,
    protocol::{read_frame, write_frame},
};

#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request on a fresh connection.
    ///
    /// # Errors
    /// If the server cannot be reached, does not answer in time, speaks
    /// another protocol version, or refuses the request.
    pub async fn send_request(&self, request: &Request) -> Result<ResponsePayload> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn exchange(&self, request: &Request) -> Result<ResponsePayload> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        write_frame(&mut stream, request).await?;
        let response: Response = read_frame(&mut stream).await?;

        if response.version != PROTOCOL_VERSION {
            return Err(ControlError::Version {
                server: response.version,
                client: PROTOCOL_VERSION,
            });
        }

        match response.payload {
            ResponsePayload::Error(message) => Err(ControlError::Server(message)),
            payload => Ok(payload),
        }
    }
}
