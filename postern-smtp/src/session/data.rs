use postern_common::{
    internal,
    mail::Mail,
    message::MessageSource,
    status::Status,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::{error::ProtocolError, error::SessionResult, reply::Reply};

/// Largest piece of message data read at once
const CHUNK: usize = 8192;

enum Body {
    Complete(Vec<u8>),
    /// Bytes received before the terminator, all of them discarded
    TooLarge(usize),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn handle_data(&mut self) -> SessionResult<Result<Reply, ProtocolError>> {
        if !self.state.has_sender() {
            return Ok(Err(ProtocolError::sequence("No sender specified")));
        }

        if self.state.recipients.is_empty() {
            return Ok(Err(ProtocolError::sequence("No recipients specified")));
        }

        self.send(&Reply::new(
            Status::StartMailInput,
            "Ok Send data ending with <CRLF>.<CRLF>",
        ))
        .await?;

        let reply = match self.read_message(self.context.config.max_message_bytes()).await? {
            Body::TooLarge(received) => {
                internal!(
                    level = WARN,
                    "Message from {} exceeded the size limit ({received} bytes)",
                    self.peer
                );
                self.state.message_failed = true;
                Err(ProtocolError::new(
                    Status::ExceededStorage,
                    "Error processing message: Exceeded maximum message size",
                ))
            }
            Body::Complete(raw) => self.submit(&raw).await,
        };

        self.state.reset_transaction();
        Ok(reply)
    }

    /// Read message data up to the lone `.` line, undoing dot-stuffing.
    ///
    /// Past `limit` the data is still consumed, so the client stays in sync,
    /// but nothing more is kept.
    async fn read_message(&mut self, limit: Option<usize>) -> SessionResult<Body> {
        let mut message = Vec::new();
        let mut chunk = Vec::with_capacity(CHUNK);
        let mut line_start = true;
        let mut received = 0usize;
        let mut overflow = false;

        loop {
            self.read_chunk(&mut chunk, CHUNK).await?;

            let mut data = chunk.as_slice();
            if line_start {
                if data == b".\r\n" || data == b".\n" {
                    break;
                }
                if data.first() == Some(&b'.') {
                    data = &data[1..];
                }
            }
            line_start = data.ends_with(b"\n");

            received += data.len();
            if let Some(max) = limit
                && received > max
                && !overflow
            {
                overflow = true;
                message = Vec::new();
            }

            if !overflow {
                message.extend_from_slice(data);
            }
        }

        Ok(if overflow {
            Body::TooLarge(received)
        } else {
            Body::Complete(message)
        })
    }

    /// Turn the received data into a mail in the spool.
    async fn submit(&mut self, raw: &[u8]) -> Result<Reply, ProtocolError> {
        let config = &self.context.config;

        let mut message = MessageSource::parse(raw).map_err(|err| {
            internal!(level = WARN, "Rejecting message from {}: {err}", self.peer);
            ProtocolError::new(
                Status::ActionUnavailable,
                format!("Error processing message: {err}"),
            )
        })?;

        let now = chrono::Utc::now().to_rfc2822();
        let sender = self.state.sender.clone().flatten();

        if !message.has_header("Date") {
            message.add_header("Date", now.clone());
        }
        if !message.has_header("From") {
            message.add_header(
                "From",
                sender.as_ref().map_or_else(
                    || format!("MAILER-DAEMON@{}", config.hostname),
                    ToString::to_string,
                ),
            );
        }

        let recipients = std::mem::take(&mut self.state.recipients);
        let mut mail = Mail::new(sender, recipients, message);

        let ip = self.peer.ip().to_string();
        mail.remote_host.clone_from(&ip);
        mail.remote_addr.clone_from(&ip);

        let protocol = match (
            self.state.is_extended(),
            self.state.authenticated_user.is_some(),
        ) {
            (true, true) => "ESMTPA",
            (true, false) => "ESMTP",
            (false, _) => "SMTP",
        };
        let for_clause = match mail.recipients.as_slice() {
            [only] => format!(" for <{only}>"),
            _ => String::new(),
        };
        let received = format!(
            "from {} ({ip} [{ip}]) by {} ({}) with {protocol} id {}{for_clause}; {now}",
            self.state.hello_name.as_deref().unwrap_or("unknown"),
            config.hostname,
            config.software,
            mail.id,
        );
        mail.message.prepend_header("Received", received);
        mail.message.prepend_header("Return-Path", mail.reverse_path());

        self.context.store.store(&mail).await.map_err(|err| {
            internal!(level = ERROR, "Failed to spool message {}: {err}", mail.id);
            ProtocolError::new(
                Status::ActionUnavailable,
                format!("Error processing message: {err}"),
            )
        })?;

        internal!(
            level = INFO,
            "Spooled message {} from {} for {} recipient(s)",
            mail.id,
            mail.reverse_path(),
            mail.recipients.len()
        );

        Ok(Reply::ok("Message received"))
    }
}
