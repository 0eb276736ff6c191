//! Outbound SMTP client.

mod error;
mod response;

use postern_common::{address::MailAddress, incoming, outgoing};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

pub use error::{ClientError, Result};
pub use response::Response;

const BUFFER_SIZE: usize = 4096;

/// Longest reply accepted before the server is considered broken
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Dot-stuff `message` and append the end-of-data marker.
pub fn encode_data(message: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(message.len() + 8);
    let mut line_start = true;

    for &byte in message {
        if line_start && byte == b'.' {
            encoded.push(b'.');
        }
        encoded.push(byte);
        line_start = byte == b'\n';
    }

    if !encoded.is_empty() && !encoded.ends_with(b"\r\n") {
        if encoded.ends_with(b"\n") {
            encoded.pop();
        }
        encoded.extend_from_slice(b"\r\n");
    }
    encoded.extend_from_slice(b".\r\n");

    encoded
}

#[derive(Debug)]
pub struct SmtpClient<Stream> {
    stream: Stream,
    buffer: Vec<u8>,
    filled: usize,
}

impl SmtpClient<TcpStream> {
    pub async fn connect(address: &str) -> Result<Self> {
        Ok(Self::new(TcpStream::connect(address).await?))
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin> SmtpClient<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buffer: vec![0; BUFFER_SIZE],
            filled: 0,
        }
    }

    pub async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, used)) = Response::parse(&self.buffer[..self.filled])? {
                self.buffer.copy_within(used..self.filled, 0);
                self.filled -= used;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.filled == self.buffer.len() {
                let grown = self.buffer.len() * 2;
                if grown > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "Reply longer than {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(grown, 0);
            }

            let read = self.stream.read(&mut self.buffer[self.filled..]).await?;
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.filled += read;
        }
    }

    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");

        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        self.read_response().await
    }

    pub async fn ehlo(&mut self, name: &str) -> Result<Response> {
        self.command(&format!("EHLO {name}")).await
    }

    pub async fn helo(&mut self, name: &str) -> Result<Response> {
        self.command(&format!("HELO {name}")).await
    }

    /// `reverse_path` includes the angle brackets, so the null sender is `<>`.
    pub async fn mail_from(&mut self, reverse_path: &str, size: Option<usize>) -> Result<Response> {
        let command = match size {
            Some(size) => format!("MAIL FROM:{reverse_path} SIZE={size}"),
            None => format!("MAIL FROM:{reverse_path}"),
        };
        self.command(&command).await
    }

    pub async fn rcpt_to(&mut self, recipient: &MailAddress) -> Result<Response> {
        self.command(&format!("RCPT TO:<{recipient}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Send the message after a `354`, and read the final reply.
    pub async fn send_message(&mut self, message: &[u8]) -> Result<Response> {
        outgoing!("<{} bytes of message data>", message.len());

        self.stream.write_all(&encode_data(message)).await?;
        self.stream.flush().await?;

        self.read_response().await
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    #[test]
    fn dot_stuffing() {
        assert_eq!(
            encode_data(b"Subject: x\r\n\r\nHi\r\n.Hidden\r\n..two"),
            b"Subject: x\r\n\r\nHi\r\n..Hidden\r\n...two\r\n.\r\n"
        );
        assert_eq!(encode_data(b".\r\n"), b"..\r\n.\r\n");
        assert_eq!(encode_data(b"bare\n"), b"bare\r\n.\r\n");
        assert_eq!(encode_data(b""), b".\r\n");
    }

    #[tokio::test]
    async fn conversation() {
        let (client, server) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            let mut in_data = false;

            write.write_all(b"220 mx.example ready\r\n").await.unwrap();
            while let Some(line) = lines.next_line().await.unwrap() {
                seen.push(line.clone());

                if in_data {
                    if line == "." {
                        in_data = false;
                        write.write_all(b"250 queued\r\n").await.unwrap();
                    }
                    continue;
                }

                let reply: &[u8] = match line.as_str() {
                    "EHLO me" => b"250-mx.example\r\n250 SIZE 100\r\n",
                    "DATA" => {
                        in_data = true;
                        b"354 go ahead\r\n"
                    }
                    "QUIT" => b"221 bye\r\n",
                    _ => b"250 OK\r\n",
                };
                write.write_all(reply).await.unwrap();
                if line == "QUIT" {
                    break;
                }
            }
            seen
        });

        let mut client = SmtpClient::new(client);
        assert_eq!(client.read_response().await.unwrap().code, 220);

        let ehlo = client.ehlo("me").await.unwrap();
        assert!(ehlo.has_extension("SIZE"));

        client.mail_from("<a@x>", Some(12)).await.unwrap();
        client
            .rcpt_to(&MailAddress::new("b", "y"))
            .await
            .unwrap();
        assert_eq!(client.data().await.unwrap().code, 354);
        assert_eq!(
            client.send_message(b"\r\n.dot\r\n").await.unwrap().code,
            250
        );
        assert_eq!(client.quit().await.unwrap().code, 221);

        assert_eq!(
            server.await.unwrap(),
            vec![
                "EHLO me",
                "MAIL FROM:<a@x> SIZE=12",
                "RCPT TO:<b@y>",
                "DATA",
                "",
                "..dot",
                ".",
                "QUIT"
            ]
        );
    }

    #[tokio::test]
    async fn closed_connection() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let mut client = SmtpClient::new(client);
        assert!(matches!(
            client.read_response().await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
