use std::fmt::Display;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

/// Longest command line accepted, including CRLF (RFC 5321 section 4.5.3.1.4)
pub const MAX_COMMAND_LINE: usize = 1000;

#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A line, terminator included. May lack a terminator at EOF.
    Complete(usize),
    /// The line was longer than the limit. It has been read and dropped.
    TooLong,
    Eof,
}

/// Buffered line-oriented transport for one client.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    stream: BufStream<Stream>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Read up to and including the next `\n`, at most `limit` bytes.
    pub async fn read_line(&mut self, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Line> {
        buf.clear();

        let read = read_bounded(&mut self.stream, buf, limit).await?;
        if read == 0 {
            return Ok(Line::Eof);
        }

        if buf.ends_with(b"\n") || read < limit {
            return Ok(Line::Complete(read));
        }

        // Drain the rest of the oversized line
        let mut discard = Vec::new();
        loop {
            discard.clear();
            let read = read_bounded(&mut self.stream, &mut discard, limit).await?;
            if read == 0 || discard.ends_with(b"\n") {
                buf.clear();
                return Ok(Line::TooLong);
            }
        }
    }

    /// Read a chunk of message data: a line, or `limit` bytes of a longer one.
    pub async fn read_chunk(&mut self, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize> {
        buf.clear();
        read_bounded(&mut self.stream, buf, limit).await
    }

    pub async fn send<S: Display + Send + Sync>(&mut self, response: &S) -> std::io::Result<()> {
        self.stream
            .write_all(format!("{response}\r\n").as_bytes())
            .await?;
        self.stream.flush().await
    }
}

async fn read_bounded<R: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut BufStream<R>,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<usize> {
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);
    stream.take(limit).read_until(b'\n', buf).await
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn reads_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server);
        let mut client = client;

        client.write_all(b"EHLO foo\r\nQUIT\r\n").await.unwrap();
        drop(client);

        let mut buf = Vec::new();
        assert_eq!(
            connection.read_line(&mut buf, MAX_COMMAND_LINE).await.unwrap(),
            Line::Complete(10)
        );
        assert_eq!(buf, b"EHLO foo\r\n");

        connection.read_line(&mut buf, MAX_COMMAND_LINE).await.unwrap();
        assert_eq!(buf, b"QUIT\r\n");

        assert_eq!(
            connection.read_line(&mut buf, MAX_COMMAND_LINE).await.unwrap(),
            Line::Eof
        );
    }

    #[tokio::test]
    async fn oversized_line_is_dropped() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server);

        client.write_all(&[b'A'; 40]).await.unwrap();
        client.write_all(b"\r\nNOOP\r\n").await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(
            connection.read_line(&mut buf, 16).await.unwrap(),
            Line::TooLong
        );
        connection.read_line(&mut buf, 16).await.unwrap();
        assert_eq!(buf, b"NOOP\r\n");
    }
}
