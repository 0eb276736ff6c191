//! Control protocol types and framing

use core::fmt::{self, Display, Formatter};

use postern_common::mail::MailId;
use postern_spool::admin::{SpoolFilter, SpoolItem, SpoolReport};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ControlError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted in either direction
const MAX_FRAME: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreName {
    Spool,
    Outgoing,
    Inbox,
}

impl StoreName {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spool => "spool",
            Self::Outgoing => "outgoing",
            Self::Inbox => "inbox",
        }
    }
}

impl Display for StoreName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which mails a command applies to. Everything, unless narrowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub id: Option<MailId>,
    pub state: Option<String>,
    /// Header name, and a regular expression one of its values must match
    pub header: Option<(String, String)>,
}

impl Selection {
    /// # Errors
    /// If the header pattern is not a valid regular expression.
    pub fn filter(&self) -> Result<SpoolFilter> {
        let mut filter = SpoolFilter::default();

        if let Some(state) = &self.state {
            filter = filter.with_state(state.clone());
        }

        if let Some((name, pattern)) = &self.header {
            filter = filter
                .with_header(name.clone(), pattern)
                .map_err(|err| ControlError::Server(format!("Invalid pattern {pattern}: {err}")))?;
        }

        Ok(filter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoolCommand {
    List(Selection),
    Remove(Selection),
    /// Make mails eligible for another attempt right away
    Resend(Selection),
    Move {
        to: StoreName,
        selection: Selection,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub store: StoreName,
    pub command: SpoolCommand,
}

impl Request {
    pub const fn new(store: StoreName, command: SpoolCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            store,
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Items(Vec<SpoolItem>),
    Report(SpoolReport),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: ResponsePayload,
}

impl Response {
    pub const fn new(payload: ResponsePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponsePayload::Error(message.into()))
    }
}

/// Write `value` as a big-endian length followed by its bincode encoding.
pub(crate) async fn write_frame<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    if len > MAX_FRAME {
        return Err(ControlError::FrameTooLarge(len));
    }

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

pub(crate) async fn read_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(err)
        }
    })?;

    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        return Err(ControlError::FrameTooLarge(len));
    }

    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use postern_common::{
        address::MailAddress,
        mail::{DEFAULT, ERROR, Mail},
        message::MessageSource,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn frames_survive_the_wire() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = Request::new(
            StoreName::Outgoing,
            SpoolCommand::Move {
                to: StoreName::Spool,
                selection: Selection {
                    id: Some(MailId::generate()),
                    state: Some(String::from(ERROR)),
                    header: Some((String::from("Subject"), String::from("^Invoice"))),
                },
            },
        );

        write_frame(&mut client, &request).await.unwrap();
        let received: Request = read_frame(&mut server).await.unwrap();

        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let err = read_frame::<_, Request>(&mut server).await.unwrap_err();
        assert!(matches!(err, ControlError::FrameTooLarge(u32::MAX)));
    }

    #[tokio::test]
    async fn closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame::<_, Request>(&mut server).await.unwrap_err();
        assert!(matches!(err, ControlError::ConnectionClosed));
    }

    #[test]
    fn selection_filters() {
        let mut mail = Mail::new(
            Some(MailAddress::new("a", "x")),
            vec![MailAddress::new("b", "y")],
            MessageSource::parse(b"Subject: Invoice 42\r\n\r\nbody").unwrap(),
        );

        let selection = Selection {
            header: Some((String::from("subject"), String::from("^Invoice"))),
            ..Selection::default()
        };
        assert!(selection.filter().unwrap().matches(&mail));

        mail.set_state(ERROR);
        let only_root = Selection {
            state: Some(String::from(DEFAULT)),
            ..selection
        };
        assert!(!only_root.filter().unwrap().matches(&mail));

        let invalid = Selection {
            header: Some((String::from("Subject"), String::from("("))),
            ..Selection::default()
        };
        assert!(matches!(invalid.filter(), Err(ControlError::Server(_))));
    }
}
