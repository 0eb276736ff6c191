use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use ahash::AHashMap;
use async_trait::async_trait;
use postern_common::{
    address::MailAddress,
    internal,
    mail::{Mail, MailId},
    message::MessageSource,
};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{LockTable, MailStore, Result, SpoolError, SpoolSignal};

const META: &str = "meta";
const DATA: &str = "eml";
const TEMP_PREFIX: &str = ".tmp_";

/// Envelope fields written next to the raw message.
#[derive(Serialize, Deserialize)]
struct Envelope {
    id: MailId,
    sender: Option<MailAddress>,
    recipients: Vec<MailAddress>,
    state: String,
    error_message: Option<String>,
    remote_host: String,
    remote_addr: String,
    last_updated: SystemTime,
    attributes: AHashMap<String, String>,
}

impl From<&Mail> for Envelope {
    fn from(mail: &Mail) -> Self {
        Self {
            id: mail.id,
            sender: mail.sender.clone(),
            recipients: mail.recipients.clone(),
            state: mail.state.clone(),
            error_message: mail.error_message.clone(),
            remote_host: mail.remote_host.clone(),
            remote_addr: mail.remote_addr.clone(),
            last_updated: mail.last_updated,
            attributes: mail.attributes.clone(),
        }
    }
}

impl Envelope {
    fn into_mail(self, message: MessageSource) -> Mail {
        Mail {
            id: self.id,
            sender: self.sender,
            recipients: self.recipients,
            message,
            state: self.state,
            error_message: self.error_message,
            remote_host: self.remote_host,
            remote_addr: self.remote_addr,
            last_updated: self.last_updated,
            attributes: self.attributes,
        }
    }
}

/// Directory-backed store.
///
/// Each mail is two files: `<id>.eml` holds the raw message and `<id>.meta`
/// the bincode encoded envelope. Both are written to a temporary name and
/// renamed into place, data first, so `list` never sees a half written mail.
#[derive(Debug)]
pub struct FileStore {
    name: String,
    path: PathBuf,
    locks: LockTable,
    signal: SpoolSignal,
}

impl FileStore {
    /// Open the store, creating the directory if needed and clearing any
    /// temporary files left by an interrupted write.
    pub async fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path).await?;

        let mut entries = fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                fs::remove_file(entry.path()).await?;
            }
        }

        Ok(Self {
            name: name.into(),
            path,
            locks: LockTable::default(),
            signal: SpoolSignal::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, id: &MailId, extension: &str) -> PathBuf {
        self.path.join(format!("{id}.{extension}"))
    }

    async fn write_atomic(&self, id: &MailId, extension: &str, contents: &[u8]) -> Result<()> {
        let temp = self.path.join(format!("{TEMP_PREFIX}{id}.{extension}"));
        fs::write(&temp, contents).await?;
        fs::rename(&temp, self.file(id, extension)).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl MailStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, mail: &Mail) -> Result<()> {
        let envelope = bincode::serde::encode_to_vec(
            Envelope::from(mail),
            bincode::config::standard(),
        )?;

        self.write_atomic(&mail.id, DATA, &mail.message.to_bytes())
            .await?;
        self.write_atomic(&mail.id, META, &envelope).await?;

        internal!(level = DEBUG, "{}: stored {}", self.name, mail.id);
        self.signal.notify_all();
        Ok(())
    }

    async fn retrieve(&self, id: &MailId) -> Result<Option<Mail>> {
        let Some(meta) = read_optional(&self.file(id, META)).await? else {
            return Ok(None);
        };
        let Some(data) = read_optional(&self.file(id, DATA)).await? else {
            return Ok(None);
        };

        let (envelope, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(&meta, bincode::config::standard())?;
        let message = MessageSource::parse(&data).map_err(|err| SpoolError::Corrupted {
            id: id.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Some(envelope.into_mail(message)))
    }

    async fn remove(&self, id: &MailId) -> Result<()> {
        // Meta first: once it is gone the mail no longer lists.
        remove_optional(&self.file(id, META)).await?;
        remove_optional(&self.file(id, DATA)).await?;

        internal!(level = DEBUG, "{}: removed {id}", self.name);
        self.locks.release(id);
        self.signal.notify_all();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MailId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(TEMP_PREFIX) {
                continue;
            }

            // Parsing the stem as an id also rejects anything path-like.
            if let Some(stem) = name.strip_suffix(&format!(".{META}")) {
                match stem.parse::<MailId>() {
                    Ok(id) => ids.push(id),
                    Err(_) => internal!(
                        level = WARN,
                        "{}: ignoring unexpected file {name}",
                        self.name
                    ),
                }
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn signal(&self) -> &SpoolSignal {
        &self.signal
    }
}
