use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{FileStore, MailStore, MemoryStore, Result};

/// Backing store selection.
///
/// ```ron
/// spool: File(path: "/var/spool/postern/root"),
/// outgoing: Memory(capacity: Some(10000)),
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum SpoolConfig {
    File {
        path: PathBuf,
    },
    Memory {
        /// Maximum number of messages to store (omit for unlimited)
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::Memory { capacity: None }
    }
}

impl SpoolConfig {
    pub async fn open(self, name: &str) -> Result<Arc<dyn MailStore>> {
        Ok(match self {
            Self::File { path } => Arc::new(FileStore::open(name, path).await?),
            Self::Memory { capacity } => {
                let store = MemoryStore::new(name);
                Arc::new(match capacity {
                    Some(capacity) => store.with_capacity(capacity),
                    None => store,
                })
            }
        })
    }
}
