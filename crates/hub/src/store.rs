//! Append-only journal of fleet activity.
//!
//! The hub records presence changes and the life of every correlated
//! request. Storage is behind [`EventStore`]; the default keeps nothing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::types::{ClientIdentity, CloseReason};

/// Boxed future returned by [`EventStore::append`].
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreEvent {
    Online {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_addr: Option<String>,
    },
    Offline {
        reason: CloseReason,
    },
    Command {
        correlation_id: String,
        payload: serde_json::Value,
    },
    Result {
        correlation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Timeout {
        correlation_id: String,
    },
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub client_id: ClientIdentity,
    #[serde(flatten)]
    pub event: StoreEvent,
}

/// Destination for journal records.
pub trait EventStore: Send + Sync + 'static {
    fn append(&self, record: StoreRecord) -> StoreFuture<'_>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl EventStore for NullStore {
    fn append(&self, _record: StoreRecord) -> StoreFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: StdMutex<Vec<StoreRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far, in append order.
    pub fn records(&self) -> Vec<StoreRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl EventStore for MemoryStore {
    fn append(&self, record: StoreRecord) -> StoreFuture<'_> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Box::pin(async { Ok(()) })
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlStore {
    /// Opens `path` for appending, creating it and its parent directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventStore for JsonlStore {
    fn append(&self, record: StoreRecord) -> StoreFuture<'_> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = self.file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// Stamps records with a sequence number and time before storing them.
///
/// Numbering, stamping and appending happen under one lock, so stores
/// see records in `seq` order with non-decreasing `at`.
///
/// Storage failures are logged and swallowed; the journal never fails
/// the operation it observes.
pub struct Journal {
    store: Arc<dyn EventStore>,
    next_seq: Mutex<u64>,
}

impl Journal {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            next_seq: Mutex::new(1),
        }
    }

    /// A journal backed by [`NullStore`].
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullStore))
    }

    pub async fn record(&self, client_id: &ClientIdentity, event: StoreEvent) {
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        *next_seq += 1;
        let record = StoreRecord {
            seq,
            at: Utc::now(),
            client_id: client_id.clone(),
            event,
        };
        if let Err(e) = self.store.append(record).await {
            tracing::warn!(%client_id, seq, "failed to write journal record: {e}");
        }
    }
}
