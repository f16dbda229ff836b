//! Identity store used by the engine.
//!
//! The engine only needs three things from persistence: load a record by URI,
//! save one record, and save a batch of records atomically. Everything is kept
//! as JSON bodies keyed by `(kind, uri)`.

pub mod memory;

pub use self::memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Malformed {kind} record '{uri}': {reason}")]
    Malformed {
        kind: RecordKind,
        uri: String,
        reason: String,
    },
}

/// The table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Process,
    Config,
    ProgressBar,
    Job,
    Resource,
    Experiment,
    Study,
    User,
    Activity,
    Queue,
    QueueEntry,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Process => "process",
            RecordKind::Config => "config",
            RecordKind::ProgressBar => "progress_bar",
            RecordKind::Job => "job",
            RecordKind::Resource => "resource",
            RecordKind::Experiment => "experiment",
            RecordKind::Study => "study",
            RecordKind::User => "user",
            RecordKind::Activity => "activity",
            RecordKind::Queue => "queue",
            RecordKind::QueueEntry => "queue_entry",
        };
        f.write_str(name)
    }
}

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub uri: String,
    pub body: Value,
}

impl Record {
    pub fn new(kind: RecordKind, uri: impl Into<String>, body: Value) -> Self {
        Self {
            kind,
            uri: uri.into(),
            body,
        }
    }

    /// Reads a string field of the body, empty when absent.
    pub fn str_field(&self, key: &str) -> &str {
        self.body.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    pub(crate) fn malformed(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Malformed {
            kind: self.kind,
            uri: self.uri.clone(),
            reason: reason.into(),
        }
    }
}

/// The persistence contract of the engine.
///
/// `save_all` is the transaction boundary: either every record of the batch is
/// written or none is.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_by_uri(&self, kind: RecordKind, uri: &str) -> Result<Option<Record>, StoreError>;

    async fn save_all(&self, records: Vec<Record>) -> Result<(), StoreError>;

    async fn list(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError>;

    async fn delete(&self, kind: RecordKind, uri: &str) -> Result<bool, StoreError>;

    async fn save(&self, record: Record) -> Result<(), StoreError> {
        self.save_all(vec![record]).await
    }

    async fn exists(&self, kind: RecordKind, uri: &str) -> Result<bool, StoreError> {
        Ok(self.get_by_uri(kind, uri).await?.is_some())
    }
}

/// Generates a fresh URI.
pub fn new_uri() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
