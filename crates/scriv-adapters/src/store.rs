//! Document store and transcript sink boundaries.
//!
//! Both collaborators are external in production (a relational store in
//! the original deployment); the in-memory implementations here back the
//! test suite and small single-process deployments. The document store's
//! `write` is versioned so callers can run an atomic read-decide-write
//! loop against it.

use async_trait::async_trait;
use scriv_core::document::Document;
use scriv_core::error::{SinkError, StoreError};
use scriv_core::message::{Message, ToolInvocation};
use std::collections::HashMap;
use std::sync::Mutex;

/// A document plus the version observed at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub doc: Document,
    pub version: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, id: &str) -> Result<DocumentRecord, StoreError>;

    /// Atomic versioned write. Fails with [`StoreError::Conflict`] when
    /// the stored version no longer matches `expected_version`. A write
    /// with `expected_version == 0` creates the document.
    async fn write(
        &self,
        id: &str,
        doc: Document,
        expected_version: u64,
    ) -> Result<u64, StoreError>;
}

/// One durable transcript record.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    Message(Message),
    /// An invocation whose arguments could not be repaired; recorded
    /// instead of being forwarded to execution.
    InvalidCall {
        invocation: ToolInvocation,
        reason: String,
    },
    /// Best-effort flush of partially accumulated assistant content.
    PartialFlush {
        message: Message,
        reason: String,
    },
}

#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn append(&self, session: &str, entry: TranscriptEntry) -> Result<(), SinkError>;
}

/// In-memory document store with optimistic versioning.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, e.g. an outline created before any turn runs.
    pub fn seed(&self, id: &str, doc: Document) {
        if let Ok(mut docs) = self.docs.lock() {
            docs.insert(id.to_string(), DocumentRecord { doc, version: 1 });
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read(&self, id: &str) -> Result<DocumentRecord, StoreError> {
        let docs = self
            .docs
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        docs.get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn write(
        &self,
        id: &str,
        doc: Document,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let current = docs.get(id).map(|r| r.version).unwrap_or(0);
        if current != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found: current,
            });
        }
        let next = current + 1;
        docs.insert(
            id.to_string(),
            DocumentRecord { doc, version: next },
        );
        Ok(next)
    }
}

/// In-memory transcript sink; tests inspect what was persisted.
#[derive(Default)]
pub struct MemorySessionSink {
    entries: Mutex<Vec<(String, TranscriptEntry)>>,
}

impl MemorySessionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, TranscriptEntry)> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn messages(&self, session: &str) -> Vec<Message> {
        self.entries()
            .into_iter()
            .filter(|(s, _)| s == session)
            .filter_map(|(_, entry)| match entry {
                TranscriptEntry::Message(m) => Some(m),
                TranscriptEntry::PartialFlush { message, .. } => Some(message),
                TranscriptEntry::InvalidCall { .. } => None,
            })
            .collect()
    }

    pub fn partial_flushes(&self, session: &str) -> Vec<(Message, String)> {
        self.entries()
            .into_iter()
            .filter(|(s, _)| s == session)
            .filter_map(|(_, entry)| match entry {
                TranscriptEntry::PartialFlush { message, reason } => Some((message, reason)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SessionSink for MemorySessionSink {
    async fn append(&self, session: &str, entry: TranscriptEntry) -> Result<(), SinkError> {
        self.entries
            .lock()
            .map_err(|e| SinkError::Backend(e.to_string()))?
            .push((session.to_string(), entry));
        Ok(())
    }
}
