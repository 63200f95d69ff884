use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use exapatch_core::error::PatchError;
use exapatch_core::ledger::LedgerDocument;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Key-value sink for request status, consumed by external observers.
///
/// Updates are fire-and-forget: implementations log their own failures.
pub trait StatusSink: Send + Sync {
    fn update_status(&self, request_id: &str, payload: &Value);
}

/// Snapshot published on every ledger change.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot<'a> {
    pub request_id: &'a str,
    #[serde(flatten)]
    pub ledger: &'a LedgerDocument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<&'a str>,
}

impl<'a> StatusSnapshot<'a> {
    pub fn new(request_id: &'a str, ledger: &'a LedgerDocument, error: Option<&'a PatchError>) -> Self {
        Self {
            request_id,
            ledger,
            error_code: error.map(|e| e.code.hex()),
            error_message: error.map(|e| e.message.as_str()),
            suggestion: error.map(|e| e.suggestion.as_str()),
        }
    }

    pub fn publish(&self, sink: &dyn StatusSink) {
        match serde_json::to_value(self) {
            Ok(value) => sink.update_status(self.request_id, &value),
            Err(e) => warn!(request_id = self.request_id, error = %e, "Failed to serialize status"),
        }
    }
}

/// Writes `<dir>/<request_id>.json`, replacing the previous snapshot atomically.
#[derive(Debug, Clone)]
pub struct FileStatusSink {
    dir: PathBuf,
}

impl FileStatusSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", request_id))
    }

    fn write(&self, request_id: &str, payload: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create status dir {}", self.dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;
        let body = serde_json::to_vec_pretty(payload)?;
        tmp.write_all(&body)?;
        let path = self.path_for(request_id);
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist status file {}", path.display()))?;
        Ok(())
    }
}

impl StatusSink for FileStatusSink {
    fn update_status(&self, request_id: &str, payload: &Value) {
        if let Err(e) = self.write(request_id, payload) {
            warn!(request_id, error = %e, "Status update failed");
        }
    }
}

/// Keeps every published snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    updates: Mutex<Vec<(String, Value)>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(String, Value)> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Value> {
        self.updates().pop().map(|(_, v)| v)
    }
}

impl StatusSink for MemoryStatusSink {
    fn update_status(&self, request_id: &str, payload: &Value) {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((request_id.to_string(), payload.clone()));
    }
}
