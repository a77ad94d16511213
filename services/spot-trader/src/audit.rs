//! Decision audit log
//!
//! Every trade or no-trade decision is appended as one JSON line so that a
//! decision can be explained after the fact from what was known at the time.

use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::store::jsonl::{self, JsonlFile};
use crate::types::DecisionContext;

pub struct DecisionAuditLog {
    path: PathBuf,
    file: Mutex<JsonlFile>,
}

impl DecisionAuditLog {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(JsonlFile::open(path).await?),
        })
    }

    pub async fn append(&self, context: &DecisionContext) -> Result<(), StoreError> {
        self.file.lock().await.append(context).await?;
        debug!(
            "Audit: {} signal={} approved={} reason={}",
            context.symbol, context.signal, context.risk_check.approved, context.risk_check.reason
        );
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.file.lock().await.sync().await
    }

    /// Every recorded decision, oldest first
    pub async fn read_all(&self) -> Result<Vec<DecisionContext>, StoreError> {
        let _guard = self.file.lock().await;
        jsonl::read_all(&self.path).await
    }
}
