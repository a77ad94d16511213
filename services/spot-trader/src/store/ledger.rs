//! Capital ledger - the single source of truth for how much capital exists
//!
//! Every capital movement is one appended row carrying the running balance.
//! Rows are never edited or deleted; the balance of row N is the balance of
//! row N-1 plus the amount of row N.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::jsonl::{self, JsonlFile};
use crate::error::StoreError;
use crate::types::{EntryType, LedgerEntry};

/// Aggregate view of the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub balance: Decimal,
    pub count: u64,
    pub total_realized_pnl: Decimal,
}

struct LedgerState {
    file: JsonlFile,
    last_id: u64,
    balance: Decimal,
    count: u64,
    total_realized_pnl: Decimal,
}

/// Append-only ledger. Writes are serialized through one lock.
pub struct LedgerStore {
    state: Mutex<LedgerState>,
}

impl LedgerStore {
    /// Open (or create) the ledger, seeding a genesis DEPOSIT when it is empty
    pub async fn open(path: &Path, genesis_amount: Decimal) -> Result<Self, StoreError> {
        let entries: Vec<LedgerEntry> = jsonl::read_all(path).await?;
        verify_chain(path, &entries)?;

        let file = JsonlFile::open(path).await?;
        let state = LedgerState {
            file,
            last_id: entries.last().map(|e| e.id).unwrap_or(0),
            balance: entries.last().map(|e| e.balance_after).unwrap_or(Decimal::ZERO),
            count: entries.len() as u64,
            total_realized_pnl: entries
                .iter()
                .filter(|e| e.entry_type == EntryType::RealizedPnl)
                .map(|e| e.amount)
                .sum(),
        };

        let store = Self {
            state: Mutex::new(state),
        };

        if entries.is_empty() {
            store
                .add_transaction(EntryType::Deposit, genesis_amount, "genesis deposit")
                .await?;
            info!("Ledger seeded with genesis deposit of {}", genesis_amount);
        } else {
            info!(
                "Ledger loaded: {} entries, balance {}",
                entries.len(),
                store.current_balance().await
            );
        }

        Ok(store)
    }

    /// Append a capital movement and return the new balance
    pub async fn add_transaction(
        &self,
        entry_type: EntryType,
        amount: Decimal,
        description: &str,
    ) -> Result<Decimal, StoreError> {
        let mut state = self.state.lock().await;

        let entry = LedgerEntry {
            id: state.last_id + 1,
            timestamp: Utc::now(),
            entry_type,
            amount,
            balance_after: state.balance + amount,
            description: description.to_string(),
        };

        // Disk first: in-memory state only advances once the row is durable
        state.file.append(&entry).await?;

        state.last_id = entry.id;
        state.balance = entry.balance_after;
        state.count += 1;
        if entry_type == EntryType::RealizedPnl {
            state.total_realized_pnl += amount;
        }

        debug!(
            "Ledger #{} {} {:+} -> {} ({})",
            entry.id, entry_type, amount, entry.balance_after, description
        );
        Ok(entry.balance_after)
    }

    pub async fn current_balance(&self) -> Decimal {
        self.state.lock().await.balance
    }

    pub async fn summary(&self) -> LedgerSummary {
        let state = self.state.lock().await;
        LedgerSummary {
            balance: state.balance,
            count: state.count,
            total_realized_pnl: state.total_realized_pnl,
        }
    }

    /// All rows, oldest first
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.state.lock().await;
        jsonl::read_all(state.file.path()).await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.state.lock().await.file.sync().await
    }
}

/// Check ids increase and every running balance follows from the previous one
fn verify_chain(path: &Path, entries: &[LedgerEntry]) -> Result<(), StoreError> {
    let mut prev: Option<&LedgerEntry> = None;
    for entry in entries {
        let (expected_balance, min_id) = match prev {
            Some(p) => (p.balance_after + entry.amount, p.id + 1),
            None => (entry.amount, 1),
        };
        if entry.id < min_id || entry.balance_after != expected_balance {
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                reason: format!(
                    "entry {} breaks the running balance (expected {}, found {})",
                    entry.id, expected_balance, entry.balance_after
                ),
            });
        }
        prev = Some(entry);
    }
    Ok(())
}
