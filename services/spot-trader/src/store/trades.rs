//! Closed-trade history

use std::collections::VecDeque;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

use super::jsonl::{self, JsonlFile};
use crate::error::StoreError;
use crate::types::TradeRecord;

/// Records kept in memory for win-rate queries
const RECENT_CAPACITY: usize = 500;

struct TradeState {
    file: JsonlFile,
    recent: VecDeque<TradeRecord>,
    total: u64,
}

/// Append-only store of closed trades
pub struct TradeHistoryStore {
    state: Mutex<TradeState>,
}

impl TradeHistoryStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let existing: Vec<TradeRecord> = jsonl::read_all(path).await?;
        let total = existing.len() as u64;
        let skip = existing.len().saturating_sub(RECENT_CAPACITY);
        let recent: VecDeque<TradeRecord> = existing.into_iter().skip(skip).collect();

        Ok(Self {
            state: Mutex::new(TradeState {
                file: JsonlFile::open(path).await?,
                recent,
                total,
            }),
        })
    }

    pub async fn append(&self, record: TradeRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.file.append(&record).await?;
        debug!(
            "Trade recorded: {} {} pnl={} ({})",
            record.symbol, record.direction, record.realized_pnl, record.exit_reason
        );
        state.recent.push_back(record);
        if state.recent.len() > RECENT_CAPACITY {
            state.recent.pop_front();
        }
        state.total += 1;
        Ok(())
    }

    /// The most recent `n` trades, oldest first
    pub async fn recent(&self, n: usize) -> Vec<TradeRecord> {
        let state = self.state.lock().await;
        let skip = state.recent.len().saturating_sub(n);
        state.recent.iter().skip(skip).cloned().collect()
    }

    /// Fraction of winners among the last `n` trades; `None` with no trades
    pub async fn recent_win_rate(&self, n: usize) -> Option<f64> {
        let recent = self.recent(n).await;
        if recent.is_empty() {
            return None;
        }
        let wins = recent.iter().filter(|t| t.is_win()).count();
        Some(wins as f64 / recent.len() as f64)
    }

    pub async fn count(&self) -> u64 {
        self.state.lock().await.total
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.state.lock().await.file.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ExitReason};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn trade(pnl: i64) -> TradeRecord {
        TradeRecord {
            position_id: Uuid::new_v4(),
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Long,
            entry_price: Decimal::from(2000),
            exit_price: Decimal::from(2000 + pnl),
            quantity: Decimal::ONE,
            realized_pnl: Decimal::from(pnl),
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            exit_reason: if pnl > 0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::StopLoss
            },
        }
    }

    #[tokio::test]
    async fn test_win_rate_over_recent_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeHistoryStore::open(&dir.path().join("trades.jsonl"))
            .await
            .unwrap();

        assert_eq!(store.recent_win_rate(10).await, None);

        for pnl in [10, -5, -5, 20, 15] {
            store.append(trade(pnl)).await.unwrap();
        }

        assert_eq!(store.recent_win_rate(10).await, Some(0.6));
        // Last two: 20, 15
        assert_eq!(store.recent_win_rate(2).await, Some(1.0));
        assert_eq!(store.count().await, 5);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");

        {
            let store = TradeHistoryStore::open(&path).await.unwrap();
            store.append(trade(-1)).await.unwrap();
            store.append(trade(3)).await.unwrap();
        }

        let store = TradeHistoryStore::open(&path).await.unwrap();
        let recent = store.recent(5).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].realized_pnl, Decimal::from(3));
    }
}
