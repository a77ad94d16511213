//! Durable stores: open positions, capital ledger, closed trades

pub mod jsonl;
pub mod ledger;
pub mod positions;
pub mod trades;

pub use ledger::{LedgerStore, LedgerSummary};
pub use positions::PositionStore;
pub use trades::TradeHistoryStore;
