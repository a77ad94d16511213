//! Spot Trader Library
//!
//! Autonomous spot-trading core: market data, signal and risk gates,
//! position lifecycle, durable stores and the orchestrator that ties them
//! together.

pub mod amount;
pub mod audit;
pub mod config;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod governance;
pub mod lifecycle;
pub mod llm;
pub mod news;
pub mod optimizer;
pub mod oracle;
pub mod orchestrator;
pub mod regime;
pub mod sentiment;
pub mod state;
pub mod store;
pub mod strategy;
pub mod types;

// Re-export main types for convenience
pub use amount::SymbolFilters;
pub use audit::DecisionAuditLog;
pub use config::{Settings, TradingMode};
pub use error::{ExchangeError, LlmError, StoreError};
pub use exchange::{BinanceClient, Credentials, ExchangeClient};
pub use executor::OrderExecutor;
pub use governance::{AssetAllowlistPolicy, DoomFlag, StablecoinPegWatchdog};
pub use llm::{HttpCompletionClient, TextCompletion};
pub use news::{HeadlineSource, NoHeadlines, StaticHeadlines};
pub use optimizer::{BacktestReport, BacktestRunner, SimulatedBacktest, StrategyOptimizer};
pub use oracle::{CoinbaseVenue, PriceOracle, PriceVenue};
pub use orchestrator::{Components, SharedState, TradingOrchestrator};
pub use sentiment::{SentimentEngine, SentimentReading};
pub use store::{LedgerStore, PositionStore, TradeHistoryStore};
pub use strategy::{BreakoutSignal, Signal, SignalSource};
pub use types::{
    Bar, DecisionContext, Direction, EntryType, ExitReason, KlineEvent, LedgerEntry, Position,
    PositionState, TradeRecord,
};
