//! Trader configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `config/default.toml`, then `config/<TRADER_ENV>.toml`, then environment
//! variables such as `TRADER__RISK__RISK_PER_TRADE_PCT=0.5`.
//! Exchange credentials are read from `BINANCE_API_KEY` / `BINANCE_API_SECRET`
//! only and never from files.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether orders reach the exchange
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    DryRun,
    Live,
}

/// Top-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    /// Bars kept per symbol for indicators and signals
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Sentinel file; its presence requests a cooperative stop
    #[serde(default)]
    pub stop_file: Option<PathBuf>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Close every open position when stopping
    #[serde(default)]
    pub close_on_shutdown: bool,
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub governance: GovernanceSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

impl Settings {
    /// Load configuration from `./config` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env_name = std::env::var("TRADER_ENV").unwrap_or_else(|_| "development".to_string());

        Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env_name))).required(false))
            .add_source(
                Environment::with_prefix("TRADER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn positions_path(&self) -> PathBuf {
        self.data_dir.join("positions.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.jsonl")
    }

    pub fn trades_path(&self) -> PathBuf {
        self.data_dir.join("trades.jsonl")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("decisions.jsonl")
    }

    pub fn stop_file_path(&self) -> PathBuf {
        self.stop_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("STOP"))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: TradingMode::default(),
            symbols: default_symbols(),
            kline_interval: default_kline_interval(),
            history_bars: default_history_bars(),
            data_dir: default_data_dir(),
            stop_file: None,
            heartbeat_secs: default_heartbeat_secs(),
            close_on_shutdown: false,
            exchange: ExchangeSettings::default(),
            oracle: OracleSettings::default(),
            llm: LlmSettings::default(),
            risk: RiskSettings::default(),
            strategy: StrategySettings::default(),
            ledger: LedgerSettings::default(),
            governance: GovernanceSettings::default(),
            analysis: AnalysisSettings::default(),
        }
    }
}

/// Exchange endpoints, pacing and timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeSettings {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Concurrent in-flight REST requests across the whole process
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_min_request_spacing_ms")]
    pub min_request_spacing_ms: u64,
    /// Transport-level retries for idempotent reads
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            recv_window_ms: default_recv_window_ms(),
            max_concurrent_requests: default_max_concurrent_requests(),
            min_request_spacing_ms: default_min_request_spacing_ms(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            order_timeout_secs: default_order_timeout_secs(),
        }
    }
}

/// Secondary price venue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OracleSettings {
    #[serde(default = "default_coinbase_url")]
    pub coinbase_url: String,
    /// Maximum tolerated cross-venue deviation, in percent
    #[serde(default = "default_max_deviation_pct")]
    pub max_deviation_pct: Decimal,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            coinbase_url: default_coinbase_url(),
            max_deviation_pct: default_max_deviation_pct(),
            timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

/// Text-completion gateway
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_url")]
    pub gateway_url: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_url: default_llm_url(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// Position sizing and entry filters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskSettings {
    /// Capital risked per trade, percent of ledger balance
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: Decimal,
    /// Cap on a single position's notional, percent of ledger balance
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_adx_threshold")]
    pub adx_threshold: f64,
    /// Only enter when the regime is TRENDING
    #[serde(default)]
    pub require_trending: bool,
    /// Block long entries while the mood is EXTREME_FEAR
    #[serde(default = "default_true")]
    pub block_on_extreme_fear: bool,
    #[serde(default)]
    pub trailing: Option<TrailingSettings>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: default_risk_per_trade_pct(),
            max_position_pct: default_max_position_pct(),
            max_open_positions: default_max_open_positions(),
            adx_threshold: default_adx_threshold(),
            require_trending: false,
            block_on_extreme_fear: true,
            trailing: None,
        }
    }
}

/// Trailing stop derived at entry
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct TrailingSettings {
    /// Activation distance from entry in R
    pub activation_r: Decimal,
    /// Trail distance as percent of entry price
    pub distance_pct: Decimal,
}

/// Reference signal parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategySettings {
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_atr_mult")]
    pub atr_mult: f64,
    /// Secondary target distance in R
    #[serde(default = "default_reward_r")]
    pub reward_r: f64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            atr_mult: default_atr_mult(),
            reward_r: default_reward_r(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerSettings {
    /// DEPOSIT seeded into an empty ledger
    #[serde(default = "default_genesis_amount")]
    pub genesis_amount: Decimal,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            genesis_amount: default_genesis_amount(),
        }
    }
}

/// Allowlist and stablecoin peg watchdog
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GovernanceSettings {
    /// Symbols allowed when no allowlist file is configured
    #[serde(default = "default_symbols")]
    pub allowed_symbols: Vec<String>,
    /// YAML file with symbol -> {status, reason}; replaces `allowed_symbols`
    #[serde(default)]
    pub allowlist_file: Option<PathBuf>,
    #[serde(default = "default_peg_pair")]
    pub peg_pair: String,
    #[serde(default = "default_peg_lower")]
    pub peg_lower: Decimal,
    #[serde(default = "default_peg_upper")]
    pub peg_upper: Decimal,
    #[serde(default = "default_peg_interval_secs")]
    pub peg_interval_secs: u64,
    /// Ask the completion service to corroborate a depeg
    #[serde(default = "default_true")]
    pub ask_llm_on_depeg: bool,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            allowed_symbols: default_symbols(),
            allowlist_file: None,
            peg_pair: default_peg_pair(),
            peg_lower: default_peg_lower(),
            peg_upper: default_peg_upper(),
            peg_interval_secs: default_peg_interval_secs(),
            ask_llm_on_depeg: true,
        }
    }
}

/// Periodic sentiment analysis
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_analysis_interval_secs")]
    pub interval_secs: u64,
    /// One headline per line
    #[serde(default)]
    pub headlines_file: Option<PathBuf>,
    /// Re-run analysis early when the recent win rate drops below this
    #[serde(default = "default_min_win_rate")]
    pub min_win_rate: f64,
    #[serde(default = "default_win_rate_window")]
    pub win_rate_window: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_analysis_interval_secs(),
            headlines_file: None,
            min_win_rate: default_min_win_rate(),
            win_rate_window: default_win_rate_window(),
        }
    }
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}
fn default_kline_interval() -> String { "15m".to_string() }
fn default_history_bars() -> usize { 200 }
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spot-trader")
}
fn default_heartbeat_secs() -> u64 { 30 }
fn default_rest_url() -> String { "https://api.binance.com".to_string() }
fn default_ws_url() -> String { "wss://stream.binance.com:9443".to_string() }
fn default_recv_window_ms() -> u64 { 5000 }
fn default_max_concurrent_requests() -> usize { 4 }
fn default_min_request_spacing_ms() -> u64 { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_request_timeout_secs() -> u64 { 10 }
fn default_order_timeout_secs() -> u64 { 20 }
fn default_coinbase_url() -> String { "https://api.coinbase.com".to_string() }
fn default_max_deviation_pct() -> Decimal { Decimal::new(5, 1) }
fn default_oracle_timeout_secs() -> u64 { 5 }
fn default_llm_url() -> String { "http://localhost:8090".to_string() }
fn default_llm_timeout_secs() -> u64 { 30 }
fn default_risk_per_trade_pct() -> Decimal { Decimal::ONE }
fn default_max_position_pct() -> Decimal { Decimal::from(20) }
fn default_max_open_positions() -> usize { 3 }
fn default_adx_threshold() -> f64 { 25.0 }
fn default_true() -> bool { true }
fn default_lookback() -> usize { 20 }
fn default_atr_mult() -> f64 { 2.0 }
fn default_reward_r() -> f64 { 2.0 }
fn default_genesis_amount() -> Decimal { Decimal::from(1000) }
fn default_peg_pair() -> String { "USDCUSDT".to_string() }
fn default_peg_lower() -> Decimal { Decimal::new(98, 2) }
fn default_peg_upper() -> Decimal { Decimal::new(102, 2) }
fn default_peg_interval_secs() -> u64 { 60 }
fn default_analysis_interval_secs() -> u64 { 6 * 60 * 60 }
fn default_min_win_rate() -> f64 { 0.4 }
fn default_win_rate_window() -> usize { 10 }
