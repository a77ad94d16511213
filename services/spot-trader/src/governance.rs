//! Governance gates: asset allowlist and stablecoin peg watchdog

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::GovernanceSettings;
use crate::error::ExchangeError;
use crate::exchange::ExchangeClient;
use crate::llm::TextCompletion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Allowed,
    Restricted,
    Banned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRule {
    pub status: AssetStatus,
    #[serde(default)]
    pub reason: String,
}

/// Deny-by-default symbol policy
#[derive(Debug, Clone, Default)]
pub struct AssetAllowlistPolicy {
    rules: HashMap<String, AssetRule>,
}

impl AssetAllowlistPolicy {
    pub fn new(rules: HashMap<String, AssetRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(symbol, rule)| (symbol.to_uppercase(), rule))
            .collect();
        Self { rules }
    }

    /// Every listed symbol is ALLOWED
    pub fn from_symbols<S: AsRef<str>>(symbols: &[S]) -> Self {
        let rules = symbols
            .iter()
            .map(|s| {
                (
                    s.as_ref().to_string(),
                    AssetRule {
                        status: AssetStatus::Allowed,
                        reason: "configured".to_string(),
                    },
                )
            })
            .collect();
        Self::new(rules)
    }

    /// Parse a YAML map of `SYMBOL: {status, reason}`
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let rules: HashMap<String, AssetRule> =
            serde_yaml::from_str(yaml).context("invalid allowlist YAML")?;
        Ok(Self::new(rules))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read allowlist {}", path.display()))?;
        let policy = Self::from_yaml_str(&yaml)?;
        info!("Loaded {} allowlist rules from {}", policy.rules.len(), path.display());
        Ok(policy)
    }

    /// The allowlist file wins over `allowed_symbols` when both are set
    pub fn from_settings(settings: &GovernanceSettings) -> Result<Self> {
        match &settings.allowlist_file {
            Some(path) => Self::load(path),
            None => Ok(Self::from_symbols(&settings.allowed_symbols)),
        }
    }

    pub fn is_allowed(&self, symbol: &str) -> bool {
        self.check(symbol).is_ok()
    }

    /// `Err` carries the human-readable block reason
    pub fn check(&self, symbol: &str) -> std::result::Result<(), String> {
        match self.rules.get(&symbol.to_uppercase()) {
            Some(rule) if rule.status == AssetStatus::Allowed => Ok(()),
            Some(rule) => Err(format!(
                "{} is {:?} on the allowlist: {}",
                symbol, rule.status, rule.reason
            )),
            None => Err(format!("{} is not on the allowlist", symbol)),
        }
    }
}

/// Shared advisory flag raised while the reference stablecoin is off peg
#[derive(Debug, Clone, Default)]
pub struct DoomFlag(Arc<AtomicBool>);

impl DoomFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PegStatus {
    Pegged(Decimal),
    Depegged(Decimal),
}

/// Polls the reference pair and raises the doom flag outside the band
pub struct StablecoinPegWatchdog {
    exchange: Arc<dyn ExchangeClient>,
    llm: Option<Arc<dyn TextCompletion>>,
    doom: DoomFlag,
    pair: String,
    lower: Decimal,
    upper: Decimal,
    interval: Duration,
}

impl StablecoinPegWatchdog {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        llm: Option<Arc<dyn TextCompletion>>,
        doom: DoomFlag,
        settings: &GovernanceSettings,
    ) -> Self {
        Self {
            exchange,
            llm: if settings.ask_llm_on_depeg { llm } else { None },
            doom,
            pair: settings.peg_pair.clone(),
            lower: settings.peg_lower,
            upper: settings.peg_upper,
            interval: Duration::from_secs(settings.peg_interval_secs.max(1)),
        }
    }

    /// One poll: fetch the pair, update the flag
    pub async fn check_once(&self) -> Result<PegStatus, ExchangeError> {
        let price = self.exchange.get_price(&self.pair).await?;

        if price < self.lower || price > self.upper {
            let was_raised = self.doom.is_raised();
            self.doom.raise();
            if !was_raised {
                error!(
                    "DOOM: {} at {} outside peg band [{}, {}], new entries blocked",
                    self.pair, price, self.lower, self.upper
                );
                self.corroborate(price).await;
            } else {
                debug!("{} still off peg at {}", self.pair, price);
            }
            return Ok(PegStatus::Depegged(price));
        }

        if self.doom.is_raised() {
            self.doom.clear();
            info!("{} back on peg at {}, doom mode cleared", self.pair, price);
        }
        Ok(PegStatus::Pegged(price))
    }

    /// Ask the completion service for context on a depeg; logged only
    async fn corroborate(&self, price: Decimal) {
        let Some(llm) = &self.llm else {
            return;
        };
        let prompt = format!(
            "The stablecoin pair {} is trading at {}, outside its peg band. \
             Is there a known depeg or market event? Answer in one sentence.",
            self.pair, price
        );
        match llm
            .generate(&prompt, "You are a cautious crypto risk officer.")
            .await
        {
            Ok(reply) => warn!("Depeg assessment for {}: {}", self.pair, reply.trim()),
            Err(e) => warn!("Depeg assessment unavailable: {}", e),
        }
    }

    /// Poll until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Peg watchdog started: {} band [{}, {}] every {:?}",
            self.pair, self.lower, self.upper, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        warn!("Peg check for {} failed: {}", self.pair, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Peg watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::SymbolFilters;
    use crate::types::{AccountBalance, Bar, KlineEvent, OrderResult, OrderSide};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Returns queued prices for the peg pair
    struct PegFeed(Mutex<Vec<Decimal>>);

    #[async_trait]
    impl ExchangeClient for PegFeed {
        async fn get_klines(&self, _: &str, _: &str, _: usize) -> Result<Vec<Bar>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            let mut prices = self.0.lock().unwrap();
            if prices.is_empty() {
                return Err(ExchangeError::Transport("no price".to_string()));
            }
            Ok(prices.remove(0))
        }

        async fn place_market_order(
            &self,
            _: &str,
            _: OrderSide,
            _: Decimal,
        ) -> Result<OrderResult, ExchangeError> {
            Err(ExchangeError::InvalidOrder("not supported".to_string()))
        }

        async fn get_account_balances(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
            Err(ExchangeError::UnknownSymbol(symbol.to_string()))
        }

        async fn stream_klines(
            &self,
            _: &str,
            _: &str,
        ) -> Result<mpsc::Receiver<KlineEvent>, ExchangeError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[test]
    fn test_absent_symbol_is_denied() {
        let policy = AssetAllowlistPolicy::from_symbols(&["BTCUSDT", "ETHUSDT"]);
        assert!(policy.is_allowed("BTCUSDT"));
        assert!(policy.is_allowed("ethusdt"));
        assert!(!policy.is_allowed("DOGEUSDT"));
        assert!(policy.check("DOGEUSDT").unwrap_err().contains("not on the allowlist"));
    }

    #[test]
    fn test_yaml_policy_statuses() {
        let policy = AssetAllowlistPolicy::from_yaml_str(
            r#"
BTCUSDT:
  status: ALLOWED
  reason: core asset
LUNAUSDT:
  status: BANNED
  reason: collapsed
XRPUSDT:
  status: RESTRICTED
  reason: legal review
"#,
        )
        .unwrap();

        assert!(policy.is_allowed("BTCUSDT"));
        assert!(!policy.is_allowed("XRPUSDT"));
        let reason = policy.check("LUNAUSDT").unwrap_err();
        assert!(reason.contains("Banned") && reason.contains("collapsed"));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(AssetAllowlistPolicy::from_yaml_str("BTCUSDT: [not, a, rule]").is_err());
    }

    #[tokio::test]
    async fn test_watchdog_raises_and_clears_doom() {
        let feed = Arc::new(PegFeed(Mutex::new(vec![dec!(1.0001), dec!(0.95), dec!(0.97), dec!(1.0)])));
        let doom = DoomFlag::new();
        let watchdog =
            StablecoinPegWatchdog::new(feed, None, doom.clone(), &GovernanceSettings::default());

        assert_eq!(watchdog.check_once().await.unwrap(), PegStatus::Pegged(dec!(1.0001)));
        assert!(!doom.is_raised());

        assert_eq!(watchdog.check_once().await.unwrap(), PegStatus::Depegged(dec!(0.95)));
        assert!(doom.is_raised());

        assert_eq!(watchdog.check_once().await.unwrap(), PegStatus::Depegged(dec!(0.97)));
        assert!(doom.is_raised());

        assert_eq!(watchdog.check_once().await.unwrap(), PegStatus::Pegged(dec!(1.0)));
        assert!(!doom.is_raised());

        // Feed failure leaves the flag untouched
        assert!(watchdog.check_once().await.is_err());
        assert!(!doom.is_raised());
    }

    #[tokio::test]
    async fn test_band_edges_are_inclusive() {
        let feed = Arc::new(PegFeed(Mutex::new(vec![dec!(0.98), dec!(1.02)])));
        let doom = DoomFlag::new();
        let watchdog =
            StablecoinPegWatchdog::new(feed, None, doom.clone(), &GovernanceSettings::default());

        watchdog.check_once().await.unwrap();
        watchdog.check_once().await.unwrap();
        assert!(!doom.is_raised());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let feed = Arc::new(PegFeed(Mutex::new(vec![dec!(0.9)])));
        let doom = DoomFlag::new();
        let watchdog =
            StablecoinPegWatchdog::new(feed, None, doom.clone(), &GovernanceSettings::default());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(watchdog.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(doom.is_raised());
    }
}
