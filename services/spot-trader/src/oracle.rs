//! Cross-venue price integrity
//!
//! Before an entry the primary exchange price is compared against an
//! independent venue. A large deviation hard-blocks the entry; an outage of
//! the secondary venue does not.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::amount::split_symbol;
use crate::config::OracleSettings;
use crate::error::ExchangeError;

/// An independent source of spot prices
#[async_trait]
pub trait PriceVenue: Send + Sync {
    fn name(&self) -> &str;

    async fn spot_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}

/// Outcome of one integrity check
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityCheck {
    /// Deviation within tolerance
    Consistent { secondary: Decimal, deviation_pct: Decimal },
    /// Deviation beyond tolerance; entries must not proceed
    Anomaly { secondary: Decimal, deviation_pct: Decimal },
    /// Secondary venue unavailable; treated as passing
    Unverified { reason: String },
}

impl IntegrityCheck {
    pub fn passed(&self) -> bool {
        !matches!(self, IntegrityCheck::Anomaly { .. })
    }
}

impl fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityCheck::Consistent {
                secondary,
                deviation_pct,
            } => write!(f, "price consistent (secondary {}, deviation {:.4}%)", secondary, deviation_pct),
            IntegrityCheck::Anomaly {
                secondary,
                deviation_pct,
            } => write!(f, "price anomaly (secondary {}, deviation {:.4}%)", secondary, deviation_pct),
            IntegrityCheck::Unverified { reason } => write!(f, "price unverified: {}", reason),
        }
    }
}

pub struct PriceOracle {
    venue: Arc<dyn PriceVenue>,
    max_deviation_pct: Decimal,
    timeout: Duration,
}

impl PriceOracle {
    pub fn new(venue: Arc<dyn PriceVenue>, settings: &OracleSettings) -> Self {
        Self {
            venue,
            max_deviation_pct: settings.max_deviation_pct,
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    /// `false` only when the secondary venue disagrees beyond tolerance
    pub async fn check_integrity(&self, symbol: &str, primary_price: Decimal) -> bool {
        self.assess(symbol, primary_price).await.passed()
    }

    pub async fn assess(&self, symbol: &str, primary_price: Decimal) -> IntegrityCheck {
        if primary_price <= Decimal::ZERO {
            error!("Non-positive primary price {} for {}", primary_price, symbol);
            return IntegrityCheck::Anomaly {
                secondary: Decimal::ZERO,
                deviation_pct: Decimal::ONE_HUNDRED,
            };
        }

        let secondary =
            match tokio::time::timeout(self.timeout, self.venue.spot_price(symbol)).await {
                Ok(Ok(price)) => price,
                Ok(Err(e)) => return degrade_gracefully(symbol, self.venue.name(), &e.to_string()),
                Err(_) => {
                    return degrade_gracefully(
                        symbol,
                        self.venue.name(),
                        &format!("timed out after {:?}", self.timeout),
                    )
                }
            };

        let deviation_pct = (primary_price - secondary).abs() / primary_price * Decimal::ONE_HUNDRED;

        if deviation_pct > self.max_deviation_pct {
            error!(
                "Price anomaly on {}: primary {} vs {} {} ({:.4}% > {}%)",
                symbol,
                primary_price,
                self.venue.name(),
                secondary,
                deviation_pct,
                self.max_deviation_pct
            );
            IntegrityCheck::Anomaly {
                secondary,
                deviation_pct,
            }
        } else {
            debug!(
                "Price check {}: primary {} vs {} {} ({:.4}%)",
                symbol,
                primary_price,
                self.venue.name(),
                secondary,
                deviation_pct
            );
            IntegrityCheck::Consistent {
                secondary,
                deviation_pct,
            }
        }
    }
}

/// Named fail-open path: the check passes when the secondary venue is down
fn degrade_gracefully(symbol: &str, venue: &str, reason: &str) -> IntegrityCheck {
    warn!(
        "Secondary venue {} unavailable for {}, proceeding unverified: {}",
        venue, symbol, reason
    );
    IntegrityCheck::Unverified {
        reason: format!("{}: {}", venue, reason),
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpot {
    data: CoinbaseAmount,
}

#[derive(Debug, Deserialize)]
struct CoinbaseAmount {
    amount: Decimal,
}

/// Coinbase public spot price API
pub struct CoinbaseVenue {
    base_url: String,
    http_client: Client,
}

impl CoinbaseVenue {
    pub fn new(settings: &OracleSettings) -> Result<Self, ExchangeError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent("spot-trader/0.1")
            .build()?;
        Ok(Self {
            base_url: settings.coinbase_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// `SOLUSDT` maps to `SOL-USD`
    fn product(symbol: &str) -> Result<String, ExchangeError> {
        let (base, _) =
            split_symbol(symbol).ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        Ok(format!("{}-USD", base))
    }
}

#[async_trait]
impl PriceVenue for CoinbaseVenue {
    fn name(&self) -> &str {
        "coinbase"
    }

    async fn spot_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/v2/prices/{}/spot", self.base_url, Self::product(symbol)?);
        let response = self.http_client.get(&url).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            return Err(ExchangeError::Transport(format!(
                "coinbase returned status {}",
                status
            )));
        }

        let spot: CoinbaseSpot = response
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;
        Ok(spot.data.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedVenue(Result<Decimal, ()>);

    #[async_trait]
    impl PriceVenue for FixedVenue {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn spot_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            self.0
                .map_err(|_| ExchangeError::Transport("connection refused".to_string()))
        }
    }

    fn oracle(venue: FixedVenue) -> PriceOracle {
        PriceOracle::new(Arc::new(venue), &OracleSettings::default())
    }

    #[tokio::test]
    async fn test_deviation_boundary() {
        // Exactly 0.5% passes
        assert!(oracle(FixedVenue(Ok(dec!(100.5)))).check_integrity("BTCUSDT", dec!(100)).await);
        assert!(oracle(FixedVenue(Ok(dec!(99.5)))).check_integrity("BTCUSDT", dec!(100)).await);
        // Just beyond fails
        assert!(!oracle(FixedVenue(Ok(dec!(100.51)))).check_integrity("BTCUSDT", dec!(100)).await);
        assert!(!oracle(FixedVenue(Ok(dec!(99.49)))).check_integrity("BTCUSDT", dec!(100)).await);
    }

    #[tokio::test]
    async fn test_venue_outage_fails_open() {
        let check = oracle(FixedVenue(Err(()))).assess("ETHUSDT", dec!(2500)).await;
        assert!(matches!(check, IntegrityCheck::Unverified { .. }));
        assert!(check.passed());
    }

    #[tokio::test]
    async fn test_non_positive_primary_is_anomaly() {
        assert!(!oracle(FixedVenue(Ok(dec!(1)))).check_integrity("ETHUSDT", dec!(0)).await);
    }

    #[tokio::test]
    async fn test_coinbase_venue_parses_spot_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/prices/SOL-USD/spot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"amount": "151.23", "base": "SOL", "currency": "USD"}
            })))
            .mount(&server)
            .await;

        let venue = CoinbaseVenue::new(&OracleSettings {
            coinbase_url: server.uri(),
            ..OracleSettings::default()
        })
        .unwrap();
        assert_eq!(venue.spot_price("SOLUSDT").await.unwrap(), dec!(151.23));
        assert!(matches!(
            venue.spot_price("XYZ").await,
            Err(ExchangeError::UnknownSymbol(_))
        ));
    }

    #[tokio::test]
    async fn test_coinbase_server_error_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let settings = OracleSettings {
            coinbase_url: server.uri(),
            ..OracleSettings::default()
        };
        let oracle = PriceOracle::new(Arc::new(CoinbaseVenue::new(&settings).unwrap()), &settings);
        assert!(oracle.check_integrity("BTCUSDT", dec!(60000)).await);
    }
}
