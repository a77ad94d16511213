//! Binance spot REST and kline stream client
//!
//! All REST traffic goes through [`BinanceClient::execute`], which applies the
//! process-wide rate limiter (a semaphore plus a minimum spacing between
//! requests), signs private endpoints with HMAC-SHA256 and retries transient
//! failures of idempotent reads with bounded exponential backoff. Orders are
//! never retried.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::ExchangeClient;
use crate::amount::SymbolFilters;
use crate::config::ExchangeSettings;
use crate::error::ExchangeError;
use crate::types::{AccountBalance, Bar, KlineEvent, OrderResult, OrderSide, OrderStatus};

type HmacSha256 = Hmac<Sha256>;

/// Initial retry delay; doubled per attempt
const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Reconnect delay bounds for the kline stream
const STREAM_MIN_BACKOFF: Duration = Duration::from_secs(1);
const STREAM_MAX_BACKOFF: Duration = Duration::from_secs(60);

const STREAM_CHANNEL_CAPACITY: usize = 1000;

/// API key pair, read from the environment only
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// `BINANCE_API_KEY` / `BINANCE_API_SECRET`; `None` if either is unset
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").ok()?;
        let api_secret = std::env::var("BINANCE_API_SECRET").ok()?;
        if api_key.is_empty() || api_secret.is_empty() {
            return None;
        }
        Some(Self::new(api_key, api_secret))
    }

    /// Hex HMAC-SHA256 of the query string
    pub fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &format!("{}...", &self.api_key.chars().take(4).collect::<String>()))
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// How a request is sent
#[derive(Debug, Clone, Copy, PartialEq)]
enum Access {
    Public,
    Signed,
}

pub struct BinanceClient {
    http: Client,
    rest_url: String,
    ws_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    rate_limiter: Semaphore,
    last_request: Mutex<Instant>,
    min_spacing: Duration,
    max_retries: u32,
    request_timeout: Duration,
    filters: Mutex<HashMap<String, SymbolFilters>>,
}

impl BinanceClient {
    pub fn new(
        settings: &ExchangeSettings,
        credentials: Option<Credentials>,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .pool_max_idle_per_host(settings.max_concurrent_requests.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        info!(
            "Binance client initialized: rest={}, signed={}, max_concurrent={}",
            settings.rest_url,
            credentials.is_some(),
            settings.max_concurrent_requests
        );

        Ok(Self {
            http,
            rest_url: settings.rest_url.trim_end_matches('/').to_string(),
            ws_url: settings.ws_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms: settings.recv_window_ms,
            rate_limiter: Semaphore::new(settings.max_concurrent_requests.max(1)),
            last_request: Mutex::new(Instant::now() - Duration::from_secs(10)),
            min_spacing: Duration::from_millis(settings.min_request_spacing_ms),
            max_retries: settings.max_retries,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            filters: Mutex::new(HashMap::new()),
        })
    }

    /// Rate-limited request with signing and retry of idempotent calls
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        access: Access,
    ) -> Result<T, ExchangeError> {
        let idempotent = method == Method::GET;
        let max_attempts = if idempotent { self.max_retries + 1 } else { 1 };
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.send_once(&method, path, params, access).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = match &e {
                        ExchangeError::RateLimited {
                            retry_after: Some(secs),
                        } => Duration::from_secs(*secs).min(Duration::from_millis(RETRY_MAX_DELAY_MS)),
                        _ => retry_delay(attempt),
                    };
                    warn!(
                        "{} {} failed (attempt {}/{}): {}; retrying in {:?}",
                        method, path, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        params: &[(&str, String)],
        access: Access,
    ) -> Result<T, ExchangeError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        {
            let mut last = self.last_request.lock().await;
            let elapsed = last.elapsed();
            if elapsed < self.min_spacing {
                tokio::time::sleep(self.min_spacing - elapsed).await;
            }
            *last = Instant::now();
        }

        let mut query = encode_query(params);
        let mut request = match access {
            Access::Public => self.http.request(method.clone(), self.url(path, &query)),
            Access::Signed => {
                let credentials = self.credentials.as_ref().ok_or_else(|| {
                    ExchangeError::Auth("BINANCE_API_KEY / BINANCE_API_SECRET not set".to_string())
                })?;
                if !query.is_empty() {
                    query.push('&');
                }
                query.push_str(&format!(
                    "recvWindow={}&timestamp={}",
                    self.recv_window_ms,
                    Utc::now().timestamp_millis()
                ));
                let signature = credentials.sign(&query)?;
                query.push_str(&format!("&signature={}", signature));
                self.http
                    .request(method.clone(), self.url(path, &query))
                    .header("X-MBX-APIKEY", &credentials.api_key)
            }
        };
        request = request.timeout(self.request_timeout);

        let started = Instant::now();
        let response = match tokio::time::timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(ExchangeError::Timeout(self.request_timeout)),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ExchangeError::Timeout(self.request_timeout)),
        };
        debug!("{} {} -> {} in {:?}", method, path, response.status(), started.elapsed());

        decode(response).await
    }

    fn url(&self, path: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query)
        }
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn retry_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis((RETRY_BASE_DELAY_MS.saturating_mul(factor)).min(RETRY_MAX_DELAY_MS))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Map HTTP status and body onto the error taxonomy
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
    let status = response.status();

    if status.as_u16() == 429 || status.as_u16() == 418 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(ExchangeError::RateLimited { retry_after });
    }

    let body = response.text().await?;

    if status.is_server_error() {
        return Err(ExchangeError::Transport(format!(
            "server error {}: {}",
            status,
            truncate(&body)
        )));
    }

    if !status.is_success() {
        return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(api) => ExchangeError::Rejected {
                code: api.code,
                message: api.msg,
            },
            Err(_) => ExchangeError::Rejected {
                code: status.as_u16() as i64,
                message: truncate(&body).to_string(),
            },
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| ExchangeError::Decode(format!("{} in {}", e, truncate(&body))))
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, ExchangeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ExchangeError::Decode(format!("invalid timestamp {}", ms)))
}

/// One row of GET /api/v3/klines
#[derive(Debug, Deserialize)]
struct RawKline(
    i64,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    i64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

impl RawKline {
    fn into_bar(self) -> Result<Bar, ExchangeError> {
        Ok(Bar {
            open_time: millis_to_utc(self.0)?,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            close_time: millis_to_utc(self.6)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    symbol: String,
    order_id: i64,
    transact_time: i64,
    executed_qty: Decimal,
    cummulative_quote_qty: Decimal,
    status: OrderStatus,
    side: OrderSide,
    #[serde(default)]
    fills: Vec<RawFill>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFill {
    commission: Decimal,
    commission_asset: String,
}

impl RawOrder {
    fn into_result(self) -> Result<OrderResult, ExchangeError> {
        let avg_price = if self.executed_qty > Decimal::ZERO {
            self.cummulative_quote_qty / self.executed_qty
        } else {
            Decimal::ZERO
        };
        Ok(OrderResult {
            order_id: self.order_id.to_string(),
            symbol: self.symbol,
            side: self.side,
            status: self.status,
            executed_qty: self.executed_qty,
            avg_price,
            quote_qty: self.cummulative_quote_qty,
            commission: self.fills.iter().map(|f| f.commission).sum(),
            commission_asset: self.fills.first().map(|f| f.commission_asset.clone()),
            transact_time: millis_to_utc(self.transact_time)?,
            dry_run: false,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<Filter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum Filter {
    #[serde(rename = "PRICE_FILTER")]
    Price {
        #[serde(rename = "tickSize")]
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE")]
    Lot {
        #[serde(rename = "stepSize")]
        step_size: Decimal,
        #[serde(rename = "minQty")]
        min_qty: Decimal,
    },
    #[serde(rename = "NOTIONAL")]
    Notional {
        #[serde(rename = "minNotional")]
        min_notional: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "minNotional")]
        min_notional: Decimal,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    fn into_filters(self) -> Result<SymbolFilters, ExchangeError> {
        let mut tick_size = Decimal::ZERO;
        let mut lot: Option<(Decimal, Decimal)> = None;
        let mut min_notional = Decimal::ZERO;

        for filter in self.filters {
            match filter {
                Filter::Price { tick_size: t } => tick_size = t,
                Filter::Lot { step_size, min_qty } => lot = Some((step_size, min_qty)),
                Filter::Notional { min_notional: n } | Filter::MinNotional { min_notional: n } => {
                    min_notional = min_notional.max(n)
                }
                Filter::Other => {}
            }
        }

        let (step_size, min_qty) = lot.ok_or_else(|| {
            ExchangeError::Decode(format!("{} has no LOT_SIZE filter", self.symbol))
        })?;

        Ok(SymbolFilters {
            symbol: self.symbol,
            step_size: step_size.normalize(),
            tick_size: tick_size.normalize(),
            min_qty: min_qty.normalize(),
            min_notional: min_notional.normalize(),
        })
    }
}

/// Kline stream envelope
#[derive(Debug, Deserialize)]
struct StreamKlineEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: StreamKline,
}

#[derive(Debug, Deserialize)]
struct StreamKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "x")]
    is_closed: bool,
}

impl StreamKlineEvent {
    fn into_event(self) -> Result<KlineEvent, ExchangeError> {
        Ok(KlineEvent {
            symbol: self.symbol,
            is_closed: self.kline.is_closed,
            event_time: millis_to_utc(self.event_time)?,
            bar: Bar {
                open_time: millis_to_utc(self.kline.open_time)?,
                close_time: millis_to_utc(self.kline.close_time)?,
                open: self.kline.open,
                high: self.kline.high,
                low: self.kline.low,
                close: self.kline.close,
                volume: self.kline.volume,
            },
        })
    }
}

/// Parse one stream text frame
fn parse_kline_message(text: &str) -> Result<KlineEvent, ExchangeError> {
    serde_json::from_str::<StreamKlineEvent>(text)
        .map_err(|e| ExchangeError::Decode(e.to_string()))?
        .into_event()
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let rows: Vec<RawKline> = self
            .execute(
                Method::GET,
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("interval", interval.to_string()),
                    ("limit", limit.clamp(1, 1000).to_string()),
                ],
                Access::Public,
            )
            .await?;
        rows.into_iter().map(RawKline::into_bar).collect()
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let ticker: TickerPrice = self
            .execute(
                Method::GET,
                "/api/v3/ticker/price",
                &[("symbol", symbol.to_uppercase())],
                Access::Public,
            )
            .await?;
        Ok(ticker.price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }

        info!("Submitting MARKET {} {} {}", side, quantity, symbol);
        let order: RawOrder = self
            .execute(
                Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("side", side.as_str().to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity.normalize().to_string()),
                    ("newOrderRespType", "FULL".to_string()),
                ],
                Access::Signed,
            )
            .await?;
        order.into_result()
    }

    async fn get_account_balances(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let account: AccountInfo = self
            .execute(Method::GET, "/api/v3/account", &[], Access::Signed)
            .await?;
        Ok(account
            .balances
            .into_iter()
            .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
            .map(|b| AccountBalance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
            })
            .collect())
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let symbol = symbol.to_uppercase();
        if let Some(cached) = self.filters.lock().await.get(&symbol) {
            return Ok(cached.clone());
        }

        let info: ExchangeInfo = self
            .execute(
                Method::GET,
                "/api/v3/exchangeInfo",
                &[("symbol", symbol.clone())],
                Access::Public,
            )
            .await?;
        let info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.clone()))?;
        let filters = info.into_filters()?;

        debug!(
            "{} filters: step={} tick={} min_qty={} min_notional={}",
            symbol, filters.step_size, filters.tick_size, filters.min_qty, filters.min_notional
        );
        self.filters.lock().await.insert(symbol, filters.clone());
        Ok(filters)
    }

    async fn stream_klines(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<mpsc::Receiver<KlineEvent>, ExchangeError> {
        let url = format!(
            "{}/ws/{}@kline_{}",
            self.ws_url,
            symbol.to_lowercase(),
            interval
        );
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(run_kline_stream(url, symbol.to_uppercase(), tx));
        Ok(rx)
    }
}

/// Reconnecting stream loop; ends when the receiver is dropped
async fn run_kline_stream(url: String, symbol: String, tx: mpsc::Sender<KlineEvent>) {
    let mut backoff = STREAM_MIN_BACKOFF;

    loop {
        match stream_once(&url, &tx).await {
            Ok(()) => {
                info!("{} kline stream closed", symbol);
                backoff = STREAM_MIN_BACKOFF;
            }
            Err(e) => error!("{} kline stream error: {}", symbol, e),
        }

        if tx.is_closed() {
            debug!("{} kline receiver dropped, stream task exiting", symbol);
            return;
        }

        info!("Reconnecting {} kline stream in {:?}", symbol, backoff);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = tx.closed() => return,
        }
        backoff = (backoff * 2).min(STREAM_MAX_BACKOFF);
    }
}

async fn stream_once(url: &str, tx: &mpsc::Sender<KlineEvent>) -> Result<(), ExchangeError> {
    let (ws, _) = tokio::time::timeout(Duration::from_secs(10), connect_async(url))
        .await
        .map_err(|_| ExchangeError::Timeout(Duration::from_secs(10)))?
        .map_err(|e| ExchangeError::Transport(e.to_string()))?;
    info!("Connected to {}", url);

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_kline_message(&text) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => debug!("Ignoring unrecognized stream message: {}", e),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return Err(ExchangeError::Transport(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ExchangeError::Transport(e.to_string())),
            },
            _ = tx.closed() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(url: &str) -> ExchangeSettings {
        ExchangeSettings {
            rest_url: url.to_string(),
            min_request_spacing_ms: 0,
            max_retries: 2,
            request_timeout_secs: 2,
            ..ExchangeSettings::default()
        }
    }

    fn signed_client(url: &str) -> BinanceClient {
        BinanceClient::new(&settings(url), Some(Credentials::new("test-key", "test-secret"))).unwrap()
    }

    #[test]
    fn test_signature_matches_documented_example() {
        let credentials = Credentials::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            credentials.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
        assert!(!format!("{:?}", credentials).contains("NhqPtmd"));
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        assert_eq!(retry_delay(1), Duration::from_millis(250));
        assert_eq!(retry_delay(2), Duration::from_millis(500));
        assert_eq!(retry_delay(30), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_get_klines_decodes_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("interval", "15m"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                [1700000000000i64, "37000.10", "37100.00", "36950.00", "37050.50", "12.5",
                 1700000899999i64, "463000.0", 1500, "6.1", "226000.0", "0"]
            ])))
            .mount(&server)
            .await;

        let client = BinanceClient::new(&settings(&server.uri()), None).unwrap();
        let bars = client.get_klines("btcusdt", "15m", 1).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, dec!(37050.50));
        assert_eq!(bars[0].open_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_transient_get_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"symbol": "USDCUSDT", "price": "0.99990000"})),
            )
            .mount(&server)
            .await;

        let client = BinanceClient::new(&settings(&server.uri()), None).unwrap();
        assert_eq!(client.get_price("USDCUSDT").await.unwrap(), dec!(0.9999));
    }

    #[tokio::test]
    async fn test_order_is_signed_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .and(header("X-MBX-APIKEY", "test-key"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_client(&server.uri());
        let err = client
            .place_market_order("SOLUSDT", OrderSide::Buy, dec!(0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));

        let requests = server.received_requests().await.unwrap();
        let query = requests[0].url.query().unwrap_or_default().to_string();
        assert!(query.contains("type=MARKET"));
        assert!(query.contains("timestamp="));
        assert!(query.contains("signature="));
    }

    #[tokio::test]
    async fn test_rejection_is_surfaced_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2010,
                "msg": "Account has insufficient balance for requested action."
            })))
            .mount(&server)
            .await;

        let client = signed_client(&server.uri());
        match client.place_market_order("SOLUSDT", OrderSide::Buy, dec!(100)).await {
            Err(ExchangeError::Rejected { code, message }) => {
                assert_eq!(code, -2010);
                assert_eq!(message, "Account has insufficient balance for requested action.");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_filled_order_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "SOLUSDT",
                "orderId": 28,
                "orderListId": -1,
                "clientOrderId": "6gCrw2kRUAF9CvJDGP16IP",
                "transactTime": 1700000000123i64,
                "price": "0.00000000",
                "origQty": "2.00000000",
                "executedQty": "2.00000000",
                "cummulativeQuoteQty": "301.00000000",
                "status": "FILLED",
                "timeInForce": "GTC",
                "type": "MARKET",
                "side": "BUY",
                "fills": [
                    {"price": "150.00", "qty": "1.0", "commission": "0.001", "commissionAsset": "SOL", "tradeId": 56},
                    {"price": "151.00", "qty": "1.0", "commission": "0.001", "commissionAsset": "SOL", "tradeId": 57}
                ]
            })))
            .mount(&server)
            .await;

        let result = signed_client(&server.uri())
            .place_market_order("SOLUSDT", OrderSide::Buy, dec!(2))
            .await
            .unwrap();
        assert!(result.is_filled());
        assert_eq!(result.order_id, "28");
        assert_eq!(result.avg_price, dec!(150.5));
        assert_eq!(result.commission, dec!(0.002));
        assert_eq!(result.commission_asset.as_deref(), Some("SOL"));
        assert!(!result.dry_run);
    }

    #[tokio::test]
    async fn test_signed_call_without_credentials_fails() {
        let client = BinanceClient::new(&settings("http://127.0.0.1:9"), None).unwrap();
        assert!(matches!(
            client.get_account_balances().await,
            Err(ExchangeError::Auth(_))
        ));
        assert!(matches!(
            client.place_market_order("SOLUSDT", OrderSide::Sell, dec!(0)).await,
            Err(ExchangeError::InvalidOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/account"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let err = signed_client(&server.uri()).get_account_balances().await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited { retry_after: Some(0) }));
    }

    #[tokio::test]
    async fn test_symbol_filters_are_parsed_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "timezone": "UTC",
                "symbols": [{
                    "symbol": "SOLUSDT",
                    "status": "TRADING",
                    "filters": [
                        {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "10000.00", "tickSize": "0.01000000"},
                        {"filterType": "LOT_SIZE", "minQty": "0.00100000", "maxQty": "90000.0", "stepSize": "0.00100000"},
                        {"filterType": "ICEBERG_PARTS", "limit": 10},
                        {"filterType": "NOTIONAL", "minNotional": "5.00000000", "applyMinToMarket": true}
                    ]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = BinanceClient::new(&settings(&server.uri()), None).unwrap();
        let filters = client.get_symbol_filters("SOLUSDT").await.unwrap();
        assert_eq!(filters.step_size, dec!(0.001));
        assert_eq!(filters.tick_size, dec!(0.01));
        assert_eq!(filters.min_notional, dec!(5));

        // Second call served from cache
        assert_eq!(client.get_symbol_filters("solusdt").await.unwrap(), filters);
    }

    #[test]
    fn test_parse_kline_message() {
        let event = parse_kline_message(
            r#"{"e":"kline","E":1700000900000,"s":"SOLUSDT","k":{"t":1700000000000,"T":1700000899999,
            "s":"SOLUSDT","i":"15m","f":100,"L":200,"o":"150.00","c":"152.10","h":"152.50","l":"149.80",
            "v":"1000","n":100,"x":true,"q":"151000","V":"500","Q":"75500","B":"0"}}"#,
        )
        .unwrap();
        assert_eq!(event.symbol, "SOLUSDT");
        assert!(event.is_closed);
        assert_eq!(event.bar.close, dec!(152.10));
        assert!(parse_kline_message(r#"{"result":null,"id":1}"#).is_err());
    }
}
