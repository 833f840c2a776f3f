//! Binance gateway: spot + USDT-margined perpetuals.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::ExchangeConfig;
use crate::exchange::limiter::{backoff_delay, RateLimiter, MAX_QUERY_ATTEMPTS};
use crate::exchange::{
    AccountState, ExchangeGateway, GatewayError, InstrumentRules, OrderFill, OrderSide, Symbol,
    Ticker, Venue, Wallet,
};
use crate::utils::decimal::conforms_to_step;

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request budget: Binance weight limits allow far more, but the
/// daemon's traffic is light and a conservative bucket keeps bursts flat.
const LIMITER_CAPACITY: u32 = 20;
const LIMITER_REFILL_PER_SEC: f64 = 10.0;

// Taker fee schedule (VIP 0).
const SPOT_TAKER_FEE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
const PERP_TAKER_FEE: Decimal = Decimal::from_parts(4, 0, 0, false, 4); // 0.0004

/// Rate-limited, retrying facade over Binance spot + futures REST.
pub struct BinanceGateway {
    http: Client,
    api_key: String,
    secret_key: String,
    futures_base_url: String,
    spot_base_url: String,
    limiter: RateLimiter,
    rules_cache: Mutex<HashMap<(Venue, String), InstrumentRules>>,
}

impl BinanceGateway {
    pub fn new(config: &ExchangeConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to create HTTP client: {e}")))?;

        let (futures_base_url, spot_base_url) = if config.testnet {
            (FUTURES_TESTNET_URL.to_string(), SPOT_TESTNET_URL.to_string())
        } else {
            (FUTURES_BASE_URL.to_string(), SPOT_BASE_URL.to_string())
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.api_secret.clone(),
            futures_base_url,
            spot_base_url,
            limiter: RateLimiter::new(LIMITER_CAPACITY, LIMITER_REFILL_PER_SEC),
            rules_cache: Mutex::new(HashMap::new()),
        })
    }

    /// HMAC-SHA256 signature over the query string.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    fn base_url(&self, venue: Venue) -> &str {
        match venue {
            Venue::Spot => &self.spot_base_url,
            Venue::Perp => &self.futures_base_url,
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> GatewayError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            GatewayError::Transient(format!("{status}: {body}"))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            GatewayError::Auth(format!("{status}: {body}"))
        } else {
            GatewayError::Validation(format!("{status}: {body}"))
        }
    }

    /// GET with the query retry policy: throttles, timeouts, and 5xx are
    /// retried with exponential backoff up to the attempt budget.
    async fn get_query<T: DeserializeOwned>(
        &self,
        venue: Venue,
        path: &str,
        query: Option<&str>,
        signed: bool,
    ) -> Result<T, GatewayError> {
        let mut last_err = GatewayError::Transient("no attempts made".into());

        for attempt in 0..MAX_QUERY_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                debug!(path, attempt, delay_ms = delay.as_millis() as u64, "retrying query");
                tokio::time::sleep(delay).await;
            }

            self.limiter.acquire().await;

            let url = self.build_url(venue, path, query, signed);
            let mut request = self.http.get(&url).timeout(QUERY_TIMEOUT);
            if signed {
                request = request.header("X-MBX-APIKEY", &self.api_key);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = GatewayError::Transient(format!("request failed: {e}"));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| GatewayError::Fatal(format!("unexpected response shape: {e}")));
            }

            let body = response.text().await.unwrap_or_default();
            let err = Self::classify_status(status, &body);
            if err.is_transient() {
                last_err = err;
                continue;
            }
            return Err(err);
        }

        warn!(path, "query retry budget exhausted");
        Err(last_err)
    }

    /// Signed POST for writes. Retried only when the response proves the
    /// order was not accepted (throttled before placement). Network errors
    /// and timeouts mid-flight fail immediately as ambiguous.
    async fn post_write<T: DeserializeOwned>(
        &self,
        venue: Venue,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        for attempt in 0..MAX_QUERY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            self.limiter.acquire().await;

            let mut query_string: String = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            query_string.push_str(&format!("&timestamp={}", Self::timestamp()));
            let signature = self.sign(&query_string);
            let url = format!(
                "{}{}?{}&signature={}",
                self.base_url(venue),
                path,
                query_string,
                signature
            );

            let response = match self
                .http
                .post(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .timeout(WRITE_TIMEOUT)
                .send()
                .await
            {
                Ok(r) => r,
                // The request may or may not have reached the matching
                // engine; surface immediately, never resend.
                Err(e) => return Err(GatewayError::AmbiguousWrite(format!("{e}"))),
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| GatewayError::Fatal(format!("unexpected response shape: {e}")));
            }

            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                // Throttled before placement: proven not accepted.
                warn!(path, attempt, "write throttled before placement, backing off");
                continue;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(GatewayError::Auth(format!("{status}: {body}")));
            }
            if status.is_server_error() {
                return Err(GatewayError::AmbiguousWrite(format!("{status}: {body}")));
            }
            return Err(GatewayError::RejectedPrePlace(format!("{status}: {body}")));
        }

        Err(GatewayError::RejectedPrePlace(
            "write throttle retry budget exhausted".into(),
        ))
    }

    fn build_url(&self, venue: Venue, path: &str, query: Option<&str>, signed: bool) -> String {
        let base = self.base_url(venue);
        match (query, signed) {
            (Some(q), true) => {
                let q = format!("{q}&timestamp={}", Self::timestamp());
                let sig = self.sign(&q);
                format!("{base}{path}?{q}&signature={sig}")
            }
            (None, true) => {
                let q = format!("timestamp={}", Self::timestamp());
                let sig = self.sign(&q);
                format!("{base}{path}?{q}&signature={sig}")
            }
            (Some(q), false) => format!("{base}{path}?{q}"),
            (None, false) => format!("{base}{path}"),
        }
    }

    async fn rules_for(
        &self,
        venue: Venue,
        symbol: &Symbol,
    ) -> Result<InstrumentRules, GatewayError> {
        {
            let cache = self.rules_cache.lock().await;
            if let Some(rules) = cache.get(&(venue, symbol.market_name())) {
                return Ok(rules.clone());
            }
        }

        let path = match venue {
            Venue::Spot => "/api/v3/exchangeInfo",
            Venue::Perp => "/fapi/v1/exchangeInfo",
        };
        let info: ExchangeInfoResponse = self.get_query(venue, path, None, false).await?;

        let entry = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol.market_name())
            .ok_or_else(|| {
                GatewayError::Validation(format!("unknown {venue} symbol {symbol}"))
            })?;

        let mut min_qty = Decimal::ZERO;
        let mut step_size = Decimal::ZERO;
        let mut tick_size = Decimal::ZERO;
        for filter in entry.filters {
            match filter {
                SymbolFilter::LotSize {
                    min_qty: mq,
                    step_size: ss,
                } => {
                    min_qty = mq;
                    step_size = ss;
                }
                SymbolFilter::PriceFilter { tick_size: ts } => tick_size = ts,
                SymbolFilter::Unknown => {}
            }
        }

        let rules = InstrumentRules {
            min_qty,
            step_size,
            tick_size,
        };
        self.rules_cache
            .lock()
            .await
            .insert((venue, symbol.market_name()), rules.clone());
        Ok(rules)
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    #[instrument(skip(self))]
    async fn list_perp_symbols(&self, quote: &str) -> Result<Vec<Symbol>, GatewayError> {
        let info: ExchangeInfoResponse = self
            .get_query(Venue::Perp, "/fapi/v1/exchangeInfo", None, false)
            .await?;

        let mut symbols = Vec::new();
        for entry in info.symbols {
            if entry.contract_type.as_deref() != Some("PERPETUAL")
                || entry.status != "TRADING"
                || entry.quote_asset != quote
            {
                continue;
            }
            match Symbol::new(&entry.base_asset, &entry.quote_asset) {
                Ok(s) => symbols.push(s),
                Err(e) => debug!(symbol = %entry.symbol, error = %e, "skipping unparseable symbol"),
            }
        }
        Ok(symbols)
    }

    #[instrument(skip(self))]
    async fn fetch_funding_rate(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        let query = format!("symbol={}", symbol.market_name());
        let index: PremiumIndex = self
            .get_query(Venue::Perp, "/fapi/v1/premiumIndex", Some(&query), false)
            .await?;
        Ok(index.last_funding_rate)
    }

    #[instrument(skip(self))]
    async fn fetch_ticker(&self, venue: Venue, symbol: &Symbol) -> Result<Ticker, GatewayError> {
        let path = match venue {
            Venue::Spot => "/api/v3/ticker/bookTicker",
            Venue::Perp => "/fapi/v1/ticker/bookTicker",
        };
        let query = format!("symbol={}", symbol.market_name());
        let book: BookTicker = self.get_query(venue, path, Some(&query), false).await?;
        Ok(Ticker {
            bid: book.bid_price,
            ask: book.ask_price,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_24h_volume(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        let query = format!("symbol={}", symbol.market_name());
        let ticker: Ticker24h = self
            .get_query(Venue::Perp, "/fapi/v1/ticker/24hr", Some(&query), false)
            .await?;
        Ok(ticker.quote_volume)
    }

    async fn fetch_instrument_rules(
        &self,
        venue: Venue,
        symbol: &Symbol,
    ) -> Result<InstrumentRules, GatewayError> {
        self.rules_for(venue, symbol).await
    }

    #[instrument(skip(self))]
    async fn place_market_order(
        &self,
        venue: Venue,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError> {
        if quantity <= Decimal::ZERO {
            return Err(GatewayError::Validation(format!(
                "non-positive quantity {quantity}"
            )));
        }

        let rules = self.rules_for(venue, symbol).await?;
        if !conforms_to_step(quantity, rules.step_size) {
            return Err(GatewayError::InvalidQuantity {
                quantity,
                step: rules.step_size,
            });
        }

        let side_str = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };

        match venue {
            Venue::Perp => {
                let params = [
                    ("symbol", symbol.market_name()),
                    ("side", side_str.to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity.to_string()),
                ];
                let resp: FuturesOrderResponse =
                    self.post_write(Venue::Perp, "/fapi/v1/order", &params).await?;
                if resp.executed_qty.is_zero() {
                    return Err(GatewayError::RejectedPrePlace(format!(
                        "market order got zero fill (status {})",
                        resp.status
                    )));
                }
                let avg_price = if resp.avg_price.is_zero() && !resp.executed_qty.is_zero() {
                    resp.cum_quote / resp.executed_qty
                } else {
                    resp.avg_price
                };
                Ok(OrderFill {
                    quantity: resp.executed_qty,
                    avg_price,
                    fee: resp.executed_qty * avg_price * PERP_TAKER_FEE,
                })
            }
            Venue::Spot => {
                let params = [
                    ("symbol", symbol.market_name()),
                    ("side", side_str.to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity.to_string()),
                    ("newOrderRespType", "RESULT".to_string()),
                ];
                let resp: SpotOrderResponse =
                    self.post_write(Venue::Spot, "/api/v3/order", &params).await?;
                if resp.executed_qty.is_zero() {
                    return Err(GatewayError::RejectedPrePlace(format!(
                        "market order got zero fill (status {})",
                        resp.status
                    )));
                }
                let avg_price = resp.cummulative_quote_qty / resp.executed_qty;
                Ok(OrderFill {
                    quantity: resp.executed_qty,
                    avg_price,
                    fee: resp.cummulative_quote_qty * SPOT_TAKER_FEE,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn transfer(
        &self,
        from: Wallet,
        to: Wallet,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), GatewayError> {
        let transfer_type = match (from, to) {
            (Wallet::Spot, Wallet::Perp) => "MAIN_UMFUTURE",
            (Wallet::Perp, Wallet::Spot) => "UMFUTURE_MAIN",
            _ => {
                return Err(GatewayError::Validation(format!(
                    "unsupported transfer {from:?} -> {to:?}"
                )))
            }
        };
        let params = [
            ("type", transfer_type.to_string()),
            ("asset", asset.to_string()),
            ("amount", amount.to_string()),
        ];
        let _: TransferResponse = self
            .post_write(Venue::Spot, "/sapi/v1/asset/transfer", &params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_account(&self) -> Result<AccountState, GatewayError> {
        let account: FuturesAccountResponse = self
            .get_query(Venue::Perp, "/fapi/v2/account", None, true)
            .await?;
        Ok(AccountState::new(
            account.max_withdraw_amount,
            account.total_initial_margin,
            account.total_margin_balance,
        ))
    }

    #[instrument(skip(self))]
    async fn fetch_perp_position(&self, symbol: &Symbol) -> Result<Decimal, GatewayError> {
        let query = format!("symbol={}", symbol.market_name());
        let positions: Vec<PositionRisk> = self
            .get_query(Venue::Perp, "/fapi/v2/positionRisk", Some(&query), true)
            .await?;
        Ok(positions
            .iter()
            .map(|p| p.position_amt)
            .sum())
    }

    #[instrument(skip(self))]
    async fn fetch_spot_balance(&self, asset: &str) -> Result<Decimal, GatewayError> {
        let account: SpotAccountResponse = self
            .get_query(Venue::Spot, "/api/v3/account", None, true)
            .await?;
        Ok(account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }
}

// ==================== Wire types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeSymbol {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    status: String,
    #[serde(default)]
    contract_type: Option<String>,
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter {
        #[serde(with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    #[serde(with = "rust_decimal::serde::str")]
    last_funding_rate: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    #[serde(with = "rust_decimal::serde::str")]
    bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    ask_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    #[serde(with = "rust_decimal::serde::str")]
    quote_volume: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrderResponse {
    status: String,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    cum_quote: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotOrderResponse {
    status: String,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    cummulative_quote_qty: Decimal,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    #[allow(dead_code)]
    #[serde(rename = "tranId")]
    tran_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesAccountResponse {
    #[serde(with = "rust_decimal::serde::str")]
    total_initial_margin: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    total_margin_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    max_withdraw_amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    #[serde(with = "rust_decimal::serde::str")]
    position_amt: Decimal,
}

#[derive(Debug, Deserialize)]
struct SpotAccountResponse {
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_info_filter_parsing() {
        let raw = r#"{
            "symbols": [{
                "symbol": "DOGEUSDT",
                "baseAsset": "DOGE",
                "quoteAsset": "USDT",
                "status": "TRADING",
                "contractType": "PERPETUAL",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.00001", "minPrice": "0.00001"},
                    {"filterType": "LOT_SIZE", "minQty": "1", "maxQty": "10000000", "stepSize": "1"},
                    {"filterType": "MARKET_LOT_SIZE", "minQty": "1", "maxQty": "30000", "stepSize": "1"}
                ]
            }]
        }"#;

        let parsed: ExchangeInfoResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.symbols.len(), 1);
        let entry = &parsed.symbols[0];
        assert_eq!(entry.contract_type.as_deref(), Some("PERPETUAL"));
        assert!(matches!(
            entry.filters[0],
            SymbolFilter::PriceFilter { .. }
        ));
        assert!(matches!(entry.filters[1], SymbolFilter::LotSize { .. }));
        assert!(matches!(entry.filters[2], SymbolFilter::Unknown));
    }

    #[test]
    fn test_premium_index_parsing() {
        let raw = r#"{"symbol": "DOGEUSDT", "lastFundingRate": "0.00040000", "markPrice": "0.10030000"}"#;
        let parsed: PremiumIndex = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.last_funding_rate.to_string(), "0.00040000");
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            BinanceGateway::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            BinanceGateway::classify_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            BinanceGateway::classify_status(StatusCode::UNAUTHORIZED, ""),
            GatewayError::Auth(_)
        ));
        assert!(matches!(
            BinanceGateway::classify_status(StatusCode::BAD_REQUEST, ""),
            GatewayError::Validation(_)
        ));
    }
}
