use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

use crate::domain::{MarginMode, OrderSide, PositionSide, Symbol};
use crate::error::ExchangeError;
use crate::signing::build_signed_query;

const BASE_URL: &str = "https://open-api.bingx.com";
const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The raw `{code, msg, data}` envelope every endpoint returns.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub code: i64,
    pub msg: String,
    pub data: Value,
}

impl ApiResponse {
    fn from_json(v: Value) -> Self {
        let code = v.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let msg = v
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = v.get("data").cloned().unwrap_or(Value::Null);
        Self { code, msg, data }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// One open position as reported by `get_positions`.
#[derive(Debug, Clone)]
pub struct RemotePosition {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub qty: Decimal,
    pub mark_price: Decimal,
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub isolated: bool,
}

/// Exchange operations needed by the sync engine. Implemented once against
/// the live REST API and once in-memory for tests.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_positions(&self) -> Result<Vec<RemotePosition>, ExchangeError>;

    async fn get_balance(&self, asset: &str) -> Result<crate::domain::Balance, ExchangeError>;

    /// `(leverage, tp, sl)` parsed out of open conditional orders for `symbol`.
    async fn get_trade_parameters(
        &self,
        symbol: &str,
    ) -> Result<(Option<u32>, Option<Decimal>, Option<Decimal>), ExchangeError>;

    async fn open_trade(
        &self,
        symbol: &str,
        position_side: PositionSide,
        qty: Decimal,
    ) -> Result<ApiResponse, ExchangeError>;

    async fn close_all(&self, symbol: &str) -> Result<ApiResponse, ExchangeError>;

    async fn close_partial(
        &self,
        symbol: &str,
        qty: Decimal,
        position_side: PositionSide,
    ) -> Result<ApiResponse, ExchangeError>;

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        position_side: PositionSide,
    ) -> Result<ApiResponse, ExchangeError>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<ApiResponse, ExchangeError>;
}

/// A BingX-style HMAC-SHA256 signed REST client. One pooled `reqwest::Client`
/// is shared by every instance constructed with `with_shared_http`.
pub struct RestExchangeClient {
    base_url: String,
    api_key: String,
    secret_key: String,
    http: reqwest::Client,
}

impl RestExchangeClient {
    pub fn new(api_key: String, secret_key: String, http: reqwest::Client) -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            api_key,
            secret_key,
            http,
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Signed request with BingX's retry/backoff/rate-limit policy.
    async fn send_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<ApiResponse, ExchangeError> {
        let mut wait = Duration::from_secs(1);
        // Tracks why the last attempt failed, so exhausting the retry budget
        // reports the actual failure mode instead of always blaming rate-limiting.
        let mut last_error = ExchangeError::RateLimited;

        for attempt in 1..=MAX_RETRIES {
            let query = build_signed_query(&self.secret_key, params.clone(), Self::now_ms());
            let url = format!("{}{}?{}", self.base_url, path, query);

            let resp = self
                .http
                .request(method.clone(), &url)
                .header("X-BX-APIKEY", &self.api_key)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    log::error!("[EXCHANGE] network error (attempt {attempt}/{MAX_RETRIES}): {e}");
                    last_error = ExchangeError::Network(e.to_string());
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let status = resp.status();
            let body: Value = match resp.json().await {
                Ok(v) => v,
                Err(_) => return Err(ExchangeError::Parse("invalid JSON response".into())),
            };

            if status.as_u16() == 429 {
                log::warn!("[EXCHANGE] rate limited (attempt {attempt}/{MAX_RETRIES}), waiting {wait:?}");
                last_error = ExchangeError::RateLimited;
                tokio::time::sleep(wait).await;
                wait = std::cmp::min(wait * 2, Duration::from_secs(10));
                continue;
            }

            let parsed = ApiResponse::from_json(body);
            if status.is_success() && parsed.is_ok() {
                return Ok(parsed);
            }

            log::warn!("[EXCHANGE] api error ({}): {} {}", status, parsed.code, parsed.msg);
            return Ok(parsed);
        }

        Err(last_error)
    }
}

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    async fn get_positions(&self) -> Result<Vec<RemotePosition>, ExchangeError> {
        let resp = self
            .send_request(
                reqwest::Method::GET,
                "/openApi/swap/v2/user/positions",
                vec![("recvWindow", "5000".to_string())],
            )
            .await?;

        if !resp.is_ok() {
            return Err(ExchangeError::Logical { code: resp.code, msg: resp.msg });
        }

        let entries = resp.data.as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            let qty: Decimal = e
                .get("positionAmt")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            if qty == Decimal::ZERO {
                continue;
            }
            let position_side = match e.get("positionSide").and_then(Value::as_str) {
                Some("SHORT") => PositionSide::Short,
                _ => PositionSide::Long,
            };
            out.push(RemotePosition {
                symbol: e.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string(),
                position_side,
                qty: qty.abs(),
                mark_price: e
                    .get("markPrice")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO),
                position_value: e
                    .get("positionValue")
                    .or_else(|| e.get("positionAmt"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO)
                    .abs(),
                unrealized_pnl: e
                    .get("unrealizedProfit")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Decimal::ZERO),
                isolated: e.get("isolated").and_then(Value::as_bool).unwrap_or(false),
            });
        }
        Ok(out)
    }

    async fn get_balance(&self, asset: &str) -> Result<crate::domain::Balance, ExchangeError> {
        let resp = self
            .send_request(
                reqwest::Method::GET,
                "/openApi/swap/v3/user/balance",
                vec![("recvWindow", "5000".to_string())],
            )
            .await?;

        if !resp.is_ok() {
            return Err(ExchangeError::Logical { code: resp.code, msg: resp.msg });
        }

        let entries = resp.data.as_array().cloned().unwrap_or_default();
        let entry = entries
            .into_iter()
            .find(|e| e.get("asset").and_then(Value::as_str) == Some(asset));

        let Some(entry) = entry else {
            return Ok(crate::domain::Balance::default());
        };

        let dec = |key: &str| -> Decimal {
            entry
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO)
        };

        Ok(crate::domain::Balance {
            available: dec("availableMargin"),
            equity: dec("equity"),
            used: dec("usedMargin"),
            total: dec("balance"),
        })
    }

    async fn get_trade_parameters(
        &self,
        symbol: &str,
    ) -> Result<(Option<u32>, Option<Decimal>, Option<Decimal>), ExchangeError> {
        let resp = self
            .send_request(
                reqwest::Method::GET,
                "/openApi/swap/v2/trade/openOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;

        if !resp.is_ok() {
            return Ok((None, None, None));
        }

        let orders = resp
            .data
            .get("orders")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut leverage = None;
        let mut tp = None;
        let mut sl = None;
        for order in orders {
            if order.get("symbol").and_then(Value::as_str) != Some(symbol) {
                continue;
            }
            if leverage.is_none() {
                if let Some(lev) = order.get("leverage").and_then(Value::as_str) {
                    leverage = lev.trim_end_matches(['X', 'x']).parse().ok();
                }
            }
            match order.get("type").and_then(Value::as_str) {
                Some("TAKE_PROFIT_MARKET") => {
                    tp = order
                        .get("stopPrice")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok());
                }
                Some("STOP_MARKET") => {
                    sl = order
                        .get("stopPrice")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }

        Ok((leverage, tp, sl))
    }

    async fn open_trade(
        &self,
        symbol: &str,
        position_side: PositionSide,
        qty: Decimal,
    ) -> Result<ApiResponse, ExchangeError> {
        let side = match position_side.open_order_side() {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let position_side_str = match position_side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };
        self.send_request(
            reqwest::Method::POST,
            "/openApi/swap/v2/trade/order",
            vec![
                ("symbol", symbol.to_string()),
                ("side", side.to_string()),
                ("positionSide", position_side_str.to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", format!("{:.8}", qty)),
            ],
        )
        .await
    }

    async fn close_all(&self, symbol: &str) -> Result<ApiResponse, ExchangeError> {
        self.send_request(
            reqwest::Method::POST,
            "/openApi/swap/v2/trade/closeAllPositions",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    async fn close_partial(
        &self,
        symbol: &str,
        qty: Decimal,
        position_side: PositionSide,
    ) -> Result<ApiResponse, ExchangeError> {
        let close_side = match position_side.close_order_side() {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let position_side_str = match position_side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };
        self.send_request(
            reqwest::Method::POST,
            "/openApi/swap/v2/trade/order",
            vec![
                ("symbol", symbol.to_string()),
                ("side", close_side.to_string()),
                ("positionSide", position_side_str.to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", format!("{:.8}", qty)),
                ("recvWindow", "10000".to_string()),
            ],
        )
        .await
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        position_side: PositionSide,
    ) -> Result<ApiResponse, ExchangeError> {
        let position_side_str = match position_side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };
        self.send_request(
            reqwest::Method::POST,
            "/openApi/swap/v2/trade/leverage",
            vec![
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
                ("side", position_side_str.to_string()),
            ],
        )
        .await
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<ApiResponse, ExchangeError> {
        let margin_type = match mode {
            MarginMode::Cross => "CROSSED",
            MarginMode::Isolated => "ISOLATED",
        };
        self.send_request(
            reqwest::Method::POST,
            "/openApi/swap/v2/trade/marginType",
            vec![
                ("symbol", symbol.to_string()),
                ("marginType", margin_type.to_string()),
                ("recvWindow", "60000".to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_positions_skips_zero_qty_and_parses_side() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Regex(r"^/openApi/swap/v2/user/positions".into()))
            .with_status(200)
            .with_body(
                r#"{"code":0,"msg":"","data":[
                    {"symbol":"BTC-USDT","positionSide":"LONG","positionAmt":"1.0","markPrice":"50000","positionValue":"50000","unrealizedProfit":"10","isolated":false},
                    {"symbol":"ETH-USDT","positionSide":"SHORT","positionAmt":"0","markPrice":"3000","positionValue":"0","unrealizedProfit":"0","isolated":true}
                ]}"#,
            )
            .create_async()
            .await;

        let client = RestExchangeClient::new("key".into(), "secret".into(), reqwest::Client::new())
            .with_base_url(server.url());

        let positions = client.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC-USDT");
        assert_eq!(positions[0].position_side, PositionSide::Long);
        assert_eq!(positions[0].qty, Decimal::from(1));
    }

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let _limited = server
            .mock("POST", mockito::Matcher::Regex(r"^/openApi/swap/v2/trade/order".into()))
            .with_status(429)
            .with_body(r#"{"code":-1,"msg":"rate limited"}"#)
            .expect(1)
            .create_async()
            .await;
        let _ok = server
            .mock("POST", mockito::Matcher::Regex(r"^/openApi/swap/v2/trade/order".into()))
            .with_status(200)
            .with_body(r#"{"code":0,"msg":"","data":{}}"#)
            .create_async()
            .await;

        let client = RestExchangeClient::new("key".into(), "secret".into(), reqwest::Client::new())
            .with_base_url(server.url());

        let resp = client
            .open_trade("BTC-USDT", PositionSide::Long, Decimal::new(2, 3))
            .await
            .unwrap();
        assert!(resp.is_ok());
    }

    #[tokio::test]
    async fn logical_error_is_returned_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", mockito::Matcher::Regex(r"^/openApi/swap/v2/trade/order".into()))
            .with_status(200)
            .with_body(r#"{"code":-1000,"msg":"insufficient margin"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = RestExchangeClient::new("key".into(), "secret".into(), reqwest::Client::new())
            .with_base_url(server.url());

        let resp = client
            .open_trade("BTC-USDT", PositionSide::Long, Decimal::new(2, 3))
            .await
            .unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.code, -1000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_retries_after_only_network_errors_reports_network_not_rate_limited() {
        // Port 1 has nothing listening, so every attempt fails at connect time
        // with a network error, never a 429.
        let client = RestExchangeClient::new("key".into(), "secret".into(), reqwest::Client::new())
            .with_base_url("http://127.0.0.1:1".to_string());

        let err = client
            .open_trade("BTC-USDT", PositionSide::Long, Decimal::new(2, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)), "expected Network, got {err:?}");
    }
}
