use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::cache::CacheLayer;
use crate::domain::{MarginMode, MirrorState, PositionSide};
use crate::exchange::ExchangeClient;
use crate::notify::NotificationSink;
use crate::sizer;
use crate::state_store::StateStore;

const OPEN_BATCH_SIZE: usize = 10;
const OPEN_BATCH_DELAY: Duration = Duration::from_millis(1500);
const CLOSE_BATCH_SIZE: usize = 7;
const CLOSE_BATCH_DELAY: Duration = Duration::from_secs(1);
const QUANTITY_PRECISION: u32 = 8;
const MIN_CLOSE_AMOUNT: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

#[derive(Clone)]
pub struct FollowerHandle {
    pub key: String,
    pub client: Arc<dyn ExchangeClient>,
}

/// Executes open/close/partial-close across a batch of followers. Holds no
/// reference back to the owning engine: the engine injects the follower
/// list and a save callback so state mutation stays single-threaded at the
/// `MirrorState` mutex, matching the engine's single-writer discipline.
pub struct TradeOps {
    followers: Mutex<Vec<FollowerHandle>>,
    state: Arc<Mutex<MirrorState>>,
    state_store: Arc<dyn StateStore>,
    cache: Arc<CacheLayer>,
    notify: Arc<NotificationSink>,
}

impl TradeOps {
    pub fn new(
        state: Arc<Mutex<MirrorState>>,
        state_store: Arc<dyn StateStore>,
        cache: Arc<CacheLayer>,
        notify: Arc<NotificationSink>,
    ) -> Self {
        Self {
            followers: Mutex::new(Vec::new()),
            state,
            state_store,
            cache,
            notify,
        }
    }

    pub async fn set_followers(&self, followers: Vec<FollowerHandle>) {
        *self.followers.lock().await = followers;
    }

    async fn persist(&self) {
        let snapshot = self.state.lock().await.clone();
        if let Err(e) = self.state_store.save(&snapshot).await {
            log::error!("[TRADE_OPS] failed to persist state: {e}");
        }
    }

    /// Opens `symbol` on every follower with sufficient available margin,
    /// in batches of `OPEN_BATCH_SIZE` with `OPEN_BATCH_DELAY` between them.
    pub async fn open(
        &self,
        symbol: &str,
        position_side: PositionSide,
        master_pct: Decimal,
        price: Decimal,
        leverage: u32,
        margin_mode: MarginMode,
    ) {
        let followers = self.followers.lock().await.clone();
        for (i, batch) in followers.chunks(OPEN_BATCH_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(OPEN_BATCH_DELAY).await;
            }
            let mut set = JoinSet::new();
            for handle in batch.iter().cloned() {
                let symbol = symbol.to_string();
                let cache = self.cache.clone();
                set.spawn(async move {
                    let balance = cache
                        .follower_balance
                        .get_or_fetch(handle.key.clone(), crate::domain::Balance::default(), || {
                            let client = handle.client.clone();
                            async move { client.get_balance("USDT").await.map_err(Into::into) }
                        })
                        .await;
                    (handle, balance)
                });
            }

            while let Some(res) = set.join_next().await {
                let Ok((handle, balance)) = res else { continue };
                if balance.available <= Decimal::ZERO {
                    log::warn!("[TRADE_OPS] skipping {}: no available margin", handle.key);
                    continue;
                }

                let qty = sizer::quantity(master_pct, balance.available, price, leverage, QUANTITY_PRECISION);
                if qty <= Decimal::ZERO {
                    log::warn!("[TRADE_OPS] skipping {}: computed qty <= 0 for {}", handle.key, symbol);
                    continue;
                }

                {
                    let state = self.state.lock().await;
                    if state
                        .follower_positions
                        .get(&handle.key)
                        .and_then(|m| m.get(&symbol))
                        .map(|q| *q > Decimal::ZERO)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                }

                if let Err(e) = handle.client.set_leverage(&symbol, leverage, position_side).await {
                    log::warn!("[TRADE_OPS] set_leverage failed for {}/{}: {e}", handle.key, symbol);
                }
                if let Err(e) = handle.client.set_margin_mode(&symbol, margin_mode).await {
                    log::warn!("[TRADE_OPS] set_margin_mode failed for {}/{}: {e}", handle.key, symbol);
                }

                match handle.client.open_trade(&symbol, position_side, qty).await {
                    Ok(resp) if resp.is_ok() => {
                        let mut state = self.state.lock().await;
                        state
                            .follower_positions
                            .entry(handle.key.clone())
                            .or_default()
                            .insert(symbol.clone(), qty);
                        drop(state);
                        self.persist().await;
                        self.notify.notify(format!(
                            "Opened {symbol} {position_side:?} qty={qty} for {}", handle.key
                        ));
                    }
                    Ok(resp) => {
                        log::error!("[TRADE_OPS] open failed for {}/{}: {} {}", handle.key, symbol, resp.code, resp.msg);
                        self.notify.notify(format!(
                            "Failed to open {symbol} for {}: {}", handle.key, resp.msg
                        ));
                    }
                    Err(e) => {
                        log::error!("[TRADE_OPS] open error for {}/{}: {e}", handle.key, symbol);
                        self.notify.notify(format!("Error opening {symbol} for {}: {e}", handle.key));
                    }
                }
            }
        }
    }

    /// Closes `symbol` on every follower that holds it. Guarded by the
    /// `closed_trades` in-flight marker so a concurrent duplicate full-close
    /// is skipped rather than double-sent.
    pub async fn close_all(&self, symbol: &str) {
        {
            let mut state = self.state.lock().await;
            if state.closed_trades.contains(symbol) {
                return;
            }
            state.closed_trades.insert(symbol.to_string());
        }

        let followers = self.followers.lock().await.clone();
        let holders: Vec<_> = {
            let state = self.state.lock().await;
            followers
                .into_iter()
                .filter(|h| {
                    state
                        .follower_positions
                        .get(&h.key)
                        .map(|m| m.contains_key(symbol))
                        .unwrap_or(false)
                })
                .collect()
        };

        for (i, batch) in holders.chunks(CLOSE_BATCH_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(CLOSE_BATCH_DELAY).await;
            }
            let mut set = JoinSet::new();
            for handle in batch.iter().cloned() {
                let symbol = symbol.to_string();
                set.spawn(async move {
                    let resp = handle.client.close_all(&symbol).await;
                    (handle, symbol, resp)
                });
            }

            while let Some(res) = set.join_next().await {
                let Ok((handle, symbol, resp)) = res else { continue };
                match resp {
                    Ok(resp) if resp.is_ok() => {
                        let mut state = self.state.lock().await;
                        if let Some(m) = state.follower_positions.get_mut(&handle.key) {
                            m.remove(&symbol);
                            if m.is_empty() {
                                state.follower_positions.remove(&handle.key);
                            }
                        }
                        drop(state);
                        self.persist().await;
                        self.notify.notify(format!("Closed {symbol} for {}", handle.key));
                    }
                    Ok(resp) => {
                        log::error!("[TRADE_OPS] close failed for {}/{}: {} {}", handle.key, symbol, resp.code, resp.msg);
                    }
                    Err(e) => {
                        log::error!("[TRADE_OPS] close error for {}/{}: {e}", handle.key, symbol);
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        state.last_positions.remove(symbol);
        state.closed_trades.remove(symbol);
        drop(state);
        self.persist().await;
    }

    /// Reduces `symbol` on every follower holding it by `master_closed_pct`.
    pub async fn close_partial(&self, symbol: &str, master_closed_pct: Decimal, position_side: PositionSide) {
        let followers = self.followers.lock().await.clone();
        let holders: Vec<(FollowerHandle, Decimal)> = {
            let state = self.state.lock().await;
            followers
                .into_iter()
                .filter_map(|h| {
                    let qty = state.follower_positions.get(&h.key)?.get(symbol)?;
                    Some((h, *qty))
                })
                .collect()
        };

        for (i, batch) in holders.chunks(CLOSE_BATCH_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(CLOSE_BATCH_DELAY).await;
            }
            let mut set = JoinSet::new();
            for (handle, stored_qty) in batch.iter().cloned() {
                let symbol = symbol.to_string();
                let close_amount = (stored_qty * master_closed_pct).round_dp(QUANTITY_PRECISION);
                set.spawn(async move {
                    if close_amount < MIN_CLOSE_AMOUNT {
                        return (handle, symbol, stored_qty, close_amount, None);
                    }
                    let resp = handle.client.close_partial(&symbol, close_amount, position_side).await;
                    (handle, symbol, stored_qty, close_amount, Some(resp))
                });
            }

            while let Some(res) = set.join_next().await {
                let Ok((handle, symbol, stored_qty, close_amount, resp)) = res else { continue };
                let Some(resp) = resp else { continue };
                match resp {
                    Ok(resp) if resp.is_ok() => {
                        let mut state = self.state.lock().await;
                        let remaining = stored_qty - close_amount;
                        if let Some(m) = state.follower_positions.get_mut(&handle.key) {
                            if remaining <= Decimal::ZERO {
                                m.remove(&symbol);
                            } else {
                                m.insert(symbol.clone(), remaining);
                            }
                        }
                        drop(state);
                        self.persist().await;
                        self.notify.notify(format!(
                            "Partially closed {close_amount} of {symbol} for {}", handle.key
                        ));
                    }
                    Ok(resp) => {
                        log::warn!("[TRADE_OPS] partial close failed for {}/{}: {} {}", handle.key, symbol, resp.code, resp.msg);
                    }
                    Err(e) => {
                        log::error!("[TRADE_OPS] partial close error for {}/{}: {e}", handle.key, symbol);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Balance;
    use crate::error::ExchangeError;
    use crate::exchange::{ApiResponse, RemotePosition};
    use crate::state_store::InMemoryStateStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        available: Decimal,
        open_calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeClient for StubClient {
        async fn get_positions(&self) -> Result<Vec<RemotePosition>, ExchangeError> {
            Ok(vec![])
        }
        async fn get_balance(&self, _asset: &str) -> Result<Balance, ExchangeError> {
            Ok(Balance { available: self.available, equity: self.available, used: Decimal::ZERO, total: self.available })
        }
        async fn get_trade_parameters(&self, _symbol: &str) -> Result<(Option<u32>, Option<Decimal>, Option<Decimal>), ExchangeError> {
            Ok((None, None, None))
        }
        async fn open_trade(&self, _symbol: &str, _position_side: PositionSide, _qty: Decimal) -> Result<ApiResponse, ExchangeError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse { code: 0, msg: String::new(), data: Value::Null })
        }
        async fn close_all(&self, _symbol: &str) -> Result<ApiResponse, ExchangeError> {
            Ok(ApiResponse { code: 0, msg: String::new(), data: Value::Null })
        }
        async fn close_partial(&self, _symbol: &str, _qty: Decimal, _position_side: PositionSide) -> Result<ApiResponse, ExchangeError> {
            Ok(ApiResponse { code: 0, msg: String::new(), data: Value::Null })
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32, _position_side: PositionSide) -> Result<ApiResponse, ExchangeError> {
            Ok(ApiResponse { code: 0, msg: String::new(), data: Value::Null })
        }
        async fn set_margin_mode(&self, _symbol: &str, _mode: MarginMode) -> Result<ApiResponse, ExchangeError> {
            Ok(ApiResponse { code: 0, msg: String::new(), data: Value::Null })
        }
    }

    fn make_ops() -> (TradeOps, Arc<Mutex<MirrorState>>) {
        let state = Arc::new(Mutex::new(MirrorState::new()));
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
        let cache = Arc::new(CacheLayer::new());
        let notify = Arc::new(NotificationSink::new(reqwest::Client::new(), "http://127.0.0.1:1/x".to_string()));
        let ops = TradeOps::new(state.clone(), store, cache, notify);
        (ops, state)
    }

    #[tokio::test]
    async fn open_records_follower_position_on_success() {
        use rust_decimal_macros::dec;
        let (ops, state) = make_ops();
        let client: Arc<dyn ExchangeClient> = Arc::new(StubClient { available: dec!(200), open_calls: AtomicUsize::new(0) });
        ops.set_followers(vec![FollowerHandle { key: "alice".into(), client }]).await;

        ops.open("BTC-USDT", PositionSide::Long, dec!(0.05), dec!(50000), 10, MarginMode::Cross).await;

        let state = state.lock().await;
        let qty = state.follower_positions.get("alice").unwrap().get("BTC-USDT").unwrap();
        assert_eq!(*qty, dec!(0.002));
    }

    #[tokio::test]
    async fn open_skips_follower_with_no_available_margin() {
        use rust_decimal_macros::dec;
        let (ops, state) = make_ops();
        let client: Arc<dyn ExchangeClient> = Arc::new(StubClient { available: Decimal::ZERO, open_calls: AtomicUsize::new(0) });
        ops.set_followers(vec![FollowerHandle { key: "bob".into(), client }]).await;

        ops.open("BTC-USDT", PositionSide::Long, dec!(0.05), dec!(50000), 10, MarginMode::Cross).await;

        let state = state.lock().await;
        assert!(state.follower_positions.get("bob").is_none());
    }

    #[tokio::test]
    async fn close_all_removes_follower_position() {
        use rust_decimal_macros::dec;
        let (ops, state) = make_ops();
        let client: Arc<dyn ExchangeClient> = Arc::new(StubClient { available: dec!(200), open_calls: AtomicUsize::new(0) });
        ops.set_followers(vec![FollowerHandle { key: "alice".into(), client }]).await;
        {
            let mut state = state.lock().await;
            state.follower_positions.entry("alice".into()).or_default().insert("BTC-USDT".into(), dec!(0.002));
        }

        ops.close_all("BTC-USDT").await;

        let state = state.lock().await;
        assert!(state.follower_positions.get("alice").is_none());
        assert!(!state.closed_trades.contains("BTC-USDT"));
    }

    #[tokio::test]
    async fn close_partial_reduces_stored_quantity() {
        use rust_decimal_macros::dec;
        let (ops, state) = make_ops();
        let client: Arc<dyn ExchangeClient> = Arc::new(StubClient { available: dec!(200), open_calls: AtomicUsize::new(0) });
        ops.set_followers(vec![FollowerHandle { key: "alice".into(), client }]).await;
        {
            let mut state = state.lock().await;
            state.follower_positions.entry("alice".into()).or_default().insert("BTC-USDT".into(), dec!(0.002));
        }

        ops.close_partial("BTC-USDT", dec!(0.6), PositionSide::Long).await;

        let state = state.lock().await;
        let remaining = state.follower_positions.get("alice").unwrap().get("BTC-USDT").unwrap();
        assert_eq!(*remaining, dec!(0.0008));
    }
}
