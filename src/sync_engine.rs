use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};

use crate::cache::CacheLayer;
use crate::config::TimingConfig;
use crate::credentials::CredentialStore;
use crate::domain::{Balance, MirrorState, Position, PositionSide};
use crate::exchange::ExchangeClient;
use crate::master_queue::MasterCallQueue;
use crate::sizer;
use crate::state_store::StateStore;
use crate::trade_ops::{FollowerHandle, TradeOps};

const MASTER_BALANCE_CACHE_KEY: &str = "__master__";
/// Strict `<`: exactly 0.9x the previous quantity is not a partial close.
const PARTIAL_CLOSE_THRESHOLD: &str = "0.9";

/// One unit of dispatched work for the worker pool.
enum Event {
    Open {
        symbol: String,
        position_side: PositionSide,
        master_pct: Decimal,
        price: Decimal,
        leverage: u32,
        margin_mode: crate::domain::MarginMode,
    },
}

/// Builds a follower's `ExchangeClient` + cache key pair from its stored
/// credentials, sharing the engine's pooled HTTP client.
pub trait FollowerClientFactory: Send + Sync {
    fn build(&self, follower: &crate::domain::Follower, http: reqwest::Client) -> Arc<dyn ExchangeClient>;
}

pub struct SyncEngine {
    master: Arc<dyn ExchangeClient>,
    master_queue: MasterCallQueue,
    cache: Arc<CacheLayer>,
    state: Arc<Mutex<MirrorState>>,
    state_store: Arc<dyn StateStore>,
    trade_ops: Arc<TradeOps>,
    credentials: Arc<dyn CredentialStore>,
    client_factory: Arc<dyn FollowerClientFactory>,
    http: reqwest::Client,
    timing: TimingConfig,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl SyncEngine {
    pub fn new(
        master: Arc<dyn ExchangeClient>,
        cache: Arc<CacheLayer>,
        state: Arc<Mutex<MirrorState>>,
        state_store: Arc<dyn StateStore>,
        trade_ops: Arc<TradeOps>,
        credentials: Arc<dyn CredentialStore>,
        client_factory: Arc<dyn FollowerClientFactory>,
        http: reqwest::Client,
        timing: TimingConfig,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            master,
            master_queue: MasterCallQueue::spawn(timing.master_tick()),
            cache,
            state,
            state_store,
            trade_ops,
            credentials,
            client_factory,
            http,
            timing,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    async fn persist(&self) {
        let snapshot = self.state.lock().await.clone();
        if let Err(e) = self.state_store.save(&snapshot).await {
            log::error!("[SYNC] failed to persist state: {e}");
        }
    }

    /// Reloads the follower list from the credential store and rebuilds
    /// their exchange clients, pushing the result to `TradeOps`.
    async fn reload_followers(&self) -> Vec<FollowerHandle> {
        let followers = match self.credentials.followers().await {
            Ok(f) => f,
            Err(e) => {
                log::error!("[SYNC] failed to load followers: {e}");
                return Vec::new();
            }
        };

        let handles: Vec<FollowerHandle> = followers
            .iter()
            .map(|f| FollowerHandle {
                key: f.key(),
                client: self.client_factory.build(f, self.http.clone()),
            })
            .collect();

        self.trade_ops.set_followers(handles.clone()).await;
        log::info!("[SYNC] loaded {} followers", handles.len());
        handles
    }

    /// Runs once at boot, after `StateStore::load` and before the main loop:
    /// corrects `follower_positions` to match each follower's live exchange
    /// state, logging every drift found.
    async fn reconcile_followers_on_startup(&self, handles: &[FollowerHandle]) {
        for handle in handles {
            let live = match handle.client.get_positions().await {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("[SYNC] reconciliation: failed to read positions for {}: {e}", handle.key);
                    continue;
                }
            };

            let mut state = self.state.lock().await;
            let believed = state.follower_positions.entry(handle.key.clone()).or_default();

            let live_map: std::collections::HashMap<String, Decimal> =
                live.into_iter().map(|p| (p.symbol, p.qty)).collect();

            for (symbol, live_qty) in &live_map {
                let believed_qty = believed.get(symbol).copied().unwrap_or(Decimal::ZERO);
                if believed_qty != *live_qty {
                    log::warn!(
                        "[SYNC] reconciliation drift for {}/{}: believed={} live={}",
                        handle.key, symbol, believed_qty, live_qty
                    );
                    believed.insert(symbol.clone(), *live_qty);
                }
            }

            believed.retain(|symbol, _| live_map.contains_key(symbol));
            if believed.is_empty() {
                state.follower_positions.remove(&handle.key);
            }
        }
        self.persist().await;
    }

    /// Fetches master positions through the cache, surfacing any upstream
    /// failure (network, logical, parse) instead of collapsing it into an
    /// empty response: an empty `Vec` must mean "the master is flat", never
    /// "we couldn't ask the master".
    async fn cached_master_positions(&self) -> anyhow::Result<Vec<crate::exchange::RemotePosition>> {
        let master = self.master.clone();
        self.cache
            .master_positions
            .get_or_fetch_result((), move || {
                let master = master.clone();
                async move { self.master_queue.call(|| async move { master.get_positions().await }).await.map_err(Into::into) }
            })
            .await
    }

    async fn cached_trade_parameters(&self, symbol: &str) -> (Option<u32>, Option<Decimal>, Option<Decimal>) {
        let master = self.master.clone();
        let symbol_owned = symbol.to_string();
        self.cache
            .open_orders
            .get_or_fetch(symbol.to_string(), (None, None, None), move || {
                let master = master.clone();
                let symbol = symbol_owned;
                async move {
                    self.master_queue
                        .call(|| async move { master.get_trade_parameters(&symbol).await })
                        .await
                        .map_err(Into::into)
                }
            })
            .await
    }

    async fn cached_master_balance(&self) -> Balance {
        let master = self.master.clone();
        self.cache
            .follower_balance
            .get_or_fetch(MASTER_BALANCE_CACHE_KEY.to_string(), Balance::default(), move || {
                let master = master.clone();
                async move {
                    self.master_queue
                        .call(|| async move { master.get_balance("USDT").await })
                        .await
                        .map_err(Into::into)
                }
            })
            .await
    }

    /// One main-loop iteration: fetch, diff against `last_positions`,
    /// dispatch open/partial-close/full-close.
    async fn tick(&self) {
        let remote = match self.cached_master_positions().await {
            Ok(r) => r,
            Err(e) => {
                // Malformed response or `code != 0`: do not touch the diff at
                // all. Treating this as "master has no positions" would mass
                // full-close every follower on a transient API hiccup.
                log::warn!("[SYNC] master positions fetch failed, skipping this tick: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        };

        let mut open_now = std::collections::HashMap::new();
        for p in &remote {
            if p.qty == Decimal::ZERO {
                continue;
            }
            let (leverage, tp, sl) = self.cached_trade_parameters(&p.symbol).await;
            open_now.insert(
                p.symbol.clone(),
                Position {
                    symbol: p.symbol.clone(),
                    position_side: p.position_side,
                    qty: p.qty,
                    leverage: leverage.unwrap_or(1),
                    margin_mode: crate::domain::MarginMode::from_isolated_flag(p.isolated),
                    tp,
                    sl,
                    mark_price: p.mark_price,
                    position_value: p.position_value,
                    unrealized_pnl: p.unrealized_pnl,
                },
            );
        }

        let master_balance = self.cached_master_balance().await;
        let threshold: Decimal = PARTIAL_CLOSE_THRESHOLD.parse().expect("valid decimal literal");

        let previous = self.state.lock().await.last_positions.clone();

        for (symbol, position) in &open_now {
            if position.leverage == 0 {
                // Zero leverage at the master: skip both open and partial-close
                // dispatch for this symbol on this tick.
                continue;
            }

            if let Some(prev) = previous.get(symbol) {
                if prev.qty > Decimal::ZERO && position.qty < prev.qty * threshold {
                    let closed_pct = (prev.qty - position.qty) / prev.qty;
                    self.trade_ops.close_partial(symbol, closed_pct, position.position_side).await;
                }
            }

            let already_copied = self.state.lock().await.copied_trades.contains(symbol);
            if !already_copied {
                let master_pct = sizer::master_pct(position.position_value, position.leverage, master_balance.available);
                {
                    let mut state = self.state.lock().await;
                    state.copied_trades.insert(symbol.clone());
                }
                self.persist().await;

                let _ = self.event_tx.send(Event::Open {
                    symbol: symbol.clone(),
                    position_side: position.position_side,
                    master_pct,
                    price: position.mark_price,
                    leverage: position.leverage,
                    margin_mode: position.margin_mode,
                });
            }
        }

        let closed_symbols: Vec<String> = previous
            .keys()
            .filter(|s| !open_now.contains_key(*s))
            .cloned()
            .collect();
        for symbol in closed_symbols {
            self.trade_ops.close_all(&symbol).await;
            let mut state = self.state.lock().await;
            state.copied_trades.remove(&symbol);
        }

        {
            let mut state = self.state.lock().await;
            state.last_positions = open_now;
        }
        self.persist().await;
    }

    /// One worker: repeatedly takes the next event off the shared queue and
    /// processes it to completion before taking another. Multiple workers
    /// share one `UnboundedReceiver` behind a mutex so distinct symbols can
    /// be dispatched concurrently without wedging on a single slow one.
    async fn worker_loop(self: Arc<Self>, rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>) {
        loop {
            let event = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(event) = event else { return };
            match event {
                Event::Open { symbol, position_side, master_pct, price, leverage, margin_mode } => {
                    self.trade_ops
                        .open(&symbol, position_side, master_pct, price, leverage, margin_mode)
                        .await;
                }
            }
        }
    }

    async fn balances_refresh_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.timing.balances_refresh()).await;
            let handles = self.trade_ops_followers().await;
            for handle in handles {
                match handle.client.get_balance("USDT").await {
                    Ok(_) => {}
                    Err(e) => log::warn!("[SYNC] balance preload failed for {}: {e}", handle.key),
                }
                tokio::time::sleep(self.timing.balance_preload_delay()).await;
            }
        }
    }

    async fn trade_ops_followers(&self) -> Vec<FollowerHandle> {
        self.reload_followers().await
    }

    async fn followers_refresh_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.timing.followers_refresh()).await;
            self.reload_followers().await;
        }
    }

    /// Starts the worker pool, the background refreshers, runs startup
    /// reconciliation once, then runs the main loop until cancelled.
    pub async fn run(self: Arc<Self>) {
        let handles = self.reload_followers().await;
        self.reconcile_followers_on_startup(&handles).await;

        let rx = self.event_rx.lock().await.take().expect("run called once");
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..self.timing.worker_pool_size {
            tokio::spawn(self.clone().worker_loop(rx.clone()));
        }

        tokio::spawn(self.clone().followers_refresh_loop());
        tokio::spawn(self.clone().balances_refresh_loop());

        loop {
            self.tick().await;
            tokio::time::sleep(self.timing.main_loop_interval()).await;
        }
    }
}
