mod cache;
mod config;
mod credentials;
mod domain;
mod error;
mod exchange;
mod master_queue;
mod notify;
mod signing;
mod sizer;
mod state_store;
mod sync_engine;
mod trade_ops;

use std::sync::Arc;

use tokio::sync::Mutex;

use config::EngineConfig;
use credentials::MongoCredentialStore;
use domain::{Follower, MirrorState};
use exchange::{ExchangeClient, RestExchangeClient};
use notify::NotificationSink;
use state_store::{MongoStateStore, StateStore};
use sync_engine::{FollowerClientFactory, SyncEngine};
use trade_ops::TradeOps;

struct BingxClientFactory;

impl FollowerClientFactory for BingxClientFactory {
    fn build(&self, follower: &Follower, http: reqwest::Client) -> Arc<dyn ExchangeClient> {
        Arc::new(RestExchangeClient::new(follower.api_key.clone(), follower.secret_key.clone(), http))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("[ENGINE] copy-trading engine starting");

    let config = EngineConfig::from_env()?;

    let http = reqwest::Client::new();

    let state_store: Arc<dyn StateStore> =
        Arc::new(MongoStateStore::connect(&config.state_store_uri, &config.state_store_db, "mirror_state").await?);

    let credentials: Arc<dyn credentials::CredentialStore> = Arc::new(
        MongoCredentialStore::connect(&config.credential_store_uri, &config.credential_store_db, "credentials").await?,
    );

    let master_creds = credentials.master().await?;
    let master: Arc<dyn ExchangeClient> = Arc::new(RestExchangeClient::new(
        master_creds.api_key,
        master_creds.secret_key,
        http.clone(),
    ));

    let initial_state: MirrorState = state_store.load().await.unwrap_or_else(|e| {
        log::warn!("[ENGINE] failed to load persisted state, starting empty: {e}");
        MirrorState::new()
    });
    let state = Arc::new(Mutex::new(initial_state));

    let cache = Arc::new(cache::CacheLayer::new());
    let notify = Arc::new(NotificationSink::new(http.clone(), config.notification_endpoint.clone()));
    let trade_ops = Arc::new(TradeOps::new(state.clone(), state_store.clone(), cache.clone(), notify));

    let engine = SyncEngine::new(
        master,
        cache,
        state,
        state_store,
        trade_ops,
        credentials,
        Arc::new(BingxClientFactory),
        http,
        config.timing,
    );

    log::info!("[ENGINE] entering main loop");
    engine.run().await;

    Ok(())
}
