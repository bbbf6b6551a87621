use std::time::Duration;

use serde::Deserialize;

/// Tunable timing knobs. Grouped into one struct, per-field overridable via
/// env vars, so operators can retune without a rebuild.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_main_loop_interval_ms")]
    pub main_loop_interval_ms: u64,
    #[serde(default = "default_master_tick_ms")]
    pub master_tick_ms: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_followers_refresh_secs")]
    pub followers_refresh_secs: u64,
    #[serde(default = "default_balances_refresh_secs")]
    pub balances_refresh_secs: u64,
    #[serde(default = "default_balance_preload_delay_ms")]
    pub balance_preload_delay_ms: u64,
}

fn default_main_loop_interval_ms() -> u64 {
    100
}
fn default_master_tick_ms() -> u64 {
    300
}
fn default_worker_pool_size() -> usize {
    5
}
fn default_followers_refresh_secs() -> u64 {
    2000
}
fn default_balances_refresh_secs() -> u64 {
    600
}
fn default_balance_preload_delay_ms() -> u64 {
    1500
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            main_loop_interval_ms: default_main_loop_interval_ms(),
            master_tick_ms: default_master_tick_ms(),
            worker_pool_size: default_worker_pool_size(),
            followers_refresh_secs: default_followers_refresh_secs(),
            balances_refresh_secs: default_balances_refresh_secs(),
            balance_preload_delay_ms: default_balance_preload_delay_ms(),
        }
    }
}

impl TimingConfig {
    pub fn main_loop_interval(&self) -> Duration {
        Duration::from_millis(self.main_loop_interval_ms)
    }
    pub fn master_tick(&self) -> Duration {
        Duration::from_millis(self.master_tick_ms)
    }
    pub fn followers_refresh(&self) -> Duration {
        Duration::from_secs(self.followers_refresh_secs)
    }
    pub fn balances_refresh(&self) -> Duration {
        Duration::from_secs(self.balances_refresh_secs)
    }
    pub fn balance_preload_delay(&self) -> Duration {
        Duration::from_millis(self.balance_preload_delay_ms)
    }
}

/// Top-level engine configuration, assembled from required environment
/// variables at startup. Missing required vars fail fast, mirroring the
/// original's config loader.
pub struct EngineConfig {
    pub state_store_uri: String,
    pub state_store_db: String,
    pub credential_store_uri: String,
    pub credential_store_db: String,
    pub exchange_base_url: Option<String>,
    pub notification_endpoint: String,
    pub timing: TimingConfig,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let require = |name: &str| -> anyhow::Result<String> {
            std::env::var(name).map_err(|_| anyhow::anyhow!("missing required env var {name}"))
        };

        Ok(Self {
            state_store_uri: require("MONGO_URI")?,
            state_store_db: require("DB_NAME")?,
            credential_store_uri: std::env::var("CREDENTIALS_MONGO_URI")
                .unwrap_or_else(|_| std::env::var("MONGO_URI").unwrap_or_default()),
            credential_store_db: std::env::var("CREDENTIALS_DB_NAME")
                .unwrap_or_else(|_| "credentials".to_string()),
            exchange_base_url: std::env::var("EXCHANGE_BASE_URL").ok(),
            notification_endpoint: require("NOTIFICATION_ENDPOINT")?,
            timing: TimingConfig::default(),
        })
    }
}
