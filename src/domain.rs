use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange symbol, e.g. `"BTC-USDT"`. Case-sensitive, opaque to us.
pub type Symbol = String;

/// Canonicalized follower identity used as a map key (lowercased display name).
pub type FollowerKey = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl PositionSide {
    /// Side to submit when opening this position side.
    pub fn open_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Side to submit when closing (reducing) this position side.
    pub fn close_order_side(self) -> OrderSide {
        match self.open_order_side() {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    /// `true` maps to `Isolated`, `false` maps to `Cross` — mirrors the
    /// exchange's own (inconsistently documented) boolean flag.
    pub fn from_isolated_flag(isolated: bool) -> Self {
        if isolated {
            MarginMode::Isolated
        } else {
            MarginMode::Cross
        }
    }
}

/// A single open position, either the master's or what we believe a
/// follower's to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub qty: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub tp: Option<Decimal>,
    pub sl: Option<Decimal>,
    pub mark_price: Decimal,
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Decimal,
    pub equity: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

/// A follower account: identity plus the credentials needed to trade on
/// its behalf. Credentials arrive in plaintext from the credential store;
/// decrypting them at rest is that store's concern, not ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follower {
    pub id: String,
    pub display_name: String,
    pub api_key: String,
    pub secret_key: String,
}

impl Follower {
    /// The canonical map key for this follower: a lowercased display name.
    pub fn key(&self) -> FollowerKey {
        self.display_name.to_lowercase()
    }
}

/// The engine's persisted view of what it has mirrored. The single source
/// of truth across process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorState {
    pub last_positions: HashMap<Symbol, Position>,
    pub copied_trades: HashSet<Symbol>,
    pub follower_positions: HashMap<FollowerKey, HashMap<Symbol, Decimal>>,
    /// Per-symbol in-flight full-close guard. A symbol is present here only
    /// for the duration of one `TradeOps::close_all` dispatch.
    pub closed_trades: HashSet<Symbol>,
}

impl MirrorState {
    pub fn new() -> Self {
        Self::default()
    }
}
