//! Account snapshot and holdings

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::transport::PortfolioUpdate;
use crate::types::Instrument;

/// P&L magnitudes above this are a gateway placeholder, not real values
const PNL_SENTINEL: f64 = 1e12;

/// Account values accumulated from an account subscription
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_name: String,

    /// Gateway's last update time for the values below
    pub time: Option<DateTime<Utc>>,

    pub net_liquidation: f64,
    pub previous_equity: f64,
    pub equity: f64,
    pub cash: f64,
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    pub available_funds: f64,
    pub excess_liquidity: f64,
    pub sma: f64,
    pub buying_power: f64,

    /// Positions keyed by local symbol
    pub holdings: BTreeMap<String, Holding>,
}

impl Account {
    pub fn new(account_name: &str) -> Self {
        Self {
            account_name: account_name.to_string(),
            ..Default::default()
        }
    }

    /// Apply one account value. Returns false for keys this snapshot does not track.
    pub fn apply_value(&mut self, key: &str, value: f64) -> bool {
        let field = match key.to_lowercase().as_str() {
            "netliquidation" => &mut self.net_liquidation,
            "previousdayequitywithloanvalue" => &mut self.previous_equity,
            "equitywithloanvalue" => &mut self.equity,
            "totalcashvalue" => &mut self.cash,
            "initmarginreq" => &mut self.initial_margin,
            "maintmarginreq" => &mut self.maintenance_margin,
            "availablefunds" => &mut self.available_funds,
            "excessliquidity" => &mut self.excess_liquidity,
            "sma" => &mut self.sma,
            "buyingpower" => &mut self.buying_power,
            _ => return false,
        };
        *field = value;
        true
    }

    /// Stamp with an `hh:mm` time on `today` (UTC)
    pub fn stamp_time(&mut self, hhmm: &str, today: NaiveDate) -> bool {
        match NaiveTime::parse_from_str(hhmm.trim(), "%H:%M") {
            Ok(time) => {
                self.time = Some(today.and_time(time).and_utc());
                true
            }
            Err(_) => false,
        }
    }

    pub fn update_holding(&mut self, update: &PortfolioUpdate) {
        let holding = Holding::from_update(update);
        self.holdings.insert(holding.local_symbol.clone(), holding);
    }
}

/// One position in the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub account_name: String,
    pub local_symbol: String,
    pub instrument: Instrument,
    pub time: DateTime<Utc>,
    pub quantity: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub average_cost: f64,
    pub unrealized: f64,
    pub realized: f64,
}

impl Holding {
    pub fn from_update(update: &PortfolioUpdate) -> Self {
        Self {
            account_name: update.account_name.clone(),
            local_symbol: update.instrument.display_symbol(),
            instrument: update.instrument.clone(),
            time: Utc::now(),
            quantity: update.position,
            market_price: update.market_price,
            market_value: update.market_value,
            average_cost: update.average_cost,
            unrealized: normalize_pnl(update.unrealized_pnl),
            realized: normalize_pnl(update.realized_pnl),
        }
    }
}

fn normalize_pnl(value: f64) -> f64 {
    if value.abs() > PNL_SENTINEL || !value.is_finite() {
        0.0
    } else {
        value
    }
}
