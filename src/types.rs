use serde::{Deserialize, Serialize};

/// Locally assigned, per-call identifier used to correlate replies.
pub type RequestId = i64;

/// Durable order identifier assigned by the gateway. Zero until assigned.
pub type PermId = i64;

/// Security type of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecType {
    #[default]
    Stock,
    Cash,
    Future,
    Option,
    Index,
}

impl SecType {
    /// Wire code used by the gateway
    pub fn code(&self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::Cash => "CASH",
            Self::Future => "FUT",
            Self::Option => "OPT",
            Self::Index => "IND",
        }
    }
}

impl std::fmt::Display for SecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Tradeable instrument (a gateway "contract")
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Instrument {
    pub sec_type: SecType,
    pub symbol: String,
    pub currency: String,
    pub exchange: String,

    /// Populated once the gateway has resolved the instrument
    pub local_symbol: String,
    pub primary_exchange: String,
    pub con_id: i64,
}

impl Instrument {
    /// Equity routed through the smart router
    pub fn stock(symbol: &str, currency: &str) -> Self {
        Self {
            sec_type: SecType::Stock,
            symbol: symbol.to_uppercase(),
            currency: currency.to_uppercase(),
            exchange: "SMART".to_string(),
            ..Default::default()
        }
    }

    /// Currency pair, e.g. `forex("EUR", "USD")`
    pub fn forex(base: &str, quote: &str) -> Self {
        Self {
            sec_type: SecType::Cash,
            symbol: base.to_uppercase(),
            currency: quote.to_uppercase(),
            exchange: "IDEALPRO".to_string(),
            ..Default::default()
        }
    }

    /// Parse a driver-style symbol: `EUR.USD` is a currency pair, anything
    /// else a USD equity.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol.split_once('.') {
            Some((base, quote)) => Self::forex(base, quote),
            None => Self::stock(symbol, "USD"),
        }
    }

    /// Copy holding only the attributes the gateway accepts in lookups.
    /// Sending a fully populated instrument makes the gateway reject the request.
    pub fn basic(&self) -> Self {
        Self {
            sec_type: self.sec_type,
            symbol: self.symbol.clone(),
            currency: self.currency.clone(),
            exchange: self.exchange.clone(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> InstrumentKey {
        InstrumentKey::new(&self.symbol, &self.currency)
    }

    /// Local symbol when resolved, otherwise `SYMBOL.CURRENCY`
    pub fn display_symbol(&self) -> String {
        if self.local_symbol.is_empty() {
            format!("{}.{}", self.symbol, self.currency)
        } else {
            self.local_symbol.clone()
        }
    }
}

/// Subscription key for live quotes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub symbol: String,
    pub currency: String,
}

impl InstrumentKey {
    pub fn new(symbol: &str, currency: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            currency: currency.to_uppercase(),
        }
    }
}

impl std::fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.symbol, self.currency)
    }
}

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}
