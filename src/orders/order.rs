//! Order types and status progression

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Action, Instrument, PermId, RequestId};

/// Order kind with its kind-specific price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
    Stop { price: f64 },
}

impl OrderKind {
    /// Gateway order type code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Market => "MKT",
            Self::Limit { .. } => "LMT",
            Self::Stop { .. } => "STP",
        }
    }

    pub fn limit_price(&self) -> Option<f64> {
        match self {
            Self::Limit { price } => Some(*price),
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<f64> {
        match self {
            Self::Stop { price } => Some(*price),
            _ => None,
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    Day,
    GoodTillCancelled,
    ImmediateOrCancel,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "DAY"),
            Self::GoodTillCancelled => write!(f, "GTC"),
            Self::ImmediateOrCancel => write!(f, "IOC"),
        }
    }
}

/// How the rest of an OCA group reacts when one member fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OcaType {
    #[default]
    None,
    /// Cancel the remaining orders in the group
    CancelOnFill,
    /// Reduce the remaining orders proportionately
    ReduceOnFill,
}

impl OcaType {
    /// Gateway code
    pub fn code(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::CancelOnFill => 1,
            Self::ReduceOnFill => 2,
        }
    }
}

/// What the caller asks the gateway to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub action: Action,
    pub quantity: f64,
    pub kind: OrderKind,
    pub tif: TimeInForce,
    pub oca_group: Option<String>,
    pub oca_type: OcaType,
}

impl OrderSpec {
    /// Create a market order
    pub fn market(action: Action, quantity: f64) -> Self {
        Self::new(action, quantity, OrderKind::Market)
    }

    /// Create a limit order
    pub fn limit(action: Action, quantity: f64, price: f64) -> Self {
        Self::new(action, quantity, OrderKind::Limit { price })
    }

    /// Create a stop order
    pub fn stop(action: Action, quantity: f64, price: f64) -> Self {
        Self::new(action, quantity, OrderKind::Stop { price })
    }

    fn new(action: Action, quantity: f64, kind: OrderKind) -> Self {
        Self {
            action,
            quantity,
            kind,
            tif: TimeInForce::Day,
            oca_group: None,
            oca_type: OcaType::None,
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.tif = tif;
        self
    }

    pub fn with_oca(mut self, group: impl Into<String>, oca_type: OcaType) -> Self {
        self.oca_group = Some(group.into());
        self.oca_type = oca_type;
        self
    }
}

/// Order status. Progresses `Pending -> Submitted -> (Filled | Cancelled)`
/// and never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created locally or acknowledged but not yet working
    Pending,
    /// Working at the gateway
    Submitted,
    /// Completely filled
    Filled,
    /// Cancelled, rejected or otherwise inactive
    Cancelled,
}

impl OrderStatus {
    /// Map a gateway status string. `None` for statuses that do not change
    /// the order's position in the progression (e.g. `PendingCancel`).
    pub fn from_wire(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "apipending" | "pendingsubmit" => Some(Self::Pending),
            "presubmitted" | "submitted" => Some(Self::Submitted),
            "filled" => Some(Self::Filled),
            "cancelled" | "apicancelled" | "inactive" => Some(Self::Cancelled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Filled | Self::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// True when moving from `self` to `next` respects the progression
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A single fill. Immutable once reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Gateway execution id, unique per fill
    pub exec_id: String,
    pub perm_id: PermId,
    pub request_id: RequestId,
    pub side: Action,
    pub quantity: f64,
    pub price: f64,
    pub cum_quantity: f64,
    pub avg_price: f64,
    pub time: DateTime<Utc>,
}

/// Ledger record for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Request id assigned at placement
    pub request_id: RequestId,

    /// Gateway permanent id (0 until acknowledged)
    pub perm_id: PermId,

    /// Client connection that placed the order
    pub client_id: i32,

    pub instrument: Instrument,
    pub spec: OrderSpec,
    pub status: OrderStatus,

    pub filled: f64,
    pub remaining: f64,
    pub avg_fill_price: f64,
    pub last_fill_price: f64,

    /// Set on bracket children
    pub parent_id: Option<RequestId>,

    /// Executions for this order at the time the record was read
    pub executions: Vec<Execution>,

    /// Most recent gateway error reported against this order
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// New locally placed order in `Pending`
    pub fn new(request_id: RequestId, instrument: Instrument, spec: OrderSpec) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            perm_id: 0,
            client_id: 0,
            instrument,
            remaining: spec.quantity,
            spec,
            status: OrderStatus::Pending,
            filled: 0.0,
            avg_fill_price: 0.0,
            last_fill_price: 0.0,
            parent_id: None,
            executions: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn action(&self) -> Action {
        self.spec.action
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if order is working (can be cancelled)
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// OCA group token used for this order's bracket children
    pub fn bracket_group(&self) -> String {
        if self.perm_id != 0 {
            self.perm_id.to_string()
        } else {
            format!("req-{}", self.request_id)
        }
    }
}
