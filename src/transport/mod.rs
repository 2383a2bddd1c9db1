//! Boundary to the gateway wire protocol
//!
//! The core never encodes or decodes wire messages. It issues outbound calls
//! through a [`Transport`] and receives decoded [`InboundEvent`]s through the
//! [`EventSender`] handed over on connect. All events for one connection
//! travel through that single ordered channel.

mod channel;
mod simulated;

pub use channel::{ChannelTransport, WireCommand};
pub use simulated::SimulatedTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::history::{Bar, HistoricalRequest};
use crate::orders::{Execution, OpenOrderReport, OrderSpec, StatusUpdate};
use crate::types::{Instrument, RequestId};

/// Narrows an executions query; empty matches everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub client_id: Option<i32>,
    pub account: Option<String>,
    pub symbol: Option<String>,
}

/// Position line from an account subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioUpdate {
    pub instrument: Instrument,
    pub position: f64,
    pub market_price: f64,
    pub market_value: f64,
    pub average_cost: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub account_name: String,
}

/// Decoded push event from the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NextValidId(RequestId),
    /// Comma-separated account list
    ManagedAccounts(String),
    AccountValue {
        key: String,
        value: String,
        currency: String,
        account_name: String,
    },
    /// `hh:mm`, no date
    AccountTime(String),
    AccountDownloadEnd(String),
    ContractDetails {
        request_id: RequestId,
        instrument: Instrument,
    },
    ContractDetailsEnd(RequestId),
    OpenOrder(OpenOrderReport),
    OpenOrderEnd,
    OrderStatus(StatusUpdate),
    ExecDetails {
        request_id: RequestId,
        instrument: Instrument,
        execution: Execution,
    },
    ExecDetailsEnd(RequestId),
    HistoricalBar {
        request_id: RequestId,
        bar: Bar,
    },
    /// The "finished" sentinel of a historical request
    HistoricalDataEnd(RequestId),
    TickPrice {
        request_id: RequestId,
        field: i32,
        price: f64,
    },
    TickSize {
        request_id: RequestId,
        field: i32,
        size: f64,
    },
    Portfolio(PortfolioUpdate),
    /// Business error or informational notice. `request_id` is -1 for
    /// connection-wide messages.
    Error {
        request_id: RequestId,
        code: i32,
        message: String,
    },
    /// The connection failed; no more events will follow
    ConnectionClosed {
        reason: String,
    },
}

/// Handle the transport uses to push events into the core
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push one event. Returns false once the core has stopped listening.
    pub fn send(&self, event: InboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outbound calls to the gateway. None of them wait for a reply.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection; decoded events go to `events`
    async fn connect(&self, host: &str, port: u16, client_id: i32, events: EventSender) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn request_next_ids(&self, count: i32) -> Result<()>;

    async fn request_managed_accounts(&self) -> Result<()>;

    async fn request_account_updates(&self, subscribe: bool, account_name: &str) -> Result<()>;

    async fn request_contract_details(&self, request_id: RequestId, instrument: &Instrument) -> Result<()>;

    /// Bind orders entered in the gateway UI to this client (client 0 only)
    async fn request_auto_open_orders(&self, auto_bind: bool) -> Result<()>;

    async fn request_all_open_orders(&self) -> Result<()>;

    async fn request_executions(&self, request_id: RequestId, filter: &ExecutionFilter) -> Result<()>;

    async fn place_order(&self, request_id: RequestId, instrument: &Instrument, spec: &OrderSpec) -> Result<()>;

    async fn cancel_order(&self, request_id: RequestId) -> Result<()>;

    async fn request_historical_data(
        &self,
        request_id: RequestId,
        instrument: &Instrument,
        request: &HistoricalRequest,
    ) -> Result<()>;

    async fn request_market_data(&self, request_id: RequestId, instrument: &Instrument) -> Result<()>;

    async fn cancel_market_data(&self, request_id: RequestId) -> Result<()>;
}
