//! Transport that hands every outbound call to an external wire codec

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::{EventSender, ExecutionFilter, Transport};
use crate::error::{ClientError, Result};
use crate::history::HistoricalRequest;
use crate::orders::OrderSpec;
use crate::types::{Instrument, RequestId};

/// One outbound call, as seen by the wire codec
#[derive(Debug, Clone)]
pub enum WireCommand {
    Connect {
        host: String,
        port: u16,
        client_id: i32,
        /// Where the codec pushes decoded events
        events: EventSender,
    },
    Disconnect,
    RequestNextIds(i32),
    RequestManagedAccounts,
    RequestAccountUpdates {
        subscribe: bool,
        account_name: String,
    },
    RequestContractDetails {
        request_id: RequestId,
        instrument: Instrument,
    },
    RequestAutoOpenOrders(bool),
    RequestAllOpenOrders,
    RequestExecutions {
        request_id: RequestId,
        filter: ExecutionFilter,
    },
    PlaceOrder {
        request_id: RequestId,
        instrument: Instrument,
        spec: OrderSpec,
    },
    CancelOrder(RequestId),
    RequestHistoricalData {
        request_id: RequestId,
        instrument: Instrument,
        request: HistoricalRequest,
    },
    RequestMarketData {
        request_id: RequestId,
        instrument: Instrument,
    },
    CancelMarketData(RequestId),
}

impl WireCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::RequestNextIds(_) => "req_ids",
            Self::RequestManagedAccounts => "req_managed_accts",
            Self::RequestAccountUpdates { .. } => "req_account_updates",
            Self::RequestContractDetails { .. } => "req_contract_details",
            Self::RequestAutoOpenOrders(_) => "req_auto_open_orders",
            Self::RequestAllOpenOrders => "req_all_open_orders",
            Self::RequestExecutions { .. } => "req_executions",
            Self::PlaceOrder { .. } => "place_order",
            Self::CancelOrder(_) => "cancel_order",
            Self::RequestHistoricalData { .. } => "req_historical_data",
            Self::RequestMarketData { .. } => "req_mkt_data",
            Self::CancelMarketData(_) => "cancel_mkt_data",
        }
    }
}

/// Live transport: forwards calls as [`WireCommand`]s over a channel
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<WireCommand>,
    connected: AtomicBool,
}

impl ChannelTransport {
    /// Transport plus the receiving end for the wire codec
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WireCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let transport = Self {
            commands,
            connected: AtomicBool::new(false),
        };
        (transport, rx)
    }

    fn send(&self, command: WireCommand) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        self.forward(command)
    }

    fn forward(&self, command: WireCommand) -> Result<()> {
        debug!(command = command.name(), "wire command");
        self.commands.send(command).map_err(|_| {
            self.connected.store(false, Ordering::SeqCst);
            ClientError::Transport("wire codec has shut down".to_string())
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, host: &str, port: u16, client_id: i32, events: EventSender) -> Result<()> {
        self.forward(WireCommand::Connect {
            host: host.to_string(),
            port,
            client_id,
            events,
        })?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.forward(WireCommand::Disconnect)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    async fn request_next_ids(&self, count: i32) -> Result<()> {
        self.send(WireCommand::RequestNextIds(count))
    }

    async fn request_managed_accounts(&self) -> Result<()> {
        self.send(WireCommand::RequestManagedAccounts)
    }

    async fn request_account_updates(&self, subscribe: bool, account_name: &str) -> Result<()> {
        self.send(WireCommand::RequestAccountUpdates {
            subscribe,
            account_name: account_name.to_string(),
        })
    }

    async fn request_contract_details(&self, request_id: RequestId, instrument: &Instrument) -> Result<()> {
        self.send(WireCommand::RequestContractDetails {
            request_id,
            instrument: instrument.clone(),
        })
    }

    async fn request_auto_open_orders(&self, auto_bind: bool) -> Result<()> {
        self.send(WireCommand::RequestAutoOpenOrders(auto_bind))
    }

    async fn request_all_open_orders(&self) -> Result<()> {
        self.send(WireCommand::RequestAllOpenOrders)
    }

    async fn request_executions(&self, request_id: RequestId, filter: &ExecutionFilter) -> Result<()> {
        self.send(WireCommand::RequestExecutions {
            request_id,
            filter: filter.clone(),
        })
    }

    async fn place_order(&self, request_id: RequestId, instrument: &Instrument, spec: &OrderSpec) -> Result<()> {
        self.send(WireCommand::PlaceOrder {
            request_id,
            instrument: instrument.clone(),
            spec: spec.clone(),
        })
    }

    async fn cancel_order(&self, request_id: RequestId) -> Result<()> {
        self.send(WireCommand::CancelOrder(request_id))
    }

    async fn request_historical_data(
        &self,
        request_id: RequestId,
        instrument: &Instrument,
        request: &HistoricalRequest,
    ) -> Result<()> {
        self.send(WireCommand::RequestHistoricalData {
            request_id,
            instrument: instrument.clone(),
            request: request.clone(),
        })
    }

    async fn request_market_data(&self, request_id: RequestId, instrument: &Instrument) -> Result<()> {
        self.send(WireCommand::RequestMarketData {
            request_id,
            instrument: instrument.clone(),
        })
    }

    async fn cancel_market_data(&self, request_id: RequestId) -> Result<()> {
        self.send(WireCommand::CancelMarketData(request_id))
    }
}
