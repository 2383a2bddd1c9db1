//! Offline transport with a local matching simulator
//!
//! Generates the same inbound events a gateway would: acknowledgements,
//! fills against pushed quotes, executions, OCA cancellations, ticks,
//! historical bars and a small account snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use super::{EventSender, ExecutionFilter, InboundEvent, PortfolioUpdate, Transport};
use crate::error::{ClientError, Result};
use crate::history::{Bar, HistoricalRequest};
use crate::orders::{Execution, OcaType, OpenOrderReport, OrderKind, OrderSpec, StatusUpdate};
use crate::types::{Action, Instrument, InstrumentKey, PermId, RequestId, SecType};

#[derive(Debug, Clone, Copy)]
struct Quote {
    bid: f64,
    ask: f64,
}

struct SimOrder {
    perm_id: PermId,
    instrument: Instrument,
    spec: OrderSpec,
    status: &'static str,
    filled: f64,
    avg_fill_price: f64,
}

impl SimOrder {
    fn is_working(&self) -> bool {
        self.status == "Submitted"
    }

    /// Fill price against `quote`, if the order would trade
    fn fill_price(&self, quote: Quote) -> Option<f64> {
        if quote.bid <= 0.0 || quote.ask <= 0.0 {
            return None;
        }
        let buy = self.spec.action == Action::Buy;
        let price = if buy { quote.ask } else { quote.bid };
        let fills = match self.spec.kind {
            OrderKind::Market => true,
            OrderKind::Limit { price: limit } => (buy && price <= limit) || (!buy && price >= limit),
            OrderKind::Stop { price: stop } => (buy && price >= stop) || (!buy && price <= stop),
        };
        fills.then_some(price)
    }
}

struct Position {
    instrument: Instrument,
    quantity: f64,
    average_cost: f64,
    realized: f64,
}

struct SimState {
    events: Option<EventSender>,
    client_id: i32,
    next_perm: PermId,
    next_order_id: RequestId,
    orders: BTreeMap<RequestId, SimOrder>,
    quotes: HashMap<InstrumentKey, Quote>,
    market_data: HashMap<RequestId, InstrumentKey>,
    history: HashMap<InstrumentKey, Vec<Bar>>,
    fills: Vec<(Instrument, Execution)>,
    positions: HashMap<InstrumentKey, Position>,
    cash: f64,
}

impl SimState {
    fn emit(&self, event: InboundEvent) {
        if let Some(events) = &self.events {
            if !events.send(event) {
                debug!("simulated event dropped; core stopped listening");
            }
        }
    }

    fn status_event(&self, request_id: RequestId, order: &SimOrder) -> InboundEvent {
        InboundEvent::OrderStatus(StatusUpdate {
            request_id,
            status: order.status.to_string(),
            filled: order.filled,
            remaining: order.spec.quantity - order.filled,
            avg_fill_price: order.avg_fill_price,
            perm_id: order.perm_id,
            parent_id: 0,
            last_fill_price: order.avg_fill_price,
            client_id: self.client_id,
        })
    }

    fn open_order_event(&self, request_id: RequestId, order: &SimOrder) -> InboundEvent {
        InboundEvent::OpenOrder(OpenOrderReport {
            request_id,
            perm_id: order.perm_id,
            client_id: self.client_id,
            instrument: order.instrument.clone(),
            spec: order.spec.clone(),
            status: order.status.to_string(),
        })
    }

    /// Fill every working order on `key` that trades at the current quote
    fn match_orders(&mut self, key: &InstrumentKey) {
        let Some(quote) = self.quotes.get(key).copied() else {
            return;
        };
        let candidates: Vec<(RequestId, f64)> = self
            .orders
            .iter()
            .filter(|(_, o)| o.is_working() && o.instrument.key() == *key)
            .filter_map(|(id, o)| o.fill_price(quote).map(|p| (*id, p)))
            .collect();

        for (request_id, price) in candidates {
            self.fill(request_id, price);
        }
    }

    fn fill(&mut self, request_id: RequestId, price: f64) {
        let Some(order) = self.orders.get_mut(&request_id) else {
            return;
        };
        // An earlier fill in the same pass may have cancelled it through OCA
        if !order.is_working() {
            return;
        }
        order.status = "Filled";
        order.filled = order.spec.quantity;
        order.avg_fill_price = price;

        let instrument = order.instrument.clone();
        let spec = order.spec.clone();
        let execution = Execution {
            exec_id: Uuid::new_v4().to_string(),
            perm_id: order.perm_id,
            request_id,
            side: spec.action,
            quantity: spec.quantity,
            price,
            cum_quantity: spec.quantity,
            avg_price: price,
            time: Utc::now(),
        };
        info!(request_id, price, side = %spec.action, "simulated fill");

        self.apply_position(&instrument, spec.action, spec.quantity, price);
        self.fills.push((instrument.clone(), execution.clone()));
        self.emit(InboundEvent::ExecDetails {
            request_id: -1,
            instrument,
            execution,
        });
        if let Some(order) = self.orders.get(&request_id) {
            self.emit(self.status_event(request_id, order));
        }

        if spec.oca_type == OcaType::CancelOnFill {
            if let Some(group) = spec.oca_group {
                self.cancel_group(&group, request_id);
            }
        }
    }

    fn cancel_group(&mut self, group: &str, filled_id: RequestId) {
        let siblings: Vec<RequestId> = self
            .orders
            .iter()
            .filter(|(id, o)| **id != filled_id && o.is_working() && o.spec.oca_group.as_deref() == Some(group))
            .map(|(id, _)| *id)
            .collect();
        for id in siblings {
            debug!(request_id = id, group, "cancelling OCA sibling");
            self.cancel(id);
        }
    }

    fn cancel(&mut self, request_id: RequestId) -> bool {
        let Some(order) = self.orders.get_mut(&request_id) else {
            return false;
        };
        if !order.is_working() {
            return false;
        }
        order.status = "Cancelled";
        if let Some(order) = self.orders.get(&request_id) {
            self.emit(self.status_event(request_id, order));
        }
        true
    }

    fn apply_position(&mut self, instrument: &Instrument, side: Action, quantity: f64, price: f64) {
        let signed = quantity * side.direction();
        self.cash -= signed * price;

        let position = self.positions.entry(instrument.key()).or_insert_with(|| Position {
            instrument: instrument.clone(),
            quantity: 0.0,
            average_cost: 0.0,
            realized: 0.0,
        });
        let before = position.quantity;
        let after = before + signed;
        if before == 0.0 || before.signum() == signed.signum() {
            position.average_cost = (position.average_cost * before.abs() + price * quantity) / after.abs();
        } else {
            let closed = quantity.min(before.abs());
            position.realized += closed * (price - position.average_cost) * before.signum();
            if after != 0.0 && after.signum() != before.signum() {
                position.average_cost = price;
            }
        }
        position.quantity = after;
    }

    fn mark(&self, key: &InstrumentKey, fallback: f64) -> f64 {
        self.quotes
            .get(key)
            .map(|q| (q.bid + q.ask) / 2.0)
            .unwrap_or(fallback)
    }
}

/// Offline gateway stand-in
pub struct SimulatedTransport {
    account: String,
    state: Mutex<SimState>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new("DU0000000", 100_000.0)
    }
}

impl SimulatedTransport {
    pub fn new(account: &str, starting_cash: f64) -> Self {
        Self {
            account: account.to_string(),
            state: Mutex::new(SimState {
                events: None,
                client_id: 0,
                next_perm: 1_000_000,
                next_order_id: 1,
                orders: BTreeMap::new(),
                quotes: HashMap::new(),
                market_data: HashMap::new(),
                history: HashMap::new(),
                fills: Vec::new(),
                positions: HashMap::new(),
                cash: starting_cash,
            }),
        }
    }

    /// Set the current quote, forward it to live subscriptions and match
    /// working orders against it
    pub fn push_quote(&self, instrument: &Instrument, bid: f64, ask: f64) {
        let key = instrument.key();
        let mut state = self.state.lock();
        state.quotes.insert(key.clone(), Quote { bid, ask });

        let subscribers: Vec<RequestId> = state
            .market_data
            .iter()
            .filter(|(_, k)| **k == key)
            .map(|(id, _)| *id)
            .collect();
        for request_id in subscribers {
            state.emit(InboundEvent::TickPrice {
                request_id,
                field: 1,
                price: bid,
            });
            state.emit(InboundEvent::TickPrice {
                request_id,
                field: 2,
                price: ask,
            });
        }

        state.match_orders(&key);
    }

    /// Bars served to historical requests for `instrument`
    pub fn load_history(&self, instrument: &Instrument, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.time);
        self.state.lock().history.insert(instrument.key(), bars);
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().cash
    }

    fn connected(&self) -> Result<parking_lot::MutexGuard<'_, SimState>> {
        let state = self.state.lock();
        if state.events.is_none() {
            return Err(ClientError::NotConnected);
        }
        Ok(state)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self, host: &str, port: u16, client_id: i32, events: EventSender) -> Result<()> {
        let mut state = self.state.lock();
        if state.events.is_some() {
            return Err(ClientError::Transport("already connected".to_string()));
        }
        info!(host, port, client_id, "simulated gateway connected");
        state.events = Some(events);
        state.client_id = client_id;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.events = None;
        state.market_data.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    async fn request_next_ids(&self, _count: i32) -> Result<()> {
        let state = self.connected()?;
        state.emit(InboundEvent::NextValidId(state.next_order_id));
        Ok(())
    }

    async fn request_managed_accounts(&self) -> Result<()> {
        let state = self.connected()?;
        state.emit(InboundEvent::ManagedAccounts(self.account.clone()));
        Ok(())
    }

    async fn request_account_updates(&self, subscribe: bool, account_name: &str) -> Result<()> {
        let state = self.connected()?;
        if !subscribe {
            return Ok(());
        }

        let holdings: f64 = state
            .positions
            .iter()
            .map(|(key, p)| p.quantity * state.mark(key, p.average_cost))
            .sum();
        let net_liquidation = state.cash + holdings;
        let values = [
            ("NetLiquidation", net_liquidation),
            ("EquityWithLoanValue", net_liquidation),
            ("PreviousDayEquityWithLoanValue", net_liquidation),
            ("TotalCashValue", state.cash),
            ("InitMarginReq", 0.0),
            ("MaintMarginReq", 0.0),
            ("AvailableFunds", state.cash),
            ("ExcessLiquidity", state.cash),
            ("SMA", 0.0),
            ("BuyingPower", state.cash * 4.0),
        ];
        for (key, value) in values {
            state.emit(InboundEvent::AccountValue {
                key: key.to_string(),
                value: format!("{:.2}", value),
                currency: "USD".to_string(),
                account_name: account_name.to_string(),
            });
        }
        state.emit(InboundEvent::AccountTime(Utc::now().format("%H:%M").to_string()));

        for (key, position) in &state.positions {
            let mark = state.mark(key, position.average_cost);
            state.emit(InboundEvent::Portfolio(PortfolioUpdate {
                instrument: position.instrument.clone(),
                position: position.quantity,
                market_price: mark,
                market_value: position.quantity * mark,
                average_cost: position.average_cost,
                unrealized_pnl: position.quantity * (mark - position.average_cost),
                realized_pnl: position.realized,
                account_name: account_name.to_string(),
            }));
        }
        state.emit(InboundEvent::AccountDownloadEnd(account_name.to_string()));
        Ok(())
    }

    async fn request_contract_details(&self, request_id: RequestId, instrument: &Instrument) -> Result<()> {
        let state = self.connected()?;
        if !instrument.symbol.is_empty() {
            let mut resolved = instrument.clone();
            resolved.local_symbol = match instrument.sec_type {
                SecType::Cash => format!("{}.{}", instrument.symbol, instrument.currency),
                _ => instrument.symbol.clone(),
            };
            resolved.primary_exchange = instrument.exchange.clone();
            resolved.con_id = instrument
                .symbol
                .bytes()
                .chain(instrument.currency.bytes())
                .fold(17i64, |acc, b| (acc * 31 + i64::from(b)) % 10_000_000);
            state.emit(InboundEvent::ContractDetails {
                request_id,
                instrument: resolved,
            });
        }
        state.emit(InboundEvent::ContractDetailsEnd(request_id));
        Ok(())
    }

    async fn request_auto_open_orders(&self, auto_bind: bool) -> Result<()> {
        let _state = self.connected()?;
        debug!(auto_bind, "auto open orders");
        Ok(())
    }

    async fn request_all_open_orders(&self) -> Result<()> {
        let state = self.connected()?;
        for (request_id, order) in state.orders.iter().filter(|(_, o)| o.is_working()) {
            state.emit(state.open_order_event(*request_id, order));
            state.emit(state.status_event(*request_id, order));
        }
        state.emit(InboundEvent::OpenOrderEnd);
        Ok(())
    }

    async fn request_executions(&self, request_id: RequestId, filter: &ExecutionFilter) -> Result<()> {
        let state = self.connected()?;
        let matching = state.fills.iter().filter(|(instrument, _)| {
            filter
                .symbol
                .as_deref()
                .map_or(true, |s| s.eq_ignore_ascii_case(&instrument.symbol))
        });
        for (instrument, execution) in matching {
            state.emit(InboundEvent::ExecDetails {
                request_id,
                instrument: instrument.clone(),
                execution: execution.clone(),
            });
        }
        state.emit(InboundEvent::ExecDetailsEnd(request_id));
        Ok(())
    }

    async fn place_order(&self, request_id: RequestId, instrument: &Instrument, spec: &OrderSpec) -> Result<()> {
        let mut state = self.connected()?;
        if state.orders.get(&request_id).is_some_and(|o| !o.is_working()) {
            state.emit(InboundEvent::Error {
                request_id,
                code: 103,
                message: "Duplicate order id".to_string(),
            });
            return Ok(());
        }

        let perm_id = state.next_perm;
        state.next_perm += 1;
        state.next_order_id = state.next_order_id.max(request_id + 1);

        let order = SimOrder {
            perm_id,
            instrument: instrument.clone(),
            spec: spec.clone(),
            status: "Submitted",
            filled: 0.0,
            avg_fill_price: 0.0,
        };
        state.emit(state.open_order_event(request_id, &order));
        state.emit(state.status_event(request_id, &order));
        state.orders.insert(request_id, order);

        state.match_orders(&instrument.key());
        Ok(())
    }

    async fn cancel_order(&self, request_id: RequestId) -> Result<()> {
        let mut state = self.connected()?;
        if !state.cancel(request_id) {
            state.emit(InboundEvent::Error {
                request_id,
                code: 10147,
                message: format!("OrderId {} that needs to be cancelled is not found", request_id),
            });
        }
        Ok(())
    }

    async fn request_historical_data(
        &self,
        request_id: RequestId,
        instrument: &Instrument,
        request: &HistoricalRequest,
    ) -> Result<()> {
        let state = self.connected()?;
        let Some((start, end)) = window_bounds(request) else {
            state.emit(InboundEvent::Error {
                request_id,
                code: 321,
                message: format!("invalid historical request: {} / {}", request.end_time, request.duration),
            });
            return Ok(());
        };

        if let Some(bars) = state.history.get(&instrument.key()) {
            for bar in bars.iter().filter(|b| b.time >= start && b.time < end) {
                state.emit(InboundEvent::HistoricalBar {
                    request_id,
                    bar: bar.clone(),
                });
            }
        }
        state.emit(InboundEvent::HistoricalDataEnd(request_id));
        Ok(())
    }

    async fn request_market_data(&self, request_id: RequestId, instrument: &Instrument) -> Result<()> {
        let mut state = self.connected()?;
        let key = instrument.key();
        if let Some(quote) = state.quotes.get(&key).copied() {
            state.emit(InboundEvent::TickPrice {
                request_id,
                field: 1,
                price: quote.bid,
            });
            state.emit(InboundEvent::TickPrice {
                request_id,
                field: 2,
                price: quote.ask,
            });
        }
        state.market_data.insert(request_id, key);
        Ok(())
    }

    async fn cancel_market_data(&self, request_id: RequestId) -> Result<()> {
        let mut state = self.connected()?;
        state.market_data.remove(&request_id);
        Ok(())
    }
}

/// `[end - duration, end)` from a historical request
fn window_bounds(request: &HistoricalRequest) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = NaiveDateTime::parse_from_str(&request.end_time, "%Y%m%d %H:%M:%S UTC")
        .ok()?
        .and_utc();
    let seconds: i64 = request.duration.strip_suffix(" S")?.trim().parse().ok()?;
    Some((end - Duration::seconds(seconds), end))
}
