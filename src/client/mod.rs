//! Caller-facing gateway client
//!
//! [`Client`] ties the request correlator, order ledger, tick router and
//! history pacer to one [`Transport`]. A single dispatch task drains the
//! inbound event stream; every caller operation suspends on its own
//! request id until that task delivers the outcome.

mod account;
mod dispatch;

pub use account::{Account, Holding};

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::correlation::{IdAllocator, RequestCorrelator};
use crate::error::{ClientError, Result};
use crate::history::{
    parse_civil, parse_timezone, plan_windows, Bar, BarCollector, BarSource, HistoricalRequest, HistoryPlan,
    PacingGate,
};
use crate::orders::{BracketChildren, BracketOffsets, Execution, Order, OrderLedger, OrderSpec, OrderStatus};
use crate::ticks::{Tick, TickRouter, TickStream};
use crate::transport::{EventSender, ExecutionFilter, Transport};
use crate::types::{Instrument, PermId, RequestId};

/// What a request id resolves with
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    NextId(RequestId),
    AccountName(String),
    Account(Account),
    Contract(Instrument),
    OrderClosed(OrderStatus),
    OpenOrders(Vec<Order>),
    Bars(Vec<Bar>),
}

fn unexpected(request_id: RequestId, expected: &'static str) -> ClientError {
    ClientError::UnexpectedReply { request_id, expected }
}

/// Requests whose replies carry no request id, or that need routing state
/// beyond the correlator slot
#[derive(Default)]
struct Waiters {
    next_id: Vec<RequestId>,
    account_names: Vec<RequestId>,
    /// Keyed by lowercased account name
    accounts: HashMap<String, Vec<RequestId>>,
    /// First contract seen per request
    contracts: HashMap<RequestId, Option<Instrument>>,
    /// Cancel attempts in flight, by order id
    cancels: HashMap<RequestId, Vec<RequestId>>,
    history: HashSet<RequestId>,
    open_query: Option<RequestId>,
}

struct Shared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    correlator: RequestCorrelator<Reply>,
    ledger: OrderLedger,
    ticks: TickRouter,
    bars: BarCollector,
    gate: Arc<PacingGate>,
    waiters: Mutex<Waiters>,
    account: Mutex<Account>,
    connected: AtomicBool,
}

impl Shared {
    /// Wait for `id` after its request was sent. A failed send unregisters
    /// the request and returns the send error.
    async fn complete<F>(&self, id: RequestId, sent: Result<()>, unregister: F) -> Result<Reply>
    where
        F: FnOnce(&mut Waiters),
    {
        if let Err(error) = sent {
            unregister(&mut self.waiters.lock());
            self.correlator.discard(id);
            return Err(error);
        }
        self.correlator.wait(id).await
    }

    /// Release everything tied to the connection. `None` is a requested
    /// disconnect: tick streams end cleanly, waiters still fail.
    fn shutdown(&self, failure: Option<ClientError>) {
        self.connected.store(false, Ordering::SeqCst);
        let error = failure.clone().unwrap_or(ClientError::Disconnected);
        let released = self.correlator.fail_all(&error);
        let streams = self.ticks.close_all(failure);
        *self.waiters.lock() = Waiters::default();
        self.bars.clear();
        self.ledger.reset_open_query();
        info!(released, streams, "connection state released");
    }
}

#[async_trait]
impl BarSource for Shared {
    fn next_request_id(&self) -> RequestId {
        self.correlator.allocate()
    }

    async fn fetch(&self, request_id: RequestId, instrument: &Instrument, request: &HistoricalRequest) -> Result<Vec<Bar>> {
        self.waiters.lock().history.insert(request_id);
        let sent = self
            .transport
            .request_historical_data(request_id, instrument, request)
            .await;
        let reply = self
            .complete(request_id, sent, |w| {
                w.history.remove(&request_id);
            })
            .await?;
        match reply {
            Reply::Bars(bars) => Ok(bars),
            _ => Err(unexpected(request_id, "bars")),
        }
    }

    fn abandon(&self, request_id: RequestId) {
        self.waiters.lock().history.remove(&request_id);
        self.correlator.discard(request_id);
        self.bars.finish(request_id);
    }
}

/// Client for one gateway connection
pub struct Client {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// One open-orders query at a time
    open_orders: tokio::sync::Mutex<()>,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let ids = Arc::new(IdAllocator::default());
        let gate = Arc::new(PacingGate::new(config.history.pacing_interval()));
        let shared = Shared {
            config,
            transport,
            correlator: RequestCorrelator::new(ids.clone()),
            ledger: OrderLedger::new(ids),
            ticks: TickRouter::new(),
            bars: BarCollector::new(),
            gate,
            waiters: Mutex::new(Waiters::default()),
            account: Mutex::new(Account::default()),
            connected: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
            dispatcher: Mutex::new(None),
            open_orders: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && self.shared.transport.is_connected()
    }

    /// Connect, start event dispatch and fetch the first valid order id
    pub async fn connect(&self) -> Result<RequestId> {
        if self.is_connected() {
            return Err(ClientError::Transport("already connected".to_string()));
        }
        let config = &self.shared.config;
        let (events, rx) = EventSender::channel();
        self.shared
            .transport
            .connect(&config.host, config.port, config.client_id, events)
            .await?;
        self.shared.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(dispatch::run(self.shared.clone(), rx));
        if let Some(previous) = self.dispatcher.lock().replace(task) {
            previous.abort();
        }
        info!(host = %config.host, port = config.port, client_id = config.client_id, "connected to gateway");

        if config.client_id == 0 {
            self.shared.transport.request_auto_open_orders(true).await?;
        }
        self.get_next_valid_id().await
    }

    /// Close the connection. Outstanding requests fail with
    /// [`ClientError::Disconnected`] and tick streams end.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.shared.transport.disconnect().await;
        self.shared.shutdown(None);
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        info!("disconnected from gateway");
        result
    }

    /// Ask the gateway for the next order id. Local ids are raised to it.
    pub async fn get_next_valid_id(&self) -> Result<RequestId> {
        let id = self.shared.correlator.allocate();
        self.shared.waiters.lock().next_id.push(id);
        let sent = self.shared.transport.request_next_ids(1).await;
        let reply = self
            .shared
            .complete(id, sent, |w| w.next_id.retain(|waiting| *waiting != id))
            .await?;
        match reply {
            Reply::NextId(next) => Ok(next),
            _ => Err(unexpected(id, "next id")),
        }
    }

    /// First account managed by this login
    pub async fn get_account_name(&self) -> Result<String> {
        let id = self.shared.correlator.allocate();
        self.shared.waiters.lock().account_names.push(id);
        let sent = self.shared.transport.request_managed_accounts().await;
        let reply = self
            .shared
            .complete(id, sent, |w| w.account_names.retain(|waiting| *waiting != id))
            .await?;
        match reply {
            Reply::AccountName(name) => Ok(name),
            _ => Err(unexpected(id, "account name")),
        }
    }

    /// Snapshot of account values and holdings after one full download
    pub async fn get_account(&self, account_name: &str) -> Result<Account> {
        let key = account_name.to_lowercase();
        let id = self.shared.correlator.allocate();
        {
            let mut account = self.shared.account.lock();
            if !account.account_name.eq_ignore_ascii_case(account_name) {
                *account = Account::new(account_name);
            }
        }
        self.shared
            .waiters
            .lock()
            .accounts
            .entry(key.clone())
            .or_default()
            .push(id);

        let sent = self.shared.transport.request_account_updates(true, account_name).await;
        let subscribed = sent.is_ok();
        let reply = self
            .shared
            .complete(id, sent, |w| {
                if let Some(ids) = w.accounts.get_mut(&key) {
                    ids.retain(|waiting| *waiting != id);
                }
            })
            .await;
        if subscribed {
            if let Err(error) = self.shared.transport.request_account_updates(false, account_name).await {
                debug!(error = %error, "account unsubscribe failed");
            }
        }
        match reply? {
            Reply::Account(account) => Ok(account),
            _ => Err(unexpected(id, "account")),
        }
    }

    /// Full contract for a partially specified instrument. Only symbol,
    /// type, currency and exchange are sent; the first match wins.
    pub async fn resolve_contract(&self, instrument: &Instrument) -> Result<Instrument> {
        let id = self.shared.correlator.allocate();
        self.shared.waiters.lock().contracts.insert(id, None);
        let sent = self
            .shared
            .transport
            .request_contract_details(id, &instrument.basic())
            .await;
        let reply = self
            .shared
            .complete(id, sent, |w| {
                w.contracts.remove(&id);
            })
            .await?;
        match reply {
            Reply::Contract(contract) => Ok(contract),
            _ => Err(unexpected(id, "contract")),
        }
    }

    pub async fn place_order(&self, instrument: &Instrument, spec: OrderSpec) -> Result<RequestId> {
        self.place_bracket_order(instrument, spec, 0.0, 0.0).await
    }

    /// Send an order. Nonzero offsets attach a take-profit and a stop-loss
    /// child, placed once the order fills, at `fill ± offset`.
    pub async fn place_bracket_order(
        &self,
        instrument: &Instrument,
        spec: OrderSpec,
        profit_offset: f64,
        loss_offset: f64,
    ) -> Result<RequestId> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let offsets = BracketOffsets::new(profit_offset, loss_offset);
        let order = self
            .shared
            .ledger
            .place(instrument.clone(), spec, offsets, self.shared.config.client_id);
        info!(
            request_id = order.request_id,
            symbol = %order.instrument.display_symbol(),
            action = %order.spec.action,
            quantity = order.spec.quantity,
            kind = ?order.spec.kind,
            bracket = !offsets.is_empty(),
            "placing order"
        );

        let sent = self
            .shared
            .transport
            .place_order(order.request_id, &order.instrument, &order.spec)
            .await;
        if let Err(error) = sent {
            self.shared.ledger.reject(order.request_id, &error.to_string());
            return Err(error);
        }
        Ok(order.request_id)
    }

    /// Cancel an order and wait for its terminal status. An order that is
    /// already terminal returns its status without contacting the gateway.
    pub async fn cancel_order(&self, request_id: RequestId) -> Result<OrderStatus> {
        let order = self
            .shared
            .ledger
            .order(request_id)
            .ok_or(ClientError::UnknownOrder(request_id))?;
        if order.is_terminal() {
            return Ok(order.status);
        }

        // Each attempt waits on its own id so a rejected cancel can be retried
        let cancel_id = self.shared.correlator.allocate();
        self.shared
            .waiters
            .lock()
            .cancels
            .entry(request_id)
            .or_default()
            .push(cancel_id);
        let forget = |w: &mut Waiters| {
            if let Some(ids) = w.cancels.get_mut(&request_id) {
                ids.retain(|id| *id != cancel_id);
                if ids.is_empty() {
                    w.cancels.remove(&request_id);
                }
            }
        };
        // The order may have closed between the check and the registration
        if let Some(order) = self.shared.ledger.order(request_id).filter(Order::is_terminal) {
            forget(&mut *self.shared.waiters.lock());
            self.shared.correlator.discard(cancel_id);
            return Ok(order.status);
        }

        info!(request_id, cancel_id, "cancelling order");
        let sent = self.shared.transport.cancel_order(request_id).await;
        let reply = self.shared.complete(cancel_id, sent, forget).await?;
        match reply {
            Reply::OrderClosed(status) => Ok(status),
            _ => Err(unexpected(cancel_id, "order status")),
        }
    }

    /// Every open order the gateway knows, each with its executions.
    ///
    /// Completes only after the open-order end marker, the executions end
    /// marker, and a status for every reported order have all arrived.
    pub async fn list_open_orders(&self) -> Result<Vec<Order>> {
        let _serial = self.open_orders.lock().await;
        let id = self.shared.correlator.allocate();
        self.shared.ledger.begin_open_query(id);
        self.shared.waiters.lock().open_query = Some(id);

        let mut sent = self
            .shared
            .transport
            .request_executions(id, &ExecutionFilter::default())
            .await;
        if sent.is_ok() {
            sent = self.shared.transport.request_all_open_orders().await;
        }
        let reply = self
            .shared
            .complete(id, sent, |w| {
                if w.open_query == Some(id) {
                    w.open_query = None;
                }
            })
            .await;
        if reply.is_err() {
            self.shared.ledger.abort_open_query(id);
        }
        match reply? {
            Reply::OpenOrders(orders) => Ok(orders),
            _ => Err(unexpected(id, "open orders")),
        }
    }

    /// Paced retrieval plan for `[start, end)` given as `yyyy-mm-dd hh:mm[:ss]`
    /// civil times in `timezone`. The clock times of `start` and `end` also
    /// bound the session on every day in between.
    pub fn plan_history(&self, instrument: &Instrument, start: &str, end: &str, timezone: &str) -> Result<HistoryPlan> {
        let start = parse_civil(start)?;
        let end = parse_civil(end)?;
        let tz = parse_timezone(timezone)?;
        self.plan_history_session(instrument, start, end, tz, start.time(), end.time())
    }

    /// Like [`Client::plan_history`] with an explicit daily session
    pub fn plan_history_session(
        &self,
        instrument: &Instrument,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tz: Tz,
        session_start: NaiveTime,
        session_end: NaiveTime,
    ) -> Result<HistoryPlan> {
        let settings = self.shared.config.history.clone();
        let windows = plan_windows(start, end, tz, session_start, session_end, &settings)?;
        info!(
            symbol = %instrument.display_symbol(),
            windows = windows.len(),
            tz = %tz,
            "historical plan created"
        );
        let source: Arc<dyn BarSource> = self.shared.clone();
        Ok(HistoryPlan::new(
            instrument.clone(),
            windows,
            settings,
            source,
            self.shared.gate.clone(),
        ))
    }

    /// Stream of merged quotes for `instrument`. Subscribers of the same
    /// symbol and currency share one gateway subscription.
    pub async fn subscribe_ticks(&self, instrument: &Instrument) -> Result<TickStream> {
        self.shared.cancel_released().await;
        let subscribed = self
            .shared
            .ticks
            .subscribe(instrument, || self.shared.correlator.allocate());
        if let Some(request_id) = subscribed.new_request {
            if let Err(error) = self.shared.transport.request_market_data(request_id, instrument).await {
                self.shared.ticks.unsubscribe(&instrument.key());
                return Err(error);
            }
        }
        Ok(subscribed.stream)
    }

    /// End every stream for the instrument's key. Returns false when there
    /// was no subscription. Dropping every stream of a key also cancels it.
    pub async fn unsubscribe_ticks(&self, instrument: &Instrument) -> Result<bool> {
        self.shared.cancel_released().await;
        match self.shared.ticks.unsubscribe(&instrument.key()) {
            Some(request_id) => {
                self.shared.transport.cancel_market_data(request_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn order(&self, request_id: RequestId) -> Option<Order> {
        self.shared.ledger.order(request_id)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.shared.ledger.orders()
    }

    pub fn bracket_children(&self, parent_id: RequestId) -> Option<BracketChildren> {
        self.shared.ledger.bracket_children(parent_id)
    }

    pub fn executions(&self, perm_id: PermId) -> Vec<Execution> {
        self.shared.ledger.executions(perm_id)
    }

    /// Inconsistencies seen on the event path, oldest first
    pub fn diagnostics(&self) -> Vec<String> {
        self.shared.ledger.diagnostics()
    }

    /// Last downloaded account values, kept up to date while subscribed
    pub fn account_snapshot(&self) -> Account {
        self.shared.account.lock().clone()
    }

    pub fn last_tick(&self, instrument: &Instrument) -> Option<Tick> {
        self.shared.ticks.snapshot(&instrument.key())
    }
}
