//! Authoritative store of orders and executions
//!
//! The ledger is mutated only from the event-delivery path. Each inbound
//! hook returns the [`LedgerEffect`]s the caller must carry out (placing
//! bracket children, resolving waiters) once the ledger lock is released.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::bracket::{child_specs, BracketChild, BracketChildren, BracketOffsets, BracketPlacement, ChildRole};
use super::order::{Execution, Order, OrderSpec, OrderStatus};
use crate::correlation::IdAllocator;
use crate::types::{Instrument, PermId, RequestId};

const MAX_DIAGNOSTICS: usize = 256;
const MAX_PARKED: usize = 1024;

/// Order status push
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub request_id: RequestId,
    /// Gateway status string, e.g. `PreSubmitted`
    pub status: String,
    pub filled: f64,
    pub remaining: f64,
    pub avg_fill_price: f64,
    pub perm_id: PermId,
    /// Gateway-side parent link (0 when none)
    pub parent_id: RequestId,
    pub last_fill_price: f64,
    pub client_id: i32,
}

/// Open order report
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrderReport {
    pub request_id: RequestId,
    pub perm_id: PermId,
    pub client_id: i32,
    pub instrument: Instrument,
    pub spec: OrderSpec,
    pub status: String,
}

/// Work the caller must do after a ledger update
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEffect {
    /// A parent filled; send these children
    PlaceBracket(BracketPlacement),
    /// An order reached a terminal status
    Closed {
        request_id: RequestId,
        status: OrderStatus,
    },
    /// The open-orders query finished
    OpenOrdersReady {
        query_id: RequestId,
        orders: Vec<Order>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryAck {
    AwaitingAck,
    StatusSeen,
}

/// In-flight "all open orders + executions" query
struct OpenOrdersQuery {
    query_id: RequestId,
    acks: HashMap<RequestId, QueryAck>,
    /// Statuses parked during the query, as (request id, perm id)
    unmatched: Vec<(RequestId, PermId)>,
    orders_end: bool,
    executions_end: bool,
}

/// Whether a status event and an order report describe the same order.
/// Permanent ids decide when both sides carry one.
fn same_order(update: (RequestId, PermId), report: (RequestId, PermId)) -> bool {
    if update.1 != 0 && report.1 != 0 {
        update.1 == report.1
    } else {
        update.0 != 0 && update.0 == report.0
    }
}

#[derive(Default)]
struct LedgerState {
    orders: HashMap<RequestId, Order>,
    by_perm: HashMap<PermId, RequestId>,
    /// Executions per permanent id, in arrival order
    executions: HashMap<PermId, Vec<Execution>>,
    pending_brackets: HashMap<RequestId, BracketOffsets>,
    bracket_children: HashMap<RequestId, BracketChildren>,
    /// Status events that matched no order yet
    parked: Vec<StatusUpdate>,
    open_query: Option<OpenOrdersQuery>,
    diagnostics: VecDeque<String>,
}

/// Orders keyed by request id and permanent id, with bracket bookkeeping
pub struct OrderLedger {
    ids: Arc<IdAllocator>,
    state: Mutex<LedgerState>,
}

impl OrderLedger {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Record a new order as pending, with optional bracket offsets.
    /// Returns the stored order; its request id is freshly allocated.
    pub fn place(&self, instrument: Instrument, spec: OrderSpec, offsets: BracketOffsets, client_id: i32) -> Order {
        let request_id = self.ids.allocate();
        let mut order = Order::new(request_id, instrument, spec);
        order.client_id = client_id;

        let mut state = self.state.lock();
        if !offsets.is_empty() {
            state.pending_brackets.insert(request_id, offsets);
        }
        state.orders.insert(request_id, order.clone());
        debug!(request_id, "order recorded");
        order
    }

    pub fn on_open_order(&self, report: OpenOrderReport) -> Vec<LedgerEffect> {
        let mut effects = Vec::new();
        let mut state = self.state.lock();

        let id = match state.lookup(report.perm_id, report.request_id) {
            Some(id) => id,
            None => {
                let Some(id) = state.foreign_id(&report, &self.ids) else {
                    state.note(format!(
                        "open order report without order id or perm id for {}",
                        report.instrument.display_symbol()
                    ));
                    return effects;
                };
                info!(
                    request_id = id,
                    gateway_order_id = report.request_id,
                    perm_id = report.perm_id,
                    client_id = report.client_id,
                    "tracking order placed outside this session"
                );
                let mut order = Order::new(id, report.instrument.clone(), report.spec.clone());
                order.client_id = report.client_id;
                state.orders.insert(id, order);
                id
            }
        };

        if let Some(order) = state.orders.get_mut(&id) {
            if report.perm_id != 0 {
                order.perm_id = report.perm_id;
            }
            if !report.instrument.local_symbol.is_empty() {
                order.instrument = report.instrument.clone();
            }
        }
        if report.perm_id != 0 {
            state.by_perm.insert(report.perm_id, id);
        }
        if let Some(query) = state.open_query.as_mut() {
            query.acks.entry(id).or_insert(QueryAck::AwaitingAck);
        }

        let reported = (report.request_id, report.perm_id);
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.parked)
            .into_iter()
            .partition(|u| same_order((u.request_id, u.perm_id), reported));
        state.parked = rest;
        if let Some(query) = state.open_query.as_mut() {
            query.unmatched.retain(|parked| !same_order(*parked, reported));
        }
        for update in &matching {
            debug!(request_id = id, status = %update.status, "applying parked status");
            state.apply_status(id, update, &self.ids, &mut effects);
        }

        state.advance(id, &report.status, &mut effects);
        state.check_query(&mut effects);
        effects
    }

    pub fn on_order_status(&self, update: StatusUpdate) -> Vec<LedgerEffect> {
        let mut effects = Vec::new();
        let mut state = self.state.lock();

        match state.lookup(update.perm_id, update.request_id) {
            Some(id) => state.apply_status(id, &update, &self.ids, &mut effects),
            None => {
                state.note(format!(
                    "status {} for unknown order {} (perm {}) parked",
                    update.status, update.request_id, update.perm_id
                ));
                if let Some(query) = state.open_query.as_mut() {
                    query.unmatched.push((update.request_id, update.perm_id));
                }
                if state.parked.len() >= MAX_PARKED {
                    state.parked.remove(0);
                }
                state.parked.push(update);
            }
        }

        state.check_query(&mut effects);
        effects
    }

    /// Record a fill. Duplicate execution ids are ignored.
    pub fn on_execution(&self, execution: Execution) {
        let mut state = self.state.lock();
        let list = state.executions.entry(execution.perm_id).or_default();
        if list.iter().any(|e| e.exec_id == execution.exec_id) {
            debug!(exec_id = %execution.exec_id, "duplicate execution ignored");
            return;
        }
        list.push(execution);
    }

    /// Start tracking an open-orders query. Any earlier unfinished query is
    /// superseded. Every order already known to be working must report a
    /// status before the query can finish.
    pub fn begin_open_query(&self, query_id: RequestId) {
        let mut state = self.state.lock();
        if let Some(previous) = state.open_query.take() {
            state.note(format!("open orders query {} superseded by {}", previous.query_id, query_id));
        }
        let acks = state
            .orders
            .iter()
            .filter(|(_, order)| !order.is_terminal())
            .map(|(id, _)| (*id, QueryAck::AwaitingAck))
            .collect();
        state.open_query = Some(OpenOrdersQuery {
            query_id,
            acks,
            unmatched: Vec::new(),
            orders_end: false,
            executions_end: false,
        });
    }

    /// Stop tracking the query `query_id` without producing a result
    pub fn abort_open_query(&self, query_id: RequestId) {
        let mut state = self.state.lock();
        if state.open_query.as_ref().is_some_and(|q| q.query_id == query_id) {
            state.open_query = None;
        }
    }

    pub fn on_open_orders_end(&self) -> Vec<LedgerEffect> {
        let mut effects = Vec::new();
        let mut state = self.state.lock();
        if let Some(query) = state.open_query.as_mut() {
            query.orders_end = true;
        }
        state.check_query(&mut effects);
        effects
    }

    pub fn on_executions_end(&self, query_id: RequestId) -> Vec<LedgerEffect> {
        let mut effects = Vec::new();
        let mut state = self.state.lock();
        match state.open_query.as_mut() {
            Some(query) if query.query_id == query_id => query.executions_end = true,
            _ => debug!(request_id = query_id, "executions end for no active query"),
        }
        state.check_query(&mut effects);
        effects
    }

    /// Attach a gateway error to an order. Returns false if the id is not an order.
    pub fn on_error(&self, request_id: RequestId, message: &str) -> bool {
        let mut state = self.state.lock();
        match state.orders.get_mut(&request_id) {
            Some(order) => {
                order.last_error = Some(message.to_string());
                order.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Close an order the gateway never accepted, e.g. because the send failed
    pub fn reject(&self, request_id: RequestId, reason: &str) -> Vec<LedgerEffect> {
        let mut effects = Vec::new();
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(&request_id) {
            order.last_error = Some(reason.to_string());
        }
        state.advance(request_id, "Inactive", &mut effects);
        effects
    }

    /// Drop whatever open-orders query is in flight
    pub fn reset_open_query(&self) {
        self.state.lock().open_query = None;
    }

    /// Order with its current executions
    pub fn order(&self, request_id: RequestId) -> Option<Order> {
        self.state.lock().snapshot(request_id)
    }

    /// Every known order, by request id
    pub fn orders(&self) -> Vec<Order> {
        let state = self.state.lock();
        let mut ids: Vec<RequestId> = state.orders.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| state.snapshot(id)).collect()
    }

    pub fn bracket_children(&self, parent_id: RequestId) -> Option<BracketChildren> {
        self.state.lock().bracket_children.get(&parent_id).copied()
    }

    pub fn has_pending_bracket(&self, request_id: RequestId) -> bool {
        self.state.lock().pending_brackets.contains_key(&request_id)
    }

    pub fn executions(&self, perm_id: PermId) -> Vec<Execution> {
        self.state.lock().executions.get(&perm_id).cloned().unwrap_or_default()
    }

    /// Recent ledger inconsistencies, oldest first
    pub fn diagnostics(&self) -> Vec<String> {
        self.state.lock().diagnostics.iter().cloned().collect()
    }

    /// Record a diagnostic from outside the ledger
    pub fn note(&self, message: impl Into<String>) {
        self.state.lock().note(message.into());
    }
}

impl LedgerState {
    fn lookup(&self, perm_id: PermId, request_id: RequestId) -> Option<RequestId> {
        if perm_id != 0 {
            if let Some(id) = self.by_perm.get(&perm_id) {
                return Some(*id);
            }
        }
        match self.orders.get(&request_id) {
            // Same request id but a different permanent id is someone else's order
            Some(order) if perm_id != 0 && order.perm_id != 0 && order.perm_id != perm_id => None,
            Some(_) => Some(request_id),
            None => None,
        }
    }

    /// Local id for an order first seen in an open-order report. The
    /// gateway's id is kept when it is free; UI orders (id 0) and clashes
    /// fall back to the negated permanent id.
    fn foreign_id(&self, report: &OpenOrderReport, ids: &IdAllocator) -> Option<RequestId> {
        if report.request_id > 0 && !self.orders.contains_key(&report.request_id) {
            // Never hand the same id to one of our own orders later
            ids.raise_floor(report.request_id + 1);
            return Some(report.request_id);
        }
        if report.perm_id > 0 {
            return Some(-report.perm_id);
        }
        None
    }

    fn apply_status(
        &mut self,
        id: RequestId,
        update: &StatusUpdate,
        ids: &IdAllocator,
        effects: &mut Vec<LedgerEffect>,
    ) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        order.filled = update.filled;
        order.remaining = update.remaining;
        order.avg_fill_price = update.avg_fill_price;
        order.last_fill_price = update.last_fill_price;
        order.client_id = update.client_id;
        if update.perm_id != 0 && order.perm_id == 0 {
            order.perm_id = update.perm_id;
            self.by_perm.insert(update.perm_id, id);
        }

        let reported = OrderStatus::from_wire(&update.status).is_some_and(|s| s != OrderStatus::Pending);
        if let Some(query) = self.open_query.as_mut().filter(|_| reported) {
            query.acks.insert(id, QueryAck::StatusSeen);
        }

        self.advance(id, &update.status, effects);
        self.try_bracket(id, ids, effects);
    }

    /// Move an order along the status progression
    fn advance(&mut self, id: RequestId, wire_status: &str, effects: &mut Vec<LedgerEffect>) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        order.updated_at = Utc::now();

        let Some(next) = OrderStatus::from_wire(wire_status) else {
            return;
        };
        let was = order.status;
        if next == was {
            return;
        }
        if !was.can_advance_to(next) {
            debug!(request_id = id, from = %was, to = %next, "ignoring status regression");
            return;
        }

        order.status = next;
        debug!(request_id = id, status = %next, "order status");
        if next.is_terminal() {
            effects.push(LedgerEffect::Closed {
                request_id: id,
                status: next,
            });
            if next == OrderStatus::Cancelled && self.pending_brackets.remove(&id).is_some() {
                debug!(request_id = id, "dropping bracket offsets of cancelled order");
            }
        }
    }

    /// Place children for a filled parent. Offsets are removed as they are
    /// read, so redelivered fill events find nothing to place.
    fn try_bracket(&mut self, id: RequestId, ids: &IdAllocator, effects: &mut Vec<LedgerEffect>) {
        let Some(parent) = self.orders.get(&id) else {
            return;
        };
        if parent.status != OrderStatus::Filled || !self.pending_brackets.contains_key(&id) {
            return;
        }
        if parent.avg_fill_price == 0.0 {
            let message = format!("order {} filled with zero average price; bracket deferred", id);
            self.note(message);
            return;
        }
        let Some(offsets) = self.pending_brackets.remove(&id) else {
            return;
        };
        let parent = parent.clone();

        let mut record = BracketChildren::default();
        let mut children = Vec::new();
        for (role, spec) in child_specs(&parent, offsets) {
            let request_id = ids.allocate();
            let mut child = Order::new(request_id, parent.instrument.clone(), spec.clone());
            child.client_id = parent.client_id;
            child.parent_id = Some(id);
            self.orders.insert(request_id, child);

            match role {
                ChildRole::Profit => record.profit = Some(request_id),
                ChildRole::Loss => record.loss = Some(request_id),
            }
            children.push(BracketChild {
                request_id,
                role,
                instrument: parent.instrument.clone(),
                spec,
            });
        }

        info!(
            parent_id = id,
            fill = parent.avg_fill_price,
            profit_id = ?record.profit,
            loss_id = ?record.loss,
            "bracket children created"
        );
        self.bracket_children.insert(id, record);
        effects.push(LedgerEffect::PlaceBracket(BracketPlacement {
            parent_id: id,
            children,
        }));
    }

    /// Finish the open-orders query once every reported order has a
    /// non-pending status and both end markers arrived
    fn check_query(&mut self, effects: &mut Vec<LedgerEffect>) {
        let ready = match &self.open_query {
            Some(query) => {
                query.orders_end
                    && query.executions_end
                    && query.unmatched.is_empty()
                    && query
                        .acks
                        .iter()
                        .all(|(id, ack)| *ack == QueryAck::StatusSeen && self.orders.contains_key(id))
            }
            None => false,
        };
        if !ready {
            return;
        }
        let Some(query) = self.open_query.take() else {
            return;
        };

        let mut ids: Vec<RequestId> = query.acks.keys().copied().collect();
        ids.sort_unstable();
        let orders: Vec<Order> = ids.into_iter().filter_map(|id| self.snapshot(id)).collect();
        info!(request_id = query.query_id, count = orders.len(), "open orders query complete");
        effects.push(LedgerEffect::OpenOrdersReady {
            query_id: query.query_id,
            orders,
        });
    }

    fn snapshot(&self, id: RequestId) -> Option<Order> {
        let mut order = self.orders.get(&id)?.clone();
        order.executions = self.executions.get(&order.perm_id).cloned().unwrap_or_default();
        Some(order)
    }

    fn note(&mut self, message: String) {
        warn!("{}", message);
        if self.diagnostics.len() >= MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::order::OrderKind;
    use crate::types::Action;

    fn ledger() -> OrderLedger {
        OrderLedger::new(Arc::new(IdAllocator::new(1)))
    }

    fn status(id: RequestId, perm_id: PermId, status: &str, filled: f64, avg: f64) -> StatusUpdate {
        StatusUpdate {
            request_id: id,
            status: status.to_string(),
            filled,
            remaining: 10.0 - filled,
            avg_fill_price: avg,
            perm_id,
            parent_id: 0,
            last_fill_price: avg,
            client_id: 0,
        }
    }

    fn report(id: RequestId, perm_id: PermId, status: &str) -> OpenOrderReport {
        OpenOrderReport {
            request_id: id,
            perm_id,
            client_id: 0,
            instrument: Instrument::stock("SPY", "USD"),
            spec: OrderSpec::limit(Action::Buy, 10.0, 99.0),
            status: status.to_string(),
        }
    }

    fn place_buy(ledger: &OrderLedger, profit: f64, loss: f64) -> RequestId {
        ledger
            .place(
                Instrument::stock("SPY", "USD"),
                OrderSpec::market(Action::Buy, 10.0),
                BracketOffsets::new(profit, loss),
                0,
            )
            .request_id
    }

    fn placements(effects: &[LedgerEffect]) -> Vec<&BracketPlacement> {
        effects
            .iter()
            .filter_map(|e| match e {
                LedgerEffect::PlaceBracket(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bracket_placed_once_on_redundant_fills() {
        let ledger = ledger();
        let id = place_buy(&ledger, 5.0, 3.0);

        ledger.on_order_status(status(id, 900, "Submitted", 0.0, 0.0));
        let first = ledger.on_order_status(status(id, 900, "Filled", 10.0, 100.0));
        let second = ledger.on_order_status(status(id, 900, "Filled", 10.0, 100.0));

        let placed = placements(&first);
        assert_eq!(placed.len(), 1);
        assert!(placements(&second).is_empty());

        let children = &placed[0].children;
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].spec.kind, OrderKind::Limit { price: 105.0 });
        assert_eq!(children[1].spec.kind, OrderKind::Stop { price: 97.0 });
        assert_eq!(children[0].spec.oca_group.as_deref(), Some("900"));

        let record = ledger.bracket_children(id).unwrap();
        assert_eq!(record.profit, Some(children[0].request_id));
        assert_eq!(record.loss, Some(children[1].request_id));

        let child = ledger.order(children[0].request_id).unwrap();
        assert_eq!(child.parent_id, Some(id));
        assert_eq!(child.status, OrderStatus::Pending);
        assert!(!ledger.has_pending_bracket(id));
    }

    #[test]
    fn test_no_offsets_no_bracket() {
        let ledger = ledger();
        let id = place_buy(&ledger, 0.0, 0.0);
        let effects = ledger.on_order_status(status(id, 1, "Filled", 10.0, 100.0));
        assert!(placements(&effects).is_empty());
        assert_eq!(ledger.bracket_children(id), None);
    }

    #[test]
    fn test_zero_average_fill_defers_bracket() {
        let ledger = ledger();
        let id = place_buy(&ledger, 5.0, 0.0);

        let effects = ledger.on_order_status(status(id, 7, "Filled", 10.0, 0.0));
        assert!(placements(&effects).is_empty());
        assert!(ledger.has_pending_bracket(id));
        assert!(ledger.diagnostics().iter().any(|d| d.contains("zero average price")));

        let effects = ledger.on_order_status(status(id, 7, "Filled", 10.0, 101.0));
        let placed = placements(&effects);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].children[0].spec.kind, OrderKind::Limit { price: 106.0 });
    }

    #[test]
    fn test_status_does_not_regress() {
        let ledger = ledger();
        let id = place_buy(&ledger, 0.0, 0.0);

        let effects = ledger.on_order_status(status(id, 3, "Filled", 10.0, 100.0));
        assert_eq!(
            effects,
            vec![LedgerEffect::Closed {
                request_id: id,
                status: OrderStatus::Filled
            }]
        );

        let mut late = status(id, 3, "Submitted", 10.0, 100.5);
        late.remaining = 0.0;
        assert!(ledger.on_order_status(late).is_empty());

        let order = ledger.order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, 100.5);
    }

    #[test]
    fn test_pending_cancel_keeps_status() {
        let ledger = ledger();
        let id = place_buy(&ledger, 0.0, 0.0);
        ledger.on_order_status(status(id, 3, "Submitted", 0.0, 0.0));
        ledger.on_order_status(status(id, 3, "PendingCancel", 0.0, 0.0));
        assert_eq!(ledger.order(id).unwrap().status, OrderStatus::Submitted);
    }

    #[test]
    fn test_cancel_drops_bracket_offsets() {
        let ledger = ledger();
        let id = place_buy(&ledger, 5.0, 3.0);
        let effects = ledger.on_order_status(status(id, 3, "Cancelled", 0.0, 0.0));
        assert!(matches!(
            effects[..],
            [LedgerEffect::Closed {
                status: OrderStatus::Cancelled,
                ..
            }]
        ));
        assert!(!ledger.has_pending_bracket(id));
    }

    #[test]
    fn test_unknown_status_parked_until_open_order() {
        let ledger = ledger();
        ledger.on_order_status(status(40, 4000, "Submitted", 0.0, 0.0));
        assert!(ledger.order(40).is_none());
        assert!(ledger.diagnostics().iter().any(|d| d.contains("parked")));

        ledger.on_open_order(report(40, 4000, "PreSubmitted"));
        let order = ledger.order(40).unwrap();
        assert_eq!(order.perm_id, 4000);
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.spec.kind, OrderKind::Limit { price: 99.0 });
    }

    #[test]
    fn test_open_query_requires_all_three_signals() {
        let ledger = ledger();
        let id = place_buy(&ledger, 0.0, 0.0);
        ledger.on_order_status(status(id, 500, "Submitted", 0.0, 0.0));
        ledger.begin_open_query(100);

        // Ends first, then the order, then its status
        assert!(ledger.on_open_orders_end().is_empty());
        assert!(ledger.on_executions_end(100).is_empty());
        assert!(ledger.on_open_order(report(id, 500, "Submitted")).is_empty());

        let effects = ledger.on_order_status(status(id, 500, "Submitted", 0.0, 0.0));
        match &effects[..] {
            [LedgerEffect::OpenOrdersReady { query_id, orders }] => {
                assert_eq!(*query_id, 100);
                assert_eq!(orders.len(), 1);
                assert_eq!(orders[0].request_id, id);
            }
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_open_query_ignores_pending_status() {
        let ledger = ledger();
        ledger.begin_open_query(100);

        assert!(ledger.on_open_order(report(5, 500, "PreSubmitted")).is_empty());
        assert!(ledger.on_open_orders_end().is_empty());
        assert!(ledger.on_executions_end(100).is_empty());
        assert!(ledger.on_order_status(status(5, 500, "PendingSubmit", 0.0, 0.0)).is_empty());
        assert!(ledger.on_order_status(status(5, 500, "ApiPending", 0.0, 0.0)).is_empty());

        let effects = ledger.on_order_status(status(5, 500, "Submitted", 0.0, 0.0));
        assert!(matches!(
            &effects[..],
            [LedgerEffect::OpenOrdersReady { orders, .. }] if orders.len() == 1
        ));
    }

    #[test]
    fn test_open_query_skips_finished_orders() {
        let ledger = ledger();
        let done = place_buy(&ledger, 0.0, 0.0);
        ledger.on_order_status(status(done, 300, "Filled", 10.0, 100.0));

        ledger.begin_open_query(100);
        assert!(ledger.on_open_orders_end().is_empty());
        let effects = ledger.on_executions_end(100);
        assert!(matches!(
            &effects[..],
            [LedgerEffect::OpenOrdersReady { orders, .. }] if orders.is_empty()
        ));
    }

    #[test]
    fn test_ui_orders_keyed_by_perm_id() {
        let ledger = ledger();
        ledger.begin_open_query(100);

        for perm_id in [500, 600] {
            ledger.on_open_order(report(0, perm_id, "Submitted"));
            ledger.on_order_status(status(0, perm_id, "Submitted", 0.0, 0.0));
        }
        assert!(ledger.on_open_orders_end().is_empty());
        let effects = ledger.on_executions_end(100);

        match &effects[..] {
            [LedgerEffect::OpenOrdersReady { orders, .. }] => {
                let perms: Vec<PermId> = orders.iter().map(|o| o.perm_id).collect();
                assert_eq!(perms, vec![600, 500]);
            }
            other => panic!("unexpected effects {:?}", other),
        }
        assert_eq!(ledger.orders().len(), 2);
        assert_eq!(ledger.order(-500).unwrap().perm_id, 500);
    }

    #[test]
    fn test_foreign_order_id_not_reused() {
        let ids = Arc::new(IdAllocator::new(1));
        let ledger = OrderLedger::new(ids.clone());
        ledger.on_open_order(report(40, 4000, "Submitted"));
        assert!(ids.peek() > 40);

        // A different order reusing a taken id gets its own entry
        ledger.on_open_order(report(40, 4100, "Submitted"));
        assert_eq!(ledger.order(40).unwrap().perm_id, 4000);
        assert_eq!(ledger.order(-4100).unwrap().perm_id, 4100);
    }

    #[test]
    fn test_open_query_status_before_order() {
        let ledger = ledger();
        ledger.begin_open_query(100);

        ledger.on_order_status(status(6, 600, "Submitted", 0.0, 0.0));
        assert!(ledger.on_open_orders_end().is_empty());
        assert!(ledger.on_executions_end(100).is_empty());

        // Only completes once the order itself is known
        let effects = ledger.on_open_order(report(6, 600, "Submitted"));
        assert!(matches!(
            &effects[..],
            [LedgerEffect::OpenOrdersReady { orders, .. }] if orders.len() == 1
        ));
    }

    #[test]
    fn test_open_query_empty() {
        let ledger = ledger();
        ledger.begin_open_query(100);
        assert!(ledger.on_executions_end(99).is_empty());
        assert!(ledger.on_executions_end(100).is_empty());
        let effects = ledger.on_open_orders_end();
        assert!(matches!(
            &effects[..],
            [LedgerEffect::OpenOrdersReady { orders, .. }] if orders.is_empty()
        ));
    }

    #[test]
    fn test_executions_deduplicated_and_attached() {
        let ledger = ledger();
        let id = place_buy(&ledger, 0.0, 0.0);
        ledger.on_order_status(status(id, 77, "Filled", 10.0, 100.0));

        let fill = Execution {
            exec_id: "0001".to_string(),
            perm_id: 77,
            request_id: id,
            side: Action::Buy,
            quantity: 10.0,
            price: 100.0,
            cum_quantity: 10.0,
            avg_price: 100.0,
            time: Utc::now(),
        };
        ledger.on_execution(fill.clone());
        ledger.on_execution(fill);

        assert_eq!(ledger.executions(77).len(), 1);
        assert_eq!(ledger.order(id).unwrap().executions.len(), 1);
    }

    #[test]
    fn test_error_attached_to_order() {
        let ledger = ledger();
        let id = place_buy(&ledger, 0.0, 0.0);
        assert!(ledger.on_error(id, "order rejected"));
        assert!(!ledger.on_error(id + 100, "nothing"));
        assert_eq!(ledger.order(id).unwrap().last_error.as_deref(), Some("order rejected"));
    }

    #[test]
    fn test_reject_closes_order_and_drops_bracket() {
        let ledger = ledger();
        let id = place_buy(&ledger, 5.0, 3.0);

        let effects = ledger.reject(id, "send failed");
        assert_eq!(
            effects,
            vec![LedgerEffect::Closed {
                request_id: id,
                status: OrderStatus::Cancelled
            }]
        );
        assert!(!ledger.has_pending_bracket(id));
        assert_eq!(ledger.order(id).unwrap().last_error.as_deref(), Some("send failed"));
    }
}
