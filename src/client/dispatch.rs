//! Inbound event routing
//!
//! One task per connection drains the transport's event channel and hands
//! each event to the component that owns it. Ledger effects are carried out
//! here once the ledger lock has been released.

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Reply, Shared};
use crate::error::{ClientError, Result};
use crate::orders::{BracketPlacement, LedgerEffect};
use crate::ticks::TickField;
use crate::transport::InboundEvent;
use crate::types::{Instrument, RequestId};

/// Notices the gateway reports through the error channel that do not fail
/// anything: market data farm status, order cancel confirmation, warnings.
fn is_informational(code: i32) -> bool {
    matches!(code, 202 | 399 | 10167 | 2100..=2199)
}

pub(super) async fn run(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<InboundEvent>) {
    while let Some(event) = events.recv().await {
        if let InboundEvent::ConnectionClosed { reason } = &event {
            error!(reason = %reason, "gateway connection closed");
            shared.shutdown(Some(ClientError::Disconnected));
            return;
        }
        shared.handle(event).await;
        shared.cancel_released().await;
    }

    if shared.connected.load(Ordering::SeqCst) {
        warn!("event stream ended without a close notice");
        shared.shutdown(Some(ClientError::Disconnected));
    }
}

impl Shared {
    pub(super) async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::NextValidId(next) => self.on_next_valid_id(next),
            InboundEvent::ManagedAccounts(list) => self.on_managed_accounts(&list),
            InboundEvent::AccountValue {
                key,
                value,
                currency,
                account_name,
            } => self.on_account_value(&key, &value, &currency, &account_name),
            InboundEvent::AccountTime(time) => {
                if !self.account.lock().stamp_time(&time, Utc::now().date_naive()) {
                    debug!(time = %time, "unparseable account time");
                }
            }
            InboundEvent::AccountDownloadEnd(account_name) => self.on_account_end(&account_name),
            InboundEvent::ContractDetails { request_id, instrument } => self.on_contract(request_id, instrument),
            InboundEvent::ContractDetailsEnd(request_id) => self.on_contract_end(request_id),
            InboundEvent::OpenOrder(report) => {
                let effects = self.ledger.on_open_order(report);
                self.apply(effects).await;
            }
            InboundEvent::OpenOrderEnd => {
                let effects = self.ledger.on_open_orders_end();
                self.apply(effects).await;
            }
            InboundEvent::OrderStatus(update) => {
                let effects = self.ledger.on_order_status(update);
                self.apply(effects).await;
            }
            InboundEvent::ExecDetails {
                request_id, execution, ..
            } => {
                debug!(request_id, exec_id = %execution.exec_id, perm_id = execution.perm_id, "execution");
                self.ledger.on_execution(execution);
            }
            InboundEvent::ExecDetailsEnd(request_id) => {
                let effects = self.ledger.on_executions_end(request_id);
                self.apply(effects).await;
            }
            InboundEvent::HistoricalBar { request_id, bar } => {
                if self.waiters.lock().history.contains(&request_id) {
                    self.bars.push(request_id, bar);
                } else {
                    debug!(request_id, "bar for a request nobody waits on");
                }
            }
            InboundEvent::HistoricalDataEnd(request_id) => {
                if self.waiters.lock().history.remove(&request_id) {
                    let bars = self.bars.finish(request_id);
                    debug!(request_id, bars = bars.len(), "historical request finished");
                    self.settle(request_id, Ok(Reply::Bars(bars)));
                }
            }
            InboundEvent::TickPrice {
                request_id,
                field,
                price,
            } => match TickField::from_code(field) {
                Some(field) => {
                    self.ticks.on_price(request_id, field, price);
                }
                None => debug!(request_id, field, "ignoring tick price field"),
            },
            InboundEvent::TickSize {
                request_id,
                field,
                size,
            } => match TickField::from_code(field) {
                Some(field) => self.ticks.on_size(request_id, field, size),
                None => debug!(request_id, field, "ignoring tick size field"),
            },
            InboundEvent::Portfolio(update) => {
                let mut account = self.account.lock();
                if account.account_name.eq_ignore_ascii_case(&update.account_name) {
                    account.update_holding(&update);
                }
            }
            InboundEvent::Error {
                request_id,
                code,
                message,
            } => self.on_error(request_id, code, message),
            InboundEvent::ConnectionClosed { reason } => {
                error!(reason = %reason, "gateway connection closed");
                self.shutdown(Some(ClientError::Disconnected));
            }
        }
    }

    /// Deliver an outcome; a second outcome for the same id is recorded as a
    /// ledger diagnostic instead of overwriting the first.
    pub(super) fn settle(&self, request_id: RequestId, outcome: Result<Reply>) {
        let result = match outcome {
            Ok(reply) => self.correlator.resolve(request_id, reply),
            Err(error) => self.correlator.fail(request_id, error),
        };
        if let Err(error) = result {
            self.ledger.note(error.to_string());
        }
    }

    async fn apply(&self, effects: Vec<LedgerEffect>) {
        for effect in effects {
            match effect {
                LedgerEffect::Closed { request_id, status } => {
                    let cancels = self.waiters.lock().cancels.remove(&request_id).unwrap_or_default();
                    for cancel_id in cancels {
                        self.settle(cancel_id, Ok(Reply::OrderClosed(status)));
                    }
                }
                LedgerEffect::OpenOrdersReady { query_id, orders } => {
                    self.waiters.lock().open_query = None;
                    self.settle(query_id, Ok(Reply::OpenOrders(orders)));
                }
                LedgerEffect::PlaceBracket(placement) => self.place_children(placement).await,
            }
        }
    }

    /// Cancel gateway subscriptions whose last tick stream was dropped
    pub(super) async fn cancel_released(&self) {
        for request_id in self.ticks.take_released() {
            info!(request_id, "no tick subscribers left; cancelling market data");
            if let Err(error) = self.transport.cancel_market_data(request_id).await {
                warn!(request_id, error = %error, "market data cancel not sent");
            }
        }
    }

    async fn place_children(&self, placement: BracketPlacement) {
        for child in placement.children {
            info!(
                parent_id = placement.parent_id,
                request_id = child.request_id,
                role = ?child.role,
                kind = ?child.spec.kind,
                "placing bracket child"
            );
            if let Err(error) = self
                .transport
                .place_order(child.request_id, &child.instrument, &child.spec)
                .await
            {
                warn!(request_id = child.request_id, error = %error, "bracket child not sent");
                // Nobody can be cancelling a child that was never sent
                self.ledger.reject(child.request_id, &error.to_string());
            }
        }
    }

    fn on_next_valid_id(&self, next: RequestId) {
        self.correlator.ids().raise_floor(next);
        let waiting = std::mem::take(&mut self.waiters.lock().next_id);
        debug!(next, waiting = waiting.len(), "next valid id");
        for id in waiting {
            self.settle(id, Ok(Reply::NextId(next)));
        }
    }

    fn on_managed_accounts(&self, list: &str) {
        let first = list.split(',').map(str::trim).find(|name| !name.is_empty());
        let waiting = std::mem::take(&mut self.waiters.lock().account_names);
        for id in waiting {
            let outcome = match first {
                Some(name) => Ok(Reply::AccountName(name.to_string())),
                None => Err(ClientError::Remote {
                    request_id: id,
                    code: 0,
                    message: "gateway reported no managed accounts".to_string(),
                }),
            };
            self.settle(id, outcome);
        }
    }

    fn on_account_value(&self, key: &str, value: &str, currency: &str, account_name: &str) {
        let Ok(number) = value.trim().parse::<f64>() else {
            debug!(key, value, "non-numeric account value");
            return;
        };
        let mut account = self.account.lock();
        if !account.account_name.eq_ignore_ascii_case(account_name) {
            debug!(account_name, "value for an account not being tracked");
            return;
        }
        if account.apply_value(key, number) {
            debug!(key, value = number, currency, "account value");
        }
    }

    fn on_account_end(&self, account_name: &str) {
        let waiting = self
            .waiters
            .lock()
            .accounts
            .remove(&account_name.to_lowercase())
            .unwrap_or_default();
        if waiting.is_empty() {
            return;
        }
        let snapshot = self.account.lock().clone();
        for id in waiting {
            self.settle(id, Ok(Reply::Account(snapshot.clone())));
        }
    }

    fn on_contract(&self, request_id: RequestId, instrument: Instrument) {
        let mut waiters = self.waiters.lock();
        match waiters.contracts.get_mut(&request_id) {
            Some(slot) if slot.is_none() => *slot = Some(instrument),
            Some(_) => debug!(request_id, "extra contract details ignored"),
            None => debug!(request_id, "contract details for unknown request"),
        }
    }

    fn on_contract_end(&self, request_id: RequestId) {
        let Some(found) = self.waiters.lock().contracts.remove(&request_id) else {
            return;
        };
        let outcome = match found {
            Some(instrument) => Ok(Reply::Contract(instrument)),
            None => Err(ClientError::ContractNotFound(request_id)),
        };
        self.settle(request_id, outcome);
    }

    fn on_error(&self, request_id: RequestId, code: i32, message: String) {
        if is_informational(code) {
            info!(request_id, code, message = %message, "gateway notice");
            if request_id > 0 {
                self.ledger.on_error(request_id, &message);
            }
            return;
        }
        if request_id <= 0 {
            warn!(code, message = %message, "gateway error");
            return;
        }

        let (owned, cancels) = {
            let mut waiters = self.waiters.lock();
            let contract = waiters.contracts.remove(&request_id).is_some();
            let history = waiters.history.remove(&request_id);
            let cancels = waiters.cancels.remove(&request_id).unwrap_or_default();
            let query = waiters.open_query == Some(request_id);
            if query {
                waiters.open_query = None;
            }
            if history {
                self.bars.finish(request_id);
            }
            (contract || history || query, cancels)
        };
        let order = self.ledger.on_error(request_id, &message);
        let error = ClientError::Remote {
            request_id,
            code,
            message: message.clone(),
        };

        if !cancels.is_empty() {
            warn!(request_id, code, message = %message, "cancel rejected");
            for cancel_id in cancels {
                self.settle(cancel_id, Err(error.clone()));
            }
        } else if owned || (!order && self.correlator.is_waiting(request_id)) {
            warn!(request_id, code, message = %message, "request failed");
            self.settle(request_id, Err(error));
        } else if self.ticks.fail(request_id, error) {
            warn!(request_id, code, message = %message, "tick subscription failed");
        } else if order {
            warn!(request_id, code, message = %message, "order error");
        } else {
            warn!(request_id, code, message = %message, "error for unknown request");
        }
    }
}
