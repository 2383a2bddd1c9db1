//! Live quote subscriptions, one per instrument key

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::types::{Instrument, InstrumentKey, RequestId};

/// Merged top-of-book snapshot for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub currency: String,
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub last: f64,
    pub last_size: f64,
    pub volume: f64,
}

impl Tick {
    fn empty(key: &InstrumentKey) -> Self {
        Self {
            symbol: key.symbol.clone(),
            currency: key.currency.clone(),
            time: Utc::now(),
            bid: 0.0,
            ask: 0.0,
            bid_size: 0.0,
            ask_size: 0.0,
            last: 0.0,
            last_size: 0.0,
            volume: 0.0,
        }
    }

    /// Both sides present and not crossed
    pub fn is_consistent(&self) -> bool {
        self.bid > 0.0 && self.ask > self.bid
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Gateway tick field codes this router understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickField {
    BidSize,
    Bid,
    Ask,
    AskSize,
    Last,
    LastSize,
    Volume,
}

impl TickField {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::BidSize),
            1 => Some(Self::Bid),
            2 => Some(Self::Ask),
            3 => Some(Self::AskSize),
            4 => Some(Self::Last),
            5 => Some(Self::LastSize),
            8 => Some(Self::Volume),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::BidSize => 0,
            Self::Bid => 1,
            Self::Ask => 2,
            Self::AskSize => 3,
            Self::Last => 4,
            Self::LastSize => 5,
            Self::Volume => 8,
        }
    }
}

/// What a subscriber's queue carries
#[derive(Debug, Clone, PartialEq)]
pub enum TickMessage {
    Tick(Tick),
    /// Subscription ended normally
    End,
    /// Subscription ended because the connection failed
    Failed(ClientError),
}

struct Subscription {
    request_id: RequestId,
    snapshot: Tick,
    subscribers: Vec<mpsc::UnboundedSender<TickMessage>>,
}

impl Subscription {
    fn close(self, message: TickMessage) {
        for tx in self.subscribers {
            let _ = tx.send(message.clone());
        }
    }
}

#[derive(Default)]
struct RouterState {
    by_key: HashMap<InstrumentKey, Subscription>,
    by_id: HashMap<RequestId, InstrumentKey>,
    /// Subscriptions whose last stream was dropped; still live at the gateway
    released: Vec<RequestId>,
}

/// Outcome of [`TickRouter::subscribe`]
pub struct Subscribed {
    pub stream: TickStream,
    /// Set when a new remote subscription must be issued
    pub new_request: Option<RequestId>,
}

/// Deduplicates quote subscriptions per instrument and fans ticks out
#[derive(Default)]
pub struct TickRouter {
    state: Arc<Mutex<RouterState>>,
}

impl TickRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stream for `instrument`. `allocate` is only called when no
    /// subscription exists for the instrument's key.
    pub fn subscribe<F>(&self, instrument: &Instrument, allocate: F) -> Subscribed
    where
        F: FnOnce() -> RequestId,
    {
        let key = instrument.key();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        if let Some(sub) = state.by_key.get_mut(&key) {
            sub.subscribers.retain(|s| !s.is_closed());
            sub.subscribers.push(tx);
            debug!(request_id = sub.request_id, key = %key, "reusing tick subscription");
            return Subscribed {
                stream: TickStream::new(key, sub.request_id, rx, Arc::downgrade(&self.state)),
                new_request: None,
            };
        }

        let request_id = allocate();
        state.by_key.insert(
            key.clone(),
            Subscription {
                request_id,
                snapshot: Tick::empty(&key),
                subscribers: vec![tx],
            },
        );
        state.by_id.insert(request_id, key.clone());
        info!(request_id, key = %key, "tick subscription opened");

        Subscribed {
            stream: TickStream::new(key, request_id, rx, Arc::downgrade(&self.state)),
            new_request: Some(request_id),
        }
    }

    /// End every stream for `key`. Returns the request id to cancel remotely.
    pub fn unsubscribe(&self, key: &InstrumentKey) -> Option<RequestId> {
        let mut state = self.state.lock();
        let sub = state.by_key.remove(key)?;
        state.by_id.remove(&sub.request_id);
        let request_id = sub.request_id;
        sub.close(TickMessage::End);
        info!(request_id, key = %key, "tick subscription closed");
        Some(request_id)
    }

    /// Merge a price update. Emits the merged tick only when the book is
    /// consistent. Returns the number of subscribers reached.
    pub fn on_price(&self, request_id: RequestId, field: TickField, price: f64) -> usize {
        let mut state = self.state.lock();
        let Some(sub) = route(&mut state, request_id) else {
            return 0;
        };

        match field {
            TickField::Bid => sub.snapshot.bid = price,
            TickField::Ask => sub.snapshot.ask = price,
            TickField::Last => sub.snapshot.last = price,
            _ => {
                debug!(request_id, code = field.code(), "size field delivered as price");
                return 0;
            }
        }
        sub.snapshot.time = Utc::now();

        if !sub.snapshot.is_consistent() {
            debug!(request_id, bid = sub.snapshot.bid, ask = sub.snapshot.ask, "suppressing crossed quote");
            return 0;
        }

        let tick = sub.snapshot.clone();
        sub.subscribers.retain(|tx| tx.send(TickMessage::Tick(tick.clone())).is_ok());
        sub.subscribers.len()
    }

    /// Merge a size update into the snapshot without emitting
    pub fn on_size(&self, request_id: RequestId, field: TickField, size: f64) {
        let mut state = self.state.lock();
        let Some(sub) = route(&mut state, request_id) else {
            return;
        };
        match field {
            TickField::BidSize => sub.snapshot.bid_size = size,
            TickField::AskSize => sub.snapshot.ask_size = size,
            TickField::LastSize => sub.snapshot.last_size = size,
            TickField::Volume => sub.snapshot.volume = size,
            _ => debug!(request_id, code = field.code(), "price field delivered as size"),
        }
        sub.snapshot.time = Utc::now();
    }

    /// A gateway error for a tick request ends that subscription
    pub fn fail(&self, request_id: RequestId, error: ClientError) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.by_id.remove(&request_id) else {
            return false;
        };
        if let Some(sub) = state.by_key.remove(&key) {
            sub.close(TickMessage::Failed(error));
        }
        true
    }

    /// Request ids of subscriptions nobody listens to any more. Each is
    /// returned once and must be cancelled at the gateway.
    pub fn take_released(&self) -> Vec<RequestId> {
        std::mem::take(&mut self.state.lock().released)
    }

    /// Close every subscription, e.g. when the connection goes away
    pub fn close_all(&self, error: Option<ClientError>) -> usize {
        let mut state = self.state.lock();
        state.by_id.clear();
        state.released.clear();
        let subs: Vec<Subscription> = state.by_key.drain().map(|(_, sub)| sub).collect();
        let count = subs.len();
        for sub in subs {
            let message = match &error {
                Some(e) => TickMessage::Failed(e.clone()),
                None => TickMessage::End,
            };
            sub.close(message);
        }
        count
    }

    pub fn request_id(&self, key: &InstrumentKey) -> Option<RequestId> {
        self.state.lock().by_key.get(key).map(|s| s.request_id)
    }

    pub fn is_tick_request(&self, request_id: RequestId) -> bool {
        self.state.lock().by_id.contains_key(&request_id)
    }

    /// Latest merged snapshot, consistent or not
    pub fn snapshot(&self, key: &InstrumentKey) -> Option<Tick> {
        self.state.lock().by_key.get(key).map(|s| s.snapshot.clone())
    }
}

fn route(state: &mut RouterState, request_id: RequestId) -> Option<&mut Subscription> {
    let key = state.by_id.get(&request_id)?;
    state.by_key.get_mut(key)
}

/// Ticks for one subscriber. Ends after the terminal marker.
///
/// Dropping the last stream of a subscription releases it; the router then
/// reports its request id from [`TickRouter::take_released`].
pub struct TickStream {
    key: InstrumentKey,
    request_id: RequestId,
    rx: mpsc::UnboundedReceiver<TickMessage>,
    router: Weak<Mutex<RouterState>>,
    done: bool,
}

impl TickStream {
    fn new(
        key: InstrumentKey,
        request_id: RequestId,
        rx: mpsc::UnboundedReceiver<TickMessage>,
        router: Weak<Mutex<RouterState>>,
    ) -> Self {
        Self {
            key,
            request_id,
            rx,
            router,
            done: false,
        }
    }

    pub fn key(&self) -> &InstrumentKey {
        &self.key
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Next tick; `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<Result<Tick>> {
        if self.done {
            return None;
        }
        let message = self.rx.recv().await;
        self.accept(message)
    }

    fn accept(&mut self, message: Option<TickMessage>) -> Option<Result<Tick>> {
        match message {
            Some(TickMessage::Tick(tick)) => Some(Ok(tick)),
            Some(TickMessage::Failed(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(TickMessage::End) | None => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for TickStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Marks our sender closed so the prune below drops it
        self.rx.close();
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let mut state = router.lock();
        let idle = match state.by_key.get_mut(&self.key) {
            Some(sub) if sub.request_id == self.request_id => {
                sub.subscribers.retain(|tx| !tx.is_closed());
                sub.subscribers.is_empty()
            }
            _ => false,
        };
        if idle {
            state.by_key.remove(&self.key);
            state.by_id.remove(&self.request_id);
            state.released.push(self.request_id);
            debug!(request_id = self.request_id, key = %self.key, "last tick subscriber gone");
        }
    }
}

impl Stream for TickStream {
    type Item = Result<Tick>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(message) => Poll::Ready(this.accept(message)),
            Poll::Pending => Poll::Pending,
        }
    }
}
