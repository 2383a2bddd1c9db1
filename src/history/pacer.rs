//! Paced execution of a historical retrieval plan

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::plan::{HistoricalRequest, HistoryWindow};
use crate::config::HistorySettings;
use crate::error::Result;
use crate::types::{Instrument, RequestId};

/// One historical bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: chrono::DateTime<chrono::Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub count: i64,
    pub wap: f64,
}

/// Bars for one completed window
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBlock {
    /// Windows still queued after this one
    pub remaining: usize,
    pub window: HistoryWindow,
    pub bars: Vec<Bar>,
}

/// Where a plan sends its requests
#[async_trait]
pub trait BarSource: Send + Sync {
    fn next_request_id(&self) -> RequestId;

    /// Issue the request and wait for all of its bars
    async fn fetch(&self, request_id: RequestId, instrument: &Instrument, request: &HistoricalRequest) -> Result<Vec<Bar>>;

    /// The plan stopped waiting on `request_id`
    fn abandon(&self, request_id: RequestId);
}

/// Enforces a fixed minimum interval between historical requests.
///
/// One gate is shared by every plan on a connection. The first request goes
/// out immediately.
pub struct PacingGate {
    interval: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl PacingGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a request may be issued and claim that slot
    pub async fn wait_turn(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "pacing historical request");
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Bars streamed for in-flight requests, keyed by request id
#[derive(Default)]
pub struct BarCollector {
    pending: Mutex<HashMap<RequestId, Vec<Bar>>>,
}

impl BarCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request_id: RequestId, bar: Bar) {
        self.pending.lock().entry(request_id).or_default().push(bar);
    }

    /// Take everything collected for `request_id`
    pub fn finish(&self, request_id: RequestId) -> Vec<Bar> {
        self.pending.lock().remove(&request_id).unwrap_or_default()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// Cancels a [`HistoryPlan`] from anywhere
#[derive(Clone)]
pub struct PlanCancel {
    flag: Arc<watch::Sender<bool>>,
    windows: Arc<Mutex<VecDeque<HistoryWindow>>>,
}

impl PlanCancel {
    /// Drain the plan and release any in-flight `next()` with the done marker
    pub fn cancel(&self) {
        self.windows.lock().clear();
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }
}

/// Ordered queue of windows, issued one at a time through the pacing gate
pub struct HistoryPlan {
    instrument: Instrument,
    settings: HistorySettings,
    source: Arc<dyn BarSource>,
    gate: Arc<PacingGate>,
    windows: Arc<Mutex<VecDeque<HistoryWindow>>>,
    cancel: PlanCancel,
}

impl HistoryPlan {
    pub fn new(
        instrument: Instrument,
        windows: Vec<HistoryWindow>,
        settings: HistorySettings,
        source: Arc<dyn BarSource>,
        gate: Arc<PacingGate>,
    ) -> Self {
        let windows = Arc::new(Mutex::new(VecDeque::from(windows)));
        let (flag, _) = watch::channel(false);
        let cancel = PlanCancel {
            flag: Arc::new(flag),
            windows: windows.clone(),
        };
        Self {
            instrument,
            settings,
            source,
            gate,
            windows,
            cancel,
        }
    }

    /// Windows not yet issued
    pub fn remaining(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn windows(&self) -> Vec<HistoryWindow> {
        self.windows.lock().iter().copied().collect()
    }

    pub fn cancel_handle(&self) -> PlanCancel {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fetch the next window. `Ok(None)` once the plan is exhausted or
    /// cancelled. A failed window drains the rest of the plan.
    pub async fn next(&mut self) -> Result<Option<HistoryBlock>> {
        let mut cancelled = self.cancel.flag.subscribe();
        if *cancelled.borrow() {
            return Ok(None);
        }
        let Some(window) = self.windows.lock().pop_front() else {
            return Ok(None);
        };
        let request = window.request(&self.settings, self.instrument.sec_type);

        tokio::select! {
            _ = self.gate.wait_turn() => {}
            _ = cancelled.wait_for(|c| *c) => return Ok(None),
        }

        let request_id = self.source.next_request_id();
        info!(
            request_id,
            symbol = %self.instrument.display_symbol(),
            end = %request.end_time,
            duration = %request.duration,
            "requesting historical window"
        );

        tokio::select! {
            biased;
            result = self.source.fetch(request_id, &self.instrument, &request) => match result {
                Ok(bars) => Ok(Some(HistoryBlock {
                    remaining: self.remaining(),
                    window,
                    bars,
                })),
                Err(e) => {
                    warn!(request_id, error = %e, "historical window failed; dropping rest of plan");
                    self.windows.lock().clear();
                    Err(e)
                }
            },
            _ = cancelled.wait_for(|c| *c) => {
                self.source.abandon(request_id);
                Ok(None)
            }
        }
    }
}
