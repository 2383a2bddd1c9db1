//! Request correlation
//!
//! Every outbound call that expects a reply is tagged with a fresh request id.
//! The caller then suspends on [`RequestCorrelator::wait`] until the event
//! path calls [`RequestCorrelator::resolve`] or [`RequestCorrelator::fail`]
//! for that id.
//!
//! Each id owns a single-write, single-read completion cell:
//! - an outcome recorded before anyone waits is kept for the late waiter
//! - a second resolution is rejected with [`ClientError::AlreadyResolved`]
//! - a discarded id swallows late outcomes instead of resurrecting a waiter
//!
//! Settled and discarded ids are remembered for the most recent
//! [`DEFAULT_RETAINED`] of them; older ones are forgotten.

mod ids;

pub use ids::IdAllocator;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::types::RequestId;

enum Slot<T> {
    /// A caller is suspended on this id
    Waiting(oneshot::Sender<Result<T>>),
    /// Outcome arrived before anyone waited
    Ready(Result<T>),
    /// Outcome delivered or consumed
    Settled,
    /// Caller gave up; late outcomes are dropped
    Abandoned,
}

/// Finished ids kept for double-resolution checks
pub const DEFAULT_RETAINED: usize = 4096;

impl<T> Slot<T> {
    fn is_finished(&self) -> bool {
        matches!(self, Slot::Settled | Slot::Abandoned)
    }
}

struct Slots<T> {
    map: HashMap<RequestId, Slot<T>>,
    /// Finished ids, oldest first
    finished: VecDeque<RequestId>,
    retain: usize,
}

impl<T> Slots<T> {
    fn remove(&mut self, id: &RequestId) -> Option<Slot<T>> {
        self.map.remove(id)
    }

    /// Store `slot` for `id`. `was_finished` tells whether `id` is already
    /// queued as finished.
    fn put(&mut self, id: RequestId, slot: Slot<T>, was_finished: bool) {
        let finished = slot.is_finished();
        self.map.insert(id, slot);
        if finished && !was_finished {
            self.finished.push_back(id);
            while self.finished.len() > self.retain {
                let Some(oldest) = self.finished.pop_front() else {
                    break;
                };
                if self.map.get(&oldest).is_some_and(Slot::is_finished) {
                    self.map.remove(&oldest);
                }
            }
        }
    }
}

/// Completion table keyed by request id
pub struct RequestCorrelator<T> {
    ids: Arc<IdAllocator>,
    slots: Mutex<Slots<T>>,
}

impl<T> RequestCorrelator<T> {
    pub fn new(ids: Arc<IdAllocator>) -> Self {
        Self::with_retention(ids, DEFAULT_RETAINED)
    }

    /// Like [`RequestCorrelator::new`], remembering at most `retain`
    /// finished ids
    pub fn with_retention(ids: Arc<IdAllocator>, retain: usize) -> Self {
        Self {
            ids,
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                finished: VecDeque::new(),
                retain: retain.max(1),
            }),
        }
    }

    /// Ids with a slot: waiting, ready or remembered as finished
    pub fn tracked(&self) -> usize {
        self.slots.lock().map.len()
    }

    /// Fresh request id, never handed out before in this session
    pub fn allocate(&self) -> RequestId {
        self.ids.allocate()
    }

    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    /// Suspend until the outcome for `id` is known.
    ///
    /// There is no timeout. A caller that wraps this in one must call
    /// [`RequestCorrelator::discard`] when it gives up.
    pub async fn wait(&self, id: RequestId) -> Result<T> {
        let rx = {
            let mut slots = self.slots.lock();
            match slots.remove(&id) {
                None => {
                    let (tx, rx) = oneshot::channel();
                    slots.put(id, Slot::Waiting(tx), false);
                    rx
                }
                Some(Slot::Ready(outcome)) => {
                    slots.put(id, Slot::Settled, false);
                    return outcome;
                }
                Some(Slot::Waiting(tx)) => {
                    if tx.is_closed() {
                        // Previous waiter was dropped without discarding; take its place
                        let (tx, rx) = oneshot::channel();
                        slots.put(id, Slot::Waiting(tx), false);
                        rx
                    } else {
                        slots.put(id, Slot::Waiting(tx), false);
                        return Err(ClientError::AlreadyAwaited(id));
                    }
                }
                Some(Slot::Settled) => {
                    slots.put(id, Slot::Settled, true);
                    return Err(ClientError::AlreadyConsumed(id));
                }
                Some(Slot::Abandoned) => {
                    slots.put(id, Slot::Abandoned, true);
                    return Err(ClientError::Cancelled);
                }
            }
        };

        rx.await.unwrap_or(Err(ClientError::Cancelled))
    }

    /// Record a successful outcome for `id`
    pub fn resolve(&self, id: RequestId, value: T) -> Result<()> {
        self.settle(id, Ok(value))
    }

    /// Record a failed outcome for `id`
    pub fn fail(&self, id: RequestId, error: ClientError) -> Result<()> {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: RequestId, outcome: Result<T>) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.remove(&id) {
            None => {
                slots.put(id, Slot::Ready(outcome), false);
                Ok(())
            }
            Some(Slot::Waiting(tx)) => {
                if tx.send(outcome).is_err() {
                    debug!(request_id = id, "waiter dropped before outcome arrived");
                }
                slots.put(id, Slot::Settled, false);
                Ok(())
            }
            Some(slot @ (Slot::Ready(_) | Slot::Settled)) => {
                let was_finished = slot.is_finished();
                slots.put(id, slot, was_finished);
                Err(ClientError::AlreadyResolved(id))
            }
            Some(Slot::Abandoned) => {
                debug!(request_id = id, "dropping outcome for discarded request");
                slots.put(id, Slot::Abandoned, true);
                Ok(())
            }
        }
    }

    /// Give up on `id`. Any waiter is released with `Cancelled` and later
    /// outcomes are dropped.
    pub fn discard(&self, id: RequestId) {
        let mut slots = self.slots.lock();
        match slots.remove(&id) {
            Some(Slot::Waiting(tx)) => {
                let _ = tx.send(Err(ClientError::Cancelled));
                slots.put(id, Slot::Abandoned, false);
            }
            Some(Slot::Ready(_)) => slots.put(id, Slot::Settled, false),
            Some(Slot::Settled) => slots.put(id, Slot::Settled, true),
            Some(Slot::Abandoned) => slots.put(id, Slot::Abandoned, true),
            None => slots.put(id, Slot::Abandoned, false),
        }
    }

    /// True while a caller is suspended on `id`
    pub fn is_waiting(&self, id: RequestId) -> bool {
        matches!(self.slots.lock().map.get(&id), Some(Slot::Waiting(tx)) if !tx.is_closed())
    }

    /// Fail every suspended caller with a clone of `error`.
    /// Returns the number of waiters released.
    pub fn fail_all(&self, error: &ClientError) -> usize {
        let mut slots = self.slots.lock();
        let waiting: Vec<RequestId> = slots
            .map
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Waiting(_)))
            .map(|(id, _)| *id)
            .collect();

        let mut released = 0;
        for id in waiting {
            if let Some(Slot::Waiting(tx)) = slots.remove(&id) {
                if tx.send(Err(error.clone())).is_ok() {
                    released += 1;
                }
            }
            slots.put(id, Slot::Settled, false);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn correlator() -> Arc<RequestCorrelator<String>> {
        Arc::new(RequestCorrelator::new(Arc::new(IdAllocator::new(1))))
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let corr = correlator();
        let id = corr.allocate();

        let waiter = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.wait(id).await })
        };
        tokio::task::yield_now().await;

        corr.resolve(id, "done".to_string()).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_late_waiter_sees_outcome() {
        let corr = correlator();
        let id = corr.allocate();

        corr.fail(id, ClientError::Disconnected).unwrap();
        assert_eq!(corr.wait(id).await, Err(ClientError::Disconnected));

        // Outcome is single-read
        assert_eq!(corr.wait(id).await, Err(ClientError::AlreadyConsumed(id)));
    }

    #[tokio::test]
    async fn test_double_resolution_rejected() {
        let corr = correlator();
        let id = corr.allocate();

        corr.resolve(id, "first".to_string()).unwrap();
        assert_eq!(
            corr.resolve(id, "second".to_string()),
            Err(ClientError::AlreadyResolved(id))
        );
        assert_eq!(corr.fail(id, ClientError::Cancelled), Err(ClientError::AlreadyResolved(id)));
        assert_eq!(corr.wait(id).await.unwrap(), "first");

        // Still rejected after the outcome was consumed
        assert_eq!(
            corr.resolve(id, "third".to_string()),
            Err(ClientError::AlreadyResolved(id))
        );
    }

    #[tokio::test]
    async fn test_second_waiter_rejected() {
        let corr = correlator();
        let id = corr.allocate();

        let first = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.wait(id).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(corr.wait(id).await, Err(ClientError::AlreadyAwaited(id)));
        corr.resolve(id, "ok".to_string()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_discard_after_timeout_swallows_late_outcome() {
        let corr = correlator();
        let id = corr.allocate();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), corr.wait(id)).await;
        assert!(timed_out.is_err());
        corr.discard(id);

        // Late reply neither errors nor resurrects a waiter
        corr.resolve(id, "late".to_string()).unwrap();
        assert!(!corr.is_waiting(id));
        assert_eq!(corr.wait(id).await, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_discard_releases_waiter() {
        let corr = correlator();
        let id = corr.allocate();

        let waiter = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.wait(id).await })
        };
        tokio::task::yield_now().await;
        assert!(corr.is_waiting(id));

        corr.discard(id);
        assert_eq!(waiter.await.unwrap(), Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_fail_all_releases_every_waiter() {
        let corr = correlator();
        let ids: Vec<RequestId> = (0..3).map(|_| corr.allocate()).collect();

        let waiters: Vec<_> = ids
            .iter()
            .map(|&id| {
                let corr = corr.clone();
                tokio::spawn(async move { corr.wait(id).await })
            })
            .collect();
        tokio::task::yield_now().await;

        // One id already has an outcome nobody read yet; it is left alone
        let ready = corr.allocate();
        corr.resolve(ready, "kept".to_string()).unwrap();

        assert_eq!(corr.fail_all(&ClientError::Disconnected), 3);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Err(ClientError::Disconnected));
        }
        assert_eq!(corr.wait(ready).await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_finished_ids_bounded() {
        let corr = RequestCorrelator::with_retention(Arc::new(IdAllocator::new(1)), 3);
        let mut ids = Vec::new();
        for n in 0..10 {
            let id = corr.allocate();
            corr.resolve(id, format!("reply {}", n)).unwrap();
            assert_eq!(corr.wait(id).await.unwrap(), format!("reply {}", n));
            ids.push(id);
        }
        assert_eq!(corr.tracked(), 3);

        // Recent ids still reject a second outcome
        let last = ids[9];
        assert_eq!(corr.resolve(last, "again".to_string()), Err(ClientError::AlreadyResolved(last)));
        assert_eq!(corr.tracked(), 3);

        // Live waiters are never evicted
        let pending = corr.allocate();
        corr.resolve(pending, "unread".to_string()).unwrap();
        for _ in 0..5 {
            let id = corr.allocate();
            corr.discard(id);
        }
        assert_eq!(corr.wait(pending).await.unwrap(), "unread");
    }
}
