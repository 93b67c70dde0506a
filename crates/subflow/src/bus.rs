// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closable broadcast channel fanning items out to live subscribers.
//!
//! Every subscriber owns an unbounded queue, so publishing never blocks and a
//! slow subscriber never loses items. Subscriptions are live from the moment
//! they are created: nothing published earlier is replayed, except the final
//! items passed to [`Broadcast::close`], which every subscription (including
//! ones created after closing) observes before it ends.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug)]
struct State<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    /// Final items once closed.
    closed: Option<Vec<T>>,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_subscribers: AtomicU64,
}

/// Multi-producer, multi-subscriber channel that can be closed with final items.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug)]
pub struct Broadcast<T> {
    state: Arc<Mutex<State<T>>>,
    stats: Arc<StatsInner>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcast<T> {
    /// Create an open channel with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                subscribers: Vec::new(),
                closed: None,
            })),
            stats: Arc::new(StatsInner::default()),
        }
    }

    // The lock is never held across user code, so a poisoned lock still
    // guards consistent data.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish `items` to every current subscriber, in order.
    ///
    /// Ignored once the channel is closed.
    pub fn push<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        for item in items {
            self.stats.total_published.fetch_add(1, Ordering::Relaxed);
            self.fan_out(&mut state.subscribers, item);
        }
    }

    fn fan_out(&self, subscribers: &mut Vec<mpsc::UnboundedSender<T>>, item: T) {
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        let dropped = (before - subscribers.len()) as u64;
        if dropped > 0 {
            self.stats
                .dropped_subscribers
                .fetch_add(dropped, Ordering::Relaxed);
        }
    }

    /// Subscribe from now on. The subscription ends when the channel closes
    /// (after the final items) or when `scope` is cancelled.
    #[must_use]
    pub fn listen(&self, scope: &CancellationToken) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        match &state.closed {
            Some(finals) => {
                // Receiver still holds the queued finals after the sender drops.
                for item in finals {
                    let _ = tx.send(item.clone());
                }
            }
            None => state.subscribers.push(tx),
        }
        Subscription::new(rx, scope.clone())
    }

    /// Publish `finals`, then end the channel for good.
    ///
    /// Returns `false` if the channel was already closed.
    pub fn close<I>(&self, finals: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        let finals: Vec<T> = finals.into_iter().collect();
        for item in &finals {
            self.stats.total_published.fetch_add(1, Ordering::Relaxed);
            self.fan_out(&mut state.subscribers, item.clone());
        }
        state.subscribers.clear();
        state.closed = Some(finals);
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of subscribers that will receive the next item.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Snapshot of the channel statistics.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
            dropped_subscribers: self.stats.dropped_subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`Broadcast`] statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Items published, final items included.
    pub total_published: u64,
    /// Subscribers currently attached.
    pub active_subscribers: usize,
    /// Subscribers found gone while publishing.
    pub dropped_subscribers: u64,
}

/// Live view of a [`Broadcast`], usable as a [`Stream`].
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl<T> Subscription<T> {
    fn new(rx: mpsc::UnboundedReceiver<T>, scope: CancellationToken) -> Self {
        Self {
            rx,
            cancelled: Box::pin(scope.cancelled_owned()),
            finished: false,
        }
    }

    /// Receive the next item, or `None` once the channel closed or the
    /// subscription's scope was cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.finished = true;
            this.rx.close();
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_items_pushed_after_listen() {
        let bus = Broadcast::<u32>::new();
        bus.push([0]);
        let scope = CancellationToken::new();
        let mut a = bus.listen(&scope);
        let mut b = bus.listen(&scope);
        bus.push([1, 2]);
        bus.close([3]);

        assert_eq!(a.by_ref().collect::<Vec<_>>().await, vec![1, 2, 3]);
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(3));
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_finals() {
        let bus = Broadcast::<&str>::new();
        bus.push(["early"]);
        bus.close(["last"]);
        let sub = bus.listen(&CancellationToken::new());
        assert_eq!(sub.collect::<Vec<_>>().await, vec!["last"]);
    }

    #[tokio::test]
    async fn push_after_close_is_ignored() {
        let bus = Broadcast::<u8>::new();
        let sub = bus.listen(&CancellationToken::new());
        assert!(bus.close([]));
        bus.push([9]);
        assert!(!bus.close([1]));
        assert!(bus.is_closed());
        assert!(sub.collect::<Vec<_>>().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_scope_ends_subscription() {
        let bus = Broadcast::<u8>::new();
        let scope = CancellationToken::new();
        let mut sub = bus.listen(&scope);
        bus.push([1]);
        scope.cancel();
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = Broadcast::<u8>::new();
        let scope = CancellationToken::new();
        let keep = bus.listen(&scope);
        drop(bus.listen(&scope));
        bus.push([1]);

        let stats = bus.stats();
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.active_subscribers, 1);
        assert_eq!(stats.dropped_subscribers, 1);
        drop(keep);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
