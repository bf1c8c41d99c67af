//! Progress broadcaster
//!
//! Keeps one bounded outbound queue per connected listener and fans every
//! [`Event`] out to all of them without ever blocking the sender. A listener
//! whose queue is full misses that event; a listener whose stream is gone is
//! signalled finished and dropped from the registry.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use ferry_common::{Event, LifecycleStage};
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Events buffered per subscriber before it starts missing events
pub const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    tx: mpsc::Sender<Event>,
    finished: mpsc::Sender<()>,
    /// Distinguishes a re-subscription under the same id
    generation: u64,
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    subscribers: Arc<DashMap<String, Subscriber>>,
    generations: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `event` to every subscriber. Returns how many accepted it.
    pub fn broadcast(&self, event: Event) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber_id = %entry.key(), "Subscriber buffer full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    let _ = entry.finished.try_send(());
                    closed.push((entry.key().clone(), entry.generation));
                }
            }
        }

        for (id, generation) in closed {
            if self
                .subscribers
                .remove_if(&id, |_, s| s.generation == generation)
                .is_some()
            {
                debug!(subscriber_id = %id, "Removed unreachable subscriber");
            }
        }

        delivered
    }

    /// Register `id` and return its event stream.
    ///
    /// An existing subscription under the same id is finished first.
    pub fn subscribe(&self, id: impl Into<String>) -> EventStream {
        let id = id.into();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (finished_tx, finished_rx) = mpsc::channel(1);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let previous = self.subscribers.insert(
            id.clone(),
            Subscriber {
                tx,
                finished: finished_tx,
                generation,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.finished.try_send(());
            info!(subscriber_id = %id, "Replaced existing subscription");
        } else {
            info!(subscriber_id = %id, "Subscriber registered");
        }

        EventStream {
            id,
            generation,
            rx,
            finished: finished_rx,
            done: false,
            broadcaster: self.clone(),
        }
    }

    /// Force a subscriber's stream to end
    pub fn finish(&self, id: &str) -> bool {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                let _ = subscriber.finished.try_send(());
                true
            }
            None => false,
        }
    }

    /// End every subscriber's stream. Returns how many were finished.
    pub fn finish_all(&self) -> usize {
        let ids: Vec<String> = self
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let finished = ids.iter().filter(|id| self.finish(id)).count();
        if finished > 0 {
            info!(finished, "Finished all subscribers");
        }
        finished
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }
}

/// Live event feed for one subscriber.
///
/// Ends when the subscription is finished or replaced. Dropping it
/// deregisters the subscriber and announces the departure to the others.
pub struct EventStream {
    id: String,
    generation: u64,
    rx: mpsc::Receiver<Event>,
    finished: mpsc::Receiver<()>,
    done: bool,
    broadcaster: Broadcaster,
}

impl EventStream {
    pub fn subscriber_id(&self) -> &str {
        &self.id
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.done {
            return Poll::Ready(None);
        }

        // A dropped sender also means the entry left the registry
        if self.finished.poll_recv(cx).is_ready() {
            self.done = true;
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let generation = self.generation;
        self.broadcaster
            .subscribers
            .remove_if(&self.id, |_, s| s.generation == generation);

        info!(subscriber_id = %self.id, "Subscriber closed");
        self.broadcaster.broadcast(Event::lifecycle(
            None,
            LifecycleStage::SubscriberClosed,
            format!("subscriber {} closed", self.id),
        ));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ferry_common::UploadPhase;
    use futures::StreamExt;

    fn progress(n: u64) -> Event {
        Event::progress("/data/file.bin", 100, n, 1, UploadPhase::InProgress)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe("a");
        let mut b = broadcaster.subscribe("b");

        assert_eq!(broadcaster.broadcast(progress(10)), 2);
        assert_eq!(a.next().await, Some(progress(10)));
        assert_eq!(b.next().await, Some(progress(10)));
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed_and_signalled() {
        let broadcaster = Broadcaster::new();
        let mut healthy = broadcaster.subscribe("healthy");

        // A subscriber whose receiving side vanished without deregistering
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (finished_tx, mut finished_rx) = mpsc::channel(1);
        drop(rx);
        broadcaster.subscribers.insert(
            "gone".to_string(),
            Subscriber {
                tx,
                finished: finished_tx,
                generation: u64::MAX,
            },
        );

        assert_eq!(broadcaster.broadcast(progress(1)), 1);
        assert!(!broadcaster.is_subscribed("gone"));
        assert!(broadcaster.is_subscribed("healthy"));
        assert_eq!(finished_rx.recv().await, Some(()));

        assert_eq!(broadcaster.broadcast(progress(2)), 1);
        assert_eq!(healthy.next().await, Some(progress(1)));
        assert_eq!(healthy.next().await, Some(progress(2)));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_event_but_keeps_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut slow = broadcaster.subscribe("slow");

        for n in 0..SUBSCRIBER_BUFFER as u64 {
            broadcaster.broadcast(progress(n));
        }
        assert_eq!(broadcaster.broadcast(progress(9_999)), 0);
        assert!(broadcaster.is_subscribed("slow"));

        assert_eq!(slow.next().await, Some(progress(0)));
        assert_eq!(broadcaster.broadcast(progress(10_000)), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_finishes_previous_stream() {
        let broadcaster = Broadcaster::new();
        let mut first = broadcaster.subscribe("cli");
        let mut second = broadcaster.subscribe("cli");

        assert_eq!(first.next().await, None);
        drop(first);
        assert!(broadcaster.is_subscribed("cli"));

        broadcaster.broadcast(progress(5));
        // The old stream's departure notice arrives first
        assert!(matches!(
            second.next().await,
            Some(Event::Lifecycle {
                stage: LifecycleStage::SubscriberClosed,
                ..
            })
        ));
        assert_eq!(second.next().await, Some(progress(5)));
    }

    #[tokio::test]
    async fn test_drop_deregisters_and_announces() {
        let broadcaster = Broadcaster::new();
        let mut watcher = broadcaster.subscribe("watcher");
        let leaver = broadcaster.subscribe("leaver");
        drop(leaver);

        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(matches!(
            watcher.next().await,
            Some(Event::Lifecycle {
                stage: LifecycleStage::SubscriberClosed,
                manifest_id: None,
                ..
            })
        ));

        assert!(broadcaster.finish("watcher"));
        assert_eq!(watcher.next().await, None);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_finish_all_ends_every_stream() {
        let broadcaster = Broadcaster::new();
        let mut ui = broadcaster.subscribe("ui");
        let mut cli = broadcaster.subscribe("cli");
        broadcaster.broadcast(progress(1));

        assert_eq!(broadcaster.finish_all(), 2);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(ui.next().await, None);
        assert_eq!(cli.next().await, None);
        assert_eq!(broadcaster.finish_all(), 0);
    }
}
