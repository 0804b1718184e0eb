use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to one frontend connection held inside a channel's subscriber set.
///
/// The connection task owns the receiving half of `tx` and the lifetime of
/// the connection; a channel only ever holds this cheap clone. Cancelling
/// `cancel` force-closes the connection (slow-consumer policy).
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Subscriber {
    pub fn new(id: Uuid, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { id, tx, cancel }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// A named subscriber set within a vhost; the publication unit.
///
/// Publication is serialized on the subscriber-set lock, so every surviving
/// subscriber observes events in publication order. The enqueue attempt is
/// non-blocking: a subscriber whose bounded outbound queue is full is
/// disconnected and removed rather than allowed to stall the publisher.
#[derive(Debug)]
pub struct Channel {
    name: String,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a subscriber. Re-subscribing replaces the previous handle for the
    /// same connection id.
    pub async fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers
            .lock()
            .await
            .insert(subscriber.id(), subscriber);
    }

    /// Remove one subscriber. Returns `false` if it was not a member.
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.lock().await.remove(&id).is_some()
    }

    /// Detach every subscriber without closing their connections. Used when
    /// the channel is deleted out from under them.
    pub async fn detach_all(&self) {
        self.subscribers.lock().await.clear();
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.subscribers.lock().await.contains_key(&id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Fan a pre-serialized frame out to every current subscriber.
    ///
    /// Each subscriber either has the frame enqueued on its outbound queue or
    /// is disconnected on the spot — a full queue means the consumer is too
    /// slow, a closed queue means the connection is already gone. Returns the
    /// number of subscribers the frame was enqueued for.
    pub async fn publish(&self, frame: &str) -> usize {
        let mut subs = self.subscribers.lock().await;
        let mut dropped: Vec<Uuid> = Vec::new();

        for (id, sub) in subs.iter() {
            if let Err(e) = sub.tx.try_send(frame.to_owned()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!(
                            channel = %self.name,
                            subscriber = %id,
                            "outbound queue full; dropping slow consumer"
                        );
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        tracing::debug!(
                            channel = %self.name,
                            subscriber = %id,
                            "subscriber queue closed; removing stale handle"
                        );
                    }
                }
                sub.cancel.cancel();
                dropped.push(*id);
            }
        }

        for id in dropped {
            subs.remove(&id);
        }
        subs.len()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_subscriber(capacity: usize) -> (Subscriber, mpsc::Receiver<String>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (Subscriber::new(Uuid::new_v4(), tx, cancel.clone()), rx, cancel)
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let channel = Channel::new("room");
        let (sub, mut rx, _cancel) = make_subscriber(8);
        channel.subscribe(sub).await;

        assert_eq!(channel.publish("hello").await, 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_to_empty_channel_is_noop() {
        let channel = Channel::new("room");
        assert_eq!(channel.publish("hello").await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let channel = Channel::new("room");
        let (sub, mut rx, _cancel) = make_subscriber(8);
        let id = sub.id();
        channel.subscribe(sub).await;

        assert!(channel.unsubscribe(id).await);
        channel.publish("after").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_of_non_member_returns_false() {
        let channel = Channel::new("room");
        assert!(!channel.unsubscribe(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_and_cancelled() {
        let channel = Channel::new("room");
        let (slow, _slow_rx, slow_cancel) = make_subscriber(2);
        let (fast, mut fast_rx, _fast_cancel) = make_subscriber(16);
        let slow_id = slow.id();
        channel.subscribe(slow).await;
        channel.subscribe(fast).await;

        for i in 0..5 {
            channel.publish(&format!("e{i}")).await;
        }

        // The slow handle overflowed after two frames and was removed.
        assert!(!channel.contains(slow_id).await);
        assert!(slow_cancel.is_cancelled());
        assert_eq!(channel.subscriber_count().await, 1);

        // The fast co-subscriber saw every event, in publication order.
        for i in 0..5 {
            assert_eq!(fast_rx.recv().await.unwrap(), format!("e{i}"));
        }
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned_on_publish() {
        let channel = Channel::new("room");
        let (sub, rx, _cancel) = make_subscriber(4);
        let id = sub.id();
        channel.subscribe(sub).await;
        drop(rx);

        assert_eq!(channel.publish("e").await, 0);
        assert!(!channel.contains(id).await);
    }

    #[tokio::test]
    async fn detach_all_clears_without_cancelling() {
        let channel = Channel::new("room");
        let (sub, _rx, cancel) = make_subscriber(4);
        channel.subscribe(sub).await;

        channel.detach_all().await;
        assert_eq!(channel.subscriber_count().await, 0);
        assert!(!cancel.is_cancelled(), "detach must not close the connection");
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_handle() {
        let channel = Channel::new("room");
        let id = Uuid::new_v4();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        channel
            .subscribe(Subscriber::new(id, old_tx, CancellationToken::new()))
            .await;
        channel
            .subscribe(Subscriber::new(id, new_tx, CancellationToken::new()))
            .await;

        channel.publish("e").await;
        assert_eq!(channel.subscriber_count().await, 1);
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.recv().await.unwrap(), "e");
    }
}
