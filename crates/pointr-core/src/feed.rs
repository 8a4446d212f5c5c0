// Per-session change feed.
//
// Every committed store mutation is fanned out on a tokio broadcast channel
// keyed by (session, entity kind). Subscribers that fall behind lose events
// and are told so; there is no replay, a lagging client resyncs instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{ChangeEvent, EntityKind, SessionId};

/// Events buffered per subscriber before it starts lagging.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("subscriber fell behind, {0} events dropped")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Counters for monitoring feed health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub events_published: u64,
    pub events_unobserved: u64,
    pub live_topics: usize,
}

type TopicKey = (SessionId, EntityKind);

// ---------------------------------------------------------------------------
// ChangeFeed
// ---------------------------------------------------------------------------

pub struct ChangeFeed {
    topics: RwLock<HashMap<TopicKey, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
    published: AtomicU64,
    unobserved: AtomicU64,
}

impl ChangeFeed {
    /// Create a feed whose topics buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            // broadcast::channel rejects a zero capacity
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attach to the `kind` topic of `session`. The topic is created on
    /// first use. Only events published after this call are delivered.
    pub fn subscribe(self: &Arc<Self>, session: &SessionId, kind: EntityKind) -> Subscription {
        let key = (session.clone(), kind);
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let receiver = topics
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!("subscribed to {kind} events of session {session}");

        Subscription {
            key,
            receiver: Some(receiver),
            feed: Arc::downgrade(self),
        }
    }

    /// Deliver `event` to every current subscriber of its topic. Returns the
    /// number of subscribers that will see it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let key = (event.entity.session_id().clone(), event.entity.kind());
        self.published.fetch_add(1, Ordering::Relaxed);

        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let delivered = topics
            .get(&key)
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0);
        if delivered == 0 {
            self.unobserved.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Tear down every topic of `session`. Live subscribers see
    /// [`FeedError::Closed`] once their buffered events are drained.
    pub fn close_session(&self, session: &SessionId) -> usize {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let before = topics.len();
        topics.retain(|(s, _), _| s != session);
        let removed = before - topics.len();
        debug!("closed {removed} topics of session {session}");
        removed
    }

    pub fn subscriber_count(&self, session: &SessionId, kind: EntityKind) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(&(session.clone(), kind))
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> FeedStats {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        FeedStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_unobserved: self.unobserved.load(Ordering::Relaxed),
            live_topics: topics.len(),
        }
    }

    /// Drop the topic once its last subscriber is gone.
    fn release(&self, key: &TopicKey) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.get(key).is_some_and(|sender| sender.receiver_count() == 0) {
            topics.remove(key);
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live attachment to one topic. Dropping it unsubscribes.
pub struct Subscription {
    key: TopicKey,
    receiver: Option<broadcast::Receiver<ChangeEvent>>,
    feed: Weak<ChangeFeed>,
}

impl Subscription {
    pub fn session(&self) -> &SessionId {
        &self.key.0
    }

    pub fn kind(&self) -> EntityKind {
        self.key.1
    }

    /// Wait for the next event on this topic.
    pub async fn recv(&mut self) -> Result<ChangeEvent, FeedError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(FeedError::Closed);
        };
        match receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(FeedError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(FeedError::Closed),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `Ok(None)` when no event
    /// is pending.
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(FeedError::Closed);
        };
        match receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(FeedError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(FeedError::Closed),
        }
    }

    /// Release the subscription now rather than at end of scope.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must be gone before the topic's count is checked.
        drop(self.receiver.take());
        if let Some(feed) = self.feed.upgrade() {
            feed.release(&self.key);
        }
    }
}
