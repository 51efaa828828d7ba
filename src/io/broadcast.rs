// src/io/broadcast.rs
//
// Multicast publish points for inbound data, errors and port-name lists.
//
// A `Broadcast<T>` is owned by the wrapper and outlives every connection
// lifetime, so observers stay attached while the connection underneath is
// torn down and re-established. Observers that attach late only see events
// published after they subscribed.

use std::sync::Mutex;

use futures::{future, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::error::IoError;

/// Per-observer backlog before the slowest observer starts skipping events
pub const DEFAULT_CAPACITY: usize = 4096;

// ============================================================================
// Broadcast
// ============================================================================

/// Replay-less multicast channel
pub struct Broadcast<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current observer, returning how many received it.
    /// Publishing with nobody attached is not an error.
    pub fn publish(&self, value: T) -> usize {
        self.tx.send(value).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// One observer's view of a broadcast channel.
///
/// Lagging never ends the subscription: skipped events are logged and the
/// observer continues with the oldest retained event. `recv` only returns
/// `None` once the owning wrapper has been dropped.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[broadcast] observer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is pending
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("[broadcast] observer lagged, skipped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently pending
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Convert into a `Stream` that silently skips lagged events
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin {
        BroadcastStream::new(self.rx).filter_map(|item| future::ready(item.ok()))
    }
}

// ============================================================================
// Error Channel
// ============================================================================

/// Broadcast channel for connection errors that collapses consecutive errors
/// with the same message into a single emission.
pub struct ErrorChannel {
    inner: Broadcast<IoError>,
    last_message: Mutex<Option<String>>,
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Broadcast::new(capacity),
            last_message: Mutex::new(None),
        }
    }

    /// Publish an error unless it repeats the previous one.
    /// Returns whether the error was emitted.
    pub fn publish(&self, error: IoError) -> bool {
        let message = error.to_string();
        let mut last = self
            .last_message
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if last.as_deref() == Some(message.as_str()) {
            return false;
        }
        *last = Some(message);
        // Sent while holding the lock so observers see the same order the filter saw
        self.inner.publish(error);
        true
    }

    pub fn subscribe(&self) -> Subscription<IoError> {
        self.inner.subscribe()
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ============================================================================
// Tests
// ============================================================================
