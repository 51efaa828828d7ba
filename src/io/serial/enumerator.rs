// src/io/serial/enumerator.rs
//
// Shared poller for the list of serial device names.
//
// The poller runs while at least one observer is attached. It emits the list
// on its first successful poll and then only when the names change. An empty
// system is reported as a single "NoPorts" entry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::backend::SerialBackend;
use crate::io::broadcast::{Broadcast, Subscription};
use crate::io::error::IoError;

/// Entry published when no serial devices are present
pub const NO_PORTS: &str = "NoPorts";

struct EnumeratorInner {
    backend: Arc<dyn SerialBackend>,
    interval: Duration,
    names: Broadcast<Vec<String>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl EnumeratorInner {
    fn lock_poller(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reference-counted device-name poller
pub struct PortEnumerator {
    inner: Arc<EnumeratorInner>,
}

impl PortEnumerator {
    pub fn new(backend: Arc<dyn SerialBackend>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(EnumeratorInner {
                backend,
                interval: interval.max(Duration::from_millis(1)),
                names: Broadcast::new(64),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Attach an observer, starting the poller if it is not running
    pub fn subscribe(&self) -> Result<Subscription<Vec<String>>, IoError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| IoError::NoRuntime)?;

        let mut poller = self.inner.lock_poller();
        let subscription = self.inner.names.subscribe();

        let running = poller.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            tracing::debug!("[enumerator] starting poller every {:?}", self.inner.interval);
            *poller = Some(runtime.spawn(poll_names(Arc::downgrade(&self.inner))));
        }

        Ok(subscription)
    }

    /// Whether the poller task is currently running
    pub fn is_polling(&self) -> bool {
        self.inner
            .lock_poller()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for PortEnumerator {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lock_poller().take() {
            handle.abort();
        }
    }
}

/// The published list for one enumeration result
fn normalize(names: Vec<String>) -> Vec<String> {
    if names.is_empty() {
        vec![NO_PORTS.to_string()]
    } else {
        names
    }
}

async fn poll_names(weak: Weak<EnumeratorInner>) {
    let period = match weak.upgrade() {
        Some(inner) => inner.interval,
        None => return,
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Joined names of the last emitted list
    let mut previous: Option<String> = None;

    loop {
        ticker.tick().await;

        let Some(inner) = weak.upgrade() else { break };
        {
            // Checked under the same lock `subscribe` takes, so a new observer
            // either keeps this task alive or starts a fresh one.
            let mut poller = inner.lock_poller();
            if inner.names.observer_count() == 0 {
                *poller = None;
                tracing::debug!("[enumerator] last observer detached, stopping poller");
                break;
            }
        }

        let backend = inner.backend.clone();
        match tokio::task::spawn_blocking(move || backend.list_port_names()).await {
            Ok(Ok(names)) => {
                let names = normalize(names);
                let joined = names.concat();
                if previous.as_deref() != Some(joined.as_str()) {
                    tracing::debug!("[enumerator] port list changed: {:?}", names);
                    previous = Some(joined);
                    inner.names.publish(names);
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("[enumerator] failed to enumerate ports: {}", e);
                previous = None;
            }
            Err(e) => {
                tracing::warn!("[enumerator] enumeration worker failed: {}", e);
                previous = None;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
