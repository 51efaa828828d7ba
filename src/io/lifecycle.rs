// src/io/lifecycle.rs
//
// Connection lifetime control shared by the serial and TCP wrappers.
//
// A wrapper owns one `Lifecycle`. `open()` spawns a supervisor task that runs
// connection attempts until it is closed (serial) or until the first attempt
// ends (TCP). At most one supervisor task exists per wrapper. The open flag
// and the active lifetime record are only changed under one mutex, so a
// lifetime being torn down is never reported as open.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::broadcast::ErrorChannel;
use super::error::IoError;
use super::types::{AttemptOutcome, LinkStatus};
use super::write_queue::{WriteListener, WriteQueue};

// ============================================================================
// Shared Link State
// ============================================================================

struct ActiveLifetime {
    id: u64,
    stop: Arc<AtomicBool>,
    baseline: LinkStatus,
    task: JoinHandle<()>,
}

pub(crate) struct LinkState {
    open_tx: watch::Sender<bool>,
    status_tx: watch::Sender<LinkStatus>,
    active: Mutex<Option<ActiveLifetime>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl LinkState {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveLifetime>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Lifecycle Controller
// ============================================================================

/// Guards open/close so at most one connection lifetime is active at a time
pub(crate) struct Lifecycle {
    link: Arc<LinkState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (open_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            link: Arc::new(LinkState {
                open_tx,
                status_tx,
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.link.open_tx.borrow()
    }

    pub(crate) fn open_state(&self) -> watch::Receiver<bool> {
        self.link.open_tx.subscribe()
    }

    pub(crate) fn status(&self) -> watch::Receiver<LinkStatus> {
        self.link.status_tx.subscribe()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.link.disposed.load(Ordering::SeqCst)
    }

    /// Whether a supervisor task is currently running
    pub(crate) fn is_active(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|a| !a.task.is_finished())
            .unwrap_or(false)
    }

    /// Begin a new connection lifetime unless one is already running.
    ///
    /// `run` receives the lifetime context and is spawned on the current Tokio
    /// runtime, so the caller never waits for the handshake.
    pub(crate) fn open<F, Fut>(&self, device: &str, run: F) -> Result<OpenTicket, IoError>
    where
        F: FnOnce(LifetimeCtx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_disposed() {
            return Err(IoError::disposed(device));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| IoError::NoRuntime)?;

        let mut active = self.link.lock();
        if let Some(existing) = active.as_ref() {
            if !existing.task.is_finished() {
                tracing::debug!("[lifecycle:{}] open ignored, lifetime {} is active", device, existing.id);
                return Ok(OpenTicket {
                    device: device.to_string(),
                    status: self.link.status_tx.subscribe(),
                    baseline: existing.baseline.clone(),
                    stop: existing.stop.clone(),
                });
            }
        }

        let id = self.link.next_id.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let baseline = self.link.status_tx.borrow().clone();
        let ctx = LifetimeCtx {
            id,
            device: device.to_string(),
            stop: stop.clone(),
            link: self.link.clone(),
        };

        // Spawned while holding the lock; the task cannot mark itself open
        // before its record is installed below.
        let task = runtime.spawn(run(ctx));
        tracing::debug!("[lifecycle:{}] lifetime {} started", device, id);

        *active = Some(ActiveLifetime {
            id,
            stop: stop.clone(),
            baseline: baseline.clone(),
            task,
        });

        Ok(OpenTicket {
            device: device.to_string(),
            status: self.link.status_tx.subscribe(),
            baseline,
            stop,
        })
    }

    /// Release the active lifetime. The open flag is false when this returns.
    pub(crate) fn close(&self) {
        let mut active = self.link.lock();
        if let Some(lifetime) = active.take() {
            lifetime.stop.store(true, Ordering::SeqCst);
            self.link.open_tx.send_replace(false);
            lifetime.task.abort();
            tracing::debug!("[lifecycle] lifetime {} closed", lifetime.id);
        } else {
            self.link.open_tx.send_replace(false);
        }
        drop(active);

        // Wake tickets still waiting on the closed lifetime
        self.link.status_tx.send_modify(|_| {});
    }

    /// Close and refuse every later `open()`
    pub(crate) fn dispose(&self) {
        self.link.disposed.store(true, Ordering::SeqCst);
        self.close();
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Open Ticket
// ============================================================================

/// Completion handle returned by `open()`.
///
/// Resolves once the lifetime it belongs to opens its handle for the first
/// time, or fails with the first attempt's error.
pub struct OpenTicket {
    device: String,
    status: watch::Receiver<LinkStatus>,
    baseline: LinkStatus,
    stop: Arc<AtomicBool>,
}

impl OpenTicket {
    pub async fn established(mut self) -> Result<(), IoError> {
        loop {
            let outcome = self.status.borrow_and_update().outcome_since(&self.baseline);
            match outcome {
                AttemptOutcome::Opened => return Ok(()),
                AttemptOutcome::Failed(e) => return Err(e),
                AttemptOutcome::Pending => {}
            }
            if self.stop.load(Ordering::SeqCst) {
                return Err(IoError::closed(&self.device));
            }
            if self.status.changed().await.is_err() {
                return Err(IoError::disposed(&self.device));
            }
        }
    }

    /// `established` bounded by a deadline
    pub async fn established_within(self, limit: Duration) -> Result<(), IoError> {
        let device = self.device.clone();
        tokio::time::timeout(limit, self.established())
            .await
            .map_err(|_| IoError::timeout(&device, "open"))?
    }
}

// ============================================================================
// Lifetime Context
// ============================================================================

/// Handle given to a supervisor task for the lifetime it runs
#[derive(Clone)]
pub(crate) struct LifetimeCtx {
    id: u64,
    device: String,
    stop: Arc<AtomicBool>,
    link: Arc<LinkState>,
}

impl LifetimeCtx {
    pub(crate) fn device(&self) -> &str {
        &self.device
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Set the open flag if this lifetime is still the active one.
    /// Returns false when the lifetime was closed in the meantime.
    pub(crate) fn mark_open(&self) -> bool {
        let active = self.link.lock();
        match active.as_ref() {
            Some(a) if a.id == self.id && !self.is_stopped() => {
                self.link.open_tx.send_replace(true);
                self.link.status_tx.send_modify(|s| s.generation += 1);
                true
            }
            _ => false,
        }
    }

    /// Clear the open flag unless a newer lifetime has taken over
    pub(crate) fn mark_closed(&self) {
        let active = self.link.lock();
        if matches!(active.as_ref(), Some(a) if a.id == self.id) {
            self.link.open_tx.send_replace(false);
        }
    }

    /// Report a failed attempt: publish the error, then count it.
    ///
    /// With `retire` the lifetime also gives up its slot, so the next `open()`
    /// starts a fresh one. All of it happens under the lifetime lock; an
    /// `open()` racing with this sees either the old lifetime or none.
    /// Returns false when the lifetime was already closed or replaced.
    pub(crate) fn fail(&self, errors: &ErrorChannel, error: &IoError, retire: bool) -> bool {
        let mut active = self.link.lock();
        if self.is_stopped() || !matches!(active.as_ref(), Some(a) if a.id == self.id) {
            return false;
        }
        errors.publish(error.clone());
        self.link.status_tx.send_modify(|s| {
            s.failures += 1;
            s.last_error = Some(error.clone());
        });
        if retire {
            // Our own task handle; dropping it detaches
            active.take();
        }
        true
    }
}

// ============================================================================
// Attempt Guard
// ============================================================================

/// Tears down one connection attempt when dropped: open flag first, then the
/// write listener, then the reader.
///
/// Also runs when the supervisor task is aborted by `close()`.
pub(crate) struct AttemptGuard<'a> {
    ctx: &'a LifetimeCtx,
    writes: &'a WriteQueue,
    write_token: Option<u64>,
    reader_stop: Arc<AtomicBool>,
}

impl<'a> AttemptGuard<'a> {
    pub(crate) fn new(ctx: &'a LifetimeCtx, writes: &'a WriteQueue) -> Self {
        Self {
            ctx,
            writes,
            write_token: None,
            reader_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn attach_writes(&mut self) -> WriteListener {
        let (listener, token) = self.writes.attach();
        self.write_token = Some(token);
        listener
    }

    /// Flag the attempt's reader watches; set on teardown
    pub(crate) fn reader_stop(&self) -> Arc<AtomicBool> {
        self.reader_stop.clone()
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.ctx.mark_closed();
        if let Some(token) = self.write_token.take() {
            self.writes.detach(token);
        }
        self.reader_stop.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// What the supervisor does after a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryPolicy {
    /// Start over after `delay` (zero means immediately)
    Always { delay: Duration },
    /// Let the lifetime end; the caller must open again
    Never,
}

/// Run connection attempts for one lifetime.
///
/// Each attempt returns `Ok(())` when it ended because the lifetime was
/// stopped, or the error that broke it. Errors are published to `errors`
/// before the status counters change, so a caller woken by an `OpenTicket`
/// already finds the error on the channel.
pub(crate) async fn supervise<F, Fut>(
    ctx: LifetimeCtx,
    policy: RetryPolicy,
    errors: Arc<ErrorChannel>,
    mut attempt: F,
) where
    F: FnMut(LifetimeCtx) -> Fut,
    Fut: Future<Output = Result<(), IoError>>,
{
    let device = ctx.device().to_string();
    let mut attempts: u64 = 0;

    loop {
        if ctx.is_stopped() {
            break;
        }
        attempts += 1;

        match attempt(ctx.clone()).await {
            Ok(()) => break,
            Err(e) => {
                let retire = policy == RetryPolicy::Never;
                if !ctx.fail(&errors, &e, retire) {
                    break;
                }
                tracing::warn!("[supervisor:{}] attempt {} failed: {}", device, attempts, e);

                match policy {
                    RetryPolicy::Never => break,
                    RetryPolicy::Always { delay } if delay.is_zero() => tokio::task::yield_now().await,
                    RetryPolicy::Always { delay } => tokio::time::sleep(delay).await,
                }
            }
        }
    }

    tracing::debug!("[supervisor:{}] lifetime ended after {} attempts", device, attempts);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn channel() -> Arc<ErrorChannel> {
        Arc::new(ErrorChannel::new(64))
    }

    #[tokio::test]
    async fn test_redundant_open_keeps_one_lifetime() {
        let lifecycle = Lifecycle::new();
        let starts = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let starts = starts.clone();
            lifecycle
                .open("test", move |ctx| async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    ctx.mark_open();
                    std::future::pending::<()>().await;
                })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_open());
        assert!(lifecycle.is_active());

        lifecycle.close();
        assert!(!lifecycle.is_open());
        assert!(!lifecycle.is_active());
    }

    #[tokio::test]
    async fn test_ticket_resolves_on_open() {
        let lifecycle = Lifecycle::new();
        let ticket = lifecycle
            .open("test", |ctx| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.mark_open();
                std::future::pending::<()>().await;
            })
            .unwrap();

        ticket.established_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(lifecycle.status().borrow().generation, 1);
    }

    #[tokio::test]
    async fn test_ticket_reports_first_failure() {
        let lifecycle = Lifecycle::new();
        let errors = channel();
        let mut error_sub = errors.subscribe();

        let ticket = lifecycle
            .open("COM7", move |ctx| {
                supervise(ctx, RetryPolicy::Never, errors, |ctx| async move {
                    Err(IoError::endpoint_unavailable(ctx.device(), "serial port does not exist"))
                })
            })
            .unwrap();

        let err = ticket.established_within(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, IoError::EndpointUnavailable { .. }));
        assert_eq!(error_sub.try_recv(), Some(err));
        assert!(!lifecycle.is_open());
    }

    #[tokio::test]
    async fn test_finished_lifetime_can_be_reopened() {
        let lifecycle = Lifecycle::new();
        let errors = channel();

        for round in 1..=2u64 {
            let errors = errors.clone();
            let ticket = lifecycle
                .open("peer", move |ctx| {
                    supervise(ctx, RetryPolicy::Never, errors, |ctx| async move {
                        Err(IoError::read(ctx.device(), "connection closed by peer"))
                    })
                })
                .unwrap();
            assert!(ticket.established_within(Duration::from_secs(2)).await.is_err());
            // Let the supervisor task finish before reopening
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(lifecycle.status().borrow().failures, round);
        }
    }

    #[tokio::test]
    async fn test_retry_policy_restarts_attempts() {
        let lifecycle = Lifecycle::new();
        let errors = channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let ticket = lifecycle
            .open("COM1", move |ctx| {
                supervise(
                    ctx,
                    RetryPolicy::Always { delay: Duration::ZERO },
                    errors,
                    move |ctx| {
                        let counter = counter.clone();
                        async move {
                            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                                return Err(IoError::hardware(ctx.device(), "Frame"));
                            }
                            ctx.mark_open();
                            std::future::pending::<()>().await;
                            Ok(())
                        }
                    },
                )
            })
            .unwrap();

        // The first attempt fails, so the ticket reports that failure
        assert!(ticket.established_within(Duration::from_secs(2)).await.is_err());

        let mut status = lifecycle.status();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.generation == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(lifecycle.is_open());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_ticket() {
        let lifecycle = Lifecycle::new();
        let ticket = lifecycle
            .open("slow", |_ctx| std::future::pending::<()>())
            .unwrap();
        lifecycle.close();
        assert_eq!(
            ticket.established_within(Duration::from_secs(2)).await,
            Err(IoError::closed("slow"))
        );
    }

    #[tokio::test]
    async fn test_open_after_dispose_fails() {
        let lifecycle = Lifecycle::new();
        lifecycle.dispose();
        let result = lifecycle.open("COM1", |_ctx| async {});
        assert!(matches!(result, Err(IoError::Disposed { .. })));
    }

    #[test]
    fn test_open_without_runtime_fails() {
        let lifecycle = Lifecycle::new();
        let result = lifecycle.open("COM1", |_ctx| async {});
        assert!(matches!(result, Err(IoError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_stale_guard_does_not_clear_newer_lifetime() {
        let lifecycle = Lifecycle::new();
        let queue = WriteQueue::new();

        let (tx, rx) = tokio::sync::oneshot::channel::<LifetimeCtx>();
        lifecycle
            .open("COM1", move |ctx| async move {
                let _ = tx.send(ctx);
            })
            .unwrap();
        let old_ctx = rx.await.unwrap();
        lifecycle.close();

        lifecycle
            .open("COM1", |ctx| async move {
                ctx.mark_open();
                std::future::pending::<()>().await;
            })
            .unwrap();
        let mut open = lifecycle.open_state();
        tokio::time::timeout(Duration::from_secs(2), open.wait_for(|o| *o))
            .await
            .unwrap()
            .unwrap();

        // Teardown of the old lifetime runs late and must leave the new one alone
        drop(AttemptGuard::new(&old_ctx, &queue));
        assert!(lifecycle.is_open());
    }
}
