// src/io/serial/port.rs
//
// Self-healing serial port.
//
// `SerialPortRx` keeps one device open for as long as the caller wants it
// open. Every failure (device missing, open error, line fault, read or write
// error) is published on the error channel and the whole attempt is started
// again, without the caller calling `open()` a second time. Observers of the
// data and error channels stay attached across those restarts.
//
// Each attempt runs one blocking worker that owns the device handle. The
// worker reads with a short timeout and applies queued writes between reads,
// so reads and writes never contend for the handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use super::backend::{SerialBackend, SerialHandle, SystemSerialBackend};
use super::enumerator::PortEnumerator;
use crate::config::SerialConfig;
use crate::io::broadcast::{Broadcast, ErrorChannel, Subscription, DEFAULT_CAPACITY};
use crate::io::codec::{encode_request, CharDecoder, Encoding};
use crate::io::error::IoError;
use crate::io::lifecycle::{supervise, AttemptGuard, Lifecycle, LifetimeCtx, OpenTicket, RetryPolicy};
use crate::io::types::{LinkStatus, WriteRequest};
use crate::io::write_queue::{WriteListener, WriteQueue};
use crate::io::PortRx;

/// Longest single blocking read; bounds how long a stop request can go unnoticed
const READ_SLICE: Duration = Duration::from_millis(50);

/// Write bound used when the configuration leaves it unset
const UNBOUNDED_WRITE_TIMEOUT: Duration = Duration::from_secs(3600);

const READ_BUFFER_SIZE: usize = 1024;

/// State shared between the wrapper and its connection attempts
struct SerialShared {
    backend: Arc<dyn SerialBackend>,
    data: Broadcast<char>,
    errors: Arc<ErrorChannel>,
    writes: WriteQueue,
}

/// Serial port that reconnects by itself after any failure
pub struct SerialPortRx {
    config: Mutex<SerialConfig>,
    shared: Arc<SerialShared>,
    lifecycle: Lifecycle,
    enumerator: PortEnumerator,
}

impl SerialPortRx {
    /// Port on the host's serial devices
    pub fn new(config: SerialConfig) -> Self {
        Self::with_backend(config, Arc::new(SystemSerialBackend))
    }

    pub fn with_backend(config: SerialConfig, backend: Arc<dyn SerialBackend>) -> Self {
        let enumerator = PortEnumerator::new(backend.clone(), config.poll_interval());
        Self {
            config: Mutex::new(config),
            shared: Arc::new(SerialShared {
                backend,
                data: Broadcast::new(DEFAULT_CAPACITY),
                errors: Arc::new(ErrorChannel::default()),
                writes: WriteQueue::new(),
            }),
            lifecycle: Lifecycle::new(),
            enumerator,
        }
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> SerialConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration. An open port keeps its settings until the
    /// next attempt.
    pub fn set_config(&self, config: SerialConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn update_config(&self, f: impl FnOnce(&mut SerialConfig)) {
        f(&mut self.config.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn port_name(&self) -> String {
        self.config().port_name
    }

    /// Whether a connection lifetime is running, connected or not
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Watch the open flag
    pub fn open_state(&self) -> watch::Receiver<bool> {
        self.lifecycle.open_state()
    }

    /// Watch the attempt counters
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.lifecycle.status()
    }

    /// Device names present on the system, emitted when they change
    pub fn port_names(&self) -> Result<Subscription<Vec<String>>, IoError> {
        self.enumerator.subscribe()
    }
}

impl PortRx for SerialPortRx {
    type Item = char;

    fn open(&self) -> Result<OpenTicket, IoError> {
        let config = self.config();
        let device = config.port_name.clone();
        let policy = RetryPolicy::Always {
            delay: config.retry_delay(),
        };
        let shared = self.shared.clone();
        let errors = shared.errors.clone();

        tracing::info!("[serial:{}] opening at {} baud", device, config.baud_rate);
        self.lifecycle.open(&device, move |ctx| {
            supervise(ctx, policy, errors, move |ctx| {
                run_attempt(shared.clone(), config.clone(), ctx)
            })
        })
    }

    fn close(&self) {
        self.lifecycle.close();
    }

    fn dispose(&self) {
        self.lifecycle.dispose();
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn data_received(&self) -> Subscription<char> {
        self.shared.data.subscribe()
    }

    fn errors(&self) -> Subscription<IoError> {
        self.shared.errors.subscribe()
    }

    fn submit(&self, request: WriteRequest) -> bool {
        self.shared.writes.submit(request)
    }
}

// ============================================================================
// Connection Attempt
// ============================================================================

/// Settings the worker needs for the lifetime of one attempt
struct WorkerSettings {
    port: String,
    encoding: Encoding,
    new_line: String,
    read_slice: Duration,
    write_timeout: Duration,
}

async fn run_attempt(
    shared: Arc<SerialShared>,
    config: SerialConfig,
    ctx: LifetimeCtx,
) -> Result<(), IoError> {
    let port = config.port_name.clone();

    // The device must be present before a handle is opened
    let backend = shared.backend.clone();
    match tokio::task::spawn_blocking(move || backend.list_port_names()).await {
        Ok(Ok(names)) if names.contains(&port) => {}
        Ok(Ok(_)) => return Err(IoError::endpoint_unavailable(&port, "serial port does not exist")),
        Ok(Err(e)) => {
            return Err(IoError::endpoint_unavailable(
                &port,
                format!("failed to enumerate ports: {}", e),
            ))
        }
        Err(e) => return Err(IoError::open(&port, e.to_string())),
    }

    let read_slice = config
        .read_timeout()
        .map(|t| t.clamp(Duration::from_millis(1), READ_SLICE))
        .unwrap_or(READ_SLICE);

    let backend = shared.backend.clone();
    let open_config = config.clone();
    let opened = tokio::task::spawn_blocking(move || -> std::io::Result<Box<dyn SerialHandle>> {
        let mut handle = backend.open(&open_config)?;
        handle.set_timeout(read_slice)?;
        handle.discard_buffers()?;
        Ok(handle)
    })
    .await;
    let handle = match opened {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => return Err(IoError::open(&port, e.to_string())),
        Err(e) => return Err(IoError::open(&port, e.to_string())),
    };

    let mut guard = AttemptGuard::new(&ctx, &shared.writes);
    tokio::time::sleep(config.settle()).await;

    let writes = guard.attach_writes();
    if !ctx.mark_open() {
        return Ok(());
    }
    tracing::info!("[serial:{}] connected", port);

    let settings = WorkerSettings {
        port: port.clone(),
        encoding: config.encoding,
        new_line: config.new_line.clone(),
        read_slice,
        write_timeout: config.write_timeout().unwrap_or(UNBOUNDED_WRITE_TIMEOUT),
    };
    let stops = [ctx.stop_flag(), guard.reader_stop()];
    let data = shared.data.clone();
    let decoder = config.encoding.decoder();

    let worker = tokio::task::spawn_blocking(move || {
        run_worker(handle, writes, data, decoder, &settings, &stops)
    });

    let result = match worker.await {
        Ok(result) => result,
        Err(e) => Err(IoError::read(&port, format!("serial worker failed: {}", e))),
    };
    if result.is_ok() {
        tracing::info!("[serial:{}] closed", port);
    }
    result
}

fn is_stopped(stops: &[Arc<AtomicBool>]) -> bool {
    stops.iter().any(|s| s.load(Ordering::SeqCst))
}

/// Blocking read/write loop that owns the device handle for one attempt.
/// Returns `Ok(())` when stopped, or the error that broke the connection.
fn run_worker(
    mut handle: Box<dyn SerialHandle>,
    mut writes: WriteListener,
    data: Broadcast<char>,
    mut decoder: CharDecoder,
    settings: &WorkerSettings,
    stops: &[Arc<AtomicBool>],
) -> Result<(), IoError> {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        if is_stopped(stops) {
            return Ok(());
        }

        if let Some(fault) = handle.poll_error_event() {
            return Err(IoError::hardware(&settings.port, fault));
        }

        while let Some(request) = writes.try_next() {
            apply_write(handle.as_mut(), &request, settings)?;
        }

        match handle.read(&mut buf) {
            Ok(0) => return Err(IoError::read(&settings.port, "device disconnected")),
            Ok(n) => {
                // Data read after close is not published
                if is_stopped(stops) {
                    return Ok(());
                }
                for c in decoder.decode(&buf[..n]) {
                    data.publish(c);
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(IoError::read(&settings.port, e.to_string())),
        }
    }
}

fn apply_write(
    handle: &mut dyn SerialHandle,
    request: &WriteRequest,
    settings: &WorkerSettings,
) -> Result<(), IoError> {
    let bytes = encode_request(request, settings.encoding, &settings.new_line)
        .map_err(|e| IoError::write(&settings.port, e))?;
    if bytes.is_empty() {
        return Ok(());
    }

    let fail = |e: std::io::Error| IoError::write(&settings.port, e.to_string());
    handle.set_timeout(settings.write_timeout).map_err(fail)?;
    let written = handle.write_all(&bytes).and_then(|_| handle.flush());
    handle.set_timeout(settings.read_slice).map_err(fail)?;
    written.map_err(fail)?;

    tracing::trace!("[serial:{}] wrote {} bytes", settings.port, bytes.len());
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
