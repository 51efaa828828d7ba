// src/io/tcp.rs
//
// TCP client with the same surface as the serial port.
//
// One `open()` makes one connection attempt. When the connection fails or
// the peer closes it, the error is published and the lifetime ends; the
// caller decides whether to open again. Inbound bytes are published one by
// one on the data channel and as whole read chunks on `bytes_received`.
//
// The stream is split into owned halves. Reading and writing run in the
// connection task itself, so closing cancels both without leaving a worker
// behind.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::watch;

use crate::config::TcpConfig;
use crate::io::broadcast::{Broadcast, ErrorChannel, Subscription, DEFAULT_CAPACITY};
use crate::io::codec::{encode_request, Encoding};
use crate::io::error::IoError;
use crate::io::lifecycle::{supervise, AttemptGuard, Lifecycle, LifetimeCtx, OpenTicket, RetryPolicy};
use crate::io::types::{LinkStatus, WriteRequest};
use crate::io::write_queue::{WriteListener, WriteQueue};
use crate::io::PortRx;

struct TcpShared {
    data: Broadcast<u8>,
    chunks: Broadcast<Vec<u8>>,
    errors: Arc<ErrorChannel>,
    writes: WriteQueue,
}

/// TCP client connection with multicast receive and queued writes
pub struct TcpClientRx {
    config: Mutex<TcpConfig>,
    /// Already-connected stream handed in by the caller, used by the next open
    prebound: Mutex<Option<std::net::TcpStream>>,
    shared: Arc<TcpShared>,
    lifecycle: Lifecycle,
}

impl TcpClientRx {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config: Mutex::new(config),
            prebound: Mutex::new(None),
            shared: Arc::new(TcpShared {
                data: Broadcast::new(DEFAULT_CAPACITY),
                chunks: Broadcast::new(256),
                errors: Arc::new(ErrorChannel::default()),
                writes: WriteQueue::new(),
            }),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn connect_to(host: &str, port: u16) -> Self {
        Self::new(TcpConfig::new(host, port))
    }

    /// Wrap a stream that is already connected. The next `open()` adopts it;
    /// later opens reconnect to the same peer.
    pub fn from_stream(stream: std::net::TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        let client = Self::new(TcpConfig::new(&peer.ip().to_string(), peer.port()));
        *client.prebound.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        Ok(client)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> TcpConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration. A live connection is not affected.
    pub fn set_config(&self, config: TcpConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn set_remote(&self, host: &str, port: u16) {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        config.host = host.to_string();
        config.port = port;
    }

    /// Whether a connection lifetime is running, connected or not
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn open_state(&self) -> watch::Receiver<bool> {
        self.lifecycle.open_state()
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.lifecycle.status()
    }

    /// Every read as one chunk
    pub fn bytes_received(&self) -> Subscription<Vec<u8>> {
        self.shared.chunks.subscribe()
    }
}

impl PortRx for TcpClientRx {
    type Item = u8;

    fn open(&self) -> Result<OpenTicket, IoError> {
        let config = self.config();
        let device = config.label();
        let shared = self.shared.clone();
        let errors = shared.errors.clone();

        self.lifecycle.open(&device, |ctx| {
            // Only reached when a new lifetime starts
            let prebound = self
                .prebound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            tracing::info!("[tcp:{}] connecting", ctx.device());

            let mut prebound = prebound;
            supervise(ctx, RetryPolicy::Never, errors, move |ctx| {
                run_attempt(shared.clone(), config.clone(), prebound.take(), ctx)
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

    fn data_received(&self) -> Subscription<u8> {
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

async fn run_attempt(
    shared: Arc<TcpShared>,
    config: TcpConfig,
    prebound: Option<std::net::TcpStream>,
    ctx: LifetimeCtx,
) -> Result<(), IoError> {
    let device = config.label();

    let stream = match prebound {
        Some(stream) => TcpStream::from_std(stream).map_err(|e| IoError::open(&device, e.to_string()))?,
        None => connect(&config, &device).await?,
    };
    if config.nodelay {
        stream
            .set_nodelay(true)
            .map_err(|e| IoError::open(&device, e.to_string()))?;
    }
    let (mut reader, mut writer) = stream.into_split();

    let mut guard = AttemptGuard::new(&ctx, &shared.writes);
    let mut writes = guard.attach_writes();
    if !ctx.mark_open() {
        return Ok(());
    }
    tracing::info!("[tcp:{}] connected", device);

    tokio::select! {
        result = read_loop(&mut reader, &shared, &config, &device, &ctx) => result,
        result = write_loop(&mut writer, &mut writes, &config, &device) => result,
    }
}

async fn connect(config: &TcpConfig, device: &str) -> Result<TcpStream, IoError> {
    let local: Option<SocketAddr> = match config.local_addr.as_deref() {
        Some(addr) => Some(
            addr.parse()
                .map_err(|e| IoError::Config(format!("invalid local address {}: {}", addr, e)))?,
        ),
        None => None,
    };

    let addrs: Vec<SocketAddr> = lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| IoError::endpoint_unavailable(device, e.to_string()))?
        .collect();

    let mut last_error = IoError::endpoint_unavailable(device, "host did not resolve to an address");
    for addr in addrs {
        let attempt = async {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(local) = local {
                socket.bind(local)?;
            }
            socket.connect(addr).await
        };

        match tokio::time::timeout(config.connect_timeout(), attempt).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                tracing::debug!("[tcp:{}] connect to {} failed: {}", device, addr, e);
                last_error = classify_connect_error(device, e);
            }
            Err(_) => last_error = IoError::timeout(device, "connect"),
        }
    }
    Err(last_error)
}

fn classify_connect_error(device: &str, e: std::io::Error) -> IoError {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::NotFound
        | std::io::ErrorKind::AddrNotAvailable => IoError::endpoint_unavailable(device, e.to_string()),
        _ => IoError::open(device, e.to_string()),
    }
}

/// Publish everything the peer sends. Only returns on failure.
async fn read_loop(
    reader: &mut OwnedReadHalf,
    shared: &TcpShared,
    config: &TcpConfig,
    device: &str,
    ctx: &LifetimeCtx,
) -> Result<(), IoError> {
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    loop {
        let read = match config.read_timeout() {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                .await
                .map_err(|_| IoError::timeout(device, "read"))?,
            None => reader.read(&mut buf).await,
        };
        let n = read.map_err(|e| IoError::read(device, e.to_string()))?;
        if n == 0 {
            return Err(IoError::read(device, "connection closed by peer"));
        }
        // Data read after close is not published
        if ctx.is_stopped() {
            return Ok(());
        }

        let chunk = buf[..n].to_vec();
        for &byte in &chunk {
            shared.data.publish(byte);
        }
        shared.chunks.publish(chunk);
    }
}

/// Apply queued writes in order. Only returns on failure.
async fn write_loop(
    writer: &mut OwnedWriteHalf,
    writes: &mut WriteListener,
    config: &TcpConfig,
    device: &str,
) -> Result<(), IoError> {
    while let Some(request) = writes.next().await {
        let bytes = encode_request(&request, Encoding::Utf8, &config.new_line)
            .map_err(|e| IoError::write(device, e))?;
        if bytes.is_empty() {
            continue;
        }

        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        let written = match config.write_timeout() {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| IoError::timeout(device, "write"))?,
            None => write.await,
        };
        written.map_err(|e| IoError::write(device, e.to_string()))?;
        tracing::trace!("[tcp:{}] wrote {} bytes", device, bytes.len());
    }

    // The listener only ends when the attempt is torn down
    std::future::pending().await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(3);

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap().0
    }

    async fn collect_bytes(sub: &mut Subscription<u8>, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < count {
            out.push(tokio::time::timeout(WAIT, sub.recv()).await.unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_inbound_bytes_are_published() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);
        let mut data = client.data_received();
        let mut chunks = client.bytes_received();

        client.open_and_wait(WAIT).await.unwrap();
        let mut server = accept(&listener).await;
        assert!(client.is_open());

        server.write_all(b"hello").await.unwrap();
        assert_eq!(collect_bytes(&mut data, 5).await, b"hello".to_vec());

        let mut joined = Vec::new();
        while joined.len() < 5 {
            joined.extend(tokio::time::timeout(WAIT, chunks.recv()).await.unwrap().unwrap());
        }
        assert_eq!(joined, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_write_line_uses_crlf() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);
        client.open_and_wait(WAIT).await.unwrap();
        let mut server = accept(&listener).await;

        assert!(client.write_line("PING"));
        assert!(client.write_bytes_range(b"xyz", 1, 1));

        let mut buf = [0u8; 7];
        tokio::time::timeout(WAIT, server.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"PING\r\ny");
    }

    #[tokio::test]
    async fn test_peer_close_ends_attempt_without_restart() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);
        let mut errors = client.errors();
        let mut open = client.open_state();

        client.open_and_wait(WAIT).await.unwrap();
        let server = accept(&listener).await;
        drop(server);

        let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(err, IoError::read(&format!("127.0.0.1:{}", port), "connection closed by peer"));
        tokio::time::timeout(WAIT, open.wait_for(|o| !*o)).await.unwrap().unwrap();

        // No implicit reconnect
        assert!(tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err());

        // An explicit open connects again
        client.open_and_wait(WAIT).await.unwrap();
        let _server = accept(&listener).await;
        assert!(client.is_open());
        assert_eq!(client.status().borrow().generation, 2);
    }

    #[tokio::test]
    async fn test_refused_connection_is_endpoint_unavailable() {
        let (listener, port) = listener().await;
        drop(listener);

        let client = TcpClientRx::connect_to("127.0.0.1", port);
        let err = client.open_and_wait(WAIT).await.unwrap_err();
        assert!(matches!(err, IoError::EndpointUnavailable { .. }), "{err:?}");
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_redundant_open_makes_one_connection() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);

        for _ in 0..3 {
            client.open_and_wait(WAIT).await.unwrap();
        }
        let _server = accept(&listener).await;
        assert!(tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_stops_inbound_data() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);
        let mut data = client.data_received();

        client.open_and_wait(WAIT).await.unwrap();
        let mut server = accept(&listener).await;
        client.close();
        assert!(!client.is_open());

        let _ = server.write_all(b"late").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(data.try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_under_steady_inbound_stops_publishing() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);
        let mut data = client.data_received();

        client.open_and_wait(WAIT).await.unwrap();
        let mut server = accept(&listener).await;
        let feeder = tokio::spawn(async move {
            while server.write_all(b"x").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        collect_bytes(&mut data, 10).await;

        client.close();
        data.drain();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(data.try_recv().is_none());
        feeder.abort();
    }

    #[tokio::test]
    async fn test_stalled_peer_surfaces_write_timeout() {
        let (listener, port) = listener().await;
        let mut config = TcpConfig::new("127.0.0.1", port);
        config.write_timeout_ms = Some(100);
        let client = TcpClientRx::new(config);
        let mut errors = client.errors();
        let mut open = client.open_state();

        client.open_and_wait(WAIT).await.unwrap();
        // Accepted but never read, so the socket buffers fill up
        let _server = accept(&listener).await;

        assert!(client.write_bytes(&vec![0u8; 32 * 1024 * 1024]));
        let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(err, IoError::timeout(&format!("127.0.0.1:{}", port), "write"));
        tokio::time::timeout(WAIT, open.wait_for(|o| !*o)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_write_ends_connection() {
        let (listener, port) = listener().await;
        let client = TcpClientRx::connect_to("127.0.0.1", port);
        let mut errors = client.errors();
        let mut open = client.open_state();

        client.open_and_wait(WAIT).await.unwrap();
        let _server = accept(&listener).await;

        assert!(client.write_chars_range(&['a', 'b'], 1, 5));
        let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert!(matches!(err, IoError::Write { .. }), "{err:?}");
        tokio::time::timeout(WAIT, open.wait_for(|o| !*o)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_fails_attempt() {
        let (listener, port) = listener().await;
        let mut config = TcpConfig::new("127.0.0.1", port);
        config.read_timeout_ms = Some(50);
        let client = TcpClientRx::new(config);
        let mut errors = client.errors();

        client.open_and_wait(WAIT).await.unwrap();
        let _server = accept(&listener).await;

        let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert!(matches!(err, IoError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_from_stream_adopts_connection() {
        let (listener, port) = listener().await;
        let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut server = accept(&listener).await;

        let client = TcpClientRx::from_stream(stream).unwrap();
        assert_eq!(client.config().port, port);
        let mut data = client.data_received();
        client.open_and_wait(WAIT).await.unwrap();

        server.write_all(b"hi").await.unwrap();
        assert_eq!(collect_bytes(&mut data, 2).await, b"hi".to_vec());

        // No second connection was made
        assert!(tokio::time::timeout(Duration::from_millis(100), listener.accept())
            .await
            .is_err());
    }
}
