// src/io/mod.rs
//
// Self-healing transport wrappers for serial ports and TCP clients.
// Both wrappers share the same surface: open/close/dispose, a multicast data
// channel, a deduplicated error channel and four queued write entry points.

// Core modules
pub mod broadcast;
pub mod codec;
pub mod error;
pub(crate) mod lifecycle;
pub mod types;
pub mod write_queue;

// Transports
pub mod serial;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

pub use broadcast::{Broadcast, ErrorChannel, Subscription};
pub use codec::Encoding;
pub use error::IoError;
pub use lifecycle::OpenTicket;
pub use serial::{list_ports, SerialBackend, SerialHandle, SerialPortInfo, SerialPortRx};
pub use tcp::TcpClientRx;
pub use types::{LinkStatus, WriteKind, WriteRequest};

use std::time::Duration;

use async_trait::async_trait;

/// Common surface of the transport wrappers.
///
/// `open()` returns immediately; the connection is made on a background task.
/// Writes submitted while nothing is connected are dropped and the write
/// helpers return false for them.
#[async_trait]
pub trait PortRx: Send + Sync {
    /// Unit published on the data channel
    type Item: Clone + Send + 'static;

    /// Start a connection lifetime unless one is already running
    fn open(&self) -> Result<OpenTicket, IoError>;

    /// Release the active connection; the open flag is false on return
    fn close(&self);

    /// Close and refuse later opens
    fn dispose(&self);

    fn is_open(&self) -> bool;

    /// Inbound data from now on
    fn data_received(&self) -> Subscription<Self::Item>;

    /// Connection errors from now on
    fn errors(&self) -> Subscription<IoError>;

    /// Queue a write for the active connection
    fn submit(&self, request: WriteRequest) -> bool;

    fn write(&self, text: &str) -> bool {
        self.submit(WriteRequest::Text(text.to_string()))
    }

    /// Text followed by the configured newline
    fn write_line(&self, text: &str) -> bool {
        self.submit(WriteRequest::Line(text.to_string()))
    }

    fn write_bytes(&self, bytes: &[u8]) -> bool {
        self.write_bytes_range(bytes, 0, bytes.len())
    }

    /// `bytes[offset..offset + count]`. The range is checked when the write is
    /// applied; an invalid range fails the connection like any write error.
    fn write_bytes_range(&self, bytes: &[u8], offset: usize, count: usize) -> bool {
        self.submit(WriteRequest::Bytes {
            buf: bytes.to_vec(),
            offset,
            count,
        })
    }

    fn write_chars(&self, chars: &[char]) -> bool {
        self.write_chars_range(chars, 0, chars.len())
    }

    fn write_chars_range(&self, chars: &[char], offset: usize, count: usize) -> bool {
        self.submit(WriteRequest::Chars {
            buf: chars.to_vec(),
            offset,
            count,
        })
    }

    /// Open and wait until the first attempt has connected or failed
    async fn open_and_wait(&self, limit: Duration) -> Result<(), IoError> {
        self.open()?.established_within(limit).await
    }
}
