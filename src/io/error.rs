// src/io/error.rs
//
// Typed errors for the transport wrappers. Every failure a connection lifetime
// can hit is normalised into one cloneable value so it can travel through the
// error broadcast channel and be compared by message.

use thiserror::Error;

/// Error raised by a serial or TCP wrapper.
///
/// The connection variants carry the device label (`COM3`, `10.0.0.5:23`) and
/// a human-readable message. Use `.map_err(String::from)` where a plain string
/// is wanted.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IoError {
    /// Target device or host was not found before a handle was opened
    #[error("{device}: endpoint unavailable: {message}")]
    EndpointUnavailable { device: String, message: String },

    /// Handle could not be opened or configured
    #[error("{device}: open failed: {message}")]
    Open { device: String, message: String },

    /// Asynchronous fault reported by the transport while open
    #[error("{device}: hardware error: {message}")]
    Hardware { device: String, message: String },

    /// Applying a queued write failed
    #[error("{device}: write failed: {message}")]
    Write { device: String, message: String },

    /// Draining input failed, or the peer closed the stream
    #[error("{device}: read failed: {message}")]
    Read { device: String, message: String },

    #[error("{device}: {operation} timed out")]
    Timeout { device: String, operation: String },

    /// The connection lifetime was closed before it finished opening
    #[error("{device}: port was closed")]
    Closed { device: String },

    /// The wrapper was disposed and can no longer be opened
    #[error("{device}: port has been disposed")]
    Disposed { device: String },

    #[error("no Tokio runtime is available to run the connection")]
    NoRuntime,

    #[error("configuration error: {0}")]
    Config(String),
}

impl IoError {
    pub fn endpoint_unavailable(device: &str, message: impl Into<String>) -> Self {
        Self::EndpointUnavailable {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn open(device: &str, message: impl Into<String>) -> Self {
        Self::Open {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn hardware(device: &str, message: impl Into<String>) -> Self {
        Self::Hardware {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn write(device: &str, message: impl Into<String>) -> Self {
        Self::Write {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        Self::Read {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(device: &str, operation: &str) -> Self {
        Self::Timeout {
            device: device.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn closed(device: &str) -> Self {
        Self::Closed {
            device: device.to_string(),
        }
    }

    pub fn disposed(device: &str) -> Self {
        Self::Disposed {
            device: device.to_string(),
        }
    }

    /// Device label this error refers to, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::EndpointUnavailable { device, .. }
            | Self::Open { device, .. }
            | Self::Hardware { device, .. }
            | Self::Write { device, .. }
            | Self::Read { device, .. }
            | Self::Timeout { device, .. }
            | Self::Closed { device }
            | Self::Disposed { device } => Some(device),
            Self::NoRuntime | Self::Config(_) => None,
        }
    }

    /// Whether this error ended a connection lifetime (as opposed to a usage error)
    pub fn is_connection_fault(&self) -> bool {
        !matches!(
            self,
            Self::Closed { .. } | Self::Disposed { .. } | Self::NoRuntime | Self::Config(_)
        )
    }
}

impl From<IoError> for String {
    fn from(e: IoError) -> Self {
        e.to_string()
    }
}
