// src/io/serial/utils.rs
//
// Line-setting types for serial configuration and their mapping onto the
// serialport crate.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity as SpParity, StopBits};

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow-control handshake
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handshake {
    #[default]
    None,
    XOnXOff,
    RequestToSend,
    /// RTS/CTS plus XON/XOFF. The serialport crate offers one of the two, so
    /// hardware flow control wins.
    RequestToSendXOnXOff,
}

// ============================================================================
// Conversion Functions
// ============================================================================

pub(crate) fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

pub(crate) fn to_serialport_flow_control(h: Handshake) -> FlowControl {
    match h {
        Handshake::None => FlowControl::None,
        Handshake::XOnXOff => FlowControl::Software,
        Handshake::RequestToSend | Handshake::RequestToSendXOnXOff => FlowControl::Hardware,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub(crate) fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits count to serialport crate's StopBits type
pub(crate) fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

// ============================================================================
// Tests
// ============================================================================
