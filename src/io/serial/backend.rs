// src/io/serial/backend.rs
//
// Boundary to the operating system's serial devices.
//
// `SerialBackend` enumerates and opens devices; `SerialHandle` is one open
// device. The wrapper only talks to these traits so tests can run against an
// in-memory port. `SystemSerialBackend` is the real implementation over the
// serialport crate.

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::Serialize;

use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits,
};
use crate::config::SerialConfig;

// ============================================================================
// Traits
// ============================================================================

pub trait SerialBackend: Send + Sync + 'static {
    /// Names of the devices currently present, in the order the OS reports them
    fn list_port_names(&self) -> io::Result<Vec<String>>;

    /// Open a device with the line settings in `config`
    fn open(&self, config: &SerialConfig) -> io::Result<Box<dyn SerialHandle>>;
}

/// One open serial device. Dropping it closes the device.
pub trait SerialHandle: Send {
    /// Bound for the next blocking read or write
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drop anything pending in the driver's input and output buffers
    fn discard_buffers(&mut self) -> io::Result<()>;

    /// Read available bytes. `TimedOut` means nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Take the next asynchronous line fault (framing, parity, overrun) if the
    /// driver reports one
    fn poll_error_event(&mut self) -> Option<String> {
        None
    }
}

// ============================================================================
// System Backend
// ============================================================================

/// Serial devices of the host, through the serialport crate
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSerialBackend;

impl SerialBackend for SystemSerialBackend {
    fn list_port_names(&self) -> io::Result<Vec<String>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        Ok(ports
            .into_iter()
            .filter(|p| is_listed(&p.port_name))
            .map(|p| p.port_name)
            .collect())
    }

    fn open(&self, config: &SerialConfig) -> io::Result<Box<dyn SerialHandle>> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(to_serialport_data_bits(config.data_bits))
            .stop_bits(to_serialport_stop_bits(config.stop_bits))
            .parity(to_serialport_parity(config.parity))
            .flow_control(to_serialport_flow_control(config.handshake))
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(SystemHandle { port }))
    }
}

/// Handle on a host device. `serialport` reports no line-error events, so
/// `poll_error_event` keeps its default and faults surface as read errors.
struct SystemHandle {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialHandle for SystemHandle {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// On macOS only the /dev/cu.* (calling unit) devices are listed. The
/// /dev/tty.* twins block on open waiting for carrier detect.
fn is_listed(_port_name: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        !_port_name.starts_with("/dev/tty.")
    }
    #[cfg(not(target_os = "macos"))]
    {
        true
    }
}

// ============================================================================
// Port Details
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List the host's serial ports with USB details where available
pub fn list_ports() -> io::Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;

    Ok(ports
        .into_iter()
        .filter(|p| is_listed(&p.port_name))
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}
