//! Self-healing serial port and TCP client streams.
//!
//! [`SerialPortRx`] keeps a serial device open, reconnecting on its own after
//! any failure. [`TcpClientRx`] offers the same surface for a TCP connection
//! but leaves reconnecting to the caller. Both publish inbound data to any
//! number of observers and accept writes through a queue.

pub mod config;
pub mod io;
pub mod logging;

pub use config::{load_config, parse_config, LogConfig, PortsConfig, SerialConfig, TcpConfig};
pub use io::serial::{Handshake, Parity, PortEnumerator, NO_PORTS};
pub use io::{
    list_ports, Encoding, IoError, LinkStatus, OpenTicket, PortRx, SerialPortInfo, SerialPortRx,
    Subscription, TcpClientRx, WriteRequest,
};
pub use logging::init_logging;
