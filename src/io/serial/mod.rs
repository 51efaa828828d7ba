// src/io/serial/mod.rs
//
// Serial port transport.
//
// - backend:    device enumeration and open, over the serialport crate
// - enumerator: shared poller for device names
// - port:       SerialPortRx, the self-healing port

mod backend;
mod enumerator;
mod port;
mod utils;

pub use backend::{list_ports, SerialBackend, SerialHandle, SerialPortInfo, SystemSerialBackend};
pub use enumerator::{PortEnumerator, NO_PORTS};
pub use port::SerialPortRx;
pub use utils::{Handshake, Parity};
