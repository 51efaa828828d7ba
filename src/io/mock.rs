// src/io/mock.rs
//
// In-memory serial backend for tests. Ports, inbound data and faults are
// driven from the test through a shared state.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::SerialConfig;
use crate::io::serial::{SerialBackend, SerialHandle};

#[derive(Default)]
struct MockState {
    ports: Vec<String>,
    list_fault: Option<String>,
    open_fault: Option<String>,
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    pending_fault: Option<String>,
    write_fault: Option<String>,
    disconnect: bool,
    open_count: usize,
    open_handles: usize,
    last_config: Option<SerialConfig>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub(crate) fn with_ports(ports: &[&str]) -> Self {
        let backend = Self::default();
        backend.set_ports(ports);
        backend
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_ports(&self, ports: &[&str]) {
        self.state().ports = ports.iter().map(|p| p.to_string()).collect();
    }

    pub(crate) fn fail_listing(&self, message: Option<&str>) {
        self.state().list_fault = message.map(str::to_string);
    }

    pub(crate) fn fail_open(&self, message: Option<&str>) {
        self.state().open_fault = message.map(str::to_string);
    }

    /// Bytes the device will deliver to the next reads
    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes.iter().copied());
    }

    /// Raise a line fault on the open handle
    pub(crate) fn inject_fault(&self, message: &str) {
        self.state().pending_fault = Some(message.to_string());
    }

    pub(crate) fn fail_next_write(&self, message: &str) {
        self.state().write_fault = Some(message.to_string());
    }

    /// Make the next read report end of stream
    pub(crate) fn disconnect(&self) {
        self.state().disconnect = true;
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    pub(crate) fn last_config(&self) -> Option<SerialConfig> {
        self.state().last_config.clone()
    }
}

impl SerialBackend for MockBackend {
    fn list_port_names(&self) -> io::Result<Vec<String>> {
        let state = self.state();
        match &state.list_fault {
            Some(message) => Err(io::Error::other(message.clone())),
            None => Ok(state.ports.clone()),
        }
    }

    fn open(&self, config: &SerialConfig) -> io::Result<Box<dyn SerialHandle>> {
        let mut state = self.state();
        if !state.ports.contains(&config.port_name) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        if let Some(message) = &state.open_fault {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, message.clone()));
        }
        state.open_count += 1;
        state.open_handles += 1;
        state.last_config = Some(config.clone());
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
            timeout: Duration::from_millis(5),
        }))
    }
}

struct MockHandle {
    state: Arc<Mutex<MockState>>,
    timeout: Duration,
}

impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl SerialHandle for MockHandle {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.state().inbound.clear();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state();
            if std::mem::take(&mut state.disconnect) {
                return Ok(0);
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(self.timeout.min(Duration::from_millis(5)));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if let Some(message) = state.write_fault.take() {
            return Err(io::Error::other(message));
        }
        state.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn poll_error_event(&mut self) -> Option<String> {
        self.state().pending_fault.take()
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.open_handles -= 1;
        }
    }
}
