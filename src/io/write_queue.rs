// src/io/write_queue.rs
//
// Ordered write intake shared by all callers of a wrapper's write methods.
//
// There are four intakes (text, line, bytes, chars). The active connection
// lifetime attaches exactly one listener to all of them; requests submitted
// while nothing is attached are dropped. Requests on the same intake reach
// the listener in submission order. Ordering across intakes is not defined.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::types::{WriteKind, WriteRequest};

/// Sender side of one attachment, tagged with the attachment token
struct Intakes {
    token: u64,
    senders: [Option<mpsc::UnboundedSender<WriteRequest>>; 4],
}

/// Write intake for one wrapper
pub struct WriteQueue {
    intakes: Mutex<Intakes>,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            intakes: Mutex::new(Intakes {
                token: 0,
                senders: [None, None, None, None],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Intakes> {
        self.intakes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a request for the active connection.
    /// Returns false when no connection is listening and the request was dropped.
    pub fn submit(&self, request: WriteRequest) -> bool {
        let kind = request.kind();
        let intakes = self.lock();
        match &intakes.senders[kind.index()] {
            Some(tx) => tx.send(request).is_ok(),
            None => {
                tracing::trace!("[write_queue] no listener for {:?} intake, dropping write", kind);
                false
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().senders.iter().any(Option::is_some)
    }

    /// Install a fresh listener on every intake, replacing any previous one.
    /// The returned token must be passed to `detach`.
    pub(crate) fn attach(&self) -> (WriteListener, u64) {
        let mut intakes = self.lock();
        intakes.token += 1;

        let mut receivers = Vec::with_capacity(4);
        for kind in WriteKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            intakes.senders[kind.index()] = Some(tx);
            receivers.push(rx);
        }

        let mut receivers = receivers.into_iter();
        let listener = WriteListener {
            text: receivers.next(),
            line: receivers.next(),
            bytes: receivers.next(),
            chars: receivers.next(),
        };
        (listener, intakes.token)
    }

    /// Remove the listener installed under `token`.
    /// A stale token (a newer lifetime has attached since) is ignored.
    pub(crate) fn detach(&self, token: u64) {
        let mut intakes = self.lock();
        if intakes.token == token {
            intakes.senders = [None, None, None, None];
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Receiving side held by the writer of one connection lifetime
pub(crate) struct WriteListener {
    text: Option<mpsc::UnboundedReceiver<WriteRequest>>,
    line: Option<mpsc::UnboundedReceiver<WriteRequest>>,
    bytes: Option<mpsc::UnboundedReceiver<WriteRequest>>,
    chars: Option<mpsc::UnboundedReceiver<WriteRequest>>,
}

async fn recv_from(rx: &mut Option<mpsc::UnboundedReceiver<WriteRequest>>) -> Option<WriteRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

impl WriteListener {
    /// Non-blocking variant of `next` for writers running on a blocking worker.
    /// Intakes are checked in a fixed order; each intake stays FIFO.
    pub(crate) fn try_next(&mut self) -> Option<WriteRequest> {
        for slot in [&mut self.text, &mut self.line, &mut self.bytes, &mut self.chars] {
            let Some(rx) = slot.as_mut() else { continue };
            match rx.try_recv() {
                Ok(req) => return Some(req),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => *slot = None,
            }
        }
        None
    }

    /// Next request from any intake. Returns `None` once the listener has been
    /// detached and every intake is drained.
    pub(crate) async fn next(&mut self) -> Option<WriteRequest> {
        loop {
            if self.text.is_none() && self.line.is_none() && self.bytes.is_none() && self.chars.is_none() {
                return None;
            }

            // A closed intake is dropped so the remaining ones keep being served
            tokio::select! {
                req = recv_from(&mut self.text), if self.text.is_some() => match req {
                    Some(req) => return Some(req),
                    None => self.text = None,
                },
                req = recv_from(&mut self.line), if self.line.is_some() => match req {
                    Some(req) => return Some(req),
                    None => self.line = None,
                },
                req = recv_from(&mut self.bytes), if self.bytes.is_some() => match req {
                    Some(req) => return Some(req),
                    None => self.bytes = None,
                },
                req = recv_from(&mut self.chars), if self.chars.is_some() => match req {
                    Some(req) => return Some(req),
                    None => self.chars = None,
                },
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
