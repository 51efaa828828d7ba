// src/io/types.rs
//
// Shared types for the transport wrappers.
// Used by the write queue, the connection supervisor and both transports.

use super::error::IoError;

// ============================================================================
// Write Requests
// ============================================================================

/// Which write intake a request belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Text,
    Line,
    Bytes,
    Chars,
}

impl WriteKind {
    pub const ALL: [WriteKind; 4] = [WriteKind::Text, WriteKind::Line, WriteKind::Bytes, WriteKind::Chars];

    pub(crate) fn index(self) -> usize {
        match self {
            WriteKind::Text => 0,
            WriteKind::Line => 1,
            WriteKind::Bytes => 2,
            WriteKind::Chars => 3,
        }
    }
}

/// Outbound payload queued for the active connection.
/// Each variant owns its buffer; range variants are applied as `buf[offset..offset + count]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteRequest {
    /// Text written as-is
    Text(String),
    /// Text followed by the transport's newline
    Line(String),
    Bytes {
        buf: Vec<u8>,
        offset: usize,
        count: usize,
    },
    Chars {
        buf: Vec<char>,
        offset: usize,
        count: usize,
    },
}

impl WriteRequest {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteRequest::Text(_) => WriteKind::Text,
            WriteRequest::Line(_) => WriteKind::Line,
            WriteRequest::Bytes { .. } => WriteKind::Bytes,
            WriteRequest::Chars { .. } => WriteKind::Chars,
        }
    }
}

// ============================================================================
// Link Status
// ============================================================================

/// Life-cycle counters published by a wrapper after every attempt.
///
/// `generation` counts handles opened successfully and `failures` counts
/// attempts that ended in an error, both over the wrapper's whole life.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkStatus {
    pub generation: u64,
    pub failures: u64,
    pub last_error: Option<IoError>,
}

/// What an attempt ended with, from the point of view of an `OpenTicket`
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AttemptOutcome {
    Pending,
    Opened,
    Failed(IoError),
}

impl LinkStatus {
    /// Compare against an earlier snapshot to see whether an attempt has resolved
    pub(crate) fn outcome_since(&self, earlier: &LinkStatus) -> AttemptOutcome {
        if self.generation > earlier.generation {
            AttemptOutcome::Opened
        } else if self.failures > earlier.failures {
            match &self.last_error {
                Some(e) => AttemptOutcome::Failed(e.clone()),
                None => AttemptOutcome::Pending,
            }
        } else {
            AttemptOutcome::Pending
        }
    }
}
