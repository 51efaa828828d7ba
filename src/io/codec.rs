// src/io/codec.rs
//
// Text codec for the transport wrappers.
//
// Inbound serial bytes are published as characters and outbound text/char
// writes are turned into bytes here. The wrappers never frame or parse
// payloads; the codec only maps between characters and bytes.
//
// - Ascii:  one byte per char, code points above 0x7F become '?'
// - Latin1: one byte per char, code points above 0xFF become '?'
// - Utf8:   lossless, decoding keeps partial sequences across reads

use serde::{Deserialize, Serialize};

use super::types::WriteRequest;

/// Replacement used when a character cannot be represented in a single-byte encoding
const REPLACEMENT_BYTE: u8 = b'?';

// ============================================================================
// Encoding
// ============================================================================

/// Character encoding applied to text payloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Ascii,
    Latin1,
    Utf8,
}

impl Encoding {
    /// Encode a string for transmission
    pub fn encode_str(&self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            _ => text.chars().map(|c| self.encode_single(c)).collect(),
        }
    }

    /// Encode a character slice for transmission
    pub fn encode_chars(&self, chars: &[char]) -> Vec<u8> {
        match self {
            Encoding::Utf8 => chars.iter().collect::<String>().into_bytes(),
            _ => chars.iter().map(|&c| self.encode_single(c)).collect(),
        }
    }

    fn encode_single(&self, c: char) -> u8 {
        let limit = match self {
            Encoding::Ascii => 0x7F,
            Encoding::Latin1 | Encoding::Utf8 => 0xFF,
        };
        if (c as u32) <= limit {
            c as u8
        } else {
            REPLACEMENT_BYTE
        }
    }

    /// Create a streaming decoder for inbound bytes
    pub fn decoder(&self) -> CharDecoder {
        CharDecoder {
            encoding: *self,
            pending: Vec::new(),
        }
    }
}

// ============================================================================
// Streaming Decoder
// ============================================================================

/// Incremental byte-to-char decoder.
///
/// Reads from a transport can split a multi-byte UTF-8 sequence; the
/// incomplete tail is held until the next `decode` call.
#[derive(Debug)]
pub struct CharDecoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl CharDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<char> {
        match self.encoding {
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { REPLACEMENT_BYTE as char })
                .collect(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Utf8 => self.decode_utf8(bytes),
        }
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> Vec<char> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::with_capacity(self.pending.len());
        let mut start = 0;

        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.extend(s.chars());
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&self.pending[start..start + valid]) {
                        out.extend(s.chars());
                    }
                    start += valid;
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += bad;
                        }
                        // Incomplete sequence at the end, wait for more input
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Bytes held back waiting for the rest of a UTF-8 sequence
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Write Request Encoding
// ============================================================================

/// Turn a queued write into the exact bytes handed to the transport.
///
/// Range variants are validated here, when the request is applied, so an
/// out-of-range request surfaces as a write failure of the active connection.
pub fn encode_request(
    request: &WriteRequest,
    encoding: Encoding,
    new_line: &str,
) -> Result<Vec<u8>, String> {
    match request {
        WriteRequest::Text(text) => Ok(encoding.encode_str(text)),
        WriteRequest::Line(text) => {
            let mut bytes = encoding.encode_str(text);
            bytes.extend(encoding.encode_str(new_line));
            Ok(bytes)
        }
        WriteRequest::Bytes { buf, offset, count } => {
            let range = checked_range(buf.len(), *offset, *count)?;
            Ok(buf[range].to_vec())
        }
        WriteRequest::Chars { buf, offset, count } => {
            let range = checked_range(buf.len(), *offset, *count)?;
            Ok(encoding.encode_chars(&buf[range]))
        }
    }
}

fn checked_range(len: usize, offset: usize, count: usize) -> Result<std::ops::Range<usize>, String> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(format!(
            "offset {} and count {} exceed buffer length {}",
            offset, count, len
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
