//! Length-prefixed JSON framing used when the backend runs as a native
//! messaging host: every frame is a little-endian `u32` byte count followed
//! by that many bytes of UTF-8 JSON.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Upper bound on the buffer reserved up front for a declared payload; larger
/// payloads still decode, the buffer just grows as bytes arrive.
const MAX_PREALLOC: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message of {0} bytes does not fit a 32-bit length prefix")]
    TooLarge(usize),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Incremental decoder for length-prefixed JSON messages.
///
/// Bytes may be pushed in arbitrary chunks; the delivered message sequence
/// does not depend on where the chunk boundaries fall.
#[derive(Debug, Default)]
pub struct MessageFramer {
    prefix: Vec<u8>,
    expected: Option<usize>,
    payload: Vec<u8>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `bytes`, calling `on_message` once per complete, well-formed
    /// message. Returns the number of messages delivered.
    pub fn push<F>(&mut self, mut bytes: &[u8], mut on_message: F) -> usize
    where
        F: FnMut(Value),
    {
        let mut delivered = 0;

        while !bytes.is_empty() {
            match self.expected {
                None => {
                    let take = (LENGTH_PREFIX_LEN - self.prefix.len()).min(bytes.len());
                    self.prefix.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if self.prefix.len() == LENGTH_PREFIX_LEN {
                        let mut raw = [0u8; LENGTH_PREFIX_LEN];
                        raw.copy_from_slice(&self.prefix);
                        self.prefix.clear();

                        let len = u32::from_le_bytes(raw) as usize;
                        self.expected = Some(len);
                        self.payload.reserve(len.min(MAX_PREALLOC));

                        if len == 0 && self.finish(&mut on_message) {
                            delivered += 1;
                        }
                    }
                }
                Some(len) => {
                    let take = (len - self.payload.len()).min(bytes.len());
                    self.payload.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if self.payload.len() == len && self.finish(&mut on_message) {
                        delivered += 1;
                    }
                }
            }
        }

        delivered
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.prefix.is_empty() && self.expected.is_none()
    }

    fn finish<F>(&mut self, on_message: &mut F) -> bool
    where
        F: FnMut(Value),
    {
        self.expected = None;
        let payload = std::mem::take(&mut self.payload);

        match serde_json::from_slice::<Value>(&payload) {
            Ok(message) => {
                on_message(message);
                true
            }
            Err(err) => {
                warn!(len = payload.len(), "dropping malformed frame: {err}");
                false
            }
        }
    }
}

pub fn encode_frame(message: &Value) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}
