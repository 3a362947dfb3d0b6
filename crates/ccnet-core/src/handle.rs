//! The out-of-band connect handle.
//!
//! A listen operation produces a [`ConnectHandle`], an opaque fixed-size blob
//! that the host library carries to the peer through its own rendezvous
//! channel. The peer feeds it to `connect` exactly once. The backend never
//! transmits the handle itself.

use std::fmt;

use crate::error::NetError;

/// On-the-wire size of a connect handle. Every handle serializes to exactly
/// this many bytes regardless of how much of it the transport uses.
pub const MAX_HANDLE_SIZE: usize = 128;

/// Bytes available for the transport's address payload: the total blob minus
/// the 2-byte length prefix.
pub const HANDLE_PAYLOAD_CAPACITY: usize = MAX_HANDLE_SIZE - 2;

/// An opaque out-of-band address blob.
///
/// Layout inside the fixed blob: a little-endian `u16` payload length,
/// followed by the payload, followed by zero padding up to
/// [`MAX_HANDLE_SIZE`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectHandle {
    len: u16,
    payload: [u8; HANDLE_PAYLOAD_CAPACITY],
}

impl ConnectHandle {
    /// Wrap a transport address payload. Fails if the payload does not fit
    /// in the fixed blob.
    pub fn new(payload: &[u8]) -> Result<Self, NetError> {
        if payload.len() > HANDLE_PAYLOAD_CAPACITY {
            return Err(NetError::HandleTooLarge {
                size: payload.len(),
                max: HANDLE_PAYLOAD_CAPACITY,
            });
        }
        let mut buf = [0u8; HANDLE_PAYLOAD_CAPACITY];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            len: payload.len() as u16,
            payload: buf,
        })
    }

    /// The transport's address payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    /// Serialize to the fixed 128-byte blob for the host's side channel.
    pub fn to_bytes(&self) -> [u8; MAX_HANDLE_SIZE] {
        let mut out = [0u8; MAX_HANDLE_SIZE];
        out[..2].copy_from_slice(&self.len.to_le_bytes());
        out[2..2 + self.len as usize].copy_from_slice(self.payload());
        out
    }

    /// Parse a blob received through the side channel, validating the
    /// embedded length field.
    pub fn from_bytes(raw: &[u8; MAX_HANDLE_SIZE]) -> Result<Self, NetError> {
        let len = u16::from_le_bytes([raw[0], raw[1]]);
        if len as usize > HANDLE_PAYLOAD_CAPACITY {
            return Err(NetError::HandleTooLarge {
                size: len as usize,
                max: HANDLE_PAYLOAD_CAPACITY,
            });
        }
        let mut payload = [0u8; HANDLE_PAYLOAD_CAPACITY];
        payload[..len as usize].copy_from_slice(&raw[2..2 + len as usize]);
        Ok(Self { len, payload })
    }
}

impl fmt::Debug for ConnectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The payload is opaque; show only its length.
        f.debug_struct("ConnectHandle")
            .field("len", &self.len)
            .finish()
    }
}
