//! The transport SPI.
//!
//! A concrete transport (sockets, verbs, an in-process pipe) plugs into the
//! backend by implementing these traits. The transfer engine speaks only
//! this interface; it never sees wire bytes or hardware descriptors. All
//! methods are non-blocking: anything that would wait returns
//! [`Progress::Pending`] and is polled again by the host.

use std::fmt;

use bytes::Bytes;

use crate::device::{DeviceProps, OffloadKind};
use crate::error::NetError;
use crate::handle::ConnectHandle;
use crate::poll::Progress;

/// One tagged message crossing a connection.
///
/// The tag disambiguates logical streams multiplexed on a single channel and
/// must be matched exactly by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u32, payload: Bytes) -> Self {
        Self { tag, payload }
    }
}

/// Opaque capability object for a hardware-offloaded data path negotiated
/// during the handshake. Higher layers may use it to bypass the transfer
/// engine entirely; its absence is never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadHandle {
    pub kind: OffloadKind,
    pub version: u32,
}

/// The product of a completed handshake: a bidirectional channel plus the
/// optional offload descriptor.
pub struct Accepted {
    pub channel: Box<dyn Channel>,
    pub offload: Option<OffloadHandle>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("offload", &self.offload)
            .finish_non_exhaustive()
    }
}

/// A transport backend factory.
///
/// One implementation exists per supported physical transport. The engine
/// owns exactly one and drives every connection through it.
pub trait Transport: Send + Sync + 'static {
    /// The devices this transport exposes. Called once at initialization.
    fn devices(&self) -> Vec<DeviceProps>;

    /// Start listening on a device, producing the out-of-band handle for the
    /// host's rendezvous and a pollable accept context.
    ///
    /// On error nothing is left allocated.
    fn listen(&self, device: usize) -> Result<(ConnectHandle, Box<dyn Listening>), NetError>;

    /// Begin a connection attempt toward the peer identified by `handle`.
    ///
    /// The returned [`Connecting`] owns all resources of the attempt; the
    /// engine polls it and drops it on failure, so a failed attempt leaves
    /// nothing behind.
    fn open(&self, device: usize, handle: &ConnectHandle) -> Result<Box<dyn Connecting>, NetError>;
}

/// Passive side of the handshake.
pub trait Listening: Send {
    /// Poll for a peer that has completed the handshake.
    ///
    /// Returns `Pending` while no peer is ready; this is the normal polling
    /// outcome, not an error.
    fn poll_accept(&mut self) -> Result<Progress<Accepted>, NetError>;

    /// Tear down the listening endpoint. Idempotent.
    fn close(&mut self);
}

/// Active side of the handshake. Repeated polls resume the same underlying
/// attempt; they never allocate a second one.
pub trait Connecting: Send {
    fn poll_connect(&mut self) -> Result<Progress<Accepted>, NetError>;
}

impl fmt::Debug for dyn Connecting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connecting")
    }
}

/// An established bidirectional channel.
///
/// Channels carry whole frames; ordering of frames is transport-defined and
/// the engine does not rely on it.
pub trait Channel: Send {
    /// Offer a frame to the transport.
    ///
    /// Returns `Ok(None)` when the transport took ownership of the frame, or
    /// `Ok(Some(frame))` handing it back when the transport cannot take it
    /// yet (the engine retries on a later poll).
    fn try_send(&mut self, frame: Frame) -> Result<Option<Frame>, NetError>;

    /// Pull the next available frame, if any.
    ///
    /// `Ok(None)` means nothing is available right now. A closed peer is
    /// reported as [`NetError::ChannelClosed`] once all delivered frames
    /// have been drained.
    fn try_recv(&mut self) -> Result<Option<Frame>, NetError>;

    /// Close this side of the channel. Idempotent.
    fn close(&mut self);

    /// Whether this side has been closed locally.
    fn is_closed(&self) -> bool;
}
