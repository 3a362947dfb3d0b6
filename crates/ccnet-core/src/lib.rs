//! Pluggable network backend for collective communication.
//!
//! The backend moves tagged messages between registered memory regions over
//! point-to-point connections. A host library drives it through a small,
//! strictly non-blocking surface: initialize once, list devices, rendezvous
//! through an opaque out-of-band handle, then issue sends, receive groups,
//! and flushes and poll them to completion.
//!
//! Concrete transports plug in through the [`transport`] SPI; see the
//! `ccnet-loopback` crate for the in-process reference transport.

pub mod config;
pub mod conn;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod handle;
pub mod logging;
pub mod mr;
pub mod poll;
pub mod request;
pub mod transport;

pub use config::NetConfig;
pub use conn::{CommId, ListenComm, RecvComm, SendComm};
pub use context::NetContext;
pub use device::{DeviceProps, DeviceRegistry, MemoryKind, OffloadKind};
pub use engine::{Completion, Engine, FlushEntry, RecvEntry};
pub use error::{ErrorKind, NetError};
pub use handle::{ConnectHandle, MAX_HANDLE_SIZE};
pub use mr::{MrHandle, RegionMemory};
pub use poll::Progress;
pub use request::RequestId;
pub use transport::{Accepted, Channel, Connecting, Frame, Listening, OffloadHandle, Transport};
