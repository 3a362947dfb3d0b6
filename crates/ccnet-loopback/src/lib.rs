//! In-process loopback transport.
//!
//! The reference [`Transport`] implementation: connections never leave the
//! process. A listen mints a token and parks a rendezvous entry in a shared
//! table; the connect side finds the entry through the token carried in the
//! out-of-band handle, queues a join with a fresh pipe pair, and both sides
//! then poll the handshake to completion.
//!
//! Besides serving as the smallest working transport, this is the vehicle
//! the engine's end-to-end tests run on.

pub mod config;

mod channel;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ccnet_core::device::{DeviceProps, OffloadKind, OFFLOAD_VERSION_INVALID, PTR_DEVICE, PTR_HOST};
use ccnet_core::error::NetError;
use ccnet_core::handle::ConnectHandle;
use ccnet_core::poll::Progress;
use ccnet_core::transport::{Accepted, Connecting, Listening, Transport};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::LoopbackChannel;
pub use crate::config::LoopbackConfig;

/// Handle payload magic, so a blob from some other transport is rejected
/// instead of misparsed.
const HANDLE_MAGIC: &[u8; 4] = b"LBK1";

/// One peer waiting for the passive side to accept it.
struct JoinRequest {
    passive: LoopbackChannel,
    accepted: Arc<AtomicBool>,
}

/// Rendezvous point behind one listen token.
struct Rendezvous {
    device: usize,
    joins: Mutex<VecDeque<JoinRequest>>,
    closed: AtomicBool,
}

/// The loopback transport.
pub struct LoopbackTransport {
    config: LoopbackConfig,
    devices: Vec<DeviceProps>,
    rendezvous: Arc<DashMap<u64, Arc<Rendezvous>>>,
    next_token: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig) -> Self {
        let mut ptr_support = PTR_HOST;
        if config.device_memory {
            ptr_support |= PTR_DEVICE;
        }
        let devices = (0..config.devices)
            .map(|i| DeviceProps {
                name: format!("loopback{i}"),
                path: format!("0000:00:{i:02x}.0"),
                guid: 0xCC00 + i as u64,
                ptr_support,
                reg_is_global: false,
                speed_mbps: 100_000,
                latency_us: 0,
                port: 0,
                max_comms: 1 << 20,
                max_recvs: 8,
                offload_kind: OffloadKind::None,
                offload_version: OFFLOAD_VERSION_INVALID,
            })
            .collect();
        LoopbackTransport {
            config,
            devices,
            rendezvous: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn encode_handle(device: usize, token: u64) -> Result<ConnectHandle, NetError> {
        let mut payload = Vec::with_capacity(14);
        payload.extend_from_slice(HANDLE_MAGIC);
        payload.extend_from_slice(&(device as u16).to_le_bytes());
        payload.extend_from_slice(&token.to_le_bytes());
        ConnectHandle::new(&payload)
    }

    fn decode_handle(handle: &ConnectHandle) -> Result<(usize, u64), NetError> {
        let payload = handle.payload();
        if payload.len() != 14 || &payload[..4] != HANDLE_MAGIC {
            return Err(NetError::ConnectFailed(
                "handle was not minted by the loopback transport".to_string(),
            ));
        }
        let device = u16::from_le_bytes([payload[4], payload[5]]) as usize;
        let mut token = [0u8; 8];
        token.copy_from_slice(&payload[6..14]);
        Ok((device, u64::from_le_bytes(token)))
    }
}

impl Transport for LoopbackTransport {
    fn devices(&self) -> Vec<DeviceProps> {
        self.devices.clone()
    }

    fn listen(&self, device: usize) -> Result<(ConnectHandle, Box<dyn Listening>), NetError> {
        if device >= self.devices.len() {
            return Err(NetError::DeviceOutOfRange {
                index: device,
                count: self.devices.len(),
            });
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let handle = Self::encode_handle(device, token)?;
        let entry = Arc::new(Rendezvous {
            device,
            joins: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        self.rendezvous.insert(token, entry.clone());
        debug!(device, token, "loopback listen");
        Ok((
            handle,
            Box::new(LoopbackListening {
                token,
                entry,
                table: self.rendezvous.clone(),
            }),
        ))
    }

    fn open(&self, device: usize, handle: &ConnectHandle) -> Result<Box<dyn Connecting>, NetError> {
        let (target_device, token) = Self::decode_handle(handle)?;
        if target_device != device {
            return Err(NetError::ConnectFailed(
                "handle was minted on a different device".to_string(),
            ));
        }
        let entry = self
            .rendezvous
            .get(&token)
            .map(|e| e.value().clone())
            .ok_or_else(|| NetError::ConnectFailed("no listener behind this handle".to_string()))?;
        debug_assert_eq!(entry.device, device);

        let (active, passive) = LoopbackChannel::pair(self.config.queue_depth);
        let accepted = Arc::new(AtomicBool::new(false));
        {
            if entry.closed.load(Ordering::Acquire) {
                return Err(NetError::ConnectFailed(
                    "listener is already closed".to_string(),
                ));
            }
            entry.joins.lock().push_back(JoinRequest {
                passive,
                accepted: accepted.clone(),
            });
        }
        trace!(device, token, "loopback join queued");
        Ok(Box::new(LoopbackConnecting {
            active: Some(active),
            accepted,
            entry,
        }))
    }
}

struct LoopbackListening {
    token: u64,
    entry: Arc<Rendezvous>,
    table: Arc<DashMap<u64, Arc<Rendezvous>>>,
}

impl Listening for LoopbackListening {
    fn poll_accept(&mut self) -> Result<Progress<Accepted>, NetError> {
        let join = self.entry.joins.lock().pop_front();
        match join {
            None => Ok(Progress::Pending),
            Some(join) => {
                join.accepted.store(true, Ordering::Release);
                trace!(token = self.token, "loopback accept");
                Ok(Progress::Ready(Accepted {
                    channel: Box::new(join.passive),
                    offload: None,
                }))
            }
        }
    }

    fn close(&mut self) {
        self.entry.closed.store(true, Ordering::Release);
        // Queued joins are dropped with the entry; their connect side
        // observes the closed flag and fails.
        self.entry.joins.lock().clear();
        self.table.remove(&self.token);
    }
}

impl Drop for LoopbackListening {
    fn drop(&mut self) {
        self.close();
    }
}

struct LoopbackConnecting {
    active: Option<LoopbackChannel>,
    accepted: Arc<AtomicBool>,
    entry: Arc<Rendezvous>,
}

impl Connecting for LoopbackConnecting {
    fn poll_connect(&mut self) -> Result<Progress<Accepted>, NetError> {
        if self.accepted.load(Ordering::Acquire) {
            let channel = self.active.take().ok_or_else(|| {
                NetError::ConnectFailed("connection attempt already resolved".to_string())
            })?;
            return Ok(Progress::Ready(Accepted {
                channel: Box::new(channel),
                offload: None,
            }));
        }
        if self.entry.closed.load(Ordering::Acquire) {
            return Err(NetError::HandshakeFailed(
                "listener closed before accepting".to_string(),
            ));
        }
        Ok(Progress::Pending)
    }
}
