//! Connection endpoints.
//!
//! A listen produces a [`ListenComm`] that accepts exactly one peer. The
//! handshake yields a [`SendComm`] on the active side and a [`RecvComm`] on
//! the passive side; each owns its channel, its region registry, and its
//! request table. Endpoints are single-owner and never shared across
//! threads by the backend itself.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::device::DeviceProps;
use crate::error::NetError;
use crate::mr::{MrHandle, RegionMemory, RegionTable};
use crate::poll::Progress;
use crate::request::RequestTable;
use crate::transport::{Accepted, Channel, Frame, Listening, OffloadHandle};

/// Process-unique endpoint id, embedded in every memory and request handle
/// so handles cannot cross endpoints undetected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommId(u64);

static NEXT_COMM_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn alloc_comm_id() -> CommId {
    CommId(NEXT_COMM_ID.fetch_add(1, Ordering::Relaxed))
}

/// Concurrency bounds applied to a new endpoint, derived from the backend
/// configuration and the device's advertised limits.
#[derive(Debug, Clone)]
pub(crate) struct CommLimits {
    pub request_limit: usize,
    pub max_recvs: usize,
    pub max_unexpected: usize,
}

/// State shared by both endpoint roles.
pub(crate) struct CommCore {
    pub id: CommId,
    pub device: DeviceProps,
    pub channel: Box<dyn Channel>,
    pub offload: Option<OffloadHandle>,
    pub regions: RegionTable,
    pub requests: RequestTable,
    pub closed: bool,
}

impl CommCore {
    fn new(accepted: Accepted, device: DeviceProps, limits: &CommLimits) -> Self {
        let id = alloc_comm_id();
        Self {
            id,
            device,
            channel: accepted.channel,
            offload: accepted.offload,
            regions: RegionTable::new(id),
            requests: RequestTable::new(id, limits.request_limit),
            closed: false,
        }
    }

    pub fn ensure_open(&self) -> Result<(), NetError> {
        if self.closed {
            return Err(NetError::CommClosed);
        }
        Ok(())
    }

    fn register(&mut self, memory: RegionMemory) -> Result<MrHandle, NetError> {
        self.ensure_open()?;
        self.regions.register(memory, &self.device)
    }

    fn deregister(&mut self, mr: MrHandle) -> Result<RegionMemory, NetError> {
        self.ensure_open()?;
        self.regions.deregister(mr)
    }

    /// Close the endpoint once every issued request has been reported.
    /// Registrations still live at close time are torn down with it.
    fn close(&mut self) -> Result<(), NetError> {
        if self.closed {
            return Ok(());
        }
        let outstanding = self.requests.outstanding();
        if outstanding > 0 {
            return Err(NetError::RequestsOutstanding { outstanding });
        }
        self.channel.close();
        self.closed = true;
        debug!(id = ?self.id, "endpoint closed");
        Ok(())
    }
}

/// Passive rendezvous endpoint produced by `listen`.
///
/// Accepts exactly one peer over its lifetime; once a connection has been
/// produced, further accepts are a usage error.
pub struct ListenComm {
    raw: Option<Box<dyn Listening>>,
    device: DeviceProps,
    limits: CommLimits,
    accepted: bool,
}

impl ListenComm {
    pub(crate) fn new(raw: Box<dyn Listening>, device: DeviceProps, limits: CommLimits) -> Self {
        Self {
            raw: Some(raw),
            device,
            limits,
            accepted: false,
        }
    }

    /// Poll for an incoming peer. `Pending` until a peer completes the
    /// handshake, then `Ready` exactly once.
    pub fn accept(&mut self) -> Result<Progress<RecvComm>, NetError> {
        if self.accepted {
            return Err(NetError::AcceptExhausted);
        }
        let raw = self.raw.as_mut().ok_or(NetError::CommClosed)?;
        match raw.poll_accept()? {
            Progress::Pending => Ok(Progress::Pending),
            Progress::Ready(accepted) => {
                self.accepted = true;
                let comm = RecvComm::new(accepted, self.device.clone(), &self.limits);
                debug!(id = ?comm.id(), device = %self.device.name, "accepted peer");
                Ok(Progress::Ready(comm))
            }
        }
    }

    /// Tear down the listening endpoint. Idempotent; safe whether or not a
    /// peer was ever accepted.
    pub fn close(&mut self) {
        if let Some(mut raw) = self.raw.take() {
            raw.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }
}

impl Drop for ListenComm {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ListenComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenComm")
            .field("device", &self.device.name)
            .field("accepted", &self.accepted)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Active-side endpoint: issues sends toward the peer.
pub struct SendComm {
    pub(crate) core: CommCore,
}

impl SendComm {
    pub(crate) fn new(accepted: Accepted, device: DeviceProps, limits: &CommLimits) -> Self {
        Self {
            core: CommCore::new(accepted, device, limits),
        }
    }

    pub fn id(&self) -> CommId {
        self.core.id
    }

    /// The offload descriptor negotiated during the handshake, if any.
    pub fn offload(&self) -> Option<OffloadHandle> {
        self.core.offload
    }

    /// Register memory for use in send requests on this endpoint.
    pub fn register(&mut self, memory: RegionMemory) -> Result<MrHandle, NetError> {
        self.core.register(memory)
    }

    /// Deregister a region, handing its memory back. Fails while any
    /// incomplete request still references the region.
    pub fn deregister(&mut self, mr: MrHandle) -> Result<RegionMemory, NetError> {
        self.core.deregister(mr)
    }

    /// Read access to a registered host region.
    pub fn host_region(&self, mr: MrHandle) -> Result<&[u8], NetError> {
        self.core.regions.host_slice(mr)
    }

    /// Write access to a registered host region, for staging outbound data.
    pub fn host_region_mut(&mut self, mr: MrHandle) -> Result<&mut [u8], NetError> {
        self.core.regions.host_slice_mut(mr)
    }

    /// Requests issued on this endpoint that have not yet been reported.
    pub fn outstanding(&self) -> usize {
        self.core.requests.outstanding()
    }

    /// Close the endpoint. Fails with [`NetError::RequestsOutstanding`]
    /// until every issued request has been reported; idempotent afterwards.
    pub fn close(&mut self) -> Result<(), NetError> {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }
}

impl fmt::Debug for SendComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendComm")
            .field("id", &self.core.id)
            .field("outstanding", &self.core.requests.outstanding())
            .field("closed", &self.core.closed)
            .finish()
    }
}

/// Passive-side endpoint: posts receive groups and flushes.
pub struct RecvComm {
    pub(crate) core: CommCore,
    /// Frames pulled off the channel that no posted receive has claimed yet.
    pub(crate) unexpected: VecDeque<Frame>,
    pub(crate) max_recvs: usize,
    pub(crate) max_unexpected: usize,
    /// Set once the channel reports the peer gone; pending receives that
    /// can no longer be satisfied fail from here on.
    pub(crate) eof: bool,
}

impl RecvComm {
    pub(crate) fn new(accepted: Accepted, device: DeviceProps, limits: &CommLimits) -> Self {
        Self {
            core: CommCore::new(accepted, device, limits),
            unexpected: VecDeque::new(),
            max_recvs: limits.max_recvs,
            max_unexpected: limits.max_unexpected,
            eof: false,
        }
    }

    pub fn id(&self) -> CommId {
        self.core.id
    }

    pub fn offload(&self) -> Option<OffloadHandle> {
        self.core.offload
    }

    /// Register memory for use in receive and flush requests.
    pub fn register(&mut self, memory: RegionMemory) -> Result<MrHandle, NetError> {
        self.core.register(memory)
    }

    pub fn deregister(&mut self, mr: MrHandle) -> Result<RegionMemory, NetError> {
        self.core.deregister(mr)
    }

    pub fn host_region(&self, mr: MrHandle) -> Result<&[u8], NetError> {
        self.core.regions.host_slice(mr)
    }

    pub fn host_region_mut(&mut self, mr: MrHandle) -> Result<&mut [u8], NetError> {
        self.core.regions.host_slice_mut(mr)
    }

    pub fn outstanding(&self) -> usize {
        self.core.requests.outstanding()
    }

    pub fn close(&mut self) -> Result<(), NetError> {
        self.core.close()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }
}

impl fmt::Debug for RecvComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvComm")
            .field("id", &self.core.id)
            .field("outstanding", &self.core.requests.outstanding())
            .field("unclaimed", &self.unexpected.len())
            .field("closed", &self.core.closed)
            .finish()
    }
}
