//! The transfer engine.
//!
//! [`Engine`] is the front door: it owns the transport, the validated device
//! list, and the cache of in-flight connection attempts. The data-path
//! operations live on the endpoints themselves; every one of them is
//! non-blocking and makes progress only when polled.
//!
//! Completion of a send means the transport accepted the frame, not that the
//! peer consumed it. Completion of a receive means the payload sits in the
//! posted region. Neither implies anything about the other side's polls.

use std::fmt;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::config::NetConfig;
use crate::conn::{CommCore, CommLimits, ListenComm, RecvComm, SendComm};
use crate::device::{DeviceProps, DeviceRegistry, MemoryKind};
use crate::error::NetError;
use crate::handle::ConnectHandle;
use crate::mr::{MrHandle, RegionTable};
use crate::poll::Progress;
use crate::request::{FailureCause, RecvSlot, RequestId, RequestKind, RequestState, RequestTable};
use crate::transport::{Connecting, Frame, Transport};

/// One entry of a receive group: a region, the exact expected size, and the
/// tag the inbound frame must carry.
#[derive(Debug, Clone, Copy)]
pub struct RecvEntry {
    pub mr: MrHandle,
    pub size: usize,
    pub tag: u32,
}

/// One region covered by a flush request.
#[derive(Debug, Clone, Copy)]
pub struct FlushEntry {
    pub mr: MrHandle,
    pub size: usize,
}

/// Final result of a completed request: the transferred size per entry, in
/// the order the entries were posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub sizes: Vec<usize>,
}

/// The transfer engine over one transport.
pub struct Engine {
    transport: Box<dyn Transport>,
    devices: DeviceRegistry,
    /// In-flight connection attempts, keyed by target. A retried connect
    /// resumes its cached attempt instead of opening a second one.
    attempts: DashMap<(usize, ConnectHandle), Box<dyn Connecting>>,
    config: NetConfig,
}

impl Engine {
    /// Build the engine, validating the configuration and every device the
    /// transport advertises.
    pub fn new(transport: Box<dyn Transport>, config: NetConfig) -> Result<Self, NetError> {
        config.validate()?;
        let devices = DeviceRegistry::new(transport.devices())?;
        debug!(devices = devices.count(), "transfer engine up");
        Ok(Self {
            transport,
            devices,
            attempts: DashMap::new(),
            config,
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.count()
    }

    pub fn device_props(&self, index: usize) -> Result<DeviceProps, NetError> {
        self.devices.props(index).cloned()
    }

    fn limits(&self, props: &DeviceProps) -> CommLimits {
        CommLimits {
            request_limit: self.config.request_limit,
            max_recvs: props.max_recvs as usize,
            max_unexpected: self.config.max_unexpected_frames,
        }
    }

    /// Open a passive endpoint on a device. The returned handle is the blob
    /// the host carries to the peer out of band.
    pub fn listen(&self, device: usize) -> Result<(ConnectHandle, ListenComm), NetError> {
        let props = self.devices.props(device)?.clone();
        let limits = self.limits(&props);
        let (handle, raw) = self.transport.listen(device)?;
        debug!(device = %props.name, "listening");
        Ok((handle, ListenComm::new(raw, props, limits)))
    }

    /// Poll a connection attempt toward `handle`.
    ///
    /// `Pending` means the attempt is parked inside the engine; calling again
    /// with the same device and handle resumes it. A hard error discards the
    /// attempt entirely, so the next call starts fresh.
    pub fn connect(
        &self,
        device: usize,
        handle: &ConnectHandle,
    ) -> Result<Progress<SendComm>, NetError> {
        let props = self.devices.props(device)?.clone();
        let key = (device, *handle);
        let mut attempt = match self.attempts.remove(&key) {
            Some((_, attempt)) => attempt,
            None => self.transport.open(device, handle)?,
        };
        match attempt.poll_connect()? {
            Progress::Pending => {
                self.attempts.insert(key, attempt);
                Ok(Progress::Pending)
            }
            Progress::Ready(accepted) => {
                let comm = SendComm::new(accepted, props.clone(), &self.limits(&props));
                debug!(id = ?comm.id(), device = %props.name, "connected");
                Ok(Progress::Ready(comm))
            }
        }
    }

    /// Connection attempts currently parked between polls.
    pub fn attempts_in_flight(&self) -> usize {
        self.attempts.len()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.devices.count())
            .field("attempts_in_flight", &self.attempts.len())
            .finish_non_exhaustive()
    }
}

/// How one poll of a request resolved, computed while the request is
/// borrowed and applied to the tables afterwards.
enum Outcome {
    Pending,
    Complete {
        sizes: Vec<usize>,
        pinned: Vec<MrHandle>,
    },
    Failed {
        cause: FailureCause,
        pinned: Vec<MrHandle>,
        error: NetError,
    },
    Retired(Vec<usize>),
    Fault(FailureCause),
}

fn settle(
    requests: &mut RequestTable,
    regions: &mut RegionTable,
    id: RequestId,
    outcome: Outcome,
) -> Result<Progress<Completion>, NetError> {
    match outcome {
        Outcome::Pending => Ok(Progress::Pending),
        Outcome::Retired(sizes) => Ok(Progress::Ready(Completion { sizes })),
        Outcome::Fault(cause) => Err(cause.to_error()),
        Outcome::Complete { sizes, pinned } => {
            for mr in pinned {
                regions.unpin(mr);
            }
            requests.complete(id, sizes.clone())?;
            trace!(?id, ?sizes, "request complete");
            Ok(Progress::Ready(Completion { sizes }))
        }
        Outcome::Failed {
            cause,
            pinned,
            error,
        } => {
            for mr in pinned {
                regions.unpin(mr);
            }
            requests.fail(id, cause)?;
            debug!(?id, %error, "request failed");
            Err(error)
        }
    }
}

impl SendComm {
    /// Issue a send of the first `size` bytes of `mr` under `tag`.
    ///
    /// The payload is staged at issue time; the caller may reuse the region
    /// buffer as soon as the request is reported complete.
    pub fn isend(&mut self, mr: MrHandle, size: usize, tag: u32) -> Result<RequestId, NetError> {
        self.core.ensure_open()?;
        let region_len = self.core.regions.len(mr)?;
        if size > region_len {
            return Err(NetError::InvalidArgument(
                "send size exceeds the registered region",
            ));
        }
        let payload = Bytes::copy_from_slice(&self.core.regions.host_slice(mr)?[..size]);
        self.core.regions.pin(mr)?;
        let state = RequestState::SendPending {
            frame: Some(Frame::new(tag, payload)),
            size,
        };
        match self.core.requests.issue(RequestKind::Send, state, vec![mr]) {
            Ok(id) => {
                trace!(?id, size, tag, "send issued");
                Ok(id)
            }
            Err(err) => {
                self.core.regions.unpin(mr);
                Err(err)
            }
        }
    }

    /// Poll a send request. Each poll offers the staged frame to the
    /// transport once; `Pending` until the transport takes it.
    pub fn test(&mut self, id: RequestId) -> Result<Progress<Completion>, NetError> {
        self.core.ensure_open()?;
        let CommCore {
            channel,
            regions,
            requests,
            ..
        } = &mut self.core;

        let outcome = {
            let request = requests.lookup_mut(id)?;
            if request.kind != RequestKind::Send {
                return Err(NetError::StaleHandle(
                    "request does not belong to this endpoint role",
                ));
            }
            match &mut request.state {
                RequestState::SendPending { frame, size } => {
                    let size = *size;
                    let staged = match frame.take() {
                        Some(f) => f,
                        // Restored on every give-back; an empty slot in a
                        // live send is unreachable.
                        None => return Ok(Progress::Pending),
                    };
                    match channel.try_send(staged) {
                        Ok(None) => Outcome::Complete {
                            sizes: vec![size],
                            pinned: request.pinned.clone(),
                        },
                        Ok(Some(back)) => {
                            *frame = Some(back);
                            Outcome::Pending
                        }
                        Err(err) => Outcome::Failed {
                            cause: FailureCause::of(&err),
                            pinned: request.pinned.clone(),
                            error: err,
                        },
                    }
                }
                RequestState::Retired { sizes } => Outcome::Retired(sizes.clone()),
                RequestState::Fault { cause } => Outcome::Fault(*cause),
                // Send requests never enter receive states.
                RequestState::RecvPending { .. } | RequestState::FlushPending { .. } => {
                    return Err(NetError::StaleHandle(
                        "request does not belong to this endpoint role",
                    ))
                }
            }
        };
        settle(requests, regions, id, outcome)
    }
}

impl RecvComm {
    /// Post a receive group: up to the device's `max_recvs` entries, each
    /// matched independently by exact tag. Tags within one group must be
    /// distinct; posted sizes are exact, not upper bounds.
    pub fn irecv(&mut self, entries: &[RecvEntry]) -> Result<RequestId, NetError> {
        self.core.ensure_open()?;
        if entries.is_empty() {
            return Err(NetError::InvalidArgument(
                "receive group must contain at least one entry",
            ));
        }
        if entries.len() > self.max_recvs {
            return Err(NetError::InvalidArgument(
                "receive group exceeds the device receive limit",
            ));
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|prev| prev.tag == entry.tag) {
                return Err(NetError::InvalidArgument(
                    "duplicate tag within a receive group",
                ));
            }
            let region_len = self.core.regions.len(entry.mr)?;
            if entry.size > region_len {
                return Err(NetError::InvalidArgument(
                    "receive size exceeds the registered region",
                ));
            }
            if self.core.regions.kind(entry.mr)? == MemoryKind::Device {
                return Err(NetError::UnsupportedMemory("device"));
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            if let Err(err) = self.core.regions.pin(entry.mr) {
                for prev in &entries[..i] {
                    self.core.regions.unpin(prev.mr);
                }
                return Err(err);
            }
        }
        let slots = entries
            .iter()
            .map(|e| RecvSlot {
                mr: e.mr,
                size: e.size,
                tag: e.tag,
                done: false,
            })
            .collect();
        let pinned = entries.iter().map(|e| e.mr).collect();
        match self
            .core
            .requests
            .issue(RequestKind::Recv, RequestState::RecvPending { entries: slots }, pinned)
        {
            Ok(id) => {
                trace!(?id, entries = entries.len(), "receive group posted");
                Ok(id)
            }
            Err(err) => {
                for entry in entries {
                    self.core.regions.unpin(entry.mr);
                }
                Err(err)
            }
        }
    }

    /// Issue a visibility barrier over received data in the given regions.
    /// An empty entry list is legal and completes trivially.
    pub fn iflush(&mut self, entries: &[FlushEntry]) -> Result<RequestId, NetError> {
        self.core.ensure_open()?;
        for entry in entries {
            let region_len = self.core.regions.len(entry.mr)?;
            if entry.size > region_len {
                return Err(NetError::InvalidArgument(
                    "flush size exceeds the registered region",
                ));
            }
        }
        for (i, entry) in entries.iter().enumerate() {
            if let Err(err) = self.core.regions.pin(entry.mr) {
                for prev in &entries[..i] {
                    self.core.regions.unpin(prev.mr);
                }
                return Err(err);
            }
        }
        let sizes = entries.iter().map(|e| e.size).collect();
        let pinned = entries.iter().map(|e| e.mr).collect();
        match self
            .core
            .requests
            .issue(RequestKind::Flush, RequestState::FlushPending { sizes }, pinned)
        {
            Ok(id) => Ok(id),
            Err(err) => {
                for entry in entries {
                    self.core.regions.unpin(entry.mr);
                }
                Err(err)
            }
        }
    }

    /// Poll a receive or flush request.
    ///
    /// Each poll first drains the channel into the unclaimed-frame queue,
    /// then matches queued frames against the group's remaining tags. A
    /// frame whose size differs from the posted size fails the whole
    /// request; data is never truncated.
    pub fn test(&mut self, id: RequestId) -> Result<Progress<Completion>, NetError> {
        self.core.ensure_open()?;
        self.pump()?;

        let RecvComm {
            core,
            unexpected,
            max_unexpected,
            eof,
            ..
        } = self;
        let CommCore {
            channel,
            regions,
            requests,
            ..
        } = core;

        let outcome = {
            let request = requests.lookup_mut(id)?;
            if request.kind == RequestKind::Send {
                return Err(NetError::StaleHandle(
                    "request does not belong to this endpoint role",
                ));
            }
            match &mut request.state {
                RequestState::RecvPending { entries } => {
                    let mut failure = None;
                    for entry in entries.iter_mut().filter(|e| !e.done) {
                        let Some(pos) = unexpected.iter().position(|f| f.tag == entry.tag) else {
                            continue;
                        };
                        let Some(frame) = unexpected.remove(pos) else {
                            continue;
                        };
                        if frame.payload.len() != entry.size {
                            failure = Some(FailureCause::SizeMismatch {
                                tag: entry.tag,
                                posted: entry.size,
                                actual: frame.payload.len(),
                            });
                            break;
                        }
                        regions.host_slice_mut(entry.mr)?[..entry.size]
                            .copy_from_slice(&frame.payload);
                        entry.done = true;
                    }
                    // Frames the pump left in the channel under a full
                    // unclaimed queue are still claimable by this group.
                    while failure.is_none() && !*eof && entries.iter().any(|e| !e.done) {
                        match channel.try_recv() {
                            Ok(Some(frame)) => {
                                if let Some(entry) =
                                    entries.iter_mut().find(|e| !e.done && e.tag == frame.tag)
                                {
                                    if frame.payload.len() != entry.size {
                                        failure = Some(FailureCause::SizeMismatch {
                                            tag: entry.tag,
                                            posted: entry.size,
                                            actual: frame.payload.len(),
                                        });
                                    } else {
                                        regions.host_slice_mut(entry.mr)?[..entry.size]
                                            .copy_from_slice(&frame.payload);
                                        entry.done = true;
                                    }
                                } else if unexpected.len() < *max_unexpected {
                                    unexpected.push_back(frame);
                                } else {
                                    // Unmatchable frame with nowhere to hold it.
                                    failure = Some(FailureCause::Transport);
                                }
                            }
                            Ok(None) => break,
                            Err(NetError::ChannelClosed) => *eof = true,
                            Err(err) => return Err(err),
                        }
                    }
                    if let Some(cause) = failure {
                        let error = match cause {
                            FailureCause::Transport => NetError::Transport(
                                "unclaimed frame queue overflow".to_string(),
                            ),
                            other => other.to_error(),
                        };
                        Outcome::Failed {
                            cause,
                            pinned: request.pinned.clone(),
                            error,
                        }
                    } else if entries.iter().all(|e| e.done) {
                        Outcome::Complete {
                            sizes: entries.iter().map(|e| e.size).collect(),
                            pinned: request.pinned.clone(),
                        }
                    } else if *eof {
                        Outcome::Failed {
                            cause: FailureCause::ChannelClosed,
                            pinned: request.pinned.clone(),
                            error: NetError::ChannelClosed,
                        }
                    } else {
                        Outcome::Pending
                    }
                }
                RequestState::FlushPending { sizes } => Outcome::Complete {
                    sizes: sizes.clone(),
                    pinned: request.pinned.clone(),
                },
                RequestState::Retired { sizes } => Outcome::Retired(sizes.clone()),
                RequestState::Fault { cause } => Outcome::Fault(*cause),
                // Receive endpoints never issue sends.
                RequestState::SendPending { .. } => {
                    return Err(NetError::StaleHandle(
                        "request does not belong to this endpoint role",
                    ))
                }
            }
        };
        settle(requests, regions, id, outcome)
    }

    /// Drain ready frames into the unclaimed queue, stopping at the bound.
    /// Frames left in the channel act as backpressure and stay claimable by
    /// posted receives; a closed peer stops the pump with delivered frames
    /// still matchable.
    fn pump(&mut self) -> Result<(), NetError> {
        if self.eof {
            return Ok(());
        }
        while self.unexpected.len() < self.max_unexpected {
            match self.core.channel.try_recv() {
                Ok(Some(frame)) => self.unexpected.push_back(frame),
                Ok(None) => break,
                Err(NetError::ChannelClosed) => {
                    self.eof = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::CommLimits;
    use crate::mr::RegionMemory;
    use crate::transport::{Accepted, Channel};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Pipe {
        frames: Mutex<VecDeque<Frame>>,
        closed: AtomicBool,
    }

    struct PipeChannel {
        tx: Arc<Pipe>,
        rx: Arc<Pipe>,
        /// Frames the send side refuses before accepting one, to exercise
        /// the give-back path.
        refuse: usize,
    }

    impl Channel for PipeChannel {
        fn try_send(&mut self, frame: Frame) -> Result<Option<Frame>, NetError> {
            if self.refuse > 0 {
                self.refuse -= 1;
                return Ok(Some(frame));
            }
            if self.tx.closed.load(Ordering::Acquire) {
                return Err(NetError::ChannelClosed);
            }
            self.tx.frames.lock().push_back(frame);
            Ok(None)
        }

        fn try_recv(&mut self) -> Result<Option<Frame>, NetError> {
            if let Some(frame) = self.rx.frames.lock().pop_front() {
                return Ok(Some(frame));
            }
            if self.rx.closed.load(Ordering::Acquire) {
                return Err(NetError::ChannelClosed);
            }
            Ok(None)
        }

        fn close(&mut self) {
            self.tx.closed.store(true, Ordering::Release);
            self.rx.closed.store(true, Ordering::Release);
        }

        fn is_closed(&self) -> bool {
            self.tx.closed.load(Ordering::Acquire)
        }
    }

    fn pipe() -> Arc<Pipe> {
        Arc::new(Pipe {
            frames: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn endpoint_pair(refuse: usize) -> (SendComm, RecvComm) {
        endpoint_pair_bounded(refuse, 64)
    }

    fn endpoint_pair_bounded(refuse: usize, max_unexpected: usize) -> (SendComm, RecvComm) {
        let limits = CommLimits {
            request_limit: 8,
            max_recvs: 8,
            max_unexpected,
        };
        let (a, b) = (pipe(), pipe());
        let dev = crate::device::tests::host_device("net0");
        let sender = SendComm::new(
            Accepted {
                channel: Box::new(PipeChannel {
                    tx: a.clone(),
                    rx: b.clone(),
                    refuse,
                }),
                offload: None,
            },
            dev.clone(),
            &limits,
        );
        let receiver = RecvComm::new(
            Accepted {
                channel: Box::new(PipeChannel {
                    tx: b,
                    rx: a,
                    refuse: 0,
                }),
                offload: None,
            },
            dev,
            &limits,
        );
        (sender, receiver)
    }

    fn filled(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (mut tx, mut rx) = endpoint_pair(0);
        let data = filled(4096, 0x11);

        let smr = tx.register(RegionMemory::Host(data.clone())).unwrap();
        let rmr = rx.register(RegionMemory::Host(vec![0u8; 4096])).unwrap();
        let rreq = rx
            .irecv(&[RecvEntry {
                mr: rmr,
                size: 4096,
                tag: 7,
            }])
            .unwrap();
        assert!(rx.test(rreq).unwrap().is_pending());

        let sreq = tx.isend(smr, 4096, 7).unwrap();
        let done = tx.test(sreq).unwrap();
        assert_eq!(done.ready().unwrap().sizes, vec![4096]);

        let done = rx.test(rreq).unwrap();
        assert_eq!(done.ready().unwrap().sizes, vec![4096]);
        assert_eq!(rx.host_region(rmr).unwrap(), &data[..]);
    }

    #[test]
    fn test_send_give_back_retries() {
        let (mut tx, mut rx) = endpoint_pair(2);
        let smr = tx.register(RegionMemory::Host(filled(64, 1))).unwrap();
        let req = tx.isend(smr, 64, 0).unwrap();

        // The channel refuses twice before accepting.
        assert!(tx.test(req).unwrap().is_pending());
        assert!(tx.test(req).unwrap().is_pending());
        assert!(tx.test(req).unwrap().is_ready());
        let _ = rx;
    }

    #[test]
    fn test_completion_is_idempotent() {
        let (mut tx, _rx) = endpoint_pair(0);
        let smr = tx.register(RegionMemory::Host(filled(64, 2))).unwrap();
        let req = tx.isend(smr, 64, 0).unwrap();

        let first = tx.test(req).unwrap();
        let second = tx.test(req).unwrap();
        assert_eq!(first.ready(), second.ready());
        assert_eq!(tx.outstanding(), 0);
    }

    #[test]
    fn test_size_mismatch_fails_request() {
        let (mut tx, mut rx) = endpoint_pair(0);
        let smr = tx.register(RegionMemory::Host(filled(2048, 3))).unwrap();
        let rmr = rx.register(RegionMemory::Host(vec![0u8; 4096])).unwrap();

        let rreq = rx
            .irecv(&[RecvEntry {
                mr: rmr,
                size: 4096,
                tag: 9,
            }])
            .unwrap();
        let sreq = tx.isend(smr, 2048, 9).unwrap();
        tx.test(sreq).unwrap();

        let err = rx.test(rreq).unwrap_err();
        assert!(matches!(
            err,
            NetError::SizeMismatch {
                tag: 9,
                posted: 4096,
                actual: 2048,
            }
        ));
        // The failure is sticky and the region is no longer pinned.
        assert!(rx.test(rreq).is_err());
        assert!(rx.deregister(rmr).is_ok());
    }

    #[test]
    fn test_multi_entry_group_out_of_order() {
        let (mut tx, mut rx) = endpoint_pair(0);
        let a = filled(128, 4);
        let b = filled(256, 5);
        let sa = tx.register(RegionMemory::Host(a.clone())).unwrap();
        let sb = tx.register(RegionMemory::Host(b.clone())).unwrap();
        let ra = rx.register(RegionMemory::Host(vec![0u8; 128])).unwrap();
        let rb = rx.register(RegionMemory::Host(vec![0u8; 256])).unwrap();

        let rreq = rx
            .irecv(&[
                RecvEntry {
                    mr: ra,
                    size: 128,
                    tag: 1,
                },
                RecvEntry {
                    mr: rb,
                    size: 256,
                    tag: 2,
                },
            ])
            .unwrap();

        // Deliver tag 2 first; the group completes only when both land.
        let s2 = tx.isend(sb, 256, 2).unwrap();
        tx.test(s2).unwrap();
        assert!(rx.test(rreq).unwrap().is_pending());

        let s1 = tx.isend(sa, 128, 1).unwrap();
        tx.test(s1).unwrap();
        let done = rx.test(rreq).unwrap();
        assert_eq!(done.ready().unwrap().sizes, vec![128, 256]);
        assert_eq!(rx.host_region(ra).unwrap(), &a[..]);
        assert_eq!(rx.host_region(rb).unwrap(), &b[..]);
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let (_tx, mut rx) = endpoint_pair(0);
        let mr = rx.register(RegionMemory::Host(vec![0u8; 64])).unwrap();
        let err = rx
            .irecv(&[
                RecvEntry {
                    mr,
                    size: 64,
                    tag: 3,
                },
                RecvEntry {
                    mr,
                    size: 64,
                    tag: 3,
                },
            ])
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));
        assert_eq!(rx.outstanding(), 0);
    }

    #[test]
    fn test_group_size_limit() {
        let (_tx, mut rx) = endpoint_pair(0);
        let mr = rx.register(RegionMemory::Host(vec![0u8; 64])).unwrap();
        let entries: Vec<RecvEntry> = (0..9)
            .map(|tag| RecvEntry {
                mr,
                size: 64,
                tag,
            })
            .collect();
        let err = rx.irecv(&entries).unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));
    }

    #[test]
    fn test_flush_completes_on_poll() {
        let (_tx, mut rx) = endpoint_pair(0);
        let mr = rx.register(RegionMemory::Host(vec![0u8; 512])).unwrap();
        let req = rx.iflush(&[FlushEntry { mr, size: 512 }]).unwrap();
        let done = rx.test(req).unwrap();
        assert_eq!(done.ready().unwrap().sizes, vec![512]);
    }

    #[test]
    fn test_empty_flush_is_trivial() {
        let (_tx, mut rx) = endpoint_pair(0);
        let req = rx.iflush(&[]).unwrap();
        assert!(rx.test(req).unwrap().is_ready());
    }

    #[test]
    fn test_deregister_blocked_while_in_flight() {
        let (mut tx, _rx) = endpoint_pair(1);
        let mr = tx.register(RegionMemory::Host(filled(64, 6))).unwrap();
        let req = tx.isend(mr, 64, 0).unwrap();

        assert!(matches!(
            tx.deregister(mr).unwrap_err(),
            NetError::RegionInUse { .. }
        ));
        assert!(tx.test(req).unwrap().is_pending());
        assert!(tx.test(req).unwrap().is_ready());
        assert!(tx.deregister(mr).is_ok());
    }

    #[test]
    fn test_close_requires_drained_requests() {
        let (mut tx, _rx) = endpoint_pair(1);
        let mr = tx.register(RegionMemory::Host(filled(64, 7))).unwrap();
        let req = tx.isend(mr, 64, 0).unwrap();

        assert!(matches!(
            tx.close().unwrap_err(),
            NetError::RequestsOutstanding { outstanding: 1 }
        ));
        assert!(tx.test(req).unwrap().is_pending());
        assert!(tx.test(req).unwrap().is_ready());
        tx.close().unwrap();
        tx.close().unwrap();
        assert!(tx.is_closed());
    }

    #[test]
    fn test_peer_gone_fails_unmatched_receive() {
        let (mut tx, mut rx) = endpoint_pair(0);
        let mr = rx.register(RegionMemory::Host(vec![0u8; 64])).unwrap();
        let req = rx
            .irecv(&[RecvEntry {
                mr,
                size: 64,
                tag: 0,
            }])
            .unwrap();
        assert!(rx.test(req).unwrap().is_pending());

        tx.close().unwrap();
        let err = rx.test(req).unwrap_err();
        assert!(matches!(err, NetError::ChannelClosed));
    }

    #[test]
    fn test_delivered_frames_survive_peer_close() {
        let (mut tx, mut rx) = endpoint_pair(0);
        let data = filled(64, 8);
        let smr = tx.register(RegionMemory::Host(data.clone())).unwrap();
        let rmr = rx.register(RegionMemory::Host(vec![0u8; 64])).unwrap();

        let sreq = tx.isend(smr, 64, 5).unwrap();
        tx.test(sreq).unwrap();
        tx.deregister(smr).unwrap();
        tx.close().unwrap();

        // The frame was already delivered; the receive still completes.
        let rreq = rx
            .irecv(&[RecvEntry {
                mr: rmr,
                size: 64,
                tag: 5,
            }])
            .unwrap();
        assert!(rx.test(rreq).unwrap().is_ready());
        assert_eq!(rx.host_region(rmr).unwrap(), &data[..]);
    }

    #[test]
    fn test_request_limit_enforced() {
        let (mut tx, _rx) = endpoint_pair(usize::MAX);
        let mr = tx.register(RegionMemory::Host(filled(8, 9))).unwrap();
        for _ in 0..8 {
            tx.isend(mr, 8, 0).unwrap();
        }
        let err = tx.isend(mr, 8, 0).unwrap_err();
        assert!(matches!(err, NetError::RequestLimitExceeded { limit: 8 }));
    }

    #[test]
    fn test_send_size_exceeding_region_rejected() {
        let (mut tx, _rx) = endpoint_pair(0);
        let mr = tx.register(RegionMemory::Host(filled(64, 10))).unwrap();
        let err = tx.isend(mr, 65, 0).unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));
        assert_eq!(tx.outstanding(), 0);
        assert!(tx.deregister(mr).is_ok());
    }

    #[test]
    fn test_zero_byte_send() {
        let (mut tx, mut rx) = endpoint_pair(0);
        let smr = tx.register(RegionMemory::Host(vec![0xAB])).unwrap();
        let rmr = rx.register(RegionMemory::Host(vec![0xCD])).unwrap();

        let rreq = rx
            .irecv(&[RecvEntry {
                mr: rmr,
                size: 0,
                tag: 4,
            }])
            .unwrap();
        let sreq = tx.isend(smr, 0, 4).unwrap();
        tx.test(sreq).unwrap();

        let done = rx.test(rreq).unwrap();
        assert_eq!(done.ready().unwrap().sizes, vec![0]);
        // The region's bytes are untouched.
        assert_eq!(rx.host_region(rmr).unwrap(), &[0xCD]);
    }

    #[test]
    fn test_matching_succeeds_under_tight_unclaimed_bound() {
        let (mut tx, mut rx) = endpoint_pair_bounded(0, 1);
        let data = filled(64, 11);
        let smr = tx.register(RegionMemory::Host(data.clone())).unwrap();
        let rmr = rx.register(RegionMemory::Host(vec![0u8; 64])).unwrap();

        let rreq = rx
            .irecv(&[RecvEntry {
                mr: rmr,
                size: 64,
                tag: 7,
            }])
            .unwrap();
        let sreq = tx.isend(smr, 64, 7).unwrap();
        tx.test(sreq).unwrap();

        // The matching frame fills the whole unclaimed budget and must
        // still be claimed, not reported as overflow.
        let done = rx.test(rreq).unwrap();
        assert_eq!(done.ready().unwrap().sizes, vec![64]);
        assert_eq!(rx.host_region(rmr).unwrap(), &data[..]);
    }

    #[test]
    fn test_full_unclaimed_queue_leaves_retired_requests_observable() {
        let (mut tx, mut rx) = endpoint_pair_bounded(0, 1);
        let smr = tx.register(RegionMemory::Host(filled(8, 12))).unwrap();

        let freq = rx.iflush(&[]).unwrap();
        assert!(rx.test(freq).unwrap().is_ready());

        // Two frames nothing claims: one fills the queue, one stays in
        // the channel as backpressure.
        for tag in [100, 101] {
            let sreq = tx.isend(smr, 8, tag).unwrap();
            tx.test(sreq).unwrap();
        }
        assert!(rx.test(freq).unwrap().is_ready());
    }

    #[test]
    fn test_unmatchable_overflow_faults_receive() {
        let (mut tx, mut rx) = endpoint_pair_bounded(0, 1);
        let smr = tx.register(RegionMemory::Host(filled(8, 13))).unwrap();
        let rmr = rx.register(RegionMemory::Host(vec![0u8; 8])).unwrap();

        for tag in [100, 101] {
            let sreq = tx.isend(smr, 8, tag).unwrap();
            tx.test(sreq).unwrap();
        }

        let rreq = rx
            .irecv(&[RecvEntry {
                mr: rmr,
                size: 8,
                tag: 5,
            }])
            .unwrap();
        let err = rx.test(rreq).unwrap_err();
        assert!(matches!(err, NetError::Transport(_)));
        // The fault is sticky and the region is released.
        assert!(rx.test(rreq).is_err());
        assert!(rx.deregister(rmr).is_ok());
    }

    #[test]
    fn test_endpoint_debug_shows_shape_only() {
        let (tx, rx) = endpoint_pair(0);
        let dbg = format!("{tx:?}");
        assert!(dbg.contains("SendComm"));
        assert!(dbg.contains("outstanding"));
        let dbg = format!("{rx:?}");
        assert!(dbg.contains("RecvComm"));
    }

    #[test]
    fn test_operations_rejected_after_close() {
        let (mut tx, _rx) = endpoint_pair(0);
        tx.close().unwrap();
        let err = tx.register(RegionMemory::Host(vec![0u8; 8])).unwrap_err();
        assert!(matches!(err, NetError::CommClosed));
    }
}
