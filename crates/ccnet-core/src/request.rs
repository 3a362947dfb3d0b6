//! The request tracker.
//!
//! Every issued send, receive-group, or flush is one slot in a per-endpoint
//! table, bounded by the endpoint's concurrency limit. Completion reporting
//! is exactly-once: the slot transitions to `Retired` the first time `test`
//! reports done, the retired result is held so an accidental extra `test`
//! observes the identical answer, and the slot is only reused (with a new
//! generation) by a later issue — after which the stale id is rejected.

use crate::conn::CommId;
use crate::error::NetError;
use crate::mr::MrHandle;
use crate::transport::Frame;

/// Generation-checked id of one in-flight request, scoped to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId {
    pub(crate) comm: CommId,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// What kind of operation a request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Send,
    Recv,
    Flush,
}

/// Why a request failed. Stored instead of a [`NetError`] so the identical
/// error can be re-surfaced on every poll of the failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureCause {
    SizeMismatch {
        tag: u32,
        posted: usize,
        actual: usize,
    },
    ChannelClosed,
    /// A transport fault already surfaced in full on the poll that observed
    /// it; re-polls see this marker.
    Transport,
}

impl FailureCause {
    pub(crate) fn to_error(self) -> NetError {
        match self {
            FailureCause::SizeMismatch {
                tag,
                posted,
                actual,
            } => NetError::SizeMismatch {
                tag,
                posted,
                actual,
            },
            FailureCause::ChannelClosed => NetError::ChannelClosed,
            FailureCause::Transport => {
                NetError::Transport("transport fault previously reported on this request".into())
            }
        }
    }

    pub(crate) fn of(error: &NetError) -> Self {
        match error {
            NetError::ChannelClosed => FailureCause::ChannelClosed,
            _ => FailureCause::Transport,
        }
    }
}

/// One entry of a receive group, matched independently by exact tag.
#[derive(Debug)]
pub(crate) struct RecvSlot {
    pub mr: MrHandle,
    pub size: usize,
    pub tag: u32,
    pub done: bool,
}

/// Transport-facing progress state of one request.
#[derive(Debug)]
pub(crate) enum RequestState {
    /// A send whose frame has not yet been accepted by the channel.
    SendPending { frame: Option<Frame>, size: usize },
    /// A receive group with per-entry completion.
    RecvPending { entries: Vec<RecvSlot> },
    /// A visibility barrier; completes on the next poll once posted.
    FlushPending { sizes: Vec<usize> },
    /// Done; result reported and held for idempotent re-observation.
    Retired { sizes: Vec<usize> },
    /// Failed; the same error is surfaced on every subsequent poll.
    Fault { cause: FailureCause },
}

impl RequestState {
    fn is_live(&self) -> bool {
        matches!(
            self,
            RequestState::SendPending { .. }
                | RequestState::RecvPending { .. }
                | RequestState::FlushPending { .. }
        )
    }
}

#[derive(Debug)]
pub(crate) struct Request {
    pub kind: RequestKind,
    pub state: RequestState,
    /// Regions to unpin when this request retires or faults.
    pub pinned: Vec<MrHandle>,
}

struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Per-endpoint table of issued requests.
pub(crate) struct RequestTable {
    comm: CommId,
    slots: Vec<Slot>,
    limit: usize,
    live: usize,
}

impl RequestTable {
    pub(crate) fn new(comm: CommId, limit: usize) -> Self {
        Self {
            comm,
            slots: Vec::new(),
            limit,
            live: 0,
        }
    }

    /// Requests issued but not yet reported complete or failed. Close is
    /// only legal once this reaches zero.
    pub(crate) fn outstanding(&self) -> usize {
        self.live
    }

    /// Issue a new request. Hitting the concurrency bound is a caller
    /// error; nothing is queued.
    pub(crate) fn issue(
        &mut self,
        kind: RequestKind,
        state: RequestState,
        pinned: Vec<MrHandle>,
    ) -> Result<RequestId, NetError> {
        debug_assert!(state.is_live(), "requests are issued in a live state");
        if self.live >= self.limit {
            return Err(NetError::RequestLimitExceeded { limit: self.limit });
        }

        let request = Request {
            kind,
            state,
            pinned,
        };
        // Reuse a free or retired slot before growing the table.
        let reusable = self.slots.iter().position(|s| {
            s.request
                .as_ref()
                .map_or(true, |r| !r.state.is_live())
        });
        let slot = match reusable {
            Some(i) => {
                self.slots[i].generation = self.slots[i].generation.wrapping_add(1);
                self.slots[i].request = Some(request);
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    request: Some(request),
                });
                self.slots.len() - 1
            }
        };
        self.live += 1;
        Ok(RequestId {
            comm: self.comm,
            slot: slot as u32,
            generation: self.slots[slot].generation,
        })
    }

    /// Look up a request for the polling path.
    pub(crate) fn lookup_mut(&mut self, id: RequestId) -> Result<&mut Request, NetError> {
        let slot = self.check(id)?;
        self.slots[slot]
            .request
            .as_mut()
            .ok_or(NetError::StaleHandle("request slot is empty"))
    }

    /// Transition a live request to `Retired` with its final sizes.
    pub(crate) fn complete(&mut self, id: RequestId, sizes: Vec<usize>) -> Result<(), NetError> {
        self.finish(id, RequestState::Retired { sizes })
    }

    /// Transition a live request to `Fault`.
    pub(crate) fn fail(&mut self, id: RequestId, cause: FailureCause) -> Result<(), NetError> {
        self.finish(id, RequestState::Fault { cause })
    }

    fn finish(&mut self, id: RequestId, terminal: RequestState) -> Result<(), NetError> {
        let request = self.lookup_mut(id)?;
        debug_assert!(request.state.is_live(), "finishing a finished request");
        if request.state.is_live() {
            request.state = terminal;
            self.live -= 1;
        }
        Ok(())
    }

    fn check(&self, id: RequestId) -> Result<usize, NetError> {
        if id.comm != self.comm {
            return Err(NetError::StaleHandle(
                "request id belongs to a different endpoint",
            ));
        }
        let slot = id.slot as usize;
        match self.slots.get(slot) {
            Some(s) if s.generation == id.generation => Ok(slot),
            Some(_) => Err(NetError::StaleHandle("request id generation expired")),
            None => Err(NetError::StaleHandle("request id slot out of range")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::alloc_comm_id;

    fn flush_state() -> RequestState {
        RequestState::FlushPending { sizes: vec![0] }
    }

    #[test]
    fn test_issue_and_complete() {
        let mut table = RequestTable::new(alloc_comm_id(), 4);
        let id = table
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap();
        assert_eq!(table.outstanding(), 1);

        table.complete(id, vec![128]).unwrap();
        assert_eq!(table.outstanding(), 0);

        // The retired result stays observable under the same id.
        match &table.lookup_mut(id).unwrap().state {
            RequestState::Retired { sizes } => assert_eq!(sizes, &vec![128]),
            _ => panic!("expected retired state"),
        }
    }

    #[test]
    fn test_kind_recorded_on_issue() {
        let mut table = RequestTable::new(alloc_comm_id(), 2);
        let id = table
            .issue(RequestKind::Recv, flush_state(), Vec::new())
            .unwrap();
        assert_eq!(table.lookup_mut(id).unwrap().kind, RequestKind::Recv);
    }

    #[test]
    fn test_limit_is_a_hard_bound() {
        let mut table = RequestTable::new(alloc_comm_id(), 2);
        let _a = table
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap();
        let _b = table
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap();

        let err = table
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap_err();
        assert!(matches!(err, NetError::RequestLimitExceeded { limit: 2 }));
    }

    #[test]
    fn test_retired_slot_reuse_invalidates_old_id() {
        let mut table = RequestTable::new(alloc_comm_id(), 1);
        let old = table
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap();
        table.complete(old, vec![0]).unwrap();

        // Retiring freed capacity; the next issue reuses the slot.
        let fresh = table
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap();
        assert_eq!(fresh.slot, old.slot);
        assert_ne!(fresh.generation, old.generation);

        let err = table.lookup_mut(old).unwrap_err();
        assert!(matches!(err, NetError::StaleHandle(_)));
    }

    #[test]
    fn test_failed_request_keeps_cause() {
        let mut table = RequestTable::new(alloc_comm_id(), 1);
        let id = table
            .issue(RequestKind::Recv, flush_state(), Vec::new())
            .unwrap();
        table.fail(id, FailureCause::ChannelClosed).unwrap();
        assert_eq!(table.outstanding(), 0);

        match &table.lookup_mut(id).unwrap().state {
            RequestState::Fault { cause } => {
                assert_eq!(*cause, FailureCause::ChannelClosed);
            }
            _ => panic!("expected fault state"),
        }
    }

    #[test]
    fn test_cross_endpoint_id_rejected() {
        let mut table_a = RequestTable::new(alloc_comm_id(), 1);
        let mut table_b = RequestTable::new(alloc_comm_id(), 1);
        let id = table_a
            .issue(RequestKind::Flush, flush_state(), Vec::new())
            .unwrap();
        assert!(matches!(
            table_b.lookup_mut(id).unwrap_err(),
            NetError::StaleHandle(_)
        ));
    }

    #[test]
    fn test_failure_cause_to_error() {
        let err = FailureCause::SizeMismatch {
            tag: 7,
            posted: 4096,
            actual: 2048,
        }
        .to_error();
        assert!(matches!(err, NetError::SizeMismatch { tag: 7, .. }));
    }
}
