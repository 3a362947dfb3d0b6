use thiserror::Error;

/// Errors surfaced by the network backend.
///
/// "Not ready yet" is deliberately absent: non-blocking operations report it
/// through [`Progress::Pending`](crate::poll::Progress) instead, so a caller
/// can never mistake a normal polling outcome for a failure.
#[derive(Debug, Error)]
pub enum NetError {
    /// A malformed argument that can never succeed (null-equivalent input,
    /// zero-length registration, oversized receive group, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The device index is outside `[0, count)`.
    #[error("device index {index} out of range (device count {count})")]
    DeviceOutOfRange { index: usize, count: usize },

    /// The out-of-band handle payload does not fit in the fixed-size blob.
    #[error("handle payload too large: {size} bytes (max {max})")]
    HandleTooLarge { size: usize, max: usize },

    /// A generation-checked handle referred to a reclaimed slot or to a
    /// different endpoint's table.
    #[error("stale or foreign handle: {0}")]
    StaleHandle(&'static str),

    /// The device exists but does not support the requested memory location.
    #[error("device does not support {0} memory")]
    UnsupportedMemory(&'static str),

    /// Deregistration attempted while requests still reference the region.
    #[error("memory region has {pending} incomplete request(s) referencing it")]
    RegionInUse { pending: u32 },

    /// Close attempted before every issued request reported completion.
    #[error("{outstanding} request(s) still outstanding; drain with test() before close")]
    RequestsOutstanding { outstanding: usize },

    /// The per-endpoint in-flight request bound was hit. This is a caller
    /// error, not a queue: the operation was not enqueued.
    #[error("request limit reached: {limit} request(s) already in flight")]
    RequestLimitExceeded { limit: usize },

    /// `accept` called after the listen context already produced a connection.
    #[error("listen context already produced a connection")]
    AcceptExhausted,

    /// The endpoint was already closed.
    #[error("endpoint is closed")]
    CommClosed,

    /// A second initialization in the same process.
    #[error("backend already initialized in this process")]
    AlreadyInitialized,

    /// A matched send/receive pair disagreed on the transfer size. The data
    /// is neither truncated nor padded; the receive request fails instead.
    #[error("size mismatch on tag {tag}: receive posted {posted} bytes, sender sent {actual}")]
    SizeMismatch { tag: u32, posted: usize, actual: usize },

    /// The transport could not set up a listening endpoint.
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// The transport could not start or resolve a connection attempt.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The out-of-band handshake broke down after it started.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer closed the channel while data was still expected.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// A fault inside the underlying transport. Fatal for the affected
    /// connection; the backend never retries these itself.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Coarse classification of a [`NetError`], mirroring the error taxonomy the
/// host is expected to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The call itself was malformed; retrying identically can never help.
    InvalidArgument,
    /// The call violated the usage contract (double accept, close before
    /// drain, stale handle). Indicates a caller bug.
    InvalidUsage,
    /// The transport failed. Fatal for the connection or request involved;
    /// recovery policy is the host's decision.
    Transport,
}

impl NetError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::InvalidArgument(_)
            | NetError::DeviceOutOfRange { .. }
            | NetError::HandleTooLarge { .. } => ErrorKind::InvalidArgument,

            NetError::StaleHandle(_)
            | NetError::UnsupportedMemory(_)
            | NetError::RegionInUse { .. }
            | NetError::RequestsOutstanding { .. }
            | NetError::RequestLimitExceeded { .. }
            | NetError::AcceptExhausted
            | NetError::CommClosed
            | NetError::AlreadyInitialized => ErrorKind::InvalidUsage,

            NetError::SizeMismatch { .. }
            | NetError::ListenFailed(_)
            | NetError::ConnectFailed(_)
            | NetError::HandshakeFailed(_)
            | NetError::ChannelClosed
            | NetError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Whether this error is fatal for the connection or request it came from.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_device_out_of_range() {
        let err = NetError::DeviceOutOfRange { index: 3, count: 1 };
        assert_eq!(
            err.to_string(),
            "device index 3 out of range (device count 1)"
        );
    }

    #[test]
    fn test_display_size_mismatch() {
        let err = NetError::SizeMismatch {
            tag: 7,
            posted: 4096,
            actual: 2048,
        };
        let s = err.to_string();
        assert!(s.contains("tag 7"));
        assert!(s.contains("4096"));
        assert!(s.contains("2048"));
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            NetError::InvalidArgument("x").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            NetError::DeviceOutOfRange { index: 9, count: 1 }.kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(NetError::AcceptExhausted.kind(), ErrorKind::InvalidUsage);
        assert_eq!(
            NetError::RegionInUse { pending: 1 }.kind(),
            ErrorKind::InvalidUsage
        );
        assert_eq!(NetError::ChannelClosed.kind(), ErrorKind::Transport);
        assert_eq!(
            NetError::Transport("qp fault".into()).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_fatality() {
        assert!(NetError::HandshakeFailed("peer vanished".into()).is_fatal());
        assert!(!NetError::RequestLimitExceeded { limit: 8 }.is_fatal());
        assert!(!NetError::CommClosed.is_fatal());
    }
}
