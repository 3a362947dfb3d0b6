//! The non-blocking polling primitive.
//!
//! Every operation that could otherwise block (`accept`, `connect`, `test`)
//! returns `Result<Progress<T>, NetError>`: success, "not ready yet", or a
//! hard error. The host re-invokes pending operations; the backend never
//! sleeps or blocks on its behalf.

/// Outcome of one poll of a non-blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Progress<T> {
    /// The operation finished and produced a value.
    Ready(T),
    /// No result yet; poll again.
    Pending,
}

impl<T> Progress<T> {
    /// Whether this poll produced a value.
    pub fn is_ready(&self) -> bool {
        matches!(self, Progress::Ready(_))
    }

    /// Whether the operation needs another poll.
    pub fn is_pending(&self) -> bool {
        matches!(self, Progress::Pending)
    }

    /// Extract the value, if ready.
    pub fn ready(self) -> Option<T> {
        match self {
            Progress::Ready(v) => Some(v),
            Progress::Pending => None,
        }
    }

    /// Map the ready value, preserving `Pending`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Progress<U> {
        match self {
            Progress::Ready(v) => Progress::Ready(f(v)),
            Progress::Pending => Progress::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready() {
        let p = Progress::Ready(42);
        assert!(p.is_ready());
        assert!(!p.is_pending());
        assert_eq!(p.ready(), Some(42));
    }

    #[test]
    fn test_pending() {
        let p: Progress<i32> = Progress::Pending;
        assert!(p.is_pending());
        assert_eq!(p.ready(), None);
    }

    #[test]
    fn test_map() {
        assert_eq!(Progress::Ready(2).map(|v| v * 3), Progress::Ready(6));
        let p: Progress<i32> = Progress::Pending;
        assert_eq!(p.map(|v| v * 3), Progress::Pending);
    }
}
