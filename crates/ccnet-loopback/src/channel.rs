//! The in-process frame channel.
//!
//! A connection is two [`Pipe`]s, one per direction, shared between the two
//! endpoint halves. A pipe is a bounded frame queue plus a closed flag; the
//! flag flips when the writing side goes away so the reader can distinguish
//! "nothing yet" from "nothing ever again".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ccnet_core::error::NetError;
use ccnet_core::transport::{Channel, Frame};
use parking_lot::Mutex;

pub(crate) struct Pipe {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Pipe {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Pipe {
            frames: Mutex::new(VecDeque::new()),
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    fn push(&self, frame: Frame) -> Result<Option<Frame>, NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::ChannelClosed);
        }
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return Ok(Some(frame));
        }
        frames.push_back(frame);
        Ok(None)
    }

    fn pop(&self) -> Result<Option<Frame>, NetError> {
        if let Some(frame) = self.frames.lock().pop_front() {
            return Ok(Some(frame));
        }
        // Frames delivered before the close stay readable; only an empty
        // closed pipe reports end of stream.
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::ChannelClosed);
        }
        Ok(None)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One endpoint's half of a connection.
pub(crate) struct LoopbackChannel {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
    closed_local: bool,
}

impl LoopbackChannel {
    /// Build both halves of a connection over a fresh pair of pipes.
    pub(crate) fn pair(queue_depth: usize) -> (LoopbackChannel, LoopbackChannel) {
        let a = Pipe::new(queue_depth);
        let b = Pipe::new(queue_depth);
        let active = LoopbackChannel {
            tx: a.clone(),
            rx: b.clone(),
            closed_local: false,
        };
        let passive = LoopbackChannel {
            tx: b,
            rx: a,
            closed_local: false,
        };
        (active, passive)
    }
}

impl Channel for LoopbackChannel {
    fn try_send(&mut self, frame: Frame) -> Result<Option<Frame>, NetError> {
        if self.closed_local {
            return Err(NetError::ChannelClosed);
        }
        self.tx.push(frame)
    }

    fn try_recv(&mut self) -> Result<Option<Frame>, NetError> {
        if self.closed_local {
            return Err(NetError::ChannelClosed);
        }
        self.rx.pop()
    }

    fn close(&mut self) {
        if !self.closed_local {
            self.closed_local = true;
            // The peer reads our tx pipe; closing it is their end-of-stream.
            self.tx.close();
            self.rx.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed_local
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.close();
    }
}
