//! Backend lifecycle.
//!
//! The host initializes the backend once per process and keeps the returned
//! context alive for as long as it uses the network. Everything hangs off
//! the context; there is no other global state.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::NetConfig;
use crate::engine::Engine;
use crate::error::NetError;
use crate::transport::Transport;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// A fully initialized backend. Derefs to its [`Engine`].
pub struct NetContext {
    engine: Engine,
}

impl NetContext {
    /// Initialize the backend. A second call in the same process is a usage
    /// error; a failed call releases the guard so the host may retry.
    pub fn init(transport: Box<dyn Transport>, config: NetConfig) -> Result<Self, NetError> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyInitialized);
        }
        match Engine::new(transport, config) {
            Ok(engine) => {
                info!(devices = engine.device_count(), "network backend initialized");
                Ok(NetContext { engine })
            }
            Err(err) => {
                INITIALIZED.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Build a context without the process-wide guard. Lets one process host
    /// several independent backends; the test suites rely on this.
    pub fn new_unguarded(transport: Box<dyn Transport>, config: NetConfig) -> Result<Self, NetError> {
        Engine::new(transport, config).map(|engine| NetContext { engine })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Deref for NetContext {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

impl fmt::Debug for NetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetContext")
            .field("engine", &self.engine)
            .finish()
    }
}
