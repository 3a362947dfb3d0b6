//! Loopback transport configuration.

use serde::{Deserialize, Serialize};

fn default_queue_depth() -> usize {
    64
}

fn default_devices() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Frames buffered per direction before `try_send` starts handing
    /// frames back.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Number of loopback devices to advertise. Each is independent; a
    /// handle minted on one cannot be connected through another.
    #[serde(default = "default_devices")]
    pub devices: usize,

    /// Advertise accelerator-memory support on every device. Registration
    /// of device regions then succeeds, which the test suites use to probe
    /// the engine's handling of memory it cannot touch.
    #[serde(default)]
    pub device_memory: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            queue_depth: default_queue_depth(),
            devices: default_devices(),
            device_memory: false,
        }
    }
}
