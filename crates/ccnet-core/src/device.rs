//! Device descriptions and the capability reporter.
//!
//! A [`DeviceProps`] record is computed once when the backend initializes and
//! is immutable afterwards, so the host's topology and path-selection logic
//! can query it repeatedly and concurrently without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NetError;

/// Pointer-support flag: the device can move data from/to host memory.
pub const PTR_HOST: u32 = 1 << 0;
/// Pointer-support flag: the device can move data from/to accelerator memory.
pub const PTR_DEVICE: u32 = 1 << 1;

/// Sentinel for "no device-offload path available".
pub const OFFLOAD_VERSION_INVALID: u32 = 0;

/// Where a registered buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Ordinary host memory.
    Host,
    /// Accelerator (device) memory; completion of a transfer does not imply
    /// visibility to compute until a flush request completes.
    Device,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Host => write!(f, "host"),
            MemoryKind::Device => write!(f, "device"),
        }
    }
}

/// Kind of device-offload path a device exposes, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffloadKind {
    /// No offload path; all transfers go through the transfer engine.
    None,
    /// A host-mediated offload path.
    Host,
}

/// Static properties of one logical transport endpoint.
///
/// The field set mirrors the fixed-layout properties record the host library
/// consumes at startup: identity, pointer support, a link speed estimate for
/// path selection, and the connection/receive concurrency bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProps {
    /// Human-readable device name (e.g. "loopback0").
    pub name: String,
    /// Path identifier in PCI-style notation, used for topology detection.
    pub path: String,
    /// Globally-unique device id.
    pub guid: u64,
    /// Bitmask of supported memory locations ([`PTR_HOST`], [`PTR_DEVICE`]).
    pub ptr_support: u32,
    /// Whether a registration on this device is valid on every device.
    pub reg_is_global: bool,
    /// Link speed estimate in Mbps. Must be positive.
    pub speed_mbps: u32,
    /// Latency estimate in microseconds; 0 means "use the default model".
    pub latency_us: u32,
    /// Port number on the device.
    pub port: u16,
    /// Maximum concurrent connections. Must be at least 1.
    pub max_comms: u32,
    /// Maximum simultaneous receives per connection. Must be at least 1.
    pub max_recvs: u32,
    /// Device-offload path kind; [`OffloadKind::None`] if absent.
    pub offload_kind: OffloadKind,
    /// Device-offload protocol version; [`OFFLOAD_VERSION_INVALID`] if absent.
    pub offload_version: u32,
}

impl DeviceProps {
    /// Whether the device can address buffers of the given kind.
    pub fn supports(&self, kind: MemoryKind) -> bool {
        let flag = match kind {
            MemoryKind::Host => PTR_HOST,
            MemoryKind::Device => PTR_DEVICE,
        };
        self.ptr_support & flag != 0
    }

    fn validate(&self) -> Result<(), NetError> {
        if self.name.is_empty() {
            return Err(NetError::InvalidArgument("device name must not be empty"));
        }
        if self.max_comms == 0 {
            return Err(NetError::InvalidArgument(
                "device must allow at least one connection",
            ));
        }
        if self.max_recvs == 0 {
            return Err(NetError::InvalidArgument(
                "device must allow at least one simultaneous receive",
            ));
        }
        if self.speed_mbps == 0 {
            return Err(NetError::InvalidArgument("device speed must be positive"));
        }
        if self.ptr_support & PTR_HOST == 0 {
            return Err(NetError::InvalidArgument(
                "device must support host memory",
            ));
        }
        Ok(())
    }
}

/// The capability reporter: an immutable list of devices advertised by the
/// transport, validated once at construction.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<DeviceProps>,
}

impl DeviceRegistry {
    /// Build the registry, rejecting any device that violates the property
    /// invariants (`max_comms >= 1`, `speed > 0`, host memory supported).
    pub fn new(devices: Vec<DeviceProps>) -> Result<Self, NetError> {
        for dev in &devices {
            dev.validate()?;
        }
        Ok(Self { devices })
    }

    /// Number of devices.
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Properties of the device at `index`.
    ///
    /// An out-of-range index is an invalid-argument error, never a panic.
    pub fn props(&self, index: usize) -> Result<&DeviceProps, NetError> {
        self.devices.get(index).ok_or(NetError::DeviceOutOfRange {
            index,
            count: self.devices.len(),
        })
    }
}
