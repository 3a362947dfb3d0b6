//! The memory region registry.
//!
//! Registered buffers live in a per-endpoint slot table. Handles carry the
//! owning endpoint's id plus a slot generation, so a stale handle or a
//! handle from another endpoint is rejected instead of silently
//! dereferenced. A region stays pinned while any incomplete request
//! references it; deregistering a pinned region is a usage error.

use std::fmt;

use crate::conn::CommId;
use crate::device::{DeviceProps, MemoryKind};
use crate::error::NetError;

/// Memory backing a registration.
pub enum RegionMemory {
    /// Host memory owned by the registry for the lifetime of the
    /// registration; returned to the caller on deregistration.
    Host(Vec<u8>),
    /// Accelerator memory described by an opaque device address. The engine
    /// never dereferences it; only offload-capable paths can.
    Device { addr: u64, len: usize },
}

impl RegionMemory {
    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        match self {
            RegionMemory::Host(buf) => buf.len(),
            RegionMemory::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where this memory lives.
    pub fn kind(&self) -> MemoryKind {
        match self {
            RegionMemory::Host(_) => MemoryKind::Host,
            RegionMemory::Device { .. } => MemoryKind::Device,
        }
    }

    fn validate(&self) -> Result<(), NetError> {
        match self {
            RegionMemory::Host(buf) if buf.is_empty() => Err(NetError::InvalidArgument(
                "cannot register a zero-length region",
            )),
            RegionMemory::Device { addr: 0, .. } => Err(NetError::InvalidArgument(
                "cannot register a null device address",
            )),
            RegionMemory::Device { len: 0, .. } => Err(NetError::InvalidArgument(
                "cannot register a zero-length region",
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for RegionMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Buffer contents stay out of diagnostics; show shape only.
        match self {
            RegionMemory::Host(buf) => f.debug_struct("Host").field("len", &buf.len()).finish(),
            RegionMemory::Device { addr, len } => f
                .debug_struct("Device")
                .field("addr", &format_args!("{addr:#x}"))
                .field("len", len)
                .finish(),
        }
    }
}

/// Generation-checked handle to a registered region, scoped to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    pub(crate) comm: CommId,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

struct Region {
    memory: RegionMemory,
    /// Incomplete requests currently referencing this region.
    pinned: u32,
}

struct Slot {
    generation: u32,
    region: Option<Region>,
}

/// Per-endpoint table of registered regions.
pub(crate) struct RegionTable {
    comm: CommId,
    slots: Vec<Slot>,
}

impl RegionTable {
    pub(crate) fn new(comm: CommId) -> Self {
        Self {
            comm,
            slots: Vec::new(),
        }
    }

    /// Register memory, enforcing the device's supported memory locations.
    /// A failed registration allocates nothing the caller could misuse.
    pub(crate) fn register(
        &mut self,
        memory: RegionMemory,
        device: &DeviceProps,
    ) -> Result<MrHandle, NetError> {
        memory.validate()?;
        if !device.supports(memory.kind()) {
            return Err(NetError::UnsupportedMemory(match memory.kind() {
                MemoryKind::Host => "host",
                MemoryKind::Device => "device",
            }));
        }

        let region = Region { memory, pinned: 0 };
        let slot = match self.slots.iter().position(|s| s.region.is_none()) {
            Some(i) => {
                self.slots[i].region = Some(region);
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    region: Some(region),
                });
                self.slots.len() - 1
            }
        };
        Ok(MrHandle {
            comm: self.comm,
            slot: slot as u32,
            generation: self.slots[slot].generation,
        })
    }

    /// Deregister a region, handing its memory back.
    ///
    /// Fails with [`NetError::RegionInUse`] while an incomplete request
    /// still references the region.
    pub(crate) fn deregister(&mut self, handle: MrHandle) -> Result<RegionMemory, NetError> {
        let slot = self.check(handle)?;
        let pinned = self.slots[slot]
            .region
            .as_ref()
            .map(|r| r.pinned)
            .unwrap_or(0);
        if pinned > 0 {
            return Err(NetError::RegionInUse { pending: pinned });
        }
        let region = self.slots[slot].region.take();
        self.slots[slot].generation = self.slots[slot].generation.wrapping_add(1);
        match region {
            Some(r) => Ok(r.memory),
            None => Err(NetError::StaleHandle("region already deregistered")),
        }
    }

    /// Length of the region behind `handle`.
    pub(crate) fn len(&self, handle: MrHandle) -> Result<usize, NetError> {
        self.get(handle).map(|r| r.memory.len())
    }

    /// Where the region behind `handle` lives.
    pub(crate) fn kind(&self, handle: MrHandle) -> Result<MemoryKind, NetError> {
        self.get(handle).map(|r| r.memory.kind())
    }

    /// Read access to a host region's bytes.
    pub(crate) fn host_slice(&self, handle: MrHandle) -> Result<&[u8], NetError> {
        match &self.get(handle)?.memory {
            RegionMemory::Host(buf) => Ok(buf),
            RegionMemory::Device { .. } => Err(NetError::UnsupportedMemory("device")),
        }
    }

    /// Write access to a host region's bytes.
    pub(crate) fn host_slice_mut(&mut self, handle: MrHandle) -> Result<&mut [u8], NetError> {
        let slot = self.check(handle)?;
        match self.slots[slot].region.as_mut() {
            Some(Region {
                memory: RegionMemory::Host(buf),
                ..
            }) => Ok(buf),
            Some(_) => Err(NetError::UnsupportedMemory("device")),
            None => Err(NetError::StaleHandle("region already deregistered")),
        }
    }

    /// Pin the region for the lifetime of a request referencing it.
    pub(crate) fn pin(&mut self, handle: MrHandle) -> Result<(), NetError> {
        let slot = self.check(handle)?;
        match self.slots[slot].region.as_mut() {
            Some(region) => {
                region.pinned += 1;
                Ok(())
            }
            None => Err(NetError::StaleHandle("region already deregistered")),
        }
    }

    /// Release one pin. Pins are balanced by the request tracker, so an
    /// unbalanced unpin indicates an internal bug.
    pub(crate) fn unpin(&mut self, handle: MrHandle) {
        if let Ok(slot) = self.check(handle) {
            if let Some(region) = self.slots[slot].region.as_mut() {
                debug_assert!(region.pinned > 0, "unbalanced region unpin");
                region.pinned = region.pinned.saturating_sub(1);
            }
        }
    }

    /// Number of live registrations.
    pub(crate) fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.region.is_some()).count()
    }

    fn check(&self, handle: MrHandle) -> Result<usize, NetError> {
        if handle.comm != self.comm {
            return Err(NetError::StaleHandle(
                "memory handle belongs to a different endpoint",
            ));
        }
        let slot = handle.slot as usize;
        match self.slots.get(slot) {
            Some(s) if s.generation == handle.generation => Ok(slot),
            Some(_) => Err(NetError::StaleHandle("memory handle generation expired")),
            None => Err(NetError::StaleHandle("memory handle slot out of range")),
        }
    }

    fn get(&self, handle: MrHandle) -> Result<&Region, NetError> {
        let slot = self.check(handle)?;
        self.slots[slot]
            .region
            .as_ref()
            .ok_or(NetError::StaleHandle("region already deregistered"))
    }
}
