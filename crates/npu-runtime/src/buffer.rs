//! Host-owned buffers mirrored on a device
//!
//! A [`DeviceBuffer`] owns host memory and one device allocation of the same
//! size. The two copies are independent: writes become visible to the other
//! side only through [`DeviceBuffer::sync`].
//!
//! # Sync discipline
//!
//! - every buffer the host writes must be synced [`ToDevice`] before the run
//!   that reads it is submitted
//! - every buffer the host reads after a run must be synced [`FromDevice`]
//!   after that run has been waited on
//!
//! Skipping either step is not detected. The run sees stale device memory or
//! the host sees stale host memory, with no error raised.
//!
//! [`ToDevice`]: SyncDirection::ToDevice
//! [`FromDevice`]: SyncDirection::FromDevice
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────┐
//! │ logical region (verified)    │ trace (optional) │
//! └──────────────────────────────┴──────────────────┘
//! 0                         logical_size          size
//! ```

use crate::device::{BoHandle, Device, GroupId, MemoryKind, SyncDirection};
use crate::error::{Result, RuntimeError};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use std::time::Instant;

const LINE_BYTES: usize = 64;

/// Cache-line aligned storage unit for host memory
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct Line([u8; LINE_BYTES]);

// SAFETY: a byte array with no padding; every bit pattern is valid.
unsafe impl Zeroable for Line {}
unsafe impl Pod for Line {}

/// Host memory mirrored on a device
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    handle: BoHandle,
    host: Vec<Line>,
    size: usize,
    logical_size: usize,
    group: GroupId,
    kind: MemoryKind,
}

impl DeviceBuffer {
    /// Allocate `size` zeroed bytes on both sides.
    pub fn allocate(device: &Arc<dyn Device>, size: usize, group: GroupId, kind: MemoryKind) -> Result<Self> {
        Self::allocate_with_trace(device, size, 0, group, kind)
    }

    /// Allocate a logical region of `size` bytes followed by a trace region
    /// of `trace_size` bytes.
    pub fn allocate_with_trace(
        device: &Arc<dyn Device>,
        size: usize,
        trace_size: usize,
        group: GroupId,
        kind: MemoryKind,
    ) -> Result<Self> {
        let total = size + trace_size;
        let handle = device.allocate(total, group, kind)?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            host: vec![Line::zeroed(); total.div_ceil(LINE_BYTES)],
            size: total,
            logical_size: size,
            group,
            kind,
        })
    }

    pub fn handle(&self) -> BoHandle {
        self.handle
    }

    /// Total bytes, trace region included
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of the logical region
    pub fn logical_size(&self) -> usize {
        self.logical_size
    }

    pub fn trace_size(&self) -> usize {
        self.size - self.logical_size
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Whole host memory
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Line, u8>(&self.host)[..self.size]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<Line, u8>(&mut self.host)[..self.size]
    }

    /// Host bytes of the trace region
    pub fn trace(&self) -> &[u8] {
        &self.bytes()[self.logical_size..]
    }

    /// Typed view of the logical region
    ///
    /// # Errors
    ///
    /// `SizeMismatch` when the logical size is not a whole number of `T`.
    pub fn map<T: Pod>(&self) -> Result<&[T]> {
        let logical = &self.bytes()[..self.logical_size];
        bytemuck::try_cast_slice(logical)
            .map_err(|_| RuntimeError::size_mismatch(round_down::<T>(self.logical_size), self.logical_size))
    }

    /// Mutable typed view of the logical region
    pub fn map_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        let logical_size = self.logical_size;
        let logical = &mut self.bytes_mut()[..logical_size];
        bytemuck::try_cast_slice_mut(logical)
            .map_err(|_| RuntimeError::size_mismatch(round_down::<T>(logical_size), logical_size))
    }

    /// Copy `src` into the front of the logical region.
    pub fn write<T: Pod>(&mut self, src: &[T]) -> Result<()> {
        let src: &[u8] = bytemuck::cast_slice(src);
        if src.len() > self.logical_size {
            return Err(RuntimeError::size_mismatch(self.logical_size, src.len()));
        }
        self.bytes_mut()[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Blocking copy of the whole buffer in `direction`.
    #[tracing::instrument(skip(self), fields(bo = %self.handle, bytes = self.size, group = %self.group))]
    pub fn sync(&mut self, direction: SyncDirection) -> Result<()> {
        let start = Instant::now();
        let size = self.size;
        match direction {
            SyncDirection::ToDevice => {
                let bytes = &bytemuck::cast_slice::<Line, u8>(&self.host)[..size];
                self.device.sync_to_device(self.handle, bytes)?;
            }
            SyncDirection::FromDevice => {
                let bytes = &mut bytemuck::cast_slice_mut::<Line, u8>(&mut self.host)[..size];
                self.device.sync_from_device(self.handle, bytes)?;
            }
        }
        npu_tracing::performance::record_transfer(size, direction.label(), start.elapsed().as_micros() as u64);
        Ok(())
    }
}

fn round_down<T>(len: usize) -> usize {
    let elem = std::mem::size_of::<T>().max(1);
    len / elem * elem
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device.name())
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("logical_size", &self.logical_size)
            .field("group", &self.group)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.handle) {
            tracing::warn!(bo = %self.handle, error = %err, "failed to free device buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn device() -> (SimDevice, Arc<dyn Device>) {
        let sim = SimDevice::new();
        let shared = sim.clone().into_shared();
        (sim, shared)
    }

    #[test]
    fn test_allocate_and_map() {
        let (_, device) = device();
        let mut buf = DeviceBuffer::allocate(&device, 64 * 2, GroupId(3), MemoryKind::HostOnly).unwrap();
        assert_eq!(buf.size(), 128);
        assert_eq!(buf.map::<i16>().unwrap().len(), 64);

        buf.map_mut::<i16>().unwrap()[5] = -7;
        assert_eq!(buf.map::<i16>().unwrap()[5], -7);
        assert_eq!(&buf.bytes()[10..12], &(-7i16).to_le_bytes());
    }

    #[test]
    fn test_map_rejects_partial_elements() {
        let (_, device) = device();
        let buf = DeviceBuffer::allocate(&device, 6, GroupId(3), MemoryKind::HostOnly).unwrap();
        assert!(matches!(
            buf.map::<f32>(),
            Err(RuntimeError::SizeMismatch { expected: 4, actual: 6 })
        ));
        assert_eq!(buf.map::<i16>().unwrap().len(), 3);
    }

    #[test]
    fn test_trace_region_follows_logical_region() {
        let (_, device) = device();
        let mut buf = DeviceBuffer::allocate_with_trace(&device, 512, 256, GroupId(5), MemoryKind::HostOnly).unwrap();
        assert_eq!(buf.size(), 768);
        assert_eq!(buf.trace_size(), 256);
        assert_eq!(buf.map::<i16>().unwrap().len(), 256);

        buf.bytes_mut()[512] = 0xAB;
        assert_eq!(buf.trace()[0], 0xAB);
        assert_eq!(device.buffer_size(buf.handle()).unwrap(), 768);
    }

    #[test]
    fn test_host_and_device_copies_are_independent() {
        let (_, device) = device();
        let mut buf = DeviceBuffer::allocate(&device, 16, GroupId(3), MemoryKind::HostOnly).unwrap();
        buf.write(&[1u32, 2, 3, 4]).unwrap();

        // Not synced yet: the device still holds zeros.
        let mut device_view = vec![0xFFu8; 16];
        device.sync_from_device(buf.handle(), &mut device_view).unwrap();
        assert!(device_view.iter().all(|&b| b == 0));

        buf.sync(SyncDirection::ToDevice).unwrap();
        device.sync_from_device(buf.handle(), &mut device_view).unwrap();
        assert_eq!(device_view, buf.bytes());

        buf.map_mut::<u32>().unwrap().fill(0);
        buf.sync(SyncDirection::FromDevice).unwrap();
        assert_eq!(buf.map::<u32>().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_write_rejects_oversized_source() {
        let (_, device) = device();
        let mut buf = DeviceBuffer::allocate(&device, 4, GroupId(3), MemoryKind::HostOnly).unwrap();
        assert!(buf.write(&[0u32, 1]).is_err());
    }

    #[test]
    fn test_drop_frees_device_allocation() {
        let (sim, device) = device();
        {
            let _a = DeviceBuffer::allocate(&device, 64, GroupId(3), MemoryKind::HostOnly).unwrap();
            let _b = DeviceBuffer::allocate(&device, 64, GroupId(4), MemoryKind::HostOnly).unwrap();
            assert_eq!(sim.live_buffers(), 2);
        }
        assert_eq!(sim.live_buffers(), 0);
    }
}
