//! Device-side state of the simulated accelerator
//!
//! Buffer storage lives here, apart from the host copies held by
//! [`DeviceBuffer`](crate::buffer::DeviceBuffer). Registered images and open
//! contexts are tracked alongside so a submission can be validated against
//! the program its context was created for.

use crate::device::{BoHandle, ContextId, GroupId, MemoryKind};
use crate::error::{Result, RuntimeError};
use crate::image::ProgramImage;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// One device allocation
#[derive(Debug)]
pub(crate) struct Allocation {
    pub(crate) bytes: Vec<u8>,
    pub(crate) group: GroupId,
    pub(crate) kind: MemoryKind,
}

/// Memory, images, and contexts of one simulated device
#[derive(Debug)]
pub(crate) struct DeviceState {
    buffers: HashMap<u64, Allocation>,
    images: HashMap<Uuid, Arc<ProgramImage>>,
    contexts: HashMap<u64, Uuid>,
    next_buffer_id: u64,
    next_context_id: u64,
    next_run_id: u64,
}

impl DeviceState {
    pub(crate) fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            images: HashMap::new(),
            contexts: HashMap::new(),
            next_buffer_id: 1,
            next_context_id: 1,
            next_run_id: 0,
        }
    }

    pub(crate) fn allocate(&mut self, size: usize, group: GroupId, kind: MemoryKind) -> BoHandle {
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(
            id,
            Allocation {
                bytes: vec![0u8; size],
                group,
                kind,
            },
        );
        BoHandle::new(id)
    }

    pub(crate) fn free(&mut self, handle: BoHandle) -> Result<()> {
        self.buffers
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(RuntimeError::InvalidBufferHandle(handle))
    }

    pub(crate) fn buffer(&self, handle: BoHandle) -> Result<&Allocation> {
        self.buffers
            .get(&handle.id())
            .ok_or(RuntimeError::InvalidBufferHandle(handle))
    }

    pub(crate) fn buffer_mut(&mut self, handle: BoHandle) -> Result<&mut Allocation> {
        self.buffers
            .get_mut(&handle.id())
            .ok_or(RuntimeError::InvalidBufferHandle(handle))
    }

    pub(crate) fn write(&mut self, handle: BoHandle, data: &[u8]) -> Result<()> {
        let alloc = self.buffer_mut(handle)?;
        if data.len() != alloc.bytes.len() {
            return Err(RuntimeError::size_mismatch(alloc.bytes.len(), data.len()));
        }
        alloc.bytes.copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, handle: BoHandle, data: &mut [u8]) -> Result<()> {
        let alloc = self.buffer(handle)?;
        if data.len() != alloc.bytes.len() {
            return Err(RuntimeError::size_mismatch(alloc.bytes.len(), data.len()));
        }
        data.copy_from_slice(&alloc.bytes);
        Ok(())
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn register_image(&mut self, image: &ProgramImage) {
        self.images
            .entry(image.uuid)
            .or_insert_with(|| Arc::new(image.clone()));
    }

    pub(crate) fn create_context(&mut self, image: Uuid) -> Result<ContextId> {
        if !self.images.contains_key(&image) {
            return Err(RuntimeError::ContextCreation(format!("image {image} is not registered")));
        }
        let id = self.next_context_id;
        self.next_context_id += 1;
        self.contexts.insert(id, image);
        Ok(ContextId(id))
    }

    pub(crate) fn destroy_context(&mut self, ctx: ContextId) -> Result<()> {
        self.contexts
            .remove(&ctx.0)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ContextCreation(format!("unknown context {ctx}")))
    }

    /// Image a context was created against
    pub(crate) fn context_image(&self, ctx: ContextId) -> Result<Arc<ProgramImage>> {
        let uuid = self
            .contexts
            .get(&ctx.0)
            .ok_or_else(|| RuntimeError::ContextCreation(format!("unknown context {ctx}")))?;
        self.images
            .get(uuid)
            .cloned()
            .ok_or_else(|| RuntimeError::ContextCreation(format!("image {uuid} of {ctx} was unregistered")))
    }

    pub(crate) fn next_run_id(&mut self) -> u64 {
        let id = self.next_run_id;
        self.next_run_id += 1;
        id
    }

    pub(crate) fn runs_submitted(&self) -> u64 {
        self.next_run_id
    }
}
