//! Device trait implemented by every accelerator the host can offload to

use super::types::{BoHandle, ContextId, GroupId, KernelArg, MemoryKind, Opcode, RunCompletion};
use crate::error::Result;
use crate::image::ProgramImage;
use uuid::Uuid;

/// Accelerator behind the offload runtime
///
/// A device owns memory that is separate from host memory. Data crosses only
/// through [`sync_to_device`](Device::sync_to_device) and
/// [`sync_from_device`](Device::sync_from_device); the device never reads or
/// writes host memory on its own.
///
/// # Lifecycle
///
/// ```text
/// register_image ──► create_context ──► submit ──► (completion) ──► submit ...
///                          │
///                          └─► destroy_context
/// ```
///
/// Methods take `&self`; implementations keep their state behind interior
/// locks so a device can be shared as `Arc<dyn Device>` between host code and
/// the runs it is executing.
pub trait Device: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    // ============================================================================================
    // Program Management
    // ============================================================================================

    /// Make a program image known to the device.
    ///
    /// Registering the same image twice is not an error.
    fn register_image(&self, image: &ProgramImage) -> Result<()>;

    /// Create an execution context scoped to one registered image.
    ///
    /// # Errors
    ///
    /// Returns `ContextCreation` if the image was never registered.
    fn create_context(&self, image: Uuid) -> Result<ContextId>;

    /// Tear down a context. Runs already submitted are unaffected.
    fn destroy_context(&self, ctx: ContextId) -> Result<()>;

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate `size` bytes of zeroed device memory.
    fn allocate(&self, size: usize, group: GroupId, kind: MemoryKind) -> Result<BoHandle>;

    /// Free a buffer previously returned by [`allocate`](Device::allocate).
    fn free(&self, handle: BoHandle) -> Result<()>;

    /// Size of a buffer in bytes
    fn buffer_size(&self, handle: BoHandle) -> Result<usize>;

    /// Copy host bytes into device memory. `data` must match the buffer size.
    fn sync_to_device(&self, handle: BoHandle, data: &[u8]) -> Result<()>;

    /// Copy device memory into host bytes. `data` must match the buffer size.
    fn sync_from_device(&self, handle: BoHandle, data: &mut [u8]) -> Result<()>;

    // ============================================================================================
    // Execution
    // ============================================================================================

    /// Submit one run of `kernel` and return without waiting.
    ///
    /// Argument validation errors are returned here; failures during
    /// execution are reported through the returned [`RunCompletion`].
    fn submit(&self, ctx: ContextId, kernel: &str, opcode: Opcode, args: &[KernelArg]) -> Result<RunCompletion>;
}
