//! Program loading, contexts, kernels, and runs
//!
//! ```text
//! ProgramImage ──register──► LoadedProgram ──► HwContext ──resolve──► Kernel ──invoke──► Run ──wait──► RunState
//!                                                                       ▲                              │
//!                                                                       └──────────── invoke again ◄───┘
//! ```
//!
//! A [`Run`] borrows every buffer passed to it. Until it is waited on or
//! dropped, the host cannot sync or mutably map those buffers, which keeps
//! one run at a time per buffer set.

use crate::buffer::DeviceBuffer;
use crate::device::{ContextId, Device, GroupId, KernelArg, Opcode, Poll, RunCompletion, RunState};
use crate::error::{Result, RuntimeError};
use crate::image::{KernelEntry, ProgramImage};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A program image registered with a device
#[derive(Clone)]
pub struct LoadedProgram {
    device: Arc<dyn Device>,
    image: Arc<ProgramImage>,
}

impl LoadedProgram {
    /// Register `image` with `device`.
    #[tracing::instrument(skip_all, fields(device = device.name(), uuid = %image.uuid))]
    pub fn register(device: &Arc<dyn Device>, image: ProgramImage) -> Result<Self> {
        device
            .register_image(&image)
            .map_err(|e| RuntimeError::image_load(format!("registration failed: {e}")))?;
        tracing::info!(kernels = image.kernels.len(), "program image registered");
        Ok(Self {
            device: Arc::clone(device),
            image: Arc::new(image),
        })
    }

    /// Read an image file and register it.
    pub fn load(device: &Arc<dyn Device>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading program image");
        Self::register(device, ProgramImage::load(path)?)
    }

    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

/// Execution context scoped to one loaded program
///
/// The device context is destroyed on drop.
pub struct HwContext {
    device: Arc<dyn Device>,
    image: Arc<ProgramImage>,
    id: ContextId,
}

impl HwContext {
    pub fn new(device: &Arc<dyn Device>, program: &LoadedProgram) -> Result<Self> {
        let id = device.create_context(program.image.uuid)?;
        tracing::info!(ctx = %id, uuid = %program.image.uuid, "hardware context created");
        Ok(Self {
            device: Arc::clone(device),
            image: Arc::clone(&program.image),
            id,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_context(self.id) {
            tracing::warn!(ctx = %self.id, error = %err, "failed to destroy hardware context");
        }
    }
}

/// Argument passed to [`Kernel::invoke`]
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Scalar(u64),
    Buffer(&'a DeviceBuffer),
}

impl Arg<'_> {
    fn lower(&self) -> KernelArg {
        match self {
            Arg::Scalar(value) => KernelArg::Scalar(*value),
            Arg::Buffer(buffer) => KernelArg::Buffer(buffer.handle()),
        }
    }
}

/// Handle to one kernel entry inside a context
pub struct Kernel<'ctx> {
    ctx: &'ctx HwContext,
    entry: KernelEntry,
}

impl<'ctx> Kernel<'ctx> {
    /// Resolve the single entry whose name starts with `prefix`.
    pub fn new(ctx: &'ctx HwContext, prefix: &str) -> Result<Self> {
        let entry = ctx.image.resolve(prefix)?.clone();
        tracing::info!(kernel = %entry.name, prefix, "kernel resolved");
        Ok(Self { ctx, entry })
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn entry(&self) -> &KernelEntry {
        &self.entry
    }

    pub fn context(&self) -> &'ctx HwContext {
        self.ctx
    }

    /// Memory group a buffer argument must be allocated in
    ///
    /// Indices count the opcode as argument 0.
    pub fn group_id(&self, arg_index: usize) -> Result<GroupId> {
        self.entry.group_id(arg_index)
    }

    /// Submit one run and return immediately.
    pub fn invoke<'a>(&self, opcode: Opcode, args: &[Arg<'a>]) -> Result<Run<'a>> {
        let lowered: Vec<KernelArg> = args.iter().map(Arg::lower).collect();
        let completion = self
            .ctx
            .device
            .submit(self.ctx.id, &self.entry.name, opcode, &lowered)?;
        tracing::debug!(run = completion.id(), kernel = %self.entry.name, %opcode, "run submitted");
        Ok(Run {
            completion,
            kernel: self.entry.name.clone(),
            state: RunState::Running,
            _buffers: PhantomData,
        })
    }
}

/// One submitted execution
#[must_use = "a run must be waited on before its outputs are read"]
pub struct Run<'a> {
    completion: RunCompletion,
    kernel: String,
    state: RunState,
    _buffers: PhantomData<&'a DeviceBuffer>,
}

impl Run<'_> {
    pub fn id(&self) -> u64 {
        self.completion.id()
    }

    /// Block until the device reports completion.
    ///
    /// `None` waits indefinitely: a run that hangs on the device blocks the
    /// caller forever. `Some(limit)` gives up after `limit` with
    /// `WaitTimeout`, leaving the run in flight; waiting again is allowed.
    ///
    /// # Errors
    ///
    /// - `WaitTimeout` when `limit` elapses first
    /// - `RunFailed` when the device reports an error or disappears
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<RunState> {
        if !self.state.is_terminal() {
            match self.completion.wait(timeout) {
                Poll::Ready(state) => self.state = state,
                Poll::Pending => {
                    return Err(RuntimeError::WaitTimeout {
                        run: self.id(),
                        kernel: self.kernel.clone(),
                        timeout: timeout.unwrap_or_default(),
                    })
                }
                Poll::Lost => self.state = RunState::Error("device dropped the run without completing it".into()),
            }
        }

        match &self.state {
            RunState::Error(msg) => Err(RuntimeError::run_failed(format!("run {} of '{}': {msg}", self.id(), self.kernel))),
            state => Ok(state.clone()),
        }
    }

    /// Current state without blocking
    pub fn state(&mut self) -> RunState {
        if !self.state.is_terminal() {
            match self.completion.try_poll() {
                Poll::Ready(state) => self.state = state,
                Poll::Pending => {}
                Poll::Lost => self.state = RunState::Error("device dropped the run without completing it".into()),
            }
        }
        self.state.clone()
    }
}

impl Drop for Run<'_> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::warn!(run = self.id(), kernel = %self.kernel, "run dropped before completion");
        }
    }
}
