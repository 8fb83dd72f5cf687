//! Simulated accelerator
//!
//! Software implementation of [`Device`] used by tests, benches, and the CLI
//! when no hardware is attached.
//!
//! # Architecture
//!
//! ```text
//! SimDevice (Clone, shares state)
//! ├── DeviceState   - buffers, images, contexts behind Arc<RwLock<..>>
//! ├── KernelLibrary - ewise_add_* / store_* tile kernels by symbol
//! └── Executor      - instruction stream interpreter, one worker thread per run
//! ```
//!
//! Device memory is kept apart from host memory, so a missing
//! [`sync`](crate::buffer::DeviceBuffer::sync) shows up as stale data exactly
//! as it would on hardware. [`Fault`]s let tests corrupt outputs or stall
//! runs deterministically.
//!
//! ```
//! use npu_runtime::sim::{Fault, SimConfig, SimDevice};
//!
//! let device = SimDevice::with_config(SimConfig::default().with_fault(Fault::corrupt_every_run(5)));
//! assert_eq!(device.runs_submitted(), 0);
//! ```

mod executor;
pub(crate) mod memory;

use crate::device::{BoHandle, ContextId, Device, GroupId, KernelArg, MemoryKind, Opcode, RunCompletion, RunState};
use crate::error::{Result, RuntimeError};
use crate::image::{ArgKind, ProgramImage};
use executor::{Executor, RunJob};
use memory::DeviceState;
use npu_kernels::KernelLibrary;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Deterministic misbehavior injected into selected runs
///
/// Run indices count every submission to the device, starting at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Add one (in the output element type) to output cell `cell`
    CorruptCell { runs: Range<u64>, cell: usize },
    /// Delay completion by `duration` before executing
    Stall { runs: Range<u64>, duration: Duration },
}

impl Fault {
    pub fn corrupt_every_run(cell: usize) -> Self {
        Fault::CorruptCell { runs: 0..u64::MAX, cell }
    }

    pub fn stall_every_run(duration: Duration) -> Self {
        Fault::Stall {
            runs: 0..u64::MAX,
            duration,
        }
    }

    fn applies_to(&self, run: u64) -> bool {
        match self {
            Fault::CorruptCell { runs, .. } | Fault::Stall { runs, .. } => runs.contains(&run),
        }
    }
}

/// Simulator options
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Execute rows of a run on the rayon pool
    pub parallel: bool,
    pub faults: Vec<Fault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            faults: Vec::new(),
        }
    }
}

impl SimConfig {
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }
}

/// Software accelerator
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<RwLock<DeviceState>>,
    library: Arc<KernelLibrary>,
    config: Arc<SimConfig>,
}

impl SimDevice {
    /// Create a simulator with default options
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(DeviceState::new())),
            library: Arc::new(KernelLibrary::new()),
            config: Arc::new(config),
        }
    }

    /// Wrap in the shared handle the runtime expects
    pub fn into_shared(self) -> Arc<dyn Device> {
        Arc::new(self)
    }

    /// Buffers currently allocated on the device
    pub fn live_buffers(&self) -> usize {
        self.state.read().live_buffers()
    }

    pub fn runs_submitted(&self) -> u64 {
        self.state.read().runs_submitted()
    }

    fn check_args(&self, image: &ProgramImage, kernel: &str, args: &[KernelArg]) -> Result<()> {
        let entry = image.kernel(kernel).ok_or_else(|| {
            RuntimeError::invalid_argument(format!("kernel '{kernel}' is not part of image {}", image.uuid))
        })?;

        // args exclude the opcode slot
        let expected = entry.args.len().saturating_sub(1);
        if args.len() != expected {
            return Err(RuntimeError::invalid_argument(format!(
                "kernel '{kernel}' takes {expected} arguments after the opcode, got {}",
                args.len()
            )));
        }

        let state = self.state.read();
        for (index, (arg, spec)) in args.iter().zip(entry.args.iter().skip(1)).enumerate() {
            match (arg, &spec.kind) {
                (KernelArg::Scalar(_), ArgKind::Scalar) => {}
                (KernelArg::Buffer(handle), ArgKind::Buffer { group }) => {
                    let actual = state.buffer(*handle)?.group;
                    if actual != GroupId(*group) {
                        return Err(RuntimeError::invalid_argument(format!(
                            "{handle} was allocated in {actual} but argument {} ('{}') needs group{group}",
                            index + 1,
                            spec.name
                        )));
                    }
                }
                (arg, kind) => {
                    return Err(RuntimeError::invalid_argument(format!(
                        "argument {} ('{}') expects {kind:?}, got {arg:?}",
                        index + 1,
                        spec.name
                    )))
                }
            }
        }
        Ok(())
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SimDevice {
    fn name(&self) -> &str {
        "npu-sim"
    }

    fn register_image(&self, image: &ProgramImage) -> Result<()> {
        tracing::debug!(uuid = %image.uuid, kernels = image.kernels.len(), "register_image");
        self.state.write().register_image(image);
        Ok(())
    }

    fn create_context(&self, image: Uuid) -> Result<ContextId> {
        self.state.write().create_context(image)
    }

    fn destroy_context(&self, ctx: ContextId) -> Result<()> {
        self.state.write().destroy_context(ctx)
    }

    fn allocate(&self, size: usize, group: GroupId, kind: MemoryKind) -> Result<BoHandle> {
        let handle = self.state.write().allocate(size, group, kind);
        tracing::trace!(bo = %handle, size, %group, ?kind, "allocate");
        Ok(handle)
    }

    fn free(&self, handle: BoHandle) -> Result<()> {
        self.state.write().free(handle)
    }

    fn buffer_size(&self, handle: BoHandle) -> Result<usize> {
        Ok(self.state.read().buffer(handle)?.bytes.len())
    }

    fn sync_to_device(&self, handle: BoHandle, data: &[u8]) -> Result<()> {
        self.state.write().write(handle, data)
    }

    fn sync_from_device(&self, handle: BoHandle, data: &mut [u8]) -> Result<()> {
        self.state.read().read(handle, data)
    }

    fn submit(&self, ctx: ContextId, kernel: &str, opcode: Opcode, args: &[KernelArg]) -> Result<RunCompletion> {
        let image = self.state.read().context_image(ctx)?;
        self.check_args(&image, kernel, args)?;
        let design = image
            .kernel(kernel)
            .map(|entry| entry.design.clone())
            .ok_or_else(|| RuntimeError::invalid_argument(format!("kernel '{kernel}' vanished from image")))?;

        let id = self.state.write().next_run_id();
        let job = RunJob {
            id,
            kernel: kernel.to_string(),
            design,
            opcode,
            args: args.to_vec(),
            faults: self
                .config
                .faults
                .iter()
                .filter(|f| f.applies_to(id))
                .cloned()
                .collect(),
        };
        tracing::debug!(run = id, kernel, %opcode, %ctx, "submit");

        let executor = Executor::new(Arc::clone(&self.state), Arc::clone(&self.library), self.config.parallel);
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name(format!("npu-sim-run{id}"))
            .spawn(move || {
                for fault in &job.faults {
                    if let Fault::Stall { duration, .. } = fault {
                        std::thread::sleep(*duration);
                    }
                }
                let state = match executor.execute(&job) {
                    Ok(()) => RunState::Completed,
                    Err(err) => {
                        tracing::debug!(run = job.id, error = %err, "run_failed");
                        RunState::Error(err.to_string())
                    }
                };
                // Receiver may be gone if the host dropped the run.
                let _ = tx.send(state);
            })
            .map_err(|e| RuntimeError::run_failed(format!("could not start run worker: {e}")))?;

        Ok(RunCompletion::new(id, rx))
    }
}
