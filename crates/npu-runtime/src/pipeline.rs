//! End-to-end host flow for the broadcast-add offload
//!
//! ```text
//! load instructions ─► register image ─► context ─► resolve kernel
//!        ─► allocate + fill buffers ─► sync to device ─► measurement loop ─► report
//! ```

use crate::buffer::DeviceBuffer;
use crate::device::{Device, MemoryKind};
use crate::error::{Result, RuntimeError};
use crate::invoker::{HwContext, Kernel, LoadedProgram};
use crate::measure::{BufferSet, IterationRecord, LoopReport, MeasureConfig, MeasurementLoop};
use crate::verify::{Verifier, DEFAULT_TOLERANCE};
use npu_kernels::{Element, TileShape};
use std::sync::Arc;

/// Shape and policy of one offload session
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Rows of A and C (N)
    pub rows: usize,
    /// Columns of A, B, and C (M)
    pub cols: usize,
    /// Bytes of trace region appended to C
    pub trace_size: usize,
    pub kernel_prefix: String,
    pub tolerance: f64,
    pub measure: MeasureConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 64,
            trace_size: 0,
            kernel_prefix: "MLIR_AIE".to_string(),
            tolerance: DEFAULT_TOLERANCE,
            measure: MeasureConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_shape(mut self, rows: usize, cols: usize) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn with_trace_size(mut self, trace_size: usize) -> Self {
        self.trace_size = trace_size;
        self
    }

    pub fn with_kernel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kernel_prefix = prefix.into();
        self
    }

    pub fn with_measure(mut self, measure: MeasureConfig) -> Self {
        self.measure = measure;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Allocate and fill the offload buffers.
///
/// `A[i][j] = i·M + j`, `B[j] = j`, C zeroed. Nothing is synced.
///
/// # Errors
///
/// - `Shape` when `cols` is not a valid tile length
/// - `InvalidArgument` when the shape or element types differ from the
///   kernel's compiled design
pub fn prepare_buffers<TIn: Element, TOut: Element>(
    kernel: &Kernel<'_>,
    instructions: &[u32],
    config: &PipelineConfig,
) -> Result<BufferSet> {
    if config.rows == 0 || config.cols == 0 {
        return Err(RuntimeError::invalid_argument(format!(
            "matrix shape {}x{} is empty",
            config.rows, config.cols
        )));
    }
    TileShape::new(config.cols)?;

    let design = &kernel.entry().design;
    if (config.rows, config.cols) != (design.rows as usize, design.cols as usize) {
        return Err(RuntimeError::invalid_argument(format!(
            "kernel '{}' streams {}x{} tiles, not {}x{}",
            kernel.name(),
            design.rows,
            design.cols,
            config.rows,
            config.cols
        )));
    }
    if (TIn::DTYPE, TOut::DTYPE) != (design.dtype_in, design.dtype_out) {
        return Err(RuntimeError::invalid_argument(format!(
            "kernel '{}' computes {} -> {}, not {} -> {}",
            kernel.name(),
            design.dtype_in,
            design.dtype_out,
            TIn::DTYPE,
            TOut::DTYPE
        )));
    }

    let device = kernel.context().device();
    let in_size = std::mem::size_of::<TIn>();
    let out_size = std::mem::size_of::<TOut>();
    let cells = config.rows * config.cols;

    let mut instr = DeviceBuffer::allocate(
        device,
        std::mem::size_of_val(instructions),
        kernel.group_id(1)?,
        MemoryKind::Cacheable,
    )?;
    instr.write(instructions)?;

    let mut a = DeviceBuffer::allocate(device, cells * in_size, kernel.group_id(3)?, MemoryKind::HostOnly)?;
    for (k, slot) in a.map_mut::<TIn>()?.iter_mut().enumerate() {
        *slot = TIn::from_pattern(k);
    }

    let mut b = DeviceBuffer::allocate(device, config.cols * in_size, kernel.group_id(4)?, MemoryKind::HostOnly)?;
    for (j, slot) in b.map_mut::<TIn>()?.iter_mut().enumerate() {
        *slot = TIn::from_pattern(j);
    }

    let c = DeviceBuffer::allocate_with_trace(
        device,
        cells * out_size,
        config.trace_size,
        kernel.group_id(5)?,
        MemoryKind::HostOnly,
    )?;

    tracing::info!(
        instr_words = instructions.len(),
        a_bytes = a.size(),
        b_bytes = b.size(),
        c_bytes = c.size(),
        "Writing data into buffer objects"
    );

    Ok(BufferSet {
        instr,
        instr_words: instructions.len(),
        a,
        b,
        c,
    })
}

/// Run the whole offload on `device` and return the loop report.
///
/// `observer` sees every measured iteration along with the synced output
/// buffer, for example to dump its trace region.
pub fn run_offload<TIn: Element, TOut: Element>(
    device: &Arc<dyn Device>,
    program: &LoadedProgram,
    instructions: &[u32],
    config: &PipelineConfig,
    observer: impl FnMut(&IterationRecord, &DeviceBuffer) -> Result<()>,
) -> Result<LoopReport> {
    tracing::info!(instr_words = instructions.len(), "Sequence instr count");

    let ctx = HwContext::new(device, program)?;
    let kernel = Kernel::new(&ctx, &config.kernel_prefix)?;

    let mut buffers = prepare_buffers::<TIn, TOut>(&kernel, instructions, config)?;
    buffers.sync_to_device()?;

    let verifier = Verifier::new(config.rows, config.cols).with_tolerance(config.tolerance);
    MeasurementLoop::new(config.measure.clone()).run_observed::<TOut>(&kernel, &mut buffers, &verifier, observer)
}
