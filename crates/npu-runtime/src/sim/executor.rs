//! Run execution on the simulated compute core
//!
//! A run walks its instruction stream in order:
//!
//! - `DMA_MEMCPY_ND` on an input channel gathers elements from device memory
//!   into that channel's stream
//! - `DMA_MEMCPY_ND` on `outC` arms the output transfer
//! - `TRACE` arms event recording into a byte range of a buffer argument
//! - `DMA_WAIT` on `outC` runs the core loop over every row and scatters the
//!   produced stream into device memory
//!
//! The core loop takes one `inA` tile per row and one `inB` tile, cycling
//! through the `inB` stream so a single-tile B is broadcast over every row.
//! Each row calls the add symbol into a local tile and then the store symbol
//! into the output stream.
//!
//! Trace words are little-endian `u32`:
//!
//! ```text
//!  31            16 15       8 7        0
//! ┌────────────────┬──────────┬──────────┐
//! │      row       │  symbol  │  event   │   symbol: 1 = add, 2 = store
//! └────────────────┴──────────┴──────────┘   event:  0 = start, 1 = end
//! ```

use super::memory::DeviceState;
use super::Fault;
use crate::device::{BoHandle, KernelArg, MemoryKind, Opcode};
use crate::error::{Result, RuntimeError};
use crate::image::CoreDesign;
use crate::isa::{Channel, DmaDescriptor, InstructionStream, SequenceOp};
use half::bf16;
use npu_kernels::{DType, Element, KernelLibrary, SymbolError, TileEvent, TileOp, TileShape};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Everything a worker needs to execute one submission
#[derive(Debug, Clone)]
pub(crate) struct RunJob {
    pub(crate) id: u64,
    pub(crate) kernel: String,
    pub(crate) design: CoreDesign,
    pub(crate) opcode: Opcode,
    pub(crate) args: Vec<KernelArg>,
    pub(crate) faults: Vec<Fault>,
}

/// Armed trace destination
#[derive(Debug, Clone, Copy)]
struct TraceRegion {
    handle: BoHandle,
    offset: usize,
    size: usize,
}

fn trace_word(row: usize, op: TileOp, event: TileEvent) -> u32 {
    let symbol = match op {
        TileOp::Add => 1,
        TileOp::Store => 2,
    };
    ((row as u32 & 0xFFFF) << 16) | (symbol << 8) | event as u32
}

/// Add one in the element type to the cell stored in `bytes`.
fn bump_cell(dtype: DType, bytes: &mut [u8]) {
    fn bump<T: Element>(bytes: &mut [u8]) {
        let value: T = bytemuck::pod_read_unaligned(bytes);
        let bumped = value.lane_add(T::from_pattern(1));
        bytes.copy_from_slice(bytemuck::bytes_of(&bumped));
    }

    match dtype {
        DType::I8 => bump::<i8>(bytes),
        DType::I16 => bump::<i16>(bytes),
        DType::I32 => bump::<i32>(bytes),
        DType::Bf16 => bump::<bf16>(bytes),
        DType::F32 => bump::<f32>(bytes),
    }
}

/// Executes runs against shared device state
pub(crate) struct Executor {
    state: Arc<RwLock<DeviceState>>,
    library: Arc<KernelLibrary>,
    parallel: bool,
}

impl Executor {
    pub(crate) fn new(state: Arc<RwLock<DeviceState>>, library: Arc<KernelLibrary>, parallel: bool) -> Self {
        Self {
            state,
            library,
            parallel,
        }
    }

    #[tracing::instrument(skip(self, job), fields(run = job.id, kernel = %job.kernel))]
    pub(crate) fn execute(&self, job: &RunJob) -> Result<()> {
        if job.opcode != Opcode::RUN_SEQUENCE {
            return Err(RuntimeError::run_failed(format!("unsupported opcode {}", job.opcode)));
        }

        let instr = buffer_arg(&job.args, 0)?;
        let count = scalar_arg(&job.args, 1)? as usize;
        let stream = InstructionStream::from_words(&self.read_instructions(instr, count)?)?;
        tracing::trace!(ops = stream.len(), "instruction_stream_decoded");

        let design = &job.design;
        let in_size = design.dtype_in.size_bytes();
        let out_size = design.dtype_out.size_bytes();

        let mut a_stream: Option<Vec<u8>> = None;
        let mut b_stream: Option<Vec<u8>> = None;
        let mut pending_out: Option<(BoHandle, DmaDescriptor)> = None;
        let mut trace: Option<TraceRegion> = None;

        for op in stream.ops() {
            match *op {
                SequenceOp::DmaMemcpyNd(desc) => {
                    let handle = sequence_arg(&job.args, desc.arg)?;
                    match desc.channel {
                        Channel::InA => a_stream = Some(self.gather(handle, &desc, in_size)?),
                        Channel::InB => b_stream = Some(self.gather(handle, &desc, in_size)?),
                        Channel::OutC => pending_out = Some((handle, desc)),
                    }
                }
                SequenceOp::Trace { arg, offset, size } => {
                    trace = Some(TraceRegion {
                        handle: sequence_arg(&job.args, arg)?,
                        offset: offset as usize,
                        size: size as usize,
                    });
                }
                SequenceOp::DmaWait { channel: Channel::OutC } => {
                    let (handle, desc) = pending_out
                        .take()
                        .ok_or_else(|| RuntimeError::run_failed("wait on outC with no transfer armed"))?;
                    let a = a_stream
                        .as_deref()
                        .ok_or_else(|| RuntimeError::run_failed("outC awaited before inA was configured"))?;
                    let b = b_stream
                        .as_deref()
                        .ok_or_else(|| RuntimeError::run_failed("outC awaited before inB was configured"))?;

                    let (mut out, events) = self.compute(design, a, b)?;
                    if out.len() != desc.element_count() * out_size {
                        return Err(RuntimeError::run_failed(format!(
                            "core produced {} elements, outC transfer expects {}",
                            out.len() / out_size,
                            desc.element_count()
                        )));
                    }
                    for fault in &job.faults {
                        if let Fault::CorruptCell { cell, .. } = fault {
                            match out.get_mut(cell * out_size..(cell + 1) * out_size) {
                                Some(bytes) => bump_cell(design.dtype_out, bytes),
                                None => tracing::warn!(cell, "fault cell outside output stream"),
                            }
                        }
                    }

                    self.scatter(handle, &desc, out_size, &out)?;
                    if let Some(region) = trace {
                        self.write_trace(region, &events)?;
                    }
                }
                SequenceOp::DmaWait { .. } => {}
            }
        }

        if pending_out.is_some() {
            return Err(RuntimeError::run_failed("sequence ended with an outC transfer never awaited"));
        }
        Ok(())
    }

    fn read_instructions(&self, handle: BoHandle, count: usize) -> Result<Vec<u32>> {
        let state = self.state.read();
        let alloc = state.buffer(handle)?;
        if alloc.kind != MemoryKind::Cacheable {
            return Err(RuntimeError::run_failed(format!(
                "instruction buffer {handle} must be cacheable"
            )));
        }
        let bytes = alloc
            .bytes
            .get(..count * 4)
            .ok_or_else(|| RuntimeError::size_mismatch(count * 4, alloc.bytes.len()))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    fn gather(&self, handle: BoHandle, desc: &DmaDescriptor, elem: usize) -> Result<Vec<u8>> {
        let state = self.state.read();
        let bytes = &state.buffer(handle)?.bytes;
        check_extent(handle, desc, elem, bytes.len())?;

        let mut stream = Vec::with_capacity(desc.element_count() * elem);
        for idx in desc.element_indices() {
            stream.extend_from_slice(&bytes[idx * elem..(idx + 1) * elem]);
        }
        tracing::trace!(channel = %desc.channel, bo = %handle, bytes = stream.len(), "dma_gather");
        Ok(stream)
    }

    fn scatter(&self, handle: BoHandle, desc: &DmaDescriptor, elem: usize, stream: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let bytes = &mut state.buffer_mut(handle)?.bytes;
        check_extent(handle, desc, elem, bytes.len())?;

        for (k, idx) in desc.element_indices().enumerate() {
            bytes[idx * elem..(idx + 1) * elem].copy_from_slice(&stream[k * elem..(k + 1) * elem]);
        }
        tracing::trace!(channel = %desc.channel, bo = %handle, bytes = stream.len(), "dma_scatter");
        Ok(())
    }

    /// Run the core loop; returns the output stream and trace words.
    fn compute(&self, design: &CoreDesign, a: &[u8], b: &[u8]) -> Result<(Vec<u8>, Vec<u32>)> {
        let shape = TileShape::new(design.cols as usize)?;
        let add = self.library.add_entry(&design.add_symbol)?;
        let store = self.library.store_entry(&design.store_symbol)?;

        let tile_in = shape.len() * design.dtype_in.size_bytes();
        let tile_out = shape.len() * design.dtype_out.size_bytes();
        if a.len() % tile_in != 0 || b.is_empty() || b.len() % tile_in != 0 {
            return Err(RuntimeError::run_failed(format!(
                "input streams ({} and {} bytes) are not whole {tile_in}-byte tiles",
                a.len(),
                b.len()
            )));
        }
        let rows = a.len() / tile_in;
        let b_tiles = b.len() / tile_in;

        let row_body = |row: usize, out: &mut [u8]| -> std::result::Result<Vec<u32>, SymbolError> {
            let a_tile = &a[row * tile_in..(row + 1) * tile_in];
            let b_row = row % b_tiles;
            let b_tile = &b[b_row * tile_in..(b_row + 1) * tile_in];
            let mut local = vec![0u8; tile_out];
            let mut events = Vec::with_capacity(4);
            add(shape, a_tile, b_tile, &mut local, &mut |e| {
                events.push(trace_word(row, TileOp::Add, e))
            })?;
            store(shape, &local, out, &mut |e| events.push(trace_word(row, TileOp::Store, e)))?;
            Ok(events)
        };

        let start = Instant::now();
        let mut out = vec![0u8; rows * tile_out];
        let per_row: Vec<Vec<u32>> = if self.parallel {
            out.par_chunks_mut(tile_out)
                .enumerate()
                .map(|(row, chunk)| row_body(row, chunk))
                .collect::<std::result::Result<_, _>>()?
        } else {
            out.chunks_mut(tile_out)
                .enumerate()
                .map(|(row, chunk)| row_body(row, chunk))
                .collect::<std::result::Result<_, _>>()?
        };
        npu_tracing::performance::record_throughput(
            &design.add_symbol,
            rows * shape.len(),
            start.elapsed().as_micros() as u64,
        );

        Ok((out, per_row.into_iter().flatten().collect()))
    }

    fn write_trace(&self, region: TraceRegion, events: &[u32]) -> Result<()> {
        let mut state = self.state.write();
        let bytes = &mut state.buffer_mut(region.handle)?.bytes;
        let window = bytes
            .get_mut(region.offset..region.offset + region.size)
            .ok_or_else(|| {
                RuntimeError::run_failed(format!(
                    "trace region {}..{} outside {}",
                    region.offset,
                    region.offset + region.size,
                    region.handle
                ))
            })?;

        let capacity = window.len() / 4;
        for (slot, word) in window.chunks_exact_mut(4).zip(events) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        if events.len() > capacity {
            tracing::debug!(dropped = events.len() - capacity, "trace_region_full");
        }
        Ok(())
    }
}

fn check_extent(handle: BoHandle, desc: &DmaDescriptor, elem: usize, len: usize) -> Result<()> {
    let needed = desc.extent() * elem;
    if needed > len {
        return Err(RuntimeError::run_failed(format!(
            "{} transfer touches {needed} bytes of {handle}, which holds {len}",
            desc.channel
        )));
    }
    Ok(())
}

fn buffer_arg(args: &[KernelArg], index: usize) -> Result<BoHandle> {
    match args.get(index) {
        Some(KernelArg::Buffer(handle)) => Ok(*handle),
        other => Err(RuntimeError::run_failed(format!(
            "kernel argument {index} should be a buffer, found {other:?}"
        ))),
    }
}

fn scalar_arg(args: &[KernelArg], index: usize) -> Result<u64> {
    match args.get(index) {
        Some(KernelArg::Scalar(value)) => Ok(*value),
        other => Err(RuntimeError::run_failed(format!(
            "kernel argument {index} should be a scalar, found {other:?}"
        ))),
    }
}

/// Runtime sequence arguments follow the instruction buffer and its count.
fn sequence_arg(args: &[KernelArg], arg: u8) -> Result<BoHandle> {
    buffer_arg(args, 2 + arg as usize)
}
