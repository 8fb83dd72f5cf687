//! Design generation
//!
//! Produces the program image and runtime sequence for a single compute
//! core streaming `rows` tiles of `cols` elements:
//!
//! ```text
//! inA ──► [ ewise_add(a, b) ─► local ─► store(local) ] ──► outC
//! inB ──►   (one B tile, reused for every row)
//! ```

use crate::error::{Result, RuntimeError};
use crate::image::{CoreDesign, KernelEntry, ProgramImage};
use crate::isa::{Channel, DmaDescriptor, InstructionStream, SequenceOp};
use npu_kernels::{DType, KernelSymbol, TileOp, TileShape};
use std::path::{Path, PathBuf};

/// Default kernel entry name
pub const DEFAULT_KERNEL_NAME: &str = "MLIR_AIE";

/// File names written by [`Design::write`]
pub const IMAGE_FILE: &str = "final.xclbin";
pub const INSTR_FILE: &str = "insts.bin";

/// Parameters of a generated design
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignConfig {
    pub rows: u32,
    pub cols: u32,
    pub dtype_in: DType,
    pub dtype_out: DType,
    pub trace_size: u32,
    pub kernel_name: String,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 64,
            dtype_in: DType::I16,
            dtype_out: DType::I16,
            trace_size: 0,
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
        }
    }
}

impl DesignConfig {
    /// Check element pairing, tile shape, kernel availability, and that the
    /// output and trace regions of C fit a 32-bit byte offset.
    pub fn validate(&self) -> Result<()> {
        DType::check_pair(self.dtype_in, self.dtype_out)?;
        TileShape::new(self.cols as usize)?;
        if self.rows == 0 {
            return Err(RuntimeError::design("design needs at least one row"));
        }
        if self.trace_size % 4 != 0 {
            return Err(RuntimeError::design(format!(
                "trace size {} is not a whole number of 32-bit words",
                self.trace_size
            )));
        }
        let output = self.output_bytes()?;
        if output.checked_add(self.trace_size).is_none() {
            return Err(RuntimeError::design(format!(
                "{output} output bytes plus {} trace bytes exceed a 32-bit buffer",
                self.trace_size
            )));
        }
        for op in [TileOp::Add, TileOp::Store] {
            let symbol = KernelSymbol::new(op, self.dtype_in, self.dtype_out);
            if !symbol.is_exported() {
                return Err(RuntimeError::design(format!("no compiled kernel for {symbol}")));
            }
        }
        Ok(())
    }

    /// Bytes of the logical output region
    pub fn output_bytes(&self) -> Result<u32> {
        let bytes = u64::from(self.rows) * u64::from(self.cols) * self.dtype_out.size_bytes() as u64;
        u32::try_from(bytes).map_err(|_| {
            RuntimeError::design(format!(
                "{}x{} {} output is {bytes} bytes, beyond a 32-bit buffer",
                self.rows, self.cols, self.dtype_out
            ))
        })
    }

    /// Runtime sequence for this design
    pub fn sequence(&self) -> Result<InstructionStream> {
        let (n, m) = (self.rows, self.cols);
        let mut stream = InstructionStream::new();

        if self.trace_size > 0 {
            stream.push(SequenceOp::Trace {
                arg: 2,
                offset: self.output_bytes()?,
                size: self.trace_size,
            });
        }

        stream
            .push(SequenceOp::DmaMemcpyNd(DmaDescriptor {
                channel: Channel::InA,
                arg: 0,
                bd_id: 0,
                offset: 0,
                sizes: [1, 1, n, m],
                strides: [0, 0, m, 1],
            }))
            .push(SequenceOp::DmaMemcpyNd(DmaDescriptor {
                channel: Channel::InB,
                arg: 1,
                bd_id: 1,
                offset: 0,
                sizes: [1, 1, 1, m],
                strides: [0, 0, m, 1],
            }))
            .push(SequenceOp::DmaMemcpyNd(DmaDescriptor {
                channel: Channel::OutC,
                arg: 2,
                bd_id: 2,
                offset: 0,
                sizes: [1, 1, n, m],
                strides: [0, 0, m, 1],
            }))
            .push(SequenceOp::DmaWait { channel: Channel::OutC });
        Ok(stream)
    }

    /// Validate and generate.
    pub fn generate(&self) -> Result<Design> {
        self.validate()?;
        let design = CoreDesign::new(self.rows, self.cols, self.dtype_in, self.dtype_out);
        let image = ProgramImage::new(vec![KernelEntry::offload(self.kernel_name.clone(), design)]);
        tracing::debug!(uuid = %image.uuid, rows = self.rows, cols = self.cols, "design generated");
        Ok(Design {
            image,
            sequence: self.sequence()?,
        })
    }
}

/// A generated program image and its runtime sequence
#[derive(Debug, Clone, PartialEq)]
pub struct Design {
    pub image: ProgramImage,
    pub sequence: InstructionStream,
}

impl Design {
    pub fn instructions(&self) -> Vec<u32> {
        self.sequence.to_words()
    }

    /// Write the image and instruction binary into `dir`, creating it if
    /// needed. Returns `(image path, instruction path)`.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let image_path = dir.join(IMAGE_FILE);
        let instr_path = dir.join(INSTR_FILE);
        self.image.save(&image_path)?;
        crate::io::write_instr_binary(&self.instructions(), &instr_path)?;
        Ok((image_path, instr_path))
    }
}
