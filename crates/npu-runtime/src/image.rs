//! Program image container
//!
//! A program image bundles the compute-core configuration with the kernel
//! entry points the host may invoke. Images are serialized with bincode and
//! identified by a UUID that hardware contexts are created against.
//!
//! ```
//! use npu_kernels::DType;
//! use npu_runtime::image::{CoreDesign, KernelEntry, ProgramImage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let design = CoreDesign::new(4, 64, DType::I16, DType::I16);
//! let image = ProgramImage::new(vec![KernelEntry::offload("MLIR_AIE", design)]);
//! let bytes = image.to_bytes()?;
//! let loaded = ProgramImage::from_bytes(&bytes)?;
//! assert_eq!(image, loaded);
//! assert_eq!(loaded.resolve("MLIR")?.name, "MLIR_AIE");
//! # Ok(())
//! # }
//! ```

use crate::device::GroupId;
use crate::error::{Result, RuntimeError};
use npu_kernels::{DType, KernelSymbol, TileOp};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Argument slot of a kernel entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    Scalar,
    Buffer { group: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
}

impl ArgSpec {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Scalar,
        }
    }

    pub fn buffer(name: impl Into<String>, group: u32) -> Self {
        Self {
            name: name.into(),
            kind: ArgKind::Buffer { group },
        }
    }
}

/// Compute-core configuration baked into the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDesign {
    /// Rows streamed per run (N)
    pub rows: u32,
    /// Tile length (M)
    pub cols: u32,
    pub dtype_in: DType,
    pub dtype_out: DType,
    /// Tile kernel symbol for the add step
    pub add_symbol: String,
    /// Tile kernel symbol for the store step
    pub store_symbol: String,
}

impl CoreDesign {
    pub fn new(rows: u32, cols: u32, dtype_in: DType, dtype_out: DType) -> Self {
        Self {
            rows,
            cols,
            dtype_in,
            dtype_out,
            add_symbol: KernelSymbol::new(TileOp::Add, dtype_in, dtype_out).name(),
            store_symbol: KernelSymbol::new(TileOp::Store, dtype_in, dtype_out).name(),
        }
    }
}

/// One invocable entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEntry {
    pub name: String,
    /// Signature, argument 0 is the opcode
    pub args: Vec<ArgSpec>,
    pub design: CoreDesign,
}

impl KernelEntry {
    /// Entry with the offload signature
    /// `(opcode, instr, instr_count, a, b, c)`.
    ///
    /// Buffer arguments are placed in the group matching their index.
    pub fn offload(name: impl Into<String>, design: CoreDesign) -> Self {
        Self {
            name: name.into(),
            args: vec![
                ArgSpec::scalar("opcode"),
                ArgSpec::buffer("instr", 1),
                ArgSpec::scalar("instr_count"),
                ArgSpec::buffer("a", 3),
                ArgSpec::buffer("b", 4),
                ArgSpec::buffer("c", 5),
            ],
            design,
        }
    }

    /// Memory group for a buffer argument
    pub fn group_id(&self, arg_index: usize) -> Result<GroupId> {
        match self.args.get(arg_index) {
            Some(ArgSpec {
                kind: ArgKind::Buffer { group },
                ..
            }) => Ok(GroupId(*group)),
            Some(spec) => Err(RuntimeError::invalid_argument(format!(
                "argument {arg_index} ('{}') of kernel '{}' is not a buffer",
                spec.name, self.name
            ))),
            None => Err(RuntimeError::invalid_argument(format!(
                "kernel '{}' has {} arguments, no index {arg_index}",
                self.name,
                self.args.len()
            ))),
        }
    }
}

/// A serialized compute program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramImage {
    pub uuid: Uuid,
    pub kernels: Vec<KernelEntry>,
}

impl ProgramImage {
    /// Create an image with a fresh UUID
    pub fn new(kernels: Vec<KernelEntry>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kernels,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| RuntimeError::image_load(format!("corrupt program image: {e}")))
    }

    /// Save image to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Load image from a file
    ///
    /// Missing or unreadable files are reported as `ImageLoad`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).map_err(|e| RuntimeError::image_load(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }

    /// Entry named exactly `name`
    pub fn kernel(&self, name: &str) -> Option<&KernelEntry> {
        self.kernels.iter().find(|k| k.name == name)
    }

    /// Resolve the single entry whose name starts with `prefix`.
    ///
    /// An entry named exactly `prefix` is chosen even when longer names
    /// share it as a prefix.
    ///
    /// # Errors
    ///
    /// - `KernelNotFound` when no entry matches
    /// - `AmbiguousKernel` when more than one entry matches
    pub fn resolve(&self, prefix: &str) -> Result<&KernelEntry> {
        for entry in &self.kernels {
            tracing::debug!(name = %entry.name, prefix, "kernel_candidate");
        }

        if let Some(exact) = self.kernel(prefix) {
            return Ok(exact);
        }

        let mut matches = self.kernels.iter().filter(|k| k.name.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry),
            (None, _) => Err(RuntimeError::KernelNotFound {
                prefix: prefix.to_string(),
                available: self.kernels.iter().map(|k| k.name.clone()).collect(),
            }),
            (Some(_), Some(_)) => Err(RuntimeError::AmbiguousKernel {
                prefix: prefix.to_string(),
                candidates: self
                    .kernels
                    .iter()
                    .filter(|k| k.name.starts_with(prefix))
                    .map(|k| k.name.clone())
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn design() -> CoreDesign {
        CoreDesign::new(4, 64, DType::I16, DType::I16)
    }

    #[test]
    fn test_core_design_symbols() {
        let d = CoreDesign::new(2, 128, DType::Bf16, DType::F32);
        assert_eq!(d.add_symbol, "ewise_add_bf16_f32");
        assert_eq!(d.store_symbol, "store_bf16_f32");
    }

    #[test]
    fn test_resolve_unique_prefix() {
        let image = ProgramImage::new(vec![
            KernelEntry::offload("MLIR_AIE", design()),
            KernelEntry::offload("VADD", design()),
        ]);
        assert_eq!(image.resolve("MLIR").unwrap().name, "MLIR_AIE");
        assert_eq!(image.resolve("VADD").unwrap().name, "VADD");
    }

    #[test]
    fn test_resolve_missing_and_ambiguous() {
        let image = ProgramImage::new(vec![
            KernelEntry::offload("MLIR_AIE", design()),
            KernelEntry::offload("MLIR_AIE_trace", design()),
        ]);
        assert!(matches!(
            image.resolve("MLIR"),
            Err(RuntimeError::AmbiguousKernel { candidates, .. }) if candidates.len() == 2
        ));
        assert!(matches!(image.resolve("XYZ"), Err(RuntimeError::KernelNotFound { .. })));
        assert!(image.kernel("MLIR_AIE_trace").is_some());
    }

    #[test]
    fn test_exact_name_beats_longer_prefix_matches() {
        let image = ProgramImage::new(vec![
            KernelEntry::offload("MLIR_AIE_trace", design()),
            KernelEntry::offload("MLIR_AIE", design()),
        ]);
        assert_eq!(image.resolve("MLIR_AIE").unwrap().name, "MLIR_AIE");
        assert_eq!(image.resolve("MLIR_AIE_t").unwrap().name, "MLIR_AIE_trace");
        assert!(matches!(image.resolve("MLIR_"), Err(RuntimeError::AmbiguousKernel { .. })));
    }

    #[test]
    fn test_group_ids_follow_argument_index() {
        let entry = KernelEntry::offload("MLIR_AIE", design());
        assert_eq!(entry.group_id(1).unwrap(), GroupId(1));
        assert_eq!(entry.group_id(3).unwrap(), GroupId(3));
        assert_eq!(entry.group_id(5).unwrap(), GroupId(5));
        assert!(entry.group_id(2).is_err());
        assert!(entry.group_id(6).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("final.xclbin");
        let image = ProgramImage::new(vec![KernelEntry::offload("MLIR_AIE", design())]);
        image.save(&path).unwrap();
        assert_eq!(ProgramImage::load(&path).unwrap(), image);
    }

    #[test]
    fn test_load_failures_are_image_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ProgramImage::load(dir.path().join("missing.xclbin")),
            Err(RuntimeError::ImageLoad(_))
        ));

        let garbage = dir.path().join("garbage.xclbin");
        std::fs::write(&garbage, [0xFFu8; 3]).unwrap();
        assert!(matches!(ProgramImage::load(&garbage), Err(RuntimeError::ImageLoad(_))));
    }
}
