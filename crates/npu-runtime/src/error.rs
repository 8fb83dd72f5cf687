//! Error types for the offload runtime

use crate::device::BoHandle;
use npu_kernels::{DTypeError, ShapeError, SymbolError};
use std::time::Duration;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the host runtime and the devices behind it
///
/// Everything here is fatal to the pipeline that raised it. Verification
/// mismatches are never errors; they are counted by the verifier.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Program image could not be read, decoded, or registered
    #[error("failed to load program image: {0}")]
    ImageLoad(String),

    /// No kernel entry name starts with the requested prefix
    #[error("no kernel entry matches prefix '{prefix}' (available: {available:?})")]
    KernelNotFound { prefix: String, available: Vec<String> },

    /// More than one kernel entry name starts with the requested prefix
    #[error("kernel prefix '{prefix}' is ambiguous, candidates: {candidates:?}")]
    AmbiguousKernel { prefix: String, candidates: Vec<String> },

    /// Hardware context could not be created or is no longer valid
    #[error("failed to create hardware context: {0}")]
    ContextCreation(String),

    /// Buffer handle unknown to the device
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(BoHandle),

    /// Byte length does not match the buffer or view
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Kernel argument list does not match the entry signature
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Run did not complete within the caller's timeout
    #[error("run {run} of kernel '{kernel}' did not complete within {timeout:?}")]
    WaitTimeout {
        run: u64,
        kernel: String,
        timeout: Duration,
    },

    /// Device reported the run as failed
    #[error("kernel run failed: {0}")]
    RunFailed(String),

    /// Instruction stream is malformed
    #[error("instruction stream decode failed at word {word}: {reason}")]
    InstructionDecode { word: usize, reason: String },

    /// Design parameters rejected
    #[error("invalid design: {0}")]
    Design(String),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    DType(#[from] DTypeError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    /// Program image (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Create an image load error
    pub fn image_load(msg: impl Into<String>) -> Self {
        Self::ImageLoad(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a run failure
    pub fn run_failed(msg: impl Into<String>) -> Self {
        Self::RunFailed(msg.into())
    }

    /// Create a design error
    pub fn design(msg: impl Into<String>) -> Self {
        Self::Design(msg.into())
    }

    pub fn decode(word: usize, reason: impl Into<String>) -> Self {
        Self::InstructionDecode {
            word,
            reason: reason.into(),
        }
    }

    /// Create a size mismatch error
    pub fn size_mismatch(expected: usize, actual: usize) -> Self {
        Self::SizeMismatch { expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RuntimeError::AmbiguousKernel {
            prefix: "MLIR".to_string(),
            candidates: vec!["MLIR_AIE".to_string(), "MLIR_AIE2".to_string()],
        };
        assert!(err.to_string().contains("ambiguous"));

        let err = RuntimeError::size_mismatch(128, 64);
        assert_eq!(err.to_string(), "size mismatch: expected 128 bytes, got 64");

        let err: RuntimeError = ShapeError::NotVectorMultiple {
            len: 60,
            vector_width: 8,
        }
        .into();
        assert!(matches!(err, RuntimeError::Shape(_)));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "insts.bin");
        let err: RuntimeError = io.into();
        assert!(err.to_string().contains("insts.bin"));
    }
}
