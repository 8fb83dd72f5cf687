//! Vectorized tile kernels for the NPU compute core
//!
//! The compute core consumes one row tile of each operand at a time and runs a
//! fixed-width vector loop over it. This crate provides:
//!
//! - [`TileKernel`]: the element-wise add and store loops, generic over the
//!   input and output element types
//! - [`TileShape`]: validated tile lengths (vector multiple, pipelining minimum)
//! - [`KernelLibrary`]: the exported `ewise_add_*` / `store_*` symbols as
//!   byte-level entry points for a device to call by name
//!
//! # Example
//!
//! ```rust
//! use npu_kernels::TileKernel;
//!
//! let kernel = TileKernel::<i16, i16>::fixed::<64>();
//! let a: Vec<i16> = (0..64).collect();
//! let b: Vec<i16> = (0..64).collect();
//! let mut c = vec![0i16; 64];
//! kernel.add(&a, &b, &mut c);
//! assert_eq!(c[10], 20);
//! ```

pub mod dtype;
pub mod library;
pub mod tile;

pub use dtype::{DType, DTypeError, Element};
pub use library::{KernelLibrary, KernelSymbol, SymbolError, TileEntry, TileOp, EXPORTS};
pub use tile::{
    ShapeError, TileEvent, TileKernel, TileShape, Vector, DEFAULT_TILE_LEN, MIN_PIPELINE_ITERATIONS, VECTOR_WIDTH,
};
