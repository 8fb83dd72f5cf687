//! Runtime sequence instruction set
//!
//! The instruction stream tells the device how to move operand data between
//! host buffers and the compute core's streams. The host never interprets it;
//! it only loads the words into a cacheable buffer and passes that buffer and
//! its word count to the kernel.

mod instruction;
mod sequence;

pub use instruction::{
    Channel, DmaDescriptor, SequenceOp, OP_DMA_MEMCPY_ND, OP_DMA_WAIT, OP_TRACE,
};
pub use sequence::{InstructionStream, STREAM_MAGIC};
