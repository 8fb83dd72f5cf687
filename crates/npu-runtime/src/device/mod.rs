//! Device abstraction
//!
//! The host runtime talks to accelerators only through the [`Device`] trait.
//! The crate ships one implementation, [`SimDevice`](crate::sim::SimDevice).

mod traits;
mod types;

pub use traits::Device;
pub use types::{
    BoHandle, ContextId, GroupId, KernelArg, MemoryKind, Opcode, Poll, RunCompletion, RunState, SyncDirection,
};
