//! Host runtime for offloading element-wise kernels to an NPU
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ pipeline   run_offload: the whole host flow              │
//! ├──────────────────────────────────────────────────────────┤
//! │ measure    MeasurementLoop, RunStatistics, LoopReport    │
//! │ verify     Verifier (closed-form reference)              │
//! │ invoker    LoadedProgram → HwContext → Kernel → Run      │
//! │ buffer     DeviceBuffer (host memory + device mirror)    │
//! ├──────────────────────────────────────────────────────────┤
//! │ device     Device trait, handles, run completion         │
//! │ sim        SimDevice: software accelerator               │
//! │ isa        runtime sequence encoding                     │
//! │ image      ProgramImage container                        │
//! │ design     image + sequence generation                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use npu_runtime::design::DesignConfig;
//! use npu_runtime::invoker::LoadedProgram;
//! use npu_runtime::pipeline::{run_offload, PipelineConfig};
//! use npu_runtime::measure::MeasureConfig;
//! use npu_runtime::sim::SimDevice;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let design = DesignConfig::default().generate()?;
//! let device = SimDevice::new().into_shared();
//! let program = LoadedProgram::register(&device, design.image.clone())?;
//!
//! let config = PipelineConfig::default().with_measure(MeasureConfig::default().with_iterations(2));
//! let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, _| Ok(()))?;
//! assert!(report.passed());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod design;
pub mod device;
pub mod error;
pub mod image;
pub mod invoker;
pub mod io;
pub mod isa;
pub mod measure;
pub mod pipeline;
pub mod sim;
pub mod verify;

pub use buffer::DeviceBuffer;
pub use device::{BoHandle, Device, GroupId, MemoryKind, Opcode, RunState, SyncDirection};
pub use error::{Result, RuntimeError};
pub use image::ProgramImage;
pub use invoker::{Arg, HwContext, Kernel, LoadedProgram, Run};
pub use measure::{BufferSet, LoopReport, MeasureConfig, MeasurementLoop, RunStatistics};
pub use sim::SimDevice;
pub use verify::{Verifier, DEFAULT_TOLERANCE};
