//! End-to-end offload tests against the simulated device

use npu_kernels::DType;
use npu_runtime::design::{Design, DesignConfig};
use npu_runtime::device::{Device, MemoryKind, Opcode, RunState, SyncDirection};
use npu_runtime::image::{CoreDesign, KernelEntry, ProgramImage};
use npu_runtime::invoker::{HwContext, Kernel, LoadedProgram};
use npu_runtime::measure::{MeasureConfig, MeasurementLoop};
use npu_runtime::pipeline::{prepare_buffers, run_offload, PipelineConfig};
use npu_runtime::sim::{Fault, SimConfig, SimDevice};
use npu_runtime::{DeviceBuffer, RuntimeError, Verifier};
use std::sync::Arc;
use std::time::Duration;

fn design(rows: u32, cols: u32, dtype_in: DType, dtype_out: DType) -> Design {
    DesignConfig {
        rows,
        cols,
        dtype_in,
        dtype_out,
        ..DesignConfig::default()
    }
    .generate()
    .unwrap()
}

fn setup(sim: &SimDevice, design: &Design) -> (Arc<dyn Device>, LoadedProgram) {
    let device = sim.clone().into_shared();
    let program = LoadedProgram::register(&device, design.image.clone()).unwrap();
    (device, program)
}

fn config(iterations: u32) -> PipelineConfig {
    PipelineConfig::default().with_measure(MeasureConfig::default().with_iterations(iterations))
}

#[test]
fn test_default_i16_offload_passes() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);

    let mut seen = Vec::new();
    let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config(10), |record, c| {
        assert_eq!(c.map::<i16>()?.len(), 256);
        seen.push(record.iteration);
        Ok(())
    })
    .unwrap();

    assert_eq!(report.errors, 0);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.verified_iterations, 10);
    assert_eq!(report.stats.count(), 10);
    assert!(report.stats.min().unwrap() <= report.stats.max());
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert_eq!(sim.runs_submitted(), 10);
    assert_eq!(sim.live_buffers(), 0, "buffers are freed when the session ends");
}

#[test]
fn test_output_matches_closed_form() {
    let sim = SimDevice::with_config(SimConfig::default().sequential());
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);

    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let mut buffers = prepare_buffers::<i16, i16>(&kernel, &design.instructions(), &config(1)).unwrap();
    buffers.sync_to_device().unwrap();

    let mut run = kernel.invoke(Opcode::RUN_SEQUENCE, &buffers.args()).unwrap();
    assert_eq!(run.wait(None).unwrap(), RunState::Completed);
    drop(run);
    buffers.c.sync(SyncDirection::FromDevice).unwrap();

    let c = buffers.c.map::<i16>().unwrap();
    assert_eq!(c[0], 0);
    assert_eq!(c[1], 2);
    assert_eq!(c[64 + 1], 66);
    assert_eq!(c[3 * 64 + 63], 318);
}

#[test]
fn test_single_corrupt_cell_is_reported() {
    let sim = SimDevice::with_config(SimConfig::default().with_fault(Fault::corrupt_every_run(5)));
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);

    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let mut buffers = prepare_buffers::<i16, i16>(&kernel, &design.instructions(), &config(1)).unwrap();
    buffers.sync_to_device().unwrap();

    let report = MeasurementLoop::new(MeasureConfig::default().with_iterations(1))
        .run::<i16>(&kernel, &mut buffers, &Verifier::new(4, 64))
        .unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.exit_code(), 1);

    let check = Verifier::new(4, 64).check(buffers.c.map::<i16>().unwrap());
    assert_eq!(check.checked, 256);
    assert_eq!(check.errors(), 1);
    let mismatch = &check.mismatches[0];
    assert_eq!((mismatch.row, mismatch.col), (0, 5));
    assert_eq!(mismatch.observed, 11.0);
    assert_eq!(mismatch.reference, 10.0);
}

#[test]
fn test_errors_accumulate_over_measured_iterations_only() {
    let design = design(4, 64, DType::I16, DType::I16);

    let every_run = SimDevice::with_config(SimConfig::default().with_fault(Fault::corrupt_every_run(0)));
    let (device, program) = setup(&every_run, &design);
    let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config(4), |_, _| Ok(())).unwrap();
    assert_eq!(report.errors, 4);

    // Runs 0 and 1 are the warmup iterations.
    let warmup_only = SimDevice::with_config(SimConfig::default().with_fault(Fault::CorruptCell { runs: 0..2, cell: 0 }));
    let (device, program) = setup(&warmup_only, &design);
    let config = PipelineConfig::default().with_measure(MeasureConfig::default().with_warmup(2).with_iterations(3));
    let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, _| Ok(())).unwrap();
    assert_eq!(report.errors, 0);
    assert_eq!(report.stats.count(), 3);
    assert_eq!(warmup_only.runs_submitted(), 5);
}

#[test]
fn test_unverified_loop_never_fails() {
    let sim = SimDevice::with_config(SimConfig::default().with_fault(Fault::corrupt_every_run(3)));
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);
    let config = PipelineConfig::default().with_measure(MeasureConfig::default().with_iterations(2).with_verify(false));

    let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |record, _| {
        assert_eq!(record.errors, None);
        Ok(())
    })
    .unwrap();
    assert!(report.passed());
    assert_eq!(report.verified_iterations, 0);
}

#[test]
fn test_skipped_sync_leaves_stale_data() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);

    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let mut buffers = prepare_buffers::<i16, i16>(&kernel, &design.instructions(), &config(1)).unwrap();

    // A stays host-only: the device sees zeros.
    buffers.instr.sync(SyncDirection::ToDevice).unwrap();
    buffers.b.sync(SyncDirection::ToDevice).unwrap();
    buffers.c.sync(SyncDirection::ToDevice).unwrap();

    kernel
        .invoke(Opcode::RUN_SEQUENCE, &buffers.args())
        .unwrap()
        .wait(None)
        .unwrap();

    // Without syncing back, the host still holds the zeroed C.
    assert!(buffers.c.map::<i16>().unwrap().iter().all(|&v| v == 0));

    buffers.c.sync(SyncDirection::FromDevice).unwrap();
    let check = Verifier::new(4, 64).check(buffers.c.map::<i16>().unwrap());
    // Row 0 of A is genuinely zero-based, so only rows 1..4 differ.
    assert_eq!(check.errors(), 3 * 64);
    assert!(check.mismatches.iter().all(|m| m.row > 0));
}

#[test]
fn test_repeated_loops_are_idempotent() {
    let sim = SimDevice::new();
    let design = design(2, 128, DType::I32, DType::I32);
    let (device, program) = setup(&sim, &design);

    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let config = config(3).with_shape(2, 128);
    let mut buffers = prepare_buffers::<i32, i32>(&kernel, &design.instructions(), &config).unwrap();
    buffers.sync_to_device().unwrap();

    let measure = MeasurementLoop::new(config.measure.clone());
    let verifier = Verifier::new(2, 128);
    let first = measure.run::<i32>(&kernel, &mut buffers, &verifier).unwrap();
    let snapshot = buffers.c.map::<i32>().unwrap().to_vec();
    let second = measure.run::<i32>(&kernel, &mut buffers, &verifier).unwrap();

    assert_eq!(first.errors, 0);
    assert_eq!(second.errors, 0);
    assert_eq!(buffers.c.map::<i32>().unwrap(), &snapshot[..]);
}

#[test]
fn test_wait_is_idempotent_after_completion() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);

    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let mut buffers = prepare_buffers::<i16, i16>(&kernel, &design.instructions(), &config(1)).unwrap();
    buffers.sync_to_device().unwrap();

    let mut run = kernel.invoke(Opcode::RUN_SEQUENCE, &buffers.args()).unwrap();
    assert_eq!(run.wait(None).unwrap(), RunState::Completed);
    assert_eq!(run.wait(Some(Duration::ZERO)).unwrap(), RunState::Completed);
    assert_eq!(run.state(), RunState::Completed);
}

#[test]
fn test_mixed_width_and_float_pipelines() {
    let bf16_design = design(4, 64, DType::Bf16, DType::F32);
    let sim = SimDevice::new();
    let (device, program) = setup(&sim, &bf16_design);
    let report =
        run_offload::<half::bf16, f32>(&device, &program, &bf16_design.instructions(), &config(2), |_, _| Ok(())).unwrap();
    assert!(report.passed());

    let f32_design = design(8, 256, DType::F32, DType::F32);
    let sim = SimDevice::new();
    let (device, program) = setup(&sim, &f32_design);
    let f32_config = config(2).with_shape(8, 256);
    let report = run_offload::<f32, f32>(&device, &program, &f32_design.instructions(), &f32_config, |_, _| Ok(())).unwrap();
    assert!(report.passed());

    let widen_design = design(4, 64, DType::I16, DType::I32);
    let sim = SimDevice::new();
    let (device, program) = setup(&sim, &widen_design);
    let report =
        run_offload::<i16, i32>(&device, &program, &widen_design.instructions(), &config(1), |_, _| Ok(())).unwrap();
    assert!(report.passed());
}

#[test]
fn test_trace_region_receives_events() {
    let design = DesignConfig {
        trace_size: 64,
        ..DesignConfig::default()
    }
    .generate()
    .unwrap();
    let sim = SimDevice::new();
    let (device, program) = setup(&sim, &design);

    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("trace.txt");
    let config = config(1).with_trace_size(64);
    let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, c| {
        assert_eq!(c.trace_size(), 64);
        assert_eq!(c.size(), 4 * 64 * 2 + 64);
        npu_runtime::io::write_trace(c.trace(), &trace_path)
    })
    .unwrap();
    assert!(report.passed());

    let dump = std::fs::read_to_string(&trace_path).unwrap();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 16);
    assert_eq!(lines[0], "00000100");
    assert_eq!(lines[1], "00000101");
}

#[test]
fn test_kernel_resolution_errors() {
    let core = CoreDesign::new(4, 64, DType::I16, DType::I16);
    let image = ProgramImage::new(vec![
        KernelEntry::offload("MLIR_AIE_add", core.clone()),
        KernelEntry::offload("MLIR_AIE_add_trace", core),
    ]);
    let device = SimDevice::new().into_shared();
    let program = LoadedProgram::register(&device, image).unwrap();
    let ctx = HwContext::new(&device, &program).unwrap();

    assert!(matches!(
        Kernel::new(&ctx, "MLIR_AIE"),
        Err(RuntimeError::AmbiguousKernel { ref candidates, .. }) if candidates.len() == 2
    ));
    assert!(matches!(Kernel::new(&ctx, "VITIS"), Err(RuntimeError::KernelNotFound { .. })));
    assert_eq!(Kernel::new(&ctx, "MLIR_AIE_add_t").unwrap().name(), "MLIR_AIE_add_trace");
}

#[test]
fn test_wait_timeout_on_stalled_run() {
    let sim = SimDevice::with_config(SimConfig::default().with_fault(Fault::stall_every_run(Duration::from_millis(300))));
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);
    let config = PipelineConfig::default().with_measure(
        MeasureConfig::default()
            .with_iterations(1)
            .with_wait_timeout(Some(Duration::from_millis(10))),
    );

    let result = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, _| Ok(()));
    assert!(matches!(result, Err(RuntimeError::WaitTimeout { run: 0, .. })));
}

#[test]
fn test_unknown_opcode_fails_the_run() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);
    let config = PipelineConfig::default().with_measure(MeasureConfig::default().with_iterations(1).with_opcode(Opcode(7)));

    let result = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, _| Ok(()));
    assert!(matches!(result, Err(RuntimeError::RunFailed(_))));
}

#[test]
fn test_buffer_in_wrong_group_is_rejected() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);

    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let mut buffers = prepare_buffers::<i16, i16>(&kernel, &design.instructions(), &config(1)).unwrap();
    buffers.a = DeviceBuffer::allocate(&device, 4 * 64 * 2, kernel.group_id(4).unwrap(), MemoryKind::HostOnly).unwrap();
    buffers.sync_to_device().unwrap();

    assert!(matches!(
        kernel.invoke(Opcode::RUN_SEQUENCE, &buffers.args()),
        Err(RuntimeError::InvalidArgument(_))
    ));
}

#[test]
fn test_design_files_drive_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let design = design(4, 64, DType::I16, DType::I16);
    let (image_path, instr_path) = design.write(dir.path()).unwrap();

    let device = SimDevice::new().into_shared();
    let program = LoadedProgram::load(&device, &image_path).unwrap();
    let instructions = npu_runtime::io::load_instructions(&instr_path).unwrap();
    assert_eq!(instructions, design.instructions());

    let report = run_offload::<i16, i16>(&device, &program, &instructions, &config(2), |_, _| Ok(())).unwrap();
    assert!(report.passed());
}

#[test]
fn test_buffers_must_match_the_compiled_design() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);
    let ctx = HwContext::new(&device, &program).unwrap();
    let kernel = Kernel::new(&ctx, "MLIR_AIE").unwrap();
    let instructions = design.instructions();

    assert!(matches!(
        prepare_buffers::<i16, i16>(&kernel, &instructions, &config(1).with_shape(4, 60)),
        Err(RuntimeError::Shape(_))
    ));
    assert!(matches!(
        prepare_buffers::<i16, i16>(&kernel, &instructions, &config(1).with_shape(4, 128)),
        Err(RuntimeError::InvalidArgument(_))
    ));
    assert!(matches!(
        prepare_buffers::<i16, i16>(&kernel, &instructions, &config(1).with_shape(8, 64)),
        Err(RuntimeError::InvalidArgument(_))
    ));
    assert!(matches!(
        prepare_buffers::<i16, i32>(&kernel, &instructions, &config(1)),
        Err(RuntimeError::InvalidArgument(_))
    ));
    assert_eq!(sim.live_buffers(), 0);

    let result = run_offload::<i16, i16>(&device, &program, &instructions, &config(1).with_shape(4, 128), |_, _| Ok(()));
    assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
    assert_eq!(sim.runs_submitted(), 0);
}

#[test]
fn test_slow_warmup_is_left_out_of_timing() {
    let stall = Duration::from_millis(200);
    let sim = SimDevice::with_config(SimConfig::default().with_fault(Fault::Stall { runs: 0..1, duration: stall }));
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);
    let config = PipelineConfig::default().with_measure(MeasureConfig::default().with_warmup(1).with_iterations(3));

    let report = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, _| Ok(())).unwrap();
    assert!(report.passed());
    assert_eq!(report.stats.count(), 3);
    assert!(report.stats.max() < stall);
    assert!(report.stats.total() < stall);
    assert_eq!(sim.runs_submitted(), 4);
}

#[test]
fn test_overflowing_iteration_count_is_rejected() {
    let sim = SimDevice::new();
    let design = design(4, 64, DType::I16, DType::I16);
    let (device, program) = setup(&sim, &design);
    let config = PipelineConfig::default().with_measure(MeasureConfig::default().with_warmup(u32::MAX).with_iterations(2));

    let result = run_offload::<i16, i16>(&device, &program, &design.instructions(), &config, |_, _| Ok(()));
    assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
    assert_eq!(sim.runs_submitted(), 0);
}
