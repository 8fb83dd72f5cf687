//! npu-eltwise - host runner for the element-wise broadcast add
//!
//! # Commands
//!
//! - `design` - Generate a program image and instruction stream
//! - `run` - Load both, run the kernel repeatedly, time and verify it
//!
//! Runs execute on the simulated accelerator.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use npu_kernels::{DType, Element};
use npu_runtime::design::{DesignConfig, DEFAULT_KERNEL_NAME};
use npu_runtime::invoker::LoadedProgram;
use npu_runtime::measure::{LoopReport, MeasureConfig, StatisticsSummary};
use npu_runtime::pipeline::{run_offload, PipelineConfig};
use npu_runtime::sim::SimDevice;
use npu_runtime::{Device, Result, RuntimeError, DEFAULT_TOLERANCE};
use npu_tracing::TracingConfig;
use serde::Serialize;
use std::sync::Arc;

/// Element-wise broadcast add offload
#[derive(Parser)]
#[command(name = "npu-eltwise")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Verbosity: 0 warnings only, 1 progress, 2 transfers and runs, 3 every cell
    #[arg(short, long, global = true, default_value = "0", env = "NPU_VERBOSITY")]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate final.xclbin and insts.bin for one design
    ///
    /// Examples:
    ///   npu-eltwise design --rows 4 --columns 64
    ///   npu-eltwise design --dtype-in bf16 --dtype-out f32 --trace-sz 8192
    Design(DesignArgs),
    /// Run the kernel, report timings, and verify the output
    ///
    /// Examples:
    ///   npu-eltwise run -x build/final.xclbin -i build/insts.bin -k MLIR_AIE
    ///   npu-eltwise run --iters 100 --warmup 5 --verify false
    Run(RunArgs),
}

#[derive(Args)]
struct DesignArgs {
    /// Rows of A and C (N)
    #[arg(short = 'N', long, default_value = "4")]
    rows: u32,

    /// Columns of A, B, and C (M); also the tile length
    #[arg(short = 'M', long, default_value = "64")]
    columns: u32,

    #[arg(long, default_value = "i16")]
    dtype_in: DType,

    #[arg(long, default_value = "i16")]
    dtype_out: DType,

    /// Bytes of trace buffer appended to C (0 disables tracing)
    #[arg(long, default_value = "0")]
    trace_sz: u32,

    /// Directory receiving final.xclbin and insts.bin
    #[arg(short, long, default_value = "build")]
    out_dir: PathBuf,

    /// Kernel entry name inside the image
    #[arg(long, default_value = DEFAULT_KERNEL_NAME)]
    kernel_name: String,
}

#[derive(Args)]
struct RunArgs {
    /// Program image
    #[arg(short = 'x', long, default_value = "build/final.xclbin", env = "NPU_XCLBIN")]
    xclbin: PathBuf,

    /// Kernel name prefix inside the image
    #[arg(short, long, default_value = DEFAULT_KERNEL_NAME, env = "NPU_KERNEL")]
    kernel: String,

    /// Instruction file (.bin little-endian words, .txt one hex word per line)
    #[arg(short, long, default_value = "build/insts.bin", env = "NPU_INSTR")]
    instr: PathBuf,

    /// Rows of A and C (N)
    #[arg(short = 'N', long, default_value = "4")]
    rows: usize,

    /// Columns of A, B, and C (M)
    #[arg(short = 'M', long, default_value = "64")]
    columns: usize,

    /// Measured iterations
    #[arg(long, default_value = "10")]
    iters: u32,

    /// Warmup iterations, run but not timed or verified
    #[arg(long, default_value = "0")]
    warmup: u32,

    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    verify: bool,

    /// Input element type (defaults to the kernel's)
    #[arg(long)]
    dtype_in: Option<DType>,

    /// Output element type (defaults to the kernel's)
    #[arg(long)]
    dtype_out: Option<DType>,

    /// Bytes of trace buffer appended to C
    #[arg(long, default_value = "0")]
    trace_sz: usize,

    #[arg(long, default_value = "trace.txt")]
    trace_file: PathBuf,

    /// Give up on a run after this many milliseconds (waits forever if unset)
    #[arg(long, env = "NPU_WAIT_TIMEOUT_MS")]
    wait_timeout_ms: Option<u64>,

    /// Write a JSON summary of the run here
    #[arg(long)]
    report_json: Option<PathBuf>,
}

/// Machine-readable run summary
#[derive(Serialize)]
struct RunSummary<'a> {
    kernel: &'a str,
    rows: usize,
    columns: usize,
    dtype_in: DType,
    dtype_out: DType,
    warmup: u32,
    iterations: u32,
    verified_iterations: u32,
    errors: usize,
    passed: bool,
    latency: StatisticsSummary,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing_config = TracingConfig::from_env().with_verbosity(cli.verbosity);
    if let Err(err) = npu_tracing::init_global_tracing(&tracing_config) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let outcome = match cli.command {
        Commands::Design(args) => generate_design(&args).map(|()| ExitCode::SUCCESS),
        Commands::Run(args) => run(&args).map(|report| ExitCode::from(report.exit_code() as u8)),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "fatal");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn generate_design(args: &DesignArgs) -> Result<()> {
    let config = DesignConfig {
        rows: args.rows,
        cols: args.columns,
        dtype_in: args.dtype_in,
        dtype_out: args.dtype_out,
        trace_size: args.trace_sz,
        kernel_name: args.kernel_name.clone(),
    };
    let design = config.generate()?;
    let (image, instr) = design.write(&args.out_dir)?;
    println!("Wrote {} ({} kernel)", image.display(), args.kernel_name);
    println!("Wrote {} ({} words)", instr.display(), design.instructions().len());
    Ok(())
}

fn run(args: &RunArgs) -> Result<LoopReport> {
    let instructions = npu_runtime::io::load_instructions(&args.instr)?;

    let device = SimDevice::new().into_shared();
    let program = LoadedProgram::load(&device, &args.xclbin)?;

    let entry = program.image().resolve(&args.kernel)?;
    let (dtype_in, dtype_out) = (
        args.dtype_in.unwrap_or(entry.design.dtype_in),
        args.dtype_out.unwrap_or(entry.design.dtype_out),
    );
    if (dtype_in, dtype_out) != (entry.design.dtype_in, entry.design.dtype_out) {
        return Err(RuntimeError::invalid_argument(format!(
            "kernel '{}' computes {} -> {}, not {dtype_in} -> {dtype_out}",
            entry.name, entry.design.dtype_in, entry.design.dtype_out
        )));
    }
    if (args.rows, args.columns) != (entry.design.rows as usize, entry.design.cols as usize) {
        return Err(RuntimeError::invalid_argument(format!(
            "kernel '{}' streams {}x{} tiles, not {}x{}",
            entry.name, entry.design.rows, entry.design.cols, args.rows, args.columns
        )));
    }
    let kernel_name = entry.name.clone();

    let config = PipelineConfig::default()
        .with_shape(args.rows, args.columns)
        .with_trace_size(args.trace_sz)
        .with_kernel_prefix(args.kernel.clone())
        .with_tolerance(DEFAULT_TOLERANCE)
        .with_measure(
            MeasureConfig::default()
                .with_warmup(args.warmup)
                .with_iterations(args.iters)
                .with_verify(args.verify)
                .with_wait_timeout(args.wait_timeout_ms.map(Duration::from_millis)),
        );

    let report = match (dtype_in, dtype_out) {
        (DType::I8, DType::I8) => offload::<i8, i8>(&device, &program, &instructions, &config, args)?,
        (DType::I16, DType::I16) => offload::<i16, i16>(&device, &program, &instructions, &config, args)?,
        (DType::I32, DType::I32) => offload::<i32, i32>(&device, &program, &instructions, &config, args)?,
        (DType::Bf16, DType::Bf16) => offload::<half::bf16, half::bf16>(&device, &program, &instructions, &config, args)?,
        (DType::F32, DType::F32) => offload::<f32, f32>(&device, &program, &instructions, &config, args)?,
        (DType::I8, DType::I16) => offload::<i8, i16>(&device, &program, &instructions, &config, args)?,
        (DType::I16, DType::I32) => offload::<i16, i32>(&device, &program, &instructions, &config, args)?,
        (DType::Bf16, DType::F32) => offload::<half::bf16, f32>(&device, &program, &instructions, &config, args)?,
        (a, b) => {
            return Err(RuntimeError::invalid_argument(format!(
                "no host path for {a} -> {b}"
            )))
        }
    };

    print_report(&report);
    if let Some(path) = &args.report_json {
        write_summary(path, &kernel_name, dtype_in, dtype_out, args, &report)?;
    }
    Ok(report)
}

fn offload<TIn: Element, TOut: Element>(
    device: &Arc<dyn Device>,
    program: &LoadedProgram,
    instructions: &[u32],
    config: &PipelineConfig,
    args: &RunArgs,
) -> Result<LoopReport> {
    run_offload::<TIn, TOut>(device, program, instructions, config, |record, c| {
        if config.trace_size > 0 {
            tracing::debug!(iteration = record.iteration, path = %args.trace_file.display(), "writing trace");
            npu_runtime::io::write_trace(c.trace(), &args.trace_file)?;
        }
        Ok(())
    })
}

fn print_report(report: &LoopReport) {
    if let Err(err) = write_report(&mut std::io::stdout().lock(), report) {
        tracing::warn!(error = %err, "failed to print report");
    }
}

fn write_report(out: &mut impl Write, report: &LoopReport) -> std::io::Result<()> {
    let stats = &report.stats;
    if let (Some(mean), Some(min)) = (stats.mean(), stats.min()) {
        writeln!(out)?;
        writeln!(out, "Avg NPU time: {:.1}us.", mean.as_secs_f64() * 1e6)?;
        writeln!(out, "Min NPU time: {:.1}us.", min.as_secs_f64() * 1e6)?;
        writeln!(out, "Max NPU time: {:.1}us.", stats.max().as_secs_f64() * 1e6)?;
        writeln!(out, "Total NPU time: {:.1}us.", stats.total().as_secs_f64() * 1e6)?;
    }

    if report.passed() {
        writeln!(out, "\nPASS!\n")
    } else {
        writeln!(out, "\nError count: {}\n", report.errors)?;
        writeln!(out, "\nFailed.\n")
    }
}

fn write_summary(
    path: &Path,
    kernel: &str,
    dtype_in: DType,
    dtype_out: DType,
    args: &RunArgs,
    report: &LoopReport,
) -> Result<()> {
    let summary = RunSummary {
        kernel,
        rows: args.rows,
        columns: args.columns,
        dtype_in,
        dtype_out,
        warmup: args.warmup,
        iterations: args.iters,
        verified_iterations: report.verified_iterations,
        errors: report.errors,
        passed: report.passed(),
        latency: StatisticsSummary::from(&report.stats),
    };
    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| RuntimeError::invalid_argument(format!("cannot encode run summary: {e}")))?;
    std::fs::write(path, json)?;
    tracing::info!(path = %path.display(), "run summary written");
    Ok(())
}
