//! Warmup and measured run loop
//!
//! Every iteration submits the kernel against the same buffer set, waits for
//! it, and syncs the output back to the host. Warmup iterations stop there.
//! Measured iterations additionally record the submit-to-completion latency,
//! verify the output when enabled, and notify an observer.
//!
//! Error counts are summed over all measured iterations, so a fault in any
//! one of them fails the loop.

use crate::buffer::DeviceBuffer;
use crate::device::{Opcode, SyncDirection};
use crate::error::{Result, RuntimeError};
use crate::invoker::{Arg, Kernel};
use crate::verify::Verifier;
use npu_kernels::Element;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Loop parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureConfig {
    pub warmup: u32,
    pub iterations: u32,
    pub verify: bool,
    /// `None` blocks on every run indefinitely
    pub wait_timeout: Option<Duration>,
    pub opcode: Opcode,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            warmup: 0,
            iterations: 10,
            verify: true,
            wait_timeout: None,
            opcode: Opcode::RUN_SEQUENCE,
        }
    }
}

impl MeasureConfig {
    pub fn with_warmup(mut self, warmup: u32) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode;
        self
    }
}

/// Latency statistics over measured iterations
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunStatistics {
    count: u32,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = self.max.max(elapsed);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// `None` until the first measured iteration
    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count)
    }
}

/// Serializable summary in microseconds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSummary {
    pub count: u32,
    pub total_us: f64,
    pub min_us: Option<f64>,
    pub max_us: f64,
    pub mean_us: Option<f64>,
}

fn micros(d: Duration) -> f64 {
    d.as_secs_f64() * 1e6
}

impl From<&RunStatistics> for StatisticsSummary {
    fn from(stats: &RunStatistics) -> Self {
        Self {
            count: stats.count,
            total_us: micros(stats.total),
            min_us: stats.min.map(micros),
            max_us: micros(stats.max),
            mean_us: stats.mean().map(micros),
        }
    }
}

/// Operands and instruction stream of one offload, in argument order
#[derive(Debug)]
pub struct BufferSet {
    pub instr: DeviceBuffer,
    pub instr_words: usize,
    pub a: DeviceBuffer,
    pub b: DeviceBuffer,
    pub c: DeviceBuffer,
}

impl BufferSet {
    /// Arguments after the opcode: `(instr, instr_count, a, b, c)`
    pub fn args(&self) -> [Arg<'_>; 5] {
        [
            Arg::Buffer(&self.instr),
            Arg::Scalar(self.instr_words as u64),
            Arg::Buffer(&self.a),
            Arg::Buffer(&self.b),
            Arg::Buffer(&self.c),
        ]
    }

    /// Sync every buffer host to device.
    pub fn sync_to_device(&mut self) -> Result<()> {
        let _span = npu_tracing::perf_span!("sync_inputs", buffers = 4);
        self.instr.sync(SyncDirection::ToDevice)?;
        self.a.sync(SyncDirection::ToDevice)?;
        self.b.sync(SyncDirection::ToDevice)?;
        self.c.sync(SyncDirection::ToDevice)
    }
}

/// What happened in one measured iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    /// Index among all iterations, warmup included
    pub iteration: u32,
    pub elapsed: Duration,
    /// `None` when verification is disabled
    pub errors: Option<usize>,
}

/// Result of a complete loop
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub stats: RunStatistics,
    /// Mismatches summed over measured iterations
    pub errors: usize,
    pub verified_iterations: u32,
}

impl LoopReport {
    pub fn passed(&self) -> bool {
        self.errors == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

/// Drives warmup and measured iterations of one kernel
#[derive(Debug, Clone)]
pub struct MeasurementLoop {
    config: MeasureConfig,
}

impl MeasurementLoop {
    pub fn new(config: MeasureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MeasureConfig {
        &self.config
    }

    /// Run the loop without a per-iteration observer.
    pub fn run<T: Element>(&self, kernel: &Kernel<'_>, buffers: &mut BufferSet, verifier: &Verifier) -> Result<LoopReport> {
        self.run_observed::<T>(kernel, buffers, verifier, |_, _| Ok(()))
    }

    /// Run the loop, calling `observer` after every measured iteration with
    /// the freshly synced output buffer.
    #[tracing::instrument(skip_all, fields(kernel = kernel.name(), warmup = self.config.warmup, iterations = self.config.iterations))]
    pub fn run_observed<T: Element>(
        &self,
        kernel: &Kernel<'_>,
        buffers: &mut BufferSet,
        verifier: &Verifier,
        mut observer: impl FnMut(&IterationRecord, &DeviceBuffer) -> Result<()>,
    ) -> Result<LoopReport> {
        let total = self.config.warmup.checked_add(self.config.iterations).ok_or_else(|| {
            RuntimeError::invalid_argument(format!(
                "{} warmup plus {} measured iterations overflows the loop counter",
                self.config.warmup, self.config.iterations
            ))
        })?;
        let mut stats = RunStatistics::new();
        let mut errors = 0usize;
        let mut verified_iterations = 0u32;

        for iteration in 0..total {
            let warmup = iteration < self.config.warmup;
            tracing::info!(iteration, warmup, "Running kernel");

            let start = Instant::now();
            {
                let mut run = kernel.invoke(self.config.opcode, &buffers.args())?;
                run.wait(self.config.wait_timeout)?;
            }
            let elapsed = start.elapsed();

            buffers.c.sync(SyncDirection::FromDevice)?;
            npu_tracing::performance::record_run(kernel.name(), iteration, elapsed.as_micros() as u64, warmup);

            if warmup {
                continue;
            }

            stats.record(elapsed);

            let iteration_errors = if self.config.verify {
                tracing::info!(iteration, "Verifying results");
                let (found, verify_us) = npu_tracing::timed_block!("verify", {
                    verifier.verify::<T>(buffers.c.map::<T>()?)
                });
                tracing::debug!(iteration, errors = found, verify_us, "verification_complete");
                errors += found;
                verified_iterations += 1;
                Some(found)
            } else {
                tracing::warn!(iteration, "results not verified");
                None
            };

            let record = IterationRecord {
                iteration,
                elapsed,
                errors: iteration_errors,
            };
            observer(&record, &buffers.c)?;
        }

        Ok(LoopReport {
            stats,
            errors,
            verified_iterations,
        })
    }
}
