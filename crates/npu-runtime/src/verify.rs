//! Closed-form result verification
//!
//! For operands `A[i][j] = i·M + j` and `B[j] = j`, every cell of the
//! broadcast sum must equal `i·M + 2·j`. The reference is computed in `f64`,
//! wider than any output element type, and compared against the observed
//! value with an absolute tolerance.

use npu_kernels::Element;
use serde::Serialize;

/// Default absolute tolerance, one bf16 step at unit magnitude
pub const DEFAULT_TOLERANCE: f64 = 0.00390635;

/// One out-of-tolerance cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub row: usize,
    pub col: usize,
    /// `NaN` when the cell was missing from the result
    pub observed: f64,
    pub reference: f64,
}

/// Outcome of checking one result matrix
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn errors(&self) -> usize {
        self.mismatches.len()
    }

    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compares a row-major `rows × cols` result against the closed form
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verifier {
    rows: usize,
    cols: usize,
    tolerance: f64,
}

impl Verifier {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn cells(&self) -> usize {
        self.rows * self.cols
    }

    /// Expected value of cell `(i, j)`
    pub fn reference(&self, i: usize, j: usize) -> f64 {
        (i * self.cols + 2 * j) as f64
    }

    /// Count out-of-tolerance cells, logging each one.
    ///
    /// Never fails; callers decide pass/fail from the count.
    pub fn verify<T: Element>(&self, c: &[T]) -> usize {
        self.check(c).errors()
    }

    /// Check every cell once and collect the mismatches.
    #[tracing::instrument(skip(self, c), fields(rows = self.rows, cols = self.cols, tolerance = self.tolerance))]
    pub fn check<T: Element>(&self, c: &[T]) -> VerifyReport {
        if c.len() < self.cells() {
            tracing::warn!(expected = self.cells(), actual = c.len(), "result shorter than matrix");
        }

        let mut report = VerifyReport {
            checked: self.cells(),
            mismatches: Vec::new(),
        };

        for i in 0..self.rows {
            for j in 0..self.cols {
                let reference = self.reference(i, j);
                let Some(value) = c.get(i * self.cols + j) else {
                    tracing::error!(row = i, col = j, reference, "Error at C[{i}][{j}]: missing != {reference}");
                    report.mismatches.push(Mismatch {
                        row: i,
                        col: j,
                        observed: f64::NAN,
                        reference,
                    });
                    continue;
                };

                let observed = value.to_f64();
                if (reference - observed).abs() > self.tolerance {
                    tracing::error!(row = i, col = j, observed, reference, "Error at C[{i}][{j}]: {value} != {reference}");
                    report.mismatches.push(Mismatch {
                        row: i,
                        col: j,
                        observed,
                        reference,
                    });
                } else {
                    tracing::trace!(row = i, col = j, "Correct output C[{i}][{j}]: {value} == {reference}");
                }
            }
        }

        report
    }
}
