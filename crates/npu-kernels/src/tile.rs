//! Fixed-shape vectorized tile kernels
//!
//! A tile of `len` elements is processed in chunks of [`VECTOR_WIDTH`] lanes.
//! Each chunk loads one vector from every input, performs a single vector
//! operation, and stores one vector to the output, after which all cursors
//! advance by one vector. The loop body is branch-free so the compute core can
//! software-pipeline it; that only pays off when the loop runs at least
//! [`MIN_PIPELINE_ITERATIONS`] times, which is why tile shapes are validated
//! before a kernel can be built.
//!
//! ```text
//!   a: |v0|v1|v2| ... |vF-1|     F = len / VECTOR_WIDTH
//!   b: |v0|v1|v2| ... |vF-1|
//!        +  +  +        +
//!   c: |v0|v1|v2| ... |vF-1|
//! ```

use crate::dtype::Element;
use std::marker::PhantomData;

/// Lanes per vector load/add/store
pub const VECTOR_WIDTH: usize = 8;

/// Minimum chunk iterations needed to amortize pipeline fill and drain
pub const MIN_PIPELINE_ITERATIONS: usize = 8;

/// Default tile length used by the compute core
pub const DEFAULT_TILE_LEN: usize = 64;

/// Shape validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("tile length {len} is not a multiple of the vector width {vector_width}")]
    NotVectorMultiple { len: usize, vector_width: usize },

    #[error("tile length {len} yields {iterations} vector iterations, below the pipelining minimum of {minimum}")]
    BelowPipelineMinimum {
        len: usize,
        iterations: usize,
        minimum: usize,
    },
}

/// A validated tile length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    len: usize,
}

impl TileShape {
    /// Validate a tile length.
    ///
    /// Rejects lengths that are not a multiple of [`VECTOR_WIDTH`] and
    /// lengths shorter than `VECTOR_WIDTH * MIN_PIPELINE_ITERATIONS`. Nothing
    /// is ever truncated.
    pub const fn new(len: usize) -> Result<Self, ShapeError> {
        if len % VECTOR_WIDTH != 0 {
            return Err(ShapeError::NotVectorMultiple {
                len,
                vector_width: VECTOR_WIDTH,
            });
        }
        let iterations = len / VECTOR_WIDTH;
        if iterations < MIN_PIPELINE_ITERATIONS {
            return Err(ShapeError::BelowPipelineMinimum {
                len,
                iterations,
                minimum: MIN_PIPELINE_ITERATIONS,
            });
        }
        Ok(Self { len })
    }

    /// Elements per tile
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Vector iterations per tile (`F`)
    pub const fn chunks(&self) -> usize {
        self.len / VECTOR_WIDTH
    }
}

impl Default for TileShape {
    fn default() -> Self {
        Self { len: DEFAULT_TILE_LEN }
    }
}

struct AssertTile<const M: usize>;

impl<const M: usize> AssertTile<M> {
    const VALID: () = assert!(
        M % VECTOR_WIDTH == 0 && M / VECTOR_WIDTH >= MIN_PIPELINE_ITERATIONS,
        "tile length must be a multiple of VECTOR_WIDTH spanning at least MIN_PIPELINE_ITERATIONS vectors"
    );
}

/// Markers emitted around every kernel body, recorded by the device into the
/// trace region when tracing is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TileEvent {
    Start = 0,
    End = 1,
}

/// `V` lanes held in registers
#[derive(Debug, Clone, Copy)]
pub struct Vector<T, const V: usize>([T; V]);

impl<T: Element, const V: usize> Vector<T, V> {
    /// Load `V` lanes from the front of `src`.
    #[inline(always)]
    pub fn load(src: &[T]) -> Self {
        let mut lanes = [T::zeroed(); V];
        lanes.copy_from_slice(&src[..V]);
        Self(lanes)
    }

    /// Lane-wise add, widening both operands into the output type first.
    #[inline(always)]
    pub fn add<O: Element + From<T>>(self, rhs: Self) -> Vector<O, V> {
        Vector(std::array::from_fn(|k| O::from(self.0[k]).lane_add(O::from(rhs.0[k]))))
    }

    #[inline(always)]
    pub fn convert<O: Element + From<T>>(self) -> Vector<O, V> {
        Vector(std::array::from_fn(|k| O::from(self.0[k])))
    }

    /// Store all lanes to the front of `dst`.
    #[inline(always)]
    pub fn store(self, dst: &mut [T]) {
        dst[..V].copy_from_slice(&self.0);
    }

    pub fn lanes(&self) -> &[T; V] {
        &self.0
    }
}

/// Element-wise kernels over one tile.
///
/// Inputs are shared borrows and the output an exclusive borrow, so the
/// non-aliasing requirement of the pipelined loop holds by construction.
/// Slice lengths shorter than the tile are a caller contract violation and are
/// only checked in debug builds.
#[derive(Debug, Clone, Copy)]
pub struct TileKernel<TIn, TOut> {
    shape: TileShape,
    _types: PhantomData<fn(TIn) -> TOut>,
}

impl<TIn, TOut> TileKernel<TIn, TOut>
where
    TIn: Element,
    TOut: Element + From<TIn>,
{
    pub fn new(shape: TileShape) -> Self {
        Self {
            shape,
            _types: PhantomData,
        }
    }

    /// Kernel for a compile-time tile length; invalid `M` fails to build.
    pub fn fixed<const M: usize>() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = AssertTile::<M>::VALID;
        Self::new(TileShape { len: M })
    }

    pub fn shape(&self) -> TileShape {
        self.shape
    }

    /// `c[k] = a[k] + b[k]` for every `k` in the tile.
    pub fn add(&self, a: &[TIn], b: &[TIn], c: &mut [TOut]) {
        self.add_observed(a, b, c, &mut |_| {});
    }

    /// [`add`](Self::add) with start/end markers reported to `on_event`.
    pub fn add_observed(&self, a: &[TIn], b: &[TIn], c: &mut [TOut], on_event: &mut dyn FnMut(TileEvent)) {
        debug_assert!(a.len() >= self.shape.len() && b.len() >= self.shape.len());
        debug_assert!(c.len() >= self.shape.len());

        on_event(TileEvent::Start);
        let (mut pa, mut pb, mut pc) = (a, b, c);
        for _ in 0..self.shape.chunks() {
            let a0 = Vector::<TIn, VECTOR_WIDTH>::load(pa);
            pa = &pa[VECTOR_WIDTH..];
            let b0 = Vector::<TIn, VECTOR_WIDTH>::load(pb);
            pb = &pb[VECTOR_WIDTH..];
            let out: Vector<TOut, VECTOR_WIDTH> = a0.add(b0);
            let (head, tail) = std::mem::take(&mut pc).split_at_mut(VECTOR_WIDTH);
            out.store(head);
            pc = tail;
        }
        on_event(TileEvent::End);
    }

    /// Vectorized copy of one tile.
    pub fn store(&self, a: &[TIn], c: &mut [TOut]) {
        self.store_observed(a, c, &mut |_| {});
    }

    pub fn store_observed(&self, a: &[TIn], c: &mut [TOut], on_event: &mut dyn FnMut(TileEvent)) {
        debug_assert!(a.len() >= self.shape.len() && c.len() >= self.shape.len());

        on_event(TileEvent::Start);
        let (mut pa, mut pc) = (a, c);
        for _ in 0..self.shape.chunks() {
            let a0 = Vector::<TIn, VECTOR_WIDTH>::load(pa);
            pa = &pa[VECTOR_WIDTH..];
            let (head, tail) = std::mem::take(&mut pc).split_at_mut(VECTOR_WIDTH);
            a0.convert::<TOut>().store(head);
            pc = tail;
        }
        on_event(TileEvent::End);
    }
}
