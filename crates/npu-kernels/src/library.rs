//! Named kernel entry points
//!
//! The compute core links kernels by symbol name. Every supported
//! `(input, output)` element pairing exports two symbols:
//!
//! - `ewise_add_<in>_<out>`: `c = a + b` over one tile, widening into `<out>`
//! - `store_<in>_<out>`: copy one `<out>` tile into the output stream
//!
//! [`KernelLibrary`] maps those names onto byte-level entry points so that a
//! device can run a tile without knowing its element types statically.

use crate::dtype::{DType, Element};
use crate::tile::{TileEvent, TileKernel, TileShape};
use std::collections::HashMap;
use std::fmt;

/// Errors raised by symbol parsing and byte-level dispatch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    #[error("malformed kernel symbol '{0}'")]
    Malformed(String),

    #[error("kernel symbol '{0}' is not exported by the library")]
    NotExported(String),

    #[error("{operand} operand is {actual} bytes, tile needs {expected}")]
    OperandSize {
        operand: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Which tile operation a symbol performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileOp {
    Add,
    Store,
}

impl TileOp {
    const fn prefix(self) -> &'static str {
        match self {
            TileOp::Add => "ewise_add",
            TileOp::Store => "store",
        }
    }
}

/// A parsed kernel symbol such as `ewise_add_bf16_f32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSymbol {
    pub op: TileOp,
    pub dtype_in: DType,
    pub dtype_out: DType,
}

/// Element pairings with compiled kernels
pub const EXPORTS: &[(DType, DType)] = &[
    (DType::I8, DType::I8),
    (DType::I16, DType::I16),
    (DType::I32, DType::I32),
    (DType::Bf16, DType::Bf16),
    (DType::F32, DType::F32),
    (DType::I8, DType::I16),
    (DType::I16, DType::I32),
    (DType::Bf16, DType::F32),
];

impl KernelSymbol {
    pub const fn new(op: TileOp, dtype_in: DType, dtype_out: DType) -> Self {
        Self { op, dtype_in, dtype_out }
    }

    pub fn parse(name: &str) -> Result<Self, SymbolError> {
        let malformed = || SymbolError::Malformed(name.to_string());

        let (op, rest) = if let Some(rest) = name.strip_prefix("ewise_add_") {
            (TileOp::Add, rest)
        } else if let Some(rest) = name.strip_prefix("store_") {
            (TileOp::Store, rest)
        } else {
            return Err(malformed());
        };

        let (input, output) = rest.split_once('_').ok_or_else(malformed)?;
        let dtype_in = input.parse().map_err(|_| malformed())?;
        let dtype_out = output.parse().map_err(|_| malformed())?;
        Ok(Self::new(op, dtype_in, dtype_out))
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Whether the library carries a kernel for this pairing
    pub fn is_exported(&self) -> bool {
        EXPORTS.contains(&(self.dtype_in, self.dtype_out))
    }
}

impl fmt::Display for KernelSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.op.prefix(), self.dtype_in, self.dtype_out)
    }
}

/// Byte-level add: `(shape, a, b, c, on_event)`
pub type AddEntry = fn(TileShape, &[u8], &[u8], &mut [u8], &mut dyn FnMut(TileEvent)) -> Result<(), SymbolError>;

/// Byte-level store: `(shape, c_in, c_out, on_event)`
pub type StoreEntry = fn(TileShape, &[u8], &mut [u8], &mut dyn FnMut(TileEvent)) -> Result<(), SymbolError>;

#[derive(Clone, Copy)]
pub enum TileEntry {
    Add(AddEntry),
    Store(StoreEntry),
}

impl fmt::Debug for TileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileEntry::Add(_) => f.write_str("TileEntry::Add"),
            TileEntry::Store(_) => f.write_str("TileEntry::Store"),
        }
    }
}

fn read_tile<T: Element>(operand: &'static str, bytes: &[u8], len: usize) -> Result<Vec<T>, SymbolError> {
    let expected = len * std::mem::size_of::<T>();
    if bytes.len() != expected {
        return Err(SymbolError::OperandSize {
            operand,
            expected,
            actual: bytes.len(),
        });
    }
    let mut tile = vec![T::zeroed(); len];
    bytemuck::cast_slice_mut::<T, u8>(&mut tile).copy_from_slice(bytes);
    Ok(tile)
}

fn write_tile<T: Element>(tile: &[T], out: &mut [u8]) -> Result<(), SymbolError> {
    let bytes: &[u8] = bytemuck::cast_slice(tile);
    if out.len() != bytes.len() {
        return Err(SymbolError::OperandSize {
            operand: "c",
            expected: bytes.len(),
            actual: out.len(),
        });
    }
    out.copy_from_slice(bytes);
    Ok(())
}

fn add_entry<TIn, TOut>(
    shape: TileShape,
    a: &[u8],
    b: &[u8],
    c: &mut [u8],
    on_event: &mut dyn FnMut(TileEvent),
) -> Result<(), SymbolError>
where
    TIn: Element,
    TOut: Element + From<TIn>,
{
    let a = read_tile::<TIn>("a", a, shape.len())?;
    let b = read_tile::<TIn>("b", b, shape.len())?;
    let mut out = vec![TOut::zeroed(); shape.len()];
    TileKernel::<TIn, TOut>::new(shape).add_observed(&a, &b, &mut out, on_event);
    write_tile(&out, c)
}

fn store_entry<T: Element>(
    shape: TileShape,
    c_in: &[u8],
    c_out: &mut [u8],
    on_event: &mut dyn FnMut(TileEvent),
) -> Result<(), SymbolError> {
    let c_in = read_tile::<T>("c_in", c_in, shape.len())?;
    let mut out = vec![T::zeroed(); shape.len()];
    TileKernel::<T, T>::new(shape).store_observed(&c_in, &mut out, on_event);
    write_tile(&out, c_out)
}

/// Registry of exported tile kernels, keyed by symbol name
#[derive(Debug, Clone)]
pub struct KernelLibrary {
    entries: HashMap<String, TileEntry>,
}

impl KernelLibrary {
    /// Library with every pairing in [`EXPORTS`]
    pub fn new() -> Self {
        let mut library = Self {
            entries: HashMap::new(),
        };
        library.register::<i8, i8>();
        library.register::<i16, i16>();
        library.register::<i32, i32>();
        library.register::<half::bf16, half::bf16>();
        library.register::<f32, f32>();
        library.register::<i8, i16>();
        library.register::<i16, i32>();
        library.register::<half::bf16, f32>();
        library
    }

    fn register<TIn, TOut>(&mut self)
    where
        TIn: Element,
        TOut: Element + From<TIn>,
    {
        let add = KernelSymbol::new(TileOp::Add, TIn::DTYPE, TOut::DTYPE);
        let store = KernelSymbol::new(TileOp::Store, TIn::DTYPE, TOut::DTYPE);
        self.entries.insert(add.name(), TileEntry::Add(add_entry::<TIn, TOut>));
        self.entries.insert(store.name(), TileEntry::Store(store_entry::<TOut>));
    }

    pub fn get(&self, symbol: &str) -> Result<TileEntry, SymbolError> {
        self.entries
            .get(symbol)
            .copied()
            .ok_or_else(|| SymbolError::NotExported(symbol.to_string()))
    }

    pub fn add_entry(&self, symbol: &str) -> Result<AddEntry, SymbolError> {
        match self.get(symbol)? {
            TileEntry::Add(entry) => Ok(entry),
            TileEntry::Store(_) => Err(SymbolError::Malformed(symbol.to_string())),
        }
    }

    pub fn store_entry(&self, symbol: &str) -> Result<StoreEntry, SymbolError> {
        match self.get(symbol)? {
            TileEntry::Store(entry) => Ok(entry),
            TileEntry::Add(_) => Err(SymbolError::Malformed(symbol.to_string())),
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for KernelLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parse_and_name() {
        let symbol = KernelSymbol::parse("ewise_add_bf16_f32").unwrap();
        assert_eq!(symbol, KernelSymbol::new(TileOp::Add, DType::Bf16, DType::F32));
        assert_eq!(symbol.name(), "ewise_add_bf16_f32");

        let store = KernelSymbol::parse("store_i16_i16").unwrap();
        assert_eq!(store.op, TileOp::Store);
        assert!(store.is_exported());
    }

    #[test]
    fn test_symbol_parse_rejects_garbage() {
        for name in ["ewise_mul_i16_i16", "store_i16", "ewise_add_i16_u8", "store__"] {
            assert!(matches!(KernelSymbol::parse(name), Err(SymbolError::Malformed(_))), "{name}");
        }
    }

    #[test]
    fn test_library_exports_every_pair() {
        let library = KernelLibrary::new();
        assert_eq!(library.len(), EXPORTS.len() * 2);
        for &(input, output) in EXPORTS {
            assert!(library.add_entry(&KernelSymbol::new(TileOp::Add, input, output).name()).is_ok());
            assert!(library.store_entry(&KernelSymbol::new(TileOp::Store, input, output).name()).is_ok());
        }
        assert!(matches!(library.get("ewise_add_f32_bf16"), Err(SymbolError::NotExported(_))));
        assert!(library.add_entry("store_i16_i16").is_err());
    }

    #[test]
    fn test_byte_level_add_widens() {
        let library = KernelLibrary::new();
        let add = library.add_entry("ewise_add_i8_i16").unwrap();
        let shape = TileShape::new(64).unwrap();

        let a: Vec<i8> = (0..64).map(|j| j as i8).collect();
        let b: Vec<i8> = (0..64).map(|j| j as i8).collect();
        let mut c = vec![0u8; 64 * 2];
        let mut events = Vec::new();
        add(shape, bytemuck::cast_slice(&a), bytemuck::cast_slice(&b), &mut c, &mut |e| events.push(e)).unwrap();

        let mut out = vec![0i16; 64];
        bytemuck::cast_slice_mut::<i16, u8>(&mut out).copy_from_slice(&c);
        for (j, &v) in out.iter().enumerate() {
            assert_eq!(v, 2 * j as i16);
        }
        assert_eq!(events, vec![TileEvent::Start, TileEvent::End]);
    }

    #[test]
    fn test_byte_level_store_checks_sizes() {
        let library = KernelLibrary::new();
        let store = library.store_entry("store_f32_f32").unwrap();
        let shape = TileShape::new(64).unwrap();
        let src = vec![0u8; 64 * 4];
        let mut short = vec![0u8; 10];
        let err = store(shape, &src, &mut short, &mut |_| {}).unwrap_err();
        assert_eq!(
            err,
            SymbolError::OperandSize {
                operand: "c",
                expected: 256,
                actual: 10
            }
        );
    }
}
