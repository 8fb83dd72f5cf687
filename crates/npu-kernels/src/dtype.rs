//! Element types understood by the compute core

use half::bf16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors raised while parsing or pairing element types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DTypeError {
    /// Name not in the supported set
    #[error("unknown element type '{0}' (expected one of i8, i16, i32, bf16, f32)")]
    Unknown(String),

    /// One side integral, the other floating point
    #[error("input type {input} and output type {output} must both be integral or both be floating point")]
    MixedKinds { input: DType, output: DType },

    /// Output narrower than input
    #[error("output type {output} must be at least as wide as input type {input}")]
    Narrowing { input: DType, output: DType },
}

/// Element type tag carried by program images and kernel symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    I16,
    I32,
    Bf16,
    F32,
}

impl DType {
    /// Size of one element in bytes
    pub const fn size_bytes(self) -> usize {
        match self {
            DType::I8 => 1,
            DType::I16 | DType::Bf16 => 2,
            DType::I32 | DType::F32 => 4,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32)
    }

    /// Short name used in kernel symbols (`ewise_add_i16_i16`)
    pub const fn as_str(self) -> &'static str {
        match self {
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
        }
    }

    /// Check that `input` may be widened into `output` by the add kernel.
    pub fn check_pair(input: DType, output: DType) -> Result<(), DTypeError> {
        if input.is_integer() != output.is_integer() {
            return Err(DTypeError::MixedKinds { input, output });
        }
        if output.size_bytes() < input.size_bytes() {
            return Err(DTypeError::Narrowing { input, output });
        }
        Ok(())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = DTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i8" | "int8" => Ok(DType::I8),
            "i16" | "int16" => Ok(DType::I16),
            "i32" | "int32" => Ok(DType::I32),
            "bf16" | "bfloat16" => Ok(DType::Bf16),
            "f32" | "float" | "float32" => Ok(DType::F32),
            other => Err(DTypeError::Unknown(other.to_string())),
        }
    }
}

/// Lane type of a tile vector.
///
/// Integer lanes wrap on overflow the way the vector unit does; floating
/// point lanes round to the element precision after every add.
pub trait Element: bytemuck::Pod + Send + Sync + PartialEq + fmt::Debug + fmt::Display + 'static {
    const DTYPE: DType;

    /// One lane of a vector add
    fn lane_add(self, rhs: Self) -> Self;

    /// Widen into the verifier's accumulation type
    fn to_f64(self) -> f64;

    /// Cast a synthetic pattern value (`i·M + j`) into this type, wrapping
    /// integers and rounding floats.
    fn from_pattern(value: usize) -> Self;
}

macro_rules! impl_int_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline(always)]
            fn lane_add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_pattern(value: usize) -> Self {
                value as $ty
            }
        }
    };
}

impl_int_element!(i8, DType::I8);
impl_int_element!(i16, DType::I16);
impl_int_element!(i32, DType::I32);

impl Element for bf16 {
    const DTYPE: DType = DType::Bf16;

    #[inline(always)]
    fn lane_add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_pattern(value: usize) -> Self {
        bf16::from_f64(value as f64)
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline(always)]
    fn lane_add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_pattern(value: usize) -> Self {
        value as f32
    }
}
