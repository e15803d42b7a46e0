//! Element types that a Buffer field can hold.
//!
//! Every element has a fixed little-endian wire encoding, which is what makes
//! a Buffer's layout self-describing across process boundaries.

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

pub use num_complex::{Complex, Complex32, Complex64};

/// Element type of a Buffer field, as carried in the field descriptor on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Complex32,
    Complex64,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
            ElementType::Complex32 => 8,
            ElementType::Complex64 => 16,
        }
    }

    /// Width of the scalar parts an element is built from; complex values
    /// are two scalars, each byte-swapped on its own.
    pub fn scalar_width(&self) -> usize {
        match self {
            ElementType::Complex32 | ElementType::Complex64 => self.size_bytes() / 2,
            _ => self.size_bytes(),
        }
    }

    /// Wire code used in field descriptors
    pub fn code(&self) -> u8 {
        match self {
            ElementType::U8 => 1,
            ElementType::I8 => 2,
            ElementType::U16 => 3,
            ElementType::I16 => 4,
            ElementType::U32 => 5,
            ElementType::I32 => 6,
            ElementType::U64 => 7,
            ElementType::I64 => 8,
            ElementType::F32 => 9,
            ElementType::F64 => 10,
            ElementType::Complex32 => 11,
            ElementType::Complex64 => 12,
        }
    }

    /// Decode a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ElementType::U8,
            2 => ElementType::I8,
            3 => ElementType::U16,
            4 => ElementType::I16,
            5 => ElementType::U32,
            6 => ElementType::I32,
            7 => ElementType::U64,
            8 => ElementType::I64,
            9 => ElementType::F32,
            10 => ElementType::F64,
            11 => ElementType::Complex32,
            12 => ElementType::Complex64,
            _ => return None,
        })
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ElementType::U8 => "u8",
            ElementType::I8 => "i8",
            ElementType::U16 => "u16",
            ElementType::I16 => "i16",
            ElementType::U32 => "u32",
            ElementType::I32 => "i32",
            ElementType::U64 => "u64",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::Complex32 => "complex32",
            ElementType::Complex64 => "complex64",
        }
    }
}

/// A Rust type that can be stored in a Buffer field.
///
/// Elements are plain old data, so a field is viewed as bytes directly and
/// only big-endian hosts pay for a byte swap.
pub trait Element: Pod + Default + Send + 'static {
    /// The field element type this Rust type maps to
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: ElementType = ElementType::$kind;
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    Complex<f32> => Complex32,
    Complex<f64> => Complex64,
}

/// Convert between native and little-endian byte order in place. The
/// conversion is its own inverse.
#[inline]
fn swap_wire_order(kind: ElementType, bytes: &mut [u8]) {
    let width = kind.scalar_width();
    if cfg!(target_endian = "big") && width > 1 {
        for scalar in bytes.chunks_exact_mut(width) {
            scalar.reverse();
        }
    }
}

/// Write `values` as little-endian bytes; `out` must be exactly as long.
pub fn encode_into<T: Element>(values: &[T], out: &mut [u8]) {
    out.copy_from_slice(bytemuck::cast_slice(values));
    swap_wire_order(T::TYPE, out);
}

/// Read a little-endian element array from possibly unaligned bytes.
pub fn decode_from<T: Element>(bytes: &[u8]) -> Vec<T> {
    let mut values: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
    swap_wire_order(T::TYPE, bytemuck::cast_slice_mut(values.as_mut_slice()));
    values
}

/// Read one little-endian element.
pub fn decode_one<T: Element>(bytes: &[u8]) -> T {
    let mut value: T = bytemuck::pod_read_unaligned(bytes);
    swap_wire_order(T::TYPE, bytemuck::bytes_of_mut(&mut value));
    value
}
