//! Element-wise reduction over byte buffers, used by the loopback runtime.

use half::{bf16, f16};

use crate::status::{NativeResult, NativeStatus};
use crate::types::{DataType, ReduceOp};

/// Reduction as executed by the loopback runtime. `Avg` and pre-multiplied
/// sums are lowered onto these plus [`scale_slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Combine {
    Sum,
    Prod,
    Min,
    Max,
}

impl Combine {
    /// Lower a built-in operator. `Avg` sums; the caller divides afterwards.
    pub(crate) fn lower(op: ReduceOp) -> Option<Combine> {
        match op {
            ReduceOp::Sum | ReduceOp::Avg => Some(Combine::Sum),
            ReduceOp::Prod => Some(Combine::Prod),
            ReduceOp::Min => Some(Combine::Min),
            ReduceOp::Max => Some(Combine::Max),
            ReduceOp::Custom(_) => None,
        }
    }
}

trait Reducible: Copy + 'static {
    fn combine(a: Self, b: Self, op: Combine) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: Combine) -> Self {
                    match op {
                        Combine::Sum => a.wrapping_add(b),
                        Combine::Prod => a.wrapping_mul(b),
                        Combine::Min => a.min(b),
                        Combine::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: Combine) -> Self {
                    match op {
                        Combine::Sum => a + b,
                        Combine::Prod => a * b,
                        Combine::Min => a.min(b),
                        Combine::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (half: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: Combine) -> Self {
                    <$ty>::from_f32(f32::combine(a.to_f32(), b.to_f32(), op))
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);
impl_reducible!(half: f16, bf16);

/// Little-endian element encoding (alignment-safe).
trait LeBytes: Sized {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64, f16, bf16);

/// Floating-point types that can be scaled by an `f64` factor.
trait Scalable: Copy {
    fn scale(self, factor: f64) -> Self;
}

impl Scalable for f32 {
    fn scale(self, factor: f64) -> Self {
        (self as f64 * factor) as f32
    }
}

impl Scalable for f64 {
    fn scale(self, factor: f64) -> Self {
        self * factor
    }
}

impl Scalable for f16 {
    fn scale(self, factor: f64) -> Self {
        f16::from_f64(self.to_f64() * factor)
    }
}

impl Scalable for bf16 {
    fn scale(self, factor: f64) -> Self {
        bf16::from_f64(self.to_f64() * factor)
    }
}

/// `dst[i] = op(dst[i], src[i])` over elements of `dtype`.
///
/// Both slices must hold the same whole number of elements.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    dtype: DataType,
    op: Combine,
) -> NativeResult<()> {
    if dst.len() != src.len() || dst.len() % dtype.size_in_bytes() != 0 {
        return Err(NativeStatus::InvalidArgument);
    }
    match dtype {
        DataType::F32 => reduce_typed::<f32>(dst, src, op),
        DataType::F64 => reduce_typed::<f64>(dst, src, op),
        DataType::F16 => reduce_typed::<f16>(dst, src, op),
        DataType::BF16 => reduce_typed::<bf16>(dst, src, op),
        DataType::I8 => reduce_typed::<i8>(dst, src, op),
        DataType::I32 => reduce_typed::<i32>(dst, src, op),
        DataType::I64 => reduce_typed::<i64>(dst, src, op),
        DataType::U8 => reduce_typed::<u8>(dst, src, op),
        DataType::U32 => reduce_typed::<u32>(dst, src, op),
        DataType::U64 => reduce_typed::<u64>(dst, src, op),
    }
    Ok(())
}

/// `buf[i] *= factor`. Floating-point types only.
pub(crate) fn scale_slice(buf: &mut [u8], dtype: DataType, factor: f64) -> NativeResult<()> {
    match dtype {
        DataType::F32 => scale_typed::<f32>(buf, factor),
        DataType::F64 => scale_typed::<f64>(buf, factor),
        DataType::F16 => scale_typed::<f16>(buf, factor),
        DataType::BF16 => scale_typed::<bf16>(buf, factor),
        _ => return Err(NativeStatus::InvalidArgument),
    }
    Ok(())
}

fn reduce_typed<T: Reducible + LeBytes>(dst: &mut [u8], src: &[u8], op: Combine) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        let r = T::combine(T::read_le(d), T::read_le(s), op);
        r.write_le(d);
    }
}

fn scale_typed<T: Scalable + LeBytes>(buf: &mut [u8], factor: f64) {
    for chunk in buf.chunks_exact_mut(T::SIZE) {
        T::read_le(chunk).scale(factor).write_le(chunk);
    }
}
