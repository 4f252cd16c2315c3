//! Device buffer descriptors.
//!
//! A descriptor is the only view this crate has of a host tensor: a raw
//! device pointer, an element count and an element type. Descriptors never
//! dereference the pointer; the runtime does, asynchronously, on the stream.

use crate::error::{Result, RncclError};
use crate::types::{DataType, Element};

/// A typed, sized view of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    ptr: u64,
    count: usize,
    dtype: DataType,
}

impl BufferDesc {
    /// Describe `count` elements of `dtype` starting at device address `ptr`.
    pub fn new(ptr: u64, count: usize, dtype: DataType) -> Self {
        Self { ptr, count, dtype }
    }

    /// Describe a host slice. Only meaningful on runtimes whose "device"
    /// memory is host memory, such as the loopback runtime.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self::new(data.as_ptr() as u64, data.len(), T::DTYPE)
    }

    /// Mutable counterpart of [`BufferDesc::from_slice`].
    pub fn from_mut_slice<T: Element>(data: &mut [T]) -> Self {
        Self::new(data.as_mut_ptr() as u64, data.len(), T::DTYPE)
    }

    /// Get the raw `u64` pointer.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Size of the buffer in bytes.
    pub fn len_bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }

    /// Returns true if the buffer holds zero elements.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True when both descriptors start at the same address (in-place call).
    pub fn aliases(&self, other: &BufferDesc) -> bool {
        self.ptr == other.ptr
    }

    /// Reject descriptors no runtime could accept.
    pub(crate) fn check(&self, operation: &'static str, role: &str) -> Result<()> {
        if self.ptr == 0 && self.count > 0 {
            return Err(RncclError::invalid_argument(
                operation,
                format!("{role} buffer is a null pointer with {} elements", self.count),
            ));
        }
        if self.count.checked_mul(self.dtype.size_in_bytes()).is_none() {
            return Err(RncclError::invalid_argument(
                operation,
                format!("{role} buffer size overflows: {} x {}", self.count, self.dtype),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for BufferDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferDesc(0x{:x}, {}x{})", self.ptr, self.count, self.dtype)
    }
}
