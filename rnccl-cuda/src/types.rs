use cudarc::nccl::sys;
use rnccl::{DataType, ReduceOp};

/// Convert an rnccl DataType to the NCCL data type.
pub fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    match dt {
        DataType::I8 => sys::ncclDataType_t::ncclInt8,
        DataType::U8 => sys::ncclDataType_t::ncclUint8,
        DataType::I32 => sys::ncclDataType_t::ncclInt32,
        DataType::U32 => sys::ncclDataType_t::ncclUint32,
        DataType::I64 => sys::ncclDataType_t::ncclInt64,
        DataType::U64 => sys::ncclDataType_t::ncclUint64,
        DataType::F16 => sys::ncclDataType_t::ncclFloat16,
        DataType::F32 => sys::ncclDataType_t::ncclFloat32,
        DataType::F64 => sys::ncclDataType_t::ncclFloat64,
        DataType::BF16 => sys::ncclDataType_t::ncclBfloat16,
    }
}

/// Convert a built-in rnccl ReduceOp to the NCCL reduce operation.
///
/// Returns `None` for [`ReduceOp::Custom`]: NCCL hands out custom operator
/// values outside the range of the generated `ncclRedOp_t` enum.
pub fn to_nccl_op(op: ReduceOp) -> Option<sys::ncclRedOp_t> {
    match op {
        ReduceOp::Sum => Some(sys::ncclRedOp_t::ncclSum),
        ReduceOp::Prod => Some(sys::ncclRedOp_t::ncclProd),
        ReduceOp::Max => Some(sys::ncclRedOp_t::ncclMax),
        ReduceOp::Min => Some(sys::ncclRedOp_t::ncclMin),
        ReduceOp::Avg => Some(sys::ncclRedOp_t::ncclAvg),
        ReduceOp::Custom(_) => None,
    }
}
