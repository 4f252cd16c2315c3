use half::f16;
use rnccl::{BufferDesc, DataType, ReduceOp, RncclError};

use super::helpers::run_collective;

#[test]
fn test_allreduce_sum_f32() {
    let results = run_collective(4, |p| {
        let rank = p.rank() as f32;
        let send = vec![rank, rank * 10.0, 1.0];
        let mut recv = vec![0.0f32; 3];
        let sub = unsafe {
            p.comm
                .bind(p.stream)
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    ReduceOp::Sum,
                )
                .unwrap()
        };
        assert_eq!(sub.operation(), "all_reduce");
        assert!(!sub.batched());
        p.sync();
        recv
    });
    for (rank, recv) in results.iter().enumerate() {
        assert_eq!(recv, &vec![6.0, 60.0, 4.0], "rank {rank} all_reduce failed");
    }
}

#[test]
fn test_allreduce_in_place() {
    let results = run_collective(3, |p| {
        let mut data = vec![p.rank() as i64 + 1; 5];
        let buf = BufferDesc::from_mut_slice(&mut data);
        unsafe {
            p.comm
                .bind(p.stream)
                .all_reduce(buf, buf, ReduceOp::Prod)
                .unwrap()
        };
        p.sync();
        data
    });
    for data in results {
        assert_eq!(data, vec![6; 5]);
    }
}

#[test]
fn test_allreduce_min_max_i32() {
    let results = run_collective(3, |p| {
        let send = vec![p.rank() as i32 - 1, 10 * p.rank() as i32];
        let mut min = vec![0i32; 2];
        let mut max = vec![0i32; 2];
        unsafe {
            let mut bound = p.comm.bind(p.stream);
            bound
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut min),
                    ReduceOp::Min,
                )
                .unwrap();
            bound
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut max),
                    ReduceOp::Max,
                )
                .unwrap();
        }
        p.sync();
        (min, max)
    });
    for (min, max) in results {
        assert_eq!(min, vec![-1, 0]);
        assert_eq!(max, vec![1, 20]);
    }
}

#[test]
fn test_allreduce_avg_f64() {
    let results = run_collective(4, |p| {
        let send = vec![p.rank() as f64; 2];
        let mut recv = vec![0.0f64; 2];
        unsafe {
            p.comm
                .bind(p.stream)
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    ReduceOp::Avg,
                )
                .unwrap()
        };
        p.sync();
        recv
    });
    for recv in results {
        assert_eq!(recv, vec![1.5, 1.5]);
    }
}

#[test]
fn test_allreduce_avg_rejects_integers() {
    run_collective(2, |p| {
        let send = vec![1u32; 2];
        let mut recv = vec![0u32; 2];
        let err = unsafe {
            p.comm.bind(p.stream).all_reduce(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut recv),
                ReduceOp::Avg,
            )
        }
        .unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }), "{err}");
        assert_eq!(p.submissions(), 0);
    });
}

#[test]
fn test_allreduce_f16() {
    let results = run_collective(2, |p| {
        let send = vec![f16::from_f32(0.5 + p.rank() as f32); 4];
        let mut recv = vec![f16::ZERO; 4];
        unsafe {
            p.comm
                .bind(p.stream)
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    ReduceOp::Sum,
                )
                .unwrap()
        };
        p.sync();
        recv
    });
    for recv in results {
        assert!(recv.iter().all(|v| v.to_f32() == 2.0));
    }
}

#[test]
fn test_allreduce_premul_sum() {
    let results = run_collective(3, |p| {
        // Each rank scales its own contribution by (rank + 1).
        let op = p
            .comm
            .create_premul_sum(p.rank() as f64 + 1.0, DataType::F32)
            .unwrap();
        let send = vec![1.0f32, 2.0];
        let mut recv = vec![0.0f32; 2];
        unsafe {
            p.comm
                .bind(p.stream)
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    op,
                )
                .unwrap()
        };
        p.sync();
        p.comm.destroy_reduce_op(op).unwrap();
        recv
    });
    for recv in results {
        assert_eq!(recv, vec![6.0, 12.0]);
    }
}

#[test]
fn test_custom_op_bound_to_dtype() {
    run_collective(1, |p| {
        let op = p.comm.create_premul_sum(2.0, DataType::F64).unwrap();
        let send = vec![1.0f32];
        let mut recv = vec![0.0f32];
        let err = unsafe {
            p.comm.bind(p.stream).all_reduce(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut recv),
                op,
            )
        }
        .unwrap_err();
        assert!(err.to_string().contains("created for f64"), "{err}");

        p.comm.destroy_reduce_op(op).unwrap();
        let err = p.comm.destroy_reduce_op(op).unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));
    });
}
