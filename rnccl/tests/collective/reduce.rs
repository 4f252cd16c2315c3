use rnccl::{BufferDesc, DataType, ReduceOp, RncclError};

use super::helpers::run_collective;

#[test]
fn test_reduce_result_only_on_root() {
    let root = 1;
    let results = run_collective(3, |p| {
        let send = vec![p.rank() as f32 + 1.0; 4];
        let mut recv = vec![-1.0f32; 4];
        unsafe {
            p.comm
                .bind(p.stream)
                .reduce(
                    root,
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    ReduceOp::Sum,
                )
                .unwrap()
        };
        p.sync();
        recv
    });
    for (rank, recv) in results.iter().enumerate() {
        if rank as u32 == root {
            assert_eq!(recv, &vec![6.0; 4]);
        } else {
            assert_eq!(recv, &vec![-1.0; 4], "rank {rank} recv must be untouched");
        }
    }
}

#[test]
fn test_reduce_max_u8() {
    let results = run_collective(4, |p| {
        let send = vec![p.rank() as u8 * 3, 200 - p.rank() as u8];
        let mut recv = vec![0u8; 2];
        unsafe {
            p.comm
                .bind(p.stream)
                .reduce(
                    0,
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    ReduceOp::Max,
                )
                .unwrap()
        };
        p.sync();
        recv
    });
    assert_eq!(results[0], vec![9, 200]);
}

#[test]
fn test_reduce_non_root_recv_may_be_null() {
    let results = run_collective(2, |p| {
        let send = vec![5i32; 4];
        let mut out = vec![0i32; 4];
        let recv = if p.rank() == 0 {
            BufferDesc::from_mut_slice(&mut out)
        } else {
            BufferDesc::new(0, 4, DataType::I32)
        };
        unsafe {
            p.comm
                .bind(p.stream)
                .reduce(0, BufferDesc::from_slice(&send), recv, ReduceOp::Sum)
                .unwrap()
        };
        p.sync();
        out
    });
    assert_eq!(results[0], vec![10; 4]);
}

#[test]
fn test_reduce_root_recv_must_not_be_null() {
    run_collective(1, |p| {
        let send = vec![1i32; 4];
        let err = unsafe {
            p.comm.bind(p.stream).reduce(
                0,
                BufferDesc::from_slice(&send),
                BufferDesc::new(0, 4, DataType::I32),
                ReduceOp::Sum,
            )
        }
        .unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));
        assert!(err.to_string().contains("recv buffer is a null pointer"));
    });
}
