use rnccl::{BufferDesc, RncclError};

use super::helpers::run_collective;

#[test]
fn test_broadcast_from_root_0() {
    let results = run_collective(3, |p| {
        let send = vec![1.0f32, 2.0, 3.0];
        let mut recv = vec![0.0f32; 3];
        unsafe {
            p.comm
                .bind(p.stream)
                .broadcast(
                    0,
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                )
                .unwrap()
        };
        p.sync();
        recv
    });
    for (rank, recv) in results.iter().enumerate() {
        assert_eq!(recv, &vec![1.0, 2.0, 3.0], "rank {rank} broadcast failed");
    }
}

#[test]
fn test_broadcast_in_place_from_nonzero_root() {
    let root = 2;
    let results = run_collective(4, |p| {
        let mut data: Vec<i32> = if p.rank() == root {
            vec![7, 8, 9]
        } else {
            vec![0; 3]
        };
        let buf = BufferDesc::from_mut_slice(&mut data);
        unsafe { p.comm.bind(p.stream).broadcast(root, buf, buf).unwrap() };
        p.sync();
        data
    });
    for (rank, data) in results.iter().enumerate() {
        assert_eq!(data, &vec![7, 8, 9], "rank {rank} broadcast from root {root} failed");
    }
}

#[test]
fn test_broadcast_root_out_of_range() {
    run_collective(2, |p| {
        let mut data = vec![0u8; 4];
        let buf = BufferDesc::from_mut_slice(&mut data);
        let err = unsafe { p.comm.bind(p.stream).broadcast(2, buf, buf) }.unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));
        assert!(err.to_string().contains("root 2"));
        assert_eq!(p.comm.health(), rnccl::Health::Healthy);
    });
}

#[test]
fn test_broadcast_zero_count() {
    run_collective(2, |p| {
        let empty = BufferDesc::new(0, 0, rnccl::DataType::F32);
        unsafe { p.comm.bind(p.stream).broadcast(0, empty, empty).unwrap() };
        p.sync();
    });
}

#[test]
fn test_broadcast_non_root_send_may_be_null() {
    let results = run_collective(3, |p| {
        let data = vec![4u64, 5];
        let mut recv = vec![0u64; 2];
        let send = if p.rank() == 0 {
            BufferDesc::from_slice(&data)
        } else {
            BufferDesc::new(0, 2, rnccl::DataType::U64)
        };
        unsafe {
            p.comm
                .bind(p.stream)
                .broadcast(0, send, BufferDesc::from_mut_slice(&mut recv))
                .unwrap()
        };
        p.sync();
        recv
    });
    for (rank, recv) in results.iter().enumerate() {
        assert_eq!(recv, &vec![4, 5], "rank {rank} broadcast failed");
    }
}
