use rnccl::{BufferDesc, RncclError};

use super::helpers::run_collective;

#[test]
fn test_alltoall_transpose() {
    let results = run_collective(3, |p| {
        // Chunk i of rank r is [10 * r + i; 2].
        let r = p.rank() as u32;
        let send: Vec<u32> = (0..3).flat_map(|i| [10 * r + i; 2]).collect();
        let mut recv = vec![0u32; 6];
        unsafe {
            p.comm
                .bind(p.stream)
                .all_to_all(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                )
                .unwrap()
        };
        p.sync();
        recv
    });
    for (rank, recv) in results.iter().enumerate() {
        let rank = rank as u32;
        let expected: Vec<u32> = (0..3).flat_map(|src| [10 * src + rank; 2]).collect();
        assert_eq!(recv, &expected, "rank {rank} all_to_all failed");
    }
}

#[test]
fn test_alltoall_indivisible_count() {
    run_collective(3, |p| {
        let send = vec![0u8; 4];
        let mut recv = vec![0u8; 4];
        let err = unsafe {
            p.comm.bind(p.stream).all_to_all(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut recv),
            )
        }
        .unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));
        assert!(err.to_string().contains("not divisible"));
    });
}
