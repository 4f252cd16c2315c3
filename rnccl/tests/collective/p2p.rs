use rnccl::{BufferDesc, RncclError};

use super::helpers::run_collective;

#[test]
fn test_send_recv_pair() {
    let results = run_collective(2, |p| {
        let mut data = if p.rank() == 0 {
            vec![4.0f64, 5.0, 6.0]
        } else {
            vec![0.0; 3]
        };
        unsafe {
            let mut bound = p.comm.bind(p.stream);
            if bound.communicator().rank() == 0 {
                bound.send(1, BufferDesc::from_slice(&data)).unwrap();
            } else {
                bound.recv(0, BufferDesc::from_mut_slice(&mut data)).unwrap();
            }
        }
        p.sync();
        data
    });
    assert_eq!(results[1], vec![4.0, 5.0, 6.0]);
}

#[test]
fn test_ring_exchange_in_group() {
    let world = 4;
    let results = run_collective(world, |p| {
        let rank = p.rank();
        let next = (rank + 1) % world;
        let prev = (rank + world - 1) % world;
        let send = vec![rank as i64; 3];
        let mut recv = vec![-1i64; 3];

        // Without a group every rank would block in its own send/recv order;
        // the group lets them progress together.
        let ctx = p.ctx.clone();
        ctx.group(|| unsafe {
            let mut bound = p.comm.bind(p.stream);
            bound.send(next, BufferDesc::from_slice(&send))?;
            bound.recv(prev, BufferDesc::from_mut_slice(&mut recv))?;
            Ok(())
        })
        .unwrap();
        p.sync();
        recv
    });
    for (rank, recv) in results.iter().enumerate() {
        let prev = (rank as i64 + world as i64 - 1) % world as i64;
        assert_eq!(recv, &vec![prev; 3], "rank {rank} ring exchange failed");
    }
}

#[test]
fn test_send_to_self() {
    let results = run_collective(1, |p| {
        let send = vec![42u32; 2];
        let mut recv = vec![0u32; 2];
        let ctx = p.ctx.clone();
        ctx.group(|| unsafe {
            let mut bound = p.comm.bind(p.stream);
            bound.send(0, BufferDesc::from_slice(&send))?;
            bound.recv(0, BufferDesc::from_mut_slice(&mut recv))?;
            Ok(())
        })
        .unwrap();
        p.sync();
        recv
    });
    assert_eq!(results[0], vec![42, 42]);
}

#[test]
fn test_peer_out_of_range() {
    run_collective(2, |p| {
        let data = vec![0u8; 1];
        let err = unsafe { p.comm.bind(p.stream).send(5, BufferDesc::from_slice(&data)) }
            .unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));
        assert!(err.to_string().contains("peer 5"));
    });
}

#[test]
fn test_null_pointer_rejected() {
    run_collective(2, |p| {
        let err = unsafe {
            p.comm
                .bind(p.stream)
                .recv(0, BufferDesc::new(0, 8, rnccl::DataType::F32))
        }
        .unwrap_err();
        assert!(err.to_string().contains("null pointer"));
    });
}
