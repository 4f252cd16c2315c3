use std::time::Duration;

use rnccl::{DataType, Health, HostApi, ReduceOp, RncclError};

use super::helpers::{context, fabric};

/// Run `f` on every rank of a group driven through the flat host surface.
fn run_host<F, T>(world_size: i64, f: F) -> Vec<T>
where
    F: Fn(&HostApi, u64, u64) -> T + Sync,
    T: Send,
{
    let fabric = fabric(world_size as usize, Duration::from_secs(10));
    let (_, ctx) = context(&fabric);
    let token = HostApi::new(ctx).generate_token().unwrap();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let fabric = &fabric;
                let token = &token;
                let f = &f;
                s.spawn(move || {
                    let (runtime, ctx) = context(fabric);
                    let api = HostApi::new(ctx);
                    let handle = api.create(token, rank, world_size, rank).unwrap();
                    let stream = runtime.create_stream(rank as usize).unwrap();
                    f(&api, handle, stream.0)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_host_all_reduce() {
    let results = run_host(3, |api, handle, stream| {
        let send = vec![1.0f32, 2.0];
        let mut recv = vec![0.0f32; 2];
        unsafe {
            api.all_reduce(
                handle,
                stream,
                send.as_ptr() as u64,
                recv.as_mut_ptr() as u64,
                2,
                DataType::F32.tag(),
                ReduceOp::Sum.tag(),
            )
            .unwrap();
        }
        api.synchronize(handle, stream).unwrap();
        api.release(handle).unwrap();
        recv
    });
    for recv in results {
        assert_eq!(recv, vec![3.0, 6.0]);
    }
}

#[test]
fn test_host_gather_scatter_counts() {
    let results = run_host(2, |api, handle, stream| {
        let value = api.context().device_count().unwrap() as i32;
        let send = vec![value; 2];
        let mut gathered = vec![0i32; 4];
        let mut scattered = vec![0i32; 1];
        api.begin_group().unwrap();
        unsafe {
            api.all_gather(
                handle,
                stream,
                send.as_ptr() as u64,
                gathered.as_mut_ptr() as u64,
                2,
                DataType::I32.tag(),
            )
            .unwrap();
            api.reduce_scatter(
                handle,
                stream,
                send.as_ptr() as u64,
                scattered.as_mut_ptr() as u64,
                1,
                DataType::I32.tag(),
                ReduceOp::Sum.tag(),
            )
            .unwrap();
        }
        api.end_group().unwrap();
        api.synchronize(handle, stream).unwrap();
        api.release(handle).unwrap();
        (gathered, scattered)
    });
    for (gathered, scattered) in results {
        assert_eq!(gathered, vec![2; 4]);
        assert_eq!(scattered, vec![4]);
    }
}

#[test]
fn test_host_rejects_loose_integers() {
    run_host(1, |api, handle, stream| {
        let mut buf = vec![0u8; 4];
        let ptr = buf.as_mut_ptr() as u64;

        let err = unsafe { api.all_reduce(handle, stream, ptr, ptr, -4, 1, 0) }.unwrap_err();
        assert!(err.to_string().contains("negative"), "{err}");

        let err = unsafe { api.all_reduce(handle, stream, ptr, ptr, 4, 42, 0) }.unwrap_err();
        assert!(err.to_string().contains("data type tag 42"), "{err}");

        let err = unsafe { api.all_reduce(handle, stream, ptr, ptr, 4, 1, -1) }.unwrap_err();
        assert!(err.to_string().contains("operator tag -1"), "{err}");

        let err = unsafe { api.broadcast(handle, stream, ptr, ptr, 4, 1, -2) }.unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));

        let err = unsafe { api.send(handle, stream, 0, 4, 1, 0) }.unwrap_err();
        assert!(err.to_string().contains("null pointer"), "{err}");

        // Unregistered custom tag decodes but is rejected by the communicator.
        let err = unsafe { api.all_reduce(handle, stream, ptr, ptr, 4, 1, 9) }.unwrap_err();
        assert!(err.to_string().contains("custom#9"), "{err}");

        assert_eq!(api.health(handle).unwrap(), Health::Healthy);
        api.release(handle).unwrap();
    });
}

#[test]
fn test_host_release_tombstones() {
    run_host(1, |api, handle, stream| {
        api.release(handle).unwrap();

        let err = api.release(handle).unwrap_err();
        assert!(matches!(
            err,
            RncclError::InvalidState {
                operation: "release",
                ..
            }
        ));

        let data = vec![0u32; 1];
        let err = unsafe {
            api.send(
                handle,
                stream,
                data.as_ptr() as u64,
                1,
                DataType::U32.tag(),
                0,
            )
        }
        .unwrap_err();
        assert!(matches!(err, RncclError::InvalidState { .. }));
        assert!(matches!(
            api.health(handle).unwrap_err(),
            RncclError::InvalidState { .. }
        ));

        let err = api.release(handle + 100).unwrap_err();
        assert!(matches!(err, RncclError::InvalidArgument { .. }));
    });
}

#[test]
fn test_host_release_after_abort() {
    run_host(1, |api, handle, _| {
        api.abort(handle).unwrap();
        assert_eq!(api.health(handle).unwrap(), Health::Invalid);
        api.release(handle).unwrap();
        assert!(api.release(handle).is_err());
    });
}

#[test]
fn test_host_custom_reduction() {
    let results = run_host(2, |api, handle, stream| {
        let tag = api
            .create_premul_sum(handle, 0.5, DataType::F64.tag())
            .unwrap();
        let send = vec![4.0f64; 3];
        let mut recv = vec![0.0f64; 3];
        unsafe {
            api.all_reduce(
                handle,
                stream,
                send.as_ptr() as u64,
                recv.as_mut_ptr() as u64,
                3,
                DataType::F64.tag(),
                tag,
            )
            .unwrap();
        }
        api.synchronize(handle, stream).unwrap();
        api.destroy_reduce_op(handle, tag).unwrap();
        api.release(handle).unwrap();
        recv
    });
    for recv in results {
        assert_eq!(recv, vec![4.0; 3]);
    }
}

#[test]
fn test_host_create_validation() {
    let fabric = fabric(1, Duration::from_millis(100));
    let (_, ctx) = context(&fabric);
    let api = HostApi::new(ctx);

    let err = api.create(&[0u8; 16], 0, 1, 0).unwrap_err();
    assert!(matches!(err, RncclError::InvalidArgument { .. }));

    let token = api.generate_token().unwrap();
    for (rank, world, device) in [(-1, 1, 0), (0, -1, 0), (0, 1, -1)] {
        let err = api.create(&token, rank, world, device).unwrap_err();
        assert!(matches!(err, RncclError::Initialization { .. }), "{err}");
    }
}
