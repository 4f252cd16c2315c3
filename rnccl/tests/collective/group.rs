use rnccl::{BufferDesc, Health, NativeStatus, ReduceOp, RncclError};

use super::helpers::run_collective;

#[test]
fn test_double_begin_rejected() {
    run_collective(1, |p| {
        p.ctx.begin_group().unwrap();
        assert!(p.ctx.in_group());
        let err = p.ctx.begin_group().unwrap_err();
        assert!(matches!(
            err,
            RncclError::InvalidState {
                operation: "begin_group",
                ..
            }
        ));
        p.ctx.end_group().unwrap();
        assert!(!p.ctx.in_group());
    });
}

#[test]
fn test_end_without_begin_rejected() {
    run_collective(1, |p| {
        let err = p.ctx.end_group().unwrap_err();
        assert!(matches!(
            err,
            RncclError::InvalidState {
                operation: "end_group",
                ..
            }
        ));
        assert_eq!(p.comm.health(), Health::Healthy);
    });
}

/// Runs all_reduce + all_gather and returns both outputs.
fn reduce_and_gather(p: &mut super::helpers::Participant, batched: bool) -> (Vec<f32>, Vec<f32>) {
    let world = p.world_size() as usize;
    let send = vec![p.rank() as f32 + 1.0; 2];
    let mut reduced = vec![0.0f32; 2];
    let mut gathered = vec![0.0f32; 2 * world];
    let ctx = p.ctx.clone();
    let mut issue = || -> rnccl::Result<()> {
        let mut bound = p.comm.bind(p.stream);
        let a = unsafe {
            bound.all_reduce(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut reduced),
                ReduceOp::Sum,
            )?
        };
        let b = unsafe {
            bound.all_gather(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut gathered),
            )?
        };
        assert_eq!(a.batched(), batched);
        assert_eq!(b.batched(), batched);
        Ok(())
    };
    if batched {
        ctx.group(issue).unwrap();
    } else {
        issue().unwrap();
    }
    p.sync();
    (reduced, gathered)
}

#[test]
fn test_batched_matches_unbatched() {
    let results = run_collective(3, |p| {
        let before = p.submissions();
        let plain = reduce_and_gather(p, false);
        let after_plain = p.submissions();
        let fused = reduce_and_gather(p, true);
        let after_fused = p.submissions();
        (plain, fused, after_plain - before, after_fused - after_plain)
    });
    for (plain, fused, plain_events, fused_events) in results {
        assert_eq!(plain, fused);
        assert_eq!(plain.0, vec![6.0, 6.0]);
        assert_eq!(plain.1, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        assert_eq!(plain_events, 2);
        assert_eq!(fused_events, 1, "a fused group is one enqueue event");
    }
}

#[test]
fn test_queued_failure_surfaces_at_end_group() {
    run_collective(1, |p| {
        let send = vec![2.0f32; 4];
        let mut good = vec![0.0f32; 4];
        let mut bad = vec![0.0f32; 3];

        p.ctx.begin_group().unwrap();
        let ok = unsafe {
            p.comm.bind(p.stream).all_reduce(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut good),
                ReduceOp::Sum,
            )
        }
        .unwrap();
        assert!(ok.batched());
        // Count relation violated; reported at end_group, not here.
        let queued = unsafe {
            p.comm.bind(p.stream).all_gather(
                BufferDesc::from_slice(&send),
                BufferDesc::from_mut_slice(&mut bad),
            )
        };
        assert!(queued.is_ok());

        let err = p.ctx.end_group().unwrap_err();
        assert!(matches!(
            err,
            RncclError::InvalidArgument {
                operation: "all_gather",
                ..
            }
        ));
        p.sync();
        assert_eq!(good, vec![2.0; 4]);
        assert_eq!(bad, vec![0.0; 3]);
        assert_eq!(p.comm.health(), Health::Healthy);
    });
}

#[test]
fn test_group_closure_closes_on_error() {
    run_collective(1, |p| {
        let err = p
            .ctx
            .group(|| -> rnccl::Result<()> {
                Err(RncclError::invalid_argument("user", "bail out"))
            })
            .unwrap_err();
        assert!(err.to_string().contains("bail out"));
        assert!(!p.ctx.in_group());
        p.ctx.begin_group().unwrap();
        p.ctx.end_group().unwrap();
    });
}

#[test]
fn test_empty_group_submits_nothing() {
    run_collective(2, |p| {
        p.ctx.group(|| Ok(())).unwrap();
        assert_eq!(p.submissions(), 0);
    });
}

#[test]
fn test_fused_submission_fault_invalidates_communicator() {
    run_collective(1, |p| {
        let send = vec![1.0f32; 2];
        let mut recv = vec![0.0f32; 2];
        p.runtime
            .fail_next_group_end(NativeStatus::SystemError)
            .unwrap();

        p.ctx.begin_group().unwrap();
        unsafe {
            p.comm
                .bind(p.stream)
                .all_reduce(
                    BufferDesc::from_slice(&send),
                    BufferDesc::from_mut_slice(&mut recv),
                    ReduceOp::Sum,
                )
                .unwrap();
        }
        let err = p.ctx.end_group().unwrap_err();
        assert!(matches!(
            err,
            RncclError::OperationFailed {
                operation: "end_group",
                status: NativeStatus::SystemError
            }
        ));
        assert_eq!(p.comm.health(), Health::Invalid);
        assert_eq!(p.submissions(), 0);
        assert_eq!(recv, vec![0.0; 2]);
    });
}

#[test]
fn test_fused_submission_misuse_keeps_communicator() {
    run_collective(1, |p| {
        p.runtime
            .fail_next_group_end(NativeStatus::InvalidUsage)
            .unwrap();
        p.ctx.begin_group().unwrap();
        let err = p.ctx.end_group().unwrap_err();
        assert!(matches!(
            err,
            RncclError::InvalidArgument {
                operation: "end_group",
                ..
            }
        ));
        assert_eq!(p.comm.health(), Health::Healthy);
        p.comm.check_health().unwrap();
    });
}
