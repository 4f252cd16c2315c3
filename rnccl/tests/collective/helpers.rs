use std::sync::Arc;
use std::time::Duration;

use rnccl::{
    CommContext, Communicator, GroupToken, LoopbackFabric, LoopbackRuntime, RncclConfig, StreamId,
};

/// One simulated participant: its own runtime view, context, communicator
/// and stream on its own device.
pub struct Participant {
    pub runtime: Arc<LoopbackRuntime>,
    pub ctx: Arc<CommContext>,
    pub comm: Communicator,
    pub stream: StreamId,
}

impl Participant {
    pub fn rank(&self) -> u32 {
        self.comm.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.comm.world_size()
    }

    /// Wait for this participant's stream and surface async errors.
    pub fn sync(&mut self) {
        self.comm.synchronize(self.stream).unwrap();
    }

    pub fn submissions(&self) -> u64 {
        self.runtime.submissions(self.stream).unwrap()
    }
}

pub fn test_config() -> RncclConfig {
    RncclConfig {
        bootstrap_timeout: Duration::from_secs(10),
        ..RncclConfig::default()
    }
}

/// A fabric with one device per rank and a short rendezvous timeout.
pub fn fabric(devices: usize, timeout: Duration) -> Arc<LoopbackFabric> {
    LoopbackFabric::with_bootstrap_timeout(devices, timeout).unwrap()
}

/// Context for one participant of `fabric`.
pub fn context(fabric: &Arc<LoopbackFabric>) -> (Arc<LoopbackRuntime>, Arc<CommContext>) {
    let runtime = Arc::new(LoopbackRuntime::new(Arc::clone(fabric)));
    let ctx = CommContext::with_config(runtime.clone(), test_config());
    (runtime, ctx)
}

/// Run `f` on every rank of a fresh `world_size` group, one thread per rank,
/// then release every communicator. Returns the per-rank outputs in rank
/// order.
pub fn run_collective<F, T>(world_size: u32, f: F) -> Vec<T>
where
    F: Fn(&mut Participant) -> T + Sync,
    T: Send,
{
    let fabric = fabric(world_size as usize, Duration::from_secs(10));
    let token = GroupToken::generate_random().unwrap();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let fabric = &fabric;
                let token = &token;
                let f = &f;
                s.spawn(move || {
                    let (runtime, ctx) = context(fabric);
                    let comm =
                        Communicator::create(&ctx, token, rank, world_size, rank as usize).unwrap();
                    let stream = runtime.create_stream(rank as usize).unwrap();
                    let mut p = Participant {
                        runtime,
                        ctx,
                        comm,
                        stream,
                    };
                    let out = f(&mut p);
                    p.comm.release().unwrap();
                    out
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}
