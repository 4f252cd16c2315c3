//! Simulated execution streams: one ordered tokio task per stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, join_all};
use tokio::sync::{mpsc, oneshot};

use crate::runtime::loopback::fabric::CommState;
use crate::status::{NativeResult, NativeStatus};

/// One launched primitive waiting for its stream.
pub(crate) struct PendingOp {
    pub(crate) comm: Arc<CommState>,
    pub(crate) name: &'static str,
    pub(crate) work: BoxFuture<'static, NativeResult<()>>,
}

enum StreamJob {
    /// Ops submitted together; they progress concurrently, like a fused group.
    Run(Vec<PendingOp>),
    Fence(oneshot::Sender<()>),
}

pub(crate) struct StreamState {
    id: u64,
    device: usize,
    jobs: mpsc::UnboundedSender<StreamJob>,
    submissions: AtomicU64,
}

impl StreamState {
    pub(crate) fn spawn(id: u64, device: usize, executor: &tokio::runtime::Handle) -> Arc<Self> {
        let (jobs, rx) = mpsc::unbounded_channel();
        executor.spawn(run_stream(id, rx));
        Arc::new(Self {
            id,
            device,
            jobs,
            submissions: AtomicU64::new(0),
        })
    }

    pub(crate) fn device(&self) -> usize {
        self.device
    }

    /// Number of enqueue events seen by this stream.
    pub(crate) fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Acquire)
    }

    /// Enqueue `ops` as one unit.
    pub(crate) fn submit(&self, ops: Vec<PendingOp>) -> NativeResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        tracing::trace!(stream = self.id, ops = ops.len(), "loopback enqueue");
        self.jobs
            .send(StreamJob::Run(ops))
            .map_err(|_| NativeStatus::SystemError)?;
        self.submissions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Block until everything enqueued so far has finished.
    ///
    /// Must not be called from inside a tokio runtime.
    pub(crate) fn fence(&self) -> NativeResult<()> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(StreamJob::Fence(tx))
            .map_err(|_| NativeStatus::SystemError)?;
        rx.blocking_recv().map_err(|_| NativeStatus::SystemError)
    }
}

async fn run_stream(id: u64, mut rx: mpsc::UnboundedReceiver<StreamJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            StreamJob::Run(ops) => {
                join_all(ops.into_iter().map(|op| async move {
                    if let Err(status) = op.work.await {
                        tracing::debug!(stream = id, op = op.name, rank = op.comm.rank, %status, "loopback op failed");
                        op.comm.record_async_error(status);
                        if status.is_fault() {
                            op.comm.group.break_with(status);
                        }
                    }
                }))
                .await;
            }
            StreamJob::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
}
