//! Shared state of a simulated cluster: rendezvous, groups, communicators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::runtime::loopback::reduce::{Combine, reduce_slice, scale_slice};
use crate::runtime::loopback::stream::StreamState;
use crate::runtime::{CollectiveCall, StreamId};
use crate::status::{NativeResult, NativeStatus};
use crate::token::GroupToken;
use crate::types::{CustomReduce, DataType, Rank, ReduceOp};

pub(crate) fn lock<T>(m: &Mutex<T>) -> NativeResult<MutexGuard<'_, T>> {
    m.lock().map_err(|_| NativeStatus::InternalError)
}

/// Why a participant could not join a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JoinFailure {
    WorldSizeMismatch { expected: u32, got: u32 },
    RankOutOfRange { rank: Rank, world_size: u32 },
    DuplicateRank(Rank),
    InvalidDevice { device: usize, device_count: usize },
    AlreadyFormed,
    TimedOut { joined: u32, expected: u32 },
    Poisoned(String),
}

impl JoinFailure {
    pub(crate) fn status(&self) -> NativeStatus {
        match self {
            JoinFailure::InvalidDevice { .. } => NativeStatus::InvalidArgument,
            JoinFailure::TimedOut { .. } => NativeStatus::SystemError,
            JoinFailure::Poisoned(_) => NativeStatus::RemoteError,
            _ => NativeStatus::InvalidUsage,
        }
    }
}

impl std::fmt::Display for JoinFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinFailure::WorldSizeMismatch { expected, got } => {
                write!(f, "world size mismatch: group expects {expected}, got {got}")
            }
            JoinFailure::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} outside world of size {world_size}")
            }
            JoinFailure::DuplicateRank(rank) => write!(f, "rank {rank} joined twice"),
            JoinFailure::InvalidDevice {
                device,
                device_count,
            } => write!(f, "device {device} not present ({device_count} devices)"),
            JoinFailure::AlreadyFormed => f.write_str("group already formed for this token"),
            JoinFailure::TimedOut { joined, expected } => {
                write!(f, "rendezvous timed out: {joined}/{expected} joined")
            }
            JoinFailure::Poisoned(reason) => write!(f, "rendezvous failed: {reason}"),
        }
    }
}

struct RendezvousState {
    world_size: u32,
    members: Vec<bool>,
    joined: u32,
    /// Members that have picked up a successful outcome.
    delivered: u32,
    outcome: Option<Result<Arc<GroupState>, String>>,
}

/// All-or-nothing group formation for one token.
struct Rendezvous {
    state: Mutex<RendezvousState>,
    ready: Condvar,
}

impl Rendezvous {
    fn new(world_size: u32) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                world_size,
                members: vec![false; world_size as usize],
                joined: 0,
                delivered: 0,
                outcome: None,
            }),
            ready: Condvar::new(),
        }
    }
}

/// One contribution to a collective.
pub(crate) struct Part {
    shape: Shape,
    data: Vec<u8>,
}

/// What every participant of one collective must agree on.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Shape {
    operation: &'static str,
    count: usize,
    dtype: DataType,
    reduction: Option<Reduction>,
    root: Option<Rank>,
}

/// A reduction operator resolved against its communicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Reduction {
    Builtin(ReduceOp),
    /// Inputs are scaled locally before summation; the scalar may differ
    /// per rank, so it is not part of the agreement.
    PreMulSum,
}

struct Slot {
    parts: Vec<Option<Part>>,
    arrived: usize,
    waiters: Vec<oneshot::Sender<NativeResult<Arc<Vec<Part>>>>>,
}

enum Mailbox {
    Data(Vec<u8>),
    Waiting(oneshot::Sender<NativeResult<Vec<u8>>>),
}

#[derive(Default)]
struct Exchange {
    broken: Option<NativeStatus>,
    collectives: HashMap<u64, Slot>,
    mailboxes: HashMap<(Rank, Rank, u64), Mailbox>,
}

/// A formed group: where contributions meet.
pub(crate) struct GroupState {
    id: u64,
    world_size: u32,
    exchange: Mutex<Exchange>,
}

impl GroupState {
    fn new(id: u64, world_size: u32) -> Self {
        Self {
            id,
            world_size,
            exchange: Mutex::new(Exchange::default()),
        }
    }

    pub(crate) fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Fail everything in flight and everything issued later.
    pub(crate) fn break_with(&self, status: NativeStatus) {
        let Ok(mut ex) = lock(&self.exchange) else {
            return;
        };
        if ex.broken.is_none() {
            tracing::warn!(group = self.id, %status, "loopback group broken");
            ex.broken = Some(status);
        }
        for (_, slot) in ex.collectives.drain() {
            for w in slot.waiters {
                let _ = w.send(Err(status));
            }
        }
        for (_, mailbox) in ex.mailboxes.drain() {
            if let Mailbox::Waiting(tx) = mailbox {
                let _ = tx.send(Err(status));
            }
        }
    }

    async fn contribute(&self, seq: u64, rank: Rank, part: Part) -> NativeResult<Arc<Vec<Part>>> {
        let rx = {
            let mut ex = lock(&self.exchange)?;
            if let Some(status) = ex.broken {
                return Err(status);
            }
            let world = self.world_size as usize;
            let (tx, rx) = oneshot::channel();
            let complete = {
                let slot = ex.collectives.entry(seq).or_insert_with(|| Slot {
                    parts: (0..world).map(|_| None).collect(),
                    arrived: 0,
                    waiters: Vec::with_capacity(world),
                });
                if slot.parts[rank as usize].replace(part).is_some() {
                    return Err(NativeStatus::InternalError);
                }
                slot.arrived += 1;
                slot.waiters.push(tx);
                slot.arrived == world
            };
            if complete && let Some(slot) = ex.collectives.remove(&seq) {
                let parts: Arc<Vec<Part>> = Arc::new(slot.parts.into_iter().flatten().collect());
                for w in slot.waiters {
                    let _ = w.send(Ok(Arc::clone(&parts)));
                }
            }
            rx
        };
        rx.await.map_err(|_| NativeStatus::InternalError)?
    }

    fn post(&self, key: (Rank, Rank, u64), data: Vec<u8>) -> NativeResult<()> {
        let mut ex = lock(&self.exchange)?;
        if let Some(status) = ex.broken {
            return Err(status);
        }
        match ex.mailboxes.remove(&key) {
            Some(Mailbox::Waiting(tx)) => {
                let _ = tx.send(Ok(data));
                Ok(())
            }
            Some(Mailbox::Data(_)) => Err(NativeStatus::InternalError),
            None => {
                ex.mailboxes.insert(key, Mailbox::Data(data));
                Ok(())
            }
        }
    }

    async fn take(&self, key: (Rank, Rank, u64)) -> NativeResult<Vec<u8>> {
        let rx = {
            let mut ex = lock(&self.exchange)?;
            if let Some(status) = ex.broken {
                return Err(status);
            }
            match ex.mailboxes.remove(&key) {
                Some(Mailbox::Data(data)) => return Ok(data),
                Some(Mailbox::Waiting(_)) => return Err(NativeStatus::InternalError),
                None => {
                    let (tx, rx) = oneshot::channel();
                    ex.mailboxes.insert(key, Mailbox::Waiting(tx));
                    rx
                }
            }
        };
        rx.await.map_err(|_| NativeStatus::InternalError)?
    }
}

#[derive(Default)]
struct Sequences {
    collective: u64,
    sends: HashMap<Rank, u64>,
    recvs: HashMap<Rank, u64>,
}

#[derive(Debug, Clone, Copy)]
struct PreMulSum {
    scalar: f64,
    dtype: DataType,
}

/// One participant's membership in a group.
pub(crate) struct CommState {
    pub(crate) id: u64,
    pub(crate) rank: Rank,
    pub(crate) device: usize,
    pub(crate) group: Arc<GroupState>,
    seqs: Mutex<Sequences>,
    async_error: Mutex<Option<NativeStatus>>,
    custom_ops: Mutex<HashMap<u32, PreMulSum>>,
    next_op: AtomicU32,
    closed: AtomicBool,
}

impl CommState {
    fn new(id: u64, rank: Rank, device: usize, group: Arc<GroupState>) -> Self {
        Self {
            id,
            rank,
            device,
            group,
            seqs: Mutex::new(Sequences::default()),
            async_error: Mutex::new(None),
            custom_ops: Mutex::new(HashMap::new()),
            next_op: AtomicU32::new(CustomReduce::FIRST_TAG),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn async_error(&self) -> NativeResult<()> {
        match *lock(&self.async_error)? {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    /// Keep the first asynchronous error; later ones are consequences.
    pub(crate) fn record_async_error(&self, status: NativeStatus) {
        if let Ok(mut slot) = lock(&self.async_error) {
            slot.get_or_insert(status);
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn register_premul_sum(&self, scalar: f64, dtype: DataType) -> NativeResult<u32> {
        let tag = self.next_op.fetch_add(1, Ordering::Relaxed);
        lock(&self.custom_ops)?.insert(tag, PreMulSum { scalar, dtype });
        Ok(tag)
    }

    pub(crate) fn unregister_op(&self, tag: u32) -> NativeResult<()> {
        lock(&self.custom_ops)?
            .remove(&tag)
            .map(|_| ())
            .ok_or(NativeStatus::InvalidArgument)
    }

    /// Resolve the call's operator, returning the local pre-scale factor for
    /// custom operators.
    pub(crate) fn resolve(
        &self,
        op: ReduceOp,
        dtype: DataType,
    ) -> NativeResult<(Reduction, Option<f64>)> {
        match op {
            ReduceOp::Custom(custom) => {
                let ops = lock(&self.custom_ops)?;
                let premul = ops
                    .get(&custom.tag())
                    .ok_or(NativeStatus::InvalidArgument)?;
                if premul.dtype != dtype {
                    return Err(NativeStatus::InvalidArgument);
                }
                Ok((Reduction::PreMulSum, Some(premul.scalar)))
            }
            ReduceOp::Avg if !dtype.is_float() => Err(NativeStatus::InvalidArgument),
            builtin => Ok((Reduction::Builtin(builtin), None)),
        }
    }

    pub(crate) fn next_collective(&self) -> NativeResult<u64> {
        let mut seqs = lock(&self.seqs)?;
        let seq = seqs.collective;
        seqs.collective += 1;
        Ok(seq)
    }

    pub(crate) fn next_send(&self, peer: Rank) -> NativeResult<u64> {
        let mut seqs = lock(&self.seqs)?;
        let seq = seqs.sends.entry(peer).or_insert(0);
        let current = *seq;
        *seq += 1;
        Ok(current)
    }

    pub(crate) fn next_recv(&self, peer: Rank) -> NativeResult<u64> {
        let mut seqs = lock(&self.seqs)?;
        let seq = seqs.recvs.entry(peer).or_insert(0);
        let current = *seq;
        *seq += 1;
        Ok(current)
    }
}

/// A launched primitive with everything it needs to execute on its stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Launch {
    pub(crate) call: CollectiveCall,
    pub(crate) seq: u64,
    pub(crate) reduction: Option<Reduction>,
    pub(crate) premul: Option<f64>,
}

unsafe fn read_device(ptr: u64, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr as *const u8, len).to_vec() }
}

unsafe fn write_device(ptr: u64, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len()) }
}

/// Execute one launched primitive for `comm`.
///
/// # Safety
/// The buffers in `launch.call` must be valid host memory for their sizes
/// until the returned future completes.
pub(crate) async unsafe fn execute(comm: Arc<CommState>, launch: Launch) -> NativeResult<()> {
    if comm.is_closed() {
        return Err(NativeStatus::InvalidUsage);
    }
    comm.async_error()?;

    let group = Arc::clone(&comm.group);
    let rank = comm.rank;
    let world = group.world_size as usize;

    match launch.call {
        CollectiveCall::Send { buf, peer } => {
            let data = unsafe { read_device(buf.ptr(), buf.len_bytes()) };
            group.post((rank, peer, launch.seq), data)
        }
        CollectiveCall::Recv { buf, peer } => {
            let data = group.take((peer, rank, launch.seq)).await?;
            if data.len() != buf.len_bytes() {
                return Err(NativeStatus::RemoteError);
            }
            unsafe { write_device(buf.ptr(), &data) };
            Ok(())
        }
        call => {
            let (shape, contributes) = shape_of(&call, launch.reduction, rank);
            let mut data = match contributes {
                Some(send) => unsafe { read_device(send.ptr(), send.len_bytes()) },
                None => Vec::new(),
            };
            if let Some(scalar) = launch.premul {
                scale_slice(&mut data, shape.dtype, scalar)?;
            }
            let parts = group.contribute(launch.seq, rank, Part { shape, data }).await?;
            if parts.len() != world || parts.iter().any(|p| p.shape != shape) {
                return Err(NativeStatus::RemoteError);
            }
            unsafe { finish(&call, launch.reduction, rank, &parts) }
        }
    }
}

/// Agreement shape of a collective, and the buffer this rank contributes.
fn shape_of(
    call: &CollectiveCall,
    reduction: Option<Reduction>,
    rank: Rank,
) -> (Shape, Option<crate::buffer::BufferDesc>) {
    let operation = call.name();
    match *call {
        CollectiveCall::Broadcast { send, recv, root } => (
            Shape {
                operation,
                count: recv.count(),
                dtype: recv.dtype(),
                reduction: None,
                root: Some(root),
            },
            (rank == root).then_some(send),
        ),
        CollectiveCall::Reduce { send, root, .. } => (
            Shape {
                operation,
                count: send.count(),
                dtype: send.dtype(),
                reduction,
                root: Some(root),
            },
            Some(send),
        ),
        CollectiveCall::AllReduce { send, .. }
        | CollectiveCall::ReduceScatter { send, .. }
        | CollectiveCall::AllGather { send, .. }
        | CollectiveCall::AllToAll { send, .. } => (
            Shape {
                operation,
                count: send.count(),
                dtype: send.dtype(),
                reduction,
                root: None,
            },
            Some(send),
        ),
        CollectiveCall::Send { buf, .. } | CollectiveCall::Recv { buf, .. } => (
            Shape {
                operation,
                count: buf.count(),
                dtype: buf.dtype(),
                reduction: None,
                root: None,
            },
            None,
        ),
    }
}

fn combine_all(parts: &[Part], dtype: DataType, reduction: Option<Reduction>) -> NativeResult<Vec<u8>> {
    let (combine, average) = match reduction {
        Some(Reduction::Builtin(op)) => (
            Combine::lower(op).ok_or(NativeStatus::InvalidArgument)?,
            op == ReduceOp::Avg,
        ),
        Some(Reduction::PreMulSum) => (Combine::Sum, false),
        None => return Err(NativeStatus::InternalError),
    };
    let mut iter = parts.iter();
    let mut acc = iter.next().map(|p| p.data.clone()).unwrap_or_default();
    for part in iter {
        reduce_slice(&mut acc, &part.data, dtype, combine)?;
    }
    if average {
        scale_slice(&mut acc, dtype, 1.0 / parts.len() as f64)?;
    }
    Ok(acc)
}

/// Materialize this rank's output from everyone's contributions.
///
/// # Safety
/// The receive buffer of `call` must be valid for its size.
unsafe fn finish(
    call: &CollectiveCall,
    reduction: Option<Reduction>,
    rank: Rank,
    parts: &[Part],
) -> NativeResult<()> {
    let rank = rank as usize;
    match *call {
        CollectiveCall::Broadcast { recv, root, .. } => {
            let data = &parts[root as usize].data;
            if data.len() != recv.len_bytes() {
                return Err(NativeStatus::RemoteError);
            }
            unsafe { write_device(recv.ptr(), data) };
        }
        CollectiveCall::Reduce { recv, root, .. } => {
            if rank == root as usize {
                let acc = combine_all(parts, recv.dtype(), reduction)?;
                unsafe { write_device(recv.ptr(), &acc) };
            }
        }
        CollectiveCall::AllReduce { recv, .. } => {
            let acc = combine_all(parts, recv.dtype(), reduction)?;
            unsafe { write_device(recv.ptr(), &acc) };
        }
        CollectiveCall::ReduceScatter { recv, .. } => {
            let acc = combine_all(parts, recv.dtype(), reduction)?;
            let chunk = recv.len_bytes();
            let slice = acc
                .get(rank * chunk..(rank + 1) * chunk)
                .ok_or(NativeStatus::RemoteError)?;
            unsafe { write_device(recv.ptr(), slice) };
        }
        CollectiveCall::AllGather { recv, .. } => {
            let gathered: Vec<u8> = parts.iter().flat_map(|p| p.data.iter().copied()).collect();
            if gathered.len() != recv.len_bytes() {
                return Err(NativeStatus::RemoteError);
            }
            unsafe { write_device(recv.ptr(), &gathered) };
        }
        CollectiveCall::AllToAll { recv, .. } => {
            let chunk = recv.len_bytes() / parts.len().max(1);
            let mut out = Vec::with_capacity(recv.len_bytes());
            for part in parts {
                let piece = part
                    .data
                    .get(rank * chunk..(rank + 1) * chunk)
                    .ok_or(NativeStatus::RemoteError)?;
                out.extend_from_slice(piece);
            }
            unsafe { write_device(recv.ptr(), &out) };
        }
        CollectiveCall::Send { .. } | CollectiveCall::Recv { .. } => {
            return Err(NativeStatus::InternalError);
        }
    }
    Ok(())
}

/// A simulated cluster shared by every participant of a test or a
/// CPU-only process.
///
/// Devices are host memory, participants are threads, and streams run on a
/// tokio runtime owned by the fabric. Every participant builds its own
/// [`LoopbackRuntime`](super::LoopbackRuntime) over the same fabric.
pub struct LoopbackFabric {
    device_count: usize,
    bootstrap_timeout: Duration,
    executor: tokio::runtime::Runtime,
    next_id: AtomicU64,
    rendezvous: Mutex<HashMap<GroupToken, Arc<Rendezvous>>>,
    comms: Mutex<HashMap<u64, Arc<CommState>>>,
    streams: Mutex<HashMap<u64, Arc<StreamState>>>,
}

impl LoopbackFabric {
    pub(crate) fn build(device_count: usize, bootstrap_timeout: Duration) -> std::io::Result<Self> {
        let executor = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rnccl-loopback")
            .build()?;
        Ok(Self {
            device_count,
            bootstrap_timeout,
            executor,
            next_id: AtomicU64::new(1),
            rendezvous: Mutex::new(HashMap::new()),
            comms: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        self.bootstrap_timeout
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn create_stream(&self, device: usize) -> NativeResult<StreamId> {
        if device >= self.device_count {
            return Err(NativeStatus::InvalidArgument);
        }
        let id = self.next_id();
        let stream = StreamState::spawn(id, device, self.executor.handle());
        lock(&self.streams)?.insert(id, stream);
        Ok(StreamId(id))
    }

    pub(crate) fn stream(&self, stream: StreamId) -> NativeResult<Arc<StreamState>> {
        lock(&self.streams)?
            .get(&stream.0)
            .cloned()
            .ok_or(NativeStatus::InvalidArgument)
    }

    pub(crate) fn comm(&self, id: u64) -> NativeResult<Arc<CommState>> {
        lock(&self.comms)?
            .get(&id)
            .cloned()
            .ok_or(NativeStatus::InvalidUsage)
    }

    pub(crate) fn remove_comm(&self, id: u64) -> NativeResult<Arc<CommState>> {
        let comm = lock(&self.comms)?
            .remove(&id)
            .ok_or(NativeStatus::InvalidUsage)?;
        comm.close();
        Ok(comm)
    }

    /// Number of rendezvous entries still held: groups waiting for members,
    /// plus poisoned ones kept so late joiners fail fast.
    pub(crate) fn rendezvous_count(&self) -> usize {
        self.rendezvous.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn forget_rendezvous(&self, token: &GroupToken, cell: &Arc<Rendezvous>) {
        if let Ok(mut table) = self.rendezvous.lock()
            && table.get(token).is_some_and(|c| Arc::ptr_eq(c, cell))
        {
            table.remove(token);
        }
    }

    /// Join the rendezvous for `token`, blocking until the group forms or
    /// fails. Any failure poisons the rendezvous so that every participant
    /// fails with it. A formed group's entry is dropped once every member
    /// has collected it.
    pub(crate) fn join(
        &self,
        token: &GroupToken,
        world_size: u32,
        rank: Rank,
        device: usize,
    ) -> Result<Arc<CommState>, JoinFailure> {
        let cell = {
            let mut table = self
                .rendezvous
                .lock()
                .map_err(|_| JoinFailure::Poisoned("rendezvous table lock poisoned".into()))?;
            Arc::clone(
                table
                    .entry(token.clone())
                    .or_insert_with(|| Arc::new(Rendezvous::new(world_size))),
            )
        };

        let mut st = cell
            .state
            .lock()
            .map_err(|_| JoinFailure::Poisoned("rendezvous lock poisoned".into()))?;

        if let Some(outcome) = &st.outcome {
            return Err(match outcome {
                Ok(_) => JoinFailure::AlreadyFormed,
                Err(reason) => JoinFailure::Poisoned(reason.clone()),
            });
        }

        let rejection = if st.world_size != world_size {
            Some(JoinFailure::WorldSizeMismatch {
                expected: st.world_size,
                got: world_size,
            })
        } else if rank >= world_size {
            Some(JoinFailure::RankOutOfRange { rank, world_size })
        } else if device >= self.device_count {
            Some(JoinFailure::InvalidDevice {
                device,
                device_count: self.device_count,
            })
        } else if st.members[rank as usize] {
            Some(JoinFailure::DuplicateRank(rank))
        } else {
            None
        };
        if let Some(failure) = rejection {
            tracing::error!(token = %token.short_id(), rank, %failure, "loopback rendezvous poisoned");
            st.outcome = Some(Err(failure.to_string()));
            cell.ready.notify_all();
            return Err(failure);
        }

        st.members[rank as usize] = true;
        st.joined += 1;
        if st.joined == st.world_size {
            let group = Arc::new(GroupState::new(self.next_id(), world_size));
            st.outcome = Some(Ok(group));
            cell.ready.notify_all();
        }

        let deadline = Instant::now() + self.bootstrap_timeout;
        while st.outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                let failure = JoinFailure::TimedOut {
                    joined: st.joined,
                    expected: st.world_size,
                };
                tracing::error!(token = %token.short_id(), rank, %failure, "loopback rendezvous poisoned");
                st.outcome = Some(Err(failure.to_string()));
                cell.ready.notify_all();
                return Err(failure);
            }
            st = cell
                .ready
                .wait_timeout(st, deadline - now)
                .map_err(|_| JoinFailure::Poisoned("rendezvous lock poisoned".into()))?
                .0;
        }

        match st.outcome.clone() {
            Some(Ok(group)) => {
                st.delivered += 1;
                let everyone = st.delivered == st.world_size;
                drop(st);
                if everyone {
                    self.forget_rendezvous(token, &cell);
                }
                let comm = Arc::new(CommState::new(self.next_id(), rank, device, group));
                self.comms
                    .lock()
                    .map_err(|_| JoinFailure::Poisoned("communicator table lock poisoned".into()))?
                    .insert(comm.id, Arc::clone(&comm));
                Ok(comm)
            }
            Some(Err(reason)) => Err(JoinFailure::Poisoned(reason)),
            None => Err(JoinFailure::Poisoned("rendezvous ended without outcome".into())),
        }
    }
}
