use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void};
use std::mem::MaybeUninit;
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::{CudaContext, CudaStream};
use cudarc::nccl::{result as nccl, sys};
use rnccl::{
    BufferDesc, CollectiveCall, DataType, GroupToken, NativeResult, NativeRuntime, NativeStatus,
    Rank, RawComm, StreamId, TOKEN_BYTES,
};

use crate::error::{check, driver_status, nccl_status};
use crate::types::{to_nccl_dtype, to_nccl_op};

#[derive(Debug, Clone, Copy)]
struct CommInfo {
    device: usize,
    world_size: u32,
}

/// [`NativeRuntime`] over NCCL and the CUDA driver.
///
/// Uses cudarc's `result` layer (raw pointers) rather than the `safe` layer,
/// because buffers arrive as `u64` device addresses. Streams created
/// elsewhere must be registered with [`CudaRuntime::register_stream`] before
/// the runtime can tell which device they belong to.
#[derive(Default)]
pub struct CudaRuntime {
    contexts: Mutex<HashMap<usize, Arc<CudaContext>>>,
    streams: Mutex<HashMap<u64, Arc<CudaStream>>>,
    comms: Mutex<HashMap<u64, CommInfo>>,
}

fn lock<T>(m: &Mutex<T>) -> NativeResult<MutexGuard<'_, T>> {
    m.lock().map_err(|_| NativeStatus::InternalError)
}

fn to_sys(comm: RawComm) -> sys::ncclComm_t {
    comm.0 as sys::ncclComm_t
}

fn id_from_token(token: &GroupToken) -> sys::ncclUniqueId {
    let mut internal = [0 as c_char; TOKEN_BYTES];
    for (dst, src) in internal.iter_mut().zip(token.as_bytes()) {
        *dst = *src as c_char;
    }
    sys::ncclUniqueId { internal }
}

fn send_ptr(buf: &BufferDesc) -> *const c_void {
    buf.ptr() as *const c_void
}

fn recv_ptr(buf: &BufferDesc) -> *mut c_void {
    buf.ptr() as *mut c_void
}

impl CudaRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary context of `device`, created on first use.
    pub fn context(&self, device: usize) -> NativeResult<Arc<CudaContext>> {
        let mut contexts = lock(&self.contexts)?;
        if let Some(ctx) = contexts.get(&device) {
            return Ok(ctx.clone());
        }
        let ctx = CudaContext::new(device).map_err(driver_status)?;
        contexts.insert(device, ctx.clone());
        Ok(ctx)
    }

    /// Make `stream` known to the runtime and return its handle.
    pub fn register_stream(&self, stream: &Arc<CudaStream>) -> NativeResult<StreamId> {
        let id = StreamId(stream.cu_stream() as u64);
        lock(&self.streams)?.insert(id.0, stream.clone());
        Ok(id)
    }

    /// Create and register a new stream on `device`.
    pub fn create_stream(&self, device: usize) -> NativeResult<(StreamId, Arc<CudaStream>)> {
        let stream = self
            .context(device)?
            .new_stream()
            .map_err(driver_status)?;
        let id = self.register_stream(&stream)?;
        Ok((id, stream))
    }

    fn info(&self, comm: RawComm) -> NativeResult<CommInfo> {
        lock(&self.comms)?
            .get(&comm.0)
            .copied()
            .ok_or(NativeStatus::InvalidUsage)
    }

    fn bind_device(&self, device: usize) -> NativeResult<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(driver_status)
    }

    /// Pairwise exchange of equal chunks as one native group.
    ///
    /// # Safety
    /// Same contract as [`NativeRuntime::launch`].
    unsafe fn all_to_all(
        &self,
        comm: sys::ncclComm_t,
        stream: sys::cudaStream_t,
        world_size: u32,
        send: &BufferDesc,
        recv: &BufferDesc,
    ) -> NativeResult<()> {
        let chunk = send.count() / world_size as usize;
        let chunk_bytes = (chunk * send.dtype().size_in_bytes()) as u64;
        let dt = to_nccl_dtype(send.dtype());

        check(unsafe { sys::ncclGroupStart() })?;
        let mut outcome = Ok(());
        for peer in 0..world_size {
            let offset = peer as u64 * chunk_bytes;
            let sent = unsafe {
                nccl::send(
                    (send.ptr() + offset) as *const c_void,
                    chunk,
                    dt,
                    peer as c_int,
                    comm,
                    stream,
                )
                .and_then(|_| {
                    nccl::recv(
                        (recv.ptr() + offset) as *mut c_void,
                        chunk,
                        dt,
                        peer as c_int,
                        comm,
                        stream,
                    )
                })
            };
            if let Err(e) = sent {
                outcome = Err(nccl_status(e));
                break;
            }
        }
        let ended = check(unsafe { sys::ncclGroupEnd() });
        outcome.and(ended)
    }
}

impl NativeRuntime for CudaRuntime {
    fn name(&self) -> &'static str {
        "nccl"
    }

    fn version(&self) -> NativeResult<i32> {
        let mut version: c_int = 0;
        check(unsafe { sys::ncclGetVersion(&mut version) })?;
        Ok(version)
    }

    fn device_count(&self) -> NativeResult<usize> {
        CudaContext::device_count()
            .map(|n| n.max(0) as usize)
            .map_err(driver_status)
    }

    fn unique_id(&self) -> NativeResult<[u8; TOKEN_BYTES]> {
        let id = nccl::get_uniqueid().map_err(nccl_status)?;
        let mut bytes = [0u8; TOKEN_BYTES];
        for (dst, src) in bytes.iter_mut().zip(id.internal.iter()) {
            *dst = *src as u8;
        }
        Ok(bytes)
    }

    fn stream_device(&self, stream: StreamId) -> NativeResult<Option<usize>> {
        Ok(lock(&self.streams)?
            .get(&stream.0)
            .map(|s| s.context().ordinal()))
    }

    fn comm_init_rank(
        &self,
        token: &GroupToken,
        world_size: u32,
        rank: Rank,
        device: usize,
    ) -> NativeResult<RawComm> {
        if device >= self.device_count()? {
            return Err(NativeStatus::InvalidArgument);
        }
        self.bind_device(device)?;

        let mut comm = MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(
                comm.as_mut_ptr(),
                world_size as c_int,
                id_from_token(token),
                rank as c_int,
            )
            .map_err(nccl_status)?;
        }
        let raw = RawComm(unsafe { comm.assume_init() } as u64);
        lock(&self.comms)?.insert(raw.0, CommInfo { device, world_size });
        tracing::debug!(rank, world_size, device, "NCCL communicator initialized");
        Ok(raw)
    }

    fn comm_destroy(&self, comm: RawComm) -> NativeResult<()> {
        let info = lock(&self.comms)?
            .remove(&comm.0)
            .ok_or(NativeStatus::InvalidUsage)?;
        self.bind_device(info.device)?;
        unsafe { nccl::comm_destroy(to_sys(comm)) }.map_err(nccl_status)?;
        Ok(())
    }

    fn comm_abort(&self, comm: RawComm) -> NativeResult<()> {
        let info = lock(&self.comms)?
            .remove(&comm.0)
            .ok_or(NativeStatus::InvalidUsage)?;
        self.bind_device(info.device)?;
        unsafe { nccl::comm_abort(to_sys(comm)) }.map_err(nccl_status)?;
        Ok(())
    }

    fn comm_async_error(&self, comm: RawComm) -> NativeResult<()> {
        self.info(comm)?;
        let mut result = MaybeUninit::uninit();
        check(unsafe { sys::ncclCommGetAsyncError(to_sys(comm), result.as_mut_ptr()) })?;
        check(unsafe { result.assume_init() })
    }

    fn group_start(&self) -> NativeResult<()> {
        check(unsafe { sys::ncclGroupStart() })
    }

    fn group_end(&self) -> NativeResult<()> {
        check(unsafe { sys::ncclGroupEnd() })
    }

    fn redop_create_premul_sum(
        &self,
        _comm: RawComm,
        _scalar: f64,
        dtype: DataType,
    ) -> NativeResult<u32> {
        // Operator handles from ncclRedOpCreatePreMulSum fall outside the
        // generated ncclRedOp_t enum, so they cannot be passed back safely.
        tracing::debug!(dtype = %dtype, "custom reduction operators are not supported over NCCL");
        Err(NativeStatus::InvalidUsage)
    }

    fn redop_destroy(&self, _comm: RawComm, _op: u32) -> NativeResult<()> {
        Err(NativeStatus::InvalidUsage)
    }

    unsafe fn launch(
        &self,
        comm: RawComm,
        stream: StreamId,
        call: &CollectiveCall,
    ) -> NativeResult<()> {
        let info = self.info(comm)?;
        self.bind_device(info.device)?;

        let raw = to_sys(comm);
        let s = stream.0 as sys::cudaStream_t;
        let dt = to_nccl_dtype(call.dtype());
        let op = match call.reduce_op() {
            Some(op) => Some(to_nccl_op(op).ok_or(NativeStatus::InvalidUsage)?),
            None => None,
        };
        let op = || op.ok_or(NativeStatus::InternalError);

        let launched = unsafe {
            match call {
                CollectiveCall::Broadcast { send, recv, root } => nccl::broadcast(
                    send_ptr(send),
                    recv_ptr(recv),
                    recv.count(),
                    dt,
                    *root as c_int,
                    raw,
                    s,
                ),
                CollectiveCall::Reduce {
                    send, recv, root, ..
                } => nccl::reduce(
                    send_ptr(send),
                    recv_ptr(recv),
                    send.count(),
                    dt,
                    op()?,
                    *root as c_int,
                    raw,
                    s,
                ),
                CollectiveCall::AllReduce { send, recv, .. } => nccl::all_reduce(
                    send_ptr(send),
                    recv_ptr(recv),
                    send.count(),
                    dt,
                    op()?,
                    raw,
                    s,
                ),
                CollectiveCall::AllGather { send, recv } => {
                    nccl::all_gather(send_ptr(send), recv_ptr(recv), send.count(), dt, raw, s)
                }
                CollectiveCall::ReduceScatter { send, recv, .. } => nccl::reduce_scatter(
                    send_ptr(send),
                    recv_ptr(recv),
                    recv.count(),
                    dt,
                    op()?,
                    raw,
                    s,
                ),
                CollectiveCall::Send { buf, peer } => {
                    nccl::send(send_ptr(buf), buf.count(), dt, *peer as c_int, raw, s)
                }
                CollectiveCall::Recv { buf, peer } => {
                    nccl::recv(recv_ptr(buf), buf.count(), dt, *peer as c_int, raw, s)
                }
                CollectiveCall::AllToAll { send, recv } => {
                    return self.all_to_all(raw, s, info.world_size, send, recv);
                }
            }
        };
        launched.map(drop).map_err(nccl_status)
    }

    fn stream_synchronize(&self, stream: StreamId) -> NativeResult<()> {
        let known = lock(&self.streams)?.get(&stream.0).cloned();
        match known {
            Some(s) => s.synchronize().map_err(driver_status),
            None => unsafe {
                cudarc::driver::result::stream::synchronize(
                    stream.0 as cudarc::driver::sys::CUstream,
                )
            }
            .map_err(driver_status),
        }
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        let Ok(comms) = self.comms.get_mut() else {
            return;
        };
        for (handle, info) in comms.drain() {
            tracing::warn!(
                device = info.device,
                "NCCL communicator outlived its runtime, aborting"
            );
            unsafe {
                let _ = nccl::comm_abort(handle as sys::ncclComm_t);
            }
        }
    }
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let comms = self.comms.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("CudaRuntime")
            .field("communicators", &comms)
            .finish_non_exhaustive()
    }
}
