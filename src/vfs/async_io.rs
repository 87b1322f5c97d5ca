//! Asynchronous read/write on a pool of blocking worker threads.
//!
//! Every in-flight operation carries a pooled [`AsyncOperationContext`] as
//! its correlation token. Completion always returns that context to the
//! pool, even when the job fails or is dropped before running.

use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::Result;
use crate::vfs::context::{CompletionChannels, RequestContext};
use crate::vfs::convert::Status;
use crate::vfs::pool::{ObjectPool, PoolStats};

pub const DEFAULT_WORKER_THREADS: usize = 4;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// A caller-owned read or write request. For reads `buffer` receives the
/// data; for writes it holds the data to write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoRequest {
    /// Correlates the completion with the dispatcher's pending reply.
    pub token: u64,
    pub offset: u64,
    pub length: usize,
    pub buffer: Vec<u8>,
    /// Paging writes never extend the file.
    pub paging_io: bool,
    /// Append: the offset is replaced by the current end of file.
    pub write_to_end: bool,
    pub bytes_transferred: u64,
}

impl IoRequest {
    pub fn read(token: u64, offset: u64, length: usize) -> Self {
        IoRequest {
            token,
            offset,
            length,
            ..Default::default()
        }
    }

    pub fn write(token: u64, offset: u64, data: Vec<u8>) -> Self {
        IoRequest {
            token,
            offset,
            length: data.len(),
            buffer: data,
            ..Default::default()
        }
    }
}

/// Receives finished asynchronous requests.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, request: IoRequest, status: Status);
}

/// Post-operation hooks run on both the synchronous and asynchronous paths,
/// before the dispatcher is told about the result.
pub trait IoHooks: Send + Sync {
    fn read_completed(&self, _context: &RequestContext, _request: &IoRequest, _status: Status) {}
    fn write_completed(&self, _context: &RequestContext, _request: &IoRequest, _status: Status) {}
}

pub struct NoHooks;

impl IoHooks for NoHooks {}

/// Result of issuing a request.
#[derive(Debug)]
pub enum Issued {
    /// Queued; the sink will be called exactly once.
    Pending,
    /// Finished (or failed) without reaching a worker.
    Completed(IoRequest, Status),
}

/// Per-operation correlation state, recycled through its own pool.
pub struct AsyncOperationContext {
    offset: u64,
    length: usize,
    kind: IoKind,
    context: Option<Arc<RequestContext>>,
    request: Option<IoRequest>,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl AsyncOperationContext {
    fn empty() -> Self {
        AsyncOperationContext {
            offset: 0,
            length: 0,
            kind: IoKind::Read,
            context: None,
            request: None,
            sink: None,
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
        self.kind = IoKind::Read;
        self.context = None;
        self.request = None;
        self.sink = None;
    }
}

struct Shared {
    operations: ObjectPool<Box<AsyncOperationContext>>,
    hooks: Arc<dyn IoHooks>,
}

impl Shared {
    fn complete(&self, mut op: Box<AsyncOperationContext>, status: Status) {
        match (op.context.take(), op.request.take(), op.sink.take()) {
            (Some(context), Some(request), Some(sink)) => {
                match op.kind {
                    IoKind::Read => self.hooks.read_completed(&context, &request, status),
                    IoKind::Write => self.hooks.write_completed(&context, &request, status),
                }
                tracing::trace!(
                    "async io: {:?} token {} done with {} ({} bytes)",
                    op.kind,
                    request.token,
                    status,
                    request.bytes_transferred
                );
                sink.complete(request, status);
                context.channel_finish();
            }
            _ => tracing::warn!("async io: completion for an operation that was never stamped"),
        }
        op.reset();
        self.operations.push(op);
    }
}

/// Owns an operation while it is queued or running. Dropping it without
/// calling `finish` still completes the operation.
struct InFlight {
    op: Option<Box<AsyncOperationContext>>,
    shared: Arc<Shared>,
}

impl InFlight {
    fn run(mut self) {
        let status = match self.op.as_mut() {
            Some(op) => perform(op),
            None => Status::Unsuccessful,
        };
        if let Some(op) = self.op.take() {
            self.shared.complete(op, status);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            tracing::warn!("async io: operation dropped before it ran");
            self.shared.complete(op, Status::Unsuccessful);
        }
    }
}

/// Positioned transfer executed on a worker thread.
fn perform(op: &mut AsyncOperationContext) -> Status {
    let (Some(context), Some(request)) = (op.context.as_ref(), op.request.as_mut()) else {
        return Status::InvalidParameter;
    };
    let file = match context.handle() {
        Ok(file) => file,
        Err(status) => return status,
    };

    match op.kind {
        IoKind::Read => {
            let mut buffer = vec![0u8; op.length];
            match read_full_at(&file, &mut buffer, op.offset) {
                Ok(n) => {
                    buffer.truncate(n);
                    request.buffer = buffer;
                    request.bytes_transferred = n as u64;
                    Status::Success
                }
                Err(e) => Status::from(&e),
            }
        }
        IoKind::Write => match file.write_all_at(&request.buffer[..op.length], op.offset) {
            Ok(()) => {
                request.bytes_transferred = op.length as u64;
                Status::Success
            }
            Err(e) => Status::from(&e),
        },
    }
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Number of bytes a paging write may transfer without growing the file.
pub fn clamp_paging_write(file_size: u64, offset: u64, length: usize) -> usize {
    if offset >= file_size {
        return 0;
    }
    let remaining = file_size - offset;
    usize::try_from(remaining).map_or(length, |remaining| length.min(remaining))
}

/// Fix the effective offset and length of a write. `None` means the write
/// completes immediately with zero bytes.
fn plan_write(file: &File, request: &mut IoRequest) -> io::Result<Option<usize>> {
    let length = request.buffer.len().min(request.length);
    if !request.write_to_end && !request.paging_io {
        return Ok(Some(length));
    }

    let size = file.metadata()?.len();
    if request.write_to_end {
        request.offset = size;
    }
    if request.paging_io {
        let clamped = clamp_paging_write(size, request.offset, length);
        return Ok((clamped > 0).then_some(clamped));
    }
    Ok(Some(length))
}

/// Blocking read at `request.offset`, then the read hook.
pub fn read_sync(context: &RequestContext, request: &mut IoRequest, hooks: &dyn IoHooks) -> Status {
    let status = match context.handle() {
        Ok(file) => {
            let _seek = context.seek_lock.lock();
            let mut buffer = vec![0u8; request.length];
            match seek_and_read(&file, request.offset, &mut buffer) {
                Ok(n) => {
                    buffer.truncate(n);
                    request.buffer = buffer;
                    request.bytes_transferred = n as u64;
                    Status::Success
                }
                Err(e) => Status::from(&e),
            }
        }
        Err(status) => status,
    };
    hooks.read_completed(context, request, status);
    status
}

/// Blocking write at `request.offset` (or end of file), then the write hook.
pub fn write_sync(context: &RequestContext, request: &mut IoRequest, hooks: &dyn IoHooks) -> Status {
    let status = match context.handle() {
        Ok(file) => {
            let _seek = context.seek_lock.lock();
            match plan_write(&file, request) {
                Ok(Some(length)) => {
                    match seek_and_write(&file, request.offset, &request.buffer[..length]) {
                        Ok(()) => {
                            request.bytes_transferred = length as u64;
                            Status::Success
                        }
                        Err(e) => Status::from(&e),
                    }
                }
                Ok(None) => {
                    request.bytes_transferred = 0;
                    Status::Success
                }
                Err(e) => Status::from(&e),
            }
        }
        Err(status) => status,
    };
    hooks.write_completed(context, request, status);
    status
}

fn seek_and_read(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn seek_and_write(mut file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

/// The asynchronous subsystem: a worker pool plus the operation-context pool.
pub struct AsyncIo {
    shared: Arc<Shared>,
    worker_threads: usize,
    runtime: Mutex<Option<Runtime>>,
    handle: RwLock<Option<Handle>>,
}

impl AsyncIo {
    pub fn new(hooks: Arc<dyn IoHooks>, worker_threads: usize, max_operations: Option<usize>) -> Self {
        AsyncIo {
            shared: Arc::new(Shared {
                operations: ObjectPool::new("async-operation", max_operations),
                hooks,
            }),
            worker_threads: worker_threads.max(1),
            runtime: Mutex::new(None),
            handle: RwLock::new(None),
        }
    }

    /// Start the worker pool. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.worker_threads)
            .thread_name("convergefs-io")
            .enable_all()
            .build()?;

        self.shared.operations.init();
        *self.handle.write() = Some(rt.handle().clone());
        *runtime = Some(rt);
        tracing::info!("async io: started with {} workers", self.worker_threads);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Stop issuing, wait for queued work, then drain the operation pool.
    /// Returns the number of operation contexts destroyed.
    pub fn shutdown(&self) -> usize {
        self.handle.write().take();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_timeout(SHUTDOWN_GRACE);
        }
        let destroyed = self.shared.operations.cleanup();
        tracing::info!("async io: stopped, {} operation contexts released", destroyed);
        destroyed
    }

    pub fn operation_stats(&self) -> PoolStats {
        self.shared.operations.stats()
    }

    pub fn hooks(&self) -> &Arc<dyn IoHooks> {
        &self.shared.hooks
    }

    pub fn read_async(
        &self,
        context: &Arc<RequestContext>,
        request: IoRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> Issued {
        let length = request.length;
        self.issue(IoKind::Read, context, request, length, sink)
    }

    /// Paging writes are clamped to the current file size before issue; a
    /// write starting at or past the end succeeds immediately with zero bytes.
    pub fn write_async(
        &self,
        context: &Arc<RequestContext>,
        mut request: IoRequest,
        sink: Arc<dyn CompletionSink>,
    ) -> Issued {
        let file = match context.handle() {
            Ok(file) => file,
            Err(status) => return Issued::Completed(request, status),
        };
        let length = match plan_write(&file, &mut request) {
            Ok(Some(length)) => length,
            Ok(None) => {
                request.bytes_transferred = 0;
                self.shared
                    .hooks
                    .write_completed(context, &request, Status::Success);
                return Issued::Completed(request, Status::Success);
            }
            Err(e) => return Issued::Completed(request, Status::from(&e)),
        };
        self.issue(IoKind::Write, context, request, length, sink)
    }

    fn issue(
        &self,
        kind: IoKind,
        context: &Arc<RequestContext>,
        request: IoRequest,
        length: usize,
        sink: Arc<dyn CompletionSink>,
    ) -> Issued {
        let handle = self.handle.read();
        let Some(handle) = handle.as_ref() else {
            tracing::warn!("async io: {:?} issued while stopped", kind);
            return Issued::Completed(request, Status::Unsuccessful);
        };

        if !context.channel_start() {
            return Issued::Completed(request, Status::InvalidHandle);
        }

        let Some(mut op) = self
            .shared
            .operations
            .pop_with(|| Box::new(AsyncOperationContext::empty()))
        else {
            context.channel_cancel();
            return Issued::Completed(request, Status::MemoryNotAllocated);
        };

        op.offset = request.offset;
        op.length = length;
        op.kind = kind;
        op.context = Some(Arc::clone(context));
        op.request = Some(request);
        op.sink = Some(sink);

        let in_flight = InFlight {
            op: Some(op),
            shared: Arc::clone(&self.shared),
        };
        handle.spawn_blocking(move || in_flight.run());
        Issued::Pending
    }
}

impl CompletionChannels for AsyncIo {
    fn attach(&self, context: &RequestContext) -> bool {
        if !self.is_running() {
            return false;
        }
        context.channel_attach()
    }

    fn detach(&self, context: &RequestContext) {
        context.channel_detach();
    }
}

impl Drop for AsyncIo {
    fn drop(&mut self) {
        self.handle.write().take();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
    }
}
