use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::vfs::convert::{OpResult, Status};
use crate::vfs::pool::{ObjectPool, PoolStats};
use crate::vfs::types::{NodeId, OpenRequest};

/// Completion-channel state of one context.
///
/// `NoChannel -> Created -> Active -> Created (idle) -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NoChannel,
    Created,
    Active { in_flight: u32 },
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub closed: bool,
    pub cleaned_up: bool,
}

/// Per-open snapshot captured at create-file time.
#[derive(Debug, Clone, Default)]
pub struct OpenInfo {
    pub request: OpenRequest,
    pub virtual_path: String,
    pub is_directory: bool,
    pub delete_on_close: bool,
}

/// State bound to one open handle.
#[derive(Debug)]
pub struct RequestContext {
    serial: u64,
    handle: Mutex<Option<Arc<File>>>,
    node: Mutex<Option<NodeId>>,
    info: Mutex<OpenInfo>,
    flags: Mutex<ContextFlags>,
    channel: Mutex<ChannelState>,
    channel_idle: Condvar,
    /// Serializes seek+transfer pairs on the synchronous path.
    pub(crate) seek_lock: Mutex<()>,
}

impl RequestContext {
    fn new(serial: u64) -> Self {
        RequestContext {
            serial,
            handle: Mutex::new(None),
            node: Mutex::new(None),
            info: Mutex::new(OpenInfo::default()),
            flags: Mutex::new(ContextFlags::default()),
            channel: Mutex::new(ChannelState::NoChannel),
            channel_idle: Condvar::new(),
            seek_lock: Mutex::new(()),
        }
    }

    /// Identity of the pooled object, stable across reuse.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn handle(&self) -> OpResult<Arc<File>> {
        self.handle.lock().clone().ok_or(Status::InvalidHandle)
    }

    pub fn node(&self) -> Option<NodeId> {
        *self.node.lock()
    }

    pub fn set_node(&self, node: Option<NodeId>) {
        *self.node.lock() = node;
    }

    pub fn info(&self) -> OpenInfo {
        self.info.lock().clone()
    }

    pub fn set_info(&self, info: OpenInfo) {
        *self.info.lock() = info;
    }

    pub fn set_virtual_path(&self, path: String) {
        self.info.lock().virtual_path = path;
    }

    pub fn set_delete_on_close(&self, value: bool) {
        self.info.lock().delete_on_close = value;
    }

    pub fn flags(&self) -> ContextFlags {
        *self.flags.lock()
    }

    /// Returns `false` if cleanup already ran.
    pub fn mark_cleaned_up(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.cleaned_up {
            return false;
        }
        flags.cleaned_up = true;
        true
    }

    /// Returns `false` if the context was already closed.
    pub fn mark_closed(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.closed {
            return false;
        }
        flags.closed = true;
        true
    }

    pub fn channel_state(&self) -> ChannelState {
        *self.channel.lock()
    }

    pub(crate) fn channel_attach(&self) -> bool {
        let mut channel = self.channel.lock();
        match *channel {
            ChannelState::NoChannel | ChannelState::Closed => {
                *channel = ChannelState::Created;
                true
            }
            ChannelState::Created => true,
            ChannelState::Active { .. } => false,
        }
    }

    pub(crate) fn channel_start(&self) -> bool {
        let mut channel = self.channel.lock();
        match *channel {
            ChannelState::Created => {
                *channel = ChannelState::Active { in_flight: 1 };
                true
            }
            ChannelState::Active { in_flight } => {
                *channel = ChannelState::Active {
                    in_flight: in_flight + 1,
                };
                true
            }
            ChannelState::NoChannel | ChannelState::Closed => false,
        }
    }

    /// One in-flight operation finished or was cancelled.
    pub(crate) fn channel_finish(&self) {
        let mut channel = self.channel.lock();
        match *channel {
            ChannelState::Active { in_flight } if in_flight > 1 => {
                *channel = ChannelState::Active {
                    in_flight: in_flight - 1,
                };
            }
            ChannelState::Active { .. } => {
                *channel = ChannelState::Created;
                self.channel_idle.notify_all();
            }
            other => {
                tracing::warn!(
                    "context {}: completion with channel in state {:?}",
                    self.serial,
                    other
                );
            }
        }
    }

    /// The asynchronous call failed before it was issued; back to idle.
    pub(crate) fn channel_cancel(&self) {
        tracing::trace!("context {}: operation cancelled before issue", self.serial);
        self.channel_finish();
    }

    /// Tear the channel down, waiting for any in-flight operation first.
    pub(crate) fn channel_detach(&self) {
        let mut channel = self.channel.lock();
        while matches!(*channel, ChannelState::Active { .. }) {
            self.channel_idle.wait(&mut channel);
        }
        if *channel == ChannelState::Created {
            *channel = ChannelState::Closed;
        }
    }

    fn bind(&self, handle: File) {
        *self.handle.lock() = Some(Arc::new(handle));
        *self.node.lock() = None;
        *self.info.lock() = OpenInfo::default();
        *self.flags.lock() = ContextFlags::default();
    }

    fn release(&self) {
        self.handle.lock().take();
        *self.node.lock() = None;
        *self.info.lock() = OpenInfo::default();
    }
}

/// Attaches and detaches completion channels; implemented by the async
/// subsystem.
pub trait CompletionChannels {
    fn attach(&self, context: &RequestContext) -> bool;
    fn detach(&self, context: &RequestContext);
}

/// Recycles [`RequestContext`] objects across opens.
pub struct RequestContextPool {
    pool: ObjectPool<Arc<RequestContext>>,
    unmounting: AtomicBool,
    next_serial: AtomicU64,
}

impl RequestContextPool {
    pub fn new(capacity: Option<usize>) -> Self {
        RequestContextPool {
            pool: ObjectPool::new("request-context", capacity),
            unmounting: AtomicBool::new(false),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn init(&self) -> bool {
        self.unmounting.store(false, Ordering::SeqCst);
        self.pool.init()
    }

    pub fn begin_unmount(&self) {
        self.unmounting.store(true, Ordering::SeqCst);
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::SeqCst)
    }

    /// Hand out a context bound to `handle`, with flags reset and metadata
    /// cleared. `None` while unmounting, when the pool is exhausted, or when
    /// a completion channel cannot be attached.
    pub fn pop(
        &self,
        handle: File,
        channels: Option<&dyn CompletionChannels>,
    ) -> Option<Arc<RequestContext>> {
        if self.is_unmounting() {
            tracing::debug!("request-context pool: pop refused, unmount in progress");
            return None;
        }

        let context = self.pool.pop_with(|| {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            Arc::new(RequestContext::new(serial))
        })?;
        context.bind(handle);

        if let Some(channels) = channels {
            if !channels.attach(&context) {
                tracing::warn!(
                    "request-context pool: cannot attach channel to context {}",
                    context.serial()
                );
                context.release();
                self.pool.push(context);
                return None;
            }
        }

        Some(context)
    }

    /// Detach the channel, drop the handle and park the object for reuse.
    pub fn push(&self, context: Arc<RequestContext>, channels: Option<&dyn CompletionChannels>) {
        if let Some(channels) = channels {
            channels.detach(&context);
        }
        context.release();
        self.pool.push(context);
    }

    /// Destroy every parked context and reset the pool.
    pub fn cleanup(&self) -> usize {
        self.pool.cleanup()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
