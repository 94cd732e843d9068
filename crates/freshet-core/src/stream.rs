//! Streams: ordered command queues bound to one context.
//!
//! A stream owns a small critical section (the in-flight command counter and
//! the accelerator execution queue) guarded by its own lock, distinct from
//! the context lock. Commands submitted to one stream retire in submission
//! order. The per-context default stream additionally synchronizes against
//! its sibling streams, which is handled at the context level.

use std::sync::Arc;

use tracing::trace;

use crate::accel::{CommandQueue, CompletionSignal, WaitMode};
use crate::error::Result;
use crate::locking::{domain_lock, DomainLock};
use crate::types::{ContextId, StreamId};

/// How a stream burns time while waiting for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleMode {
    /// Let the backend decide.
    #[default]
    Auto,
    /// Busy-spin; lowest latency, burns a core.
    Spin,
    /// Spin but yield the thread between polls.
    Yield,
}

impl ScheduleMode {
    pub(crate) fn wait_mode(self) -> WaitMode {
        match self {
            ScheduleMode::Auto => WaitMode::Auto,
            ScheduleMode::Spin => WaitMode::Spin,
            ScheduleMode::Yield => WaitMode::Yield,
        }
    }
}

/// Stream creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamFlags {
    /// Ordinary stream, synchronized by default-stream sweeps.
    #[default]
    Default,
    /// Exempt from default-stream cross-synchronization.
    NonBlocking,
}

impl StreamFlags {
    /// True when the stream opts out of default-stream synchronization.
    pub fn is_non_blocking(self) -> bool {
        matches!(self, StreamFlags::NonBlocking)
    }
}

/// State only touched while the stream lock is held.
pub(crate) struct StreamCritical {
    /// Commands submitted since the last wait. Reset to zero by every
    /// successful wait.
    pub(crate) pending_ops: u32,
    /// The bound accelerator execution queue.
    pub(crate) queue: Arc<dyn CommandQueue>,
}

/// An ordered command stream.
///
/// Identity fields are set at construction and never change; everything
/// mutable lives in the critical section.
pub struct Stream {
    id: StreamId,
    ctx: ContextId,
    device_index: usize,
    flags: StreamFlags,
    schedule: ScheduleMode,
    is_default: bool,
    critical: DomainLock<StreamCritical>,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        ctx: ContextId,
        device_index: usize,
        flags: StreamFlags,
        schedule: ScheduleMode,
        is_default: bool,
        queue: Arc<dyn CommandQueue>,
        thread_safe: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            ctx,
            device_index,
            flags,
            schedule,
            is_default,
            critical: domain_lock(
                StreamCritical {
                    pending_ops: 0,
                    queue,
                },
                thread_safe,
            ),
        })
    }

    /// Stream identifier; doubles as the creation sequence number.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Identifier of the owning context.
    pub fn ctx(&self) -> ContextId {
        self.ctx
    }

    /// Index of the device this stream executes on.
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Creation flags.
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Scheduling mode.
    pub fn schedule(&self) -> ScheduleMode {
        self.schedule
    }

    /// True for the context's default stream.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Submit exactly one command under the stream lock.
    ///
    /// The closure receives the execution queue and must issue one command;
    /// the in-flight counter is bumped and the lock released on every exit
    /// path, including errors.
    pub fn submit<F>(&self, label: &str, f: F) -> Result<Arc<dyn CompletionSignal>>
    where
        F: FnOnce(&dyn CommandQueue) -> Result<Arc<dyn CompletionSignal>>,
    {
        let mut crit = self.critical.lock();
        let signal = f(&*crit.queue)?;
        crit.pending_ops += 1;
        trace!(
            target: "freshet::sync",
            stream = %self.id,
            label,
            pending = crit.pending_ops,
            "command submitted"
        );
        Ok(signal)
    }

    /// Submit one command without counting it toward the in-flight total.
    ///
    /// Used for commands the caller waits on before returning (synchronous
    /// copies) and for ordering-only commands (markers, dependencies).
    pub(crate) fn submit_untracked<F>(&self, label: &str, f: F) -> Result<Arc<dyn CompletionSignal>>
    where
        F: FnOnce(&dyn CommandQueue) -> Result<Arc<dyn CompletionSignal>>,
    {
        let crit = self.critical.lock();
        let signal = f(&*crit.queue)?;
        trace!(target: "freshet::sync", stream = %self.id, label, "untracked command submitted");
        Ok(signal)
    }

    /// Wait for the queue to drain, with the lock already held.
    ///
    /// Resets the in-flight counter. With `assert_queue_empty` set, a nonzero
    /// counter on entry is a programming error: fatal in debug builds,
    /// tolerated in release.
    pub(crate) fn wait(&self, crit: &mut StreamCritical, assert_queue_empty: bool) -> Result<()> {
        if assert_queue_empty && crit.pending_ops != 0 {
            debug_assert!(
                false,
                "{} waited with {} commands in flight",
                self.id, crit.pending_ops
            );
            trace!(
                target: "freshet::sync",
                stream = %self.id,
                pending = crit.pending_ops,
                "wait entered with commands in flight"
            );
        }
        crit.queue.wait_idle(self.schedule.wait_mode())?;
        crit.pending_ops = 0;
        trace!(target: "freshet::sync", stream = %self.id, "stream drained");
        Ok(())
    }

    /// Acquire the stream lock, wait for the queue to drain, release.
    pub fn locked_wait(&self, assert_queue_empty: bool) -> Result<()> {
        let mut crit = self.critical.lock();
        self.wait(&mut crit, assert_queue_empty)
    }

    /// Non-blocking idle query.
    pub fn query(&self) -> Result<bool> {
        let crit = self.critical.lock();
        crit.queue.is_idle()
    }

    /// Commands submitted since the last wait.
    #[cfg(test)]
    pub(crate) fn pending_ops(&self) -> u32 {
        self.critical.lock().pending_ops
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("device", &self.device_index)
            .field("flags", &self.flags)
            .field("default", &self.is_default)
            .finish()
    }
}
