//! The runtime façade: owning tables and the public operation surface.
//!
//! A [`Runtime`] owns the device registry and the context, stream and event
//! tables. Public operations resolve opaque identifiers through those
//! tables, perform the work, and record their status in the calling thread's
//! last-status slot. A process normally installs one runtime through
//! [`Runtime::install`]; tests construct as many as they like.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::accel::{Accelerator, AgentHandle, CommandQueue, CompletionSignal};
use crate::config::RuntimeConfig;
use crate::context::{Context, ContextFlags};
use crate::copy::{self, CopyHint, CopyPlan, CopyKind, Staging, StagingPool};
use crate::device::{DeviceProperties, DeviceRegistry};
use crate::error::{FreshetError, Result};
use crate::event::{Event, EventFlags};
use crate::stream::{ScheduleMode, Stream, StreamFlags};
use crate::tls;
use crate::types::{ContextId, EventId, StreamId};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// The execution-management runtime.
pub struct Runtime {
    instance: u64,
    config: RuntimeConfig,
    platform: Arc<dyn Accelerator>,
    registry: DeviceRegistry,
    contexts: RwLock<HashMap<ContextId, Arc<Context>>>,
    stream_owner: RwLock<HashMap<StreamId, ContextId>>,
    events: RwLock<HashMap<EventId, Arc<Event>>>,
    staging: StagingPool,
    next_context: AtomicU64,
    next_stream: AtomicU64,
    next_event: AtomicU64,
}

impl Runtime {
    /// Construct a runtime over `platform`.
    ///
    /// Enumerates devices once; the registry is immutable afterwards.
    pub fn new(config: RuntimeConfig, platform: Arc<dyn Accelerator>) -> Result<Arc<Self>> {
        let registry = DeviceRegistry::enumerate(&*platform, &config);
        let staging = StagingPool::new(&*platform, config.staging_kib, config.staging_buffers);
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);

        info!(
            instance,
            devices = registry.len(),
            staging = staging.available(),
            "runtime initialized"
        );

        Ok(Arc::new(Self {
            instance,
            config,
            platform,
            registry,
            contexts: RwLock::new(HashMap::new()),
            stream_owner: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            staging,
            next_context: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
        }))
    }

    /// Install the process-wide runtime, constructing it on first call.
    ///
    /// Idempotent and safe to race: every caller gets the same instance, and
    /// later configurations are ignored.
    pub fn install(config: RuntimeConfig, platform: Arc<dyn Accelerator>) -> Result<Arc<Self>> {
        if let Some(existing) = GLOBAL.get() {
            return Ok(Arc::clone(existing));
        }
        let runtime = Self::new(config, platform)?;
        Ok(Arc::clone(GLOBAL.get_or_init(|| runtime)))
    }

    /// The installed process-wide runtime, if any.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        tls::record_status(self.instance, result.as_ref().err());
        result
    }

    // --- devices ---------------------------------------------------------

    /// Number of visible devices.
    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// Cached capability snapshot for device `index`.
    pub fn device_properties(&self, index: usize) -> Result<DeviceProperties> {
        let r = self
            .registry
            .device(index)
            .map(|d| d.properties().clone());
        self.track(r)
    }

    /// The primary context of device `index`, created lazily on first call.
    /// Idempotent: later calls return the same identity.
    pub fn primary_context(&self, index: usize) -> Result<ContextId> {
        let r = (|| {
            let device = self.registry.device(index)?;
            device.primary_get_or_create(
                |id| self.contexts.read().contains_key(&id),
                || self.create_context_inner(index, ContextFlags::Default),
            )
        })();
        self.track(r)
    }

    // --- contexts --------------------------------------------------------

    /// Create a context on device `index`.
    pub fn create_context(&self, index: usize, flags: ContextFlags) -> Result<ContextId> {
        let r = self.create_context_inner(index, flags);
        self.track(r)
    }

    fn create_context_inner(&self, index: usize, flags: ContextFlags) -> Result<ContextId> {
        let device = self.registry.device(index)?;
        let queue = device.agent().create_queue()?;

        let ctx_id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let stream_id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let schedule = flags.schedule().unwrap_or(self.config.default_schedule);
        let default_stream = Stream::new(
            stream_id,
            ctx_id,
            index,
            StreamFlags::Default,
            schedule,
            true,
            queue,
            self.config.thread_safe_locks,
        );
        let ctx = Context::new(ctx_id, device, flags, default_stream, self.config.thread_safe_locks);

        self.contexts.write().insert(ctx_id, ctx);
        self.stream_owner.write().insert(stream_id, ctx_id);
        debug!(%ctx_id, device = index, "context created");
        Ok(ctx_id)
    }

    fn context_ref(&self, id: ContextId) -> Result<Arc<Context>> {
        self.contexts
            .read()
            .get(&id)
            .cloned()
            .ok_or(FreshetError::InvalidContext(id))
    }

    /// Drain and detach every non-default stream of `ctx`, force-synchronize
    /// its default stream and drop its peer permissions. The context stays
    /// usable.
    pub fn reset_context(&self, id: ContextId) -> Result<()> {
        let r: Result<()> = (|| {
            let ctx = self.context_ref(id)?;
            let detached = ctx.locked_reset()?;
            let mut owners = self.stream_owner.write();
            for stream in &detached {
                owners.remove(&stream.id());
            }
            Ok(())
        })();
        self.track(r)
    }

    /// Destroy `ctx`: drain all of its streams, release them, and invalidate
    /// every handle into it. Blocks until in-flight work retires.
    pub fn destroy_context(&self, id: ContextId) -> Result<()> {
        let r = self.destroy_context_inner(id);
        self.track(r)
    }

    fn destroy_context_inner(&self, id: ContextId) -> Result<()> {
        let ctx = self.context_ref(id)?;
        let detached = ctx.locked_reset()?;
        {
            let mut owners = self.stream_owner.write();
            for stream in &detached {
                owners.remove(&stream.id());
            }
            owners.remove(&ctx.default_stream().id());
        }
        self.contexts.write().remove(&id);
        if let Ok(device) = self.registry.device(ctx.device_index()) {
            device.primary_clear(id);
        }
        if tls::current(self.instance) == Some(id) {
            tls::set_current(self.instance, None);
        }
        debug!(ctx = %id, "context destroyed");
        Ok(())
    }

    /// Bind `ctx` as the calling thread's current context.
    pub fn set_current_context(&self, id: ContextId) -> Result<()> {
        let r: Result<()> = (|| {
            self.context_ref(id)?;
            tls::set_current(self.instance, Some(id));
            Ok(())
        })();
        self.track(r)
    }

    /// Release the calling thread's current context, returning it.
    pub fn release_current_context(&self) -> Option<ContextId> {
        let previous = tls::current(self.instance);
        tls::set_current(self.instance, None);
        previous
    }

    /// The calling thread's current context, if it is still live.
    pub fn current_context(&self) -> Option<ContextId> {
        tls::current(self.instance).filter(|id| self.contexts.read().contains_key(id))
    }

    /// Block until every stream of the current context is idle.
    pub fn device_synchronize(&self) -> Result<()> {
        let r = (|| {
            let id = tls::current(self.instance).ok_or(FreshetError::NoCurrentContext)?;
            let ctx = self.context_ref(id)?;
            ctx.locked_wait_all_streams()
        })();
        self.track(r)
    }

    /// Block until every stream of `ctx` is idle.
    pub fn context_synchronize(&self, id: ContextId) -> Result<()> {
        let r = (|| self.context_ref(id)?.locked_wait_all_streams())();
        self.track(r)
    }

    // --- streams ---------------------------------------------------------

    /// Create a stream under `ctx` with the context's scheduling mode.
    pub fn create_stream(&self, ctx: ContextId, flags: StreamFlags) -> Result<StreamId> {
        let r = self.create_stream_inner(ctx, flags, None);
        self.track(r)
    }

    /// Create a stream with an explicit scheduling mode.
    pub fn create_stream_with_schedule(
        &self,
        ctx: ContextId,
        flags: StreamFlags,
        schedule: ScheduleMode,
    ) -> Result<StreamId> {
        let r = self.create_stream_inner(ctx, flags, Some(schedule));
        self.track(r)
    }

    fn create_stream_inner(
        &self,
        ctx_id: ContextId,
        flags: StreamFlags,
        schedule: Option<ScheduleMode>,
    ) -> Result<StreamId> {
        let ctx = self.context_ref(ctx_id)?;
        let device = self.registry.device(ctx.device_index())?;
        let queue = device.agent().create_queue()?;

        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let schedule = schedule
            .or_else(|| ctx.flags().schedule())
            .unwrap_or(self.config.default_schedule);
        let stream = Stream::new(
            id,
            ctx_id,
            ctx.device_index(),
            flags,
            schedule,
            false,
            queue,
            self.config.thread_safe_locks,
        );
        ctx.locked_add_stream(stream);
        self.stream_owner.write().insert(id, ctx_id);
        debug!(stream = %id, ctx = %ctx_id, "stream created");
        Ok(id)
    }

    fn stream_ref(&self, id: StreamId) -> Result<(Arc<Context>, Arc<Stream>)> {
        let owner = self
            .stream_owner
            .read()
            .get(&id)
            .copied()
            .ok_or(FreshetError::InvalidStream(id))?;
        let ctx = self
            .contexts
            .read()
            .get(&owner)
            .cloned()
            .ok_or(FreshetError::InvalidStream(id))?;
        let stream = ctx
            .locked_find_stream(id)
            .ok_or(FreshetError::InvalidStream(id))?;
        Ok((ctx, stream))
    }

    /// The default stream of `ctx`.
    pub fn default_stream(&self, ctx: ContextId) -> Result<StreamId> {
        let r = self.context_ref(ctx).map(|c| c.default_stream().id());
        self.track(r)
    }

    /// Destroy a stream. Blocks until its in-flight work completes; the
    /// default stream cannot be destroyed.
    pub fn destroy_stream(&self, id: StreamId) -> Result<()> {
        let r: Result<()> = (|| {
            let (ctx, stream) = self.stream_ref(id)?;
            if stream.is_default() {
                return Err(FreshetError::InvalidStream(id));
            }
            stream.locked_wait(false)?;
            ctx.locked_remove_stream(id)
                .ok_or(FreshetError::InvalidStream(id))?;
            self.stream_owner.write().remove(&id);
            debug!(stream = %id, "stream destroyed");
            Ok(())
        })();
        self.track(r)
    }

    /// Non-blocking idle query.
    pub fn stream_query(&self, id: StreamId) -> Result<bool> {
        let r = (|| self.stream_ref(id)?.1.query())();
        self.track(r)
    }

    /// Block until the stream is idle. Synchronizing the default stream also
    /// drains every sibling stream not created non-blocking.
    pub fn stream_synchronize(&self, id: StreamId) -> Result<()> {
        let r = (|| {
            let (ctx, stream) = self.stream_ref(id)?;
            if stream.is_default() {
                ctx.locked_sync_default_stream(true)
            } else {
                stream.locked_wait(false)
            }
        })();
        self.track(r)
    }

    /// Submit one command to a stream.
    ///
    /// The closure receives the stream's execution queue under the stream
    /// lock and must issue exactly one command. This is the seam the kernel
    /// dispatch layer drives.
    pub fn submit<F>(&self, stream: StreamId, label: &str, f: F) -> Result<()>
    where
        F: FnOnce(&dyn CommandQueue) -> Result<Arc<dyn CompletionSignal>>,
    {
        let r: Result<()> = (|| {
            let (_ctx, stream) = self.stream_ref(stream)?;
            let signal = stream.submit(label, f)?;
            if self.config.launch_blocking {
                signal.wait();
            }
            Ok(())
        })();
        self.track(r)
    }

    // --- events ----------------------------------------------------------

    /// Create an event.
    pub fn create_event(&self, flags: EventFlags) -> Result<EventId> {
        let id = EventId(self.next_event.fetch_add(1, Ordering::Relaxed));
        let event = Event::new(id, flags, self.platform.system_timestamp());
        self.events.write().insert(id, event);
        self.track(Ok(id))
    }

    fn event_ref(&self, id: EventId) -> Result<Arc<Event>> {
        self.events
            .read()
            .get(&id)
            .cloned()
            .ok_or(FreshetError::InvalidEvent(id))
    }

    /// Destroy an event. Fails while the event is recording.
    pub fn destroy_event(&self, id: EventId) -> Result<()> {
        let r: Result<()> = (|| {
            let event = self.event_ref(id)?;
            event.ensure_destroyable()?;
            self.events.write().remove(&id);
            Ok(())
        })();
        self.track(r)
    }

    /// Record `event` into `stream`'s command order.
    pub fn record_event(&self, event: EventId, stream: StreamId) -> Result<()> {
        let r = (|| {
            let event = self.event_ref(event)?;
            let (_ctx, s) = self.stream_ref(stream)?;
            event.record_with(Some(stream), || {
                s.submit_untracked("event_record", |q| q.enqueue_marker())
            })
        })();
        self.track(r)
    }

    /// Record `event` through the current context's default stream, marked
    /// as an any-stream recording.
    pub fn record_event_any(&self, event: EventId) -> Result<()> {
        let r = (|| {
            let ctx_id = tls::current(self.instance).ok_or(FreshetError::NoCurrentContext)?;
            let ctx = self.context_ref(ctx_id)?;
            let stream = Arc::clone(ctx.default_stream());
            let event = self.event_ref(event)?;
            event.record_with(None, || {
                stream.submit_untracked("event_record", |q| q.enqueue_marker())
            })
        })();
        self.track(r)
    }

    /// Non-blocking completion poll. `Ok(false)` means the recording is
    /// still in flight.
    pub fn event_query(&self, id: EventId) -> Result<bool> {
        let r = (|| self.event_ref(id)?.query())();
        self.track(r)
    }

    /// Block until the event's recording completes.
    pub fn event_synchronize(&self, id: EventId) -> Result<()> {
        let r = (|| self.event_ref(id)?.synchronize())();
        self.track(r)
    }

    /// Resolved timestamp of a Recorded event, in nanoseconds on the
    /// accelerator clock.
    pub fn event_timestamp(&self, id: EventId) -> Result<u64> {
        let r = (|| self.event_ref(id)?.recorded_timestamp())();
        self.track(r)
    }

    /// Milliseconds between two Recorded events' timestamps.
    pub fn event_elapsed_ms(&self, start: EventId, stop: EventId) -> Result<f64> {
        let r: Result<f64> = (|| {
            let start = self.event_ref(start)?.recorded_timestamp()?;
            let stop = self.event_ref(stop)?.recorded_timestamp()?;
            Ok((stop as i128 - start as i128) as f64 / 1e6)
        })();
        self.track(r)
    }

    /// Make later commands on `stream` wait until `event`'s recording
    /// completes (a device-side dependency, not a host wait).
    pub fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()> {
        let r: Result<()> = (|| {
            let event = self.event_ref(event)?;
            let (_ctx, s) = self.stream_ref(stream)?;
            match event.recording_signal()? {
                None => Ok(()),
                Some(signal) => {
                    s.submit_untracked("event_wait", move |q| q.enqueue_wait(signal))?;
                    Ok(())
                }
            }
        })();
        self.track(r)
    }

    // --- peer access -----------------------------------------------------

    /// Allow `peer` to access memory physically resident on `ctx`'s device.
    pub fn enable_peer_access(&self, ctx: ContextId, peer: ContextId) -> Result<()> {
        let r = (|| {
            let ctx = self.context_ref(ctx)?;
            let peer_ctx = self.context_ref(peer)?;
            ctx.locked_add_peer(peer, peer_ctx.agent_handle())
        })();
        self.track(r)
    }

    /// Revoke `peer`'s access to memory on `ctx`'s device.
    pub fn disable_peer_access(&self, ctx: ContextId, peer: ContextId) -> Result<()> {
        let r = (|| {
            let ctx = self.context_ref(ctx)?;
            self.context_ref(peer)?;
            ctx.locked_remove_peer(peer)
        })();
        self.track(r)
    }

    /// Whether `peer` may currently access memory on `ctx`'s device. True
    /// for a context and itself.
    pub fn peer_accessible(&self, ctx: ContextId, peer: ContextId) -> Result<bool> {
        let r: Result<bool> = (|| {
            let ctx = self.context_ref(ctx)?;
            self.context_ref(peer)?;
            Ok(ctx.locked_is_peer(peer))
        })();
        self.track(r)
    }

    /// Number of peer entries for `ctx`, counting its own reserved entry.
    pub fn peer_count(&self, ctx: ContextId) -> Result<usize> {
        let r = self.context_ref(ctx).map(|c| c.locked_peer_count());
        self.track(r)
    }

    /// Snapshot of `ctx`'s packed peer agent array.
    pub fn peer_agents(&self, ctx: ContextId) -> Result<Vec<AgentHandle>> {
        let r = self.context_ref(ctx).map(|c| c.locked_peer_agents());
        self.track(r)
    }

    /// Whether `accessor_dev` may address memory resident on `owner_dev`,
    /// judged by the devices' primary contexts. Same-device access is always
    /// allowed.
    fn device_accessible(&self, owner_dev: usize, accessor_dev: usize) -> bool {
        if owner_dev == accessor_dev {
            return true;
        }
        let owner_ctx = self
            .registry
            .device(owner_dev)
            .ok()
            .and_then(|d| d.primary_peek())
            .and_then(|id| self.contexts.read().get(&id).cloned());
        let accessor = self
            .registry
            .device(accessor_dev)
            .ok()
            .and_then(|d| d.primary_peek());
        match (owner_ctx, accessor) {
            (Some(owner), Some(accessor)) => owner.locked_is_peer(accessor),
            _ => false,
        }
    }

    // --- copies ----------------------------------------------------------

    /// Classify a copy without executing it.
    ///
    /// Resolves provenance for both addresses and reads the peer trackers as
    /// a best-effort snapshot (each context lock is taken briefly and
    /// sequentially, never nested).
    pub fn classify_copy(&self, dst: usize, src: usize, hint: CopyHint) -> CopyPlan {
        let memory = self.platform.memory();
        let dst_info = memory.resolve(dst);
        let src_info = memory.resolve(src);
        let plan = copy::classify(
            dst_info.as_ref(),
            src_info.as_ref(),
            |owner, accessor| {
                !self.config.force_staged_peer_copies && self.device_accessible(owner, accessor)
            },
            self.staging.available(),
        );
        if plan.contradicts(hint) {
            debug!(target: "freshet::copy", ?hint, ?plan, "direction hint contradicts provenance");
        }
        plan
    }

    /// Copy `len` bytes from `src` to `dst` through `stream`, blocking until
    /// the transfer completes.
    pub fn copy_sync(
        &self,
        stream: StreamId,
        dst: usize,
        src: usize,
        len: usize,
        hint: CopyHint,
    ) -> Result<()> {
        let r = self.do_copy(stream, dst, src, len, hint, true);
        self.track(r)
    }

    /// Enqueue a copy and return immediately. The command retires in stream
    /// order; staged peer copies degrade to the synchronous staged path.
    pub fn copy_async(
        &self,
        stream: StreamId,
        dst: usize,
        src: usize,
        len: usize,
        hint: CopyHint,
    ) -> Result<()> {
        let r = self.do_copy(stream, dst, src, len, hint, false);
        self.track(r)
    }

    fn do_copy(
        &self,
        stream: StreamId,
        dst: usize,
        src: usize,
        len: usize,
        hint: CopyHint,
        blocking: bool,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if dst == 0 || src == 0 {
            return Err(FreshetError::UnresolvedProvenance { addr: 0 });
        }
        let (_ctx, stream) = self.stream_ref(stream)?;
        let plan = self.classify_copy(dst, src, hint);
        debug!(
            target: "freshet::copy",
            stream = %stream.id(),
            kind = ?plan.kind,
            len,
            forced_unpinned = plan.force_unpinned,
            "copy"
        );

        match plan.kind {
            CopyKind::HostToHost => {
                // Never touches a device queue.
                unsafe { self.platform.host_copy(dst as *mut u8, src as *const u8, len) };
                Ok(())
            }
            CopyKind::DeviceToDevicePeerStaged => {
                self.staged_copy(&stream, dst, src, len, plan.force_unpinned)
            }
            _ => {
                if blocking {
                    let signal =
                        stream.submit_untracked("copy_sync", |q| q.enqueue_copy(dst, src, len))?;
                    // The stream lock is already released; block on the
                    // signal alone.
                    signal.wait();
                    Ok(())
                } else {
                    let signal =
                        stream.submit("copy_async", |q| q.enqueue_copy(dst, src, len))?;
                    if self.config.launch_blocking {
                        signal.wait();
                    }
                    Ok(())
                }
            }
        }
    }

    /// Chunked device-to-device copy through a host staging buffer.
    ///
    /// Each hop is submitted under the stream lock and waited with the lock
    /// released, so the stream stays available to other threads between
    /// hops.
    fn staged_copy(
        &self,
        stream: &Arc<Stream>,
        dst: usize,
        src: usize,
        len: usize,
        force_unpinned: bool,
    ) -> Result<()> {
        let staging = Staging::acquire(&self.staging, len, force_unpinned)?;
        let stage = staging.addr();
        let chunk = staging.len();

        let result: Result<()> = (|| {
            let mut off = 0;
            while off < len {
                let n = chunk.min(len - off);
                let signal = stream
                    .submit_untracked("copy_stage_in", |q| q.enqueue_copy(stage, src + off, n))?;
                signal.wait();
                let signal = stream
                    .submit_untracked("copy_stage_out", |q| q.enqueue_copy(dst + off, stage, n))?;
                signal.wait();
                off += n;
            }
            Ok(())
        })();

        staging.release(&self.staging);
        result
    }

    // --- status ----------------------------------------------------------

    /// The error of the calling thread's most recent operation on this
    /// runtime, or `None` when it succeeded.
    pub fn last_status(&self) -> Option<FreshetError> {
        tls::last_status(self.instance)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instance", &self.instance)
            .field("devices", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InlinePlatform;

    fn runtime_over(devices: usize) -> (Arc<InlinePlatform>, Arc<Runtime>) {
        let platform = InlinePlatform::new(devices);
        let runtime = Runtime::new(
            RuntimeConfig::default(),
            Arc::clone(&platform) as Arc<dyn Accelerator>,
        )
        .unwrap();
        (platform, runtime)
    }

    #[test]
    fn test_primary_context_is_idempotent() {
        let (_p, rt) = runtime_over(2);
        let a = rt.primary_context(0).unwrap();
        let b = rt.primary_context(0).unwrap();
        assert_eq!(a, b);
        assert_ne!(rt.primary_context(1).unwrap(), a);
    }

    #[test]
    fn test_primary_context_recreated_after_destroy() {
        let (_p, rt) = runtime_over(1);
        let a = rt.primary_context(0).unwrap();
        rt.destroy_context(a).unwrap();
        let b = rt.primary_context(0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_device() {
        let (_p, rt) = runtime_over(1);
        assert!(matches!(
            rt.primary_context(5),
            Err(FreshetError::InvalidDevice { index: 5, count: 1 })
        ));
    }

    #[test]
    fn test_stream_lifecycle() {
        let (_p, rt) = runtime_over(1);
        let ctx = rt.primary_context(0).unwrap();
        let s = rt.create_stream(ctx, StreamFlags::Default).unwrap();

        assert!(rt.stream_query(s).unwrap());
        rt.stream_synchronize(s).unwrap();
        rt.destroy_stream(s).unwrap();

        assert_eq!(
            rt.stream_query(s).unwrap_err(),
            FreshetError::InvalidStream(s)
        );
    }

    #[test]
    fn test_default_stream_cannot_be_destroyed() {
        let (_p, rt) = runtime_over(1);
        let ctx = rt.primary_context(0).unwrap();
        let ds = rt.default_stream(ctx).unwrap();
        assert!(matches!(
            rt.destroy_stream(ds),
            Err(FreshetError::InvalidStream(_))
        ));
    }

    #[test]
    fn test_stream_ids_are_monotonic() {
        let (_p, rt) = runtime_over(1);
        let ctx = rt.primary_context(0).unwrap();
        let a = rt.create_stream(ctx, StreamFlags::Default).unwrap();
        let b = rt.create_stream(ctx, StreamFlags::Default).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_current_context() {
        let (_p, rt) = runtime_over(1);
        assert!(matches!(
            rt.device_synchronize(),
            Err(FreshetError::NoCurrentContext)
        ));

        let ctx = rt.primary_context(0).unwrap();
        rt.set_current_context(ctx).unwrap();
        assert_eq!(rt.current_context(), Some(ctx));
        rt.device_synchronize().unwrap();

        assert_eq!(rt.release_current_context(), Some(ctx));
        assert_eq!(rt.current_context(), None);
    }

    #[test]
    fn test_destroying_context_invalidates_handles() {
        let (_p, rt) = runtime_over(1);
        let ctx = rt.create_context(0, ContextFlags::Default).unwrap();
        let s = rt.create_stream(ctx, StreamFlags::Default).unwrap();

        rt.destroy_context(ctx).unwrap();
        assert_eq!(
            rt.stream_synchronize(s).unwrap_err(),
            FreshetError::InvalidStream(s)
        );
        assert_eq!(
            rt.context_synchronize(ctx).unwrap_err(),
            FreshetError::InvalidContext(ctx)
        );
    }

    #[test]
    fn test_peer_access_surface() {
        let (_p, rt) = runtime_over(2);
        let a = rt.primary_context(0).unwrap();
        let b = rt.primary_context(1).unwrap();

        assert!(!rt.peer_accessible(a, b).unwrap());
        assert!(rt.peer_accessible(a, a).unwrap());

        rt.enable_peer_access(a, b).unwrap();
        assert!(rt.peer_accessible(a, b).unwrap());
        // Directed permission: the reverse is untouched.
        assert!(!rt.peer_accessible(b, a).unwrap());

        assert_eq!(rt.peer_count(a).unwrap(), 2);
        assert_eq!(
            rt.peer_agents(a).unwrap().len(),
            rt.peer_count(a).unwrap()
        );

        rt.disable_peer_access(a, b).unwrap();
        assert!(!rt.peer_accessible(a, b).unwrap());
        assert_eq!(rt.peer_count(a).unwrap(), 1);
    }

    #[test]
    fn test_classification_uses_peer_state() {
        let (platform, rt) = runtime_over(2);
        let a = rt.primary_context(0).unwrap();
        let b = rt.primary_context(1).unwrap();

        // Fake provenance records; nothing is dereferenced.
        let on_a = 0x7000_0000;
        let on_b = 0x7100_0000;
        platform.memory_tracker().register(on_a, 4096, Some(0), false);
        platform.memory_tracker().register(on_b, 4096, Some(1), false);

        let plan = rt.classify_copy(on_a, on_b, CopyHint::Auto);
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeerStaged);

        rt.enable_peer_access(a, b).unwrap();
        rt.enable_peer_access(b, a).unwrap();
        let plan = rt.classify_copy(on_a, on_b, CopyHint::Auto);
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeer);
        assert_eq!(plan.copy_device, Some(0));
    }

    #[test]
    fn test_forced_staging_overrides_peers() {
        let platform = InlinePlatform::new(2);
        let rt = Runtime::new(
            RuntimeConfig::builder().force_staged_peer_copies(true).build(),
            Arc::clone(&platform) as Arc<dyn Accelerator>,
        )
        .unwrap();

        let a = rt.primary_context(0).unwrap();
        let b = rt.primary_context(1).unwrap();
        rt.enable_peer_access(a, b).unwrap();
        rt.enable_peer_access(b, a).unwrap();

        let on_a = 0x7000_0000;
        let on_b = 0x7100_0000;
        platform.memory_tracker().register(on_a, 4096, Some(0), false);
        platform.memory_tracker().register(on_b, 4096, Some(1), false);

        let plan = rt.classify_copy(on_a, on_b, CopyHint::Auto);
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeerStaged);
    }

    #[test]
    fn test_staging_allocation_failure_forces_unpinned() {
        let platform = InlinePlatform::without_staging(2);
        let rt = Runtime::new(
            RuntimeConfig::default(),
            Arc::clone(&platform) as Arc<dyn Accelerator>,
        )
        .unwrap();
        rt.primary_context(0).unwrap();
        rt.primary_context(1).unwrap();

        let on_a = 0x7000_0000;
        let on_b = 0x7100_0000;
        platform.memory_tracker().register(on_a, 4096, Some(0), false);
        platform.memory_tracker().register(on_b, 4096, Some(1), false);

        let plan = rt.classify_copy(on_a, on_b, CopyHint::Auto);
        assert_eq!(plan.kind, CopyKind::DeviceToDevicePeerStaged);
        assert!(plan.force_unpinned);
    }

    #[test]
    fn test_install_is_idempotent() {
        let a = Runtime::install(
            RuntimeConfig::default(),
            InlinePlatform::new(1) as Arc<dyn Accelerator>,
        )
        .unwrap();
        let b = Runtime::install(
            RuntimeConfig::default(),
            InlinePlatform::new(2) as Arc<dyn Accelerator>,
        )
        .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Runtime::global().is_some());
    }

    #[test]
    fn test_event_lifecycle() {
        let (_p, rt) = runtime_over(1);
        let ctx = rt.primary_context(0).unwrap();
        let s = rt.create_stream(ctx, StreamFlags::Default).unwrap();

        let start = rt.create_event(EventFlags::Default).unwrap();
        let stop = rt.create_event(EventFlags::Default).unwrap();

        rt.record_event(start, s).unwrap();
        rt.record_event(stop, s).unwrap();
        rt.event_synchronize(start).unwrap();
        rt.event_synchronize(stop).unwrap();

        assert!(rt.event_query(stop).unwrap());
        assert!(rt.event_elapsed_ms(start, stop).unwrap() >= 0.0);

        // Timestamps are monotonic and no earlier than event creation.
        let created_at = rt.events.read().get(&start).unwrap().created_at();
        assert!(rt.event_timestamp(start).unwrap() >= created_at);
        assert!(rt.event_timestamp(stop).unwrap() >= rt.event_timestamp(start).unwrap());

        rt.destroy_event(start).unwrap();
        assert_eq!(
            rt.event_query(start).unwrap_err(),
            FreshetError::InvalidEvent(start)
        );
    }

    #[test]
    fn test_last_status_tracks_errors() {
        let (_p, rt) = runtime_over(1);
        assert!(rt.primary_context(9).is_err());
        assert!(matches!(
            rt.last_status(),
            Some(FreshetError::InvalidDevice { .. })
        ));

        rt.primary_context(0).unwrap();
        assert_eq!(rt.last_status(), None);
    }
}
