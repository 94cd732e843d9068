//! Contexts: owners of streams and peer permissions, scoped to one device.
//!
//! All mutation of a context's stream list or peer set happens under its
//! single lock. Functions named `locked_*` acquire that lock themselves;
//! they must never be called while already holding it, and they never call
//! into another context's locked operations. When both a context lock and a
//! stream lock are needed the context lock is acquired first.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::accel::AgentHandle;
use crate::device::Device;
use crate::error::{FreshetError, Result};
use crate::locking::{domain_lock, DomainLock};
use crate::stream::{ScheduleMode, Stream};
use crate::types::{ContextId, StreamId};

/// Context creation flags, fixing the scheduling mode streams inherit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextFlags {
    /// Streams inherit the runtime's default scheduling mode.
    #[default]
    Default,
    /// Streams busy-spin while waiting.
    ScheduleSpin,
    /// Streams yield between polls while waiting.
    ScheduleYield,
}

impl ContextFlags {
    /// Scheduling mode implied by these flags, if any.
    pub fn schedule(self) -> Option<ScheduleMode> {
        match self {
            ContextFlags::Default => None,
            ContextFlags::ScheduleSpin => Some(ScheduleMode::Spin),
            ContextFlags::ScheduleYield => Some(ScheduleMode::Yield),
        }
    }
}

/// One enabled peer of a context.
#[derive(Debug, Clone, Copy)]
struct PeerEntry {
    ctx: ContextId,
    agent: AgentHandle,
}

/// Tracker of which peer contexts may access memory physically resident on
/// this context's device.
///
/// The representation is reflexive: the context itself occupies the reserved
/// first slot, so the packed agent array can be handed to peer-aware
/// accelerator calls without a zero-peer special case. Reflexivity is not a
/// grantable permission; the self entry cannot be added or removed.
///
/// No lock of its own: this is context-lock state.
pub(crate) struct PeerTracker {
    entries: Vec<PeerEntry>,
    agents: Vec<AgentHandle>,
}

impl PeerTracker {
    fn new(self_ctx: ContextId, self_agent: AgentHandle) -> Self {
        let mut tracker = Self {
            entries: vec![PeerEntry {
                ctx: self_ctx,
                agent: self_agent,
            }],
            agents: Vec::new(),
        };
        tracker.recompute_agents();
        tracker
    }

    /// True when `peer` currently holds enable permission (always true for
    /// the context itself).
    fn is_peer(&self, peer: ContextId) -> bool {
        self.entries.iter().any(|e| e.ctx == peer)
    }

    /// Insert `peer`; false when it was already present.
    fn add(&mut self, peer: ContextId, agent: AgentHandle) -> bool {
        if self.is_peer(peer) {
            return false;
        }
        self.entries.push(PeerEntry { ctx: peer, agent });
        self.recompute_agents();
        true
    }

    /// Remove `peer`; false when absent. The reserved self entry is not
    /// removable.
    fn remove(&mut self, peer: ContextId) -> bool {
        if self.entries.first().map(|e| e.ctx) == Some(peer) {
            return false;
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.ctx != peer);
        if self.entries.len() == before {
            return false;
        }
        self.recompute_agents();
        true
    }

    /// Drop every enabled peer, keeping the reserved self entry.
    fn reset(&mut self) {
        self.entries.truncate(1);
        self.recompute_agents();
    }

    /// Rebuild the packed agent array from the peer set, in insertion order.
    /// Invariant: `agents.len() == count()` at all times.
    fn recompute_agents(&mut self) {
        self.agents.clear();
        self.agents.extend(self.entries.iter().map(|e| e.agent));
    }

    /// Number of entries, counting the reserved self entry.
    fn count(&self) -> usize {
        self.entries.len()
    }

    fn agents(&self) -> &[AgentHandle] {
        &self.agents
    }
}

/// State only touched while the context lock is held.
pub(crate) struct CtxCritical {
    /// Streams owned by this context, in creation order. The default stream
    /// is always present.
    streams: Vec<Arc<Stream>>,
    /// Peer permissions on this context's device memory.
    peers: PeerTracker,
}

/// A context: one device, a default stream, a stream list and a peer set.
///
/// Multiple contexts may target the same device.
pub struct Context {
    id: ContextId,
    device_index: usize,
    agent_handle: AgentHandle,
    flags: ContextFlags,
    default_stream: Arc<Stream>,
    critical: DomainLock<CtxCritical>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        device: &Device,
        flags: ContextFlags,
        default_stream: Arc<Stream>,
        thread_safe: bool,
    ) -> Arc<Self> {
        let agent_handle = device.agent_handle();
        Arc::new(Self {
            id,
            device_index: device.index(),
            agent_handle,
            flags,
            default_stream: Arc::clone(&default_stream),
            critical: domain_lock(
                CtxCritical {
                    streams: vec![default_stream],
                    peers: PeerTracker::new(id, agent_handle),
                },
                thread_safe,
            ),
        })
    }

    /// Context identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Index of the device this context targets.
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Agent handle of the device this context targets.
    pub fn agent_handle(&self) -> AgentHandle {
        self.agent_handle
    }

    /// Creation flags.
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// The context's default stream.
    pub fn default_stream(&self) -> &Arc<Stream> {
        &self.default_stream
    }

    // --- stream list -----------------------------------------------------

    pub(crate) fn locked_add_stream(&self, stream: Arc<Stream>) {
        let mut crit = self.critical.lock();
        trace!(target: "freshet::sync", ctx = %self.id, stream = %stream.id(), "stream attached");
        crit.streams.push(stream);
    }

    pub(crate) fn locked_remove_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        let mut crit = self.critical.lock();
        let pos = crit.streams.iter().position(|s| s.id() == id)?;
        trace!(target: "freshet::sync", ctx = %self.id, stream = %id, "stream detached");
        Some(crit.streams.remove(pos))
    }

    pub(crate) fn locked_find_stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        let crit = self.critical.lock();
        crit.streams.iter().find(|s| s.id() == id).cloned()
    }

    /// Number of owned streams, including the default stream.
    pub fn locked_stream_count(&self) -> usize {
        self.critical.lock().streams.len()
    }

    // --- synchronization -------------------------------------------------

    /// Block until every stream owned by this context is idle.
    ///
    /// Holds the context lock for the duration of the sweep so the stream
    /// list cannot change underneath it; each stream is drained through its
    /// own lock (context before stream order).
    pub fn locked_wait_all_streams(&self) -> Result<()> {
        let crit = self.critical.lock();
        debug!(target: "freshet::sync", ctx = %self.id, streams = crit.streams.len(), "waiting for all streams");
        for stream in &crit.streams {
            stream.locked_wait(false)?;
        }
        Ok(())
    }

    /// Synchronize the default stream against its siblings.
    ///
    /// Blocks until every stream not created non-blocking has completed the
    /// work submitted so far; with `wait_on_self` the default stream itself
    /// is drained as well.
    pub fn locked_sync_default_stream(&self, wait_on_self: bool) -> Result<()> {
        let crit = self.critical.lock();
        debug!(target: "freshet::sync", ctx = %self.id, wait_on_self, "default-stream synchronization");
        for stream in &crit.streams {
            if stream.is_default() {
                if wait_on_self {
                    stream.locked_wait(false)?;
                }
            } else if !stream.flags().is_non_blocking() {
                stream.locked_wait(false)?;
            }
        }
        Ok(())
    }

    /// Drain and detach every non-default stream, force-synchronize the
    /// default stream, and drop all peer permissions.
    ///
    /// Returns the detached streams so the owner can unregister their
    /// identifiers.
    pub(crate) fn locked_reset(&self) -> Result<Vec<Arc<Stream>>> {
        let mut crit = self.critical.lock();
        debug!(target: "freshet::sync", ctx = %self.id, streams = crit.streams.len(), "context reset");

        for stream in &crit.streams {
            stream.locked_wait(false)?;
        }

        let detached: Vec<Arc<Stream>> = crit
            .streams
            .iter()
            .filter(|s| !s.is_default())
            .cloned()
            .collect();
        crit.streams.retain(|s| s.is_default());
        crit.peers.reset();

        Ok(detached)
    }

    // --- peer access -----------------------------------------------------

    /// True when `peer` may access memory physically resident on this
    /// context's device.
    pub fn locked_is_peer(&self, peer: ContextId) -> bool {
        self.critical.lock().peers.is_peer(peer)
    }

    /// Grant `peer` access to this context's device memory.
    pub(crate) fn locked_add_peer(&self, peer: ContextId, agent: AgentHandle) -> Result<()> {
        let mut crit = self.critical.lock();
        if !crit.peers.add(peer, agent) {
            return Err(FreshetError::PeerAccessAlreadyEnabled {
                device: self.device_index,
                peer,
            });
        }
        debug!(target: "freshet::peer", ctx = %self.id, %peer, peers = crit.peers.count(), "peer access enabled");
        Ok(())
    }

    /// Revoke `peer`'s access to this context's device memory.
    pub(crate) fn locked_remove_peer(&self, peer: ContextId) -> Result<()> {
        let mut crit = self.critical.lock();
        if !crit.peers.remove(peer) {
            return Err(FreshetError::PeerAccessNotEnabled {
                device: self.device_index,
                peer,
            });
        }
        debug!(target: "freshet::peer", ctx = %self.id, %peer, peers = crit.peers.count(), "peer access disabled");
        Ok(())
    }

    /// Number of peer entries, counting the reserved self entry. Always
    /// equal to `locked_peer_agents().len()`.
    pub fn locked_peer_count(&self) -> usize {
        self.critical.lock().peers.count()
    }

    /// Snapshot of the packed peer agent array.
    pub fn locked_peer_agents(&self) -> Vec<AgentHandle> {
        self.critical.lock().peers.agents().to_vec()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("device", &self.device_index)
            .field("flags", &self.flags)
            .finish()
    }
}
