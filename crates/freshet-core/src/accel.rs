//! Accelerator abstraction consumed by the runtime core.
//!
//! The core orchestrates devices, contexts, streams and events but never
//! touches hardware directly. Agent enumeration, command execution,
//! completion signalling, pointer provenance and the host timestamp source
//! are all supplied through the traits in this module, which keeps the core
//! testable in isolation and keeps hardware backends out of this crate.

use std::sync::Arc;

use crate::error::Result;

/// Opaque agent handle, as packed into peer-agent arrays and passed back to
/// peer-aware accelerator calls.
pub type AgentHandle = u64;

/// Kind of accelerator agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// A GPU-class device.
    Gpu,
    /// A CPU agent, visible only when the device policy admits it.
    Cpu,
}

/// Static property snapshot reported by an agent.
///
/// Cached once per device at registry construction; the core never queries
/// properties again after that.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    /// Human-readable device name.
    pub name: String,
    /// Agent kind.
    pub kind: AgentKind,
    /// Number of compute units.
    pub compute_units: u32,
    /// Total device memory in bytes.
    pub total_memory: u64,
    /// Whether the whole device memory aperture is host-visible.
    pub large_memory_region: bool,
}

/// How a blocking queue wait burns its time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Backend default (usually a blocking wait).
    #[default]
    Auto,
    /// Busy-spin until idle.
    Spin,
    /// Spin, yielding the thread between polls.
    Yield,
}

/// Provenance metadata for one runtime-managed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerInfo {
    /// Base address of the allocation containing the queried pointer.
    pub base: usize,
    /// Allocation length in bytes.
    pub len: usize,
    /// Owning device, or `None` for host memory.
    pub device: Option<usize>,
    /// Whether host memory is pinned (page-locked). Meaningless for device
    /// allocations.
    pub pinned: bool,
}

impl PointerInfo {
    /// True for device-resident memory.
    pub fn is_device(&self) -> bool {
        self.device.is_some()
    }
}

/// Completion token for one submitted command.
pub trait CompletionSignal: Send + Sync {
    /// Non-blocking completion check.
    fn is_complete(&self) -> bool;

    /// Block the calling thread until the command has retired.
    fn wait(&self);

    /// Device timestamp in nanoseconds, present once complete. Uses the same
    /// clock as [`Accelerator::system_timestamp`].
    fn timestamp(&self) -> Option<u64>;
}

/// Ordered execution queue bound to one agent.
///
/// Commands retire in submission order; that ordering is what stream
/// semantics are built on.
pub trait CommandQueue: Send + Sync {
    /// Enqueue an opaque unit of work (a kernel dispatch, from the core's
    /// point of view).
    fn enqueue_task(
        &self,
        label: &str,
        task: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<dyn CompletionSignal>>;

    /// Enqueue a memory copy of `len` bytes from `src` to `dst`.
    fn enqueue_copy(&self, dst: usize, src: usize, len: usize)
        -> Result<Arc<dyn CompletionSignal>>;

    /// Enqueue a marker that completes when everything before it has retired.
    fn enqueue_marker(&self) -> Result<Arc<dyn CompletionSignal>>;

    /// Enqueue a dependency: later commands on this queue wait until `signal`
    /// fires.
    fn enqueue_wait(&self, signal: Arc<dyn CompletionSignal>)
        -> Result<Arc<dyn CompletionSignal>>;

    /// Non-blocking idle check.
    fn is_idle(&self) -> Result<bool>;

    /// Block until every submitted command has retired.
    fn wait_idle(&self, mode: WaitMode) -> Result<()>;
}

/// One accelerator agent, i.e. one physical device.
pub trait Agent: Send + Sync {
    /// Opaque handle used in peer-agent arrays.
    fn handle(&self) -> AgentHandle;

    /// Static property snapshot.
    fn info(&self) -> AgentInfo;

    /// Create an execution queue bound to this agent.
    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>>;
}

/// Pinned host buffer used to stage device-to-device copies that cannot go
/// direct.
pub trait StagingBuffer: Send {
    /// Buffer base address.
    fn addr(&self) -> usize;

    /// Buffer length in bytes.
    fn len(&self) -> usize;

    /// True for a zero-length buffer.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pointer-provenance service.
///
/// Reports, for addresses handed out by the runtime's allocators, whether
/// they are host or device resident and on which device. Addresses it does
/// not know degrade copies to the conservative unpinned host path.
pub trait MemoryTracker: Send + Sync {
    /// Look up provenance for `addr`, if it falls inside a known allocation.
    fn resolve(&self, addr: usize) -> Option<PointerInfo>;
}

/// The platform a [`crate::runtime::Runtime`] is constructed over.
pub trait Accelerator: Send + Sync {
    /// Enumerate agents, in platform order. Filtering by visibility and kind
    /// happens in the device registry, not here.
    fn agents(&self) -> Vec<Arc<dyn Agent>>;

    /// The pointer-provenance service for this platform.
    fn memory(&self) -> Arc<dyn MemoryTracker>;

    /// Monotonic timestamp in nanoseconds, on the same clock completion
    /// signals resolve their timestamps against.
    fn system_timestamp(&self) -> u64;

    /// Allocate a pinned staging buffer of `len` bytes. An error means pinned
    /// staging is unavailable and copies fall back to unpinned temporaries.
    fn alloc_staging(&self, len: usize) -> Result<Box<dyn StagingBuffer>>;

    /// Plain host copy used for host-to-host transfers and unpinned
    /// fallbacks.
    ///
    /// # Safety
    ///
    /// `dst` and `src` must be valid for `len` bytes and the ranges must not
    /// be concurrently mutated.
    unsafe fn host_copy(&self, dst: *mut u8, src: *const u8, len: usize);
}
