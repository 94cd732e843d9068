//! In-process accelerator stubs for unit tests.
//!
//! The inline queue executes every command immediately on the calling
//! thread, so unit tests can drive full control flows without worker
//! threads. The manual signal completes on demand, for exercising the event
//! state machine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::accel::{
    Accelerator, Agent, AgentHandle, AgentInfo, AgentKind, CommandQueue, CompletionSignal,
    MemoryTracker, PointerInfo, StagingBuffer, WaitMode,
};
use crate::device::Device;
use crate::error::{FreshetError, Result};

static NEXT_TS: AtomicU64 = AtomicU64::new(1);

fn next_ts() -> u64 {
    NEXT_TS.fetch_add(1, Ordering::Relaxed)
}

/// Signal that is complete from birth.
pub(crate) struct DoneSignal {
    ts: u64,
}

impl DoneSignal {
    fn arc() -> Arc<dyn CompletionSignal> {
        Arc::new(Self { ts: next_ts() })
    }
}

impl CompletionSignal for DoneSignal {
    fn is_complete(&self) -> bool {
        true
    }

    fn wait(&self) {}

    fn timestamp(&self) -> Option<u64> {
        Some(self.ts)
    }
}

/// Signal completed on demand by the test.
pub(crate) struct ManualSignal {
    state: Mutex<(bool, Option<u64>)>,
    cv: Condvar,
}

impl ManualSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((false, None)),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, ts: u64) {
        let mut state = self.state.lock();
        state.0 = true;
        state.1 = Some(ts);
        self.cv.notify_all();
    }
}

impl CompletionSignal for ManualSignal {
    fn is_complete(&self) -> bool {
        self.state.lock().0
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.0 {
            self.cv.wait(&mut state);
        }
    }

    fn timestamp(&self) -> Option<u64> {
        self.state.lock().1
    }
}

/// Queue that executes every command inline.
pub(crate) struct InlineQueue;

impl InlineQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl CommandQueue for InlineQueue {
    fn enqueue_task(
        &self,
        _label: &str,
        task: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<dyn CompletionSignal>> {
        task();
        Ok(DoneSignal::arc())
    }

    fn enqueue_copy(&self, dst: usize, src: usize, len: usize) -> Result<Arc<dyn CompletionSignal>> {
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len) };
        Ok(DoneSignal::arc())
    }

    fn enqueue_marker(&self) -> Result<Arc<dyn CompletionSignal>> {
        Ok(DoneSignal::arc())
    }

    fn enqueue_wait(&self, signal: Arc<dyn CompletionSignal>) -> Result<Arc<dyn CompletionSignal>> {
        signal.wait();
        Ok(DoneSignal::arc())
    }

    fn is_idle(&self) -> Result<bool> {
        Ok(true)
    }

    fn wait_idle(&self, _mode: WaitMode) -> Result<()> {
        Ok(())
    }
}

/// Agent backed by an inline queue.
pub(crate) struct InlineAgent {
    index: usize,
    kind: AgentKind,
}

impl Agent for InlineAgent {
    fn handle(&self) -> AgentHandle {
        0x5100 + self.index as u64
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            name: format!("inline-{}-{}", if self.kind == AgentKind::Gpu { "gpu" } else { "cpu" }, self.index),
            kind: self.kind,
            compute_units: 8,
            total_memory: 1 << 30,
            large_memory_region: true,
        }
    }

    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>> {
        Ok(InlineQueue::new())
    }
}

/// A standalone device over an inline agent.
pub(crate) fn inline_device(index: usize) -> Device {
    Device::new(
        index,
        Arc::new(InlineAgent {
            index,
            kind: AgentKind::Gpu,
        }),
    )
}

/// Range-map provenance registry with manual registration.
pub(crate) struct InlineMemory {
    regions: RwLock<BTreeMap<usize, PointerInfo>>,
}

impl InlineMemory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: RwLock::new(BTreeMap::new()),
        })
    }

    pub(crate) fn register(&self, base: usize, len: usize, device: Option<usize>, pinned: bool) {
        self.regions.write().insert(
            base,
            PointerInfo {
                base,
                len,
                device,
                pinned,
            },
        );
    }
}

impl MemoryTracker for InlineMemory {
    fn resolve(&self, addr: usize) -> Option<PointerInfo> {
        let regions = self.regions.read();
        let (_, info) = regions.range(..=addr).next_back()?;
        if addr < info.base + info.len {
            Some(*info)
        } else {
            None
        }
    }
}

struct VecStaging {
    buf: Vec<u8>,
    addr: usize,
}

impl VecStaging {
    fn boxed(len: usize) -> Box<Self> {
        let mut buf = vec![0u8; len];
        let addr = buf.as_mut_ptr() as usize;
        Box::new(Self { buf, addr })
    }
}

impl StagingBuffer for VecStaging {
    fn addr(&self) -> usize {
        self.addr
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Platform over N inline GPU agents.
pub(crate) struct InlinePlatform {
    agents: Vec<Arc<dyn Agent>>,
    memory: Arc<InlineMemory>,
    staging_ok: bool,
}

impl InlinePlatform {
    pub(crate) fn new(devices: usize) -> Arc<Self> {
        Self::build(devices, false, true)
    }

    /// Platform with a trailing CPU agent, for device-kind policy tests.
    pub(crate) fn with_cpu(gpus: usize) -> Arc<Self> {
        Self::build(gpus, true, true)
    }

    /// Platform whose pinned-staging allocation always fails.
    pub(crate) fn without_staging(gpus: usize) -> Arc<Self> {
        Self::build(gpus, false, false)
    }

    fn build(gpus: usize, cpu: bool, staging_ok: bool) -> Arc<Self> {
        let mut agents: Vec<Arc<dyn Agent>> = (0..gpus)
            .map(|index| {
                Arc::new(InlineAgent {
                    index,
                    kind: AgentKind::Gpu,
                }) as Arc<dyn Agent>
            })
            .collect();
        if cpu {
            agents.push(Arc::new(InlineAgent {
                index: gpus,
                kind: AgentKind::Cpu,
            }));
        }
        Arc::new(Self {
            agents,
            memory: InlineMemory::new(),
            staging_ok,
        })
    }

    pub(crate) fn memory_tracker(&self) -> &Arc<InlineMemory> {
        &self.memory
    }
}

impl Accelerator for InlinePlatform {
    fn agents(&self) -> Vec<Arc<dyn Agent>> {
        self.agents.clone()
    }

    fn memory(&self) -> Arc<dyn MemoryTracker> {
        Arc::clone(&self.memory) as Arc<dyn MemoryTracker>
    }

    fn system_timestamp(&self) -> u64 {
        next_ts()
    }

    fn alloc_staging(&self, len: usize) -> Result<Box<dyn StagingBuffer>> {
        if self.staging_ok {
            Ok(VecStaging::boxed(len))
        } else {
            Err(FreshetError::Accelerator("pinned staging disabled".into()))
        }
    }

    unsafe fn host_copy(&self, dst: *mut u8, src: *const u8, len: usize) {
        unsafe { std::ptr::copy(src, dst, len) };
    }
}
