//! The host platform: simulated devices over worker-thread queues.
//!
//! `HostPlatform::new(n)` models `n` GPU agents. Device memory is ordinary
//! host memory tagged with its owning device in the provenance registry,
//! which is enough to exercise every classification and synchronization path
//! the runtime core has.

use std::sync::Arc;

use tracing::info;

use freshet_core::accel::{
    Accelerator, Agent, AgentHandle, AgentInfo, AgentKind, CommandQueue, MemoryTracker,
    StagingBuffer,
};
use freshet_core::error::Result;

use crate::memory::{HostBuffer, HostMemoryTracker};
use crate::queue::{HostClock, HostQueue};

const AGENT_HANDLE_BASE: AgentHandle = 0x4652_0000;

/// One simulated device.
pub struct HostAgent {
    index: usize,
    clock: Arc<HostClock>,
}

impl Agent for HostAgent {
    fn handle(&self) -> AgentHandle {
        AGENT_HANDLE_BASE + self.index as AgentHandle
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            name: format!("Freshet Host Agent {}", self.index),
            kind: AgentKind::Gpu,
            compute_units: 16,
            total_memory: 2 << 30,
            large_memory_region: true,
        }
    }

    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>> {
        let queue = HostQueue::spawn(self.index, Arc::clone(&self.clock))?;
        Ok(queue as Arc<dyn CommandQueue>)
    }
}

/// Software implementation of the accelerator abstraction.
pub struct HostPlatform {
    agents: Vec<Arc<HostAgent>>,
    memory: Arc<HostMemoryTracker>,
    clock: Arc<HostClock>,
}

impl HostPlatform {
    /// Create a platform with `devices` simulated GPU agents.
    pub fn new(devices: usize) -> Arc<Self> {
        let clock = HostClock::new();
        let agents = (0..devices)
            .map(|index| {
                Arc::new(HostAgent {
                    index,
                    clock: Arc::clone(&clock),
                })
            })
            .collect();
        info!(devices, "host platform created");
        Arc::new(Self {
            agents,
            memory: HostMemoryTracker::new(),
            clock,
        })
    }

    /// The concrete provenance registry, for allocations.
    pub fn memory_tracker(&self) -> &Arc<HostMemoryTracker> {
        &self.memory
    }

    /// Allocate simulated device memory on `device`.
    pub fn alloc_device(&self, device: usize, len: usize) -> Result<HostBuffer> {
        HostBuffer::alloc(Arc::clone(&self.memory), len, Some(device), false)
    }

    /// Allocate pinned host memory.
    pub fn alloc_pinned(&self, len: usize) -> Result<HostBuffer> {
        HostBuffer::alloc(Arc::clone(&self.memory), len, None, true)
    }

    /// Allocate plain (unpinned) registered host memory.
    pub fn alloc_host(&self, len: usize) -> Result<HostBuffer> {
        HostBuffer::alloc(Arc::clone(&self.memory), len, None, false)
    }
}

impl Accelerator for HostPlatform {
    fn agents(&self) -> Vec<Arc<dyn Agent>> {
        self.agents
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn Agent>)
            .collect()
    }

    fn memory(&self) -> Arc<dyn MemoryTracker> {
        Arc::clone(&self.memory) as Arc<dyn MemoryTracker>
    }

    fn system_timestamp(&self) -> u64 {
        self.clock.now_ns()
    }

    fn alloc_staging(&self, len: usize) -> Result<Box<dyn StagingBuffer>> {
        let buffer = self.alloc_pinned(len)?;
        Ok(Box::new(buffer))
    }

    unsafe fn host_copy(&self, dst: *mut u8, src: *const u8, len: usize) {
        unsafe { std::ptr::copy(src, dst, len) };
    }
}
