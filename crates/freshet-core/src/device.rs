//! Device registry: physical accelerators enumerated once at startup.
//!
//! The registry is immutable after construction, so no locking is needed
//! beyond the per-device primary-context slot, which is set at most once and
//! lazily.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::accel::{Accelerator, Agent, AgentHandle, AgentKind};
use crate::config::RuntimeConfig;
use crate::error::{FreshetError, Result};
use crate::types::ContextId;

/// Capability snapshot cached per device at enumeration time.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
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

/// One visible accelerator.
///
/// Immutable after registry construction apart from the primary-context
/// slot.
pub struct Device {
    index: usize,
    agent: Arc<dyn Agent>,
    props: DeviceProperties,
    primary: Mutex<Option<ContextId>>,
}

impl Device {
    pub(crate) fn new(index: usize, agent: Arc<dyn Agent>) -> Self {
        let info = agent.info();
        let props = DeviceProperties {
            name: info.name,
            kind: info.kind,
            compute_units: info.compute_units,
            total_memory: info.total_memory,
            large_memory_region: info.large_memory_region,
        };
        Self {
            index,
            agent,
            props,
            primary: Mutex::new(None),
        }
    }

    /// Registry index of this device.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The underlying accelerator agent.
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Opaque agent handle, as used in peer-agent arrays.
    pub fn agent_handle(&self) -> AgentHandle {
        self.agent.handle()
    }

    /// Cached capability snapshot.
    pub fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    /// The primary context, if it has been created.
    pub(crate) fn primary_peek(&self) -> Option<ContextId> {
        *self.primary.lock()
    }

    /// Resolve the primary context, creating it through `create` on first
    /// use. Idempotent: every later call returns the same identity until the
    /// slot is cleared.
    pub(crate) fn primary_get_or_create<F>(&self, mut live: impl FnMut(ContextId) -> bool, create: F) -> Result<ContextId>
    where
        F: FnOnce() -> Result<ContextId>,
    {
        let mut slot = self.primary.lock();
        if let Some(id) = *slot {
            if live(id) {
                return Ok(id);
            }
        }
        let id = create()?;
        *slot = Some(id);
        debug!(device = self.index, %id, "primary context created");
        Ok(id)
    }

    /// Clear the primary-context slot after the context is torn down.
    pub(crate) fn primary_clear(&self, id: ContextId) {
        let mut slot = self.primary.lock();
        if *slot == Some(id) {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("name", &self.props.name)
            .field("compute_units", &self.props.compute_units)
            .finish()
    }
}

/// The set of visible devices, fixed at runtime construction.
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
}

impl DeviceRegistry {
    /// Enumerate the platform's agents, applying the visibility allow-list
    /// and the device-kind policy from `config`. Registry indices are dense
    /// and assigned in surviving platform order.
    pub fn enumerate(platform: &dyn Accelerator, config: &RuntimeConfig) -> Self {
        let mut devices = Vec::new();
        for (ordinal, agent) in platform.agents().into_iter().enumerate() {
            let info = agent.info();
            if info.kind == AgentKind::Cpu && !config.allow_cpu_agents {
                debug!(ordinal, name = %info.name, "skipping CPU agent");
                continue;
            }
            if let Some(visible) = &config.visible_devices {
                if !visible.contains(&ordinal) {
                    debug!(ordinal, name = %info.name, "device hidden by visibility list");
                    continue;
                }
            }
            let index = devices.len();
            devices.push(Arc::new(Device::new(index, agent)));
        }

        info!(count = devices.len(), "enumerated accelerator devices");
        Self { devices }
    }

    /// Number of visible devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no device survived enumeration.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device at `index`, or InvalidDevice outside `[0, len())`.
    pub fn device(&self, index: usize) -> Result<&Arc<Device>> {
        self.devices.get(index).ok_or(FreshetError::InvalidDevice {
            index,
            count: self.devices.len(),
        })
    }

    /// Iterate over all visible devices.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }
}
