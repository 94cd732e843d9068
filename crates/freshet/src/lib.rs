//! # Freshet
//!
//! A GPU compute runtime's execution-management layer: devices, contexts,
//! streams, events, peer-to-peer access tracking and memory-copy
//! classification, with a software host backend for machines without
//! accelerator hardware.
//!
//! ## Quick start
//!
//! ```
//! use freshet::{CopyHint, HostPlatform, Runtime, RuntimeConfig, StreamFlags};
//!
//! # fn main() -> freshet::Result<()> {
//! let platform = HostPlatform::new(1);
//! let runtime = Runtime::new(RuntimeConfig::default(), platform.clone())?;
//!
//! let src = platform.alloc_pinned(1024)?;
//! let dst = platform.alloc_device(0, 1024)?;
//! src.write(0, b"hello");
//!
//! let ctx = runtime.primary_context(0)?;
//! let stream = runtime.create_stream(ctx, StreamFlags::Default)?;
//! runtime.copy_sync(stream, dst.addr(), src.addr(), 1024, CopyHint::Auto)?;
//! assert_eq!(dst.read_vec(0, 5), b"hello");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub use freshet_core::accel::{
    Accelerator, Agent, AgentHandle, AgentInfo, AgentKind, CommandQueue, CompletionSignal,
    MemoryTracker, PointerInfo, StagingBuffer, WaitMode,
};
pub use freshet_core::config::{RuntimeConfig, RuntimeConfigBuilder};
pub use freshet_core::context::ContextFlags;
pub use freshet_core::copy::{CopyHint, CopyKind, CopyPlan};
pub use freshet_core::device::DeviceProperties;
pub use freshet_core::error::{FreshetError, Result};
pub use freshet_core::event::{EventFlags, EventState};
pub use freshet_core::runtime::Runtime;
pub use freshet_core::stream::{ScheduleMode, StreamFlags};
pub use freshet_core::types::{ContextId, DeviceIndex, EventId, StreamId};

pub use freshet_host::{HostBuffer, HostMemoryTracker, HostPlatform};
