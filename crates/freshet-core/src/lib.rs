//! # Freshet Core
//!
//! Execution-management core of the Freshet GPU compute runtime: the
//! device/context/stream ownership hierarchy and its locking discipline,
//! peer-access tracking, the stream completion protocol and event state
//! machine, and copy-direction resolution from pointer provenance.
//!
//! Hardware is reached through the trait seam in [`accel`]; this crate never
//! touches a device directly. The `freshet-host` crate provides a software
//! implementation of those traits.
//!
//! ## Example
//!
//! ```ignore
//! use freshet_core::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::from_env(), platform)?;
//! let ctx = runtime.primary_context(0)?;
//! let stream = runtime.create_stream(ctx, StreamFlags::Default)?;
//! runtime.copy_async(stream, dst, src, len, CopyHint::Auto)?;
//! runtime.stream_synchronize(stream)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod accel;
pub mod config;
pub mod context;
pub mod copy;
pub mod device;
pub mod error;
pub mod event;
pub mod locking;
pub mod runtime;
pub mod stream;
mod tls;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::accel::{
        Accelerator, Agent, AgentHandle, AgentInfo, AgentKind, CommandQueue, CompletionSignal,
        MemoryTracker, PointerInfo, StagingBuffer, WaitMode,
    };
    pub use crate::config::{RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::context::ContextFlags;
    pub use crate::copy::{CopyHint, CopyKind, CopyPlan};
    pub use crate::device::DeviceProperties;
    pub use crate::error::{FreshetError, Result};
    pub use crate::event::{EventFlags, EventState};
    pub use crate::runtime::Runtime;
    pub use crate::stream::{ScheduleMode, StreamFlags};
    pub use crate::types::{ContextId, DeviceIndex, EventId, StreamId};
}

// Re-exports for convenience
pub use config::RuntimeConfig;
pub use copy::{CopyHint, CopyKind, CopyPlan};
pub use error::{FreshetError, Result};
pub use runtime::Runtime;
pub use types::{ContextId, EventId, StreamId};
