//! # Freshet Host Backend
//!
//! Software implementation of the Freshet accelerator abstraction: per-queue
//! worker threads executing commands in submission order, condvar-backed
//! completion signals, and a pointer-provenance registry over host-allocated
//! buffers. Used for testing and as a fallback when no hardware backend is
//! present.
//!
//! ## Example
//!
//! ```ignore
//! use freshet_core::prelude::*;
//! use freshet_host::HostPlatform;
//!
//! let platform = HostPlatform::new(2);
//! let runtime = Runtime::new(RuntimeConfig::default(), platform)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod memory;
mod platform;
mod queue;

pub use memory::{HostBuffer, HostMemoryTracker};
pub use platform::{HostAgent, HostPlatform};
pub use queue::{HostQueue, HostSignal};
