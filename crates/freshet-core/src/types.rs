//! Identifier newtypes for runtime-owned objects.
//!
//! Contexts, streams and events are referenced by opaque stable identifiers
//! resolved through owning tables, so a stale handle fails resolution instead
//! of dangling. Identifiers are allocated from monotonic per-runtime counters;
//! a stream id doubles as its creation sequence number.

use std::fmt;

/// Index of a visible device in the registry.
pub type DeviceIndex = usize;

/// Identifier of a [`crate::context::Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

/// Identifier of a [`crate::stream::Stream`]. Monotonic in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

/// Identifier of an [`crate::event::Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) u64);

impl ContextId {
    /// Raw numeric value, for logging and diagnostics.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl StreamId {
    /// Raw numeric value, for logging and diagnostics.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl EventId {
    /// Raw numeric value, for logging and diagnostics.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event:{}", self.0)
    }
}
