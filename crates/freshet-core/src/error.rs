//! Error types for the Freshet runtime core.

use crate::types::{ContextId, EventId, StreamId};

/// Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, FreshetError>;

/// Errors surfaced by the runtime core.
///
/// Identity and state errors are detected at the API boundary and never leave
/// an object partially mutated. Provenance ambiguity is not an error on the
/// copy path; it degrades the copy to the conservative unpinned host path
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FreshetError {
    /// Device index outside the visible range.
    #[error("invalid device index {index} ({count} devices visible)")]
    InvalidDevice {
        /// The requested index.
        index: usize,
        /// Number of devices in the registry.
        count: usize,
    },

    /// Context handle does not name a live context.
    #[error("invalid or destroyed context: {0}")]
    InvalidContext(ContextId),

    /// Stream handle does not name a live stream.
    #[error("invalid or destroyed stream: {0}")]
    InvalidStream(StreamId),

    /// Event handle does not name a live event.
    #[error("invalid or destroyed event: {0}")]
    InvalidEvent(EventId),

    /// No current context is bound to the calling thread.
    #[error("no current context is set on this thread")]
    NoCurrentContext,

    /// Peer access was already enabled for this pair.
    #[error("peer access already enabled for {peer} on device {device}")]
    PeerAccessAlreadyEnabled {
        /// Device whose memory the peer would watch.
        device: usize,
        /// The peer context.
        peer: ContextId,
    },

    /// Peer access was not enabled for this pair.
    #[error("peer access not enabled for {peer} on device {device}")]
    PeerAccessNotEnabled {
        /// Device whose memory the peer was watching.
        device: usize,
        /// The peer context.
        peer: ContextId,
    },

    /// Event operation attempted in an incompatible state.
    #[error("event is {actual}, expected {expected}")]
    InvalidEventState {
        /// State required by the operation.
        expected: &'static str,
        /// State the event was actually in.
        actual: &'static str,
    },

    /// The event is still recording on another stream.
    #[error("event recording has not completed")]
    NotReady,

    /// An address was not obtained from this runtime's allocators.
    #[error("pointer {addr:#x} has no provenance record")]
    UnresolvedProvenance {
        /// The offending address.
        addr: usize,
    },

    /// Queue or signal allocation exhausted.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Failure reported by the accelerator abstraction.
    #[error("accelerator error: {0}")]
    Accelerator(String),
}
