//! Events: cross-stream synchronization tokens with an explicit state
//! machine.
//!
//! An event is Created at construction, becomes Recording when submitted
//! into a stream's command order, and becomes Recorded once the runtime
//! observes the completion signal has fired. Re-recording is legal from both
//! Recording and Recorded; each recording carries a generation number so a
//! wait racing a re-record can never resolve the wrong timestamp.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::accel::CompletionSignal;
use crate::error::{FreshetError, Result};
use crate::types::{EventId, StreamId};

/// Event creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFlags {
    /// Timing enabled, default wait behavior.
    #[default]
    Default,
    /// Hint that host waits should block instead of spinning.
    BlockingSync,
    /// Skip timestamp capture; the event orders work but cannot be timed.
    DisableTiming,
}

impl EventFlags {
    /// True when the event records timestamps.
    pub fn timing_enabled(self) -> bool {
        !matches!(self, EventFlags::DisableTiming)
    }
}

/// Observable event state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Constructed, never recorded. Querying in this state is an error.
    Created,
    /// Submitted into a stream's command order, completion not yet observed.
    Recording,
    /// Completion observed; the timestamp is valid.
    Recorded,
}

impl EventState {
    fn name(self) -> &'static str {
        match self {
            EventState::Created => "created",
            EventState::Recording => "recording",
            EventState::Recorded => "recorded",
        }
    }
}

enum Phase {
    Created,
    Recording {
        /// Stream the recording was submitted on; `None` marks an any-stream
        /// recording through the default stream.
        stream: Option<StreamId>,
        signal: Arc<dyn CompletionSignal>,
    },
    Recorded {
        stream: Option<StreamId>,
        timestamp: Option<u64>,
    },
}

struct EventInner {
    phase: Phase,
    /// Bumped on every record; guards exactly-once timestamp resolution
    /// against concurrent re-records.
    generation: u64,
}

/// A synchronization token marking a point in a stream's command order.
pub struct Event {
    id: EventId,
    flags: EventFlags,
    created_at: u64,
    inner: Mutex<EventInner>,
}

impl Event {
    pub(crate) fn new(id: EventId, flags: EventFlags, created_at: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            flags,
            created_at,
            inner: Mutex::new(EventInner {
                phase: Phase::Created,
                generation: 0,
            }),
        })
    }

    /// Event identifier.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Creation flags.
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Timestamp at construction, on the accelerator clock.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Current observable state.
    pub fn state(&self) -> EventState {
        match self.inner.lock().phase {
            Phase::Created => EventState::Created,
            Phase::Recording { .. } => EventState::Recording,
            Phase::Recorded { .. } => EventState::Recorded,
        }
    }

    /// Stream of the last recording, if any (`None` inside the option chain
    /// means an any-stream recording).
    pub fn recorded_stream(&self) -> Option<Option<StreamId>> {
        match &self.inner.lock().phase {
            Phase::Created => None,
            Phase::Recording { stream, .. } | Phase::Recorded { stream, .. } => Some(*stream),
        }
    }

    /// Begin a new recording on `stream`, submitting the marker through
    /// `submit` while the event lock is held.
    ///
    /// Fails with NotReady while a recording on a different stream has not
    /// completed. Re-recording on the same stream, or after completion, is
    /// legal and invalidates the prior timestamp.
    pub(crate) fn record_with<F>(&self, stream: Option<StreamId>, submit: F) -> Result<()>
    where
        F: FnOnce() -> Result<Arc<dyn CompletionSignal>>,
    {
        let mut inner = self.inner.lock();
        if let Phase::Recording {
            stream: prior,
            signal,
        } = &inner.phase
        {
            if *prior != stream && !signal.is_complete() {
                return Err(FreshetError::NotReady);
            }
        }

        let signal = submit()?;
        inner.phase = Phase::Recording { stream, signal };
        inner.generation += 1;
        trace!(target: "freshet::sync", event = %self.id, generation = inner.generation, "event recording");
        Ok(())
    }

    /// Non-blocking completion poll.
    ///
    /// `Ok(true)` once the recording has completed (performing the
    /// Recording to Recorded transition when it is first observed),
    /// `Ok(false)` while still in flight. Querying a never-recorded event is
    /// an error.
    pub fn query(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        match &inner.phase {
            Phase::Created => Err(FreshetError::InvalidEventState {
                expected: "recording or recorded",
                actual: EventState::Created.name(),
            }),
            Phase::Recorded { .. } => Ok(true),
            Phase::Recording { stream, signal } => {
                if !signal.is_complete() {
                    return Ok(false);
                }
                let stream = *stream;
                let timestamp = self.resolve_timestamp(signal.as_ref());
                inner.phase = Phase::Recorded { stream, timestamp };
                trace!(target: "freshet::sync", event = %self.id, "event recorded");
                Ok(true)
            }
        }
    }

    /// Block until the current recording completes, then transition to
    /// Recorded exactly once.
    ///
    /// Waiting on a never-recorded event is an error; waiting on a Recorded
    /// event returns immediately.
    pub fn synchronize(&self) -> Result<()> {
        let (signal, generation) = {
            let inner = self.inner.lock();
            match &inner.phase {
                Phase::Created => {
                    return Err(FreshetError::InvalidEventState {
                        expected: "recording or recorded",
                        actual: EventState::Created.name(),
                    })
                }
                Phase::Recorded { .. } => return Ok(()),
                Phase::Recording { signal, .. } => (Arc::clone(signal), inner.generation),
            }
        };

        // Block outside the event lock; a concurrent re-record bumps the
        // generation and this wait then resolves nothing.
        signal.wait();

        let mut inner = self.inner.lock();
        if inner.generation == generation {
            if let Phase::Recording { stream, signal } = &inner.phase {
                let stream = *stream;
                let timestamp = self.resolve_timestamp(signal.as_ref());
                inner.phase = Phase::Recorded { stream, timestamp };
                trace!(target: "freshet::sync", event = %self.id, "event recorded");
            }
        }
        Ok(())
    }

    /// Signal of the in-flight recording: `Ok(None)` when already complete,
    /// an error when never recorded.
    pub(crate) fn recording_signal(&self) -> Result<Option<Arc<dyn CompletionSignal>>> {
        let inner = self.inner.lock();
        match &inner.phase {
            Phase::Created => Err(FreshetError::InvalidEventState {
                expected: "recording or recorded",
                actual: EventState::Created.name(),
            }),
            Phase::Recorded { .. } => Ok(None),
            Phase::Recording { signal, .. } => Ok(Some(Arc::clone(signal))),
        }
    }

    /// Resolved timestamp of a Recorded event.
    pub fn recorded_timestamp(&self) -> Result<u64> {
        let inner = self.inner.lock();
        match &inner.phase {
            Phase::Recorded {
                timestamp: Some(ts),
                ..
            } => Ok(*ts),
            Phase::Recorded {
                timestamp: None, ..
            } => Err(FreshetError::InvalidEventState {
                expected: "recorded with timing enabled",
                actual: "recorded without timestamp",
            }),
            phase => Err(FreshetError::InvalidEventState {
                expected: EventState::Recorded.name(),
                actual: match phase {
                    Phase::Created => EventState::Created.name(),
                    _ => EventState::Recording.name(),
                },
            }),
        }
    }

    /// Check that explicit destruction is legal: not while Recording.
    /// A recording whose signal has already fired is settled first.
    pub(crate) fn ensure_destroyable(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Phase::Recording { stream, signal } = &inner.phase {
            if !signal.is_complete() {
                return Err(FreshetError::InvalidEventState {
                    expected: "not recording",
                    actual: EventState::Recording.name(),
                });
            }
            let stream = *stream;
            let timestamp = self.resolve_timestamp(signal.as_ref());
            inner.phase = Phase::Recorded { stream, timestamp };
        }
        Ok(())
    }

    fn resolve_timestamp(&self, signal: &dyn CompletionSignal) -> Option<u64> {
        if self.flags.timing_enabled() {
            signal.timestamp()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualSignal;

    fn event() -> Arc<Event> {
        Event::new(EventId(1), EventFlags::Default, 100)
    }

    #[test]
    fn test_query_on_created_is_an_error() {
        let e = event();
        assert!(matches!(
            e.query(),
            Err(FreshetError::InvalidEventState { .. })
        ));
        assert!(matches!(
            e.synchronize(),
            Err(FreshetError::InvalidEventState { .. })
        ));
    }

    #[test]
    fn test_record_query_complete() {
        let e = event();
        let signal = ManualSignal::new();
        let submit = {
            let signal = Arc::clone(&signal);
            move || Ok(signal as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();
        assert_eq!(e.state(), EventState::Recording);

        // Not complete yet: poll reports false without blocking.
        assert!(!e.query().unwrap());

        signal.complete(500);
        assert!(e.query().unwrap());
        assert_eq!(e.state(), EventState::Recorded);
        assert_eq!(e.recorded_timestamp().unwrap(), 500);
    }

    #[test]
    fn test_synchronize_transitions_once() {
        let e = event();
        let signal = ManualSignal::new();
        signal.complete(750);
        let submit = {
            let signal = Arc::clone(&signal);
            move || Ok(signal as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();

        e.synchronize().unwrap();
        assert_eq!(e.state(), EventState::Recorded);
        assert_eq!(e.recorded_timestamp().unwrap(), 750);

        // Idempotent once recorded.
        e.synchronize().unwrap();
        assert_eq!(e.recorded_timestamp().unwrap(), 750);
    }

    #[test]
    fn test_cross_stream_re_record_not_ready() {
        let e = event();
        let busy = ManualSignal::new();
        let submit = {
            let busy = Arc::clone(&busy);
            move || Ok(busy as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();

        // Different stream while the first recording is in flight.
        let other = ManualSignal::new();
        let submit = {
            let other = Arc::clone(&other);
            move || Ok(other as Arc<dyn CompletionSignal>)
        };
        assert_eq!(
            e.record_with(Some(StreamId(2)), submit).unwrap_err(),
            FreshetError::NotReady
        );

        // Same stream is fine.
        let again = ManualSignal::new();
        let submit = {
            let again = Arc::clone(&again);
            move || Ok(again as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();
    }

    #[test]
    fn test_re_record_invalidates_timestamp() {
        let e = event();
        let first = ManualSignal::new();
        first.complete(100);
        let submit = {
            let first = Arc::clone(&first);
            move || Ok(first as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();
        assert!(e.query().unwrap());
        assert_eq!(e.recorded_timestamp().unwrap(), 100);

        let second = ManualSignal::new();
        let submit = {
            let second = Arc::clone(&second);
            move || Ok(second as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();
        assert_eq!(e.state(), EventState::Recording);
        assert!(e.recorded_timestamp().is_err());

        second.complete(900);
        assert!(e.query().unwrap());
        assert_eq!(e.recorded_timestamp().unwrap(), 900);
    }

    #[test]
    fn test_destroy_rules() {
        let e = event();
        e.ensure_destroyable().unwrap();

        let busy = ManualSignal::new();
        let submit = {
            let busy = Arc::clone(&busy);
            move || Ok(Arc::clone(&busy) as Arc<dyn CompletionSignal>)
        };
        e.record_with(Some(StreamId(1)), submit).unwrap();
        assert!(e.ensure_destroyable().is_err());

        busy.complete(10);
        e.ensure_destroyable().unwrap();
        assert_eq!(e.state(), EventState::Recorded);
    }

    #[test]
    fn test_timing_disabled_has_no_timestamp() {
        let e = Event::new(EventId(2), EventFlags::DisableTiming, 0);
        let signal = ManualSignal::new();
        signal.complete(123);
        let submit = {
            let signal = Arc::clone(&signal);
            move || Ok(signal as Arc<dyn CompletionSignal>)
        };
        e.record_with(None, submit).unwrap();
        assert!(e.query().unwrap());
        assert!(matches!(
            e.recorded_timestamp(),
            Err(FreshetError::InvalidEventState { .. })
        ));
    }
}
