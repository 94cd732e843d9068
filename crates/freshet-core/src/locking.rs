//! Lock abstraction for the two critical-section domains.
//!
//! Context and stream critical sections are guarded by [`DomainLock`], a
//! `lock_api` mutex over a raw lock that can be constructed in pass-through
//! mode. Pass-through mode removes the locking cost for single-threaded
//! diagnostic runs and is selected by [`crate::config::RuntimeConfig`], not by
//! a compile-time switch.
//!
//! Lock order between the two domains is fixed: a context lock may be held
//! while acquiring a stream lock, never the reverse.

use lock_api::GuardNoSend;

/// Raw mutex that optionally skips real locking.
///
/// With `thread_safe` set (the default) this is a plain `parking_lot` mutex.
/// Without it every acquisition succeeds immediately; callers opting into
/// pass-through mode assert that no two threads touch the guarded state
/// concurrently.
pub struct RawDomainLock {
    thread_safe: bool,
    inner: parking_lot::RawMutex,
}

// Safety: in thread-safe mode this defers to parking_lot's RawMutex. In
// pass-through mode mutual exclusion is the caller's single-threaded-use
// contract, as documented on the type.
unsafe impl lock_api::RawMutex for RawDomainLock {
    const INIT: RawDomainLock = RawDomainLock {
        thread_safe: true,
        inner: <parking_lot::RawMutex as lock_api::RawMutex>::INIT,
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        if self.thread_safe {
            lock_api::RawMutex::lock(&self.inner);
        }
    }

    fn try_lock(&self) -> bool {
        if self.thread_safe {
            lock_api::RawMutex::try_lock(&self.inner)
        } else {
            true
        }
    }

    unsafe fn unlock(&self) {
        if self.thread_safe {
            unsafe { lock_api::RawMutex::unlock(&self.inner) };
        }
    }
}

/// Mutex guarding one critical-section domain (context or stream).
pub type DomainLock<T> = lock_api::Mutex<RawDomainLock, T>;

/// Guard for a held [`DomainLock`].
pub type DomainGuard<'a, T> = lock_api::MutexGuard<'a, RawDomainLock, T>;

/// Create a domain lock, optionally in pass-through mode.
pub fn domain_lock<T>(value: T, thread_safe: bool) -> DomainLock<T> {
    DomainLock::from_raw(
        RawDomainLock {
            thread_safe,
            inner: <parking_lot::RawMutex as lock_api::RawMutex>::INIT,
        },
        value,
    )
}
