// Single routing point for synchronization primitives.
//
// The heap's lock-free leaves (occupancy bitmaps, refcounts, gauges) are
// model-checked with loom, and loom can only explore interleavings of
// operations it instruments. Any file that imported `std::sync::atomic`
// directly would run real atomics inside a model run and silently hide
// schedules from the checker — so everything goes through here, and normal
// builds simply see the std types.
#![allow(unused_imports, unused_macros)]

// Locks ---------------------------------------------------------------------

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

// Atomics -------------------------------------------------------------------
//
// Only the widths the heap actually uses are re-exported; adding one back is
// a one-line change here rather than a stray std import somewhere else.

pub(crate) mod atomic {
    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering,
    };

    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering,
    };
}

// Statics -------------------------------------------------------------------

/// Declare a `static` holding a sync type.
///
/// std's atomics, `Mutex`, and `RwLock` are const-constructible, so a plain
/// static works. loom's are not — and a loom model wants the value rebuilt
/// for every run anyway, which its `lazy_static!` provides. One macro covers
/// both cases for any of the shim's types.
#[allow(unused_macro_rules)]
macro_rules! static_init {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_init;

// OnceLock ------------------------------------------------------------------
//
// One-shot process state: the cached page size and the suspend-signal
// handler installation. loom ships no OnceLock, and these live in statics
// that need const construction, which rules out wrapping a loom Mutex.
// A std Mutex around an Option is enough under the model: the only write is
// the initialisation itself, so there is no schedule worth exploring.

#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<T>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        let mut guard = self.slot.lock().unwrap();
        let value: *const T = guard.get_or_insert_with(init);
        // Safety: the slot is written once and never emptied, and the value
        // cannot move while &self is live.
        unsafe { &*value }
    }
}

#[cfg(loom)]
// Safety: every access goes through the inner Mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

// Threads -------------------------------------------------------------------

pub(crate) mod thread {
    #[cfg(not(loom))]
    pub(crate) use std::thread::spawn;

    #[cfg(loom)]
    pub(crate) use loom::thread::spawn;
}

// Barrier -------------------------------------------------------------------
//
// Threaded tests line their workers up on a barrier before the churn
// starts. loom has no Barrier; the shim spins on a loom-tracked counter,
// with yield_now marking the interleaving points.

pub(crate) mod barrier {
    #[cfg(not(loom))]
    pub(crate) use std::sync::Barrier;

    #[cfg(loom)]
    #[allow(dead_code)]
    pub(crate) struct Barrier {
        expected: usize,
        checked_in: super::atomic::AtomicUsize,
    }

    #[cfg(loom)]
    #[allow(dead_code)]
    impl Barrier {
        pub(crate) fn new(expected: usize) -> Self {
            Self {
                expected,
                checked_in: super::atomic::AtomicUsize::new(0),
            }
        }

        pub(crate) fn wait(&self) {
            use super::atomic::Ordering;
            self.checked_in.fetch_add(1, Ordering::AcqRel);
            while self.checked_in.load(Ordering::Acquire) < self.expected {
                loom::thread::yield_now();
            }
        }
    }
}
