//! Stop-the-world: suspend every registered thread while a callback runs.
//!
//! Meshing rewrites virtual-to-physical mappings under live user data; a
//! concurrent reader could observe torn state. The front-end registers its
//! application threads here; `stop_the_world` signals each one with
//! `SIGUSR2`, whose handler parks in place (atomic flag + `nanosleep`,
//! both async-signal-safe) until the callback finishes.
//!
//! With an empty registry the callback simply runs inline: the caller
//! already holds the exclusive structural lock, which excludes every
//! allocator API path, and no foreign thread can be touching heap memory
//! it never allocated.
//!
//! The callback must not take locks a suspended thread might hold; the
//! meshing driver pre-reserves its bookkeeping capacity before stopping
//! the world to keep host-allocator traffic out of the window.

#[cfg(all(unix, not(any(loom, miri))))]
mod imp {
    use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use crate::sync::{Mutex, OnceLock};

    crate::sync::static_init! {
        static WORLD_STOPPED: AtomicBool = AtomicBool::new(false);
    }
    crate::sync::static_init! {
        static PARKED: AtomicUsize = AtomicUsize::new(0);
    }
    // pthread_t is an integer on Linux but a pointer on some unixes; store
    // the bits so the static stays Send.
    crate::sync::static_init! {
        static REGISTRY: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    }

    const SUSPEND_SIGNAL: libc::c_int = libc::SIGUSR2;

    extern "C" fn park_handler(_sig: libc::c_int) {
        PARKED.fetch_add(1, Ordering::SeqCst);
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 100_000, // 100us
        };
        while WORLD_STOPPED.load(Ordering::SeqCst) {
            // Safety: FFI; nanosleep is async-signal-safe.
            unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
        }
        PARKED.fetch_sub(1, Ordering::SeqCst);
    }

    fn install_handler() {
        static INSTALLED: OnceLock<()> = OnceLock::new();
        INSTALLED.get_or_init(|| {
            // Safety: FFI; installing a handler for a signal this crate owns.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = park_handler as usize;
                action.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(SUSPEND_SIGNAL, &action, std::ptr::null_mut());
            }
        });
    }

    /// Register the calling thread for suspension during meshing passes.
    /// The front-end calls this for every application thread it serves.
    pub fn register_current_thread() {
        install_handler();
        // Safety: FFI; pthread_self is always valid.
        let me = unsafe { libc::pthread_self() } as usize;
        let mut reg = REGISTRY.lock().unwrap();
        if !reg.contains(&me) {
            reg.push(me);
        }
    }

    /// Remove the calling thread from the suspension registry. Must be
    /// called before the thread exits.
    pub fn unregister_current_thread() {
        // Safety: FFI; pthread_self is always valid.
        let me = unsafe { libc::pthread_self() } as usize;
        let mut reg = REGISTRY.lock().unwrap();
        reg.retain(|&t| t != me);
    }

    fn wait_for_parked(target: usize, note: &str) {
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 50_000,
        };
        // ~2s ceiling; a thread that never parks (exited without
        // unregistering) should not wedge the allocator forever.
        for _ in 0..40_000 {
            if PARKED.load(Ordering::SeqCst) == target {
                return;
            }
            // Safety: FFI call to nanosleep.
            unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
        }
        eprintln!("[meshac] stop-the-world timed out waiting for threads to {note}");
    }

    /// Run `f` with every registered thread (other than the caller)
    /// suspended. Not interruptible; the world restarts only after `f`
    /// returns.
    pub fn stop_the_world<R>(f: impl FnOnce() -> R) -> R {
        install_handler();
        // Holding the registry lock for the whole window also serialises
        // concurrent stop-the-world attempts and blocks registration
        // changes mid-pass.
        let registry = REGISTRY.lock().unwrap();
        // Safety: FFI; pthread_self is always valid.
        let me = unsafe { libc::pthread_self() } as usize;
        let targets: Vec<usize> = registry.iter().copied().filter(|&t| t != me).collect();

        if targets.is_empty() {
            return f();
        }

        WORLD_STOPPED.store(true, Ordering::SeqCst);
        let mut expected = 0;
        for &t in &targets {
            // Safety: FFI; a registered pthread_t. A thread that exited
            // without unregistering makes pthread_kill fail; skip it.
            if unsafe { libc::pthread_kill(t as libc::pthread_t, SUSPEND_SIGNAL) } == 0 {
                expected += 1;
            }
        }
        wait_for_parked(expected, "park");

        let result = f();

        WORLD_STOPPED.store(false, Ordering::SeqCst);
        wait_for_parked(0, "resume");
        result
    }

    #[cfg(test)]
    pub(crate) fn registered_count() -> usize {
        REGISTRY.lock().unwrap().len()
    }
}

#[cfg(not(all(unix, not(any(loom, miri)))))]
mod imp {
    /// No thread suspension under miri/loom; the exclusive structural lock
    /// is the only exclusion these environments need.
    pub fn register_current_thread() {}

    pub fn unregister_current_thread() {}

    pub fn stop_the_world<R>(f: impl FnOnce() -> R) -> R {
        f()
    }
}

pub use imp::{register_current_thread, stop_the_world, unregister_current_thread};

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;
    use crate::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use crate::sync::barrier::Barrier;
    use crate::sync::Arc;

    #[test]
    fn test_empty_registry_runs_inline() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let mut ran = false;
        stop_the_world(|| ran = true);
        assert!(ran);
    }

    #[test]
    fn test_world_actually_stops() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let started = Arc::new(Barrier::new(2));

        let worker = {
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                register_current_thread();
                started.wait();
                while !done.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                unregister_current_thread();
            })
        };

        started.wait();
        assert_eq!(super::imp::registered_count(), 1);

        // Give the worker a moment to demonstrate it is running.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(counter.load(Ordering::Relaxed) > 0);

        stop_the_world(|| {
            let before = counter.load(Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            let after = counter.load(Ordering::SeqCst);
            assert_eq!(before, after, "worker advanced while world was stopped");
        });

        // The worker resumes afterwards.
        let resumed_from = counter.load(Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(counter.load(Ordering::Relaxed) > resumed_from);

        done.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        assert_eq!(super::imp::registered_count(), 0);
    }
}
