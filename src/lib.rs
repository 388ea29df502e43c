#[cfg(not(target_pointer_width = "64"))]
compile_error!("meshac supports only 64-bit targets.");

#[cfg(all(not(unix), not(any(loom, miri))))]
compile_error!("meshac requires a unix-like target (the arena is a file-backed mapping).");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// the global heap and its knobs
pub use heap::global::{CtlError, GlobalHeap, GlobalHeapConfig, HeapLockGuard};
pub use heap::miniheap::MiniHeapId;

// size classes
pub use heap::size_class::{class_of, max_of, ALIGNMENT, MAX_OBJECT_SIZE, NUM_SIZE_CLASSES};
pub use heap::span::MAX_MESHES;

// stats
pub use heap::stats::GlobalHeapStats;

// stop-the-world thread registry (front-end integration)
pub use heap::stw::{register_current_thread, unregister_current_thread};

// errors
pub use heap::vm::VmError;
