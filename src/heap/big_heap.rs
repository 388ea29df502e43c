use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;

/// Fallback allocator for objects larger than the top size class.
///
/// Allocations are whole OS-page reservations keyed by their base address.
/// Freed blocks are decommitted but their reservations are cached in a
/// `BTreeMap` for best-fit reuse, which keeps repeated large alloc/free
/// cycles off the mmap path. Alignment is the page size, comfortably above
/// the heap's 16-byte contract.
pub(crate) struct BigHeap {
    /// Decommitted reservations by size, best-fit reuse.
    cached: BTreeMap<usize, Vec<NonNull<u8>>>,
    cached_bytes: usize,
    cache_limit: usize,
    /// Live allocations: base address -> mapped size. Needed because
    /// best-fit reuse can hand out a larger block than requested.
    live: HashMap<usize, usize>,
    live_bytes: usize,
}

// Safety: BigHeap owns every mapping it tracks.
unsafe impl Send for BigHeap {}

impl BigHeap {
    pub fn new(cache_limit: usize) -> Self {
        Self {
            cached: BTreeMap::new(),
            cached_bytes: 0,
            cache_limit,
            live: HashMap::new(),
            live_bytes: 0,
        }
    }

    /// Total OS memory attributed to the big heap (live + cached
    /// reservations). Feeds `stats.active`/`stats.allocated`.
    pub fn arena_size(&self) -> usize {
        self.live_bytes + self.cached_bytes
    }

    /// Bytes in live allocations.
    #[allow(dead_code)]
    pub fn in_use(&self) -> usize {
        self.live_bytes
    }

    /// Size of the block behind `ptr`, 0 if the big heap does not own it.
    pub fn get_size(&self, ptr: *const u8) -> usize {
        self.live.get(&(ptr as usize)).copied().unwrap_or(0)
    }

    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size > 0);
        let size = size.next_multiple_of(<PlatformVmOps as VmOps>::page_size());

        // Best-fit: smallest cached reservation that fits.
        let found_size = self.cached.range_mut(size..).next().map(|(&s, _)| s);
        if let Some(s) = found_size {
            let Some(list) = self.cached.get_mut(&s) else {
                debug_assert!(false, "cached.range_mut returned key {s}, but get_mut failed");
                // Safety: the key was just observed in the map.
                unsafe { std::hint::unreachable_unchecked() }
            };
            if let Some(ptr) = list.pop() {
                self.cached_bytes -= s;
                if list.is_empty() {
                    self.cached.remove(&s);
                }
                // Freed blocks were decommitted; recommit before reuse.
                // Safety: FFI call to commit memory.
                if let Err(e) = unsafe { PlatformVmOps::commit(ptr, s) } {
                    // Recommit failed; release the reservation rather than
                    // leak it in an unusable state.
                    // Safety: FFI call to release memory.
                    unsafe {
                        drop(PlatformVmOps::release(ptr, s));
                        stats::TOTAL_RESERVED.sub(s);
                    }
                    return Err(e);
                }

                stats::TOTAL_COMMITTED.add(s);
                stats::BIG_HEAP_COMMITTED.add(s);
                self.live.insert(ptr.as_ptr() as usize, s);
                self.live_bytes += s;
                return Ok(ptr);
            }
        }

        // No cached reservation fits; map fresh pages.
        // Safety: FFI calls to reserve and commit memory.
        unsafe {
            let ptr = PlatformVmOps::reserve(size)?;
            if let Err(e) = PlatformVmOps::commit(ptr, size) {
                drop(PlatformVmOps::release(ptr, size));
                return Err(e);
            }

            stats::TOTAL_RESERVED.add(size);
            stats::TOTAL_COMMITTED.add(size);
            stats::BIG_HEAP_COMMITTED.add(size);
            self.live.insert(ptr.as_ptr() as usize, size);
            self.live_bytes += size;

            Ok(ptr)
        }
    }

    /// Free a block previously returned by [`alloc`](Self::alloc). Returns
    /// false for pointers the big heap does not own.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let Some(size) = self.live.remove(&addr) else {
            debug_assert!(false, "big heap free of unknown pointer {ptr:p}");
            return false;
        };
        self.live_bytes -= size;

        if self
            .cached_bytes
            .checked_add(size)
            .is_some_and(|next| next <= self.cache_limit)
        {
            // Decommit physical pages but keep the reservation for reuse.
            // Safety: FFI call to decommit memory.
            if unsafe { PlatformVmOps::decommit(ptr, size) }.is_ok() {
                stats::TOTAL_COMMITTED.sub(size);
                stats::BIG_HEAP_COMMITTED.sub(size);
                self.cached.entry(size).or_default().push(ptr);
                self.cached_bytes += size;
                return true;
            }
        }

        // Cache full (or decommit failed): return to the OS.
        // Safety: FFI call to release memory.
        if unsafe { PlatformVmOps::release(ptr, size) }.is_ok() {
            stats::TOTAL_COMMITTED.sub(size);
            stats::BIG_HEAP_COMMITTED.sub(size);
            stats::TOTAL_RESERVED.sub(size);
        }
        true
    }

    /// Release every cached reservation.
    pub fn trim(&mut self) {
        let sizes: Vec<usize> = self.cached.keys().copied().collect();
        for size in sizes {
            if let Some(mut list) = self.cached.remove(&size) {
                while let Some(ptr) = list.pop() {
                    // Safety: FFI call to release memory.
                    unsafe {
                        drop(PlatformVmOps::release(ptr, size));
                    }
                    stats::TOTAL_RESERVED.sub(size);
                    self.cached_bytes -= size;
                }
            }
        }
    }
}

impl Drop for BigHeap {
    fn drop(&mut self) {
        self.trim();
        for (addr, size) in self.live.drain() {
            // Safety: FFI call to release memory; addr came from reserve.
            unsafe {
                let ptr = NonNull::new_unchecked(addr as *mut u8);
                drop(PlatformVmOps::release(ptr, size));
            }
            stats::TOTAL_COMMITTED.sub(size);
            stats::BIG_HEAP_COMMITTED.sub(size);
            stats::TOTAL_RESERVED.sub(size);
        }
    }
}
