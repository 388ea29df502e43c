use super::span::Span;
use super::stats;
use super::vm::{Backing, PlatformVmOps, VmError, VmOps};
use crate::heap::miniheap::MiniHeapId;
use fixedbitset::FixedBitSet;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Page owner sentinel: no miniheap.
const NO_OWNER: u32 = u32::MAX;

/// The meshable arena: one contiguous reservation mapped `MAP_SHARED` from
/// an anonymous backing file, carved into page-aligned spans.
///
/// Because every span starts life identity-mapped (virtual page `i` maps
/// file extent `i`), meshing two spans is a single `MAP_FIXED` remap of the
/// source span onto the destination's extent, followed by punching the
/// source extent out of the file. Virtual addresses never move; only the
/// extent behind them does.
pub(crate) struct MeshableArena {
    backing: Backing,
    base: NonNull<u8>,
    arena_bytes: usize,
    page_size: usize,
    /// Bump frontier: first never-allocated page.
    frontier: u32,
    /// Bytes behind live spans, for gauge upkeep.
    committed_bytes: usize,
    /// Freed spans by page count, exact-fit reuse.
    free_spans: HashMap<u32, Vec<u32>>,
    /// Per-page owning miniheap, NO_OWNER when unowned.
    owners: Vec<u32>,
    /// Pages where a live span begins.
    span_starts: FixedBitSet,
}

// Safety: the arena owns its mapping; `base` is not aliased elsewhere, and
// all mutation goes through &mut (the structural lock). Shared references
// only read.
unsafe impl Send for MeshableArena {}
unsafe impl Sync for MeshableArena {}

impl Drop for MeshableArena {
    fn drop(&mut self) {
        // Safety: base/arena_bytes came from map_backing.
        unsafe { PlatformVmOps::unmap_backing(self.base, self.arena_bytes) };
        stats::TOTAL_RESERVED.sub(self.arena_bytes);
        stats::TOTAL_COMMITTED.sub(self.committed_bytes);
        stats::ARENA_COMMITTED.sub(self.committed_bytes);
        // Backing drop closes the fd, releasing every extent.
    }
}

impl MeshableArena {
    pub fn new(arena_bytes: usize) -> Result<Self, VmError> {
        let page_size = <PlatformVmOps as VmOps>::page_size();
        let arena_bytes = arena_bytes.next_multiple_of(page_size);
        if arena_bytes == 0 {
            return Err(VmError::InitializationFailed(
                "arena size must be non-zero".to_string(),
            ));
        }
        let pages = arena_bytes / page_size;
        if pages > NO_OWNER as usize {
            return Err(VmError::InitializationFailed(format!(
                "arena of {pages} pages exceeds the u32 page index space"
            )));
        }

        let backing = PlatformVmOps::create_backing(arena_bytes)?;
        // Safety: backing file is arena_bytes long.
        let base = unsafe { PlatformVmOps::map_backing(&backing, arena_bytes)? };

        stats::TOTAL_RESERVED.add(arena_bytes);

        Ok(Self {
            backing,
            base,
            arena_bytes,
            page_size,
            frontier: 0,
            committed_bytes: 0,
            free_spans: HashMap::new(),
            owners: vec![NO_OWNER; pages],
            span_starts: FixedBitSet::with_capacity(pages),
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Allocate a span of `pages` pages. Exact-fit reuse of freed spans,
    /// else bump allocation from the frontier.
    pub fn alloc_span(&mut self, pages: usize) -> Result<Span, VmError> {
        debug_assert!(pages > 0);
        let length = pages as u32;

        let reused = match self.free_spans.get_mut(&length) {
            Some(list) => {
                let off = list.pop();
                let now_empty = list.is_empty();
                if now_empty {
                    self.free_spans.remove(&length);
                }
                off
            }
            None => None,
        };
        let offset = match reused {
            Some(off) => off,
            None => self.bump(length)?,
        };

        self.span_starts.insert(offset as usize);
        let bytes = pages * self.page_size;
        self.committed_bytes += bytes;
        stats::TOTAL_COMMITTED.add(bytes);
        stats::ARENA_COMMITTED.add(bytes);

        Ok(Span { offset, length })
    }

    fn bump(&mut self, length: u32) -> Result<u32, VmError> {
        let pages = (self.arena_bytes / self.page_size) as u32;
        if self.frontier + length > pages {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "arena exhausted",
            )));
        }
        let off = self.frontier;
        self.frontier += length;
        Ok(off)
    }

    /// Pointer to the first byte of a span's virtual range.
    #[inline]
    pub fn span_ptr(&self, span: Span) -> NonNull<u8> {
        debug_assert!((span.offset + span.length) as usize * self.page_size <= self.arena_bytes);
        // Safety: span lies within the arena mapping.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(span.byte_offset(self.page_size))) }
    }

    /// Record `owner` as the miniheap behind every page of `span`.
    pub fn assoc(&mut self, span: Span, owner: MiniHeapId) {
        for p in span.offset..span.offset + span.length {
            self.owners[p as usize] = owner.0;
        }
    }

    /// Owning miniheap for an arbitrary pointer, or `None` for pointers
    /// outside the arena (the big-heap path) and unowned pages.
    pub fn lookup(&self, ptr: *const u8) -> Option<MiniHeapId> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base || addr >= base + self.arena_bytes {
            return None;
        }
        let page = (addr - base) / self.page_size;
        match self.owners[page] {
            NO_OWNER => None,
            id => Some(MiniHeapId(id)),
        }
    }

    /// Return a span to the arena: restore its identity mapping, punch its
    /// extent out of the backing file, clear ownership, and recycle the
    /// offset for exact-fit reuse.
    pub fn free_span(&mut self, span: Span) {
        let ptr = self.span_ptr(span);
        let bytes = span.byte_len(self.page_size);
        let extent = span.byte_offset(self.page_size);

        // A meshed span currently maps some other heap's extent; point it
        // back at its own before reuse. Harmless for identity-mapped spans.
        // Safety: span lies within the arena mapping.
        if let Err(e) = unsafe { PlatformVmOps::remap_backing(&self.backing, ptr, bytes, extent) } {
            eprintln!("[meshac] failed to restore span mapping at {ptr:p}: {e}");
        }
        if let Err(e) = PlatformVmOps::punch_hole(&self.backing, extent, bytes) {
            eprintln!("[meshac] failed to punch span extent {extent:#x}: {e}");
        }

        for p in span.offset..span.offset + span.length {
            self.owners[p as usize] = NO_OWNER;
        }
        self.span_starts.set(span.offset as usize, false);
        self.committed_bytes = self.committed_bytes.saturating_sub(bytes);
        stats::TOTAL_COMMITTED.sub(bytes);
        stats::ARENA_COMMITTED.sub(bytes);

        self.free_spans.entry(span.length).or_default().push(span.offset);
    }

    /// Mesh `src` onto `dst`: remap `src`'s virtual range to alias `dst`'s
    /// extent, then punch `src`'s extent. Both spans keep their virtual
    /// addresses; afterwards they share physical pages.
    ///
    /// The caller is responsible for having copied `src`'s live objects into
    /// `dst`'s extent first, and for re-pointing `src`'s page owners.
    pub fn mesh(&mut self, dst: Span, src: Span) -> Result<(), VmError> {
        debug_assert_eq!(dst.length, src.length, "meshed spans must be equal length");
        debug_assert_ne!(dst.offset, src.offset);

        let src_ptr = self.span_ptr(src);
        let bytes = src.byte_len(self.page_size);
        // Safety: src lies within the arena mapping.
        unsafe {
            PlatformVmOps::remap_backing(
                &self.backing,
                src_ptr,
                bytes,
                dst.byte_offset(self.page_size),
            )?;
        }
        // The source extent no longer backs anything; release its pages.
        if let Err(e) = PlatformVmOps::punch_hole(&self.backing, src.byte_offset(self.page_size), bytes)
        {
            eprintln!(
                "[meshac] failed to punch meshed extent {:#x}: {e}",
                src.byte_offset(self.page_size)
            );
        }
        Ok(())
    }

    /// Number of live spans.
    pub fn in_use_count(&self) -> usize {
        self.span_starts.count_ones(..)
    }
}
