use super::bitmap::AtomicBitmap;
use super::rng::Mt64;
use super::span::{Span, MAX_MESHES};
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::Mutex;
use std::ptr::NonNull;

/// Non-owning handle to a miniheap, resolved through the global heap's
/// `MiniHeapTable`. Trackers and the arena's page-owner map store these
/// instead of references, which keeps the GlobalHeap/tracker/miniheap
/// ownership triangle acyclic.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct MiniHeapId(pub(crate) u32);

/// Debug fill for the bitmap words of a destroyed miniheap.
#[cfg(debug_assertions)]
const POISON_PATTERN: u64 = 0x4242_4242_4242_4242;

/// A fixed-size-class allocator over one or more equal-length spans.
///
/// A freshly created miniheap serves one span. Meshing folds further spans
/// onto it; all of them alias the primary span's physical pages, so slot
/// `i` names the same object bytes regardless of which span a pointer came
/// through.
pub(crate) struct MiniHeap {
    arena_base: NonNull<u8>,
    page_size: usize,
    size_class: usize,
    object_size: usize,
    object_count: usize,
    span_size: usize,
    /// `spans[0]` is the primary span; its extent holds the data.
    spans: Vec<Span>,
    bitmap: AtomicBitmap,
    ref_count: AtomicUsize,
    attached: AtomicBool,
    /// Shuffled free slot indices, populated on attach. Only the attached
    /// front-end pops from it, so the lock is uncontended.
    free_list: Mutex<Vec<u16>>,
}

// Safety: interior mutability is atomic or Mutex-guarded; raw pointers are
// only derived from the owning arena's mapping.
unsafe impl Send for MiniHeap {}
unsafe impl Sync for MiniHeap {}

impl MiniHeap {
    pub fn new(
        arena_base: NonNull<u8>,
        page_size: usize,
        span: Span,
        size_class: usize,
        object_size: usize,
        object_count: usize,
    ) -> Self {
        debug_assert!(object_count <= u16::MAX as usize);
        debug_assert!(object_size * object_count <= span.byte_len(page_size));
        Self {
            arena_base,
            page_size,
            size_class,
            object_size,
            object_count,
            span_size: span.byte_len(page_size),
            spans: vec![span],
            bitmap: AtomicBitmap::new(object_count),
            ref_count: AtomicUsize::new(0),
            attached: AtomicBool::new(false),
            free_list: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    #[inline]
    #[allow(dead_code)]
    pub fn span_size(&self) -> usize {
        self.span_size
    }

    #[inline]
    pub fn mesh_count(&self) -> usize {
        self.spans.len()
    }

    #[inline]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    #[inline]
    pub fn primary_span(&self) -> Span {
        self.spans[0]
    }

    /// Drain every span out of this heap (destruction after a mesh: the
    /// spans were transferred to the destination).
    pub fn take_spans(&mut self) -> Vec<Span> {
        std::mem::take(&mut self.spans)
    }

    /// Grow the span list capacity ahead of a merge, keeping host-allocator
    /// traffic out of the stopped-world window.
    pub fn reserve_spans(&mut self, extra: usize) {
        self.spans.reserve(extra);
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.bitmap.in_use()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ref_(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn unref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unref without matching ref");
    }

    #[cfg(test)]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// A heap can be meshed when nothing holds its fast path and its
    /// occupancy is below `threshold` (a fraction of the slot count).
    pub fn is_meshing_candidate(&self, threshold: f64) -> bool {
        if self.is_attached() {
            return false;
        }
        let in_use = self.in_use();
        in_use > 0 && (in_use as f64) < threshold * self.object_count as f64
    }

    pub fn bitmap(&self) -> &AtomicBitmap {
        &self.bitmap
    }

    /// Attach to a front-end: set the attach bit and rebuild the shuffled
    /// freelist from the currently clear slots.
    pub fn reattach(&self, prng: &mut Mt64) {
        let mut slots: Vec<u16> = (0..self.object_count as u16)
            .filter(|&i| !self.bitmap.get(i as usize))
            .collect();
        prng.shuffle(&mut slots);
        let mut list = self.free_list.lock().unwrap();
        *list = slots;
        self.attached.store(true, Ordering::Release);
    }

    /// Detach from the front-end; drops the freelist so stale entries can
    /// never hand out slots freed by other threads in the interim.
    pub fn detach(&self) {
        self.free_list.lock().unwrap().clear();
        self.attached.store(false, Ordering::Release);
    }

    /// Pop the freelist and claim the slot. `None` when exhausted.
    pub fn alloc_slot(&self) -> Option<NonNull<u8>> {
        loop {
            let idx = self.free_list.lock().unwrap().pop()?;
            // A slot freed and re-listed by a stale path would double-claim;
            // the bitmap is authoritative.
            if self.bitmap.try_set(idx as usize) {
                return Some(self.slot_ptr(idx as usize));
            }
        }
    }

    /// Claim a specific slot. Used by tests and by front-ends that manage
    /// their own freelists.
    pub fn malloc_at(&self, idx: usize) -> Option<NonNull<u8>> {
        if idx >= self.object_count || !self.bitmap.try_set(idx) {
            return None;
        }
        Some(self.slot_ptr(idx))
    }

    /// Release the slot behind `ptr`. Returns false (and debug-asserts) on
    /// a pointer this heap does not own or a slot already clear.
    pub fn free_ptr(&self, ptr: *const u8) -> bool {
        let Some(idx) = self.slot_of(ptr) else {
            debug_assert!(false, "free of pointer {ptr:p} not owned by this miniheap");
            return false;
        };
        let cleared = self.bitmap.try_clear(idx);
        debug_assert!(cleared, "double free of slot {idx} at {ptr:p}");
        cleared
    }

    /// Slot index for a pointer into any of this heap's spans.
    pub fn slot_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let base = self.arena_base.as_ptr() as usize;
        for span in &self.spans {
            let start = base + span.byte_offset(self.page_size);
            if (start..start + self.span_size).contains(&addr) {
                let idx = (addr - start) / self.object_size;
                // The span tail may be unused when objects don't divide the
                // span evenly.
                if idx < self.object_count {
                    return Some(idx);
                }
                return None;
            }
        }
        None
    }

    /// Address of slot `idx` in the primary span.
    #[inline]
    pub fn slot_ptr(&self, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < self.object_count);
        let off = self.primary_span().byte_offset(self.page_size) + idx * self.object_size;
        // Safety: slot lies within the arena mapping.
        unsafe { NonNull::new_unchecked(self.arena_base.as_ptr().add(off)) }
    }

    /// Merge `src` into this heap: copy src's live objects into the
    /// corresponding (free, by disjointness) slots of the primary extent,
    /// set their bits, and take over src's spans. The arena remap that
    /// makes the spans alias physically is the caller's next step.
    pub fn consume(&mut self, src: &mut MiniHeap) {
        debug_assert_eq!(self.object_size, src.object_size);
        debug_assert_eq!(self.object_count, src.object_count);
        debug_assert!(self.bitmap.is_disjoint(&src.bitmap));
        debug_assert!(self.mesh_count() + src.mesh_count() <= MAX_MESHES);
        debug_assert!(!self.is_attached() && !src.is_attached());

        let object_size = self.object_size;
        src.bitmap.for_each_set(|idx| {
            let from = src.slot_ptr(idx);
            let to = self.slot_ptr(idx);
            // Safety: distinct extents, object_size bytes valid on both
            // sides, no concurrent access (world is stopped).
            unsafe {
                std::ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), object_size);
            }
            let newly_set = self.bitmap.try_set(idx);
            debug_assert!(newly_set);
        });
        src.bitmap.clear_all();

        self.spans.append(&mut src.spans);
    }

    #[cfg(debug_assertions)]
    pub(crate) fn poison(&self) {
        self.bitmap.poison(POISON_PATTERN);
    }
}

/// Owning store for miniheap objects. This is the "internal allocator" of
/// the design: miniheap metadata lives in the host allocator via `Box`,
/// never in the user heap being built, so metadata allocation cannot
/// recurse. Ids are dense indices with free-slot reuse; a stale id resolves
/// to `None`.
pub(crate) struct MiniHeapTable {
    slots: Vec<Option<Box<MiniHeap>>>,
    free_ids: Vec<u32>,
}

impl MiniHeapTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: Vec::new(),
        }
    }

    pub fn insert(&mut self, mh: MiniHeap) -> MiniHeapId {
        match self.free_ids.pop() {
            Some(id) => {
                debug_assert!(self.slots[id as usize].is_none());
                self.slots[id as usize] = Some(Box::new(mh));
                MiniHeapId(id)
            }
            None => {
                let id = self.slots.len() as u32;
                self.slots.push(Some(Box::new(mh)));
                MiniHeapId(id)
            }
        }
    }

    pub fn get(&self, id: MiniHeapId) -> Option<&MiniHeap> {
        self.slots.get(id.0 as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, id: MiniHeapId) -> Option<&mut MiniHeap> {
        self.slots.get_mut(id.0 as usize)?.as_deref_mut()
    }

    /// Two distinct heaps mutably at once (the mesh pair).
    pub fn pair_mut(&mut self, a: MiniHeapId, b: MiniHeapId) -> (&mut MiniHeap, &mut MiniHeap) {
        assert_ne!(a.0, b.0, "pair_mut needs distinct ids");
        let (lo, hi) = (a.0.min(b.0) as usize, a.0.max(b.0) as usize);
        let (left, right) = self.slots.split_at_mut(hi);
        let lo_mh = left[lo].as_deref_mut().expect("stale miniheap id");
        let hi_mh = right[0].as_deref_mut().expect("stale miniheap id");
        if a.0 < b.0 {
            (lo_mh, hi_mh)
        } else {
            (hi_mh, lo_mh)
        }
    }

    /// Ensure `extra` upcoming removals can recycle their ids without
    /// growing the free list (keeps the stopped-world window free of host
    /// allocation).
    pub fn reserve_removals(&mut self, extra: usize) {
        self.free_ids.reserve(extra);
    }

    /// Destroy the miniheap object behind `id`, vacating the slot.
    pub fn remove(&mut self, id: MiniHeapId) -> Option<Box<MiniHeap>> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let mh = slot.take()?;
        #[cfg(debug_assertions)]
        mh.poison();
        self.free_ids.push(id.0);
        Some(mh)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::arena::MeshableArena;
    use crate::heap::rng;

    fn page_size() -> usize {
        crate::heap::vm::page_size_cached()
    }

    fn mini(arena: &mut MeshableArena, object_size: usize) -> MiniHeap {
        let ps = arena.page_size();
        let count = ps / object_size;
        let span = arena.alloc_span(1).unwrap();
        MiniHeap::new(arena.base(), ps, span, 0, object_size, count)
    }

    #[test]
    fn test_slot_math_roundtrip() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut a = MeshableArena::new(page_size() * 8).unwrap();
        let mh = mini(&mut a, 64);

        let p = mh.malloc_at(3).unwrap();
        assert_eq!(mh.slot_of(p.as_ptr()), Some(3));
        // Interior pointer maps to the same slot.
        // Safety: Test code; in-bounds.
        let interior = unsafe { p.as_ptr().add(17) };
        assert_eq!(mh.slot_of(interior), Some(3));
        assert!(mh.free_ptr(p.as_ptr()));
        assert!(mh.is_empty());
    }

    #[test]
    fn test_double_claim_refused() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut a = MeshableArena::new(page_size() * 8).unwrap();
        let mh = mini(&mut a, 128);
        assert!(mh.malloc_at(0).is_some());
        assert!(mh.malloc_at(0).is_none());
    }

    #[test]
    fn test_reattach_populates_freelist() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut a = MeshableArena::new(page_size() * 8).unwrap();
        let mh = mini(&mut a, 256);
        let count = mh.object_count();

        mh.malloc_at(1).unwrap();
        let mut prng = rng::Mt64::new(7);
        mh.reattach(&mut prng);
        assert!(mh.is_attached());

        // Freelist hands out every slot except the claimed one.
        let mut seen = Vec::new();
        while let Some(p) = mh.alloc_slot() {
            seen.push(mh.slot_of(p.as_ptr()).unwrap());
        }
        assert_eq!(seen.len(), count - 1);
        assert!(!seen.contains(&1));
        assert_eq!(mh.in_use(), count);

        mh.detach();
        assert!(!mh.is_attached());
    }

    #[test]
    fn test_meshing_candidate_gating() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut a = MeshableArena::new(page_size() * 8).unwrap();
        let mh = mini(&mut a, 64);

        // Empty heap: not a candidate (nothing to preserve; the tracker
        // flushes it instead).
        assert!(!mh.is_meshing_candidate(0.8));

        mh.malloc_at(0).unwrap();
        assert!(mh.is_meshing_candidate(0.8));

        // Attached heaps are never candidates.
        let mut prng = rng::Mt64::new(3);
        mh.reattach(&mut prng);
        assert!(!mh.is_meshing_candidate(0.8));
        mh.detach();
        assert!(mh.is_meshing_candidate(0.8));

        // Fill past the threshold.
        for i in 1..mh.object_count() {
            mh.malloc_at(i).unwrap();
        }
        assert!(!mh.is_meshing_candidate(0.8));
    }

    #[test]
    fn test_consume_merges_data_and_spans() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut a = MeshableArena::new(page_size() * 8).unwrap();
        let mut dst = mini(&mut a, 64);
        let mut src = mini(&mut a, 64);

        let d = dst.malloc_at(0).unwrap();
        let s = src.malloc_at(1).unwrap();
        // Safety: Test code; slots are owned.
        unsafe {
            d.as_ptr().write_bytes(0xD0, 64);
            s.as_ptr().write_bytes(0x51, 64);
        }

        dst.consume(&mut src);

        assert_eq!(dst.mesh_count(), 2);
        assert_eq!(src.mesh_count(), 0);
        assert!(src.is_empty());
        assert_eq!(dst.in_use(), 2);
        // Src's object now lives at slot 1 of dst's primary extent.
        // Safety: Test code.
        unsafe {
            assert_eq!(dst.slot_ptr(1).as_ptr().read(), 0x51);
            assert_eq!(dst.slot_ptr(0).as_ptr().read(), 0xD0);
        }
    }

    #[test]
    fn test_table_ids_and_reuse() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut a = MeshableArena::new(page_size() * 8).unwrap();
        let mut table = MiniHeapTable::new();

        let id0 = table.insert(mini(&mut a, 64));
        let id1 = table.insert(mini(&mut a, 64));
        assert_ne!(id0, id1);
        assert!(table.get(id0).is_some());

        table.remove(id0).unwrap();
        assert!(table.get(id0).is_none(), "stale id must not resolve");

        // The vacated slot is reused.
        let id2 = table.insert(mini(&mut a, 64));
        assert_eq!(id2.0, id0.0);

        let (x, y) = table.pair_mut(id1, id2);
        assert_eq!(x.object_size(), 64);
        assert_eq!(y.object_size(), 64);
    }
}
