use super::arena::MeshableArena;
use super::big_heap::BigHeap;
use super::meshing;
use super::miniheap::{MiniHeapId, MiniHeapTable};
use super::rng::{self, Mt64, Mwc};
use super::size_class::{self, NUM_SIZE_CLASSES};
use super::span::MAX_MESHES;
use super::stats::{self, GlobalHeapStats};
use super::stw;
use super::tracker::BinnedTracker;
use super::vm::VmError;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::fmt;
use std::ptr::NonNull;

/// Tunables of the global heap. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct GlobalHeapConfig {
    /// Virtual address space reserved for the span arena. Default: 256 MB.
    pub arena_bytes: usize,

    /// Average frees between meshing passes; the actual countdown is drawn
    /// uniformly from `[1, mesh_period]`. 0 disables meshing. Default: 1000.
    pub mesh_period: usize,

    /// A miniheap is a meshing candidate while its occupancy is below this
    /// fraction of its slot count (and it is unattached). Default: 0.8.
    pub occupancy_threshold: f64,

    /// Minimum objects provisioned per new miniheap, so tiny string-like
    /// classes amortize the cost of taking the global lock. Default: 8.
    pub min_object_count: usize,

    /// Empty miniheaps a tracker may queue before `post_free` advises a
    /// flush. Default: 8.
    pub max_empty: usize,

    /// Reservation bytes the big heap may cache for reuse. Default: 16 MB.
    pub big_cache_bytes: usize,
}

impl Default for GlobalHeapConfig {
    fn default() -> Self {
        Self {
            arena_bytes: 256 * 1024 * 1024,
            mesh_period: 1000,
            occupancy_threshold: 0.8,
            min_object_count: 8,
            max_empty: 8,
            big_cache_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Control-channel argument errors. The heap state is untouched when one of
/// these comes back.
#[derive(Debug, PartialEq, Eq)]
pub enum CtlError {
    MissingOutput,
    OutputTooSmall,
    MissingInput,
    InputTooSmall,
    UnknownName,
}

impl fmt::Display for CtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlError::MissingOutput => write!(f, "missing output buffer"),
            CtlError::OutputTooSmall => write!(f, "output buffer too small"),
            CtlError::MissingInput => write!(f, "missing input buffer"),
            CtlError::InputTooSmall => write!(f, "input buffer too small"),
            CtlError::UnknownName => write!(f, "unknown control name"),
        }
    }
}

impl std::error::Error for CtlError {}

/// Everything guarded by the structural read-write lock: the arena's
/// page-owner map, the miniheap table, and the per-class trackers. Trackers
/// sit behind their own mutexes so `post_free` can re-bin under a *shared*
/// structural lock (per-slot frees are atomic bitmap operations and need no
/// exclusivity).
struct HeapState {
    arena: MeshableArena,
    miniheaps: MiniHeapTable,
    bins: Vec<Mutex<BinnedTracker>>,
}

/// The global meshing heap: size-classed miniheap creation and reuse,
/// pointer resolution, free-path dispatch, the large-object fallback, and
/// the randomized meshing scheduler with its stop-the-world merge driver.
///
/// Lock order is structural (`state`) before `big`; [`lock`](Self::lock)
/// freezes both for external fork/snapshot code.
pub struct GlobalHeap {
    state: RwLock<HeapState>,
    big: Mutex<BigHeap>,

    max_object_size: usize,
    occupancy_threshold: f64,
    min_object_count: usize,

    mesh_period: AtomicUsize,
    next_mesh_check: AtomicUsize,

    /// Policy PRNG: period reseeds, candidate and freelist shuffles.
    prng: Mutex<Mt64>,
    /// Fast PRNG, reserved for hot-path draws by attached front-ends.
    #[allow(dead_code)]
    fast_prng: Mutex<Mwc>,

    stats: GlobalHeapStats,
}

/// RAII handle from [`GlobalHeap::lock`]: both heap locks held, released in
/// reverse acquisition order on drop.
pub struct HeapLockGuard<'a> {
    _big: MutexGuard<'a, BigHeap>,
    _state: RwLockWriteGuard<'a, HeapState>,
}

fn oom_abort(what: &str, e: &VmError) -> ! {
    eprintln!("[meshac] out of memory: {what}: {e}");
    std::process::abort()
}

impl GlobalHeap {
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(GlobalHeapConfig::default())
    }

    pub fn with_config(config: GlobalHeapConfig) -> Result<Self, VmError> {
        let arena = MeshableArena::new(config.arena_bytes)?;
        let page_size = arena.page_size();

        let bins = (0..NUM_SIZE_CLASSES)
            .map(|sc| {
                let object_size = size_class::max_of(sc);
                let object_count = std::cmp::max(page_size / object_size, config.min_object_count);
                Mutex::new(BinnedTracker::new(
                    sc,
                    object_size,
                    object_count,
                    config.max_empty,
                ))
            })
            .collect();

        let heap = Self {
            state: RwLock::new(HeapState {
                arena,
                miniheaps: MiniHeapTable::new(),
                bins,
            }),
            big: Mutex::new(BigHeap::new(config.big_cache_bytes)),
            max_object_size: size_class::max_of(NUM_SIZE_CLASSES - 1),
            occupancy_threshold: config.occupancy_threshold,
            min_object_count: config.min_object_count,
            mesh_period: AtomicUsize::new(config.mesh_period),
            next_mesh_check: AtomicUsize::new(0),
            prng: Mutex::new(Mt64::new(rng::seed())),
            fast_prng: Mutex::new(Mwc::new(rng::seed(), rng::seed())),
            stats: GlobalHeapStats::new(),
        };
        heap.reset_next_mesh_check();
        Ok(heap)
    }

    pub fn stats(&self) -> &GlobalHeapStats {
        &self.stats
    }

    #[inline]
    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Obtain a miniheap for `size`-byte objects and attach it to the
    /// caller, its freelist freshly populated. Prefers a reusable heap from
    /// the class tracker, else creates one. `size` must already be rounded
    /// to its class's object size (the front-end's job).
    ///
    /// Aborts the process if the arena cannot provide a span.
    pub fn alloc_miniheap(&self, size: usize) -> MiniHeapId {
        let mut guard = self.state.write().unwrap();
        let st = &mut *guard;

        debug_assert!(size <= self.max_object_size);
        let sc = size_class::class_of(size).expect("size beyond the top size class");
        let size_max = size_class::max_of(sc);
        debug_assert_eq!(
            size, size_max,
            "alloc_miniheap size {size} not rounded to class {sc} ({size_max})"
        );

        // Check the class bin for a miniheap to reuse.
        let reuse = st.bins[sc].lock().unwrap().select_for_reuse(&st.miniheaps);
        if let Some(id) = reuse {
            let mh = st.miniheaps.get(id).expect("tracker handed out stale id");
            let mut prng = self.prng.lock().unwrap();
            mh.reattach(&mut prng);
            debug_assert!(mh.is_attached());
            return id;
        }

        // Objects bigger than a page get several objects per span anyway, to
        // amortize miniheap creation and the global lock.
        let page_size = st.arena.page_size();
        let n_objects = std::cmp::max(page_size / size_max, self.min_object_count);
        let span_pages = size_class::page_count(size_max * n_objects, page_size);

        let span = match st.arena.alloc_span(span_pages) {
            Ok(span) => span,
            Err(e) => oom_abort("arena span allocation", &e),
        };

        let mh = super::miniheap::MiniHeap::new(
            st.arena.base(),
            page_size,
            span,
            sc,
            size_max,
            n_objects,
        );
        let id = st.miniheaps.insert(mh);
        st.arena.assoc(span, id);

        let mh = st.miniheaps.get(id).expect("freshly inserted id");
        {
            let mut prng = self.prng.lock().unwrap();
            mh.reattach(&mut prng);
        }
        st.bins[sc].lock().unwrap().add(id, mh);

        self.stats.note_miniheap_alloc();
        id
    }

    /// Large-object allocation. Sizes at or below the top size class are
    /// not serviced here — the front-end routes those through
    /// [`alloc_miniheap`](Self::alloc_miniheap).
    ///
    /// Aborts the process on OOM.
    pub fn malloc(&self, size: usize) -> NonNull<u8> {
        debug_assert!(
            size > self.max_object_size,
            "malloc({size}) is small enough for a size class; use alloc_miniheap"
        );

        let mut big = self.big.lock().unwrap();
        match big.alloc(size) {
            Ok(ptr) => ptr,
            Err(e) => oom_abort("big heap allocation", &e),
        }
    }

    /// Resolve `ptr` to its owning miniheap, bumping the heap's refcount on
    /// a hit. Callers that do not hand the id to `post_free` (directly or
    /// through [`free`](Self::free)) must call [`unref`](Self::unref).
    pub fn miniheap_for(&self, ptr: *const u8) -> Option<MiniHeapId> {
        let st = self.state.read().unwrap();
        let id = st.arena.lookup(ptr)?;
        let mh = st.miniheaps.get(id)?;
        mh.ref_();
        Some(id)
    }

    /// Drop a reference taken by [`miniheap_for`](Self::miniheap_for).
    pub fn unref(&self, id: MiniHeapId) {
        let st = self.state.read().unwrap();
        if let Some(mh) = st.miniheaps.get(id) {
            mh.unref();
        }
    }

    /// Object size behind `ptr`: the owning miniheap's object size, the big
    /// heap's block size, or 0 for null.
    pub fn get_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        {
            let st = self.state.read().unwrap();
            if let Some(id) = st.arena.lookup(ptr) {
                if let Some(mh) = st.miniheaps.get(id) {
                    // Mirror the lookup protocol: ref on resolve, explicit
                    // unref since no post_free follows.
                    mh.ref_();
                    let size = mh.object_size();
                    mh.unref();
                    return size;
                }
            }
        }
        self.big.lock().unwrap().get_size(ptr)
    }

    /// Free `ptr`, wherever it lives. Small pointers release their slot and
    /// notify the class tracker; unknown pointers are assumed to be big
    /// heap blocks. May trigger a flush of empty miniheaps and, on the
    /// geometric countdown, a full meshing pass.
    pub fn free(&self, ptr: *mut u8) {
        let Some(ptr_nn) = NonNull::new(ptr) else {
            return;
        };

        let should_consider_mesh;
        let should_flush;
        let sc;
        {
            let st = self.state.read().unwrap();
            let Some(id) = st.arena.lookup(ptr) else {
                drop(st);
                self.big.lock().unwrap().free(ptr_nn);
                return;
            };
            let Some(mh) = st.miniheaps.get(id) else {
                debug_assert!(false, "page owner {id:?} missing from the miniheap table");
                return;
            };

            // The lookup's reference is dropped by post_free below.
            mh.ref_();
            mh.free_ptr(ptr);
            should_consider_mesh = !mh.is_empty();
            sc = mh.size_class();
            // This may queue the miniheap for release; it must not be
            // touched after this point.
            should_flush = st.bins[sc].lock().unwrap().post_free(id, mh);
        }

        if should_flush {
            self.flush_free_miniheaps(sc);
        }

        if !should_consider_mesh {
            return;
        }

        if self.should_mesh() {
            self.mesh_all_size_classes();
        }
    }

    /// Detach a miniheap from its front-end and re-bin it. Until this runs,
    /// an attached heap is neither reusable nor a meshing candidate.
    pub fn release_miniheap(&self, id: MiniHeapId) {
        let should_flush;
        let sc;
        {
            let st = self.state.read().unwrap();
            let Some(mh) = st.miniheaps.get(id) else {
                debug_assert!(false, "release of stale miniheap {id:?}");
                return;
            };
            mh.detach();
            mh.ref_();
            sc = mh.size_class();
            should_flush = st.bins[sc].lock().unwrap().post_free(id, mh);
        }
        if should_flush {
            self.flush_free_miniheaps(sc);
        }
    }

    /// Allocate one object from an attached miniheap's freelist. This is
    /// the front-end's per-object path; `None` means the heap is exhausted
    /// and the front-end should `release_miniheap` + `alloc_miniheap`.
    pub fn alloc_object(&self, id: MiniHeapId) -> Option<NonNull<u8>> {
        let st = self.state.read().unwrap();
        let mh = st.miniheaps.get(id)?;
        debug_assert!(mh.is_attached(), "alloc_object on a detached miniheap");
        mh.alloc_slot()
    }

    /// Destroy a miniheap, returning all of its spans to the arena.
    pub fn free_miniheap(&self, id: MiniHeapId, untrack: bool) {
        let mut guard = self.state.write().unwrap();
        Self::free_miniheap_locked(&mut guard, &self.stats, id, untrack);
    }

    /// Number of live spans in the arena.
    pub fn allocated_miniheap_count(&self) -> usize {
        self.state.read().unwrap().arena.in_use_count()
    }

    /// Hold both heap locks until the guard drops. External fork/snapshot
    /// code uses this to freeze the allocator.
    pub fn lock(&self) -> HeapLockGuard<'_> {
        let state = self.state.write().unwrap();
        let big = self.big.lock().unwrap();
        HeapLockGuard {
            _big: big,
            _state: state,
        }
    }

    /// Per-class occupancy dump.
    pub fn dump_strings(&self) {
        let st = self.state.write().unwrap();
        for bin in &st.bins {
            bin.lock().unwrap().print_occupancy(&st.miniheaps);
        }
    }

    pub fn dump_stats(&self, level: i32, detailed: bool) {
        if level < 1 {
            return;
        }
        let st = self.state.write().unwrap();
        eprintln!(
            "[meshac] MESH COUNT:         {}",
            self.stats.mesh_count.load(Ordering::Relaxed)
        );
        eprintln!(
            "[meshac] MH Alloc Count:     {}",
            self.stats.mh_alloc_count.load(Ordering::Relaxed)
        );
        eprintln!(
            "[meshac] MH Free  Count:     {}",
            self.stats.mh_free_count.load(Ordering::Relaxed)
        );
        eprintln!(
            "[meshac] MH High Water Mark: {}",
            self.stats.mh_high_water_mark.load(Ordering::Relaxed)
        );
        eprintln!(
            "[meshac] Reserved / committed: {} / {} bytes",
            stats::TOTAL_RESERVED.get(),
            stats::TOTAL_COMMITTED.get()
        );
        for bin in &st.bins {
            bin.lock().unwrap().dump_stats(&st.miniheaps, detailed);
        }
    }

    /// Name/value control channel.
    ///
    /// Every name reads back a `usize` through `oldp`; writes take a
    /// `usize` through `newp`. See the crate docs for the name table.
    /// Returns an error — with no state change — for missing or short
    /// buffers and for unknown write targets.
    pub fn mallctl(
        &self,
        name: &str,
        oldp: Option<&mut [u8]>,
        newp: Option<&[u8]>,
    ) -> Result<(), CtlError> {
        let oldp = oldp.ok_or(CtlError::MissingOutput)?;
        if oldp.len() < std::mem::size_of::<usize>() {
            return Err(CtlError::OutputTooSmall);
        }

        match name {
            "mesh.check_period" => {
                write_stat(oldp, self.mesh_period.load(Ordering::Relaxed));
                let newp = newp.ok_or(CtlError::MissingInput)?;
                if newp.len() < std::mem::size_of::<usize>() {
                    return Err(CtlError::InputTooSmall);
                }
                let new_period = read_stat(newp);
                self.mesh_period.store(new_period, Ordering::Relaxed);
                self.reset_next_mesh_check();
                Ok(())
            }
            "mesh.compact" => {
                // Runs with the structural lock taken internally, not held
                // across this dispatch.
                self.mesh_all_size_classes();
                write_stat(oldp, 0);
                Ok(())
            }
            "arena" => {
                // Reserved.
                Ok(())
            }
            "stats.resident" => {
                write_stat(oldp, stats::resident_bytes());
                Ok(())
            }
            "stats.active" => {
                // All miniheaps at least partially full, at span granularity.
                let st = self.state.read().unwrap();
                let mut sz = self.big.lock().unwrap().arena_size();
                for bin in &st.bins {
                    let tracker = bin.lock().unwrap();
                    let count = tracker.non_empty_count();
                    if count == 0 {
                        continue;
                    }
                    sz += count * tracker.object_size() * tracker.object_count();
                }
                write_stat(oldp, sz);
                Ok(())
            }
            "stats.allocated" => {
                let st = self.state.read().unwrap();
                let mut sz = self.big.lock().unwrap().arena_size();
                for bin in &st.bins {
                    let tracker = bin.lock().unwrap();
                    if tracker.non_empty_count() == 0 {
                        continue;
                    }
                    sz += tracker.object_size() * tracker.allocated_object_count(&st.miniheaps);
                }
                write_stat(oldp, sz);
                Ok(())
            }
            _ => {
                // Unknown reads are accepted and ignored (like "arena");
                // unknown write targets are errors.
                if newp.is_some() {
                    Err(CtlError::UnknownName)
                } else {
                    Ok(())
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Meshing scheduler
    // ------------------------------------------------------------------

    fn reset_next_mesh_check(&self) {
        // A period of 0 means do not mesh.
        let period = self.mesh_period.load(Ordering::Relaxed);
        if period == 0 {
            return;
        }
        let draw = self.prng.lock().unwrap().uniform(1, period as u64) as usize;
        self.next_mesh_check.store(draw, Ordering::Release);
    }

    /// Geometric countdown: fires once every `mesh_period` qualifying frees
    /// on average, then reseeds.
    fn should_mesh(&self) -> bool {
        if self.mesh_period.load(Ordering::Relaxed) == 0 {
            return false;
        }
        let prev = self.next_mesh_check.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.reset_next_mesh_check();
            true
        } else {
            false
        }
    }

    /// Run one full meshing pass: flush empties, pair candidates in every
    /// size class, and merge the queue with the world stopped. Takes the
    /// structural lock exclusively; call unlocked.
    pub fn mesh_all_size_classes(&self) {
        let mut guard = self.state.write().unwrap();
        self.mesh_all_size_classes_locked(&mut guard);
    }

    fn mesh_all_size_classes_locked(&self, st: &mut HeapState) {
        // First, clear out any free memory we might have.
        for sc in 0..NUM_SIZE_CLASSES {
            let ids = st.bins[sc].lock().unwrap().take_flushable(&st.miniheaps);
            for id in ids {
                Self::free_miniheap_locked(st, &self.stats, id, false);
            }
        }

        let threshold = self.occupancy_threshold;
        let mut merge_sets: Vec<(MiniHeapId, MiniHeapId)> = Vec::new();
        {
            let mut prng = self.prng.lock().unwrap();
            for sc in 0..NUM_SIZE_CLASSES {
                let candidates = st.bins[sc]
                    .lock()
                    .unwrap()
                    .meshing_candidates(&st.miniheaps, threshold);
                if candidates.len() < 2 {
                    continue;
                }
                let table = &st.miniheaps;
                meshing::simple_greedy_splitting(&mut prng, candidates, table, |a, b| {
                    let (Some(x), Some(y)) = (table.get(a), table.get(b)) else {
                        return;
                    };
                    if x.is_meshing_candidate(threshold) && y.is_meshing_candidate(threshold) {
                        merge_sets.push((a, b));
                    }
                });
            }
        }

        if merge_sets.is_empty() {
            return;
        }

        self.stats
            .mesh_count
            .fetch_add(merge_sets.len(), Ordering::Relaxed);

        // A suspended thread may hold the host allocator's lock, so the
        // stopped-world window must not allocate or free through it:
        // reserve all bookkeeping growth now and park destroyed miniheap
        // boxes in a graveyard that drops after the world restarts.
        let mut graveyard: Vec<Box<super::miniheap::MiniHeap>> =
            Vec::with_capacity(merge_sets.len());
        st.miniheaps.reserve_removals(merge_sets.len());
        for &(a, b) in &merge_sets {
            for id in [a, b] {
                if let Some(mh) = st.miniheaps.get_mut(id) {
                    mh.reserve_spans(MAX_MESHES);
                }
            }
            if let Some(mh) = st.miniheaps.get(a) {
                let sc = mh.size_class();
                st.bins[sc].lock().unwrap().reserve(2);
            }
        }

        // Run the actual meshing with the world stopped.
        let heap_stats = &self.stats;
        stw::stop_the_world(|| Self::perform_meshing(st, heap_stats, &merge_sets, &mut graveyard));
        drop(graveyard);
    }

    /// Per-class meshing entry point. Kept alongside the all-classes pass;
    /// no splitting method is currently wired to it, so its queue is always
    /// empty and the world is never stopped.
    pub fn mesh_size_class(&self, size_class: usize) {
        debug_assert!(size_class < NUM_SIZE_CLASSES);
        let mut guard = self.state.write().unwrap();
        let st = &mut *guard;

        // The all-classes pass owns the active splitting policy.
        let merge_sets: Vec<(MiniHeapId, MiniHeapId)> = Vec::new();

        if merge_sets.is_empty() {
            return;
        }

        self.stats
            .mesh_count
            .fetch_add(merge_sets.len(), Ordering::Relaxed);
        let mut graveyard = Vec::with_capacity(merge_sets.len());
        let heap_stats = &self.stats;
        stw::stop_the_world(|| Self::perform_meshing(st, heap_stats, &merge_sets, &mut graveyard));
    }

    /// Runs with the world stopped: order each pair so the heap with more
    /// meshes absorbs the other (keeps ancestry chains shorter), then merge.
    fn perform_meshing(
        st: &mut HeapState,
        heap_stats: &GlobalHeapStats,
        merge_sets: &[(MiniHeapId, MiniHeapId)],
        graveyard: &mut Vec<Box<super::miniheap::MiniHeap>>,
    ) {
        for &(a, b) in merge_sets {
            let (dst, src) = {
                let (Some(x), Some(y)) = (st.miniheaps.get(a), st.miniheaps.get(b)) else {
                    continue;
                };
                if x.mesh_count() < y.mesh_count() {
                    (b, a)
                } else {
                    (a, b)
                }
            };
            Self::mesh_locked(st, heap_stats, dst, src, graveyard);
        }
    }

    /// Merge `src` into `dst`: copy live objects, transfer spans, remap the
    /// transferred spans onto `dst`'s extent, re-bin `dst`, destroy `src`.
    /// Refused (no-op) when the combined span count would exceed the cap.
    ///
    /// Must run with the world stopped (public surface is the meshing
    /// pass; exposed for the control channel's forced passes via
    /// `mesh.compact`).
    fn mesh_locked(
        st: &mut HeapState,
        heap_stats: &GlobalHeapStats,
        dst_id: MiniHeapId,
        src_id: MiniHeapId,
        graveyard: &mut Vec<Box<super::miniheap::MiniHeap>>,
    ) {
        let (dst_primary, old_len, sc) = {
            let (dst, src) = st.miniheaps.pair_mut(dst_id, src_id);
            if dst.mesh_count() + src.mesh_count() > MAX_MESHES {
                return;
            }
            let old_len = dst.mesh_count();
            dst.consume(src);
            (dst.primary_span(), old_len, dst.size_class())
        };

        let new_len = st
            .miniheaps
            .get(dst_id)
            .map_or(old_len, super::miniheap::MiniHeap::mesh_count);
        for i in old_len..new_len {
            let span = st.miniheaps.get(dst_id).expect("dst just consumed").spans()[i];
            if let Err(e) = st.arena.mesh(dst_primary, span) {
                // The copy already happened and src's extent is untouched
                // until this remap succeeds, so skipping is safe: readers of
                // the span see the same bytes either way.
                eprintln!("[meshac] span remap failed during mesh: {e}");
            }
            st.arena.assoc(span, dst_id);
        }

        // Adjust what bin the destination is in -- it might now be full and
        // no longer a candidate for meshing.
        {
            let mh = st.miniheaps.get(dst_id).expect("dst survives the merge");
            // post_free drops a reference; take one to balance.
            mh.ref_();
            st.bins[sc].lock().unwrap().post_free(dst_id, mh);
        }

        Self::free_miniheap_after_mesh_locked(st, heap_stats, src_id, true, graveyard);
    }

    /// Destroy a miniheap whose spans were folded into a merge destination.
    /// Span return is deliberately absent here — the spans live on under
    /// the destination's identity. The box lands in `graveyard` so its
    /// storage is released only after the world restarts.
    fn free_miniheap_after_mesh_locked(
        st: &mut HeapState,
        heap_stats: &GlobalHeapStats,
        id: MiniHeapId,
        untrack: bool,
        graveyard: &mut Vec<Box<super::miniheap::MiniHeap>>,
    ) {
        if untrack {
            if let Some(mh) = st.miniheaps.get(id) {
                let sc = mh.size_class();
                st.bins[sc].lock().unwrap().remove(id);
            }
        }
        if let Some(boxed) = st.miniheaps.remove(id) {
            graveyard.push(boxed);
            heap_stats.note_miniheap_free();
        }
    }

    fn free_miniheap_locked(
        st: &mut HeapState,
        heap_stats: &GlobalHeapStats,
        id: MiniHeapId,
        untrack: bool,
    ) {
        let Some(mh) = st.miniheaps.get_mut(id) else {
            debug_assert!(false, "free of stale miniheap {id:?}");
            return;
        };
        let sc = mh.size_class();
        let spans = mh.take_spans();

        if untrack {
            st.bins[sc].lock().unwrap().remove(id);
        }
        for span in spans {
            st.arena.free_span(span);
        }
        st.miniheaps.remove(id);
        heap_stats.note_miniheap_free();
    }

    /// Release every flushable empty miniheap of one class.
    fn flush_free_miniheaps(&self, sc: usize) {
        let mut guard = self.state.write().unwrap();
        let st = &mut *guard;
        let ids = st.bins[sc].lock().unwrap().take_flushable(&st.miniheaps);
        for id in ids {
            Self::free_miniheap_locked(st, &self.stats, id, false);
        }
    }
}

#[inline]
fn write_stat(buf: &mut [u8], val: usize) {
    buf[..std::mem::size_of::<usize>()].copy_from_slice(&val.to_ne_bytes());
}

#[inline]
fn read_stat(buf: &[u8]) -> usize {
    let mut bytes = [0u8; std::mem::size_of::<usize>()];
    bytes.copy_from_slice(&buf[..std::mem::size_of::<usize>()]);
    usize::from_ne_bytes(bytes)
}
