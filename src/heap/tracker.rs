use super::miniheap::{MiniHeap, MiniHeapId, MiniHeapTable};

/// Per-size-class bookkeeping: every live miniheap of the class, binned by
/// fullness. The `empty` bin doubles as the flush queue — empty heaps sit
/// there until `take_flushable` hands them to the global heap for release.
///
/// The tracker stores ids only; miniheap objects live in the global heap's
/// table. Callers pass the heap being reported so the tracker never has to
/// resolve ids itself on the hot path.
pub(crate) struct BinnedTracker {
    size_class: usize,
    object_size: usize,
    object_count: usize,
    max_empty: usize,
    empty: Vec<MiniHeapId>,
    partial: Vec<MiniHeapId>,
    full: Vec<MiniHeapId>,
}

impl BinnedTracker {
    pub fn new(size_class: usize, object_size: usize, object_count: usize, max_empty: usize) -> Self {
        Self {
            size_class,
            object_size,
            object_count,
            max_empty,
            empty: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
        }
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Heaps with at least one live object.
    pub fn non_empty_count(&self) -> usize {
        self.partial.len() + self.full.len()
    }

    /// Live objects across every tracked heap.
    pub fn allocated_object_count(&self, table: &MiniHeapTable) -> usize {
        self.ids()
            .filter_map(|id| table.get(id))
            .map(MiniHeap::in_use)
            .sum()
    }

    fn ids(&self) -> impl Iterator<Item = MiniHeapId> + '_ {
        self.empty
            .iter()
            .chain(self.partial.iter())
            .chain(self.full.iter())
            .copied()
    }

    fn bin_for(&self, mh: &MiniHeap) -> usize {
        let in_use = mh.in_use();
        if in_use == 0 {
            0
        } else if in_use == self.object_count {
            2
        } else {
            1
        }
    }

    fn bin_mut(&mut self, which: usize) -> &mut Vec<MiniHeapId> {
        match which {
            0 => &mut self.empty,
            1 => &mut self.partial,
            _ => &mut self.full,
        }
    }

    /// Pre-grow every bin so re-binning during a stopped-world window never
    /// touches the host allocator.
    pub fn reserve(&mut self, extra: usize) {
        self.empty.reserve(extra);
        self.partial.reserve(extra);
        self.full.reserve(extra);
    }

    pub fn add(&mut self, id: MiniHeapId, mh: &MiniHeap) {
        let bin = self.bin_for(mh);
        self.bin_mut(bin).push(id);
    }

    /// Drop `id` from whichever bin holds it. Returns false for untracked
    /// ids (already flushed).
    pub fn remove(&mut self, id: MiniHeapId) -> bool {
        for which in 0..3 {
            let bin = self.bin_mut(which);
            if let Some(pos) = bin.iter().position(|&x| x == id) {
                bin.swap_remove(pos);
                return true;
            }
        }
        false
    }

    /// A partially-filled, unattached heap for the allocation path to
    /// reattach, falling back to an empty one. The heap stays tracked.
    pub fn select_for_reuse(&self, table: &MiniHeapTable) -> Option<MiniHeapId> {
        for bin in [&self.partial, &self.empty] {
            for &id in bin.iter().rev() {
                if table.get(id).is_some_and(|mh| !mh.is_attached()) {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Record post-free (or post-merge) state: re-bin the heap and drop the
    /// reference taken by the lookup that led here. Returns true when the
    /// empty bin has grown past its limit and a flush is advised.
    ///
    /// The heap may be released by that flush; callers must not touch it
    /// after this returns.
    pub fn post_free(&mut self, id: MiniHeapId, mh: &MiniHeap) -> bool {
        let was_tracked = self.remove(id);
        debug_assert!(was_tracked, "post_free for untracked miniheap {id:?}");
        let bin = self.bin_for(mh);
        self.bin_mut(bin).push(id);
        mh.unref();
        self.empty.len() > self.max_empty
    }

    /// Partially-filled heaps eligible for meshing this pass. Only the
    /// partial bin can qualify: empties are flushed, full heaps have
    /// nothing to gain.
    pub fn meshing_candidates(&self, table: &MiniHeapTable, threshold: f64) -> Vec<MiniHeapId> {
        self.partial
            .iter()
            .copied()
            .filter(|&id| {
                table
                    .get(id)
                    .is_some_and(|mh| mh.is_meshing_candidate(threshold))
            })
            .collect()
    }

    /// Drain the flush queue: every empty, unattached heap leaves the
    /// tracker and is returned for the global heap to destroy. Attached
    /// empties stay (a front-end holds their fast path), and heaps whose
    /// occupancy moved since they were binned are re-binned instead of
    /// flushed — the bitmap, not the bin, decides what is releasable.
    pub fn take_flushable(&mut self, table: &MiniHeapTable) -> Vec<MiniHeapId> {
        let mut flushed = Vec::new();
        for id in std::mem::take(&mut self.empty) {
            match table.get(id) {
                None => {}
                Some(mh) if mh.is_attached() => self.empty.push(id),
                Some(mh) if !mh.is_empty() => {
                    let bin = self.bin_for(mh);
                    self.bin_mut(bin).push(id);
                }
                Some(_) => flushed.push(id),
            }
        }
        flushed
    }

    pub fn print_occupancy(&self, table: &MiniHeapTable) {
        eprintln!(
            "[meshac] class {:2} ({:5} B): {} empty, {} partial, {} full, {}/{} objects live",
            self.size_class,
            self.object_size,
            self.empty.len(),
            self.partial.len(),
            self.full.len(),
            self.allocated_object_count(table),
            (self.empty.len() + self.partial.len() + self.full.len()) * self.object_count,
        );
    }

    pub fn dump_stats(&self, table: &MiniHeapTable, detailed: bool) {
        if self.ids().next().is_none() {
            return;
        }
        self.print_occupancy(table);
        if detailed {
            for id in self.ids() {
                if let Some(mh) = table.get(id) {
                    eprintln!(
                        "[meshac]   mh {:4}: {}/{} in use, {} span(s), attached={}",
                        id.0,
                        mh.in_use(),
                        mh.object_count(),
                        mh.mesh_count(),
                        mh.is_attached(),
                    );
                }
            }
        }
    }
}
