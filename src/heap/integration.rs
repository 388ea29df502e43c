#[cfg(all(test, not(loom)))]
mod tests {
    use crate::heap::global::{GlobalHeap, GlobalHeapConfig};
    use crate::heap::miniheap::MiniHeapId;
    use crate::heap::rng::Mt64;
    use crate::heap::size_class;
    use crate::heap::stw;
    use crate::sync::atomic::Ordering;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use crate::sync::Arc;
    use std::ptr::NonNull;

    fn heap() -> GlobalHeap {
        GlobalHeap::with_config(GlobalHeapConfig {
            arena_bytes: 64 * 1024 * 1024,
            mesh_period: 0,
            ..GlobalHeapConfig::default()
        })
        .unwrap()
    }

    fn read_ctl(heap: &GlobalHeap, name: &str) -> usize {
        let mut buf = [0u8; 8];
        heap.mallctl(name, Some(&mut buf), None).unwrap();
        usize::from_ne_bytes(buf)
    }

    /// Minimal front-end: one attached miniheap per size class, swapped for
    /// a fresh (or reused) one when it runs dry.
    struct FrontEnd<'a> {
        heap: &'a GlobalHeap,
        current: Option<MiniHeapId>,
        object_size: usize,
    }

    impl<'a> FrontEnd<'a> {
        fn new(heap: &'a GlobalHeap, requested: usize) -> Self {
            let sc = size_class::class_of(requested).expect("small sizes only");
            Self {
                heap,
                current: None,
                object_size: size_class::max_of(sc),
            }
        }

        fn alloc(&mut self) -> NonNull<u8> {
            loop {
                if let Some(id) = self.current {
                    if let Some(ptr) = self.heap.alloc_object(id) {
                        return ptr;
                    }
                    self.heap.release_miniheap(id);
                    self.current = None;
                }
                self.current = Some(self.heap.alloc_miniheap(self.object_size));
            }
        }

        fn release(&mut self) {
            if let Some(id) = self.current.take() {
                self.heap.release_miniheap(id);
            }
        }
    }

    impl Drop for FrontEnd<'_> {
        fn drop(&mut self) {
            self.release();
        }
    }

    #[test]
    fn test_alloc_free_roundtrip_law() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Allocating N objects of one class and freeing them all leaves the
        // class with no non-empty miniheaps once the flush runs.
        let heap = heap();
        let mut fe = FrontEnd::new(&heap, 16);

        let ptrs: Vec<_> = (0..2000).map(|_| fe.alloc()).collect();
        assert!(heap.stats().live_miniheaps() >= 1);

        fe.release();
        for p in &ptrs {
            heap.free(p.as_ptr());
        }

        // mesh.compact's prologue is the flush entry point.
        let mut buf = [0u8; 8];
        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();

        assert_eq!(heap.stats().live_miniheaps(), 0);
        assert_eq!(read_ctl(&heap, "stats.active"), 0);
        assert_eq!(read_ctl(&heap, "stats.allocated"), 0);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = heap();
        let mut fe = FrontEnd::new(&heap, 64);
        let ptrs: Vec<_> = (0..100).map(|_| fe.alloc()).collect();
        fe.release();
        for p in ptrs {
            heap.free(p.as_ptr());
        }

        let mut buf = [0u8; 8];
        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();
        let free_count = heap.stats().mh_free_count.load(Ordering::Relaxed);
        let mesh_count = heap.stats().mesh_count.load(Ordering::Relaxed);

        // A second flush with no intervening mutation changes nothing.
        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();
        assert_eq!(heap.stats().mh_free_count.load(Ordering::Relaxed), free_count);
        assert_eq!(heap.stats().mesh_count.load(Ordering::Relaxed), mesh_count);
    }

    #[test]
    fn test_getsize_matches_class_for_live_pointers() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = heap();

        for requested in [1usize, 16, 17, 100, 128, 1000, 4096, 16384] {
            let mut fe = FrontEnd::new(&heap, requested);
            let p = fe.alloc();
            let sc = size_class::class_of(requested).unwrap();
            assert_eq!(
                heap.get_size(p.as_ptr()),
                size_class::max_of(sc),
                "get_size disagrees with the class table for request {requested}"
            );
            let id = heap.miniheap_for(p.as_ptr()).expect("live small pointer");
            heap.unref(id);
            heap.free(p.as_ptr());
        }
    }

    #[test]
    fn test_post_free_lookup_behavior() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = heap();
        let mut fe = FrontEnd::new(&heap, 32);
        let p = fe.alloc();
        let id = heap.miniheap_for(p.as_ptr()).unwrap();
        heap.unref(id);

        // Freed but not yet flushed: the same miniheap answers.
        heap.free(p.as_ptr());
        assert_eq!(heap.miniheap_for(p.as_ptr()), Some(id));
        heap.unref(id);

        // Released and flushed: the pointer no longer resolves.
        fe.release();
        let mut buf = [0u8; 8];
        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();
        assert_eq!(heap.miniheap_for(p.as_ptr()), None);
    }

    #[cfg(not(miri))] // thousands of allocations; far too slow under miri
    #[test]
    fn test_mesh_safety_under_churn() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Random allocate/free churn with forced meshing passes in between:
        // every live byte must equal its last-written value throughout.
        let heap = heap();
        let mut fe = FrontEnd::new(&heap, 16);
        let mut prng = Mt64::new(0xC0FFEE);
        let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();
        let mut buf = [0u8; 8];

        for round in 0..6 {
            // Grow enough to span several miniheaps even with 16K pages.
            for i in 0..2600 {
                let p = fe.alloc();
                let tag = (round * 37 + i % 200) as u8;
                // Safety: Test code; freshly allocated 16-byte object.
                unsafe { p.as_ptr().write_bytes(tag, 16) };
                live.push((p, tag));
            }

            // Shrink to a very sparse survivor set so heap bitmaps are
            // almost certainly pairwise disjoint.
            prng.shuffle(&mut live);
            let keep = live.len() / 64;
            for (p, _) in live.drain(keep..) {
                heap.free(p.as_ptr());
            }

            fe.release();
            heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();

            // Every survivor reads back its tag through its original
            // pointer, meshed or not.
            for &(p, tag) in &live {
                // Safety: Test code; object is live.
                unsafe {
                    for off in 0..16 {
                        assert_eq!(
                            p.as_ptr().add(off).read(),
                            tag,
                            "round {round}: byte {off} corrupted after meshing"
                        );
                    }
                }
                let id = heap.miniheap_for(p.as_ptr()).expect("live pointer lost its heap");
                heap.unref(id);
                assert_eq!(heap.get_size(p.as_ptr()), 16);
            }
        }

        assert!(
            heap.stats().mesh_count.load(Ordering::Relaxed) > 0,
            "sparse churn should have produced at least one merge"
        );

        // Cleanup obeys the roundtrip law.
        for (p, _) in live.drain(..) {
            heap.free(p.as_ptr());
        }
        fe.release();
        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();
        assert_eq!(heap.stats().live_miniheaps(), 0);
    }

    #[test]
    fn test_miniheap_accounting_invariant() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = heap();
        let mut fe16 = FrontEnd::new(&heap, 16);
        let mut fe1k = FrontEnd::new(&heap, 1024);

        let mut ptrs = Vec::new();
        for _ in 0..500 {
            ptrs.push(fe16.alloc());
            ptrs.push(fe1k.alloc());
        }

        let alloc = heap.stats().mh_alloc_count.load(Ordering::Relaxed);
        let freed = heap.stats().mh_free_count.load(Ordering::Relaxed);
        assert!(alloc >= 2);
        assert_eq!(heap.stats().live_miniheaps(), alloc - freed);
        assert!(heap.stats().mh_high_water_mark.load(Ordering::Relaxed) >= alloc - freed);

        fe16.release();
        fe1k.release();
        for p in ptrs {
            heap.free(p.as_ptr());
        }
        let mut buf = [0u8; 8];
        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();

        let alloc = heap.stats().mh_alloc_count.load(Ordering::Relaxed);
        let freed = heap.stats().mh_free_count.load(Ordering::Relaxed);
        assert_eq!(alloc, freed, "everything was freed: no live miniheaps remain");
        assert_eq!(heap.stats().live_miniheaps(), 0);
    }

    #[cfg(not(miri))] // needs real signal-based stop-the-world
    #[test]
    fn test_threaded_front_ends_with_meshing() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        // Several registered application threads churn their own front-ends
        // on one shared heap while the main thread forces meshing passes.
        // Stop-the-world must keep every thread's data intact.
        let heap = Arc::new(heap());
        let num_threads = 4usize;
        let iters = 400usize;
        let barrier = Arc::new(Barrier::new(num_threads + 1));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let heap = Arc::clone(&heap);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    stw::register_current_thread();
                    let sizes = [16usize, 48, 256, 1024];
                    let mut fe = FrontEnd::new(&heap, sizes[t % sizes.len()]);
                    let osize = fe.object_size;
                    let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();

                    barrier.wait();

                    for i in 0..iters {
                        let p = fe.alloc();
                        let tag = (t * 64 + i % 61) as u8;
                        // Safety: Test code; freshly allocated object.
                        unsafe { p.as_ptr().write_bytes(tag, osize) };
                        live.push((p, tag));

                        // Free roughly two of every three allocations.
                        if i % 3 != 0 {
                            let victim = live.swap_remove(i % live.len());
                            heap.free(victim.0.as_ptr());
                        }
                    }

                    // Everything still held must read back intact.
                    for &(p, tag) in &live {
                        // Safety: Test code; object is live.
                        unsafe {
                            assert_eq!(p.as_ptr().read(), tag, "thread {t} data corrupted");
                            assert_eq!(
                                p.as_ptr().add(osize - 1).read(),
                                tag,
                                "thread {t} tail corrupted"
                            );
                        }
                    }
                    for (p, _) in live {
                        heap.free(p.as_ptr());
                    }
                    fe.release();
                    stw::unregister_current_thread();
                })
            })
            .collect();

        barrier.wait();
        let mut buf = [0u8; 8];
        for _ in 0..10 {
            heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        for h in handles {
            h.join().unwrap();
        }

        heap.mallctl("mesh.compact", Some(&mut buf), None).unwrap();
        assert_eq!(heap.stats().live_miniheaps(), 0);
        assert_eq!(read_ctl(&heap, "stats.active"), 0);
    }

    #[test]
    fn test_big_and_small_interleaved() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = heap();
        let mut fe = FrontEnd::new(&heap, 128);

        let mut small = Vec::new();
        let mut big = Vec::new();
        for i in 0..50usize {
            let p = fe.alloc();
            // Safety: Test code.
            unsafe { p.as_ptr().write(i as u8) };
            small.push((p, i as u8));
            if i % 10 == 0 {
                let b = heap.malloc(64 * 1024 + i);
                // Safety: Test code.
                unsafe { b.as_ptr().write(0xB0 + (i as u8 / 10)) };
                big.push((b, 0xB0 + (i as u8 / 10)));
            }
        }

        for &(p, v) in &small {
            // Safety: Test code.
            unsafe { assert_eq!(p.as_ptr().read(), v) };
            let id = heap.miniheap_for(p.as_ptr()).expect("small pointer must resolve");
            heap.unref(id);
        }
        for &(b, v) in &big {
            // Safety: Test code.
            unsafe { assert_eq!(b.as_ptr().read(), v) };
            assert_eq!(heap.miniheap_for(b.as_ptr()), None);
        }

        for (p, _) in small {
            heap.free(p.as_ptr());
        }
        for (b, _) in big {
            heap.free(b.as_ptr());
        }
    }
}
