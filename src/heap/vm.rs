use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    BackingFailed(std::io::Error),
    RemapFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::BackingFailed(e) => write!(f, "arena backing file creation failed: {e}"),
            VmError::RemapFailed(e) => write!(f, "page remap failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e)
            | VmError::BackingFailed(e)
            | VmError::RemapFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
///
/// Anonymous mappings (`reserve`/`commit`/`decommit`/`release`) back the big
/// heap. File-backed mappings (`create_backing`/`map_backing`/
/// `remap_backing`/`punch_hole`) back the meshable arena: two virtual spans
/// can be aliased onto one extent of the backing file, which is what page
/// meshing is.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;

    /// Create an anonymous, unlinked backing file of `size` bytes.
    fn create_backing(size: usize) -> Result<Backing, VmError>;

    /// Map the entire backing file as one shared read-write region.
    unsafe fn map_backing(backing: &Backing, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Remap `len` bytes at `addr` so they alias the backing file extent at
    /// `offset`. `addr` must lie inside a region obtained from
    /// `map_backing`; afterwards loads and stores through `addr` and through
    /// the original mapping of `offset` observe the same bytes.
    unsafe fn remap_backing(
        backing: &Backing,
        addr: NonNull<u8>,
        len: usize,
        offset: usize,
    ) -> Result<(), VmError>;

    /// Release the physical pages behind a backing-file extent. The extent
    /// reads as zeroes afterwards. Best effort: platforms without hole
    /// punching keep the pages until the backing is dropped.
    fn punch_hole(backing: &Backing, offset: usize, len: usize) -> Result<(), VmError>;

    /// Unmap a region obtained from `map_backing`.
    unsafe fn unmap_backing(ptr: NonNull<u8>, size: usize);
}

pub(crate) struct PlatformVmOps;

/// Convenience for callers that only need the page size.
#[inline]
pub(crate) fn page_size_cached() -> usize {
    <PlatformVmOps as VmOps>::page_size()
}

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{Backing, NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    /// Linux: memfd_create gives an anonymous tmpfs file with no name to
    /// clean up and no filesystem dependency.
    #[cfg(target_os = "linux")]
    fn open_backing_fd() -> Result<libc::c_int, io::Error> {
        // Safety: FFI call to memfd_create with a static name.
        let fd = unsafe { libc::memfd_create(c"meshac-arena".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    /// Other unixes: mkstemp + immediate unlink. The fd keeps the inode
    /// alive; the name never outlives this function.
    #[cfg(not(target_os = "linux"))]
    fn open_backing_fd() -> Result<libc::c_int, io::Error> {
        let mut template = *b"/tmp/meshac-arena-XXXXXX\0";
        // Safety: FFI; template is a valid mutable C string.
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast::<libc::c_char>()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: FFI; template was filled in by mkstemp.
        unsafe { libc::unlink(template.as_ptr().cast::<libc::c_char>()) };
        Ok(fd)
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE marks pages for lazy reclamation — the cheapest
            // decommit on both Linux (>= 4.5) and macOS. mprotect(PROT_NONE)
            // then removes access. Recommitted pages may hold stale data;
            // callers must not rely on zero fill.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                raw as usize
            })
        }

        fn create_backing(size: usize) -> Result<Backing, VmError> {
            let fd = open_backing_fd().map_err(VmError::BackingFailed)?;
            // Safety: FFI call to ftruncate on the fd we just opened.
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                // Safety: FFI; fd is open.
                unsafe { libc::close(fd) };
                return Err(VmError::BackingFailed(err));
            }
            Ok(Backing { fd })
        }

        unsafe fn map_backing(backing: &Backing, size: usize) -> Result<NonNull<u8>, VmError> {
            // MAP_NORESERVE: the arena is mostly holes; physical pages are
            // charged only when spans are written.
            #[cfg(target_os = "linux")]
            let flags = libc::MAP_SHARED | libc::MAP_NORESERVE;
            #[cfg(not(target_os = "linux"))]
            let flags = libc::MAP_SHARED;

            // Safety: FFI call to mmap; fd is a live backing file.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    backing.fd,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }
            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::other("mmap returned null"))
            })
        }

        unsafe fn remap_backing(
            backing: &Backing,
            addr: NonNull<u8>,
            len: usize,
            offset: usize,
        ) -> Result<(), VmError> {
            // MAP_FIXED atomically replaces the existing pages at `addr`
            // with a view of the file extent at `offset`. This is the mesh
            // operation: afterwards two virtual spans share one extent.
            // Safety: FFI call to mmap; addr lies within our own mapping.
            let ptr = unsafe {
                libc::mmap(
                    addr.as_ptr().cast::<libc::c_void>(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    backing.fd,
                    offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(VmError::RemapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(target_os = "linux")]
        fn punch_hole(backing: &Backing, offset: usize, len: usize) -> Result<(), VmError> {
            // Safety: FFI call to fallocate; fd is a live backing file.
            if unsafe {
                libc::fallocate(
                    backing.fd,
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            } != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        fn punch_hole(_backing: &Backing, _offset: usize, _len: usize) -> Result<(), VmError> {
            // No portable hole punching outside Linux. The pages stay until
            // the backing file is dropped; correctness is unaffected, only
            // eager physical reclamation.
            Ok(())
        }

        unsafe fn unmap_backing(ptr: NonNull<u8>, size: usize) {
            // Safety: FFI call to munmap; caller guarantees ptr/size came
            // from map_backing.
            unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) };
        }
    }
}

/// Handle to the arena's backing file. Closing the fd drops the inode (it
/// was never linked, or unlinked at creation), releasing all extents.
#[cfg(all(unix, not(any(loom, miri))))]
pub(crate) struct Backing {
    fd: libc::c_int,
}

#[cfg(all(unix, not(any(loom, miri))))]
impl Drop for Backing {
    fn drop(&mut self) {
        // Safety: FFI; fd is owned by this handle.
        unsafe { libc::close(self.fd) };
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)`/`cfg(miri)` we cannot issue real VM syscalls. Anonymous
// reservations become plain heap allocations. The arena backing becomes a
// heap block and `map_backing` returns that block directly, so offsets into
// the "file" and addresses in the "mapping" coincide. `remap_backing`
// degrades to a byte copy: reads through the remapped span observe the
// destination extent's bytes (the property the meshing tests assert);
// genuine write-sharing exists only under the real unix implementation.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
pub(crate) struct Backing {
    block: NonNull<u8>,
    size: usize,
}

#[cfg(any(loom, miri))]
unsafe impl Send for Backing {}

#[cfg(any(loom, miri))]
impl Drop for Backing {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.size, 4096).unwrap();
        // Safety: block was allocated with this layout in create_backing.
        unsafe { std::alloc::dealloc(self.block.as_ptr(), layout) };
    }
}

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn create_backing(size: usize) -> Result<Backing, VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::BackingFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size (arena sizes are page multiples).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let block = NonNull::new(ptr).ok_or_else(|| {
            VmError::BackingFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })?;
        Ok(Backing { block, size })
    }

    unsafe fn map_backing(backing: &Backing, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size <= backing.size);
        Ok(backing.block)
    }

    unsafe fn remap_backing(
        backing: &Backing,
        addr: NonNull<u8>,
        len: usize,
        offset: usize,
    ) -> Result<(), VmError> {
        // Copy the destination extent over the remapped span.
        // Safety: both ranges lie inside the backing block; ptr::copy
        // tolerates the (impossible) overlap case.
        unsafe {
            std::ptr::copy(backing.block.as_ptr().add(offset), addr.as_ptr(), len);
        }
        Ok(())
    }

    fn punch_hole(_backing: &Backing, _offset: usize, _len: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn unmap_backing(_ptr: NonNull<u8>, _size: usize) {
        // The Backing drop frees the block; the "mapping" is the same block.
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("First commit failed");
            PlatformVmOps::commit(ptr, size).expect("Second commit failed (idempotency check)");
            *(ptr.as_ptr()) = 123;
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_backing_map_roundtrip() {
        let size = PlatformVmOps::page_size() * 8;
        let backing = PlatformVmOps::create_backing(size).expect("create_backing failed");
        // Safety: Test code.
        unsafe {
            let base = PlatformVmOps::map_backing(&backing, size).expect("map_backing failed");
            let slice = std::slice::from_raw_parts_mut(base.as_ptr(), size);
            slice[0] = 0xAB;
            slice[size - 1] = 0xCD;
            assert_eq!(slice[0], 0xAB);
            assert_eq!(slice[size - 1], 0xCD);
            PlatformVmOps::unmap_backing(base, size);
        }
    }

    #[test]
    fn test_remap_aliases_extent() {
        // The core meshing primitive: after remapping page 1 onto extent 0,
        // a write through page 0 is visible through page 1 and vice versa.
        let page = PlatformVmOps::page_size();
        let size = page * 2;
        let backing = PlatformVmOps::create_backing(size).expect("create_backing failed");
        // Safety: Test code.
        unsafe {
            let base = PlatformVmOps::map_backing(&backing, size).expect("map_backing failed");
            let p0 = base.as_ptr();
            let p1 = base.as_ptr().add(page);

            p0.write(0x11);
            p1.write(0x22);

            let remap_at = NonNull::new(p1).unwrap();
            PlatformVmOps::remap_backing(&backing, remap_at, page, 0).expect("remap failed");

            // Page 1 now shows extent 0's contents.
            assert_eq!(p1.read(), 0x11);

            // Writes through either alias are visible through the other.
            p0.write(0x33);
            assert_eq!(p1.read(), 0x33);
            p1.write(0x44);
            assert_eq!(p0.read(), 0x44);

            PlatformVmOps::unmap_backing(base, size);
        }
    }

    #[test]
    fn test_punch_hole_zeroes_extent() {
        let page = PlatformVmOps::page_size();
        let backing = PlatformVmOps::create_backing(page).expect("create_backing failed");
        // Safety: Test code.
        unsafe {
            let base = PlatformVmOps::map_backing(&backing, page).expect("map_backing failed");
            base.as_ptr().write(0x7F);
            PlatformVmOps::punch_hole(&backing, 0, page).expect("punch_hole failed");
            #[cfg(target_os = "linux")]
            assert_eq!(base.as_ptr().read(), 0, "punched extent must read as zero");
            PlatformVmOps::unmap_backing(base, page);
        }
    }
}
