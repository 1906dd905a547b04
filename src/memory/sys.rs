use std::fmt;
use std::io;
use std::ptr::NonNull;

use super::chunk::ALIGN;

#[derive(Debug)]
pub enum SysError {
    /// The underlying OS allocator could not supply the requested bytes.
    /// Surfaced unchanged; the pool performs no recovery.
    AllocFailed(io::Error),
    /// Computing a jumbo block's total size overflowed `usize`.
    SizeOverflow { requested: usize },
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysError::AllocFailed(e) => write!(f, "OS allocation failed: {e}"),
            SysError::SizeOverflow { requested } => {
                write!(f, "allocation size overflow: requested {requested} bytes")
            }
        }
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SysError::AllocFailed(e) => Some(e),
            SysError::SizeOverflow { .. } => None,
        }
    }
}

/// The external OS-level allocator the pool draws whole blocks from.
/// Byte-granular; returned pointers are aligned for any scalar (at least
/// `ALIGN`).
pub(crate) trait SysOps {
    /// Obtain `size` fresh bytes.
    ///
    /// # Safety
    /// `size` must be non-zero.
    unsafe fn alloc(size: usize) -> Result<NonNull<u8>, SysError>;

    /// Resize an existing allocation, possibly moving it. On error the
    /// original allocation is untouched.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator with size `old_size` and
    /// not been freed; `new_size` must be non-zero.
    unsafe fn realloc(
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, SysError>;

    /// Return an allocation to the OS.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator with size `size` and not
    /// been freed.
    unsafe fn free(ptr: NonNull<u8>, size: usize);
}

pub(crate) struct PlatformSysOps;

#[cfg(not(miri))]
impl SysOps for PlatformSysOps {
    unsafe fn alloc(size: usize) -> Result<NonNull<u8>, SysError> {
        debug_assert!(size > 0, "zero-size OS allocation");
        // Safety: FFI call to malloc.
        let ptr = unsafe { libc::malloc(size) };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| SysError::AllocFailed(io::Error::last_os_error()))?;
        debug_assert!(
            (ptr.as_ptr() as usize).is_multiple_of(ALIGN),
            "malloc returned insufficiently aligned pointer {ptr:p}"
        );
        Ok(ptr)
    }

    unsafe fn realloc(
        ptr: NonNull<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, SysError> {
        debug_assert!(new_size > 0, "zero-size OS reallocation");
        // Safety: FFI call to realloc; ptr originates from malloc/realloc
        // per caller contract.
        let moved = unsafe { libc::realloc(ptr.as_ptr().cast::<libc::c_void>(), new_size) };
        let moved = NonNull::new(moved.cast::<u8>())
            .ok_or_else(|| SysError::AllocFailed(io::Error::last_os_error()))?;
        debug_assert!(
            (moved.as_ptr() as usize).is_multiple_of(ALIGN),
            "realloc returned insufficiently aligned pointer {moved:p}"
        );
        Ok(moved)
    }

    unsafe fn free(ptr: NonNull<u8>, _size: usize) {
        // Safety: FFI call to free; ptr originates from malloc/realloc per
        // caller contract.
        unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) }
    }
}

// Miri cannot follow FFI into the C allocator, so back the same interface
// with the Rust global allocator. This is why free/realloc carry sizes:
// `std::alloc` needs the layout back.
#[cfg(miri)]
impl SysOps for PlatformSysOps {
    unsafe fn alloc(size: usize) -> Result<NonNull<u8>, SysError> {
        let layout = std::alloc::Layout::from_size_align(size, ALIGN)
            .map_err(|e| SysError::AllocFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size per caller contract.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            SysError::AllocFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn realloc(
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, SysError> {
        let layout = std::alloc::Layout::from_size_align(old_size, ALIGN)
            .map_err(|e| SysError::AllocFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with this layout via `alloc`.
        let moved = unsafe { std::alloc::realloc(ptr.as_ptr(), layout, new_size) };
        NonNull::new(moved).ok_or_else(|| {
            SysError::AllocFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "realloc returned null",
            ))
        })
    }

    unsafe fn free(ptr: NonNull<u8>, size: usize) {
        let layout = std::alloc::Layout::from_size_align(size, ALIGN)
            .expect("layout was valid at allocation time");
        // Safety: ptr was allocated with this layout via `alloc`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
