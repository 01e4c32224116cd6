//! Virtual address space reservation with page-granular commit/decommit.
//!
//! A [`Reservation`] claims a contiguous range of address space without
//! backing it with memory. Pages become usable after [`Reservation::commit`]
//! and are returned to the OS by [`Reservation::decommit`]. Freshly committed
//! pages read as zero.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// OS page size in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(os::page_size)
}

/// Round `len` up to a whole number of pages.
pub fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// A reserved, initially inaccessible address range.
pub struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

// The reservation only hands out raw pointers; callers synchronise access to
// the pages they commit.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve at least `len` bytes (rounded up to whole pages).
    pub fn reserve(len: usize) -> io::Result<Self> {
        let len = round_to_pages(len.max(1));
        let base = os::reserve(len)?;
        log::debug!("Reserved {} KiB of address space at {:p}", len / 1024, base);
        Ok(Self { base, len })
    }

    /// Base address of the reservation.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Reserved length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the reservation is zero-sized (never true after `reserve`).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Make `[offset, offset + len)` readable and writable.
    /// Both values must be page aligned.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len);
        // SAFETY: range checked against the reservation above.
        unsafe { os::commit(self.base.as_ptr().add(offset), len) }
    }

    /// Return `[offset, offset + len)` to the OS and make it inaccessible.
    /// Both values must be page aligned.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len);
        // SAFETY: range checked against the reservation above.
        unsafe { os::decommit(self.base.as_ptr().add(offset), len) }
    }

    fn check_range(&self, offset: usize, len: usize) {
        let page = page_size();
        assert!(
            offset % page == 0 && len % page == 0,
            "unaligned page range {}+{}",
            offset,
            len
        );
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "page range {}+{} outside reservation of {} bytes",
            offset,
            len,
            self.len
        );
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: base/len came from os::reserve and are released exactly once.
        unsafe { os::release(self.base, self.len) };
    }
}

#[cfg(unix)]
mod os {
    use std::io;
    use std::ptr::NonNull;

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    pub fn reserve(len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: anonymous mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: caller passes a page-aligned range inside a live mapping.
        let rc = unsafe {
            libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: caller passes a page-aligned range inside a live mapping.
        unsafe {
            if libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_NONE) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub unsafe fn release(base: NonNull<u8>, len: usize) {
        // SAFETY: caller guarantees the mapping is no longer referenced.
        let rc = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, len) };
        if rc != 0 {
            log::warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

// Without an mmap-style API the whole range is allocated zeroed up front and
// commit/decommit only maintain the zero-on-recommit contract.
#[cfg(not(unix))]
mod os {
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::io;
    use std::ptr::NonNull;

    const PAGE_SIZE: usize = 4096;

    pub fn page_size() -> usize {
        PAGE_SIZE
    }

    fn layout(len: usize) -> io::Result<Layout> {
        Layout::from_size_align(len, PAGE_SIZE).map_err(io::Error::other)
    }

    pub fn reserve(len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout(len)?) };
        NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    pub unsafe fn commit(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: caller passes a range inside the allocation.
        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        Ok(())
    }

    pub unsafe fn release(base: NonNull<u8>, len: usize) {
        if let Ok(layout) = layout(len) {
            // SAFETY: allocated in reserve with the same layout.
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(round_to_pages(1), page_size());
        assert_eq!(round_to_pages(page_size()), page_size());
        assert_eq!(round_to_pages(page_size() + 1), 2 * page_size());
    }

    #[test]
    fn test_commit_write_decommit() {
        let page = page_size();
        let reservation = Reservation::reserve(4 * page).unwrap();
        assert_eq!(reservation.len(), 4 * page);

        reservation.commit(page, 2 * page).unwrap();
        let ptr = reservation.base().as_ptr();
        unsafe {
            assert_eq!(*ptr.add(page), 0);
            *ptr.add(page) = 42;
            *ptr.add(3 * page - 1) = 7;
            assert_eq!(*ptr.add(page), 42);
        }

        reservation.decommit(page, 2 * page).unwrap();
        reservation.commit(page, page).unwrap();
        unsafe {
            assert_eq!(*ptr.add(page), 0, "recommitted pages read as zero");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_large_reservation_is_cheap() {
        // 4 GiB of address space, nothing committed
        let reservation = Reservation::reserve(4 << 30).unwrap();
        reservation.commit(0, page_size()).unwrap();
        unsafe { *reservation.base().as_ptr() = 1 };
    }

    #[test]
    #[should_panic(expected = "outside reservation")]
    fn test_commit_out_of_range_panics() {
        let reservation = Reservation::reserve(page_size()).unwrap();
        let _ = reservation.commit(page_size(), page_size());
    }
}
