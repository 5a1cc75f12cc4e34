use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf has no preconditions.
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Maps `len` bytes aligned to `align`, trimming the over-reservation.
    ///
    /// # Safety
    ///
    /// Calls `mmap`/`munmap` on a range this function owns.
    pub unsafe fn map_anon(
        hint_addr: usize,
        len: usize,
        align: usize,
        populate: bool,
        no_reserve: bool,
    ) -> io::Result<Self> {
        let populate = if populate { MAP_POPULATE } else { 0 };
        let no_reserve = if no_reserve { MAP_NORESERVE } else { 0 };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate | no_reserve;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let page = page_size();
        let extra = if align > page { align } else { 0 };
        let map_len = len
            .checked_add(extra)
            .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
        let hint = if hint_addr == 0 {
            ptr::null_mut()
        } else {
            hint_addr as *mut libc::c_void
        };

        // SAFETY: anonymous private mapping, no fd.
        let raw = unsafe { libc::mmap(hint, map_len, prot, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        if extra == 0 {
            return Ok(Self { ptr: raw, len });
        }

        let raw_addr = raw as usize;
        let aligned = (raw_addr + align - 1) & !(align - 1);
        let head = aligned - raw_addr;
        let tail = map_len - head - len;
        // SAFETY: head and tail are page-aligned pieces of the mapping just created.
        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }
        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Releases physical pages; the range reads back as zeros.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be page aligned and inside this mapping.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub unsafe fn discard_pages(&self, addr: usize, len: usize) -> io::Result<()> {
        // MADV_DONTNEED on a private anonymous mapping guarantees zero-fill on next touch.
        // SAFETY: caller guarantees the range.
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Zero-fills the range and hints the kernel that it may reclaim it.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be page aligned and inside this mapping.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub unsafe fn discard_pages(&self, addr: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range.
        unsafe {
            ptr::write_bytes(addr as *mut u8, 0, len);
            libc::madvise(addr as *mut libc::c_void, len, libc::MADV_FREE);
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: we own the mapping.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

// SAFETY: raw mapping ownership may move between threads.
unsafe impl Send for MmapInner {}
// SAFETY: see above.
unsafe impl Sync for MmapInner {}
