use std::io::{self, Error};
#[cfg(not(miri))]
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    // SAFETY: GetSystemInfo fills a plain struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    // SAFETY: GetSystemInfo fills a plain struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

/// A mapping whose usable window `[ptr, ptr + len)` may start inside a larger
/// reservation at `base` when extra alignment was requested.
pub struct MmapInner {
    base: *mut std::ffi::c_void,
    ptr: *mut u8,
    len: usize,
    #[cfg(miri)]
    layout: std::alloc::Layout,
}

impl MmapInner {
    /// Reserves and commits `len` bytes aligned to `align`.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc` on a range this function owns.
    pub unsafe fn map_anon(
        hint_addr: usize,
        len: usize,
        align: usize,
        _populate: bool,
        _no_reserve: bool,
    ) -> io::Result<Self> {
        #[cfg(miri)]
        {
            let _ = hint_addr;
            let layout = std::alloc::Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            // SAFETY: layout has non-zero size.
            let raw = unsafe { std::alloc::alloc_zeroed(layout) };
            if raw.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                base: raw.cast(),
                ptr: raw,
                len,
                layout,
            })
        }
        #[cfg(not(miri))]
        {
            let extra = if align > allocation_granularity() { align } else { 0 };
            let map_len = len
                .checked_add(extra)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
            let hint = if hint_addr == 0 || extra != 0 {
                ptr::null()
            } else {
                hint_addr as *const std::ffi::c_void
            };

            // SAFETY: reserving fresh address space.
            let mut base =
                unsafe { VirtualAlloc(hint, map_len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if base.is_null() && !hint.is_null() {
                // SAFETY: as above, without the hint.
                base = unsafe {
                    VirtualAlloc(ptr::null(), map_len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
                };
            }
            if base.is_null() {
                return Err(Error::last_os_error());
            }

            let base_addr = base as usize;
            let aligned = if extra == 0 {
                base_addr
            } else {
                (base_addr + align - 1) & !(align - 1)
            };
            Ok(Self {
                base,
                ptr: aligned as *mut u8,
                len,
            })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Decommits and recommits the pages so they read back as zeros.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must be page aligned and inside this mapping.
    pub unsafe fn discard_pages(&self, addr: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            // SAFETY: caller guarantees the range.
            unsafe { ptr::write_bytes(addr as *mut u8, 0, len) };
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let at = addr as *mut std::ffi::c_void;
            // SAFETY: caller guarantees the range belongs to this reservation.
            unsafe {
                if VirtualFree(at, len, MEM_DECOMMIT) == 0 {
                    return Err(Error::last_os_error());
                }
                if VirtualAlloc(at, len, MEM_COMMIT, PAGE_READWRITE).is_null() {
                    return Err(Error::last_os_error());
                }
            }
            Ok(())
        }
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        #[cfg(miri)]
        // SAFETY: allocated with this layout in `map_anon`.
        unsafe {
            std::alloc::dealloc(self.base.cast::<u8>(), self.layout);
        }
        #[cfg(not(miri))]
        // SAFETY: MEM_RELEASE frees the whole reservation; size must be 0.
        unsafe {
            VirtualFree(self.base, 0, MEM_RELEASE);
        }
    }
}

// SAFETY: raw mapping ownership may move between threads.
unsafe impl Send for MmapInner {}
// SAFETY: see above.
unsafe impl Sync for MmapInner {}
