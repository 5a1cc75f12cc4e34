//! Page-level virtual memory primitives for the heap reservation.
//!
//! A heap reserves one contiguous, zero-filled, read-write mapping up front
//! and carves its spaces, card table and bitmaps out of it. Pages that the
//! collector frees are handed back with [`Mmap::discard`], which releases the
//! physical memory while keeping the address range reserved and zero-filled.

use std::io;
use std::ops::Range;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An owned anonymous memory mapping.
///
/// The mapping is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty. Mappings are never empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the address range covered by the mapping.
    pub fn range(&self) -> Range<usize> {
        let start = self.ptr() as usize;
        start..start + self.len()
    }

    /// Returns `true` if `[addr, addr + len)` lies inside the mapping.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        let range = self.range();
        addr >= range.start && addr.checked_add(len).is_some_and(|end| end <= range.end)
    }

    /// Zero-fills `[addr, addr + len)` and returns whole pages inside it to the OS.
    ///
    /// The range stays mapped and readable; subsequent reads observe zeros.
    /// Partial pages at either end are zeroed in place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is outside the mapping, or the OS
    /// error if releasing the pages fails.
    pub fn discard(&self, addr: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !self.contains_range(addr, len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("discard range {addr:#x}+{len:#x} outside mapping"),
            ));
        }

        let page = page_size();
        let end = addr + len;
        let page_begin = (addr + page - 1) & !(page - 1);
        let page_end = end & !(page - 1);

        if page_begin >= page_end {
            // SAFETY: the range was checked against the mapping above.
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
            return Ok(());
        }

        // SAFETY: head and tail lie inside the checked range.
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, page_begin - addr);
            std::ptr::write_bytes(page_end as *mut u8, 0, end - page_end);
        }
        // SAFETY: `[page_begin, page_end)` is page aligned and inside the mapping.
        unsafe { self.inner.discard_pages(page_begin, page_end - page_begin) }
    }
}

// SAFETY: the mapping is plain memory; synchronization is the user's concern.
unsafe impl Send for Mmap {}
// SAFETY: see above.
unsafe impl Sync for Mmap {}

/// Builder for anonymous mappings.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the mapping to be aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments at or below the allocation
    /// granularity are free; larger ones over-reserve and trim.
    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Asks the OS to place the mapping at `addr`. The hint may be ignored.
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Prefaults the page tables (`MAP_POPULATE` on Linux).
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skips swap reservation (`MAP_NORESERVE` on Linux).
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read-write mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length or a non power-of-two
    /// alignment, or the OS error if the mapping fails.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let align = self.align.max(allocation_granularity());
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let inner = unsafe {
            os::MmapInner::map_anon(
                self.hint_addr,
                self.len,
                align,
                self.populate,
                self.no_reserve,
            )?
        };
        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
