//! Address-indexed liveness bitmap.
//!
//! One bit per [`OBJECT_ALIGNMENT`] bytes of a space. Spaces own a mark
//! bitmap, and spaces that sweep also own a live bitmap; the two swap roles at
//! the end of every mark-sweep cycle so neither needs to be re-zeroed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::object::{ObjectRef, OBJECT_ALIGNMENT};

const BITS_PER_WORD: usize = u64::BITS as usize;
/// Bytes of heap covered by one bitmap word.
const BYTES_PER_WORD: usize = BITS_PER_WORD * OBJECT_ALIGNMENT;

/// Garbage addresses are reported to sweep callbacks in batches of this size.
pub const SWEEP_BATCH: usize = 128;

/// A bitmap covering `[base, base + capacity)`.
///
/// # Example
///
/// ```
/// use strata_gc::gc::mark::HeapBitmap;
/// use strata_gc::ObjectRef;
///
/// let bitmap = HeapBitmap::new("example", 0x10000, 4096);
/// let obj = ObjectRef::new(0x10040).unwrap();
/// assert!(!bitmap.test(obj));
/// bitmap.set(obj);
/// assert!(bitmap.test(obj));
/// ```
#[derive(Debug)]
pub struct HeapBitmap {
    name: String,
    base: usize,
    capacity: usize,
    words: Box<[AtomicU64]>,
    /// Highest address ever set since the last `clear_all`; `base` when empty.
    max_marked: AtomicUsize,
}

impl HeapBitmap {
    /// Creates an all-clear bitmap for `capacity` bytes starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not object aligned.
    #[must_use]
    pub fn new(name: impl Into<String>, base: usize, capacity: usize) -> Self {
        assert!(
            base % OBJECT_ALIGNMENT == 0,
            "HeapBitmap base must be object aligned"
        );
        let words = (0..capacity.div_ceil(BYTES_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            name: name.into(),
            base,
            capacity,
            words,
            max_marked: AtomicUsize::new(base),
        }
    }

    /// Name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First covered address.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Covered bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `addr` falls inside the covered range.
    #[inline]
    #[must_use]
    pub const fn has_address(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.capacity
    }

    /// Highest address set since the last [`clear_all`](Self::clear_all).
    #[must_use]
    pub fn max_marked_address(&self) -> Option<usize> {
        let max = self.max_marked.load(Ordering::Acquire);
        (max != self.base || self.test_addr(self.base)).then_some(max)
    }

    #[inline]
    fn locate(&self, addr: usize) -> (usize, u64) {
        assert!(
            self.has_address(addr),
            "address {addr:#x} out of range for bitmap {} [{:#x}, {:#x})",
            self.name,
            self.base,
            self.base + self.capacity
        );
        let bit = (addr - self.base) / OBJECT_ALIGNMENT;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    #[inline]
    fn test_addr(&self, addr: usize) -> bool {
        if !self.has_address(addr) {
            return false;
        }
        let (index, mask) = self.locate(addr);
        self.words[index].load(Ordering::Relaxed) & mask != 0
    }

    /// Sets the bit for `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the covered range.
    #[inline]
    pub fn set(&self, obj: ObjectRef) {
        let _ = self.atomic_test_and_set(obj);
    }

    /// Sets the bit for `obj` and returns whether it was already set.
    ///
    /// Concurrent callers racing on the same object see exactly one `false`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the covered range.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: ObjectRef) -> bool {
        let (index, mask) = self.locate(obj.addr());
        let word = &self.words[index];
        if word.load(Ordering::Relaxed) & mask != 0 {
            return true;
        }
        let prev = word.fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.max_marked.fetch_max(obj.addr(), Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    /// Clears the bit for `obj`. The max-marked bound is not lowered.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the covered range.
    #[inline]
    pub fn clear(&self, obj: ObjectRef) {
        let (index, mask) = self.locate(obj.addr());
        self.words[index].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Returns whether the bit for `obj` is set.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the covered range.
    #[inline]
    #[must_use]
    pub fn test(&self, obj: ObjectRef) -> bool {
        let (index, mask) = self.locate(obj.addr());
        self.words[index].load(Ordering::Acquire) & mask != 0
    }

    /// Clears every bit.
    pub fn clear_all(&self) {
        let used = self.word_index_bound(self.max_marked.load(Ordering::Acquire));
        for word in &self.words[..used] {
            word.store(0, Ordering::Relaxed);
        }
        self.max_marked.store(self.base, Ordering::Release);
    }

    /// Clears every bit in `[begin, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the bitmap.
    pub fn clear_range(&self, begin: usize, end: usize) {
        if begin >= end {
            return;
        }
        assert!(
            begin >= self.base && end <= self.base + self.capacity,
            "clear range [{begin:#x}, {end:#x}) out of range for bitmap {}",
            self.name
        );
        let first_bit = (begin - self.base) / OBJECT_ALIGNMENT;
        let last_bit = (end - self.base).div_ceil(OBJECT_ALIGNMENT);
        let mut bit = first_bit;
        while bit < last_bit {
            let index = bit / BITS_PER_WORD;
            let offset = bit % BITS_PER_WORD;
            let span = (BITS_PER_WORD - offset).min(last_bit - bit);
            if span == BITS_PER_WORD {
                self.words[index].store(0, Ordering::Relaxed);
            } else {
                let mask = ((1u64 << span) - 1) << offset;
                self.words[index].fetch_and(!mask, Ordering::Relaxed);
            }
            bit += span;
        }
    }

    /// Number of set bits. Linear in the marked prefix.
    #[must_use]
    pub fn count_marked(&self) -> usize {
        let used = self.word_index_bound(self.max_marked.load(Ordering::Acquire));
        self.words[..used]
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn word_index_bound(&self, max_addr: usize) -> usize {
        ((max_addr - self.base) / BYTES_PER_WORD + 1).min(self.words.len())
    }

    #[inline]
    const fn addr_of(&self, index: usize, bit: u32) -> usize {
        self.base + (index * BITS_PER_WORD + bit as usize) * OBJECT_ALIGNMENT
    }

    /// Visits every marked object in ascending address order.
    ///
    /// Each word is loaded once; bits set below the scan position during the
    /// walk are not visited, bits cleared above it are not reported.
    pub fn walk(&self, mut visitor: impl FnMut(ObjectRef)) {
        let Some(max) = self.max_marked_address() else {
            return;
        };
        self.visit_marked_range(self.base, max + OBJECT_ALIGNMENT, &mut visitor);
    }

    /// Visits marked objects whose address lies in `[begin, end)`.
    ///
    /// The range is clamped to the bitmap.
    pub fn visit_marked_range(&self, begin: usize, end: usize, mut visitor: impl FnMut(ObjectRef)) {
        let begin = begin.max(self.base);
        let end = end.min(self.base + self.capacity);
        if begin >= end {
            return;
        }
        let first_bit = (begin - self.base) / OBJECT_ALIGNMENT;
        let last_bit = (end - self.base).div_ceil(OBJECT_ALIGNMENT);
        let first_word = first_bit / BITS_PER_WORD;
        let last_word = last_bit.div_ceil(BITS_PER_WORD);

        for index in first_word..last_word {
            let mut bits = self.words[index].load(Ordering::Acquire);
            if index == first_word {
                bits &= u64::MAX << (first_bit % BITS_PER_WORD);
            }
            let tail = last_bit - index * BITS_PER_WORD;
            if tail < BITS_PER_WORD {
                bits &= (1u64 << tail) - 1;
            }
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                if let Some(obj) = ObjectRef::new(self.addr_of(index, bit)) {
                    visitor(obj);
                }
            }
        }
    }

    /// Reports every object in `[begin, end)` that is set in `live` but not in
    /// `mark`, in batches of at most [`SWEEP_BATCH`].
    ///
    /// Neither bitmap is modified.
    ///
    /// # Panics
    ///
    /// Panics if the bitmaps do not cover the same range.
    pub fn sweep_walk(
        live: &Self,
        mark: &Self,
        begin: usize,
        end: usize,
        mut callback: impl FnMut(&[ObjectRef]),
    ) {
        assert!(
            live.base == mark.base && live.capacity == mark.capacity,
            "sweep over mismatched bitmaps {} and {}",
            live.name,
            mark.name
        );
        let begin = begin.max(live.base);
        let end = end.min(live.base + live.capacity);
        if begin >= end {
            return;
        }
        let first_word = (begin - live.base) / BYTES_PER_WORD;
        let last_word = (end - live.base).div_ceil(BYTES_PER_WORD);

        let mut batch = Vec::with_capacity(SWEEP_BATCH);
        for index in first_word..last_word {
            let mut garbage = live.words[index].load(Ordering::Acquire)
                & !mark.words[index].load(Ordering::Acquire);
            while garbage != 0 {
                let bit = garbage.trailing_zeros();
                garbage &= garbage - 1;
                let addr = live.addr_of(index, bit);
                if addr < begin || addr >= end {
                    continue;
                }
                if let Some(obj) = ObjectRef::new(addr) {
                    batch.push(obj);
                }
                if batch.len() == SWEEP_BATCH {
                    callback(&batch);
                    batch.clear();
                }
            }
        }
        if !batch.is_empty() {
            callback(&batch);
        }
    }
}
