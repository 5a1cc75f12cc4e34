//! The contiguous address range treated as always live during a cycle.

/// `[begin, end)` of all bound immune spaces; empty when `begin == end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImmuneRegion {
    begin: usize,
    end: usize,
}

impl ImmuneRegion {
    /// An empty region.
    #[must_use]
    pub const fn new() -> Self {
        Self { begin: 0, end: 0 }
    }

    /// Extends the region with `[begin, end)`.
    ///
    /// Returns `false` when the space is not adjacent to the current region,
    /// since the region must stay one interval.
    pub fn add_space(&mut self, begin: usize, end: usize) -> bool {
        if self.is_empty() {
            self.begin = begin;
            self.end = end;
            return true;
        }
        if end == self.begin {
            self.begin = begin;
            true
        } else if begin == self.end {
            self.end = end;
            true
        } else {
            false
        }
    }

    /// Whether `addr` is immune.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Whether no space is bound.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// First immune address.
    #[must_use]
    pub const fn begin(&self) -> usize {
        self.begin
    }

    /// One past the last immune address.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Unbinds every space.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
