use std::fmt;

/// A machine word naming a location in the target process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn plus(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset as u64))
    }

    /// Byte distance from `base` to `self`, if `self` is not below `base`.
    #[inline]
    pub fn offset_from(self, base: Address) -> Option<usize> {
        self.0
            .checked_sub(base.0)
            .and_then(|delta| usize::try_from(delta).ok())
    }
}

impl From<u64> for Address {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A half-open range `[start, start + length)` of target memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryRange {
    pub start: Address,
    pub length: usize,
}

impl MemoryRange {
    pub const EMPTY: Self = Self {
        start: Address::ZERO,
        length: 0,
    };

    pub const fn new(start: Address, length: usize) -> Self {
        Self { start, length }
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.start.plus(self.length)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end()
    }

    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.start < other.end() && other.start < self.end()
    }

    /// `other` lies entirely inside `self`.
    pub fn encloses(&self, other: &MemoryRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end())
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, length: usize) -> MemoryRange {
        MemoryRange::new(Address::new(start), length)
    }

    #[test]
    fn range_bounds_are_half_open() {
        let r = range(0x1000, 0x10);
        assert!(r.contains(Address::new(0x1000)));
        assert!(r.contains(Address::new(0x100f)));
        assert!(!r.contains(Address::new(0x1010)));
        assert!(!r.contains(Address::new(0xfff)));
    }

    #[test]
    fn overlap_ignores_touching_and_empty_ranges() {
        assert!(range(0x1000, 0x10).overlaps(&range(0x100f, 1)));
        assert!(!range(0x1000, 0x10).overlaps(&range(0x1010, 0x10)));
        assert!(!range(0x1000, 0x10).overlaps(&range(0x1008, 0)));
    }

    #[test]
    fn offsets_are_checked() {
        let base = Address::new(0x2000);
        assert_eq!(Address::new(0x2010).offset_from(base), Some(0x10));
        assert_eq!(Address::new(0x1ff0).offset_from(base), None);
        assert!(range(0x2000, 0x100).encloses(&range(0x2080, 0x80)));
        assert!(!range(0x2000, 0x100).encloses(&range(0x2080, 0x81)));
    }
}
