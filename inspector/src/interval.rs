use std::collections::BTreeMap;

use crate::address::{Address, MemoryRange};
use crate::error::InspectorError;

/// Non-overlapping memory ranges, each with an owner, ordered by start.
#[derive(Debug)]
pub struct IntervalIndex<T> {
    entries: BTreeMap<Address, (MemoryRange, T)>,
}

impl<T> Default for IntervalIndex<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> IntervalIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `range` owned by `owner`.
    ///
    /// Overlapping an existing range is a consistency violation; the index
    /// is left unchanged. Empty ranges own no addresses and are not stored.
    pub fn add(&mut self, range: MemoryRange, owner: T) -> Result<(), InspectorError> {
        if range.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.conflict(&range) {
            log::error!("memory range {range:?} overlaps registered {existing:?}");
            return Err(InspectorError::Overlap {
                existing,
                new: range,
            });
        }
        self.entries.insert(range.start, (range, owner));
        Ok(())
    }

    fn conflict(&self, range: &MemoryRange) -> Option<MemoryRange> {
        if let Some((existing, _)) = self.entries.get(&range.start) {
            return Some(*existing);
        }
        let before = self.entries.range(..range.start).next_back();
        let after = self.entries.range(range.start..).next();
        before
            .into_iter()
            .chain(after)
            .map(|(_, (existing, _))| *existing)
            .find(|existing| existing.overlaps(range))
    }

    /// The unique range containing `address`.
    pub fn find(&self, address: Address) -> Option<(MemoryRange, &T)> {
        let (_, (range, owner)) = self.entries.range(..=address).next_back()?;
        range.contains(address).then_some((*range, owner))
    }

    /// Remove the range starting exactly at `start`.
    pub fn remove(&mut self, start: Address) -> Option<(MemoryRange, T)> {
        self.entries.remove(&start)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemoryRange, &T)> {
        self.entries.values().map(|(range, owner)| (*range, owner))
    }
}
