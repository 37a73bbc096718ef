//! Sparse slot container backing anonymous memory maps.
//!
//! Three parallel arrays of equal capacity are kept:
//!
//! - `slot`: slot index to used index
//! - `bckptr`: used index to slot index
//! - `values`: slot index to value
//!
//! The first `nused` entries of `bckptr` name exactly the occupied slots, which makes insertion,
//! removal and lookup O(1) while iteration only visits occupied slots. Capacity starts at one
//! and doubles whenever a slot past the end is addressed.

use alloc::vec::Vec;

use super::Enomem;

/// Marker for "no used index" and "no slot".
pub const SLOT_EMPTY: usize = usize::MAX;

/// How [`SlotMap::remove`] compacts the used index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RemovePolicy {
    /// Move the last used entry into the hole and repoint its slot at the new position.
    #[default]
    Compact,
    /// Move the last used entry into the hole but leave its slot pointing at the old position.
    /// The moved slot's forward pointer goes stale, which [`SlotMap::check`] reports.
    Literal,
}

/// First inconsistency found by [`SlotMap::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotError {
    /// An occupied slot whose used index does not point back at it.
    BrokenForward { slot: usize, index: usize },
    /// A used index whose back pointer does not name an occupied slot.
    BrokenBackward { index: usize, slot: usize },
    /// The number of occupied slots differs from the used count.
    CountMismatch { occupied: usize, nused: usize },
}

#[derive(Debug)]
pub struct SlotMap<T> {
    slot: Vec<usize>,
    bckptr: Vec<usize>,
    values: Vec<Option<T>>,
    nused: usize,
    policy: RemovePolicy,
}

impl<T> SlotMap<T> {
    pub const fn new(policy: RemovePolicy) -> Self {
        Self {
            slot: Vec::new(),
            bckptr: Vec::new(),
            values: Vec::new(),
            nused: 0,
            policy,
        }
    }

    pub fn policy(&self) -> RemovePolicy {
        self.policy
    }
    pub fn capacity(&self) -> usize {
        self.values.len()
    }
    pub fn len(&self) -> usize {
        self.nused
    }
    pub fn is_empty(&self) -> bool {
        self.nused == 0
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.values.get(slot)?.as_ref()
    }

    /// Grows all three arrays so that `slot` is addressable. New entries start out empty.
    fn extend(&mut self, slot: usize) -> Result<(), Enomem> {
        let mut capacity = self.capacity().max(1);
        while capacity < slot + 1 {
            capacity *= 2;
        }
        let additional = capacity - self.capacity();
        if additional == 0 {
            return Ok(());
        }

        self.slot.try_reserve_exact(additional).map_err(|_| Enomem)?;
        self.bckptr.try_reserve_exact(additional).map_err(|_| Enomem)?;
        self.values.try_reserve_exact(additional).map_err(|_| Enomem)?;

        self.slot.resize(capacity, SLOT_EMPTY);
        self.bckptr.resize(capacity, SLOT_EMPTY);
        self.values.resize_with(capacity, || None);
        Ok(())
    }

    /// Stores `value` at `slot`, growing if needed. The slot must be free.
    pub fn insert(&mut self, slot: usize, value: T) -> Result<(), Enomem> {
        if slot >= self.capacity() {
            self.extend(slot)?;
        }
        assert!(self.values[slot].is_none(), "slot {} is already occupied", slot);

        self.values[slot] = Some(value);
        self.slot[slot] = self.nused;
        self.bckptr[self.nused] = slot;
        self.nused += 1;
        Ok(())
    }

    /// Takes the value out of `slot`, which must be occupied.
    pub fn remove(&mut self, slot: usize) -> T {
        let value = self
            .values
            .get_mut(slot)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("slot {} is not occupied", slot));

        let index = self.slot[slot];
        self.slot[slot] = SLOT_EMPTY;
        self.bckptr[index] = SLOT_EMPTY;

        let last = self.nused - 1;
        self.bckptr.swap(index, last);
        if self.policy == RemovePolicy::Compact && index != last {
            let moved = self.bckptr[index];
            self.slot[moved] = index;
        }
        self.nused -= 1;

        value
    }

    /// Replaces the value in an occupied slot, keeping its position in the used index.
    pub fn replace(&mut self, slot: usize, value: T) -> T {
        let entry = self
            .values
            .get_mut(slot)
            .filter(|v| v.is_some())
            .unwrap_or_else(|| panic!("slot {} is not occupied", slot));
        entry.replace(value).unwrap_or_else(|| unreachable!())
    }

    /// Occupied slots with their values, in used-index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.bckptr[..self.nused]
            .iter()
            .filter_map(move |&slot| Some((slot, self.values.get(slot)?.as_ref()?)))
    }

    /// Occupied slot indices in `range`, ascending.
    pub fn occupied_in(&self, range: core::ops::Range<usize>) -> Vec<usize> {
        let end = range.end.min(self.capacity());
        (range.start.min(end)..end)
            .filter(|&slot| self.values[slot].is_some())
            .collect()
    }

    /// Verifies that forward and back pointers agree.
    pub fn check(&self) -> Result<(), SlotError> {
        let mut occupied = 0;
        for (slot, value) in self.values.iter().enumerate() {
            if value.is_none() {
                continue;
            }
            occupied += 1;
            let index = self.slot[slot];
            if index >= self.nused || self.bckptr[index] != slot {
                return Err(SlotError::BrokenForward { slot, index });
            }
        }
        for index in 0..self.nused {
            let slot = self.bckptr[index];
            if self.values.get(slot).map_or(true, Option::is_none) {
                return Err(SlotError::BrokenBackward { index, slot });
            }
        }
        if occupied != self.nused {
            return Err(SlotError::CountMismatch {
                occupied,
                nused: self.nused,
            });
        }
        Ok(())
    }
}
