//! Id Registries
//!
//! Kernel tables (threads, processes, locks) hand out ids instead of
//! pointers. An id packs a slot index and the slot's generation:
//!
//! ```text
//!  31              16 15               0
//! ┌──────────────────┬──────────────────┐
//! │    generation    │    slot index    │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! Removing an entry bumps the slot generation, so an id kept after its
//! object died never resolves to whatever reuses the slot.

use crate::{KernelError, KernelResult};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::marker::PhantomData;

/// Bits of an id used for the slot index
pub const INDEX_BITS: u32 = 16;

/// Largest capacity a table can have
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Typed id stored in an [`IdTable`]
pub trait TableKey: Copy + Eq {
    /// Build from a raw id
    fn from_raw(raw: u32) -> Self;
    /// Raw id
    fn raw(self) -> u32;
}

/// Declare a `u32` id newtype usable as a table key
#[macro_export]
macro_rules! table_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// Get raw value
            pub const fn value(&self) -> u32 {
                self.0
            }
        }

        impl $crate::table::TableKey for $name {
            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            fn raw(self) -> u32 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Generational id → value registry
#[derive(Debug)]
pub struct IdTable<K, T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
    len: usize,
    capacity: usize,
    _key: PhantomData<K>,
}

impl<K: TableKey, T> IdTable<K, T> {
    /// Create empty table holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            len: 0,
            capacity: capacity.min(MAX_SLOTS),
            _key: PhantomData,
        }
    }

    fn split(key: K) -> (usize, u16) {
        let raw = key.raw();
        ((raw & INDEX_MASK) as usize, (raw >> INDEX_BITS) as u16)
    }

    fn join(index: usize, generation: u16) -> K {
        K::from_raw(((generation as u32) << INDEX_BITS) | index as u32)
    }

    /// Insert a value, returning its id
    pub fn insert(&mut self, value: T) -> KernelResult<K> {
        self.insert_with(|_| Ok(value))
    }

    /// Insert a value built from its future id
    ///
    /// If `build` fails nothing is inserted and the slot stays free.
    pub fn insert_with<F>(&mut self, build: F) -> KernelResult<K>
    where
        F: FnOnce(K) -> KernelResult<T>,
    {
        if self.len >= self.capacity {
            return Err(KernelError::TableFull);
        }

        // Fresh slots first, recycled slots once the table has grown to capacity
        let index = if self.slots.len() < self.capacity {
            self.slots.try_reserve(1).map_err(|_| KernelError::OutOfMemory)?;
            self.slots.push(Slot { generation: 0, value: None });
            self.slots.len() - 1
        } else {
            match self.free.pop_front() {
                Some(index) => index as usize,
                None => return Err(KernelError::TableFull),
            }
        };

        let key = Self::join(index, self.slots[index].generation);
        match build(key) {
            Ok(value) => {
                self.slots[index].value = Some(value);
                self.len += 1;
                Ok(key)
            }
            Err(err) => {
                self.release_slot(index);
                Err(err)
            }
        }
    }

    fn release_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index as u32);
    }

    /// Look up an entry
    pub fn get(&self, key: K) -> Option<&T> {
        let (index, generation) = Self::split(key);
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Look up an entry mutably
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let (index, generation) = Self::split(key);
        self.slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Look up two distinct entries mutably
    pub fn get_pair_mut(&mut self, a: K, b: K) -> Option<(&mut T, &mut T)> {
        let (ia, ga) = Self::split(a);
        let (ib, gb) = Self::split(b);
        if ia == ib || ia.max(ib) >= self.slots.len() {
            return None;
        }

        let (left, right) = self.slots.split_at_mut(ia.max(ib));
        let (low, high) = (&mut left[ia.min(ib)], &mut right[0]);
        let (sa, sb) = if ia < ib { (low, high) } else { (high, low) };
        if sa.generation != ga || sb.generation != gb {
            return None;
        }
        Some((sa.value.as_mut()?, sb.value.as_mut()?))
    }

    /// Check whether an id is live
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry; its id becomes stale
    pub fn remove(&mut self, key: K) -> Option<T> {
        let (index, generation) = Self::split(key);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        self.len -= 1;
        self.release_slot(index);
        Some(value)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if table is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live entries
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| (Self::join(index, slot.generation), value))
        })
    }

    /// Iterate mutably over live entries
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|value| (Self::join(index, generation), value))
        })
    }

    /// Remove every entry, returning them
    pub fn drain(&mut self) -> Vec<(K, T)> {
        let mut out = Vec::with_capacity(self.len);
        for index in 0..self.slots.len() {
            let generation = self.slots[index].generation;
            if let Some(value) = self.slots[index].value.take() {
                out.push((Self::join(index, generation), value));
                self.release_slot(index);
            }
        }
        self.len = 0;
        out
    }

    /// Copy the table, keeping every id valid in the copy
    pub fn try_clone_with<F>(&self, mut copy: F) -> KernelResult<Self>
    where
        F: FnMut(K, &T) -> KernelResult<T>,
    {
        let mut slots = Vec::new();
        slots.try_reserve(self.slots.len()).map_err(|_| KernelError::OutOfMemory)?;

        for (index, slot) in self.slots.iter().enumerate() {
            let value = match &slot.value {
                Some(value) => Some(copy(Self::join(index, slot.generation), value)?),
                None => None,
            };
            slots.push(Slot { generation: slot.generation, value });
        }

        Ok(Self {
            slots,
            free: self.free.clone(),
            len: self.len,
            capacity: self.capacity,
            _key: PhantomData,
        })
    }
}
