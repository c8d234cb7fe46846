// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity bitset over hardware context ids.

extern crate alloc;

use alloc::{vec, vec::Vec};

const WORD_BITS: usize = u64::BITS as usize;

/// In-use set for one context-id namespace.
///
/// Capacity is fixed at construction and equals the hardware limit (e.g. 65536,
/// 256, 16). Only `test`, `set`, `clear` and `find_first_clear` are exposed.
#[derive(Clone, Debug)]
pub struct ContextBitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl ContextBitmap {
    pub fn new(capacity: usize) -> Self {
        Self { words: vec![0; capacity.div_ceil(WORD_BITS)], capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn test(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Marks `index` in use; returns whether it was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        let mask = 1 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Marks `index` free; returns whether it was previously set.
    pub fn clear(&mut self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        let mask = 1 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    /// First clear index in `[from, capacity)`, then wrapping to `[floor, from)`.
    ///
    /// Indices below `floor` are never returned.
    pub fn find_first_clear(&self, from: usize, floor: usize) -> Option<usize> {
        if floor >= self.capacity {
            return None;
        }
        let from = from.clamp(floor, self.capacity);
        self.scan(from, self.capacity).or_else(|| self.scan(floor, from))
    }

    /// Number of set bits at or above `floor`.
    pub fn count_from(&self, floor: usize) -> usize {
        (floor..self.capacity).filter(|&i| self.test(i)).count()
    }

    fn scan(&self, start: usize, end: usize) -> Option<usize> {
        let mut index = start;
        while index < end {
            let word = self.words[index / WORD_BITS];
            let offset = index % WORD_BITS;
            // Treat bits below `offset` as occupied.
            let free = !word & (u64::MAX << offset);
            if free != 0 {
                let hit = (index - offset) + free.trailing_zeros() as usize;
                return (hit < end).then_some(hit);
            }
            index = index - offset + WORD_BITS;
        }
        None
    }
}
