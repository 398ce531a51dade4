//! A probabilistic multi-set for estimating the popularity of an element
//! within a time window. The maximum frequency of an element is 15 (4 bits)
//! and an aging process periodically halves the popularity of all elements.
//!
//! The counter matrix is a single dimensional array holding 16 counters per
//! slot. A fixed depth of four balances accuracy and cost. The array's
//! length equals the maximum number of entries in the cache, increased to
//! the closest power of two for cheap bit masking. This configuration
//! results in a confidence of 93.75% and an error bound of e / width.
//!
//! The frequency of all entries is aged periodically using a sampling
//! window based on the maximum number of entries in the cache. The O(n)
//! cost of aging is amortized and uses inexpensive bit manipulations per
//! array location.

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hasher},
};

pub(crate) struct FrequencySketch {
    sample_size: u32,
    table_mask: u64,
    table: Box<[u64]>,
    size: u32,
    /// Random nonzero seed mixed into every hash, so an attacker cannot
    /// construct keys that collide in the sketch of another process.
    seed: u64,
}

// A mixture of seeds from FNV-1a, CityHash, and Murmur3.
static SEED: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

static RESET_MASK: u64 = 0x7777_7777_7777_7777;

static ONE_MASK: u64 = 0x1111_1111_1111_1111;

const SPREAD_C: u64 = 0x45d9_f3b;

fn random_nonzero_seed() -> u64 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(0x9e37_79b9_7f4a_7c15);
    hasher.finish() | 1
}

impl Default for FrequencySketch {
    fn default() -> Self {
        Self {
            sample_size: 0,
            table_mask: 0,
            table: Box::default(),
            size: 0,
            seed: random_nonzero_seed(),
        }
    }
}

impl FrequencySketch {
    /// Initializes and increases the capacity of the sketch, if necessary,
    /// so it can accurately estimate the popularity of elements given the
    /// maximum size of the cache. Resizing forgets all previous counts.
    pub(crate) fn ensure_capacity(&mut self, cap: u32) {
        // The max byte size of the table, Box<[u64; table_size]>
        //
        // | Pointer width    | Max size |
        // |:-----------------|---------:|
        // | 16 bit           |    8 KiB |
        // | 32 bit           |  128 MiB |
        // | 64 bit or bigger |    8 GiB |

        let maximum = if cfg!(target_pointer_width = "16") {
            cap.min(1024)
        } else if cfg!(target_pointer_width = "32") {
            cap.min(2u32.pow(24))
        } else {
            cap.min(2u32.pow(30))
        };
        let table_size = if maximum == 0 {
            1
        } else {
            maximum.next_power_of_two()
        };

        if self.table.len() as u32 >= table_size {
            return;
        }

        self.table = vec![0; table_size as usize].into_boxed_slice();
        self.table_mask = table_size.max(1) as u64 - 1;
        self.sample_size = if cap == 0 {
            10
        } else {
            maximum.saturating_mul(10).min(i32::MAX as u32)
        };
        self.size = 0;
    }

    pub(crate) fn is_initialized(&self) -> bool {
        !self.table.is_empty()
    }

    /// Returns the estimated number of occurrences of the element with the
    /// given hash, up to the maximum (15).
    pub(crate) fn frequency(&self, hash: u64) -> u8 {
        if self.table.is_empty() {
            return 0;
        }

        let hash = self.spread(hash);
        let start = ((hash & 3) << 2) as u8;
        let mut frequency = u8::MAX;
        for i in 0..4 {
            let index = self.index_of(hash, i);
            let count = (self.table[index] >> ((start + i) << 2) & 0xF) as u8;
            frequency = frequency.min(count);
        }
        frequency
    }

    /// Increments the popularity of the element with the given hash, unless
    /// it is already at the maximum (15). The popularity of all elements is
    /// periodically down sampled when the observed events exceed a
    /// threshold, so that stale long-term entries fade away.
    pub(crate) fn increment(&mut self, hash: u64) {
        if self.table.is_empty() {
            return;
        }

        let hash = self.spread(hash);
        let start = ((hash & 3) << 2) as u8;
        let mut added = false;
        for i in 0..4 {
            let index = self.index_of(hash, i);
            added |= self.increment_at(index, start + i);
        }

        if added {
            self.size += 1;
            if self.size >= self.sample_size {
                self.reset();
            }
        }
    }

    /// Increments the counter at the 4-bit offset in the table slot, unless
    /// it is already at the maximum. Returns `true` if incremented.
    fn increment_at(&mut self, table_index: usize, counter_index: u8) -> bool {
        let offset = (counter_index as usize) << 2;
        let mask = 0xF_u64 << offset;
        if self.table[table_index] & mask != mask {
            self.table[table_index] += 1u64 << offset;
            true
        } else {
            false
        }
    }

    /// Halves every counter and adjusts the sample count by the number of
    /// odd counters that lost their low bit.
    fn reset(&mut self) {
        let mut count = 0u32;
        for entry in self.table.iter_mut() {
            count += (*entry & ONE_MASK).count_ones();
            *entry = (*entry >> 1) & RESET_MASK;
        }
        self.size = (self.size >> 1) - (count >> 2);
    }

    /// Applies a supplemental hash so that flat user hashes still spread
    /// over the table, folding in the per-instance seed.
    fn spread(&self, hash: u64) -> u64 {
        let mut x = hash ^ self.seed;
        x = ((x >> 16) ^ x).wrapping_mul(SPREAD_C);
        x = ((x >> 16) ^ x).wrapping_mul(SPREAD_C);
        (x >> 16) ^ x
    }

    /// Returns the table index for the counter at the given depth.
    fn index_of(&self, hash: u64, depth: u8) -> usize {
        let mut hash = SEED[depth as usize].wrapping_mul(hash);
        hash = hash.wrapping_add(hash >> 32);
        (hash & self.table_mask) as usize
    }
}
