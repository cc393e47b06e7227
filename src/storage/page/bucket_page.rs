use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::common::types::PAGE_SIZE;
use crate::storage::page::codec::FixedCodec;

/// Number of key/value slots in one bucket page.
///
/// The page holds two bitmaps of one bit per slot followed by the slot
/// array, so the capacity solves `2 * ceil(B/8) + B * pair <= PAGE_SIZE`.
pub fn bucket_capacity<K: FixedCodec, V: FixedCodec>() -> usize {
    4 * PAGE_SIZE / (4 * (K::ENCODED_SIZE + V::ENCODED_SIZE) + 1)
}

/// Typed view over the raw bytes of a hash-table bucket page.
///
/// Layout: `occupied[ceil(B/8)] ++ readable[ceil(B/8)] ++ array[B]` with
/// bits packed MSB-first within each byte. A slot is *occupied* once it
/// has ever held a pair; the occupied bit is never cleared, so scans may
/// stop at the first non-occupied slot. A slot is *readable* while it
/// holds a live pair; removal clears only the readable bit, leaving a
/// tombstone.
///
/// Attach over `&page.data` under a read latch for lookups, or
/// `&mut page.data` under a write latch for mutation.
pub struct HashTableBucketPage<B, K, V> {
    data: B,
    _marker: PhantomData<(K, V)>,
}

impl<B, K, V> HashTableBucketPage<B, K, V>
where
    B: AsRef<[u8]>,
    K: FixedCodec,
    V: FixedCodec + PartialEq,
{
    pub fn attach(data: B) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    fn pair_size() -> usize {
        K::ENCODED_SIZE + V::ENCODED_SIZE
    }

    fn bitmap_len() -> usize {
        (bucket_capacity::<K, V>() + 7) / 8
    }

    fn slot_offset(slot: usize) -> usize {
        2 * Self::bitmap_len() + slot * Self::pair_size()
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        let byte = self.data.as_ref()[slot / 8];
        (byte >> (7 - slot % 8)) & 1 == 1
    }

    pub fn is_readable(&self, slot: usize) -> bool {
        let byte = self.data.as_ref()[Self::bitmap_len() + slot / 8];
        (byte >> (7 - slot % 8)) & 1 == 1
    }

    pub fn key_at(&self, slot: usize) -> K {
        let offset = Self::slot_offset(slot);
        K::decode_from(&self.data.as_ref()[offset..offset + K::ENCODED_SIZE])
    }

    pub fn value_at(&self, slot: usize) -> V {
        let offset = Self::slot_offset(slot) + K::ENCODED_SIZE;
        V::decode_from(&self.data.as_ref()[offset..offset + V::ENCODED_SIZE])
    }

    /// Append every readable value stored under `key` to `result`.
    /// Returns true iff at least one value was appended.
    pub fn get_value<C>(&self, key: &K, cmp: &C, result: &mut Vec<V>) -> bool
    where
        C: Fn(&K, &K) -> Ordering,
    {
        let before = result.len();
        for slot in 0..bucket_capacity::<K, V>() {
            if !self.is_occupied(slot) {
                break;
            }
            if self.is_readable(slot) && cmp(&self.key_at(slot), key) == Ordering::Equal {
                result.push(self.value_at(slot));
            }
        }
        result.len() > before
    }

    /// Number of live pairs in the bucket.
    pub fn num_readable(&self) -> usize {
        let mut count = 0;
        for slot in 0..bucket_capacity::<K, V>() {
            if !self.is_occupied(slot) {
                break;
            }
            if self.is_readable(slot) {
                count += 1;
            }
        }
        count
    }

    pub fn is_full(&self) -> bool {
        self.num_readable() == bucket_capacity::<K, V>()
    }

    pub fn is_empty(&self) -> bool {
        self.num_readable() == 0
    }
}

impl<B, K, V> HashTableBucketPage<B, K, V>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
    K: FixedCodec,
    V: FixedCodec + PartialEq,
{
    pub fn set_occupied(&mut self, slot: usize) {
        self.data.as_mut()[slot / 8] |= 1 << (7 - slot % 8);
    }

    pub fn set_readable(&mut self, slot: usize) {
        let bitmap_len = Self::bitmap_len();
        self.data.as_mut()[bitmap_len + slot / 8] |= 1 << (7 - slot % 8);
    }

    fn unset_readable(&mut self, slot: usize) {
        let bitmap_len = Self::bitmap_len();
        self.data.as_mut()[bitmap_len + slot / 8] &= !(1 << (7 - slot % 8));
    }

    fn write_pair(&mut self, slot: usize, key: &K, value: &V) {
        let offset = Self::slot_offset(slot);
        let data = self.data.as_mut();
        key.encode_into(&mut data[offset..offset + K::ENCODED_SIZE]);
        value.encode_into(
            &mut data[offset + K::ENCODED_SIZE..offset + K::ENCODED_SIZE + V::ENCODED_SIZE],
        );
    }

    /// Insert a pair into the lowest non-readable slot. Rejects an exact
    /// `(key, value)` duplicate; fails iff no slot is free.
    pub fn insert<C>(&mut self, key: &K, value: &V, cmp: &C) -> bool
    where
        C: Fn(&K, &K) -> Ordering,
    {
        let mut free_slot = None;

        for slot in 0..bucket_capacity::<K, V>() {
            if !self.is_occupied(slot) {
                // No pair has ever lived at or past this slot.
                if free_slot.is_none() {
                    free_slot = Some(slot);
                }
                break;
            }
            if self.is_readable(slot) {
                if cmp(&self.key_at(slot), key) == Ordering::Equal && self.value_at(slot) == *value
                {
                    return false;
                }
            } else if free_slot.is_none() {
                free_slot = Some(slot);
            }
        }

        let slot = match free_slot {
            Some(slot) => slot,
            None => return false,
        };

        self.write_pair(slot, key, value);
        self.set_occupied(slot);
        self.set_readable(slot);
        true
    }

    /// Remove the pair matching both key and value, if present.
    pub fn remove<C>(&mut self, key: &K, value: &V, cmp: &C) -> bool
    where
        C: Fn(&K, &K) -> Ordering,
    {
        for slot in 0..bucket_capacity::<K, V>() {
            if !self.is_occupied(slot) {
                break;
            }
            if self.is_readable(slot)
                && cmp(&self.key_at(slot), key) == Ordering::Equal
                && self.value_at(slot) == *value
            {
                self.unset_readable(slot);
                return true;
            }
        }
        false
    }

    /// Clear the readable bit of a slot, leaving its occupied bit set.
    pub fn remove_at(&mut self, slot: usize) {
        if self.is_readable(slot) {
            self.unset_readable(slot);
        }
    }
}
