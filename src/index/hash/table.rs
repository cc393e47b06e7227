use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use log::debug;
use parking_lot::RwLock;

use crate::common::types::PageId;
use crate::index::hash::error::HashIndexError;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{
    bucket_capacity, FixedCodec, HashTableBucketPage, HashTableDirectoryPage, DIRECTORY_MAX_DEPTH,
};

/// What the state found under the table write latch asks for next.
enum SplitStep {
    Done(bool),
    DoubleDirectory,
    SplitBucket,
}

/// Disk-backed extendible hash table.
///
/// The directory and every bucket are pages owned by the buffer pool;
/// the table itself holds only the directory's page id. A table-level
/// reader-writer latch orders structural changes (directory doubling,
/// bucket splits and merges) against plain lookups; each accessed page
/// is additionally protected by its own page latch, always acquired
/// after the table latch.
pub struct ExtendibleHashTable<K, V, C> {
    buffer_pool: Arc<BufferPoolManager>,
    directory_page_id: PageId,
    table_latch: RwLock<()>,
    comparator: C,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> ExtendibleHashTable<K, V, C>
where
    K: FixedCodec + Hash,
    V: FixedCodec + PartialEq,
    C: Fn(&K, &K) -> Ordering,
{
    /// Create an empty table: a directory at global depth zero pointing
    /// at one bucket with local depth zero.
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: C,
    ) -> Result<Self, HashIndexError> {
        let (directory_page, directory_page_id) = buffer_pool.new_page()?;
        let (_bucket_page, bucket_page_id) = buffer_pool.new_page()?;

        // A freshly zeroed page is already a valid empty bucket; only the
        // directory needs its fields written.
        {
            let mut dir_guard = directory_page.write();
            let mut directory = HashTableDirectoryPage::attach(&mut dir_guard.data);
            directory.set_page_id(directory_page_id);
            directory.set_bucket_page_id(0, bucket_page_id);
            directory.set_local_depth(0, 0);
        }

        buffer_pool.unpin_page(directory_page_id, true);
        buffer_pool.unpin_page(bucket_page_id, true);

        Ok(Self {
            buffer_pool,
            directory_page_id,
            table_latch: RwLock::new(()),
            comparator,
            _marker: PhantomData,
        })
    }

    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    fn hash(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }

    /// Resolve a key to its directory slot and bucket page id, together
    /// with the slot's local depth and the current global depth.
    fn locate_bucket(&self, key: &K) -> Result<(usize, PageId, u32, u32), HashIndexError> {
        let directory_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let located = {
            let dir_guard = directory_page.read();
            let directory = HashTableDirectoryPage::attach(&dir_guard.data);
            let bucket_idx = (self.hash(key) & directory.global_depth_mask()) as usize;
            (
                bucket_idx,
                directory.bucket_page_id(bucket_idx),
                directory.local_depth(bucket_idx),
                directory.global_depth(),
            )
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false);
        Ok(located)
    }

    /// Collect every value stored under `key`.
    pub fn get_value(&self, key: &K) -> Result<Vec<V>, HashIndexError> {
        let _table = self.table_latch.read();

        let (_, bucket_page_id, _, _) = self.locate_bucket(key)?;
        let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;

        let mut result = Vec::new();
        {
            let bucket_guard = bucket_page.read();
            let bucket = HashTableBucketPage::<_, K, V>::attach(&bucket_guard.data);
            bucket.get_value(key, &self.comparator, &mut result);
        }
        self.buffer_pool.unpin_page(bucket_page_id, false);

        Ok(result)
    }

    /// Insert a `(key, value)` pair. Returns false when the exact pair is
    /// already present, or when the table cannot grow any further.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool, HashIndexError> {
        // Optimistic fast path: no structural change needed.
        {
            let _table = self.table_latch.read();

            let (_, bucket_page_id, _, _) = self.locate_bucket(key)?;
            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
            let mut bucket_guard = bucket_page.write();
            let mut bucket = HashTableBucketPage::<_, K, V>::attach(&mut bucket_guard.data);

            if !bucket.is_full() {
                let inserted = bucket.insert(key, value, &self.comparator);
                drop(bucket_guard);
                self.buffer_pool.unpin_page(bucket_page_id, inserted);
                return Ok(inserted);
            }

            drop(bucket_guard);
            self.buffer_pool.unpin_page(bucket_page_id, false);
        }

        // The bucket was full: retry as a structural change. Fullness is
        // rechecked under the write latch, since it may have changed
        // between latches.
        let _table = self.table_latch.write();
        self.split_insert(key, value)
    }

    /// Insert while allowed to mutate the directory. Caller holds the
    /// table write latch.
    fn split_insert(&self, key: &K, value: &V) -> Result<bool, HashIndexError> {
        loop {
            let directory_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let mut dir_guard = directory_page.write();

            let (bucket_idx, bucket_page_id, local_depth, global_depth) = {
                let directory = HashTableDirectoryPage::attach(&dir_guard.data);
                let bucket_idx = (self.hash(key) & directory.global_depth_mask()) as usize;
                (
                    bucket_idx,
                    directory.bucket_page_id(bucket_idx),
                    directory.local_depth(bucket_idx),
                    directory.global_depth(),
                )
            };

            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
            let mut bucket_guard = bucket_page.write();

            let step = {
                let mut bucket = HashTableBucketPage::<_, K, V>::attach(&mut bucket_guard.data);
                if !bucket.is_full() {
                    SplitStep::Done(bucket.insert(key, value, &self.comparator))
                } else {
                    // A full bucket may already contain the pair; that is a
                    // rejection, not a reason to split.
                    let mut existing = Vec::new();
                    bucket.get_value(key, &self.comparator, &mut existing);
                    if existing.contains(value) {
                        SplitStep::Done(false)
                    } else if local_depth == global_depth {
                        SplitStep::DoubleDirectory
                    } else {
                        SplitStep::SplitBucket
                    }
                }
            };

            match step {
                SplitStep::Done(inserted) => {
                    drop(bucket_guard);
                    self.buffer_pool.unpin_page(bucket_page_id, inserted);
                    drop(dir_guard);
                    self.buffer_pool.unpin_page(self.directory_page_id, false);
                    return Ok(inserted);
                }
                SplitStep::DoubleDirectory => {
                    if global_depth >= DIRECTORY_MAX_DEPTH {
                        // The table cannot grow; a full bucket at maximum
                        // depth makes the insert fail, not panic.
                        drop(bucket_guard);
                        self.buffer_pool.unpin_page(bucket_page_id, false);
                        drop(dir_guard);
                        self.buffer_pool.unpin_page(self.directory_page_id, false);
                        return Ok(false);
                    }

                    let mut directory = HashTableDirectoryPage::attach(&mut dir_guard.data);
                    let size = directory.size();
                    for idx in 0..size {
                        let mirror = idx | (1 << global_depth);
                        directory.set_bucket_page_id(mirror, directory.bucket_page_id(idx));
                        directory.set_local_depth(mirror, directory.local_depth(idx));
                    }
                    directory.incr_global_depth();
                    debug!("doubled directory to global depth {}", global_depth + 1);

                    drop(bucket_guard);
                    self.buffer_pool.unpin_page(bucket_page_id, false);
                    drop(dir_guard);
                    self.buffer_pool.unpin_page(self.directory_page_id, true);
                }
                SplitStep::SplitBucket => {
                    let (new_page, new_page_id) = self.buffer_pool.new_page()?;
                    let mut new_guard = new_page.write();

                    let new_depth = local_depth + 1;
                    let new_mask = (1u32 << new_depth) - 1;
                    let old_id = bucket_idx & ((1 << local_depth) - 1);
                    let new_id = old_id | (1 << local_depth);

                    // Repoint every slot that resolves to either half and
                    // raise its depth.
                    let mut directory = HashTableDirectoryPage::attach(&mut dir_guard.data);
                    for idx in 0..directory.size() {
                        if idx as u32 & new_mask == old_id as u32 {
                            directory.set_local_depth(idx, new_depth);
                        } else if idx as u32 & new_mask == new_id as u32 {
                            directory.set_local_depth(idx, new_depth);
                            directory.set_bucket_page_id(idx, new_page_id);
                        }
                    }

                    // Rehash the live entries that now belong to the new
                    // half.
                    let mut old_bucket =
                        HashTableBucketPage::<_, K, V>::attach(&mut bucket_guard.data);
                    let mut new_bucket = HashTableBucketPage::<_, K, V>::attach(&mut new_guard.data);
                    for slot in 0..bucket_capacity::<K, V>() {
                        if !old_bucket.is_occupied(slot) {
                            break;
                        }
                        if !old_bucket.is_readable(slot) {
                            continue;
                        }
                        let slot_key = old_bucket.key_at(slot);
                        if self.hash(&slot_key) & new_mask == new_id as u32 {
                            let slot_value = old_bucket.value_at(slot);
                            new_bucket.insert(&slot_key, &slot_value, &self.comparator);
                            old_bucket.remove_at(slot);
                        }
                    }
                    debug!(
                        "split bucket page {} into {} at local depth {}",
                        bucket_page_id, new_page_id, new_depth
                    );

                    drop(new_guard);
                    self.buffer_pool.unpin_page(new_page_id, true);
                    drop(bucket_guard);
                    self.buffer_pool.unpin_page(bucket_page_id, true);
                    drop(dir_guard);
                    self.buffer_pool.unpin_page(self.directory_page_id, true);
                }
            }
        }
    }

    /// Remove a `(key, value)` pair. A successful removal from a bucket
    /// with positive local depth attempts to coalesce it with its split
    /// image.
    pub fn remove(&self, key: &K, value: &V) -> Result<bool, HashIndexError> {
        let (removed, local_depth) = {
            let _table = self.table_latch.read();

            let (_, bucket_page_id, local_depth, _) = self.locate_bucket(key)?;
            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
            let mut bucket_guard = bucket_page.write();
            let mut bucket = HashTableBucketPage::<_, K, V>::attach(&mut bucket_guard.data);

            let removed = bucket.remove(key, value, &self.comparator);
            drop(bucket_guard);
            self.buffer_pool.unpin_page(bucket_page_id, removed);

            (removed, local_depth)
        };

        if removed && local_depth > 0 {
            let _table = self.table_latch.write();
            self.merge(key)?;
        }

        Ok(removed)
    }

    /// Coalesce the bucket a key resolves to with its split image when at
    /// least one of the two is empty, then shrink the directory as far as
    /// it will go. Idempotent; every precondition is rechecked because
    /// the table latch was reacquired. Caller holds the table write
    /// latch. Loops because a merge can enable another at the surviving
    /// bucket's smaller depth.
    fn merge(&self, key: &K) -> Result<(), HashIndexError> {
        loop {
            let directory_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let mut dir_guard = directory_page.write();

            let candidate = {
                let directory = HashTableDirectoryPage::attach(&dir_guard.data);
                if directory.global_depth() == 0 {
                    None
                } else {
                    let bucket_idx = (self.hash(key) & directory.global_depth_mask()) as usize;
                    let local_depth = directory.local_depth(bucket_idx);
                    if local_depth == 0 {
                        None
                    } else {
                        let image_idx = directory.split_image_index(bucket_idx);
                        if directory.local_depth(image_idx) != local_depth {
                            // Uneven prior split; nothing to coalesce here.
                            None
                        } else {
                            Some((
                                bucket_idx,
                                directory.bucket_page_id(bucket_idx),
                                directory.bucket_page_id(image_idx),
                                local_depth,
                            ))
                        }
                    }
                }
            };

            let Some((bucket_idx, bucket_page_id, image_page_id, local_depth)) = candidate else {
                drop(dir_guard);
                self.buffer_pool.unpin_page(self.directory_page_id, false);
                return Ok(());
            };

            if bucket_page_id == image_page_id {
                drop(dir_guard);
                self.buffer_pool.unpin_page(self.directory_page_id, false);
                return Ok(());
            }

            let bucket_empty = self.bucket_is_empty(bucket_page_id)?;
            let image_empty = self.bucket_is_empty(image_page_id)?;

            if !bucket_empty && !image_empty {
                drop(dir_guard);
                self.buffer_pool.unpin_page(self.directory_page_id, false);
                return Ok(());
            }

            let (survivor_page_id, dead_page_id) = if bucket_empty {
                (image_page_id, bucket_page_id)
            } else {
                (bucket_page_id, image_page_id)
            };

            let new_depth = local_depth - 1;
            let new_mask = (1u32 << new_depth) - 1;
            let target = bucket_idx as u32 & new_mask;
            {
                let mut directory = HashTableDirectoryPage::attach(&mut dir_guard.data);
                for idx in 0..directory.size() {
                    if idx as u32 & new_mask == target {
                        directory.set_bucket_page_id(idx, survivor_page_id);
                        directory.set_local_depth(idx, new_depth);
                    }
                }
                while directory.can_shrink() {
                    directory.decr_global_depth();
                }
            }
            debug!(
                "merged bucket page {} into {} at local depth {}",
                dead_page_id, survivor_page_id, new_depth
            );

            drop(dir_guard);
            self.buffer_pool.unpin_page(self.directory_page_id, true);

            if !self.buffer_pool.delete_page(dead_page_id) {
                debug!("empty bucket page {} still pinned, left allocated", dead_page_id);
            }

            if new_depth == 0 {
                return Ok(());
            }
        }
    }

    fn bucket_is_empty(&self, bucket_page_id: PageId) -> Result<bool, HashIndexError> {
        let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
        let empty = {
            let bucket_guard = bucket_page.read();
            let bucket = HashTableBucketPage::<_, K, V>::attach(&bucket_guard.data);
            bucket.is_empty()
        };
        self.buffer_pool.unpin_page(bucket_page_id, false);
        Ok(empty)
    }

    /// Current global depth of the directory.
    pub fn global_depth(&self) -> Result<u32, HashIndexError> {
        let _table = self.table_latch.read();

        let directory_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let depth = {
            let dir_guard = directory_page.read();
            HashTableDirectoryPage::attach(&dir_guard.data).global_depth()
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false);

        Ok(depth)
    }

    /// Fatal check of the directory invariants.
    pub fn verify_integrity(&self) -> Result<(), HashIndexError> {
        let _table = self.table_latch.read();

        let directory_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        {
            let dir_guard = directory_page.read();
            HashTableDirectoryPage::attach(&dir_guard.data).verify_integrity();
        }
        self.buffer_pool.unpin_page(self.directory_page_id, false);

        Ok(())
    }
}
