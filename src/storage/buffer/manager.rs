use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Frame, FrameId, Page, PageId, PagePtr, FramePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Table state of the pool: which page lives in which frame, which
/// frames have never been used, and the next page id to hand out.
struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

pub struct BufferPoolManager {
    pool_size: usize,
    num_instances: u32,
    instance_index: u32,
    frames: Vec<FramePtr>,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    /// Create a standalone pool backed by the database file at `db_path`.
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_instances(pool_size, 1, 0, disk_manager))
    }

    /// Create one instance of a sharded pool. Page ids allocated by this
    /// instance satisfy `id % num_instances == instance_index`, so several
    /// instances can share the id space of one database file.
    pub fn with_instances(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0, "pool must contain at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(parking_lot::RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            num_instances,
            instance_index,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
                next_page_id: instance_index as PageId,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Create a new page, pinned once. Fails with `BufferPoolFull` iff
    /// every frame is pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.inner.lock();

        let frame_id = self.obtain_frame(&mut inner)?;
        let page_id = Self::allocate_page_id(&mut inner, self.num_instances, self.instance_index);

        self.evict_frame(&mut inner, frame_id)?;

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        {
            let mut page_guard = frame_guard.page.write();
            page_guard.data.fill(0);
            page_guard.page_id = page_id;
            page_guard.lsn = 0;
        }
        frame_guard.pin_count = 1;
        frame_guard.is_dirty = false;

        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok((frame_guard.page.clone(), page_id))
    }

    /// Fetch a page from the buffer pool or disk, pinning it.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();

        // Already resident: just pin.
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();
            frame_guard.pin_count += 1;
            self.replacer.pin(frame_id);
            return Ok(frame_guard.page.clone());
        }

        let frame_id = self.obtain_frame(&mut inner)?;
        self.evict_frame(&mut inner, frame_id)?;

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        {
            let mut page_guard = frame_guard.page.write();
            self.disk_manager.read_page(page_id, &mut page_guard)?;
        }
        frame_guard.pin_count = 1;
        frame_guard.is_dirty = false;

        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok(frame_guard.page.clone())
    }

    /// Drop one pin on a page. Returns false if the page is not resident
    /// or not pinned. The dirty flag is sticky: once set it stays set
    /// until the page is written back.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return false,
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        if frame_guard.pin_count == 0 {
            return false;
        }

        frame_guard.pin_count -= 1;
        if is_dirty {
            frame_guard.is_dirty = true;
        }
        if frame_guard.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }

        true
    }

    /// Drop a page from the pool and return its frame to the free list.
    /// Returns true when the page is not resident (nothing to do) or was
    /// removed; false when the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return true,
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        if frame_guard.pin_count > 0 {
            return false;
        }

        inner.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        frame_guard.page.write().reset();
        frame_guard.is_dirty = false;
        inner.free_list.push_back(frame_id);

        true
    }

    /// Write a resident page to disk unconditionally.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let inner = self.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        {
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
        }
        frame_guard.is_dirty = false;

        Ok(())
    }

    /// Write every resident page to disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let inner = self.inner.lock();

        for &frame_id in inner.page_table.values() {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();
            {
                let page_guard = frame_guard.page.read();
                self.disk_manager.write_page(&page_guard)?;
            }
            frame_guard.is_dirty = false;
        }

        Ok(())
    }

    /// Take a frame from the free list, or evict the LRU victim.
    fn obtain_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)
    }

    /// Detach whatever page currently occupies `frame_id`, writing it back
    /// first if dirty.
    fn evict_frame(&self, inner: &mut PoolInner, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        let old_page_id = frame_guard.page.read().page_id;
        if old_page_id != INVALID_PAGE_ID {
            if frame_guard.is_dirty {
                debug!("writing back dirty page {} from frame {}", old_page_id, frame_id);
                let page_guard = frame_guard.page.read();
                self.disk_manager.write_page(&page_guard)?;
            }
            inner.page_table.remove(&old_page_id);
            frame_guard.is_dirty = false;
        }

        Ok(())
    }

    fn allocate_page_id(inner: &mut PoolInner, num_instances: u32, instance_index: u32) -> PageId {
        let page_id = inner.next_page_id;
        inner.next_page_id += num_instances as PageId;
        debug_assert_eq!(page_id % num_instances as PageId, instance_index as PageId);
        page_id
    }
}
