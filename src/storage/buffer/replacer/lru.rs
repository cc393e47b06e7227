use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU page replacement policy over unpinned frames.
///
/// A frame is present iff it is a valid eviction candidate. Insertion
/// order is victimisation order: the frame unpinned longest ago is
/// evicted first.
pub struct LruReplacer {
    frames: Mutex<LinkedHashMap<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            frames: Mutex::new(LinkedHashMap::with_capacity(pool_size)),
        }
    }

    /// Remove and return the least recently unpinned frame, if any.
    pub fn victim(&self) -> Option<FrameId> {
        self.frames.lock().pop_front().map(|(frame_id, ())| frame_id)
    }

    /// Remove a frame from the candidate set. Idempotent.
    pub fn pin(&self, frame_id: FrameId) {
        self.frames.lock().remove(&frame_id);
    }

    /// Add a frame to the back of the candidate set. Idempotent: a frame
    /// already present keeps its position.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut frames = self.frames.lock();
        if !frames.contains_key(&frame_id) {
            frames.insert(frame_id, ());
        }
    }

    /// Number of eviction candidates.
    pub fn size(&self) -> usize {
        self.frames.lock().len()
    }
}
