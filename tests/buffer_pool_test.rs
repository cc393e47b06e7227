use std::sync::Arc;
use anyhow::Result;
use rand::prelude::*;

use burrowdb::common::types::PAGE_SIZE;
use burrowdb::storage::buffer::{BufferPoolError, BufferPoolManager};
use burrowdb::storage::disk::DiskManager;

mod common;
use common::{create_temp_db_file, create_test_buffer_pool};

#[test]
fn test_new_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (page, page_id) = buffer_pool.new_page()?;

    // First id handed out by a standalone pool
    assert_eq!(page_id, 0);
    {
        let page_guard = page.read();
        assert_eq!(page_guard.page_id, page_id);
        assert!(page_guard.data.iter().all(|&b| b == 0));
    }

    assert!(buffer_pool.unpin_page(page_id, false));

    Ok(())
}

#[test]
fn test_fetch_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false);

    let fetched_page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(page_guard.page_id, page_id);
    }

    assert!(buffer_pool.unpin_page(page_id, false));

    Ok(())
}

#[test]
fn test_page_modification_survives_eviction() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut page_guard = page.write();
        let test_data = b"Test Data";
        page_guard.data[100..100 + test_data.len()].copy_from_slice(test_data);
    }
    buffer_pool.unpin_page(page_id, true);

    // Push the page out of the pool
    for _ in 0..3 {
        let (_, other_id) = buffer_pool.new_page()?;
        buffer_pool.unpin_page(other_id, false);
    }

    let fetched_page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(&page_guard.data[100..109], b"Test Data");
    }
    buffer_pool.unpin_page(page_id, false);

    Ok(())
}

// Pool of size 10: ten pages pin every frame, the eleventh allocation
// fails, and evicted dirty pages read back intact.
#[test]
fn test_buffer_pool_capacity() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let mut page_ids = Vec::new();
    for i in 0..10 {
        let (page, page_id) = buffer_pool.new_page()?;
        {
            let mut page_guard = page.write();
            let text = format!("Hello page {}", i).into_bytes();
            page_guard.data[0..text.len()].copy_from_slice(&text);
        }
        page_ids.push(page_id);
    }

    // Every frame is pinned now
    match buffer_pool.new_page() {
        Err(BufferPoolError::BufferPoolFull) => {}
        other => panic!("expected BufferPoolFull, got {:?}", other.map(|(_, id)| id)),
    }

    // Release half of the pool and flush the released pages
    for &page_id in &page_ids[0..5] {
        assert!(buffer_pool.unpin_page(page_id, true));
        buffer_pool.flush_page(page_id)?;
    }

    // Five more pages reuse the released frames
    for _ in 0..5 {
        let (_, page_id) = buffer_pool.new_page()?;
        assert!(buffer_pool.unpin_page(page_id, false));
    }

    // The evicted first page reads back from disk with its contents
    let fetched_page = buffer_pool.fetch_page(page_ids[0])?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(&page_guard.data[0..12], b"Hello page 0");
    }
    assert!(buffer_pool.unpin_page(page_ids[0], true));

    buffer_pool.flush_all_pages()?;

    Ok(())
}

// Pages are byte arrays, not strings: interior and trailing zeroes must
// round-trip through flush and fetch untouched.
#[test]
fn test_binary_data_roundtrip() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let mut rng = rand::thread_rng();
    let mut random_data = [0u8; PAGE_SIZE];
    rng.fill_bytes(&mut random_data);
    random_data[PAGE_SIZE / 2] = 0;
    random_data[PAGE_SIZE - 1] = 0;

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut page_guard = page.write();
        page_guard.data.copy_from_slice(&random_data);
    }
    buffer_pool.unpin_page(page_id, true);
    buffer_pool.flush_page(page_id)?;

    // Evict it, then read it back from disk
    for _ in 0..3 {
        let (_, other_id) = buffer_pool.new_page()?;
        buffer_pool.unpin_page(other_id, false);
    }

    let fetched_page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(page_guard.data[..], random_data[..]);
    }
    buffer_pool.unpin_page(page_id, false);

    Ok(())
}

#[test]
fn test_unpin_semantics() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;

    assert!(buffer_pool.unpin_page(page_id, false));
    // Pin count is already zero
    assert!(!buffer_pool.unpin_page(page_id, false));
    // Unknown page
    assert!(!buffer_pool.unpin_page(9999, false));

    Ok(())
}

#[test]
fn test_delete_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;

    // A pinned page cannot be deleted
    assert!(!buffer_pool.delete_page(page_id));

    buffer_pool.unpin_page(page_id, false);
    assert!(buffer_pool.delete_page(page_id));

    // Deleting an absent page is vacuously true
    assert!(buffer_pool.delete_page(page_id));

    Ok(())
}

#[test]
fn test_flush_unknown_page_fails() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    match buffer_pool.flush_page(42) {
        Err(BufferPoolError::PageNotFound(42)) => Ok(()),
        other => panic!("expected PageNotFound, got {:?}", other),
    }
}

// Two pool instances over one disk manager stripe the page id space.
#[test]
fn test_sharded_page_id_allocation() -> Result<()> {
    let (_file, path) = create_temp_db_file()?;
    let disk_manager = Arc::new(DiskManager::new(path)?);

    let pool_a = BufferPoolManager::with_instances(5, 2, 0, Arc::clone(&disk_manager));
    let pool_b = BufferPoolManager::with_instances(5, 2, 1, disk_manager);

    let mut ids_a = Vec::new();
    let mut ids_b = Vec::new();
    for _ in 0..3 {
        let (_, id) = pool_a.new_page()?;
        pool_a.unpin_page(id, false);
        ids_a.push(id);

        let (_, id) = pool_b.new_page()?;
        pool_b.unpin_page(id, false);
        ids_b.push(id);
    }

    assert_eq!(ids_a, vec![0, 2, 4]);
    assert_eq!(ids_b, vec![1, 3, 5]);

    Ok(())
}
