/*
Page managers own the backing store and hand out Page instances to the tree.

The contract, shared by all variants:
 * header_page() returns the single reserved header page (id 1), created
   lazily on first use.
 * get_page(id) resolves an allocated id; ids that were never allocated, or
   were disposed and not yet reused, fail with InvalidPageId.
 * new_page() allocates a fresh page, reusing the free list first.
 * Every page obtained from header_page/get_page/new_page must be given back
   with release_page (content untouched) or dispose_page (id freed).
 * write_page/write_header_page persist the current content; releasing alone
   never writes.

Counters: reads/writes count every logical access; disk_reads/disk_writes
omit cache hits. For the memory variant both pairs coincide.

Released instances go to a small pool (the page instance cache) so steady
state traffic does not allocate.
*/

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Result, SlimError};
use crate::page::{Page, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::{Storage, DEFAULT_CACHE_PAGES};

/// Number of instances kept in the page instance cache.
const INSTANCE_CACHE_SIZE: usize = 16;

pub trait PageManager {
    fn page_size(&self) -> u32;

    /// True if no user nodes are currently allocated.
    fn is_empty(&self) -> bool;

    fn header_page(&mut self) -> Result<Page>;

    fn get_page(&mut self, page_id: u32) -> Result<Page>;

    fn new_page(&mut self) -> Result<Page>;

    /// Returns the instance to the pool. The page content is not written.
    fn release_page(&mut self, page: Page);

    fn write_page(&mut self, page: &Page) -> Result<()>;

    fn write_header_page(&mut self, page: &Page) -> Result<()>;

    /// Marks the id free and releases the instance.
    fn dispose_page(&mut self, page: Page) -> Result<()>;

    /// Number of user pages currently in use.
    fn page_count(&self) -> u32;

    fn reads(&self) -> u64;
    fn writes(&self) -> u64;
    fn disk_reads(&self) -> u64;
    fn disk_writes(&self) -> u64;
    fn reset_statistics(&mut self);
}

/// A small pool of reusable page buffers.
struct PageInstanceCache {
    instances: Vec<Page>,
    page_size: usize,
}

impl PageInstanceCache {
    fn new(page_size: usize) -> Self {
        PageInstanceCache {
            instances: Vec::new(),
            page_size,
        }
    }

    fn get(&mut self) -> Page {
        match self.instances.pop() {
            Some(mut page) => {
                page.set_id(INVALID_PAGE_ID);
                page
            }
            None => Page::new(self.page_size),
        }
    }

    fn put(&mut self, page: Page) {
        // only same-sized instances are worth recycling
        if page.get_page_size() == self.page_size && self.instances.len() < INSTANCE_CACHE_SIZE {
            self.instances.push(page);
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryPageManager
// ---------------------------------------------------------------------------

/// Holds all pages in main memory. Disk counters coincide with the logical
/// ones.
pub struct MemoryPageManager {
    page_size: u32,
    /// Index 0 is the header page; index i holds page id i + 1.
    pages: Vec<Vec<u8>>,
    free: Vec<u32>,
    instance_cache: PageInstanceCache,
    reads: u64,
    writes: u64,
}

impl MemoryPageManager {
    pub fn new(page_size: u32) -> Self {
        MemoryPageManager {
            page_size,
            pages: Vec::new(),
            free: Vec::new(),
            instance_cache: PageInstanceCache::new(page_size as usize),
            reads: 0,
            writes: 0,
        }
    }

    fn index_of(&self, page_id: u32) -> Result<usize> {
        let index = page_id.wrapping_sub(1) as usize;
        if page_id <= HEADER_PAGE_ID
            || index >= self.pages.len()
            || self.free.contains(&page_id)
        {
            return Err(SlimError::InvalidPageId(page_id));
        }
        Ok(index)
    }
}

impl PageManager for MemoryPageManager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn is_empty(&self) -> bool {
        self.pages.len().saturating_sub(1) == self.free.len()
    }

    fn header_page(&mut self) -> Result<Page> {
        if self.pages.is_empty() {
            self.pages.push(vec![0; self.page_size as usize]);
        }
        let mut page = self.instance_cache.get();
        page.get_data_mut().copy_from_slice(&self.pages[0]);
        page.set_id(HEADER_PAGE_ID);
        self.reads += 1;
        Ok(page)
    }

    fn get_page(&mut self, page_id: u32) -> Result<Page> {
        let index = self.index_of(page_id)?;
        let mut page = self.instance_cache.get();
        page.get_data_mut().copy_from_slice(&self.pages[index]);
        page.set_id(page_id);
        self.reads += 1;
        Ok(page)
    }

    fn new_page(&mut self) -> Result<Page> {
        if self.pages.is_empty() {
            // slot 0 is always the header page
            self.pages.push(vec![0; self.page_size as usize]);
        }
        let page_id = match self.free.pop() {
            Some(page_id) => page_id,
            None => {
                self.pages.push(vec![0; self.page_size as usize]);
                self.pages.len() as u32
            }
        };
        let mut page = self.instance_cache.get();
        page.clear();
        page.set_id(page_id);
        self.writes += 1;
        Ok(page)
    }

    fn release_page(&mut self, page: Page) {
        self.instance_cache.put(page);
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        let index = self.index_of(page.get_id())?;
        self.pages[index].copy_from_slice(page.get_data());
        self.writes += 1;
        Ok(())
    }

    fn write_header_page(&mut self, page: &Page) -> Result<()> {
        if self.pages.is_empty() {
            self.pages.push(vec![0; self.page_size as usize]);
        }
        self.pages[0].copy_from_slice(page.get_data());
        self.writes += 1;
        Ok(())
    }

    fn dispose_page(&mut self, page: Page) -> Result<()> {
        self.index_of(page.get_id())?;
        self.free.push(page.get_id());
        self.instance_cache.put(page);
        Ok(())
    }

    fn page_count(&self) -> u32 {
        (self.pages.len().saturating_sub(1) - self.free.len()) as u32
    }

    fn reads(&self) -> u64 {
        self.reads
    }

    fn writes(&self) -> u64 {
        self.writes
    }

    fn disk_reads(&self) -> u64 {
        self.reads
    }

    fn disk_writes(&self) -> u64 {
        self.writes
    }

    fn reset_statistics(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }
}

// ---------------------------------------------------------------------------
// DiskPageManager
// ---------------------------------------------------------------------------

/// Keeps the pages in a single storage file. Page id n lives in storage slot
/// n - 1; the header page (id 1) lives in the file's user header region.
pub struct DiskPageManager {
    storage: Storage,
    instance_cache: PageInstanceCache,
    reads: u64,
    writes: u64,
}

impl DiskPageManager {
    /// Creates a fresh file whose user header region holds one full page.
    pub fn create<P: AsRef<Path>>(path: P, page_size: u32) -> Result<Self> {
        Self::create_with(path, page_size, page_size, DEFAULT_CACHE_PAGES)
    }

    pub fn create_with<P: AsRef<Path>>(
        path: P,
        page_size: u32,
        user_header_size: u32,
        cache_pages: usize,
    ) -> Result<Self> {
        let storage = Storage::create(path, page_size, user_header_size, cache_pages)?;
        Ok(DiskPageManager {
            instance_cache: PageInstanceCache::new(page_size as usize),
            storage,
            reads: 0,
            writes: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = Storage::open(path, DEFAULT_CACHE_PAGES)?;
        Ok(DiskPageManager {
            instance_cache: PageInstanceCache::new(storage.get_page_size() as usize),
            storage,
            reads: 0,
            writes: 0,
        })
    }

    fn slot_of(&self, page_id: u32) -> Result<u32> {
        if page_id <= HEADER_PAGE_ID || !self.storage.is_allocated(page_id - 1) {
            return Err(SlimError::InvalidPageId(page_id));
        }
        Ok(page_id - 1)
    }
}

impl PageManager for DiskPageManager {
    fn page_size(&self) -> u32 {
        self.storage.get_page_size()
    }

    fn is_empty(&self) -> bool {
        self.storage.pages_in_use() == 0
    }

    fn header_page(&mut self) -> Result<Page> {
        let mut page = Page::new(self.storage.get_user_header_size() as usize);
        self.storage.read_user_header(page.get_data_mut())?;
        page.set_id(HEADER_PAGE_ID);
        self.reads += 1;
        Ok(page)
    }

    fn get_page(&mut self, page_id: u32) -> Result<Page> {
        let slot = self.slot_of(page_id)?;
        let mut page = self.instance_cache.get();
        self.storage.read_page(slot, page.get_data_mut())?;
        page.set_id(page_id);
        self.reads += 1;
        Ok(page)
    }

    fn new_page(&mut self) -> Result<Page> {
        let slot = self.storage.allocate()?;
        let mut page = self.instance_cache.get();
        page.clear();
        page.set_id(slot + 1);
        self.writes += 1;
        Ok(page)
    }

    fn release_page(&mut self, page: Page) {
        self.instance_cache.put(page);
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        let slot = self.slot_of(page.get_id())?;
        self.storage.write_page(slot, page.get_data())?;
        self.writes += 1;
        Ok(())
    }

    fn write_header_page(&mut self, page: &Page) -> Result<()> {
        self.storage.write_user_header(page.get_data())?;
        self.writes += 1;
        Ok(())
    }

    fn dispose_page(&mut self, page: Page) -> Result<()> {
        let slot = self.slot_of(page.get_id())?;
        self.storage.free(slot)?;
        self.instance_cache.put(page);
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.storage.pages_in_use()
    }

    fn reads(&self) -> u64 {
        self.reads
    }

    fn writes(&self) -> u64 {
        self.writes
    }

    fn disk_reads(&self) -> u64 {
        self.storage.get_disk_read_count()
    }

    fn disk_writes(&self) -> u64 {
        self.storage.get_disk_write_count()
    }

    fn reset_statistics(&mut self) {
        self.reads = 0;
        self.writes = 0;
        self.storage.reset_statistics();
    }
}

// ---------------------------------------------------------------------------
// MultiplePageManager
// ---------------------------------------------------------------------------

/// Shards logical pages across several storage files of fixed capacity.
///
/// A logical id L maps to shard ceil(L / pages_per_shard) - 1 at local id
/// ((L - 1) mod pages_per_shard) + 1. The header page (logical id 1, shard 0
/// local 1) is stored only in shard 0's user header region, so shard 0 holds
/// one fewer data page than the other shards.
pub struct MultiplePageManager {
    base_path: PathBuf,
    page_size: u32,
    pages_per_shard: u32,
    shards: Vec<Storage>,
    instance_cache: PageInstanceCache,
    reads: u64,
    writes: u64,
}

impl MultiplePageManager {
    pub fn create<P: AsRef<Path>>(
        base_path: P,
        page_size: u32,
        pages_per_shard: u32,
    ) -> Result<Self> {
        debug_assert!(pages_per_shard >= 2);
        let base_path = base_path.as_ref().to_path_buf();
        let first = Storage::create(
            shard_path(&base_path, 0),
            page_size,
            page_size,
            DEFAULT_CACHE_PAGES,
        )?;
        Ok(MultiplePageManager {
            instance_cache: PageInstanceCache::new(page_size as usize),
            base_path,
            page_size,
            pages_per_shard,
            shards: vec![first],
            reads: 0,
            writes: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(base_path: P, pages_per_shard: u32) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let first = Storage::open(shard_path(&base_path, 0), DEFAULT_CACHE_PAGES)?;
        let page_size = first.get_page_size();
        let mut shards = vec![first];
        while shard_path(&base_path, shards.len()).exists() {
            shards.push(Storage::open(
                shard_path(&base_path, shards.len()),
                DEFAULT_CACHE_PAGES,
            )?);
        }
        Ok(MultiplePageManager {
            instance_cache: PageInstanceCache::new(page_size as usize),
            base_path,
            page_size,
            pages_per_shard,
            shards,
            reads: 0,
            writes: 0,
        })
    }

    /// (shard index, local storage slot) for a data page id.
    fn locate(&self, page_id: u32) -> Result<(usize, u32)> {
        if page_id <= HEADER_PAGE_ID {
            return Err(SlimError::InvalidPageId(page_id));
        }
        let shard = ((page_id - 1) / self.pages_per_shard) as usize;
        let local = ((page_id - 1) % self.pages_per_shard) + 1;
        // in shard 0 local id 1 is the header, so data slots start one lower
        let slot = if shard == 0 { local - 1 } else { local };
        if shard >= self.shards.len() || !self.shards[shard].is_allocated(slot) {
            return Err(SlimError::InvalidPageId(page_id));
        }
        Ok((shard, slot))
    }

    fn logical_id(&self, shard: usize, slot: u32) -> u32 {
        if shard == 0 {
            slot + 1
        } else {
            shard as u32 * self.pages_per_shard + slot
        }
    }

    /// Data-page capacity of one shard file.
    fn shard_capacity(&self, shard: usize) -> u32 {
        if shard == 0 {
            self.pages_per_shard - 1
        } else {
            self.pages_per_shard
        }
    }
}

fn shard_path(base: &Path, shard: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{shard}"));
    PathBuf::from(name)
}

impl PageManager for MultiplePageManager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn is_empty(&self) -> bool {
        // if the first shard is empty the others are expected to be as well
        self.shards[0].pages_in_use() == 0
    }

    fn header_page(&mut self) -> Result<Page> {
        let mut page = Page::new(self.shards[0].get_user_header_size() as usize);
        self.shards[0].read_user_header(page.get_data_mut())?;
        page.set_id(HEADER_PAGE_ID);
        self.reads += 1;
        Ok(page)
    }

    fn get_page(&mut self, page_id: u32) -> Result<Page> {
        let (shard, slot) = self.locate(page_id)?;
        let mut page = self.instance_cache.get();
        self.shards[shard].read_page(slot, page.get_data_mut())?;
        page.set_id(page_id);
        self.reads += 1;
        Ok(page)
    }

    fn new_page(&mut self) -> Result<Page> {
        // reuse a freed slot anywhere before growing the last shard
        let mut target = None;
        for (shard, storage) in self.shards.iter().enumerate() {
            if storage.free_count() > 0 {
                target = Some(shard);
                break;
            }
        }
        let shard = match target {
            Some(shard) => shard,
            None => {
                let last = self.shards.len() - 1;
                if self.shards[last].total_pages() == self.shard_capacity(last) {
                    debug!("storage shard {} is full, opening shard {}", last, last + 1);
                    self.shards.push(Storage::create(
                        shard_path(&self.base_path, last + 1),
                        self.page_size,
                        0,
                        DEFAULT_CACHE_PAGES,
                    )?);
                    last + 1
                } else {
                    last
                }
            }
        };
        let slot = self.shards[shard].allocate()?;
        let mut page = self.instance_cache.get();
        page.clear();
        page.set_id(self.logical_id(shard, slot));
        self.writes += 1;
        Ok(page)
    }

    fn release_page(&mut self, page: Page) {
        self.instance_cache.put(page);
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        let (shard, slot) = self.locate(page.get_id())?;
        self.shards[shard].write_page(slot, page.get_data())?;
        self.writes += 1;
        Ok(())
    }

    fn write_header_page(&mut self, page: &Page) -> Result<()> {
        self.shards[0].write_user_header(page.get_data())?;
        self.writes += 1;
        Ok(())
    }

    fn dispose_page(&mut self, page: Page) -> Result<()> {
        let (shard, slot) = self.locate(page.get_id())?;
        self.shards[shard].free(slot)?;
        self.instance_cache.put(page);
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.shards.iter().map(|s| s.pages_in_use()).sum()
    }

    fn reads(&self) -> u64 {
        self.reads
    }

    fn writes(&self) -> u64 {
        self.writes
    }

    fn disk_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.get_disk_read_count()).sum()
    }

    fn disk_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.get_disk_write_count()).sum()
    }

    fn reset_statistics(&mut self) {
        self.reads = 0;
        self.writes = 0;
        for shard in &mut self.shards {
            shard.reset_statistics();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_manager<M: PageManager>(manager: &mut M) {
        assert!(manager.is_empty());

        let mut first = manager.new_page().unwrap();
        let first_id = first.get_id();
        assert!(first_id > HEADER_PAGE_ID);
        first.write(&[0xaa; 8], 0);
        manager.write_page(&first).unwrap();
        manager.release_page(first);
        assert!(!manager.is_empty());
        assert_eq!(manager.page_count(), 1);

        let page = manager.get_page(first_id).unwrap();
        let mut buf = [0u8; 8];
        page.read(&mut buf, 0);
        assert_eq!(buf, [0xaa; 8]);
        manager.release_page(page);

        // disposing frees the id for reuse and invalidates lookups
        let page = manager.get_page(first_id).unwrap();
        manager.dispose_page(page).unwrap();
        assert!(matches!(
            manager.get_page(first_id),
            Err(SlimError::InvalidPageId(_))
        ));
        let reused = manager.new_page().unwrap();
        assert_eq!(reused.get_id(), first_id);
        manager.release_page(reused);

        assert!(matches!(
            manager.get_page(999),
            Err(SlimError::InvalidPageId(_))
        ));
        assert!(matches!(
            manager.get_page(INVALID_PAGE_ID),
            Err(SlimError::InvalidPageId(_))
        ));
    }

    #[test]
    fn test_memory_manager_contract() {
        let mut manager = MemoryPageManager::new(256);
        exercise_manager(&mut manager);
    }

    #[test]
    fn test_disk_manager_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DiskPageManager::create(dir.path().join("t.dat"), 256).unwrap();
        exercise_manager(&mut manager);
    }

    #[test]
    fn test_multiple_manager_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager =
            MultiplePageManager::create(dir.path().join("t.dat"), 256, 4).unwrap();
        exercise_manager(&mut manager);
    }

    #[test]
    fn test_multiple_manager_spills_into_new_shards() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("t.dat");
        let mut manager = MultiplePageManager::create(&base, 128, 3).unwrap();

        // shard 0 holds two data pages (ids 2, 3); id 4 opens shard 1
        let mut ids = Vec::new();
        for _ in 0..5 {
            let page = manager.new_page().unwrap();
            ids.push(page.get_id());
            manager.write_page(&page).unwrap();
            manager.release_page(page);
        }
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert!(dir.path().join("t.dat.1").exists());

        for id in ids {
            let page = manager.get_page(id).unwrap();
            manager.release_page(page);
        }
    }

    #[test]
    fn test_memory_counters() {
        let mut manager = MemoryPageManager::new(128);
        let page = manager.new_page().unwrap();
        manager.write_page(&page).unwrap();
        let id = page.get_id();
        manager.release_page(page);
        let page = manager.get_page(id).unwrap();
        manager.release_page(page);

        assert_eq!(manager.reads(), 1);
        assert_eq!(manager.writes(), 2);
        manager.reset_statistics();
        assert_eq!(manager.reads(), 0);
        assert_eq!(manager.writes(), 0);
    }
}
