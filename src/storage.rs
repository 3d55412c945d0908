/*
Single-file backing store for the disk page manager.

File layout:

Offset  Size                Description
0       4                   Magic value "@#$&". Written native-endian, so a
                            file produced on a foreign-endian machine is
                            refused at open.
4       4                   The page size in bytes.
8       4                   The user header size in bytes.
12      4                   The next page number to be allocated (1-based).
16      4                   The head of the free list, or 0 if it is empty.
20      user_header_size    The user header region (the tree header lives
                            here).
...     page_size each      Page slots, indexed by 1-based page number n at
                            offset 20 + user_header_size + (n - 1) * page_size.

Freed pages are chained in place: the first 4 bytes of a disposed slot hold
the number of the next free page, 0 terminating the chain. Allocation pops
the head of this chain before extending the file.

A bounded content cache (write-through, FIFO eviction) sits between the slots
and the callers; the disk counters only see cache misses, while the page
manager above counts every logical access.
*/

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::{Result, SlimError};

const STORAGE_MAGIC: u32 = u32::from_ne_bytes(*b"@#$&");

/// Size of the fixed file header that precedes the user header region.
pub const FILE_HEADER_SIZE: u64 = 20;

/// Default number of page images kept in the content cache.
pub const DEFAULT_CACHE_PAGES: usize = 16;

pub struct Storage {
    file: File,
    page_size: u32,
    user_header_size: u32,
    /// Next fresh page number (1-based); also one past the highest slot ever
    /// allocated.
    next_page: u32,
    /// Head of the on-file free chain, mirrored by `free_stack`.
    free_head: u32,
    free_stack: Vec<u32>,
    free_set: HashSet<u32>,
    cache: HashMap<u32, Vec<u8>>,
    cache_order: VecDeque<u32>,
    cache_pages: usize,
    disk_reads: u64,
    disk_writes: u64,
}

impl Storage {
    /// Creates (truncating) a storage file with the given geometry.
    pub fn create<P: AsRef<Path>>(
        path: P,
        page_size: u32,
        user_header_size: u32,
        cache_pages: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let mut storage = Storage {
            file,
            page_size,
            user_header_size,
            next_page: 1,
            free_head: 0,
            free_stack: Vec::new(),
            free_set: HashSet::new(),
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            cache_pages,
            disk_reads: 0,
            disk_writes: 0,
        };
        storage.write_file_header()?;
        // reserve the user header region up front
        if user_header_size > 0 {
            storage.file.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;
            storage.file.write_all(&vec![0; user_header_size as usize])?;
        }
        Ok(storage)
    }

    /// Opens an existing storage file, refusing a foreign or damaged header.
    pub fn open<P: AsRef<Path>>(path: P, cache_pages: usize) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let magic = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        if magic != STORAGE_MAGIC {
            return Err(SlimError::InvalidHeader("storage file"));
        }
        let page_size = u32::from_ne_bytes(header[4..8].try_into().unwrap());
        let user_header_size = u32::from_ne_bytes(header[8..12].try_into().unwrap());
        let next_page = u32::from_ne_bytes(header[12..16].try_into().unwrap());
        let free_head = u32::from_ne_bytes(header[16..20].try_into().unwrap());

        let mut storage = Storage {
            file,
            page_size,
            user_header_size,
            next_page,
            free_head,
            free_stack: Vec::new(),
            free_set: HashSet::new(),
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            cache_pages,
            disk_reads: 0,
            disk_writes: 0,
        };

        // rebuild the in-memory view of the free chain
        let mut link = free_head;
        while link != 0 {
            storage.free_stack.push(link);
            storage.free_set.insert(link);
            let mut next = [0u8; 4];
            let offset = storage.slot_offset(link);
            storage.file.seek(SeekFrom::Start(offset))?;
            storage.file.read_exact(&mut next)?;
            link = u32::from_ne_bytes(next);
        }
        // the stack pops from the end; keep the chain head on top
        storage.free_stack.reverse();

        debug!(
            "opened storage: page_size={} pages={} free={}",
            page_size,
            next_page - 1,
            storage.free_set.len()
        );
        Ok(storage)
    }

    pub fn get_page_size(&self) -> u32 {
        self.page_size
    }

    pub fn get_user_header_size(&self) -> u32 {
        self.user_header_size
    }

    /// Number of slots currently holding live pages.
    pub fn pages_in_use(&self) -> u32 {
        self.next_page - 1 - self.free_set.len() as u32
    }

    /// Number of slots ever allocated, including disposed ones.
    pub fn total_pages(&self) -> u32 {
        self.next_page - 1
    }

    pub fn is_allocated(&self, page: u32) -> bool {
        page >= 1 && page < self.next_page && !self.free_set.contains(&page)
    }

    /// Number of slots waiting on the free chain.
    pub fn free_count(&self) -> u32 {
        self.free_set.len() as u32
    }

    fn slot_offset(&self, page: u32) -> u64 {
        FILE_HEADER_SIZE + self.user_header_size as u64 + (page as u64 - 1) * self.page_size as u64
    }

    fn write_file_header(&mut self) -> Result<()> {
        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&STORAGE_MAGIC.to_ne_bytes());
        header[4..8].copy_from_slice(&self.page_size.to_ne_bytes());
        header[8..12].copy_from_slice(&self.user_header_size.to_ne_bytes());
        header[12..16].copy_from_slice(&self.next_page.to_ne_bytes());
        header[16..20].copy_from_slice(&self.free_head.to_ne_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    pub fn read_user_header(&mut self, dst: &mut [u8]) -> Result<()> {
        debug_assert!(dst.len() <= self.user_header_size as usize);
        self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;
        self.file.read_exact(dst)?;
        self.disk_reads += 1;
        Ok(())
    }

    pub fn write_user_header(&mut self, src: &[u8]) -> Result<()> {
        debug_assert!(src.len() <= self.user_header_size as usize);
        self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;
        self.file.write_all(src)?;
        self.disk_writes += 1;
        Ok(())
    }

    /// Reads the slot for `page` into `dst`, serving from the content cache
    /// when possible. Only misses touch the file and the disk counter.
    pub fn read_page(&mut self, page: u32, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len(), self.page_size as usize);
        if let Some(image) = self.cache.get(&page) {
            dst.copy_from_slice(image);
            return Ok(());
        }

        let offset = self.slot_offset(page);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(dst)?;
        self.disk_reads += 1;
        self.cache_insert(page, dst.to_vec());
        Ok(())
    }

    /// Writes `src` to the slot for `page` (write-through: the file and the
    /// cache are updated together).
    pub fn write_page(&mut self, page: u32, src: &[u8]) -> Result<()> {
        debug_assert_eq!(src.len(), self.page_size as usize);
        let offset = self.slot_offset(page);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(src)?;
        self.disk_writes += 1;
        self.cache_insert(page, src.to_vec());
        Ok(())
    }

    /// Reserves a page number, reusing the free chain before extending the
    /// file.
    pub fn allocate(&mut self) -> Result<u32> {
        let page = match self.free_stack.pop() {
            Some(page) => {
                self.free_set.remove(&page);
                // the popped slot held the next link; it becomes the new head
                self.free_head = self.free_stack.last().copied().unwrap_or(0);
                page
            }
            None => {
                let page = self.next_page;
                self.next_page += 1;
                page
            }
        };
        self.write_file_header()?;
        Ok(page)
    }

    /// Returns `page` to the free chain.
    pub fn free(&mut self, page: u32) -> Result<()> {
        debug_assert!(self.is_allocated(page));
        // link the old head into the first bytes of the disposed slot
        let offset = self.slot_offset(page);
        let link = self.free_head.to_ne_bytes();
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&link)?;
        self.disk_writes += 1;

        self.free_head = page;
        self.free_stack.push(page);
        self.free_set.insert(page);
        self.cache_remove(page);
        self.write_file_header()
    }

    fn cache_insert(&mut self, page: u32, image: Vec<u8>) {
        if self.cache_pages == 0 {
            return;
        }
        if self.cache.insert(page, image).is_none() {
            self.cache_order.push_back(page);
            if self.cache_order.len() > self.cache_pages {
                if let Some(evicted) = self.cache_order.pop_front() {
                    self.cache.remove(&evicted);
                }
            }
        }
    }

    fn cache_remove(&mut self, page: u32) {
        if self.cache.remove(&page).is_some() {
            self.cache_order.retain(|&p| p != page);
        }
    }

    pub fn get_disk_read_count(&self) -> u64 {
        self.disk_reads
    }

    pub fn get_disk_write_count(&self) -> u64 {
        self.disk_writes
    }

    pub fn reset_statistics(&mut self) {
        self.disk_reads = 0;
        self.disk_writes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.dat");

        let first;
        {
            let mut storage = Storage::create(&path, 128, 64, 4).unwrap();
            first = storage.allocate().unwrap();
            storage.write_page(first, &[0xab; 128]).unwrap();
            storage.write_user_header(&[7u8; 64]).unwrap();
        }

        let mut storage = Storage::open(&path, 4).unwrap();
        assert_eq!(storage.get_page_size(), 128);
        assert_eq!(storage.pages_in_use(), 1);

        let mut buf = [0u8; 128];
        storage.read_page(first, &mut buf).unwrap();
        assert_eq!(buf, [0xab; 128]);

        let mut header = [0u8; 64];
        storage.read_user_header(&mut header).unwrap();
        assert_eq!(header, [7u8; 64]);
    }

    #[test]
    fn test_free_chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.dat");

        {
            let mut storage = Storage::create(&path, 64, 0, 0).unwrap();
            let a = storage.allocate().unwrap();
            let b = storage.allocate().unwrap();
            let c = storage.allocate().unwrap();
            storage.write_page(a, &[1; 64]).unwrap();
            storage.write_page(b, &[2; 64]).unwrap();
            storage.write_page(c, &[3; 64]).unwrap();
            storage.free(b).unwrap();
            storage.free(a).unwrap();
        }

        let mut storage = Storage::open(&path, 0).unwrap();
        assert_eq!(storage.pages_in_use(), 1);
        assert!(!storage.is_allocated(1));
        assert!(!storage.is_allocated(2));
        assert!(storage.is_allocated(3));

        // reuse order follows the chain: last freed first
        assert_eq!(storage.allocate().unwrap(), 1);
        assert_eq!(storage.allocate().unwrap(), 2);
        assert_eq!(storage.allocate().unwrap(), 4);
    }

    #[test]
    fn test_cache_hides_repeat_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.dat");

        let mut storage = Storage::create(&path, 64, 0, 2).unwrap();
        let a = storage.allocate().unwrap();
        storage.write_page(a, &[9; 64]).unwrap();
        storage.reset_statistics();

        let mut buf = [0u8; 64];
        storage.read_page(a, &mut buf).unwrap();
        storage.read_page(a, &mut buf).unwrap();
        // the write left the image in the cache; no miss at all
        assert_eq!(storage.get_disk_read_count(), 0);
    }

    #[test]
    fn test_rejects_foreign_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.dat");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(
            Storage::open(&path, 0),
            Err(SlimError::InvalidHeader(_))
        ));
    }
}
