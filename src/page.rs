/*
A page is the atomic unit of I/O: a contiguous page_size byte buffer addressed
by a 32-bit page id. Page id 0 is reserved and never refers to a stored node;
page id 1 is reserved for the header page. All other ids address exactly one
node.

The buffer carries no structure of its own. Node layouts are imposed on top of
it by the node views, and the page managers move whole buffers between memory
and the backing store. All multibyte values persisted inside pages are
native-endian; the storage file magic is used to refuse a foreign file.
*/

/// Reserved id that never refers to a stored node.
pub const INVALID_PAGE_ID: u32 = 0;

/// Reserved id of the header page.
pub const HEADER_PAGE_ID: u32 = 1;

/// A fixed-size byte buffer tagged with a page identifier.
#[derive(Debug, Clone)]
pub struct Page {
    id: u32,
    data: Vec<u8>,
}

impl Page {
    /// Creates a zeroed page of the given size with no id assigned.
    pub fn new(page_size: usize) -> Self {
        Page {
            id: INVALID_PAGE_ID,
            data: vec![0; page_size],
        }
    }

    pub fn get_id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn get_page_size(&self) -> usize {
        self.data.len()
    }

    /// Zeroes the whole buffer, keeping the id.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn get_data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    /// Bounds are checked in debug builds only; internal callers are trusted.
    pub fn read(&self, dst: &mut [u8], offset: usize) {
        debug_assert!(offset + dst.len() <= self.data.len());
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
    }

    /// Copies `src` into the buffer starting at `offset`.
    pub fn write(&mut self, src: &[u8], offset: usize) {
        debug_assert!(offset + src.len() <= self.data.len());
        self.data[offset..offset + src.len()].copy_from_slice(src);
    }
}
