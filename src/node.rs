/*
A node is a page reinterpreted under one of two layouts, chosen by the type
tag in the node header:

Offset  Size  Description
0       1     The node type tag: 1 for an index node, 2 for a leaf node.
              Any other value is an error.
4       4     The occupation: number of entries in the node.

The entry table starts right after the header and grows towards the end of
the page; the serialized objects are stacked from the end of the page towards
the table. Free space is whatever lies between them.

Leaf entry (12 bytes):
    distance_to_rep f64, offset u32
Index entry (28 bytes):
    distance_to_rep f64, radius f64, n_entries u32, child page id u32,
    offset u32

Each entry's offset points at its serialized object. Offsets are strictly
decreasing in entry order, so the size of object i is offset(i-1) - offset(i)
(with the page size standing in for offset(-1)). Exactly one entry of a
non-empty node has distance_to_rep == 0: the node representative, whose
serialized object therefore lives in the node itself.
*/

use crate::error::SlimError;
use crate::page::Page;

pub const NODE_HEADER_SIZE: usize = 8;
pub const LEAF_ENTRY_SIZE: usize = 12;
pub const INDEX_ENTRY_SIZE: usize = 28;

const TAG_INDEX: u8 = 1;
const TAG_LEAF: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Index,
    Leaf,
}

impl NodeType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_INDEX => Some(NodeType::Index),
            TAG_LEAF => Some(NodeType::Leaf),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            NodeType::Index => TAG_INDEX,
            NodeType::Leaf => TAG_LEAF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafEntry {
    pub distance: f64,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    pub distance: f64,
    pub radius: f64,
    pub n_entries: u32,
    pub page_id: u32,
    pub offset: u32,
}

fn read_u32(page: &Page, at: usize) -> u32 {
    u32::from_ne_bytes(page.get_data()[at..at + 4].try_into().unwrap())
}

fn write_u32(page: &mut Page, at: usize, value: u32) {
    page.write(&value.to_ne_bytes(), at);
}

fn read_f64(page: &Page, at: usize) -> f64 {
    f64::from_ne_bytes(page.get_data()[at..at + 8].try_into().unwrap())
}

fn write_f64(page: &mut Page, at: usize, value: f64) {
    page.write(&value.to_ne_bytes(), at);
}

fn occupation(page: &Page) -> u32 {
    read_u32(page, 4)
}

fn set_occupation(page: &mut Page, value: u32) {
    write_u32(page, 4, value);
}

/// Reads the type tag of a node page without building a view.
pub fn node_type(page: &Page) -> Result<NodeType, SlimError> {
    NodeType::from_tag(page.get_data()[0]).ok_or(SlimError::InvalidHeader("node"))
}

/// A page decoded into the proper node view.
pub enum SlimNode<'a> {
    Index(IndexNode<'a>),
    Leaf(LeafNode<'a>),
}

impl<'a> SlimNode<'a> {
    /// Dispatches on the type tag of an existing node page.
    pub fn from_page(page: &'a mut Page) -> Result<Self, SlimError> {
        match NodeType::from_tag(page.get_data()[0]) {
            Some(NodeType::Index) => Ok(SlimNode::Index(IndexNode::attach(page))),
            Some(NodeType::Leaf) => Ok(SlimNode::Leaf(LeafNode::attach(page))),
            None => Err(SlimError::InvalidHeader("node")),
        }
    }
}

macro_rules! node_common {
    ($entry_size:expr) => {
        pub fn num_entries(&self) -> u32 {
            occupation(self.page)
        }

        fn check_slot(&self, slot: u32) {
            debug_assert!(
                slot < self.num_entries(),
                "{}",
                SlimError::OutOfRange {
                    slot,
                    occupation: self.num_entries(),
                }
            );
        }

        fn offset_of(&self, slot: u32) -> u32 {
            read_u32(self.page, NODE_HEADER_SIZE + slot as usize * $entry_size + $entry_size - 4)
        }

        fn set_offset_of(&mut self, slot: u32, offset: u32) {
            write_u32(
                self.page,
                NODE_HEADER_SIZE + slot as usize * $entry_size + $entry_size - 4,
                offset,
            );
        }

        /// Bytes still available between the entry table and the object area.
        pub fn free_space(&self) -> usize {
            let occ = self.num_entries() as usize;
            let mut used = NODE_HEADER_SIZE;
            if occ > 0 {
                used += occ * $entry_size
                    + (self.page.get_page_size() - self.offset_of(occ as u32 - 1) as usize);
            }
            self.page.get_page_size() - used
        }

        /// Borrows the serialized object of the given slot.
        pub fn object(&self, slot: u32) -> &[u8] {
            self.check_slot(slot);
            let offset = self.offset_of(slot) as usize;
            &self.page.get_data()[offset..offset + self.object_size(slot)]
        }

        pub fn object_size(&self, slot: u32) -> usize {
            self.check_slot(slot);
            let upper = if slot == 0 {
                self.page.get_page_size()
            } else {
                self.offset_of(slot - 1) as usize
            };
            upper - self.offset_of(slot) as usize
        }

        /// First slot whose distance to the representative is zero, i.e. the
        /// representative itself. None only for an empty node.
        pub fn representative_slot(&self) -> Option<u32> {
            (0..self.num_entries()).find(|&slot| self.distance_of(slot) == 0.0)
        }

        /// Appends an entry and copies the serialized object to the top of
        /// the object area. Distance and bookkeeping fields are left zeroed
        /// for the caller to fill in. Returns None if it does not fit.
        pub fn add_entry(&mut self, object: &[u8]) -> Option<u32> {
            debug_assert!(!object.is_empty());
            if object.len() + $entry_size > self.free_space() {
                return None;
            }

            let occ = self.num_entries();
            let offset = if occ == 0 {
                self.page.get_page_size() - object.len()
            } else {
                self.offset_of(occ - 1) as usize - object.len()
            };
            self.page.write(object, offset);

            let entry_at = NODE_HEADER_SIZE + occ as usize * $entry_size;
            self.page.write(&[0u8; $entry_size], entry_at);
            set_occupation(self.page, occ + 1);
            self.set_offset_of(occ, offset as u32);
            Some(occ)
        }

        /// Removes an entry, compacting the object area with a single move
        /// and sliding the following entries down one slot. The strictly
        /// decreasing offset order is preserved.
        pub fn remove_entry(&mut self, slot: u32) {
            self.check_slot(slot);
            let last = self.num_entries() - 1;
            if slot != last {
                let removed_size = self.object_size(slot);
                let last_offset = self.offset_of(last) as usize;
                let slot_offset = self.offset_of(slot) as usize;

                // move every object below the removed one up over it
                self.page
                    .get_data_mut()
                    .copy_within(last_offset..slot_offset, last_offset + removed_size);

                for i in slot..last {
                    let from = NODE_HEADER_SIZE + (i as usize + 1) * $entry_size;
                    let to = NODE_HEADER_SIZE + i as usize * $entry_size;
                    let mut raw = [0u8; $entry_size];
                    self.page.read(&mut raw, from);
                    self.page.write(&raw, to);
                    let moved = self.offset_of(i);
                    self.set_offset_of(i, moved + removed_size as u32);
                }
            }
            set_occupation(self.page, last);
        }

        /// Resets the occupation to zero, abandoning all entries.
        pub fn remove_all(&mut self) {
            set_occupation(self.page, 0);
        }
    };
}

/// View of a leaf node: entries carry only the distance to the node
/// representative.
pub struct LeafNode<'a> {
    page: &'a mut Page,
}

impl<'a> LeafNode<'a> {
    /// Initialises the page as an empty leaf node.
    pub fn create(page: &'a mut Page) -> Self {
        page.get_data_mut()[0] = NodeType::Leaf.tag();
        set_occupation(page, 0);
        LeafNode { page }
    }

    /// Reinterprets an existing leaf page.
    pub fn attach(page: &'a mut Page) -> Self {
        LeafNode { page }
    }

    node_common!(LEAF_ENTRY_SIZE);

    fn distance_of(&self, slot: u32) -> f64 {
        read_f64(self.page, NODE_HEADER_SIZE + slot as usize * LEAF_ENTRY_SIZE)
    }

    pub fn entry(&self, slot: u32) -> LeafEntry {
        self.check_slot(slot);
        LeafEntry {
            distance: self.distance_of(slot),
            offset: self.offset_of(slot),
        }
    }

    pub fn set_distance(&mut self, slot: u32, distance: f64) {
        self.check_slot(slot);
        write_f64(
            self.page,
            NODE_HEADER_SIZE + slot as usize * LEAF_ENTRY_SIZE,
            distance,
        );
    }

    /// The largest distance to the representative: the smallest radius that
    /// still covers every object stored here.
    pub fn minimum_radius(&self) -> f64 {
        (0..self.num_entries())
            .map(|slot| self.distance_of(slot))
            .fold(0.0, f64::max)
    }

    pub fn total_object_count(&self) -> u32 {
        self.num_entries()
    }
}

/// View of an index node: entries carry the child's covering radius, subtree
/// object count and page id besides the distance to the representative.
pub struct IndexNode<'a> {
    page: &'a mut Page,
}

impl<'a> IndexNode<'a> {
    /// Initialises the page as an empty index node.
    pub fn create(page: &'a mut Page) -> Self {
        page.get_data_mut()[0] = NodeType::Index.tag();
        set_occupation(page, 0);
        IndexNode { page }
    }

    /// Reinterprets an existing index page.
    pub fn attach(page: &'a mut Page) -> Self {
        IndexNode { page }
    }

    node_common!(INDEX_ENTRY_SIZE);

    fn distance_of(&self, slot: u32) -> f64 {
        read_f64(self.page, NODE_HEADER_SIZE + slot as usize * INDEX_ENTRY_SIZE)
    }

    pub fn entry(&self, slot: u32) -> IndexEntry {
        self.check_slot(slot);
        let at = NODE_HEADER_SIZE + slot as usize * INDEX_ENTRY_SIZE;
        IndexEntry {
            distance: read_f64(self.page, at),
            radius: read_f64(self.page, at + 8),
            n_entries: read_u32(self.page, at + 16),
            page_id: read_u32(self.page, at + 20),
            offset: read_u32(self.page, at + 24),
        }
    }

    /// Fills in the metric bookkeeping of a slot created by add_entry. The
    /// offset set at insertion is left alone.
    pub fn update_entry(
        &mut self,
        slot: u32,
        distance: f64,
        radius: f64,
        n_entries: u32,
        page_id: u32,
    ) {
        self.check_slot(slot);
        let at = NODE_HEADER_SIZE + slot as usize * INDEX_ENTRY_SIZE;
        write_f64(self.page, at, distance);
        write_f64(self.page, at + 8, radius);
        write_u32(self.page, at + 16, n_entries);
        write_u32(self.page, at + 20, page_id);
    }

    pub fn set_distance(&mut self, slot: u32, distance: f64) {
        self.check_slot(slot);
        write_f64(
            self.page,
            NODE_HEADER_SIZE + slot as usize * INDEX_ENTRY_SIZE,
            distance,
        );
    }

    pub fn set_radius(&mut self, slot: u32, radius: f64) {
        self.check_slot(slot);
        write_f64(
            self.page,
            NODE_HEADER_SIZE + slot as usize * INDEX_ENTRY_SIZE + 8,
            radius,
        );
    }

    pub fn set_n_entries(&mut self, slot: u32, n_entries: u32) {
        self.check_slot(slot);
        write_u32(
            self.page,
            NODE_HEADER_SIZE + slot as usize * INDEX_ENTRY_SIZE + 16,
            n_entries,
        );
    }

    /// The smallest radius around the representative covering every subtree
    /// hanging off this node.
    pub fn minimum_radius(&self) -> f64 {
        (0..self.num_entries())
            .map(|slot| {
                let entry = self.entry(slot);
                entry.distance + entry.radius
            })
            .fold(0.0, f64::max)
    }

    /// Total number of objects stored below this node.
    pub fn total_object_count(&self) -> u32 {
        (0..self.num_entries())
            .map(|slot| self.entry(slot).n_entries)
            .sum()
    }
}
