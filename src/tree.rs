/*
The Slim-tree: a dynamic, height-balanced, paginated metric index.

Every node stores one designated object, the representative, and for each of
its other entries the precomputed distance to it. Index entries additionally
carry the covering radius and object count of the child subtree. Those two
numbers are what both query algorithms prune on: an entry whose ball cannot
intersect the query ball is skipped without touching its page or evaluating a
single distance.

Insertion descends from the root choosing one subtree per level (coverage
first, least enlargement otherwise). An overflowing node is split with the
minMax algorithm: among all candidate pairs of promoted representatives, the
one minimising the larger of the two resulting covering radii wins, provided
both partitions fit in a page.

Page writes within one insert are ordered child-first, and the tree header
(which carries the object count) goes out last, so a failed insert leaves no
partially visible object.
*/

use std::rc::Rc;

use itertools::Itertools;
use log::debug;

use crate::error::{Result, SlimError};
use crate::metric::{DistanceAdapter, MetricEvaluator};
use crate::node::{
    node_type, IndexNode, LeafNode, NodeType, SlimNode, INDEX_ENTRY_SIZE, LEAF_ENTRY_SIZE,
    NODE_HEADER_SIZE,
};
use crate::object::Object;
use crate::page::{Page, INVALID_PAGE_ID};
use crate::page_manager::PageManager;
use crate::queue::{PendingSubtree, SubtreeQueue};
use crate::result::ResultSet;

const TREE_MAGIC: u32 = u32::from_ne_bytes(*b"SL-x");

/// Persisted tree header, kept in memory and written back (last) after every
/// successful mutation.
///
/// Layout: magic u32, root page id u32, height u32, object count u32, node
/// count u32.
#[derive(Debug, Clone, Copy, Default)]
struct TreeHeader {
    root: u32,
    height: u32,
    object_count: u32,
    node_count: u32,
}

impl TreeHeader {
    fn from_page(page: &Page) -> Result<Self> {
        let data = page.get_data();
        let magic = u32::from_ne_bytes(data[0..4].try_into().unwrap());
        if magic != TREE_MAGIC {
            return Err(SlimError::InvalidHeader("tree"));
        }
        Ok(TreeHeader {
            root: u32::from_ne_bytes(data[4..8].try_into().unwrap()),
            height: u32::from_ne_bytes(data[8..12].try_into().unwrap()),
            object_count: u32::from_ne_bytes(data[12..16].try_into().unwrap()),
            node_count: u32::from_ne_bytes(data[16..20].try_into().unwrap()),
        })
    }

    fn write_to(&self, page: &mut Page) {
        page.write(&TREE_MAGIC.to_ne_bytes(), 0);
        page.write(&self.root.to_ne_bytes(), 4);
        page.write(&self.height.to_ne_bytes(), 8);
        page.write(&self.object_count.to_ne_bytes(), 12);
        page.write(&self.node_count.to_ne_bytes(), 16);
    }
}

/// Everything a parent needs to know about a (new or changed) subtree: its
/// representative in serialized form, covering radius, object count and root
/// page.
struct SubtreeInfo {
    rep: Vec<u8>,
    radius: f64,
    n_entries: u32,
    page_id: u32,
}

/// Outcome of an insertion into a subtree, reported to the parent level.
enum InsertAction {
    /// The object was absorbed; the caller bumps its entry's count and, when
    /// it descended by least enlargement, grows the radius.
    NoAct,
    /// The subtree absorbed the object but elected a new representative; the
    /// caller must replace its entry accordingly.
    ChangeRep(SubtreeInfo),
    /// The subtree split in two; the caller replaces its entry with both.
    Promote(SubtreeInfo, SubtreeInfo),
}

/// One element of the bag handed to an index-node split.
struct IndexBagItem<O> {
    object: O,
    bytes: Vec<u8>,
    radius: f64,
    n_entries: u32,
    page_id: u32,
}

impl<O: Object> IndexBagItem<O> {
    fn from_info(info: SubtreeInfo) -> Self {
        IndexBagItem {
            object: O::unserialize(&info.rep),
            bytes: info.rep,
            radius: info.radius,
            n_entries: info.n_entries,
            page_id: info.page_id,
        }
    }
}

pub struct SlimTree<O: Object, E: MetricEvaluator<O>, P: PageManager> {
    pager: P,
    evaluator: Rc<DistanceAdapter<O, E>>,
    header: TreeHeader,
}

impl<O: Object, E: MetricEvaluator<O>, P: PageManager> SlimTree<O, E, P> {
    /// Opens the tree stored in the page manager, or starts an empty one if
    /// the page manager holds no nodes yet.
    pub fn new(pager: P, evaluator: E) -> Result<Self> {
        Self::with_shared_evaluator(pager, Rc::new(DistanceAdapter::new(evaluator)))
    }

    /// Like new, but sharing a distance adapter (and its counter) with other
    /// owners.
    pub fn with_shared_evaluator(
        mut pager: P,
        evaluator: Rc<DistanceAdapter<O, E>>,
    ) -> Result<Self> {
        let header = if pager.is_empty() {
            let header = TreeHeader::default();
            let mut page = pager.header_page()?;
            header.write_to(&mut page);
            pager.write_header_page(&page)?;
            pager.release_page(page);
            header
        } else {
            let page = pager.header_page()?;
            let header = TreeHeader::from_page(&page)?;
            pager.release_page(page);
            header
        };
        Ok(SlimTree {
            pager,
            evaluator,
            header,
        })
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn num_objects(&self) -> u32 {
        self.header.object_count
    }

    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    pub fn page_manager(&self) -> &P {
        &self.pager
    }

    pub fn page_manager_mut(&mut self) -> &mut P {
        &mut self.pager
    }

    pub fn metric_evaluator(&self) -> &DistanceAdapter<O, E> {
        &self.evaluator
    }

    fn write_header(&mut self) -> Result<()> {
        let mut page = self.pager.header_page()?;
        self.header.write_to(&mut page);
        self.pager.write_header_page(&page)?;
        self.pager.release_page(page);
        Ok(())
    }

    // -----------------------------------------------------------------
    // insertion
    // -----------------------------------------------------------------

    /// Adds one object to the tree.
    pub fn add(&mut self, object: &O) -> Result<()> {
        let bytes = object.serialize();
        debug_assert_eq!(bytes.len(), object.serialized_size());

        if self.header.root == INVALID_PAGE_ID {
            let mut page = self.pager.new_page()?;
            let mut leaf = LeafNode::create(&mut page);
            match leaf.add_entry(&bytes) {
                Some(slot) => leaf.set_distance(slot, 0.0),
                None => {
                    // the very first object does not even fit an empty leaf
                    self.pager.dispose_page(page)?;
                    return Err(SlimError::SplitInfeasible);
                }
            }
            let root = page.get_id();
            self.pager.write_page(&page)?;
            self.pager.release_page(page);
            debug!("created root leaf, page {root}");
            self.header = TreeHeader {
                root,
                height: 1,
                object_count: 1,
                node_count: 1,
            };
            return self.write_header();
        }

        match self.insert_recursive(self.header.root, object, &bytes)? {
            InsertAction::NoAct | InsertAction::ChangeRep(_) => {}
            InsertAction::Promote(left, right) => self.add_new_root(left, right)?,
        }
        self.header.object_count += 1;
        self.write_header()
    }

    fn insert_recursive(&mut self, page_id: u32, object: &O, bytes: &[u8]) -> Result<InsertAction> {
        let evaluator = self.evaluator.clone();
        let mut page = self.pager.get_page(page_id)?;

        if node_type(&page)? == NodeType::Leaf {
            let added = {
                let mut leaf = LeafNode::attach(&mut page);
                let rep_slot = leaf
                    .representative_slot()
                    .ok_or(SlimError::InvalidHeader("node"))?;
                let rep = O::unserialize(leaf.object(rep_slot));
                let distance = evaluator.distance(&rep, object);
                match leaf.add_entry(bytes) {
                    Some(slot) => {
                        leaf.set_distance(slot, distance);
                        true
                    }
                    None => false,
                }
            };
            if added {
                self.pager.write_page(&page)?;
                self.pager.release_page(page);
                return Ok(InsertAction::NoAct);
            }
            return self.split_leaf(page, object, bytes);
        }

        // pick the child edge: prefer an entry already covering the object,
        // otherwise the one needing the least radius enlargement
        let (chosen, d_chosen, covered, child_id) = {
            let index = IndexNode::attach(&mut page);
            let mut best_covered: Option<(f64, u32, u32)> = None; // (d, occupation, slot)
            let mut best_open: Option<((f64, u32, u32), f64)> = None; // (d - radius, occupation, slot), d
            for slot in 0..index.num_entries() {
                let entry = index.entry(slot);
                let rep = O::unserialize(index.object(slot));
                let d = evaluator.distance(&rep, object);
                if d <= entry.radius {
                    let candidate = (d, entry.n_entries, slot);
                    if best_covered.map_or(true, |best| candidate < best) {
                        best_covered = Some(candidate);
                    }
                } else {
                    let candidate = (d - entry.radius, entry.n_entries, slot);
                    if best_open.map_or(true, |(best, _)| candidate < best) {
                        best_open = Some((candidate, d));
                    }
                }
            }
            let (slot, d, covered) = match (best_covered, best_open) {
                (Some((d, _, slot)), _) => (slot, d, true),
                (None, Some(((_, _, slot), d))) => (slot, d, false),
                (None, None) => return Err(SlimError::InvalidHeader("node")),
            };
            (slot, d, covered, index.entry(slot).page_id)
        };

        let action = self.insert_recursive(child_id, object, bytes)?;
        match action {
            InsertAction::NoAct => {
                {
                    let mut index = IndexNode::attach(&mut page);
                    let n_entries = index.entry(chosen).n_entries;
                    index.set_n_entries(chosen, n_entries + 1);
                    if !covered {
                        index.set_radius(chosen, d_chosen);
                    }
                }
                self.pager.write_page(&page)?;
                self.pager.release_page(page);
                Ok(InsertAction::NoAct)
            }
            InsertAction::ChangeRep(info) => self.replace_entry(page, chosen, info),
            InsertAction::Promote(left, right) => {
                self.install_promotion(page, chosen, left, right)
            }
        }
    }

    /// Replaces the entry at `slot` after its subtree elected a new
    /// representative. When that entry was this node's own representative,
    /// the node re-elects (the incoming representative takes over) and the
    /// change keeps propagating upward.
    fn replace_entry(&mut self, mut page: Page, slot: u32, info: SubtreeInfo) -> Result<InsertAction> {
        let evaluator = self.evaluator.clone();
        let page_id = page.get_id();
        let new_rep = O::unserialize(&info.rep);

        let was_rep = {
            let index = IndexNode::attach(&mut page);
            index.representative_slot() == Some(slot)
        };

        if !was_rep {
            let distance = {
                let index = IndexNode::attach(&mut page);
                let rep_slot = index
                    .representative_slot()
                    .ok_or(SlimError::InvalidHeader("node"))?;
                let node_rep = O::unserialize(index.object(rep_slot));
                evaluator.distance(&node_rep, &new_rep)
            };
            let added = {
                let mut index = IndexNode::attach(&mut page);
                index.remove_entry(slot);
                match index.add_entry(&info.rep) {
                    Some(new_slot) => {
                        index.update_entry(
                            new_slot,
                            distance,
                            info.radius,
                            info.n_entries,
                            info.page_id,
                        );
                        true
                    }
                    None => false,
                }
            };
            if added {
                self.pager.write_page(&page)?;
                self.pager.release_page(page);
                return Ok(InsertAction::NoAct);
            }
            // the larger representative does not fit: the node overflows
            return self.split_index(page, vec![IndexBagItem::from_info(info)]);
        }

        // the replaced entry carried this node's representative: the incoming
        // one takes its place and every other entry's distance is recomputed
        let fits = {
            let mut index = IndexNode::attach(&mut page);
            index.remove_entry(slot);
            for other in 0..index.num_entries() {
                let obj = O::unserialize(index.object(other));
                index.set_distance(other, evaluator.distance(&new_rep, &obj));
            }
            index.free_space() >= info.rep.len() + INDEX_ENTRY_SIZE
        };
        if !fits {
            return self.split_index(page, vec![IndexBagItem::from_info(info)]);
        }

        let up = {
            let mut index = IndexNode::attach(&mut page);
            let new_slot = index.add_entry(&info.rep).expect("fit was checked");
            index.update_entry(new_slot, 0.0, info.radius, info.n_entries, info.page_id);
            SubtreeInfo {
                rep: info.rep.clone(),
                radius: index.minimum_radius(),
                n_entries: index.total_object_count(),
                page_id,
            }
        };
        self.pager.write_page(&page)?;
        self.pager.release_page(page);
        debug!("representative of page {page_id} changed");
        Ok(InsertAction::ChangeRep(up))
    }

    /// Installs the two halves of a split child in place of the entry that
    /// pointed at it, splitting this node in turn when they do not fit.
    fn install_promotion(
        &mut self,
        mut page: Page,
        slot: u32,
        left: SubtreeInfo,
        right: SubtreeInfo,
    ) -> Result<InsertAction> {
        let evaluator = self.evaluator.clone();
        let page_id = page.get_id();
        let left_obj = O::unserialize(&left.rep);
        let right_obj = O::unserialize(&right.rep);

        let (was_rep, node_rep) = {
            let index = IndexNode::attach(&mut page);
            let rep_slot = index
                .representative_slot()
                .ok_or(SlimError::InvalidHeader("node"))?;
            (rep_slot == slot, O::unserialize(index.object(rep_slot)))
        };

        let fits = {
            let mut index = IndexNode::attach(&mut page);
            index.remove_entry(slot);
            index.free_space()
                >= left.rep.len() + right.rep.len() + 2 * INDEX_ENTRY_SIZE
        };
        if !fits {
            return self.split_index(
                page,
                vec![
                    IndexBagItem::from_info(left),
                    IndexBagItem::from_info(right),
                ],
            );
        }

        if !was_rep {
            let d_left = evaluator.distance(&node_rep, &left_obj);
            let d_right = evaluator.distance(&node_rep, &right_obj);
            {
                let mut index = IndexNode::attach(&mut page);
                let s = index.add_entry(&left.rep).expect("fit was checked");
                index.update_entry(s, d_left, left.radius, left.n_entries, left.page_id);
                let s = index.add_entry(&right.rep).expect("fit was checked");
                index.update_entry(s, d_right, right.radius, right.n_entries, right.page_id);
            }
            self.pager.write_page(&page)?;
            self.pager.release_page(page);
            return Ok(InsertAction::NoAct);
        }

        // the split subtree held this node's representative; the left
        // promoted representative takes over
        let up = {
            let mut index = IndexNode::attach(&mut page);
            for other in 0..index.num_entries() {
                let obj = O::unserialize(index.object(other));
                index.set_distance(other, evaluator.distance(&left_obj, &obj));
            }
            let s = index.add_entry(&left.rep).expect("fit was checked");
            index.update_entry(s, 0.0, left.radius, left.n_entries, left.page_id);
            let d = evaluator.distance(&left_obj, &right_obj);
            let s = index.add_entry(&right.rep).expect("fit was checked");
            index.update_entry(s, d, right.radius, right.n_entries, right.page_id);
            SubtreeInfo {
                rep: left.rep.clone(),
                radius: index.minimum_radius(),
                n_entries: index.total_object_count(),
                page_id,
            }
        };
        self.pager.write_page(&page)?;
        self.pager.release_page(page);
        debug!("representative of page {page_id} changed by promotion");
        Ok(InsertAction::ChangeRep(up))
    }

    /// minMax split of an overflowing leaf: the incoming object joins the
    /// stored ones in a bag, two representatives are promoted and the bag is
    /// partitioned between two fresh pages. The overflowing page is disposed.
    fn split_leaf(&mut self, mut page: Page, object: &O, bytes: &[u8]) -> Result<InsertAction> {
        let evaluator = self.evaluator.clone();
        let page_size = self.pager.page_size() as usize;

        let mut bag: Vec<(O, Vec<u8>)> = {
            let leaf = LeafNode::attach(&mut page);
            (0..leaf.num_entries())
                .map(|slot| {
                    let raw = leaf.object(slot).to_vec();
                    (O::unserialize(&raw), raw)
                })
                .collect()
        };
        bag.push((object.clone(), bytes.to_vec()));
        let n = bag.len();

        let distances = pairwise_distances(&bag, |pair| &pair.0, |a, b| evaluator.distance(a, b));

        // promotion: the pair whose worse partition radius is smallest, among
        // pairs whose partitions both fit a page
        let mut best: Option<(f64, f64, usize, (usize, usize))> = None;
        for (p, q) in (0..n).tuple_combinations() {
            let mut radius_p: f64 = 0.0;
            let mut radius_q: f64 = 0.0;
            let mut bytes_p = bag[p].1.len();
            let mut bytes_q = bag[q].1.len();
            let mut count_p = 1usize;
            let mut count_q = 1usize;
            for x in 0..n {
                if x == p || x == q {
                    continue;
                }
                if distances[x][p] <= distances[x][q] {
                    radius_p = radius_p.max(distances[x][p]);
                    bytes_p += bag[x].1.len();
                    count_p += 1;
                } else {
                    radius_q = radius_q.max(distances[x][q]);
                    bytes_q += bag[x].1.len();
                    count_q += 1;
                }
            }
            if !leaf_partition_fits(count_p, bytes_p, page_size)
                || !leaf_partition_fits(count_q, bytes_q, page_size)
            {
                continue;
            }
            let candidate = (
                radius_p.max(radius_q),
                radius_p + radius_q,
                bag[p].1.len() + bag[q].1.len(),
                (p, q),
            );
            if best.map_or(true, |b| {
                (candidate.0, candidate.1, candidate.2, candidate.3)
                    < (b.0, b.1, b.2, b.3)
            }) {
                best = Some(candidate);
            }
        }
        let (p, q) = match best {
            Some((_, _, _, pair)) => pair,
            None => {
                // abort before touching any page, the tree stays as committed
                self.pager.release_page(page);
                return Err(SlimError::SplitInfeasible);
            }
        };
        debug!("leaf split promotes bag objects {p} and {q}");
        self.pager.dispose_page(page)?;

        // partition the bag around the winners (ties go left)
        let mut side_q = vec![false; n];
        for x in 0..n {
            side_q[x] = x != p && (x == q || distances[x][p] > distances[x][q]);
        }

        let left = self.write_leaf_partition(&bag, &distances, p, &side_q, false)?;
        let right = self.write_leaf_partition(&bag, &distances, q, &side_q, true)?;
        self.header.node_count += 1;
        Ok(InsertAction::Promote(left, right))
    }

    fn write_leaf_partition(
        &mut self,
        bag: &[(O, Vec<u8>)],
        distances: &[Vec<f64>],
        rep: usize,
        side_q: &[bool],
        q_side: bool,
    ) -> Result<SubtreeInfo> {
        let mut page = self.pager.new_page()?;
        let mut radius: f64 = 0.0;
        let mut count = 0u32;
        {
            let mut leaf = LeafNode::create(&mut page);
            let slot = leaf
                .add_entry(&bag[rep].1)
                .ok_or(SlimError::SplitInfeasible)?;
            leaf.set_distance(slot, 0.0);
            count += 1;
            for x in 0..bag.len() {
                if x == rep || side_q[x] != q_side {
                    continue;
                }
                let slot = leaf
                    .add_entry(&bag[x].1)
                    .ok_or(SlimError::SplitInfeasible)?;
                leaf.set_distance(slot, distances[x][rep]);
                radius = radius.max(distances[x][rep]);
                count += 1;
            }
        }
        let page_id = page.get_id();
        self.pager.write_page(&page)?;
        self.pager.release_page(page);
        Ok(SubtreeInfo {
            rep: bag[rep].1.clone(),
            radius,
            n_entries: count,
            page_id,
        })
    }

    /// minMax split of an overflowing index node; same promotion rule as the
    /// leaf split, with partition radii accounting for the child radii.
    fn split_index(
        &mut self,
        mut page: Page,
        extras: Vec<IndexBagItem<O>>,
    ) -> Result<InsertAction> {
        let evaluator = self.evaluator.clone();
        let page_size = self.pager.page_size() as usize;

        let mut bag: Vec<IndexBagItem<O>> = {
            let index = IndexNode::attach(&mut page);
            (0..index.num_entries())
                .map(|slot| {
                    let entry = index.entry(slot);
                    let raw = index.object(slot).to_vec();
                    IndexBagItem {
                        object: O::unserialize(&raw),
                        bytes: raw,
                        radius: entry.radius,
                        n_entries: entry.n_entries,
                        page_id: entry.page_id,
                    }
                })
                .collect()
        };
        bag.extend(extras);
        let n = bag.len();

        let distances =
            pairwise_distances(&bag, |item| &item.object, |a, b| evaluator.distance(a, b));

        let mut best: Option<(f64, f64, usize, (usize, usize))> = None;
        for (p, q) in (0..n).tuple_combinations() {
            let mut radius_p = bag[p].radius;
            let mut radius_q = bag[q].radius;
            let mut bytes_p = bag[p].bytes.len();
            let mut bytes_q = bag[q].bytes.len();
            let mut count_p = 1usize;
            let mut count_q = 1usize;
            for x in 0..n {
                if x == p || x == q {
                    continue;
                }
                if distances[x][p] <= distances[x][q] {
                    radius_p = radius_p.max(distances[x][p] + bag[x].radius);
                    bytes_p += bag[x].bytes.len();
                    count_p += 1;
                } else {
                    radius_q = radius_q.max(distances[x][q] + bag[x].radius);
                    bytes_q += bag[x].bytes.len();
                    count_q += 1;
                }
            }
            if !index_partition_fits(count_p, bytes_p, page_size)
                || !index_partition_fits(count_q, bytes_q, page_size)
            {
                continue;
            }
            let candidate = (
                radius_p.max(radius_q),
                radius_p + radius_q,
                bag[p].bytes.len() + bag[q].bytes.len(),
                (p, q),
            );
            if best.map_or(true, |b| {
                (candidate.0, candidate.1, candidate.2, candidate.3)
                    < (b.0, b.1, b.2, b.3)
            }) {
                best = Some(candidate);
            }
        }
        let (p, q) = match best {
            Some((_, _, _, pair)) => pair,
            None => {
                self.pager.release_page(page);
                return Err(SlimError::SplitInfeasible);
            }
        };
        debug!("index split promotes bag entries {p} and {q}");
        self.pager.dispose_page(page)?;

        let mut side_q = vec![false; n];
        for x in 0..n {
            side_q[x] = x != p && (x == q || distances[x][p] > distances[x][q]);
        }

        let left = self.write_index_partition(&bag, &distances, p, &side_q, false)?;
        let right = self.write_index_partition(&bag, &distances, q, &side_q, true)?;
        self.header.node_count += 1;
        Ok(InsertAction::Promote(left, right))
    }

    fn write_index_partition(
        &mut self,
        bag: &[IndexBagItem<O>],
        distances: &[Vec<f64>],
        rep: usize,
        side_q: &[bool],
        q_side: bool,
    ) -> Result<SubtreeInfo> {
        let mut page = self.pager.new_page()?;
        let mut radius = bag[rep].radius;
        let mut count = bag[rep].n_entries;
        {
            let mut index = IndexNode::create(&mut page);
            let slot = index
                .add_entry(&bag[rep].bytes)
                .ok_or(SlimError::SplitInfeasible)?;
            index.update_entry(slot, 0.0, bag[rep].radius, bag[rep].n_entries, bag[rep].page_id);
            for x in 0..bag.len() {
                if x == rep || side_q[x] != q_side {
                    continue;
                }
                let slot = index
                    .add_entry(&bag[x].bytes)
                    .ok_or(SlimError::SplitInfeasible)?;
                index.update_entry(
                    slot,
                    distances[x][rep],
                    bag[x].radius,
                    bag[x].n_entries,
                    bag[x].page_id,
                );
                radius = radius.max(distances[x][rep] + bag[x].radius);
                count += bag[x].n_entries;
            }
        }
        let page_id = page.get_id();
        self.pager.write_page(&page)?;
        self.pager.release_page(page);
        Ok(SubtreeInfo {
            rep: bag[rep].bytes.clone(),
            radius,
            n_entries: count,
            page_id,
        })
    }

    /// A promotion reached the root: a fresh index root adopts the two
    /// halves and the tree grows one level.
    fn add_new_root(&mut self, left: SubtreeInfo, right: SubtreeInfo) -> Result<()> {
        let evaluator = self.evaluator.clone();
        let mut page = self.pager.new_page()?;
        {
            let mut root = IndexNode::create(&mut page);
            let slot = root
                .add_entry(&left.rep)
                .ok_or(SlimError::SplitInfeasible)?;
            root.update_entry(slot, 0.0, left.radius, left.n_entries, left.page_id);
            let d = evaluator.distance(&O::unserialize(&left.rep), &O::unserialize(&right.rep));
            let slot = root
                .add_entry(&right.rep)
                .ok_or(SlimError::SplitInfeasible)?;
            root.update_entry(slot, d, right.radius, right.n_entries, right.page_id);
        }
        let root_id = page.get_id();
        self.pager.write_page(&page)?;
        self.pager.release_page(page);
        self.header.root = root_id;
        self.header.height += 1;
        self.header.node_count += 1;
        debug!("new root page {root_id}, height {}", self.header.height);
        Ok(())
    }

    // -----------------------------------------------------------------
    // queries
    // -----------------------------------------------------------------

    /// Returns every object within `range` of `sample`, with its distance.
    pub fn range_query(&mut self, sample: &O, range: f64) -> Result<ResultSet<O>> {
        let mut result = ResultSet::new();
        if self.header.root != INVALID_PAGE_ID {
            self.range_recursive(self.header.root, sample, range, None, &mut result)?;
        }
        Ok(result)
    }

    /// An existence probe: shares the range pruning rules, and with a radius
    /// of zero returns every object at distance zero from the sample.
    pub fn exists_query(&mut self, sample: &O, range: f64) -> Result<ResultSet<O>> {
        self.range_query(sample, range)
    }

    fn range_recursive(
        &mut self,
        page_id: u32,
        sample: &O,
        range: f64,
        d_rep: Option<f64>,
        result: &mut ResultSet<O>,
    ) -> Result<()> {
        let evaluator = self.evaluator.clone();
        let mut page = self.pager.get_page(page_id)?;

        let children = match SlimNode::from_page(&mut page)? {
            SlimNode::Leaf(leaf) => {
                let d_q = match d_rep {
                    Some(d) => d,
                    None => {
                        let rep_slot = leaf
                            .representative_slot()
                            .ok_or(SlimError::InvalidHeader("node"))?;
                        evaluator.distance(&O::unserialize(leaf.object(rep_slot)), sample)
                    }
                };
                for slot in 0..leaf.num_entries() {
                    // triangle inequality: |d(q, rep) - d(x, rep)| <= d(q, x)
                    if (d_q - leaf.entry(slot).distance).abs() <= range {
                        let x = O::unserialize(leaf.object(slot));
                        let d = evaluator.distance(&x, sample);
                        if d <= range {
                            result.add_pair(x, d);
                        }
                    }
                }
                Vec::new()
            }
            SlimNode::Index(index) => {
                let d_q = match d_rep {
                    Some(d) => d,
                    None => {
                        let rep_slot = index
                            .representative_slot()
                            .ok_or(SlimError::InvalidHeader("node"))?;
                        evaluator.distance(&O::unserialize(index.object(rep_slot)), sample)
                    }
                };
                let mut survivors = Vec::new();
                for slot in 0..index.num_entries() {
                    let entry = index.entry(slot);
                    if (d_q - entry.distance).abs() <= range + entry.radius {
                        let child_rep = O::unserialize(index.object(slot));
                        let d_c = evaluator.distance(&child_rep, sample);
                        if d_c <= range + entry.radius {
                            survivors.push((entry.page_id, d_c));
                        }
                    }
                }
                survivors
            }
        };

        self.pager.release_page(page);
        for (child, d_c) in children {
            self.range_recursive(child, sample, range, Some(d_c), result)?;
        }
        Ok(())
    }

    /// Returns the k objects closest to `sample`. With `tie` set, objects
    /// tied with the k-th distance are included as well.
    pub fn nearest_query(&mut self, sample: &O, k: usize, tie: bool) -> Result<ResultSet<O>> {
        let mut result = ResultSet::with_limit(k, tie);
        if k == 0 || self.header.root == INVALID_PAGE_ID {
            return Ok(result);
        }
        let evaluator = self.evaluator.clone();

        let mut queue = SubtreeQueue::new();
        queue.push(PendingSubtree {
            d_min: 0.0,
            page_id: self.header.root,
            d_rep: None,
        });

        while let Some(pending) = queue.pop() {
            if pending.d_min > result.maximum_distance() {
                break;
            }
            let mut page = self.pager.get_page(pending.page_id)?;
            match SlimNode::from_page(&mut page)? {
                SlimNode::Leaf(leaf) => {
                    let rep_slot = leaf
                        .representative_slot()
                        .ok_or(SlimError::InvalidHeader("node"))?;
                    // the representative was already evaluated (and emitted)
                    // by whoever pushed this node; only the root pays here
                    let d_rep = match pending.d_rep {
                        Some(d) => d,
                        None => {
                            let rep = O::unserialize(leaf.object(rep_slot));
                            let d = evaluator.distance(&rep, sample);
                            if d <= result.maximum_distance() {
                                result.add_pair(rep, d);
                            }
                            d
                        }
                    };
                    for slot in 0..leaf.num_entries() {
                        if slot == rep_slot {
                            continue;
                        }
                        if (d_rep - leaf.entry(slot).distance).abs() <= result.maximum_distance() {
                            let x = O::unserialize(leaf.object(slot));
                            let d = evaluator.distance(&x, sample);
                            if d <= result.maximum_distance() {
                                result.add_pair(x, d);
                            }
                        }
                    }
                }
                SlimNode::Index(index) => {
                    let rep_slot = index
                        .representative_slot()
                        .ok_or(SlimError::InvalidHeader("node"))?;
                    let d_rep = match pending.d_rep {
                        Some(d) => d,
                        None => {
                            let rep = O::unserialize(index.object(rep_slot));
                            let d = evaluator.distance(&rep, sample);
                            if d <= result.maximum_distance() {
                                result.add_pair(rep, d);
                            }
                            d
                        }
                    };
                    for slot in 0..index.num_entries() {
                        let entry = index.entry(slot);
                        let d_c = if slot == rep_slot {
                            // same object as the node representative
                            d_rep
                        } else {
                            if (d_rep - entry.distance).abs()
                                > result.maximum_distance() + entry.radius
                            {
                                continue;
                            }
                            let child_rep = O::unserialize(index.object(slot));
                            let d_c = evaluator.distance(&child_rep, sample);
                            if d_c <= result.maximum_distance() {
                                result.add_pair(child_rep, d_c);
                            }
                            d_c
                        };
                        let d_min = (d_c - entry.radius).max(0.0);
                        if d_min <= result.maximum_distance() {
                            queue.push(PendingSubtree {
                                d_min,
                                page_id: entry.page_id,
                                d_rep: Some(d_c),
                            });
                        }
                    }
                }
            }
            self.pager.release_page(page);
        }
        Ok(result)
    }
}

fn pairwise_distances<T, O: Object>(
    bag: &[T],
    object_of: impl Fn(&T) -> &O,
    distance: impl Fn(&O, &O) -> f64,
) -> Vec<Vec<f64>> {
    let n = bag.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for (i, j) in (0..n).tuple_combinations() {
        let d = distance(object_of(&bag[i]), object_of(&bag[j]));
        matrix[i][j] = d;
        matrix[j][i] = d;
    }
    matrix
}

fn leaf_partition_fits(count: usize, object_bytes: usize, page_size: usize) -> bool {
    NODE_HEADER_SIZE + count * LEAF_ENTRY_SIZE + object_bytes <= page_size
}

fn index_partition_fits(count: usize, object_bytes: usize, page_size: usize) -> bool {
    NODE_HEADER_SIZE + count * INDEX_ENTRY_SIZE + object_bytes <= page_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::city::{City, CityDistance};
    use crate::node::IndexEntry;
    use crate::page_manager::MemoryPageManager;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type MemTree = SlimTree<City, CityDistance, MemoryPageManager>;

    fn memory_tree(page_size: u32) -> MemTree {
        SlimTree::new(MemoryPageManager::new(page_size), CityDistance).unwrap()
    }

    fn distance(a: &City, b: &City) -> f64 {
        CityDistance.distance(a, b)
    }

    fn assert_offsets_strictly_decreasing(offsets: &[u32]) {
        for pair in offsets.windows(2) {
            assert!(pair[1] < pair[0], "entry offsets must strictly decrease");
        }
    }

    enum NodeSnapshot {
        Leaf {
            objects: Vec<City>,
            distances: Vec<f64>,
            offsets: Vec<u32>,
        },
        Index {
            entries: Vec<(City, IndexEntry)>,
            offsets: Vec<u32>,
        },
    }

    fn snapshot(tree: &mut MemTree, page_id: u32) -> NodeSnapshot {
        let mut page = tree.pager.get_page(page_id).unwrap();
        let info = match SlimNode::from_page(&mut page).unwrap() {
            SlimNode::Leaf(leaf) => NodeSnapshot::Leaf {
                objects: (0..leaf.num_entries())
                    .map(|slot| City::unserialize(leaf.object(slot)))
                    .collect(),
                distances: (0..leaf.num_entries())
                    .map(|slot| leaf.entry(slot).distance)
                    .collect(),
                offsets: (0..leaf.num_entries())
                    .map(|slot| leaf.entry(slot).offset)
                    .collect(),
            },
            SlimNode::Index(index) => NodeSnapshot::Index {
                entries: (0..index.num_entries())
                    .map(|slot| (City::unserialize(index.object(slot)), index.entry(slot)))
                    .collect(),
                offsets: (0..index.num_entries())
                    .map(|slot| index.entry(slot).offset)
                    .collect(),
            },
        };
        tree.pager.release_page(page);
        info
    }

    /// Walks a subtree checking every structural invariant, returning the
    /// objects below it and its depth.
    fn audit_subtree(tree: &mut MemTree, page_id: u32) -> (Vec<City>, u32) {
        match snapshot(tree, page_id) {
            NodeSnapshot::Leaf {
                objects,
                distances,
                offsets,
            } => {
                assert!(!objects.is_empty());
                assert_offsets_strictly_decreasing(&offsets);
                assert_eq!(
                    distances.iter().filter(|d| **d == 0.0).count(),
                    1,
                    "a leaf must hold exactly one representative"
                );
                let rep = objects[distances.iter().position(|d| *d == 0.0).unwrap()].clone();
                for (object, d) in objects.iter().zip(&distances) {
                    assert!((distance(&rep, object) - d).abs() < 1e-9);
                }
                (objects, 1)
            }
            NodeSnapshot::Index { entries, offsets } => {
                assert!(!entries.is_empty());
                assert_offsets_strictly_decreasing(&offsets);
                assert_eq!(
                    entries.iter().filter(|(_, e)| e.distance == 0.0).count(),
                    1,
                    "an index node must hold exactly one representative"
                );
                let rep = entries
                    .iter()
                    .find(|(_, e)| e.distance == 0.0)
                    .unwrap()
                    .0
                    .clone();
                let mut all = Vec::new();
                let mut depth = None;
                for (child_rep, entry) in entries {
                    assert!((distance(&rep, &child_rep) - entry.distance).abs() < 1e-9);
                    let (objects, child_depth) = audit_subtree(tree, entry.page_id);
                    assert_eq!(objects.len() as u32, entry.n_entries, "subtree count");
                    for object in &objects {
                        // the covering invariant
                        assert!(distance(&child_rep, object) <= entry.radius + 1e-9);
                    }
                    match depth {
                        None => depth = Some(child_depth),
                        Some(previous) => assert_eq!(previous, child_depth, "balance"),
                    }
                    all.extend(objects);
                }
                (all, depth.unwrap() + 1)
            }
        }
    }

    fn audit(tree: &mut MemTree) -> Vec<City> {
        if tree.header.root == INVALID_PAGE_ID {
            assert_eq!(tree.num_objects(), 0);
            return Vec::new();
        }
        let root = tree.header.root;
        let (objects, depth) = audit_subtree(tree, root);
        assert_eq!(depth, tree.height());
        assert_eq!(objects.len() as u32, tree.num_objects());
        objects
    }

    #[test]
    fn test_first_insert_creates_root_leaf() {
        let mut tree = memory_tree(256);
        let a = City::new("a", 2.0, 3.0);
        tree.add(&a).unwrap();

        assert_eq!(tree.height(), 1);
        assert_eq!(tree.num_objects(), 1);
        assert_eq!(tree.node_count(), 1);

        let result = tree.range_query(&a, 0.0).unwrap();
        assert_eq!(result.len(), 1);
        let (found, d) = result.get(0).unwrap();
        assert!(found.is_equal(&a));
        assert_eq!(*d, 0.0);
        audit(&mut tree);
    }

    #[test]
    fn test_two_objects_in_root_leaf() {
        let mut tree = memory_tree(256);
        let a = City::new("a", 0.0, 0.0);
        let b = City::new("b", 1.0, 0.0);
        tree.add(&a).unwrap();
        tree.add(&b).unwrap();

        let result = tree.nearest_query(&a, 1, false).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.get(0).unwrap().0.is_equal(&a));
        assert_eq!(result.get(0).unwrap().1, 0.0);

        let result = tree.nearest_query(&a, 2, false).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.get(0).unwrap().0.is_equal(&a));
        assert!(result.get(1).unwrap().0.is_equal(&b));
        assert_eq!(result.get(1).unwrap().1, 1.0);
        audit(&mut tree);
    }

    // page size chosen so exactly three one-letter cities fit a leaf
    const SPLIT_PAGE_SIZE: u32 = 104;

    #[test]
    fn test_fourth_insert_forces_split() {
        let mut tree = memory_tree(SPLIT_PAGE_SIZE);
        let points = [
            City::new("a", 0.0, 0.0),
            City::new("b", 1.0, 0.0),
            City::new("c", 2.0, 0.0),
            City::new("d", 3.0, 0.0),
        ];
        for (i, point) in points.iter().enumerate() {
            tree.add(point).unwrap();
            assert_eq!(tree.num_objects() as usize, i + 1);
        }

        assert_eq!(tree.height(), 2);
        let root = tree.header.root;
        match snapshot(&mut tree, root) {
            NodeSnapshot::Index { entries, .. } => {
                assert_eq!(entries.len(), 2);
                for (_, entry) in &entries {
                    assert!(entry.n_entries >= 1);
                }
            }
            NodeSnapshot::Leaf { .. } => panic!("root must be an index node after the split"),
        }
        audit(&mut tree);

        let result = tree
            .range_query(&points[0], distance(&points[0], &points[3]))
            .unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_nearest_query_tie_handling() {
        let mut tree = memory_tree(256);
        let q = City::new("q", 0.0, 0.0);
        tree.add(&City::new("a", 1.0, 0.0)).unwrap(); // distance 1
        tree.add(&City::new("b", 0.0, 2.0)).unwrap(); // distance 2
        tree.add(&City::new("c", 2.0, 0.0)).unwrap(); // distance 2
        tree.add(&City::new("d", 3.0, 0.0)).unwrap(); // distance 3

        let plain = tree.nearest_query(&q, 2, false).unwrap();
        assert_eq!(plain.len(), 2);
        let distances: Vec<f64> = plain.iter().map(|pair| pair.1).collect();
        assert_eq!(distances, vec![1.0, 2.0]);

        let tied = tree.nearest_query(&q, 2, true).unwrap();
        assert_eq!(tied.len(), 3);
        let distances: Vec<f64> = tied.iter().map(|pair| pair.1).collect();
        assert_eq!(distances, vec![1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_range_query_prunes_far_subtree() {
        let mut tree = memory_tree(SPLIT_PAGE_SIZE);
        // two tight clusters far apart; the fourth insert splits them
        let a = City::new("a", 0.0, 0.0);
        tree.add(&a).unwrap();
        tree.add(&City::new("b", 0.5, 0.0)).unwrap();
        tree.add(&City::new("c", 10.0, 0.0)).unwrap();
        tree.add(&City::new("d", 10.5, 0.0)).unwrap();
        assert_eq!(tree.height(), 2);
        audit(&mut tree);

        tree.page_manager_mut().reset_statistics();
        let result = tree.range_query(&a, 5.0).unwrap();
        assert_eq!(result.len(), 2);
        // the far cluster's leaf must not be fetched: root plus one leaf
        assert_eq!(tree.page_manager().reads(), 2);
    }

    #[test]
    fn test_random_inserts_keep_invariants_and_query_soundness() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = memory_tree(256);
        let mut reference = Vec::new();

        for i in 0..150 {
            let name = format!("c{i}");
            let city = City::new(&name, rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0));
            tree.add(&city).unwrap();
            reference.push(city);
            if i % 10 == 9 {
                audit(&mut tree);
            }
        }
        assert!(tree.height() >= 2);
        let indexed = audit(&mut tree);
        assert_eq!(indexed.len(), reference.len());

        let q = City::new("q", 50.0, 50.0);
        for radius in [0.0, 5.0, 20.0, 75.0, 200.0] {
            let result = tree.range_query(&q, radius).unwrap();
            let mut expected: Vec<(String, f64)> = reference
                .iter()
                .filter(|city| distance(&q, city) <= radius)
                .map(|city| (city.name().to_string(), distance(&q, city)))
                .collect();
            expected.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

            let mut got: Vec<(String, f64)> = result
                .iter()
                .map(|(city, d)| (city.name().to_string(), *d))
                .collect();
            got.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            assert_eq!(got, expected, "range query vs sequential scan, r={radius}");
        }

        let mut by_distance: Vec<&City> = reference.iter().collect();
        by_distance.sort_by(|a, b| distance(&q, a).total_cmp(&distance(&q, b)));
        for k in [1usize, 3, 10, 150, 500] {
            let result = tree.nearest_query(&q, k, false).unwrap();
            let expected = k.min(reference.len());
            assert_eq!(result.len(), expected, "k={k}");
            for (i, (city, d)) in result.iter().enumerate() {
                assert_eq!(*d, distance(&q, city));
                assert_eq!(*d, distance(&q, by_distance[i]), "k={k} position {i}");
            }
        }
    }

    #[test]
    fn test_insertion_order_does_not_change_results() {
        let mut rng = StdRng::seed_from_u64(42);
        let cities: Vec<City> = (0..60)
            .map(|i| {
                City::new(
                    &format!("c{i}"),
                    rng.gen_range(0.0..50.0),
                    rng.gen_range(0.0..50.0),
                )
            })
            .collect();

        let mut forward = memory_tree(256);
        for city in &cities {
            forward.add(city).unwrap();
        }
        let mut backward = memory_tree(256);
        for city in cities.iter().rev() {
            backward.add(city).unwrap();
        }

        let q = City::new("q", 25.0, 25.0);
        for radius in [3.0, 12.0, 40.0] {
            let names = |result: ResultSet<City>| {
                let mut names: Vec<String> = result
                    .into_iter()
                    .map(|(city, _)| city.name().to_string())
                    .collect();
                names.sort();
                names
            };
            assert_eq!(
                names(forward.range_query(&q, radius).unwrap()),
                names(backward.range_query(&q, radius).unwrap())
            );
        }
    }

    #[test]
    fn test_nearest_boundaries() {
        let mut tree = memory_tree(256);
        let q = City::new("q", 0.0, 0.0);
        assert!(tree.nearest_query(&q, 1, false).unwrap().is_empty());

        for i in 0..5 {
            tree.add(&City::new(&format!("c{i}"), i as f64, 0.0)).unwrap();
        }
        assert!(tree.nearest_query(&q, 0, false).unwrap().is_empty());
        assert_eq!(tree.nearest_query(&q, 5, false).unwrap().len(), 5);
        assert_eq!(tree.nearest_query(&q, 100, false).unwrap().len(), 5);
    }

    #[test]
    fn test_exists_query_zero_radius_returns_all_equal() {
        let mut tree = memory_tree(256);
        // two distinct objects at the same spot
        tree.add(&City::new("x", 1.0, 1.0)).unwrap();
        tree.add(&City::new("y", 1.0, 1.0)).unwrap();
        tree.add(&City::new("z", 5.0, 5.0)).unwrap();

        let probe = City::new("probe", 1.0, 1.0);
        let result = tree.exists_query(&probe, 0.0).unwrap();
        assert_eq!(result.len(), 2);
        for (_, d) in result.iter() {
            assert_eq!(*d, 0.0);
        }
    }

    #[test]
    fn test_oversized_object_fails_and_counts_nothing() {
        let huge_name = "x".repeat(300);

        // as the very first object
        let mut tree = memory_tree(128);
        assert!(matches!(
            tree.add(&City::new(&huge_name, 0.0, 0.0)),
            Err(SlimError::SplitInfeasible)
        ));
        assert_eq!(tree.num_objects(), 0);

        // after normal objects: the insert aborts, the tree stays usable
        let mut tree = memory_tree(128);
        tree.add(&City::new("a", 0.0, 0.0)).unwrap();
        tree.add(&City::new("b", 1.0, 0.0)).unwrap();
        assert!(matches!(
            tree.add(&City::new(&huge_name, 2.0, 0.0)),
            Err(SlimError::SplitInfeasible)
        ));
        assert_eq!(tree.num_objects(), 2);
        audit(&mut tree);
        assert_eq!(tree.range_query(&City::new("q", 0.0, 0.0), 10.0).unwrap().len(), 2);
    }

    #[test]
    fn test_queries_always_pay_at_least_one_distance() {
        let mut tree = memory_tree(SPLIT_PAGE_SIZE);
        for i in 0..12 {
            tree.add(&City::new(&format!("{i}"), i as f64, 0.0)).unwrap();
        }
        let q = City::new("q", 4.0, 0.0);

        tree.metric_evaluator().reset_statistics();
        tree.range_query(&q, 1.0).unwrap();
        let after_range = tree.metric_evaluator().distance_count();
        assert!(after_range >= 1);

        tree.nearest_query(&q, 2, false).unwrap();
        assert!(tree.metric_evaluator().distance_count() > after_range);
    }

    #[test]
    fn test_grows_three_levels() {
        let mut tree = memory_tree(SPLIT_PAGE_SIZE);
        let mut rng = StdRng::seed_from_u64(7);
        let cities: Vec<City> = (0..40)
            .map(|i| {
                // single-character names keep the per-object size fixed
                let name = char::from(b'a' + (i % 26) as u8).to_string();
                City::new(&name, rng.gen_range(0.0..30.0), rng.gen_range(0.0..30.0))
            })
            .collect();
        for city in &cities {
            tree.add(city).unwrap();
        }
        assert!(tree.height() >= 3, "height is {}", tree.height());
        audit(&mut tree);

        // every stored object is reachable by a point query
        for city in &cities {
            let result = tree.range_query(city, 0.0).unwrap();
            assert!(result.iter().any(|(found, _)| found.is_equal(city)));
        }
    }
}
