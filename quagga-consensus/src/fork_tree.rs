//! The fork tree: every block header this node has seen, as an arena of
//! index nodes.
//!
//! Multiple tips coexist; the *header chain* ends at the tip with the most
//! cumulative work (first observed wins ties), and the *active chain* is the
//! fully-validated prefix committed to the UTXO set. Nodes are allocated in
//! a growable vector owned by the engine; children refer to parents by
//! index, so there is no shared ownership to manage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use quagga_chain::{
    block::{self, Header},
    work::difficulty::Work,
};
use quagga_state::FilePos;

/// An index into the fork-tree arena.
pub type NodeId = usize;

bitflags::bitflags! {
    /// Validation status bits. Monotonic: bits are only ever set, and
    /// `INVALID` dominates every other bit.
    pub struct Status: u8 {
        const HEADER_CHECKED       = 0b0000_0001;
        const BODY_CHECKED         = 0b0000_0010;
        const PARENT_VALID         = 0b0000_0100;
        const CHAIN_HEADERS_VALID  = 0b0000_1000;
        const FULLY_VALIDATED      = 0b0001_0000;
        const INVALID              = 0b1000_0000;
    }
}

/// One block header's place in the fork tree.
#[derive(Debug)]
pub struct IndexNode {
    pub hash: block::Hash,
    pub header: Header,
    /// Chain height; -1 while the parent chain is unknown.
    pub height: i32,
    pub parent: Option<NodeId>,
    /// Skip pointer for O(log h) ancestor lookups.
    pub skip: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Cumulative work from genesis.
    pub chain_work: Work,
    pub status: Status,
    /// Where the raw block lives on disk, once stored.
    pub pos: Option<FilePos>,
    /// Where the undo data lives on disk, once connected.
    pub undo_pos: Option<FilePos>,
    pub tx_count: u32,
}

/// Determines which ancestor the skip pointer of a block at `height` aims
/// at, mirroring the classic index scheme.
fn skip_height(height: i32) -> i32 {
    fn invert_lowest_one(n: i32) -> i32 {
        n & (n - 1)
    }
    if height < 2 {
        0
    } else if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// The arena of all seen headers.
pub struct ForkTree {
    nodes: Vec<IndexNode>,
    by_hash: HashMap<block::Hash, NodeId>,
    best_header: Option<NodeId>,
}

impl ForkTree {
    pub fn new() -> ForkTree {
        ForkTree {
            nodes: Vec::new(),
            by_hash: HashMap::new(),
            best_header: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &IndexNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut IndexNode {
        &mut self.nodes[id]
    }

    pub fn by_hash(&self, hash: &block::Hash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    /// Insert a header, linking it to its parent when the parent is known.
    ///
    /// `is_genesis` marks the chain root; it is the only node allowed to
    /// have no parent and a height of 0.
    pub fn insert(&mut self, header: Header, is_genesis: bool) -> NodeId {
        let hash = header.hash();
        if let Some(existing) = self.by_hash(&hash) {
            return existing;
        }

        let parent = self.by_hash(&header.previous_block_hash);
        let id = self.nodes.len();
        self.nodes.push(IndexNode {
            hash,
            header,
            height: if is_genesis { 0 } else { -1 },
            parent,
            skip: None,
            children: Vec::new(),
            chain_work: if is_genesis {
                header
                    .difficulty_threshold
                    .to_work()
                    .unwrap_or_else(Work::zero)
            } else {
                Work::zero()
            },
            status: Status::HEADER_CHECKED,
            pos: None,
            undo_pos: None,
            tx_count: 0,
        });
        self.by_hash.insert(hash, id);

        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
            if self.nodes[parent].height >= 0 {
                self.connect(id);
            }
            if self.nodes[parent].status.contains(Status::INVALID) {
                self.nodes[id].status.insert(Status::INVALID);
            }
        } else if is_genesis {
            self.maybe_update_best(id);
        }
        id
    }

    /// Assign height, chain work and the skip pointer now that `id`'s
    /// parent has a height. Called at insertion, and again when orphans are
    /// adopted.
    pub fn connect(&mut self, id: NodeId) {
        let parent = self.nodes[id].parent.expect("connect requires a parent");
        debug_assert!(self.nodes[parent].height >= 0);

        let height = self.nodes[parent].height + 1;
        let proof = self.nodes[id]
            .header
            .difficulty_threshold
            .to_work()
            .unwrap_or_else(Work::zero);
        self.nodes[id].height = height;
        self.nodes[id].chain_work = self.nodes[parent].chain_work + proof;
        self.nodes[id].skip = self.ancestor(parent, skip_height(height));
        if self.nodes[parent].status.contains(Status::INVALID) {
            self.nodes[id].status.insert(Status::INVALID);
        }
        self.maybe_update_best(id);
    }

    /// Re-link an orphan under a newly known parent.
    pub fn adopt(&mut self, id: NodeId, parent: NodeId) {
        debug_assert_eq!(self.nodes[id].parent, None);
        self.nodes[id].parent = Some(parent);
        self.nodes[parent].children.push(id);
        self.connect(id);
    }

    /// Connect any not-yet-connected descendants of a freshly connected
    /// node, depth first.
    pub fn connect_descendants(&mut self, id: NodeId) {
        let mut stack: Vec<NodeId> = self.nodes[id].children.clone();
        while let Some(child) = stack.pop() {
            if self.nodes[child].height < 0 {
                self.connect(child);
                stack.extend(self.nodes[child].children.iter().copied());
            }
        }
    }

    /// Set status bits on a node.
    pub fn add_status(&mut self, id: NodeId, bits: Status) {
        self.nodes[id].status.insert(bits);
    }

    /// Mark a node invalid and propagate the bit to all descendants, then
    /// re-elect the best header among the remaining valid tips.
    pub fn mark_invalid(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.nodes[current].status.insert(Status::INVALID);
            stack.extend(self.nodes[current].children.iter().copied());
        }
        self.recompute_best();
    }

    fn maybe_update_best(&mut self, id: NodeId) {
        if self.nodes[id].status.contains(Status::INVALID) || self.nodes[id].height < 0 {
            return;
        }
        match self.best_header {
            // Strictly greater work wins; on a tie the first observed tip
            // is kept.
            Some(best) if self.nodes[id].chain_work <= self.nodes[best].chain_work => {}
            _ => self.best_header = Some(id),
        }
    }

    fn recompute_best(&mut self) {
        self.best_header = None;
        for id in 0..self.nodes.len() {
            self.maybe_update_best(id);
        }
    }

    /// The tip of the header chain: maximum chain work among valid nodes.
    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    /// All connected leaf nodes.
    pub fn tips(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| self.nodes[id].height >= 0 && self.nodes[id].children.is_empty())
            .collect()
    }

    /// The ancestor of `id` at exactly `height`, using skip pointers.
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        if height < 0 || height > self.nodes[id].height {
            return None;
        }
        let mut walk = id;
        while self.nodes[walk].height > height {
            if let Some(skip) = self.nodes[walk].skip {
                if self.nodes[skip].height >= height {
                    walk = skip;
                    continue;
                }
            }
            walk = self.nodes[walk].parent?;
        }
        Some(walk)
    }

    /// Whether `node` lies on the chain ending at `tip`.
    pub fn contains(&self, tip: NodeId, node: NodeId) -> bool {
        self.ancestor(tip, self.nodes[node].height) == Some(node)
    }

    /// The highest common ancestor of two connected nodes.
    pub fn fork_point(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let height = std::cmp::min(self.nodes[a].height, self.nodes[b].height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.nodes[a].parent?;
            b = self.nodes[b].parent?;
        }
        Some(a)
    }

    /// The median time of the 11 blocks ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> DateTime<Utc> {
        let mut times: Vec<DateTime<Utc>> = Vec::with_capacity(11);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == 11 {
                break;
            }
            times.push(self.nodes[current].header.time);
            walk = self.nodes[current].parent;
        }
        times.sort();
        times[times.len() / 2]
    }

    /// How many of the `window` blocks ending at `from` have a header
    /// version of at least `min_version`.
    pub fn count_versions_at_least(
        &self,
        from: NodeId,
        min_version: i32,
        window: usize,
    ) -> usize {
        let mut count = 0;
        let mut walk = Some(from);
        let mut seen = 0;
        while let Some(current) = walk {
            if seen == window {
                break;
            }
            if self.nodes[current].header.version >= min_version {
                count += 1;
            }
            seen += 1;
            walk = self.nodes[current].parent;
        }
        count
    }
}

impl Default for ForkTree {
    fn default() -> Self {
        ForkTree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quagga_chain::{block::merkle, work::difficulty::CompactDifficulty};

    fn header(parent: block::Hash, nonce: u32) -> Header {
        Header::new(
            1,
            parent,
            merkle::Root([0; 32]),
            Utc.timestamp(1_296_688_602 + nonce as i64 * 600, 0),
            CompactDifficulty(0x207f_ffff),
            nonce,
        )
    }

    fn build_chain(tree: &mut ForkTree, len: u32) -> Vec<NodeId> {
        let genesis = header(block::Hash([0; 32]), 0);
        let mut ids = vec![tree.insert(genesis, true)];
        let mut parent_hash = genesis.hash();
        for nonce in 1..=len {
            let h = header(parent_hash, nonce);
            parent_hash = h.hash();
            ids.push(tree.insert(h, false));
        }
        ids
    }

    #[test]
    fn heights_and_work_accumulate() {
        quagga_test::init();

        let mut tree = ForkTree::new();
        let ids = build_chain(&mut tree, 10);
        for (height, id) in ids.iter().enumerate() {
            assert_eq!(tree.get(*id).height, height as i32);
        }
        assert!(tree.get(ids[10]).chain_work > tree.get(ids[0]).chain_work);
        assert_eq!(tree.best_header(), Some(ids[10]));
    }

    #[test]
    fn ancestor_via_skip_pointers() {
        quagga_test::init();

        let mut tree = ForkTree::new();
        let ids = build_chain(&mut tree, 100);
        for target in &[0i32, 1, 31, 32, 63, 99, 100] {
            assert_eq!(tree.ancestor(ids[100], *target), Some(ids[*target as usize]));
        }
        assert_eq!(tree.ancestor(ids[50], 60), None);
        assert!(tree.contains(ids[100], ids[42]));
    }

    #[test]
    fn first_observed_tip_wins_ties() {
        quagga_test::init();

        let mut tree = ForkTree::new();
        let ids = build_chain(&mut tree, 5);
        let best_before = tree.best_header();

        // A sibling of the tip with identical work must not displace it.
        let sibling = header(tree.get(ids[4]).hash, 9999);
        let sibling_id = tree.insert(sibling, false);
        assert_eq!(tree.get(sibling_id).height, 5);
        assert_eq!(tree.best_header(), best_before);

        // But extending the sibling wins.
        let nephew = header(sibling.hash(), 10_000);
        let nephew_id = tree.insert(nephew, false);
        assert_eq!(tree.best_header(), Some(nephew_id));
    }

    #[test]
    fn invalid_propagates_and_reelects_best() {
        quagga_test::init();

        let mut tree = ForkTree::new();
        let ids = build_chain(&mut tree, 10);
        tree.mark_invalid(ids[7]);

        for id in &ids[7..] {
            assert!(tree.get(*id).status.contains(Status::INVALID));
        }
        for id in &ids[..7] {
            assert!(!tree.get(*id).status.contains(Status::INVALID));
        }
        assert_eq!(tree.best_header(), Some(ids[6]));
    }

    #[test]
    fn orphan_adoption_assigns_heights() {
        quagga_test::init();

        let mut tree = ForkTree::new();
        let ids = build_chain(&mut tree, 2);

        // A child whose parent has not been seen yet.
        let missing_parent = header(tree.get(ids[2]).hash, 77);
        let orphan = header(missing_parent.hash(), 78);
        let orphan_id = tree.insert(orphan, false);
        assert_eq!(tree.get(orphan_id).height, -1);

        let parent_id = tree.insert(missing_parent, false);
        assert_eq!(tree.get(parent_id).height, 3);

        tree.adopt(orphan_id, parent_id);
        assert_eq!(tree.get(orphan_id).height, 4);
        assert_eq!(tree.best_header(), Some(orphan_id));
    }

    #[test]
    fn median_time_past_is_the_middle_timestamp() {
        quagga_test::init();

        let mut tree = ForkTree::new();
        let ids = build_chain(&mut tree, 14);
        // The window for the tip covers blocks 4..=14, whose median is
        // block 9's time.
        let expected = tree.get(ids[9]).header.time;
        assert_eq!(tree.median_time_past(ids[14]), expected);
    }
}
