//! The v1 B-tree engine: cycle-guarded traversal for the read path and
//! ordered builders (with SNOD and node splitting) for the write path.

use std::collections::HashSet;

use crate::alloc::Allocator;
use crate::error::{Hdf5Error, Result};
use crate::heap::read_name;
use crate::parse::{self, ChunkKey, TreeKey};

fn check_signature(file: &[u8], address: u64) -> Result<()> {
    let start = address as usize;
    if start + 4 > file.len() {
        return Err(Hdf5Error::TruncatedBuffer {
            needed: start + 4,
            available: file.len(),
        });
    }
    if &file[start..start + 4] != b"TREE" {
        return Err(Hdf5Error::BadSignature {
            expected: "TREE",
            address,
        });
    }
    Ok(())
}

/// Walk a group B-tree and return the SNOD addresses in key order.
///
/// The visited-address set makes re-entering any node fatal; key order is
/// validated against the names the heap offsets resolve to.
pub fn collect_group_snods(
    file: &[u8],
    root: u64,
    offset_size: u8,
    length_size: u8,
    heap: &parse::LocalHeap,
) -> Result<Vec<u64>> {
    let mut snods = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root, None::<u8>)];

    while let Some((address, expected_level)) = stack.pop() {
        if !visited.insert(address) {
            return Err(Hdf5Error::CyclicBtree { address });
        }
        check_signature(file, address)?;
        let (_, node) = parse::tree_node(&file[address as usize..], offset_size, length_size, 0)?;
        if node.node_type != 0 {
            return Err(Hdf5Error::CorruptStructure(format!(
                "node type {} in a group B-tree",
                node.node_type
            )));
        }
        if let Some(expected) = expected_level {
            if node.node_level != expected {
                return Err(Hdf5Error::CorruptStructure(format!(
                    "B-tree node at {:#x} has level {}, expected {}",
                    address, node.node_level, expected
                )));
            }
        }

        // Group keys must resolve in name order, strictly increasing.
        let mut previous: Option<String> = None;
        for entry in &node.entries {
            if let TreeKey::Group(offset) = &entry.key {
                // Key 0 is conventionally the empty string.
                let name = read_name(file, heap, *offset)?;
                if let Some(prev) = &previous {
                    if *prev >= name && !name.is_empty() {
                        return Err(Hdf5Error::CorruptStructure(format!(
                            "B-tree keys out of order at {:#x}: {:?} before {:?}",
                            address, prev, name
                        )));
                    }
                }
                previous = Some(name);
            }
        }

        if node.node_level == 0 {
            for entry in &node.entries {
                snods.push(entry.child);
            }
        } else {
            for entry in node.entries.iter().rev() {
                stack.push((entry.child, Some(node.node_level - 1)));
            }
        }
    }
    Ok(snods)
}

/// Walk a chunk B-tree and return `(key, chunk address)` pairs in key
/// order. `rank` is the number of stored key dimensions (dataset rank + 1).
pub fn collect_chunks(
    file: &[u8],
    root: u64,
    offset_size: u8,
    length_size: u8,
    rank: u8,
) -> Result<Vec<(ChunkKey, u64)>> {
    let mut chunks = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root, None::<u8>)];

    while let Some((address, expected_level)) = stack.pop() {
        if !visited.insert(address) {
            return Err(Hdf5Error::CyclicBtree { address });
        }
        check_signature(file, address)?;
        let (_, node) =
            parse::tree_node(&file[address as usize..], offset_size, length_size, rank)?;
        if node.node_type != 1 {
            return Err(Hdf5Error::CorruptStructure(format!(
                "node type {} in a chunk B-tree",
                node.node_type
            )));
        }
        if let Some(expected) = expected_level {
            if node.node_level != expected {
                return Err(Hdf5Error::CorruptStructure(format!(
                    "B-tree node at {:#x} has level {}, expected {}",
                    address, node.node_level, expected
                )));
            }
        }

        let mut previous: Option<&ChunkKey> = None;
        for entry in &node.entries {
            if let TreeKey::Chunk(key) = &entry.key {
                if let Some(prev) = previous {
                    if prev.offsets >= key.offsets {
                        return Err(Hdf5Error::CorruptStructure(format!(
                            "chunk keys out of order at {:#x}",
                            address
                        )));
                    }
                }
                previous = Some(key);
            }
        }

        if node.node_level == 0 {
            for entry in &node.entries {
                if let TreeKey::Chunk(key) = &entry.key {
                    chunks.push((key.clone(), entry.child));
                }
            }
        } else {
            for entry in node.entries.iter().rev() {
                stack.push((entry.child, Some(node.node_level - 1)));
            }
        }
    }
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// Write side

/// What a symbol-table entry caches about its object.
#[derive(Debug, Clone)]
pub enum SnodCache {
    Object,
    Group {
        btree_address: u64,
        heap_address: u64,
    },
}

#[derive(Debug, Clone)]
pub struct SnodEntry {
    pub name: String,
    pub name_offset: u64,
    pub header_address: u64,
    pub cache: SnodCache,
}

/// One symbol-table node under construction; entries stay sorted by name.
#[derive(Debug)]
pub struct SnodBuilder {
    pub address: u64,
    pub entries: Vec<SnodEntry>,
}

impl SnodBuilder {
    pub fn new(address: u64) -> SnodBuilder {
        SnodBuilder {
            address,
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: SnodEntry) {
        let at = self
            .entries
            .binary_search_by(|e| e.name.as_str().cmp(&entry.name))
            .unwrap_or_else(|i| i);
        self.entries.insert(at, entry);
    }

    pub fn remove(&mut self, name_offset: u64) -> Option<SnodEntry> {
        let at = self.entries.iter().position(|e| e.name_offset == name_offset)?;
        Some(self.entries.remove(at))
    }

    pub fn lookup(&self, name_offset: u64) -> Option<&SnodEntry> {
        self.entries.iter().find(|e| e.name_offset == name_offset)
    }

    pub fn list(&self) -> &[SnodEntry] {
        &self.entries
    }

    fn max_name(&self) -> &str {
        self.entries.last().map(|e| e.name.as_str()).unwrap_or("")
    }

    fn max_name_offset(&self) -> u64 {
        self.entries.last().map(|e| e.name_offset).unwrap_or(0)
    }
}

/// A finished B-tree node ready for serialization.
#[derive(Debug)]
pub struct PlannedNode {
    pub address: u64,
    pub level: u8,
    pub children: Vec<u64>,
    /// `children.len() + 1` boundary keys.
    pub keys: Vec<u64>,
    pub left_sibling: u64,
    pub right_sibling: u64,
}

/// Builder for one group's B-tree over its SNODs.
///
/// Entries are bulk-loaded in name order as objects are linked; node
/// splitting happens on SNOD overflow, and the node levels are assembled
/// at finalize time with the preallocated root block on top.
pub struct GroupTreeBuilder {
    root_address: u64,
    snod_capacity: usize,
    node_capacity: usize,
    snod_block_size: u64,
    snods: Vec<SnodBuilder>,
}

impl GroupTreeBuilder {
    pub fn new(
        root_address: u64,
        leaf_k: u16,
        internal_k: u16,
        snod_block_size: u64,
    ) -> GroupTreeBuilder {
        // SNOD blocks are allocated lazily, on first insert and on split.
        GroupTreeBuilder {
            root_address,
            snod_capacity: 2 * leaf_k as usize,
            node_capacity: 2 * internal_k as usize,
            snod_block_size,
            snods: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snods.iter().all(|s| s.entries.is_empty())
    }

    pub fn entry_count(&self) -> usize {
        self.snods.iter().map(|s| s.entries.len()).sum()
    }

    pub fn find(&self, name: &str) -> Option<&SnodEntry> {
        let snod = self.target_snod_index(name)?;
        self.snods[snod]
            .entries
            .iter()
            .find(|e| e.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SnodEntry> {
        let snod = self.target_snod_index(name)?;
        let offset = self.snods[snod]
            .entries
            .iter()
            .find(|e| e.name == name)?
            .name_offset;
        self.snods[snod].remove(offset)
    }

    fn target_snod_index(&self, name: &str) -> Option<usize> {
        if self.snods.is_empty() {
            return None;
        }
        let at = self
            .snods
            .iter()
            .position(|s| s.max_name() >= name)
            .unwrap_or(self.snods.len() - 1);
        Some(at)
    }

    /// Link one object. Splits the target SNOD when it exceeds
    /// `2 * group_leaf_k` entries.
    pub fn insert(&mut self, entry: SnodEntry, alloc: &mut Allocator) -> Result<()> {
        if self.snods.is_empty() {
            let address = alloc.allocate(self.snod_block_size)?;
            self.snods.push(SnodBuilder::new(address));
        }
        let at = self
            .target_snod_index(&entry.name)
            .expect("at least one snod");
        if self.snods[at].entries.iter().any(|e| e.name == entry.name) {
            return Err(Hdf5Error::CorruptStructure(format!(
                "duplicate link name {:?} in one group",
                entry.name
            )));
        }
        self.snods[at].add(entry);

        if self.snods[at].entries.len() > self.snod_capacity {
            let half = self.snods[at].entries.len() / 2;
            let tail = self.snods[at].entries.split_off(half);
            let address = alloc.allocate(self.snod_block_size)?;
            log::debug!(
                "snod at {:#x} split, new snod at {:#x}",
                self.snods[at].address,
                address
            );
            let mut right = SnodBuilder::new(address);
            right.entries = tail;
            self.snods.insert(at + 1, right);
        }
        Ok(())
    }

    pub fn snods(&self) -> &[SnodBuilder] {
        &self.snods
    }

    /// Assemble the node levels bottom-up. The top node lands on the
    /// preallocated root block; every other node gets a fresh block.
    pub fn finalize(&self, alloc: &mut Allocator, node_block_size: u64) -> Result<Vec<PlannedNode>> {
        // (child address, boundary key offset of its greatest name)
        let mut level_children: Vec<(u64, u64)> = self
            .snods
            .iter()
            .map(|s| (s.address, s.max_name_offset()))
            .collect();
        let mut level: u8 = 0;
        let mut nodes = Vec::new();

        if level_children.is_empty() {
            nodes.push(PlannedNode {
                address: self.root_address,
                level: 0,
                children: Vec::new(),
                keys: Vec::new(),
                left_sibling: u64::MAX,
                right_sibling: u64::MAX,
            });
            return Ok(nodes);
        }

        loop {
            let n_nodes = (level_children.len() + self.node_capacity - 1) / self.node_capacity;
            let mut addresses = Vec::with_capacity(n_nodes);
            for _ in 0..n_nodes {
                if n_nodes == 1 {
                    addresses.push(self.root_address);
                } else {
                    addresses.push(alloc.allocate(node_block_size)?);
                }
            }

            let mut next_level: Vec<(u64, u64)> = Vec::with_capacity(n_nodes);
            for (i, chunk) in level_children.chunks(self.node_capacity).enumerate() {
                let mut keys = Vec::with_capacity(chunk.len() + 1);
                // The left boundary: the previous chunk's greatest name,
                // or the empty string for the first node.
                let left_boundary = if i == 0 {
                    0
                } else {
                    level_children[i * self.node_capacity - 1].1
                };
                keys.push(left_boundary);
                for &(_, boundary) in chunk {
                    keys.push(boundary);
                }
                nodes.push(PlannedNode {
                    address: addresses[i],
                    level,
                    children: chunk.iter().map(|&(child, _)| child).collect(),
                    keys,
                    left_sibling: if i == 0 { u64::MAX } else { addresses[i - 1] },
                    right_sibling: if i + 1 == n_nodes {
                        u64::MAX
                    } else {
                        addresses[i + 1]
                    },
                });
                next_level.push((addresses[i], chunk.last().expect("non-empty").1));
            }

            if n_nodes == 1 {
                return Ok(nodes);
            }
            level_children = next_level;
            level += 1;
            if level > 32 {
                return Err(Hdf5Error::CorruptStructure(
                    "group B-tree deeper than 32 levels".to_string(),
                ));
            }
        }
    }
}

/// A finished chunk-tree node.
#[derive(Debug)]
pub struct PlannedChunkNode {
    pub address: u64,
    pub level: u8,
    pub children: Vec<u64>,
    pub keys: Vec<ChunkKey>,
    pub left_sibling: u64,
    pub right_sibling: u64,
}

/// Builder for a chunked dataset's B-tree, keyed by chunk origin.
pub struct ChunkTreeBuilder {
    node_capacity: usize,
    /// Stored key rank: dataset rank + 1.
    rank: usize,
    entries: Vec<(ChunkKey, u64)>,
}

impl ChunkTreeBuilder {
    pub fn new(internal_k: u16, rank: usize) -> ChunkTreeBuilder {
        ChunkTreeBuilder {
            node_capacity: 2 * internal_k as usize,
            rank,
            entries: Vec::new(),
        }
    }

    /// Insert one chunk, ordered lexicographically by origin coordinates.
    pub fn insert(&mut self, key: ChunkKey, chunk_address: u64) -> Result<()> {
        debug_assert_eq!(key.offsets.len(), self.rank);
        match self
            .entries
            .binary_search_by(|(k, _)| k.offsets.cmp(&key.offsets))
        {
            Ok(_) => Err(Hdf5Error::CorruptStructure(format!(
                "duplicate chunk at {:?}",
                key.offsets
            ))),
            Err(i) => {
                self.entries.insert(i, (key, chunk_address));
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Node block size for this tree's key shape.
    pub fn node_size(&self, offset_size: u8, length_size: u8) -> u64 {
        let _ = length_size;
        let key_size = 8 + 8 * self.rank as u64;
        8 + 2 * u64::from(offset_size)
            + self.node_capacity as u64 * u64::from(offset_size)
            + (self.node_capacity as u64 + 1) * key_size
    }

    /// Build the node levels; returns the root address and every node.
    /// `past_end_key` bounds the last chunk from above.
    pub fn finalize(
        &self,
        alloc: &mut Allocator,
        offset_size: u8,
        length_size: u8,
        past_end_key: ChunkKey,
    ) -> Result<(u64, Vec<PlannedChunkNode>)> {
        let node_block = self.node_size(offset_size, length_size);
        let mut nodes = Vec::new();
        let mut level: u8 = 0;
        // (child, low key, high key)
        let mut level_children: Vec<(u64, ChunkKey, ChunkKey)> = Vec::new();
        for (i, (key, child)) in self.entries.iter().enumerate() {
            let high = if i + 1 < self.entries.len() {
                self.entries[i + 1].0.clone()
            } else {
                past_end_key.clone()
            };
            level_children.push((*child, key.clone(), high));
        }
        if level_children.is_empty() {
            return Err(Hdf5Error::CorruptStructure(
                "chunk B-tree with no chunks".to_string(),
            ));
        }

        loop {
            let n_nodes = (level_children.len() + self.node_capacity - 1) / self.node_capacity;
            let mut addresses = Vec::with_capacity(n_nodes);
            for _ in 0..n_nodes {
                addresses.push(alloc.allocate(node_block)?);
            }

            let mut next_level: Vec<(u64, ChunkKey, ChunkKey)> = Vec::with_capacity(n_nodes);
            for (i, chunk) in level_children.chunks(self.node_capacity).enumerate() {
                let mut keys: Vec<ChunkKey> =
                    chunk.iter().map(|(_, low, _)| low.clone()).collect();
                keys.push(chunk.last().expect("non-empty").2.clone());
                nodes.push(PlannedChunkNode {
                    address: addresses[i],
                    level,
                    children: chunk.iter().map(|&(child, _, _)| child).collect(),
                    keys,
                    left_sibling: if i == 0 { u64::MAX } else { addresses[i - 1] },
                    right_sibling: if i + 1 == n_nodes {
                        u64::MAX
                    } else {
                        addresses[i + 1]
                    },
                });
                next_level.push((
                    addresses[i],
                    chunk.first().expect("non-empty").1.clone(),
                    chunk.last().expect("non-empty").2.clone(),
                ));
            }

            if n_nodes == 1 {
                return Ok((addresses[0], nodes));
            }
            level_children = next_level;
            level += 1;
            if level > 32 {
                return Err(Hdf5Error::CorruptStructure(
                    "chunk B-tree deeper than 32 levels".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::WriteOptions;

    fn chunk_key(offsets: Vec<u64>) -> ChunkKey {
        ChunkKey {
            nbytes: 64,
            filter_mask: 0,
            offsets,
        }
    }

    /// A chunk tree whose root points back at itself must fail, not spin.
    #[test]
    fn self_referential_node_is_detected() {
        let mut node = Vec::new();
        node.extend_from_slice(b"TREE");
        node.push(1); // chunk tree
        node.push(1); // level 1, so the child is another node
        node.extend_from_slice(&1u16.to_le_bytes());
        node.extend_from_slice(&u64::MAX.to_le_bytes());
        node.extend_from_slice(&u64::MAX.to_le_bytes());
        // key 0
        node.extend_from_slice(&64u32.to_le_bytes());
        node.extend_from_slice(&0u32.to_le_bytes());
        node.extend_from_slice(&0u64.to_le_bytes());
        node.extend_from_slice(&0u64.to_le_bytes());
        // child: this very node
        node.extend_from_slice(&0u64.to_le_bytes());
        // final key
        node.extend_from_slice(&0u32.to_le_bytes());
        node.extend_from_slice(&0u32.to_le_bytes());
        node.extend_from_slice(&4u64.to_le_bytes());
        node.extend_from_slice(&0u64.to_le_bytes());

        match collect_chunks(&node, 0, 8, 8, 2) {
            Err(Hdf5Error::CyclicBtree { address }) => assert_eq!(address, 0),
            other => panic!("expected CyclicBtree, got {:?}", other),
        }
    }

    #[test]
    fn snod_split_keeps_names_ordered() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut tree = GroupTreeBuilder::new(136, 4, 16, 328);
        for i in 0..20 {
            tree.insert(
                SnodEntry {
                    name: format!("dataset_{:02}", i),
                    name_offset: 8 + 48 * i,
                    header_address: 800 + 512 * i,
                    cache: SnodCache::Object,
                },
                &mut alloc,
            )
            .unwrap();
        }
        assert!(tree.snods().len() >= 3);
        let mut seen = Vec::new();
        for snod in tree.snods() {
            for entry in snod.list() {
                seen.push(entry.name.clone());
            }
        }
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
        assert_eq!(seen.len(), 20);
        assert!(tree.find("dataset_07").is_some());
        assert!(tree.find("nope").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut tree = GroupTreeBuilder::new(136, 4, 16, 328);
        let entry = SnodEntry {
            name: "twin".to_string(),
            name_offset: 8,
            header_address: 800,
            cache: SnodCache::Object,
        };
        tree.insert(entry.clone(), &mut alloc).unwrap();
        assert!(tree.insert(entry, &mut alloc).is_err());
    }

    #[test]
    fn single_node_tree_uses_the_root_block() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut tree = GroupTreeBuilder::new(136, 4, 16, 328);
        tree.insert(
            SnodEntry {
                name: "only".to_string(),
                name_offset: 8,
                header_address: 800,
                cache: SnodCache::Object,
            },
            &mut alloc,
        )
        .unwrap();
        let nodes = tree.finalize(&mut alloc, 544).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, 136);
        assert_eq!(nodes[0].level, 0);
        assert_eq!(nodes[0].children.len(), 1);
        assert_eq!(nodes[0].keys, vec![0, 8]);
    }

    #[test]
    fn chunk_tree_orders_and_bounds_keys() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut tree = ChunkTreeBuilder::new(16, 2);
        tree.insert(chunk_key(vec![2, 0]), 3000).unwrap();
        tree.insert(chunk_key(vec![0, 0]), 2048).unwrap();
        assert!(tree.insert(chunk_key(vec![0, 0]), 2100).is_err());
        let (root, nodes) = tree
            .finalize(&mut alloc, 8, 8, chunk_key(vec![4, 0]))
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, root);
        assert_eq!(nodes[0].children, vec![2048, 3000]);
        assert_eq!(nodes[0].keys[0].offsets, vec![0, 0]);
        assert_eq!(nodes[0].keys[1].offsets, vec![2, 0]);
        assert_eq!(nodes[0].keys[2].offsets, vec![4, 0]);
    }
}
