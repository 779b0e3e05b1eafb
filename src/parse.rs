//! nom parsers for the on-disk HDF5 structures.
//!
//! Every parser takes the raw input positioned at the structure's first byte
//! and returns the remaining input plus the parsed value. Multi-byte fields
//! are little-endian; address and length fields are sized by the
//! superblock's offset/length sizes and zero-extended to u64.

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u8};

pub type Result<'a, O> =
    std::result::Result<(&'a [u8], O), nom::Err<nom::error::VerboseError<&'a [u8]>>>;

pub const SIGNATURE: &[u8; 8] = b"\x89\x48\x44\x46\x0d\x0a\x1a\x0a";

/// Read a little-endian integer of 1..=8 bytes, zero-extended to u64.
pub fn address<'a>(len: u8) -> impl Fn(&'a [u8]) -> Result<'a, u64> {
    move |input| {
        let (input, bytes) = take(len)(input)?;
        let mut value = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            value |= u64::from(*b) << (8 * i as u32);
        }
        Ok((input, value))
    }
}

#[derive(Debug)]
pub struct Hdf5Superblock {
    pub superblock_version: u8,
    pub free_space_storage_version: u8,
    pub root_group_symbol_table_entry_version: u8,
    pub shared_header_message_format_version: u8,
    pub offset_size: u8,
    pub length_size: u8,
    pub group_leaf_node_k: u16,
    pub group_internal_node_k: u16,
    pub file_consistency_flags: u32,
    /// Version-1 superblocks only.
    pub indexed_storage_internal_node_k: Option<u16>,
    pub base_address: u64,
    pub address_of_file_free_space_info: u64,
    pub end_of_file_address: u64,
    pub driver_information_block_address: u64,
    pub root_group_symbol_table_entry: SymbolTableEntry,
}

pub fn superblock(input: &[u8]) -> Result<Hdf5Superblock> {
    context("superblock", |input| {
        let (input, _) = tag(&SIGNATURE[..])(input)?;
        let (input, superblock_version) = le_u8(input)?;
        let (input, free_space_storage_version) = le_u8(input)?;
        let (input, root_group_symbol_table_entry_version) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, shared_header_message_format_version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, group_leaf_node_k) = le_u16(input)?;
        let (input, group_internal_node_k) = le_u16(input)?;
        let (input, file_consistency_flags) = le_u32(input)?;
        let (input, indexed_storage_internal_node_k) = if superblock_version == 1 {
            let (input, k) = le_u16(input)?;
            let (input, _) = take(2usize)(input)?;
            (input, Some(k))
        } else {
            (input, None)
        };
        let (input, base_address) = address(offset_size)(input)?;
        let (input, address_of_file_free_space_info) = address(offset_size)(input)?;
        let (input, end_of_file_address) = address(offset_size)(input)?;
        let (input, driver_information_block_address) = address(offset_size)(input)?;
        let (input, root_group_symbol_table_entry) = symbol_table_entry(input, offset_size)?;

        Ok((
            input,
            Hdf5Superblock {
                superblock_version,
                free_space_storage_version,
                root_group_symbol_table_entry_version,
                shared_header_message_format_version,
                offset_size,
                length_size,
                group_leaf_node_k,
                group_internal_node_k,
                file_consistency_flags,
                indexed_storage_internal_node_k,
                base_address,
                address_of_file_free_space_info,
                end_of_file_address,
                driver_information_block_address,
                root_group_symbol_table_entry,
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    pub scratch: [u8; 16],
}

impl SymbolTableEntry {
    /// Cache-type 1 caches the group's B-tree address in the scratch area.
    pub fn btree_address(&self, offset_size: u8) -> Option<u64> {
        if self.cache_type != 1 {
            return None;
        }
        Some(scratch_address(&self.scratch, 0, offset_size))
    }

    /// Cache-type 1 caches the group's local-heap address in the scratch area.
    pub fn heap_address(&self, offset_size: u8) -> Option<u64> {
        if self.cache_type != 1 {
            return None;
        }
        Some(scratch_address(
            &self.scratch,
            usize::from(offset_size.min(8)),
            offset_size,
        ))
    }
}

fn scratch_address(scratch: &[u8; 16], start: usize, offset_size: u8) -> u64 {
    let mut value = 0u64;
    for i in 0..usize::from(offset_size.min(8)) {
        value |= u64::from(scratch[start + i]) << (8 * i as u32);
    }
    value
}

pub fn symbol_table_entry(input: &[u8], offset_size: u8) -> Result<SymbolTableEntry> {
    context("symbol table entry", move |input| {
        let (input, link_name_offset) = address(offset_size)(input)?;
        let (input, object_header_address) = address(offset_size)(input)?;
        let (input, cache_type) = le_u32(input)?;
        let (input, _) = take(4usize)(input)?;
        let (input, scratch_bytes) = take(16usize)(input)?;
        let mut scratch = [0u8; 16];
        scratch.copy_from_slice(scratch_bytes);

        Ok((
            input,
            SymbolTableEntry {
                link_name_offset,
                object_header_address,
                cache_type,
                scratch,
            },
        ))
    })(input)
}

/// A symbol-table node (SNOD): the leaf-level membership list of a group.
#[derive(Debug)]
pub struct SymbolTable {
    pub version: u8,
    pub entries: Vec<SymbolTableEntry>,
}

pub fn symbol_table(input: &[u8], offset_size: u8) -> Result<SymbolTable> {
    context("symbol table node", move |input| {
        let (input, _) = tag(b"SNOD")(input)?;
        let (input, version) = le_u8(input)?;
        let (input, _) = take(1usize)(input)?;
        let (input, number_of_symbols) = le_u16(input)?;
        let (input, entries) = count(
            |i| symbol_table_entry(i, offset_size),
            number_of_symbols as usize,
        )(input)?;
        Ok((input, SymbolTable { version, entries }))
    })(input)
}

/// One key of a v1 B-tree node, in either of its two shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeKey {
    /// Link-name offset into the group's local heap.
    Group(u64),
    Chunk(ChunkKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkKey {
    /// Size of the chunk on disk, after any filters.
    pub nbytes: u32,
    pub filter_mask: u32,
    /// Chunk origin in dataspace coordinates, one per stored dimension
    /// (dataset rank + 1; the trailing element dimension is always 0).
    pub offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub key: TreeKey,
    pub child: u64,
}

#[derive(Debug)]
pub struct TreeNode {
    pub node_type: u8,
    pub node_level: u8,
    pub entries_used: u16,
    pub address_of_left_sibling: u64,
    pub address_of_right_sibling: u64,
    /// N (key, child) pairs; the key at index i bounds the child at index i
    /// from below.
    pub entries: Vec<TreeEntry>,
    /// The N+1st key bounding the last child from above.
    pub final_key: Option<TreeKey>,
}

fn tree_key<'a>(
    input: &'a [u8],
    node_type: u8,
    length_size: u8,
    chunk_rank: u8,
) -> Result<'a, TreeKey> {
    if node_type == 0 {
        let (input, offset) = address(length_size)(input)?;
        Ok((input, TreeKey::Group(offset)))
    } else {
        let (input, nbytes) = le_u32(input)?;
        let (input, filter_mask) = le_u32(input)?;
        let (input, offsets) = count(address(8), chunk_rank as usize)(input)?;
        Ok((
            input,
            TreeKey::Chunk(ChunkKey {
                nbytes,
                filter_mask,
                offsets,
            }),
        ))
    }
}

/// Parse a v1 B-tree node. `chunk_rank` is the number of stored key
/// dimensions (dataset rank + 1) and is only consulted for type-1 nodes.
pub fn tree_node<'a>(
    input: &'a [u8],
    offset_size: u8,
    length_size: u8,
    chunk_rank: u8,
) -> Result<'a, TreeNode> {
    context("v1 B-tree node", move |input| {
        let (input, _) = tag(b"TREE")(input)?;
        let (input, node_type) = le_u8(input)?;
        let (input, node_level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        let (input, address_of_left_sibling) = address(offset_size)(input)?;
        let (input, address_of_right_sibling) = address(offset_size)(input)?;

        let mut entries = Vec::with_capacity(entries_used as usize);
        let mut rest = input;
        for _ in 0..entries_used {
            let (after_key, key) = tree_key(rest, node_type, length_size, chunk_rank)?;
            let (after_child, child) = address(offset_size)(after_key)?;
            entries.push(TreeEntry { key, child });
            rest = after_child;
        }
        let (rest, final_key) = if entries_used > 0 {
            let (rest, key) = tree_key(rest, node_type, length_size, chunk_rank)?;
            (rest, Some(key))
        } else {
            (rest, None)
        };

        Ok((
            rest,
            TreeNode {
                node_type,
                node_level,
                entries_used,
                address_of_left_sibling,
                address_of_right_sibling,
                entries,
                final_key,
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub version: u8,
    pub data_segment_size: u64,
    pub offset_to_head_of_freelist: u64,
    pub address_of_data_segment: u64,
}

pub fn local_heap(input: &[u8], offset_size: u8, length_size: u8) -> Result<LocalHeap> {
    context("local heap", move |input| {
        let (input, _) = tag(b"HEAP")(input)?;
        let (input, version) = le_u8(input)?;
        let (input, _) = tag([0, 0, 0])(input)?;
        let (input, data_segment_size) = address(length_size)(input)?;
        let (input, offset_to_head_of_freelist) = address(length_size)(input)?;
        let (input, address_of_data_segment) = address(offset_size)(input)?;

        Ok((
            input,
            LocalHeap {
                version,
                data_segment_size,
                offset_to_head_of_freelist,
                address_of_data_segment,
            },
        ))
    })(input)
}

/// Version-agnostic object-header prefix.
#[derive(Debug)]
pub enum ObjectHeaderPrefix {
    V1 {
        total_messages: u16,
        reference_count: u32,
        header_size: u32,
    },
    V2 {
        flags: u8,
        /// access/modification/change/birth, present when flags bit 5 is set.
        times: Option<(u32, u32, u32, u32)>,
        /// max-compact/min-dense attribute thresholds, flags bit 4.
        attribute_phase: Option<(u16, u16)>,
        /// Size of the first message block.
        chunk0_size: u64,
        /// Messages carry a creation-order short, flags bit 2.
        tracks_creation_order: bool,
    },
}

pub fn object_header_prefix(input: &[u8]) -> Result<ObjectHeaderPrefix> {
    context("object header prefix", |input: &[u8]| {
        if input.first() == Some(&b'O') {
            let (input, _) = tag(b"OHDR")(input)?;
            let (input, _version) = tag([2])(input)?;
            let (input, flags) = le_u8(input)?;
            let (input, times) = if flags & 0x20 != 0 {
                let (input, access) = le_u32(input)?;
                let (input, modification) = le_u32(input)?;
                let (input, change) = le_u32(input)?;
                let (input, birth) = le_u32(input)?;
                (input, Some((access, modification, change, birth)))
            } else {
                (input, None)
            };
            let (input, attribute_phase) = if flags & 0x10 != 0 {
                let (input, max_compact) = le_u16(input)?;
                let (input, min_dense) = le_u16(input)?;
                (input, Some((max_compact, min_dense)))
            } else {
                (input, None)
            };
            let (input, chunk0_size) = address(1 << (flags & 0x03))(input)?;
            Ok((
                input,
                ObjectHeaderPrefix::V2 {
                    flags,
                    times,
                    attribute_phase,
                    chunk0_size,
                    tracks_creation_order: flags & 0x04 != 0,
                },
            ))
        } else {
            let (input, _version) = tag([1])(input)?;
            let (input, _) = tag([0])(input)?;
            let (input, total_messages) = le_u16(input)?;
            let (input, reference_count) = le_u32(input)?;
            let (input, header_size) = le_u32(input)?;
            // The first message begins on an 8-byte boundary.
            let (input, _) = take(4usize)(input)?;
            Ok((
                input,
                ObjectHeaderPrefix::V1 {
                    total_messages,
                    reference_count,
                    header_size,
                },
            ))
        }
    })(input)
}

#[derive(Debug)]
pub struct GlobalHeapObject {
    pub index: u16,
    pub reference_count: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct GlobalHeapCollection {
    pub version: u8,
    pub collection_size: u64,
    pub objects: Vec<GlobalHeapObject>,
}

pub fn global_heap_collection(input: &[u8], length_size: u8) -> Result<GlobalHeapCollection> {
    context("global heap collection", move |input| {
        let (input, _) = tag(b"GCOL")(input)?;
        let (input, version) = le_u8(input)?;
        let (input, _) = tag([0, 0, 0])(input)?;
        let (input, collection_size) = address(length_size)(input)?;

        let header_size = 8 + u64::from(length_size);
        let mut consumed = header_size;
        let mut objects = Vec::new();
        let mut rest = input;
        // Object index 0, when present, marks the free tail of the collection.
        while consumed + 16 <= collection_size {
            let (r, index) = le_u16(rest)?;
            let (r, reference_count) = le_u16(r)?;
            let (r, _) = take(4usize)(r)?;
            let (r, object_size) = address(length_size)(r)?;
            if index == 0 {
                break;
            }
            let padded = pad8(object_size as usize);
            let (r, data) = take(padded)(r)?;
            objects.push(GlobalHeapObject {
                index,
                reference_count,
                data: data[..object_size as usize].to_vec(),
            });
            consumed += 8 + u64::from(length_size) + padded as u64;
            rest = r;
        }

        Ok((
            rest,
            GlobalHeapCollection {
                version,
                collection_size,
                objects,
            },
        ))
    })(input)
}

pub fn pad8<T>(t: T) -> usize
where
    usize: From<T>,
{
    let t = usize::from(t);
    if t % 8 == 0 {
        t
    } else {
        t + (8 - (t % 8))
    }
}

/// `pad8` for lengths that come off the file as u64.
pub fn pad8_u64(t: u64) -> u64 {
    if t % 8 == 0 {
        t
    } else {
        t + (8 - (t % 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_widths() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(address(1)(&bytes).unwrap().1, 0x01);
        assert_eq!(address(2)(&bytes).unwrap().1, 0x0201);
        assert_eq!(address(3)(&bytes).unwrap().1, 0x03_0201);
        assert_eq!(address(4)(&bytes).unwrap().1, 0x0403_0201);
        assert_eq!(address(8)(&bytes).unwrap().1, 0x0807_0605_0403_0201);
    }

    #[test]
    fn pad8_rounds_up() {
        assert_eq!(pad8(0usize), 0);
        assert_eq!(pad8(1usize), 8);
        assert_eq!(pad8(8usize), 8);
        assert_eq!(pad8(9usize), 16);
    }

    #[test]
    fn symbol_table_entry_scratch() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&96u64.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        bytes.extend_from_slice(&136u64.to_le_bytes());
        bytes.extend_from_slice(&680u64.to_le_bytes());
        let (_, entry) = symbol_table_entry(&bytes, 8).unwrap();
        assert_eq!(entry.object_header_address, 96);
        assert_eq!(entry.btree_address(8), Some(136));
        assert_eq!(entry.heap_address(8), Some(680));
    }
}
