//! The write path: serializers for every on-disk structure and the
//! `FileBuilder` orchestrator that lays out and commits a file image.
//!
//! Writing is two-phase: creation calls reserve extents through the
//! allocator and stream raw data, and `close()` serializes all metadata
//! and commits it with positioned writes. Nothing moves once allocated.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::{Allocator, WriteOptions, LOCAL_HEAP_HEADER_SIZE};
use crate::btree::{
    ChunkTreeBuilder, GroupTreeBuilder, PlannedChunkNode, PlannedNode, SnodBuilder, SnodCache,
    SnodEntry,
};
use crate::datatype::{Datatype, DynamicValue, Hdf5Type};
use crate::error::{Hdf5Error, Result};
use crate::header::{
    push_message, push_sized, Attribute, Continuation, DataLayout, Dataspace, FillValue, Message,
    SymbolTableMessage,
};
use crate::heap::{GlobalHeapSession, GlobalHeapWriter, LocalHeapBuilder};
use crate::parse::{pad8, ChunkKey, SIGNATURE};

/// Block reserved for each subgroup's object header.
const GROUP_HEADER_BLOCK: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectId {
    Group(GroupId),
    Dataset(DatasetId),
}

impl From<GroupId> for ObjectId {
    fn from(id: GroupId) -> ObjectId {
        ObjectId::Group(id)
    }
}

impl From<DatasetId> for ObjectId {
    fn from(id: DatasetId) -> ObjectId {
        ObjectId::Dataset(id)
    }
}

/// Requested data layout for a new dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutSpec {
    Contiguous,
    Compact,
    Chunked { chunk_dims: Vec<u64> },
}

struct FileChannel {
    file: fs::File,
}

impl FileChannel {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }
}

struct GroupBuilderNode {
    header_address: u64,
    header_block: u64,
    heap: LocalHeapBuilder,
    btree_root: u64,
    tree: GroupTreeBuilder,
    attributes: Vec<Attribute>,
    modification_time: Option<u32>,
}

struct DatasetBuilderNode {
    header_address: u64,
    header_block: u64,
    datatype: Datatype,
    dataspace: Dataspace,
    layout: LayoutSpec,
    data_address: Option<u64>,
    written: u64,
    pending: Vec<u8>,
    attributes: Vec<Attribute>,
    modification_time: u32,
}

impl DatasetBuilderNode {
    fn total_size(&self) -> u64 {
        self.dataspace.element_count() * self.datatype.size_in_bytes()
    }
}

/// Builds a new HDF5 file from declarative calls; `close()` commits it.
pub struct FileBuilder {
    channel: FileChannel,
    opts: WriteOptions,
    alloc: Allocator,
    groups: Vec<GroupBuilderNode>,
    datasets: Vec<DatasetBuilderNode>,
    global_heap: GlobalHeapWriter,
    closed: bool,
}

impl FileBuilder {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<FileBuilder> {
        FileBuilder::create_with(path, WriteOptions::default())
    }

    pub fn create_with<P: AsRef<Path>>(path: P, opts: WriteOptions) -> Result<FileBuilder> {
        let mut opts = opts;
        // The header block must at least hold a continuation message.
        opts.object_header_block = opts.object_header_block.max(GROUP_HEADER_BLOCK);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let alloc = Allocator::new(&opts);
        let root = GroupBuilderNode {
            header_address: alloc.root_header_address,
            header_block: alloc.root_header_size,
            heap: LocalHeapBuilder::with_addresses(
                alloc.root_heap_address,
                alloc.root_heap_data_address,
                alloc.root_heap_data_size,
            ),
            btree_root: alloc.root_btree_address,
            tree: GroupTreeBuilder::new(
                alloc.root_btree_address,
                opts.group_leaf_k,
                opts.group_internal_k,
                opts.snod_size(),
            ),
            attributes: Vec::new(),
            modification_time: None,
        };
        Ok(FileBuilder {
            channel: FileChannel { file },
            alloc,
            groups: vec![root],
            datasets: Vec::new(),
            global_heap: GlobalHeapWriter::new(opts.length_size),
            closed: false,
            opts,
        })
    }

    pub fn root(&self) -> GroupId {
        GroupId(0)
    }

    /// Create and link a subgroup.
    pub fn create_group(&mut self, parent: GroupId, name: &str) -> Result<GroupId> {
        let header_address = self.alloc.allocate_object_header(GROUP_HEADER_BLOCK)?;
        let btree_root = self.alloc.allocate(self.opts.btree_node_size())?;
        let heap = LocalHeapBuilder::new(&mut self.alloc)?;
        let heap_header = heap.header_address;

        let group = GroupBuilderNode {
            header_address,
            header_block: GROUP_HEADER_BLOCK,
            heap,
            btree_root,
            tree: GroupTreeBuilder::new(
                btree_root,
                self.opts.group_leaf_k,
                self.opts.group_internal_k,
                self.opts.snod_size(),
            ),
            attributes: Vec::new(),
            modification_time: Some(now()),
        };
        self.groups.push(group);
        let id = GroupId(self.groups.len() - 1);

        self.link(
            parent,
            name,
            header_address,
            SnodCache::Group {
                btree_address: btree_root,
                heap_address: heap_header,
            },
        )?;
        Ok(id)
    }

    /// Declare a dataset and link it; element data arrives via
    /// `write_elements`/`write_dynamic`.
    pub fn create_dataset(
        &mut self,
        parent: GroupId,
        name: &str,
        datatype: Datatype,
        dataspace: Dataspace,
        layout: LayoutSpec,
    ) -> Result<DatasetId> {
        datatype.validate()?;
        if let LayoutSpec::Chunked { chunk_dims } = &layout {
            if chunk_dims.len() != dataspace.dims.len() || chunk_dims.is_empty() {
                return Err(Hdf5Error::CorruptStructure(format!(
                    "chunk rank {} against dataspace rank {}",
                    chunk_dims.len(),
                    dataspace.dims.len()
                )));
            }
            if chunk_dims.iter().any(|&c| c == 0) {
                return Err(Hdf5Error::CorruptStructure(
                    "zero-sized chunk dimension".to_string(),
                ));
            }
        }
        let header_address = self
            .alloc
            .allocate_object_header(self.opts.object_header_block)?;
        let dataset = DatasetBuilderNode {
            header_address,
            header_block: self.opts.object_header_block,
            datatype,
            dataspace,
            layout,
            data_address: None,
            written: 0,
            pending: Vec::new(),
            attributes: Vec::new(),
            modification_time: now(),
        };
        self.datasets.push(dataset);
        let id = DatasetId(self.datasets.len() - 1);

        self.link(parent, name, header_address, SnodCache::Object)?;
        Ok(id)
    }

    fn link(
        &mut self,
        parent: GroupId,
        name: &str,
        header_address: u64,
        cache: SnodCache,
    ) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Hdf5Error::CorruptStructure(format!(
                "link name {:?} is not a single path component",
                name
            )));
        }
        let group = self
            .groups
            .get_mut(parent.0)
            .ok_or_else(|| Hdf5Error::OrphanedEntry("unknown parent group".to_string()))?;
        let name_offset = group.heap.reserve(name, &mut self.alloc)?;
        group.tree.insert(
            SnodEntry {
                name: name.to_string(),
                name_offset,
                header_address,
                cache,
            },
            &mut self.alloc,
        )
    }

    /// Remove a link from a group. The object's storage stays allocated;
    /// only the membership changes.
    pub fn unlink(&mut self, parent: GroupId, name: &str) -> bool {
        self.groups
            .get_mut(parent.0)
            .and_then(|group| group.tree.remove(name))
            .is_some()
    }

    /// The object-header address of a created object, as stored in
    /// object references.
    pub fn object_address(&self, object: ObjectId) -> Option<u64> {
        match object {
            ObjectId::Group(id) => self.groups.get(id.0).map(|g| g.header_address),
            ObjectId::Dataset(id) => self.datasets.get(id.0).map(|d| d.header_address),
        }
    }

    pub fn contains(&self, parent: GroupId, name: &str) -> bool {
        self.groups
            .get(parent.0)
            .map(|group| group.tree.find(name).is_some())
            .unwrap_or(false)
    }

    /// Stream native elements into a dataset.
    pub fn write_elements<T: Hdf5Type>(&mut self, dataset: DatasetId, values: &[T]) -> Result<()> {
        {
            let node = self.dataset(dataset)?;
            if !node.datatype.admits::<T>() {
                return Err(Hdf5Error::TypeMismatch {
                    expected: "a dataset datatype matching the element type",
                    found: format!("{:?}", node.datatype.class_code()),
                });
            }
        }
        let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<T>());
        for value in values {
            bytes.extend(value.to_le_bytes());
        }
        self.push_raw(dataset, &bytes)
    }

    /// Stream dynamically-typed elements, encoding through the datatype.
    /// Variable-length payloads spill into the global heap.
    pub fn write_dynamic(&mut self, dataset: DatasetId, values: &[DynamicValue]) -> Result<()> {
        let datatype = self.dataset(dataset)?.datatype.clone();
        let mut bytes = Vec::with_capacity(values.len() * datatype.size_in_bytes() as usize);
        for value in values {
            let mut session = GlobalHeapSession {
                heap: &mut self.global_heap,
                alloc: &mut self.alloc,
            };
            bytes.extend(datatype.encode_element(value, Some(&mut session))?);
        }
        self.push_raw(dataset, &bytes)
    }

    fn dataset(&self, id: DatasetId) -> Result<&DatasetBuilderNode> {
        self.datasets
            .get(id.0)
            .ok_or_else(|| Hdf5Error::OrphanedEntry("unknown dataset".to_string()))
    }

    fn push_raw(&mut self, id: DatasetId, bytes: &[u8]) -> Result<()> {
        let total = self.dataset(id)?.total_size();
        let node = &mut self.datasets[id.0];
        match node.layout {
            LayoutSpec::Contiguous => {
                if node.written + bytes.len() as u64 > total {
                    return Err(Hdf5Error::OutOfRange(format!(
                        "{} bytes into a {}-byte dataset",
                        node.written + bytes.len() as u64,
                        total
                    )));
                }
                if node.data_address.is_none() {
                    node.data_address = Some(self.alloc.allocate_raw_data(total)?);
                }
                let address = node.data_address.expect("just allocated") + node.written;
                self.channel.write_at(address, bytes)?;
                self.datasets[id.0].written += bytes.len() as u64;
                Ok(())
            }
            LayoutSpec::Compact | LayoutSpec::Chunked { .. } => {
                if node.pending.len() as u64 + bytes.len() as u64 > total {
                    return Err(Hdf5Error::OutOfRange(format!(
                        "{} bytes into a {}-byte dataset",
                        node.pending.len() as u64 + bytes.len() as u64,
                        total
                    )));
                }
                node.pending.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Attach an attribute; the value array is encoded element-wise
    /// through `datatype`.
    pub fn set_attribute(
        &mut self,
        object: ObjectId,
        name: &str,
        datatype: Datatype,
        dataspace: Dataspace,
        values: &[DynamicValue],
    ) -> Result<()> {
        datatype.validate()?;
        if values.len() as u64 != dataspace.element_count() {
            return Err(Hdf5Error::TypeMismatch {
                expected: "one value per dataspace element",
                found: format!("{} values", values.len()),
            });
        }
        let mut data = Vec::with_capacity(values.len() * datatype.size_in_bytes() as usize);
        for value in values {
            let mut session = GlobalHeapSession {
                heap: &mut self.global_heap,
                alloc: &mut self.alloc,
            };
            data.extend(datatype.encode_element(value, Some(&mut session))?);
        }
        let attribute = Attribute {
            version: 1,
            name: name.to_string(),
            datatype,
            dataspace,
            data,
        };
        match object {
            ObjectId::Group(id) => self
                .groups
                .get_mut(id.0)
                .ok_or_else(|| Hdf5Error::OrphanedEntry("unknown group".to_string()))?
                .attributes
                .push(attribute),
            ObjectId::Dataset(id) => self
                .datasets
                .get_mut(id.0)
                .ok_or_else(|| Hdf5Error::OrphanedEntry("unknown dataset".to_string()))?
                .attributes
                .push(attribute),
        }
        Ok(())
    }

    pub fn set_scalar_attribute<T: Hdf5Type>(
        &mut self,
        object: ObjectId,
        name: &str,
        value: T,
    ) -> Result<()> {
        let datatype = T::dtype();
        let data = value.to_le_bytes();
        let attribute = Attribute {
            version: 1,
            name: name.to_string(),
            datatype,
            dataspace: Dataspace::new(vec![1]),
            data,
        };
        match object {
            ObjectId::Group(id) => self
                .groups
                .get_mut(id.0)
                .ok_or_else(|| Hdf5Error::OrphanedEntry("unknown group".to_string()))?
                .attributes
                .push(attribute),
            ObjectId::Dataset(id) => self
                .datasets
                .get_mut(id.0)
                .ok_or_else(|| Hdf5Error::OrphanedEntry("unknown dataset".to_string()))?
                .attributes
                .push(attribute),
        }
        Ok(())
    }

    /// Serialize all metadata and commit the file image.
    pub fn close(mut self) -> Result<()> {
        let mut writes: Vec<(u64, Vec<u8>)> = Vec::new();

        // Finalize datasets: resolve layouts, carve and place chunks.
        let mut layouts = Vec::with_capacity(self.datasets.len());
        for i in 0..self.datasets.len() {
            let layout = self.finalize_dataset(i, &mut writes)?;
            layouts.push(layout);
        }

        // Assemble object headers, spilling to continuation blocks.
        for (i, layout) in layouts.into_iter().enumerate() {
            let node = &self.datasets[i];
            let mut messages = vec![
                Message::Dataspace(node.dataspace.clone()),
                Message::Datatype(node.datatype.clone()),
                Message::FillValue(FillValue::undefined()),
                Message::DataLayout(layout),
                Message::ObjectModificationTime(node.modification_time),
            ];
            for attribute in &node.attributes {
                messages.push(Message::Attribute(attribute.clone()));
            }
            let (header_address, header_block) = (node.header_address, node.header_block);
            let image = self.build_header_block(&messages, header_block)?;
            writes.push((header_address, image.inline));
            if let Some((address, bytes)) = image.continuation {
                writes.push((address, bytes));
            }
        }

        for i in 0..self.groups.len() {
            let (header_address, header_block) = {
                let group = &self.groups[i];
                (group.header_address, group.header_block)
            };
            let mut messages = vec![Message::SymbolTable(SymbolTableMessage {
                btree_address: self.groups[i].btree_root,
                heap_address: self.groups[i].heap.header_address,
            })];
            if let Some(seconds) = self.groups[i].modification_time {
                messages.push(Message::ObjectModificationTime(seconds));
            }
            for attribute in &self.groups[i].attributes {
                messages.push(Message::Attribute(attribute.clone()));
            }
            let image = self.build_header_block(&messages, header_block)?;
            writes.push((header_address, image.inline));
            if let Some((address, bytes)) = image.continuation {
                writes.push((address, bytes));
            }
        }

        // Local heaps: headers plus packed data segments.
        for group in &self.groups {
            writes.push((
                group.heap.header_address,
                serialize_local_heap_header(&group.heap, &self.opts),
            ));
            writes.push((group.heap.data_address, group.heap.segment_bytes()));
        }

        // Group B-trees and SNODs.
        for i in 0..self.groups.len() {
            let nodes = self.groups[i]
                .tree
                .finalize(&mut self.alloc, self.opts.btree_node_size())?;
            for node in &nodes {
                writes.push((node.address, serialize_group_node(node, &self.opts)));
            }
            for snod in self.groups[i].tree.snods() {
                writes.push((snod.address, serialize_snod(snod, &self.opts)));
            }
        }

        // Global heap collections.
        for (address, bytes) in self.global_heap.serialized() {
            writes.push((address, bytes));
        }

        // Superblock, now that end-of-file is final.
        let end_of_file = self.alloc.end_of_file();
        writes.push((0, serialize_superblock(&self.opts, &self.alloc, end_of_file)));

        for (address, bytes) in writes {
            self.channel.write_at(address, &bytes)?;
        }
        self.channel.file.set_len(end_of_file)?;
        self.channel.file.flush()?;
        self.closed = true;
        Ok(())
    }

    fn finalize_dataset(
        &mut self,
        index: usize,
        writes: &mut Vec<(u64, Vec<u8>)>,
    ) -> Result<DataLayout> {
        let total = self.datasets[index].total_size();
        match self.datasets[index].layout.clone() {
            LayoutSpec::Contiguous => Ok(DataLayout::Contiguous {
                address: self.datasets[index].data_address.unwrap_or(u64::MAX),
                size: total,
            }),
            LayoutSpec::Compact => {
                let mut data = self.datasets[index].pending.clone();
                data.resize(total as usize, 0);
                Ok(DataLayout::Compact { data })
            }
            LayoutSpec::Chunked { chunk_dims } => {
                let node = &mut self.datasets[index];
                let dims = node.dataspace.dims.clone();
                let element_size = node.datatype.size as usize;
                let mut data = std::mem::take(&mut node.pending);
                data.resize(total as usize, 0);

                let rank = dims.len() + 1;
                let mut tree = ChunkTreeBuilder::new(self.opts.group_internal_k, rank);
                let chunk_bytes: u64 =
                    chunk_dims.iter().product::<u64>() * element_size as u64;
                for (origin, bytes) in carve_chunks(&data, &dims, &chunk_dims, element_size) {
                    let address = self.alloc.allocate_raw_data(chunk_bytes)?;
                    let mut offsets = origin;
                    offsets.push(0);
                    tree.insert(
                        ChunkKey {
                            nbytes: chunk_bytes as u32,
                            filter_mask: 0,
                            offsets,
                        },
                        address,
                    )?;
                    writes.push((address, bytes));
                }

                let counts: Vec<u64> = dims
                    .iter()
                    .zip(&chunk_dims)
                    .map(|(&d, &c)| (d + c - 1) / c)
                    .collect();
                let mut past_end = vec![0u64; rank];
                past_end[0] = counts.first().copied().unwrap_or(1) * chunk_dims[0];
                let (btree_address, nodes) = tree.finalize(
                    &mut self.alloc,
                    self.opts.offset_size,
                    self.opts.length_size,
                    ChunkKey {
                        nbytes: 0,
                        filter_mask: 0,
                        offsets: past_end,
                    },
                )?;
                for node in &nodes {
                    writes.push((node.address, serialize_chunk_node(node, &self.opts)));
                }
                Ok(DataLayout::Chunked {
                    btree_address,
                    dims: chunk_dims.iter().map(|&d| d as u32).collect(),
                    element_size: element_size as u32,
                })
            }
        }
    }

    fn build_header_block(&mut self, messages: &[Message], block_size: u64) -> Result<HeaderImage> {
        build_header_block(
            &mut self.alloc,
            messages,
            block_size,
            self.opts.offset_size,
            self.opts.length_size,
        )
    }
}

impl Drop for FileBuilder {
    fn drop(&mut self) {
        // Dropping without close is cancellation: the superblock is never
        // committed, so readers cannot mistake the file for complete.
        if !self.closed {
            log::warn!("file builder dropped without close; file left unfinalized");
        }
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

struct HeaderImage {
    inline: Vec<u8>,
    continuation: Option<(u64, Vec<u8>)>,
}

/// Lay the messages into a fixed header block. Messages that do not fit
/// spill, in order, into a continuation block allocated at end-of-file;
/// leftover space becomes a Nil message.
fn build_header_block(
    alloc: &mut Allocator,
    messages: &[Message],
    block_size: u64,
    offset_size: u8,
    length_size: u8,
) -> Result<HeaderImage> {
    let avail = block_size - 16;
    let continuation_size = 8 + pad8((offset_size + length_size) as usize) as u64;

    let sizes: Vec<u64> = messages
        .iter()
        .map(|m| m.disk_size(offset_size, length_size))
        .collect();
    let total: u64 = sizes.iter().sum();

    let split = if total <= avail {
        messages.len()
    } else {
        let mut used = 0;
        let mut fit = 0;
        for size in &sizes {
            if used + size + continuation_size <= avail {
                used += size;
                fit += 1;
            } else {
                break;
            }
        }
        fit
    };
    let (inline_messages, spilled) = messages.split_at(split);

    let continuation = if spilled.is_empty() {
        None
    } else {
        let length: u64 = sizes[split..].iter().sum();
        let address = alloc.allocate(length)?;
        let mut bytes = Vec::with_capacity(length as usize);
        for message in spilled {
            push_message(&mut bytes, message, offset_size, length_size);
        }
        Some((address, bytes))
    };

    let mut body = Vec::with_capacity(avail as usize);
    for message in inline_messages {
        push_message(&mut body, message, offset_size, length_size);
    }
    let mut message_count = inline_messages.len() + spilled.len();
    if let Some((address, bytes)) = &continuation {
        push_message(
            &mut body,
            &Message::ObjectHeaderContinuation(Continuation {
                offset: *address,
                length: bytes.len() as u64,
            }),
            offset_size,
            length_size,
        );
        message_count += 1;
    }
    if (body.len() as u64) < avail {
        // Pad the rest of the block with one Nil message.
        let leftover = avail - body.len() as u64;
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&((leftover - 8) as u16).to_le_bytes());
        body.extend_from_slice(&[0; 4]);
        body.resize(avail as usize, 0);
        message_count += 1;
    }

    let mut inline = Vec::with_capacity(block_size as usize);
    inline.push(1);
    inline.push(0);
    inline.extend_from_slice(&(message_count as u16).to_le_bytes());
    inline.extend_from_slice(&1u32.to_le_bytes());
    inline.extend_from_slice(&(avail as u32).to_le_bytes());
    inline.extend_from_slice(&[0; 4]);
    inline.extend_from_slice(&body);

    Ok(HeaderImage {
        inline,
        continuation,
    })
}

fn serialize_superblock(opts: &WriteOptions, alloc: &Allocator, end_of_file: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(opts.superblock_size() as usize);
    out.extend_from_slice(&SIGNATURE[..]);
    out.push(0); // superblock version
    out.push(0); // free-space storage version
    out.push(0); // root symbol-table-entry version
    out.push(0);
    out.push(0); // shared-header message format version
    out.push(opts.offset_size);
    out.push(opts.length_size);
    out.push(0);
    out.extend_from_slice(&opts.group_leaf_k.to_le_bytes());
    out.extend_from_slice(&opts.group_internal_k.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    push_sized(&mut out, 0, opts.offset_size); // base address
    push_sized(&mut out, u64::MAX, opts.offset_size); // free-space info
    push_sized(&mut out, end_of_file, opts.offset_size);
    push_sized(&mut out, u64::MAX, opts.offset_size); // driver information

    // Root symbol-table entry, cache type 1.
    push_sized(&mut out, 0, opts.offset_size);
    push_sized(&mut out, alloc.root_header_address, opts.offset_size);
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    let scratch_start = out.len();
    push_sized(&mut out, alloc.root_btree_address, opts.offset_size);
    push_sized(&mut out, alloc.root_heap_address, opts.offset_size);
    out.resize(scratch_start + 16, 0);
    out
}

fn serialize_symbol_table_entry(out: &mut Vec<u8>, entry: &SnodEntry, offset_size: u8) {
    push_sized(out, entry.name_offset, offset_size);
    push_sized(out, entry.header_address, offset_size);
    let scratch_start;
    match &entry.cache {
        SnodCache::Object => {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            scratch_start = out.len();
        }
        SnodCache::Group {
            btree_address,
            heap_address,
        } => {
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            scratch_start = out.len();
            push_sized(out, *btree_address, offset_size);
            push_sized(out, *heap_address, offset_size);
        }
    }
    out.resize(scratch_start + 16, 0);
}

fn serialize_snod(snod: &SnodBuilder, opts: &WriteOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(opts.snod_size() as usize);
    out.extend_from_slice(b"SNOD");
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(snod.entries.len() as u16).to_le_bytes());
    for entry in &snod.entries {
        serialize_symbol_table_entry(&mut out, entry, opts.offset_size);
    }
    out.resize(opts.snod_size() as usize, 0);
    out
}

fn serialize_group_node(node: &PlannedNode, opts: &WriteOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(opts.btree_node_size() as usize);
    out.extend_from_slice(b"TREE");
    out.push(0);
    out.push(node.level);
    out.extend_from_slice(&(node.children.len() as u16).to_le_bytes());
    push_sized(&mut out, node.left_sibling, opts.offset_size);
    push_sized(&mut out, node.right_sibling, opts.offset_size);
    for (i, &child) in node.children.iter().enumerate() {
        push_sized(&mut out, node.keys[i], opts.length_size);
        push_sized(&mut out, child, opts.offset_size);
    }
    if let Some(&last) = node.keys.last() {
        if !node.children.is_empty() {
            push_sized(&mut out, last, opts.length_size);
        }
    }
    out.resize(opts.btree_node_size() as usize, 0);
    out
}

fn serialize_chunk_key(out: &mut Vec<u8>, key: &ChunkKey) {
    out.extend_from_slice(&key.nbytes.to_le_bytes());
    out.extend_from_slice(&key.filter_mask.to_le_bytes());
    for &offset in &key.offsets {
        out.extend_from_slice(&offset.to_le_bytes());
    }
}

fn serialize_chunk_node(node: &PlannedChunkNode, opts: &WriteOptions) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"TREE");
    out.push(1);
    out.push(node.level);
    out.extend_from_slice(&(node.children.len() as u16).to_le_bytes());
    push_sized(&mut out, node.left_sibling, opts.offset_size);
    push_sized(&mut out, node.right_sibling, opts.offset_size);
    for (i, &child) in node.children.iter().enumerate() {
        serialize_chunk_key(&mut out, &node.keys[i]);
        push_sized(&mut out, child, opts.offset_size);
    }
    if let Some(last) = node.keys.last() {
        serialize_chunk_key(&mut out, last);
    }
    out
}

fn serialize_local_heap_header(heap: &LocalHeapBuilder, opts: &WriteOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_HEAP_HEADER_SIZE as usize);
    out.extend_from_slice(b"HEAP");
    out.push(0);
    out.extend_from_slice(&[0, 0, 0]);
    push_sized(&mut out, heap.capacity(), opts.length_size);
    push_sized(&mut out, heap.free_cursor(), opts.length_size);
    push_sized(&mut out, heap.data_address, opts.offset_size);
    out.resize(LOCAL_HEAP_HEADER_SIZE as usize, 0);
    out
}

fn row_major_index(coords: &[u64], dims: &[u64]) -> u64 {
    let mut index = 0;
    for (coord, dim) in coords.iter().zip(dims) {
        index = index * dim + coord;
    }
    index
}

/// Split a row-major element buffer into full-size chunks, zero-padding
/// the edge chunks. Returns `(origin, chunk bytes)` per chunk in
/// row-major chunk order.
fn carve_chunks(
    data: &[u8],
    dims: &[u64],
    chunk_dims: &[u64],
    element_size: usize,
) -> Vec<(Vec<u64>, Vec<u8>)> {
    let rank = dims.len();
    let counts: Vec<u64> = dims
        .iter()
        .zip(chunk_dims)
        .map(|(&d, &c)| ((d + c - 1) / c).max(1))
        .collect();
    let chunk_elements: u64 = chunk_dims.iter().product();
    let mut chunks = Vec::new();

    let mut grid = vec![0u64; rank];
    loop {
        let origin: Vec<u64> = grid
            .iter()
            .zip(chunk_dims)
            .map(|(&g, &c)| g * c)
            .collect();
        let mut buffer = vec![0u8; chunk_elements as usize * element_size];

        // Copy one run along the fastest-varying dimension at a time.
        let last = rank - 1;
        let run = chunk_dims[last].min(dims[last].saturating_sub(origin[last])) as usize;
        let mut local = vec![0u64; rank];
        loop {
            let inside = (0..last).all(|d| origin[d] + local[d] < dims[d]);
            if inside && run > 0 {
                let mut source = vec![0u64; rank];
                for d in 0..rank {
                    source[d] = origin[d] + local[d];
                }
                let src = row_major_index(&source, dims) as usize * element_size;
                let dst = row_major_index(&local, chunk_dims) as usize * element_size;
                buffer[dst..dst + run * element_size]
                    .copy_from_slice(&data[src..src + run * element_size]);
            }
            // Advance the odometer over the leading dimensions.
            let mut d = last;
            let mut done = last == 0;
            while d > 0 {
                d -= 1;
                local[d] += 1;
                if local[d] < chunk_dims[d] {
                    break;
                }
                local[d] = 0;
                if d == 0 {
                    done = true;
                }
            }
            if done {
                break;
            }
        }

        chunks.push((origin, buffer));

        let mut d = rank;
        let mut finished = true;
        while d > 0 {
            d -= 1;
            grid[d] += 1;
            if grid[d] < counts[d] {
                finished = false;
                break;
            }
            grid[d] = 0;
        }
        if finished {
            break;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_fits_exactly_without_padding() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let messages = [Message::SymbolTable(SymbolTableMessage {
            btree_address: 136,
            heap_address: 680,
        })];
        let image = build_header_block(&mut alloc, &messages, 40, 8, 8).unwrap();
        assert_eq!(image.inline.len(), 40);
        assert!(image.continuation.is_none());
        // version 1, one message, header size 24
        assert_eq!(image.inline[0], 1);
        assert_eq!(u16::from_le_bytes([image.inline[2], image.inline[3]]), 1);
        assert_eq!(
            u32::from_le_bytes([
                image.inline[8],
                image.inline[9],
                image.inline[10],
                image.inline[11]
            ]),
            24
        );
    }

    #[test]
    fn header_block_pads_with_nil() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let messages = [Message::ObjectModificationTime(1234)];
        let image = build_header_block(&mut alloc, &messages, 64, 8, 8).unwrap();
        assert_eq!(image.inline.len(), 64);
        // Two messages: the payload and the Nil filler.
        assert_eq!(u16::from_le_bytes([image.inline[2], image.inline[3]]), 2);
    }

    #[test]
    fn header_block_spills_to_continuation() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let messages: Vec<Message> = (0..12)
            .map(|i| Message::ObjectModificationTime(i))
            .collect();
        // 12 * 16 = 192 bytes of messages into a 64-byte block.
        let image = build_header_block(&mut alloc, &messages, 64, 8, 8).unwrap();
        assert_eq!(image.inline.len(), 64);
        let (address, bytes) = image.continuation.expect("must spill");
        assert!(address >= 800);
        assert_eq!(bytes.len() % 16, 0);
        let spilled = bytes.len() / 16;
        assert!(spilled > 0);
        // Inline holds the rest plus the continuation message.
        assert_eq!(
            u16::from_le_bytes([image.inline[2], image.inline[3]]) as usize,
            12 + 1
        );
    }

    #[test]
    fn carve_chunks_pads_edges() {
        // One dimension: 5 elements of 2 bytes, chunks of 2.
        let data: Vec<u8> = (0..10).collect();
        let chunks = carve_chunks(&data, &[5], &[2], 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (vec![0], vec![0, 1, 2, 3]));
        assert_eq!(chunks[1], (vec![2], vec![4, 5, 6, 7]));
        // The edge chunk is zero-padded to full size.
        assert_eq!(chunks[2], (vec![4], vec![8, 9, 0, 0]));
    }

    #[test]
    fn carve_chunks_two_dimensional() {
        // 3x3 single-byte elements in 2x2 chunks.
        let data: Vec<u8> = (0..9).collect();
        let chunks = carve_chunks(&data, &[3, 3], &[2, 2], 1);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], (vec![0, 0], vec![0, 1, 3, 4]));
        assert_eq!(chunks[1], (vec![0, 2], vec![2, 0, 5, 0]));
        assert_eq!(chunks[2], (vec![2, 0], vec![6, 7, 0, 0]));
        assert_eq!(chunks[3], (vec![2, 2], vec![8, 0, 0, 0]));
    }
}
