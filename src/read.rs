//! The read path: materializing the group/dataset tree from a mapped file
//! and iterating dataset elements in row-major dataspace order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::marker::PhantomData;

use crate::btree;
use crate::datatype::{DynamicValue, Hdf5Type, Registry};
use crate::error::{Hdf5Error, Result};
use crate::header::{
    self, DataLayout, FilterPipeline, Message, MessagePolicy, SymbolTableMessage,
};
use crate::heap::{self, GlobalHeapAccess};
use crate::parse;
use crate::{Dataset, Group};

pub(crate) struct TreeContext<'a> {
    pub file: &'a [u8],
    pub offset_size: u8,
    pub length_size: u8,
    pub policy: MessagePolicy,
    pub warnings: &'a mut Vec<String>,
    pub visited: &'a mut HashSet<u64>,
}

/// Read the object header at `header_address` and classify it: a group
/// (Symbol-Table message) or a dataset (Data-Layout message).
pub(crate) fn parse_object(ctx: &mut TreeContext, header_address: u64) -> Result<ParsedObject> {
    let messages = header::read_object_header(
        ctx.file,
        header_address,
        ctx.offset_size,
        ctx.length_size,
        ctx.policy,
        ctx.warnings,
    )?;

    let mut symbol_table: Option<SymbolTableMessage> = None;
    let mut dataspace = None;
    let mut datatype = None;
    let mut layout = None;
    let mut fill_value = None;
    let mut filters = None;
    let mut attributes = BTreeMap::new();
    let mut unknown_messages = Vec::new();

    for message in messages {
        match message {
            Message::SymbolTable(m) => symbol_table = Some(m),
            Message::Dataspace(m) => dataspace = Some(m),
            Message::Datatype(m) => datatype = Some(m),
            Message::DataLayout(m) => layout = Some(m),
            Message::FillValue(m) => fill_value = m.data,
            Message::FillValueOld(m) => fill_value = Some(m.data),
            Message::FilterPipeline(m) => filters = Some(m),
            Message::Attribute(m) => {
                attributes.insert(m.name.clone(), m);
            }
            Message::Unknown {
                message_type, data, ..
            } => unknown_messages.push((message_type, data)),
            _ => {}
        }
    }

    match (symbol_table, layout) {
        (Some(symbol_table), None) => {
            let group = parse_group(
                ctx,
                header_address,
                symbol_table.btree_address,
                symbol_table.heap_address,
                attributes,
                unknown_messages,
            )?;
            Ok(ParsedObject::Group(group))
        }
        (None, Some(layout)) => {
            let dataspace = dataspace.ok_or_else(|| {
                Hdf5Error::CorruptStructure(format!(
                    "dataset at {:#x} has no dataspace message",
                    header_address
                ))
            })?;
            let datatype = datatype.ok_or_else(|| {
                Hdf5Error::CorruptStructure(format!(
                    "dataset at {:#x} has no datatype message",
                    header_address
                ))
            })?;
            datatype.validate()?;
            Ok(ParsedObject::Dataset(Dataset {
                header_address,
                dataspace,
                datatype,
                layout,
                fill_value,
                filters,
                attributes,
                unknown_messages,
            }))
        }
        (Some(_), Some(_)) => Err(Hdf5Error::CorruptStructure(format!(
            "object at {:#x} is both a group and a dataset",
            header_address
        ))),
        (None, None) => Ok(ParsedObject::Other),
    }
}

pub(crate) enum ParsedObject {
    Group(Group),
    Dataset(Dataset),
    /// A valid header that is neither (e.g. a committed datatype).
    Other,
}

fn parse_group(
    ctx: &mut TreeContext,
    header_address: u64,
    btree_address: u64,
    heap_address: u64,
    attributes: BTreeMap<String, header::Attribute>,
    unknown_messages: Vec<(u16, Vec<u8>)>,
) -> Result<Group> {
    let mut group = Group {
        header_address,
        btree_address,
        heap_address,
        attributes,
        datasets: BTreeMap::new(),
        groups: BTreeMap::new(),
        unknown_messages,
    };

    if heap_address as usize >= ctx.file.len() {
        return Err(Hdf5Error::TruncatedBuffer {
            needed: heap_address as usize,
            available: ctx.file.len(),
        });
    }
    let (_, heap) = parse::local_heap(
        &ctx.file[heap_address as usize..],
        ctx.offset_size,
        ctx.length_size,
    )?;

    let snods = btree::collect_group_snods(
        ctx.file,
        btree_address,
        ctx.offset_size,
        ctx.length_size,
        &heap,
    )?;

    for snod_address in snods {
        if snod_address as usize >= ctx.file.len() {
            return Err(Hdf5Error::TruncatedBuffer {
                needed: snod_address as usize,
                available: ctx.file.len(),
            });
        }
        let (_, snod) =
            parse::symbol_table(&ctx.file[snod_address as usize..], ctx.offset_size)?;
        for entry in &snod.entries {
            let name = heap::read_name(ctx.file, &heap, entry.link_name_offset)?;
            if !ctx.visited.insert(entry.object_header_address) {
                // A hard link back into an ancestor; note it and stop
                // descending rather than recursing forever.
                ctx.warnings.push(format!(
                    "cyclic hard link {:?} at {:#x} not descended",
                    name, entry.object_header_address
                ));
                continue;
            }
            let parsed = match parse_object(ctx, entry.object_header_address) {
                Ok(parsed) => parsed,
                Err(e) => {
                    if ctx.policy == MessagePolicy::Lenient {
                        log::warn!("skipping child {:?}: {}", name, e);
                        ctx.warnings.push(format!("skipped {:?}: {}", name, e));
                        continue;
                    }
                    return Err(e);
                }
            };
            match parsed {
                ParsedObject::Group(child) => {
                    group.groups.insert(name, child);
                }
                ParsedObject::Dataset(child) => {
                    group.datasets.insert(name, child);
                }
                ParsedObject::Other => {
                    ctx.warnings
                        .push(format!("object {:?} is neither group nor dataset", name));
                }
            }
        }
    }
    Ok(group)
}

// ---------------------------------------------------------------------------
// Element access

/// Invert the filter pipeline over one chunk, in reverse declared order.
pub(crate) fn apply_filters(
    filters: &FilterPipeline,
    mut data: Vec<u8>,
    element_size: usize,
    filter_mask: u32,
) -> Result<Vec<u8>> {
    for (i, filter) in filters.filters.iter().enumerate().rev() {
        // A set mask bit means the filter was skipped when writing.
        if filter_mask & (1 << i) != 0 {
            continue;
        }
        match filter.id {
            1 => {
                let mut out = Vec::new();
                flate2::read::ZlibDecoder::new(&data[..])
                    .read_to_end(&mut out)
                    .map_err(|e| Hdf5Error::InvalidEncoding(format!("deflate: {}", e)))?;
                data = out;
            }
            2 => {
                let width = filter
                    .client_data
                    .first()
                    .map(|&v| v as usize)
                    .unwrap_or(element_size);
                data = unshuffle(&data, width);
            }
            3 => {
                if data.len() < 4 {
                    return Err(Hdf5Error::CorruptStructure(
                        "fletcher32 frame shorter than its checksum".to_string(),
                    ));
                }
                data.truncate(data.len() - 4);
            }
            other => {
                if filter.is_optional() {
                    log::warn!("skipping unsupported optional filter {}", other);
                } else {
                    return Err(Hdf5Error::UnsupportedFilter(other));
                }
            }
        }
    }
    Ok(data)
}

fn unshuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 || data.len() % element_size != 0 {
        return data.to_vec();
    }
    let count = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for byte in 0..element_size {
        for element in 0..count {
            out[element * element_size + byte] = data[byte * count + element];
        }
    }
    out
}

#[derive(Clone)]
pub(crate) struct ChunkStore<'f> {
    file: &'f [u8],
    dims: Vec<u64>,
    chunk_dims: Vec<u64>,
    element_size: usize,
    chunks: Vec<(parse::ChunkKey, u64)>,
    filters: Option<FilterPipeline>,
    decoded: HashMap<Vec<u64>, Vec<u8>>,
}

impl<'f> ChunkStore<'f> {
    fn chunk_elements(&self) -> usize {
        self.chunk_dims.iter().product::<u64>() as usize
    }

    fn decode_chunk(&mut self, origin: &[u64]) -> Result<()> {
        if self.decoded.contains_key(origin) {
            return Ok(());
        }
        let mut key_offsets = origin.to_vec();
        key_offsets.push(0);
        let found = self
            .chunks
            .binary_search_by(|(key, _)| key.offsets.cmp(&key_offsets));
        let bytes = match found {
            Ok(i) => {
                let (key, address) = &self.chunks[i];
                let start = *address as usize;
                let end = start + key.nbytes as usize;
                if end > self.file.len() {
                    return Err(Hdf5Error::TruncatedBuffer {
                        needed: end,
                        available: self.file.len(),
                    });
                }
                let raw = self.file[start..end].to_vec();
                let decoded = match &self.filters {
                    Some(filters) => {
                        apply_filters(filters, raw, self.element_size, key.filter_mask)?
                    }
                    None => raw,
                };
                let expected = self.chunk_elements() * self.element_size;
                if decoded.len() != expected {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "chunk at {:?} decodes to {} bytes, expected {}",
                        origin,
                        decoded.len(),
                        expected
                    )));
                }
                decoded
            }
            // An unallocated chunk reads as the fill pattern.
            Err(_) => vec![0u8; self.chunk_elements() * self.element_size],
        };
        self.decoded.insert(origin.to_vec(), bytes);
        Ok(())
    }

    fn element(&mut self, index: u64) -> Result<&[u8]> {
        let coords = unravel(index, &self.dims);
        let origin: Vec<u64> = coords
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&c, &k)| (c / k) * k)
            .collect();
        let local: Vec<u64> = coords
            .iter()
            .zip(&origin)
            .map(|(&c, &o)| c - o)
            .collect();
        self.decode_chunk(&origin)?;
        let offset = row_major_index(&local, &self.chunk_dims) as usize * self.element_size;
        Ok(&self.decoded[&origin][offset..offset + self.element_size])
    }
}

#[derive(Clone)]
pub(crate) enum ElementSource<'f> {
    Contiguous(&'f [u8]),
    Compact(Vec<u8>),
    Chunked(Box<ChunkStore<'f>>),
}

impl<'f> ElementSource<'f> {
    /// Resolve the dataset's layout into an element byte source.
    pub(crate) fn open(
        file: &'f [u8],
        offset_size: u8,
        length_size: u8,
        dataset: &Dataset,
    ) -> Result<ElementSource<'f>> {
        match &dataset.layout {
            DataLayout::Contiguous { address, size } => {
                if crate::fixed::is_undefined(*address, offset_size) {
                    return Ok(ElementSource::Contiguous(&[]));
                }
                let start = *address as usize;
                let end = start + *size as usize;
                if end > file.len() {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "contiguous data [{:#x}, {:#x}) beyond end of file",
                        start, end
                    )));
                }
                Ok(ElementSource::Contiguous(&file[start..end]))
            }
            DataLayout::Compact { data } => Ok(ElementSource::Compact(data.clone())),
            DataLayout::Chunked {
                btree_address,
                dims,
                element_size: chunk_element_size,
            } => {
                let rank = dataset.dataspace.dims.len();
                if dims.len() != rank {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "chunk rank {} against dataspace rank {}",
                        dims.len(),
                        rank
                    )));
                }
                let chunks = btree::collect_chunks(
                    file,
                    *btree_address,
                    offset_size,
                    length_size,
                    rank as u8 + 1,
                )?;
                Ok(ElementSource::Chunked(Box::new(ChunkStore {
                    file,
                    dims: dataset.dataspace.dims.clone(),
                    chunk_dims: dims.iter().map(|&d| u64::from(d)).collect(),
                    element_size: *chunk_element_size as usize,
                    chunks,
                    filters: dataset.filters.clone(),
                    decoded: HashMap::new(),
                })))
            }
            DataLayout::Virtual { .. } => Err(Hdf5Error::UnknownConverter(
                "virtual dataset element access",
            )),
        }
    }

    fn element(&mut self, index: u64, element_size: usize) -> Result<&[u8]> {
        match self {
            ElementSource::Contiguous(data) => {
                let start = index as usize * element_size;
                Ok(&data[start..start + element_size])
            }
            ElementSource::Compact(data) => {
                let start = index as usize * element_size;
                if start + element_size > data.len() {
                    return Err(Hdf5Error::TruncatedBuffer {
                        needed: start + element_size,
                        available: data.len(),
                    });
                }
                Ok(&data[start..start + element_size])
            }
            ElementSource::Chunked(store) => store.element(index),
        }
    }

    fn available_elements(&self, declared: u64, element_size: usize) -> u64 {
        match self {
            ElementSource::Contiguous(data) => {
                declared.min((data.len() / element_size.max(1)) as u64)
            }
            _ => declared,
        }
    }
}

/// A finite, lazy, typed pass over a dataset's elements. Dropping the
/// iterator discards any partially decoded chunks; cloning it yields an
/// independent cursor at the same position.
#[derive(Clone)]
pub struct ElementIter<'f, T: Hdf5Type> {
    source: ElementSource<'f>,
    element_size: usize,
    index: u64,
    total: u64,
    _marker: PhantomData<T>,
}

impl<'f, T: Hdf5Type> ElementIter<'f, T> {
    pub(crate) fn new(
        source: ElementSource<'f>,
        element_size: usize,
        declared_elements: u64,
    ) -> ElementIter<'f, T> {
        let total = source.available_elements(declared_elements, element_size);
        ElementIter {
            source,
            element_size,
            index: 0,
            total,
            _marker: PhantomData,
        }
    }
}

impl<'f, T: Hdf5Type> Iterator for ElementIter<'f, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.index >= self.total {
            return None;
        }
        let result = self
            .source
            .element(self.index, self.element_size)
            .map(T::from_le_bytes);
        self.index += 1;
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.index) as usize;
        (remaining, Some(remaining))
    }
}

/// The untyped counterpart of [`ElementIter`]: decodes through the
/// converter registry, resolving vlen data through the global heap.
#[derive(Clone)]
pub struct DynamicIter<'f> {
    source: ElementSource<'f>,
    registry: &'f Registry,
    datatype: crate::datatype::Datatype,
    heap: heap::FileHeapAccess<'f>,
    index: u64,
    total: u64,
}

impl<'f> DynamicIter<'f> {
    pub(crate) fn new(
        source: ElementSource<'f>,
        registry: &'f Registry,
        datatype: crate::datatype::Datatype,
        heap: heap::FileHeapAccess<'f>,
        declared_elements: u64,
    ) -> DynamicIter<'f> {
        let total = source.available_elements(declared_elements, datatype.size_in_bytes() as usize);
        DynamicIter {
            source,
            registry,
            datatype,
            heap,
            index: 0,
            total,
        }
    }
}

impl<'f> Iterator for DynamicIter<'f> {
    type Item = Result<DynamicValue>;

    fn next(&mut self) -> Option<Result<DynamicValue>> {
        if self.index >= self.total {
            return None;
        }
        let element_size = self.datatype.size_in_bytes() as usize;
        let result = match self.source.element(self.index, element_size) {
            Ok(bytes) => {
                let heap: &dyn GlobalHeapAccess = &self.heap;
                self.registry.decode(&self.datatype, bytes, Some(heap))
            }
            Err(e) => Err(e),
        };
        self.index += 1;
        Some(result)
    }
}

pub(crate) fn row_major_index(coords: &[u64], dims: &[u64]) -> u64 {
    let mut index = 0;
    for (coord, dim) in coords.iter().zip(dims) {
        index = index * dim + coord;
    }
    index
}

pub(crate) fn unravel(mut index: u64, dims: &[u64]) -> Vec<u64> {
    let mut coords = vec![0u64; dims.len()];
    for d in (0..dims.len()).rev() {
        coords[d] = index % dims[d];
        index /= dims[d];
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Filter;

    #[test]
    fn unravel_inverts_row_major() {
        let dims = [3u64, 4, 5];
        for index in 0..60 {
            let coords = unravel(index, &dims);
            assert_eq!(row_major_index(&coords, &dims), index);
        }
    }

    #[test]
    fn shuffle_inverts() {
        // Shuffled layout: all byte-0s, then all byte-1s.
        let shuffled = vec![1, 3, 5, 2, 4, 6];
        assert_eq!(unshuffle(&shuffled, 2), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn deflate_filter_is_inverted() {
        let original: Vec<u8> = (0..64).collect();
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &original).unwrap();
        let compressed = encoder.finish().unwrap();

        let pipeline = FilterPipeline {
            version: 1,
            filters: vec![Filter {
                id: 1,
                name: "deflate".to_string(),
                flags: 0,
                client_data: vec![6],
            }],
        };
        let decoded = apply_filters(&pipeline, compressed, 1, 0).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn mandatory_unknown_filter_fails_optional_is_skipped() {
        let data = vec![1, 2, 3, 4];
        let mandatory = FilterPipeline {
            version: 1,
            filters: vec![Filter {
                id: 999,
                name: "mystery".to_string(),
                flags: 0,
                client_data: vec![],
            }],
        };
        assert!(matches!(
            apply_filters(&mandatory, data.clone(), 1, 0),
            Err(Hdf5Error::UnsupportedFilter(999))
        ));

        let optional = FilterPipeline {
            version: 1,
            filters: vec![Filter {
                id: 999,
                name: "mystery".to_string(),
                flags: 1,
                client_data: vec![],
            }],
        };
        assert_eq!(apply_filters(&optional, data.clone(), 1, 0).unwrap(), data);
    }

    #[test]
    fn fletcher_frames_lose_their_trailer() {
        let pipeline = FilterPipeline {
            version: 1,
            filters: vec![Filter {
                id: 3,
                name: "fletcher32".to_string(),
                flags: 0,
                client_data: vec![],
            }],
        };
        let framed = vec![1, 2, 3, 4, 0xAA, 0xBB, 0xCC, 0xDD];
        assert_eq!(apply_filters(&pipeline, framed, 1, 0).unwrap(), vec![1, 2, 3, 4]);
    }
}
