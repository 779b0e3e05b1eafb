//! Object-header messages: the typed records that describe one HDF5
//! object, their envelopes, and the continuation-chasing header reader.

use std::collections::HashSet;

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::datatype::{self, Datatype};
use crate::error::{Hdf5Error, Result};
use crate::parse::{self, address, pad8, Result as ParseResult};

pub const MSG_NIL: u16 = 0x00;
pub const MSG_DATASPACE: u16 = 0x01;
pub const MSG_LINK_INFO: u16 = 0x02;
pub const MSG_DATATYPE: u16 = 0x03;
pub const MSG_FILL_VALUE_OLD: u16 = 0x04;
pub const MSG_FILL_VALUE: u16 = 0x05;
pub const MSG_LINK: u16 = 0x06;
pub const MSG_EXTERNAL_FILES: u16 = 0x07;
pub const MSG_DATA_LAYOUT: u16 = 0x08;
pub const MSG_GROUP_INFO: u16 = 0x0A;
pub const MSG_FILTER_PIPELINE: u16 = 0x0B;
pub const MSG_ATTRIBUTE: u16 = 0x0C;
pub const MSG_CONTINUATION: u16 = 0x10;
pub const MSG_SYMBOL_TABLE: u16 = 0x11;
pub const MSG_MODIFICATION_TIME: u16 = 0x12;
pub const MSG_BTREE_K_VALUES: u16 = 0x13;
pub const MSG_ATTRIBUTE_INFO: u16 = 0x15;
pub const MSG_REFERENCE_COUNT: u16 = 0x16;

/// Message flag: fail when the type is unknown and the file is writable.
pub const FLAG_FAIL_IF_UNKNOWN_WRITABLE: u8 = 0x08;
/// Message flag: fail whenever the type is unknown.
pub const FLAG_FAIL_ALWAYS_IF_UNKNOWN: u8 = 0x80;

#[derive(Debug, Clone, PartialEq)]
pub struct Dataspace {
    pub version: u8,
    pub dims: Vec<u64>,
    pub max_dims: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn new(dims: Vec<u64>) -> Dataspace {
        Dataspace {
            version: 1,
            dims,
            max_dims: None,
        }
    }

    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }

    pub fn serialize(&self, out: &mut Vec<u8>, length_size: u8) {
        out.push(1);
        out.push(self.dims.len() as u8);
        out.push(if self.max_dims.is_some() { 1 } else { 0 });
        out.extend_from_slice(&[0; 5]);
        for &dim in &self.dims {
            push_sized(out, dim, length_size);
        }
        if let Some(max_dims) = &self.max_dims {
            for &dim in max_dims {
                push_sized(out, dim, length_size);
            }
        }
    }
}

pub fn dataspace<'a>(input: &'a [u8], length_size: u8) -> ParseResult<'a, Dataspace> {
    context("dataspace", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, dimensionality) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let input = match version {
            1 => take(5usize)(input)?.0,
            _ => take(1usize)(input)?.0,
        };
        let (input, dims) = count(address(length_size), dimensionality as usize)(input)?;
        let (input, max_dims) = if flags & 1 != 0 {
            let (input, max_dims) = count(address(length_size), dimensionality as usize)(input)?;
            (input, Some(max_dims))
        } else {
            (input, None)
        };
        // Permutation indices were never implemented by the format; skip.
        let input = if flags & 2 != 0 {
            count(address(length_size), dimensionality as usize)(input)?.0
        } else {
            input
        };
        Ok((
            input,
            Dataspace {
                version,
                dims,
                max_dims,
            },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillValueOld {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillValue {
    pub version: u8,
    pub space_allocation_time: u8,
    pub fill_value_write_time: u8,
    pub defined: bool,
    pub data: Option<Vec<u8>>,
}

impl FillValue {
    /// The writer's default: allocate late, write when set, no fill.
    pub fn undefined() -> FillValue {
        FillValue {
            version: 2,
            space_allocation_time: 2,
            fill_value_write_time: 2,
            defined: false,
            data: None,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(2);
        out.push(self.space_allocation_time);
        out.push(self.fill_value_write_time);
        out.push(if self.defined { 1 } else { 0 });
        if self.defined {
            let data = self.data.as_deref().unwrap_or(&[]);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
    }
}

fn fill_value(input: &[u8]) -> ParseResult<FillValue> {
    context("fill value", |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 | 2 => {
                let (input, space_allocation_time) = le_u8(input)?;
                let (input, fill_value_write_time) = le_u8(input)?;
                let (input, fill_value_defined) = le_u8(input)?;
                let defined = fill_value_defined != 0;
                let (input, data) = if version == 1 || defined {
                    let (input, size) = le_u32(input)?;
                    let (input, bytes) = take(size as usize)(input)?;
                    (input, Some(bytes.to_vec()))
                } else {
                    (input, None)
                };
                Ok((
                    input,
                    FillValue {
                        version,
                        space_allocation_time,
                        fill_value_write_time,
                        defined,
                        data,
                    },
                ))
            }
            _ => {
                // Version 3 packs everything into a flags byte.
                let (input, flags) = le_u8(input)?;
                let defined = flags & 0x20 != 0;
                let (input, data) = if defined {
                    let (input, size) = le_u32(input)?;
                    let (input, bytes) = take(size as usize)(input)?;
                    (input, Some(bytes.to_vec()))
                } else {
                    (input, None)
                };
                Ok((
                    input,
                    FillValue {
                        version,
                        space_allocation_time: flags & 0x03,
                        fill_value_write_time: (flags >> 2) & 0x03,
                        defined,
                        data,
                    },
                ))
            }
        }
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataLayout {
    Contiguous {
        address: u64,
        size: u64,
    },
    Chunked {
        btree_address: u64,
        /// Per-chunk dimension sizes, excluding the trailing element
        /// dimension stored on disk.
        dims: Vec<u32>,
        element_size: u32,
    },
    Compact {
        data: Vec<u8>,
    },
    Virtual {
        address: u64,
        index: u32,
    },
}

impl DataLayout {
    pub fn class(&self) -> u8 {
        match self {
            DataLayout::Compact { .. } => 0,
            DataLayout::Contiguous { .. } => 1,
            DataLayout::Chunked { .. } => 2,
            DataLayout::Virtual { .. } => 3,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>, offset_size: u8, length_size: u8) {
        match self {
            DataLayout::Virtual { address, index } => {
                out.push(4);
                out.push(3);
                push_sized(out, *address, offset_size);
                out.extend_from_slice(&index.to_le_bytes());
            }
            DataLayout::Contiguous { address, size } => {
                out.push(3);
                out.push(1);
                push_sized(out, *address, offset_size);
                push_sized(out, *size, length_size);
            }
            DataLayout::Chunked {
                btree_address,
                dims,
                element_size,
            } => {
                out.push(3);
                out.push(2);
                out.push(dims.len() as u8 + 1);
                push_sized(out, *btree_address, offset_size);
                for &dim in dims {
                    out.extend_from_slice(&dim.to_le_bytes());
                }
                out.extend_from_slice(&element_size.to_le_bytes());
            }
            DataLayout::Compact { data } => {
                out.push(3);
                out.push(0);
                out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                out.extend_from_slice(data);
            }
        }
    }
}

fn data_layout<'a>(input: &'a [u8], offset_size: u8, length_size: u8) -> ParseResult<'a, DataLayout> {
    context("data layout", move |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 | 2 => {
                let (input, dimensionality) = le_u8(input)?;
                let (input, layout_class) = le_u8(input)?;
                let (input, _) = take(5usize)(input)?;
                match layout_class {
                    0 => {
                        let (input, dims) = count(le_u32, dimensionality as usize)(input)?;
                        let _ = dims;
                        let (input, size) = le_u32(input)?;
                        let (input, data) = take(size as usize)(input)?;
                        Ok((input, DataLayout::Compact { data: data.to_vec() }))
                    }
                    1 => {
                        let (input, data_address) = address(offset_size)(input)?;
                        let (input, dims) = count(le_u32, dimensionality as usize)(input)?;
                        let size = dims.iter().map(|&d| u64::from(d)).product();
                        Ok((
                            input,
                            DataLayout::Contiguous {
                                address: data_address,
                                size,
                            },
                        ))
                    }
                    _ => {
                        let (input, btree_address) = address(offset_size)(input)?;
                        let (input, dims) = count(le_u32, dimensionality as usize)(input)?;
                        let (input, element_size) = le_u32(input)?;
                        Ok((
                            input,
                            DataLayout::Chunked {
                                btree_address,
                                dims,
                                element_size,
                            },
                        ))
                    }
                }
            }
            3 => {
                let (input, layout_class) = le_u8(input)?;
                match layout_class {
                    0 => {
                        let (input, size) = le_u16(input)?;
                        let (input, data) = take(size as usize)(input)?;
                        Ok((input, DataLayout::Compact { data: data.to_vec() }))
                    }
                    1 => {
                        let (input, data_address) = address(offset_size)(input)?;
                        let (input, size) = address(length_size)(input)?;
                        Ok((
                            input,
                            DataLayout::Contiguous {
                                address: data_address,
                                size,
                            },
                        ))
                    }
                    _ => {
                        let (input, dimensionality) = le_u8(input)?;
                        let (input, btree_address) = address(offset_size)(input)?;
                        // The stored rank includes the element dimension.
                        let stored = dimensionality.max(1) - 1;
                        let (input, dims) = count(le_u32, stored as usize)(input)?;
                        let (input, element_size) = le_u32(input)?;
                        Ok((
                            input,
                            DataLayout::Chunked {
                                btree_address,
                                dims,
                                element_size,
                            },
                        ))
                    }
                }
            }
            4 => {
                let (input, layout_class) = le_u8(input)?;
                if layout_class != 3 {
                    return Err(nom::Err::Failure(nom::error::VerboseError {
                        errors: vec![(
                            input,
                            nom::error::VerboseErrorKind::Context("data layout version 4"),
                        )],
                    }));
                }
                let (input, heap_address) = address(offset_size)(input)?;
                let (input, index) = le_u32(input)?;
                Ok((
                    input,
                    DataLayout::Virtual {
                        address: heap_address,
                        index,
                    },
                ))
            }
            _ => Err(nom::Err::Failure(nom::error::VerboseError {
                errors: vec![(
                    input,
                    nom::error::VerboseErrorKind::Context("data layout version"),
                )],
            })),
        }
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub version: u8,
    pub flags: u8,
    pub max_creation_index: Option<u64>,
    pub fractal_heap_address: u64,
    pub name_index_btree_address: u64,
    pub creation_order_btree_address: Option<u64>,
}

fn link_info<'a>(input: &'a [u8], offset_size: u8) -> ParseResult<'a, LinkInfo> {
    context("link info", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, max_creation_index) = if flags & 1 != 0 {
            let (input, v) = address(8)(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        let (input, fractal_heap_address) = address(offset_size)(input)?;
        let (input, name_index_btree_address) = address(offset_size)(input)?;
        let (input, creation_order_btree_address) = if flags & 2 != 0 {
            let (input, v) = address(offset_size)(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        Ok((
            input,
            LinkInfo {
                version,
                flags,
                max_creation_index,
                fractal_heap_address,
                name_index_btree_address,
                creation_order_btree_address,
            },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
    Other { link_type: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub version: u8,
    pub creation_order: Option<u64>,
    pub name: String,
    pub target: LinkTarget,
}

fn link<'a>(input: &'a [u8], offset_size: u8) -> ParseResult<'a, Link> {
    context("link", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, link_type) = if flags & 0x08 != 0 {
            le_u8(input)?
        } else {
            (input, 0)
        };
        let (input, creation_order) = if flags & 0x04 != 0 {
            let (input, v) = address(8)(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        let input = if flags & 0x10 != 0 {
            take(1usize)(input)?.0
        } else {
            input
        };
        let name_width = 1u8 << (flags & 0x03);
        let (input, name_len) = address(name_width)(input)?;
        let (input, name_bytes) = take(name_len as usize)(input)?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();
        let (input, target) = match link_type {
            0 => {
                let (input, header_address) = address(offset_size)(input)?;
                (input, LinkTarget::Hard(header_address))
            }
            1 => {
                let (input, target_len) = le_u16(input)?;
                let (input, target_bytes) = take(target_len as usize)(input)?;
                (
                    input,
                    LinkTarget::Soft(String::from_utf8_lossy(target_bytes).into_owned()),
                )
            }
            other => {
                let (input, data_len) = le_u16(input)?;
                let (input, data) = take(data_len as usize)(input)?;
                (
                    input,
                    LinkTarget::Other {
                        link_type: other,
                        data: data.to_vec(),
                    },
                )
            }
        };
        Ok((
            input,
            Link {
                version,
                creation_order,
                name,
                target,
            },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalFileEntry {
    pub name_offset: u64,
    pub file_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalDataFiles {
    pub allocated: u16,
    pub used: u16,
    pub heap_address: u64,
    pub entries: Vec<ExternalFileEntry>,
}

fn external_data_files<'a>(
    input: &'a [u8],
    offset_size: u8,
    length_size: u8,
) -> ParseResult<'a, ExternalDataFiles> {
    context("external data files", move |input| {
        let (input, _version) = tag([1])(input)?;
        let (input, _) = take(3usize)(input)?;
        let (input, allocated) = le_u16(input)?;
        let (input, used) = le_u16(input)?;
        let (input, heap_address) = address(offset_size)(input)?;
        let mut entries = Vec::with_capacity(used as usize);
        let mut rest = input;
        for _ in 0..used {
            let (r, name_offset) = address(length_size)(rest)?;
            let (r, file_offset) = address(length_size)(r)?;
            let (r, size) = address(length_size)(r)?;
            entries.push(ExternalFileEntry {
                name_offset,
                file_offset,
                size,
            });
            rest = r;
        }
        Ok((
            rest,
            ExternalDataFiles {
                allocated,
                used,
                heap_address,
                entries,
            },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub version: u8,
    pub flags: u8,
    pub max_compact: Option<u16>,
    pub min_dense: Option<u16>,
    pub estimated_entries: Option<u16>,
    pub estimated_name_length: Option<u16>,
}

fn group_info(input: &[u8]) -> ParseResult<GroupInfo> {
    context("group info", |input| {
        let (input, version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, max_compact, min_dense) = if flags & 1 != 0 {
            let (input, a) = le_u16(input)?;
            let (input, b) = le_u16(input)?;
            (input, Some(a), Some(b))
        } else {
            (input, None, None)
        };
        let (input, estimated_entries, estimated_name_length) = if flags & 2 != 0 {
            let (input, a) = le_u16(input)?;
            let (input, b) = le_u16(input)?;
            (input, Some(a), Some(b))
        } else {
            (input, None, None)
        };
        Ok((
            input,
            GroupInfo {
                version,
                flags,
                max_compact,
                min_dense,
                estimated_entries,
                estimated_name_length,
            },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub id: u16,
    pub name: String,
    pub flags: u16,
    pub client_data: Vec<u32>,
}

impl Filter {
    /// Flag bit 0: the filter is optional and may be skipped on failure.
    pub fn is_optional(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterPipeline {
    pub version: u8,
    pub filters: Vec<Filter>,
}

impl FilterPipeline {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(1);
        out.push(self.filters.len() as u8);
        out.extend_from_slice(&[0; 6]);
        for filter in &self.filters {
            out.extend_from_slice(&filter.id.to_le_bytes());
            let name_len = if filter.name.is_empty() {
                0
            } else {
                pad8(filter.name.len() + 1)
            };
            out.extend_from_slice(&(name_len as u16).to_le_bytes());
            out.extend_from_slice(&filter.flags.to_le_bytes());
            out.extend_from_slice(&(filter.client_data.len() as u16).to_le_bytes());
            out.extend_from_slice(filter.name.as_bytes());
            out.resize(out.len() + name_len - filter.name.len(), 0);
            for &value in &filter.client_data {
                out.extend_from_slice(&value.to_le_bytes());
            }
            if filter.client_data.len() % 2 == 1 {
                out.extend_from_slice(&[0; 4]);
            }
        }
    }
}

fn filter_pipeline(input: &[u8]) -> ParseResult<FilterPipeline> {
    context("filter pipeline", |input| {
        let (input, version) = le_u8(input)?;
        let (input, n_filters) = le_u8(input)?;
        let input = if version == 1 {
            take(6usize)(input)?.0
        } else {
            input
        };
        let mut filters = Vec::with_capacity(n_filters as usize);
        let mut rest = input;
        for _ in 0..n_filters {
            let (r, id) = le_u16(rest)?;
            let (r, name_len) = if version == 1 || id >= 256 {
                le_u16(r)?
            } else {
                (r, 0)
            };
            let (r, flags) = le_u16(r)?;
            let (r, n_values) = le_u16(r)?;
            let (r, name_bytes) = take(name_len as usize)(r)?;
            let end = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
            let (r, client_data) = count(le_u32, n_values as usize)(r)?;
            let r = if version == 1 && n_values % 2 == 1 {
                take(4usize)(r)?.0
            } else {
                r
            };
            filters.push(Filter {
                id,
                name,
                flags,
                client_data,
            });
            rest = r;
        }
        Ok((
            rest,
            FilterPipeline { version, filters },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub version: u8,
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
}

impl Attribute {
    /// Serialize as a version-1 attribute message. Sub-block sizes are
    /// computed from the actual serialized datatype and dataspace.
    pub fn serialize(&self, out: &mut Vec<u8>, length_size: u8) {
        let mut datatype_block = Vec::new();
        self.datatype.serialize(&mut datatype_block);
        let mut dataspace_block = Vec::new();
        self.dataspace.serialize(&mut dataspace_block, length_size);

        let name_size = self.name.len() + 1;
        out.push(1);
        out.push(0);
        out.extend_from_slice(&(name_size as u16).to_le_bytes());
        out.extend_from_slice(&(datatype_block.len() as u16).to_le_bytes());
        out.extend_from_slice(&(dataspace_block.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.resize(out.len() + pad8(name_size) - self.name.len(), 0);
        out.extend_from_slice(&datatype_block);
        out.resize(out.len() + pad8(datatype_block.len()) - datatype_block.len(), 0);
        out.extend_from_slice(&dataspace_block);
        out.resize(
            out.len() + pad8(dataspace_block.len()) - dataspace_block.len(),
            0,
        );
        out.extend_from_slice(&self.data);
    }
}

fn attribute<'a>(input: &'a [u8], length_size: u8) -> ParseResult<'a, Attribute> {
    context("attribute", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, _flags) = le_u8(input)?;
        let (input, name_size) = le_u16(input)?;
        let (input, datatype_size) = le_u16(input)?;
        let (input, dataspace_size) = le_u16(input)?;
        let input = if version >= 3 {
            // Name character-set encoding.
            take(1usize)(input)?.0
        } else {
            input
        };

        let padded = version == 1;
        let name_stored = if padded {
            pad8(name_size)
        } else {
            name_size as usize
        };
        let (input, name_bytes) = take(name_stored)(input)?;
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();

        let datatype_stored = if padded {
            pad8(datatype_size)
        } else {
            datatype_size as usize
        };
        let (input, datatype_bytes) = take(datatype_stored)(input)?;
        let (_, parsed_datatype) = datatype::datatype(datatype_bytes)?;

        let dataspace_stored = if padded {
            pad8(dataspace_size)
        } else {
            dataspace_size as usize
        };
        let (input, dataspace_bytes) = take(dataspace_stored)(input)?;
        let (_, parsed_dataspace) = dataspace(dataspace_bytes, length_size)?;

        // The value length comes from the embedded datatype and dataspace;
        // anything after it is envelope padding.
        let value_len =
            parsed_datatype.size_in_bytes() * parsed_dataspace.element_count();
        let (input, data) = take(value_len as usize)(input)?;

        Ok((
            input,
            Attribute {
                version,
                name,
                datatype: parsed_datatype,
                dataspace: parsed_dataspace,
                data: data.to_vec(),
            },
        ))
    })(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub heap_address: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtreeKValues {
    pub indexed_storage_k: u16,
    pub group_internal_k: u16,
    pub group_leaf_k: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfo {
    pub version: u8,
    pub flags: u8,
    pub max_creation_index: Option<u16>,
    pub fractal_heap_address: u64,
    pub name_btree_address: u64,
    pub creation_order_btree_address: Option<u64>,
}

fn attribute_info<'a>(input: &'a [u8], offset_size: u8) -> ParseResult<'a, AttributeInfo> {
    context("attribute info", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, max_creation_index) = if flags & 1 != 0 {
            let (input, v) = le_u16(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        let (input, fractal_heap_address) = address(offset_size)(input)?;
        let (input, name_btree_address) = address(offset_size)(input)?;
        let (input, creation_order_btree_address) = if flags & 2 != 0 {
            let (input, v) = address(offset_size)(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        Ok((
            input,
            AttributeInfo {
                version,
                flags,
                max_creation_index,
                fractal_heap_address,
                name_btree_address,
                creation_order_btree_address,
            },
        ))
    })(input)
}

/// Every message kind the library understands, plus preserved unknowns.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Nil,
    Dataspace(Dataspace),
    LinkInfo(LinkInfo),
    Datatype(Datatype),
    FillValueOld(FillValueOld),
    FillValue(FillValue),
    Link(Link),
    ExternalDataFiles(ExternalDataFiles),
    DataLayout(DataLayout),
    GroupInfo(GroupInfo),
    FilterPipeline(FilterPipeline),
    Attribute(Attribute),
    ObjectHeaderContinuation(Continuation),
    SymbolTable(SymbolTableMessage),
    ObjectModificationTime(u32),
    BtreeKValues(BtreeKValues),
    AttributeInfo(AttributeInfo),
    ObjectReferenceCount(u32),
    Unknown {
        message_type: u16,
        flags: u8,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn type_code(&self) -> u16 {
        match self {
            Message::Nil => MSG_NIL,
            Message::Dataspace(_) => MSG_DATASPACE,
            Message::LinkInfo(_) => MSG_LINK_INFO,
            Message::Datatype(_) => MSG_DATATYPE,
            Message::FillValueOld(_) => MSG_FILL_VALUE_OLD,
            Message::FillValue(_) => MSG_FILL_VALUE,
            Message::Link(_) => MSG_LINK,
            Message::ExternalDataFiles(_) => MSG_EXTERNAL_FILES,
            Message::DataLayout(_) => MSG_DATA_LAYOUT,
            Message::GroupInfo(_) => MSG_GROUP_INFO,
            Message::FilterPipeline(_) => MSG_FILTER_PIPELINE,
            Message::Attribute(_) => MSG_ATTRIBUTE,
            Message::ObjectHeaderContinuation(_) => MSG_CONTINUATION,
            Message::SymbolTable(_) => MSG_SYMBOL_TABLE,
            Message::ObjectModificationTime(_) => MSG_MODIFICATION_TIME,
            Message::BtreeKValues(_) => MSG_BTREE_K_VALUES,
            Message::AttributeInfo(_) => MSG_ATTRIBUTE_INFO,
            Message::ObjectReferenceCount(_) => MSG_REFERENCE_COUNT,
            Message::Unknown { message_type, .. } => *message_type,
        }
    }

    /// Serialize the message body (no envelope, no padding).
    pub fn serialize_body(&self, out: &mut Vec<u8>, offset_size: u8, length_size: u8) {
        match self {
            Message::Nil => {}
            Message::Dataspace(m) => m.serialize(out, length_size),
            Message::LinkInfo(m) => {
                out.push(m.version);
                out.push(m.flags);
                if let Some(v) = m.max_creation_index {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                push_sized(out, m.fractal_heap_address, offset_size);
                push_sized(out, m.name_index_btree_address, offset_size);
                if let Some(v) = m.creation_order_btree_address {
                    push_sized(out, v, offset_size);
                }
            }
            Message::Datatype(m) => m.serialize(out),
            Message::FillValueOld(m) => {
                out.extend_from_slice(&(m.data.len() as u32).to_le_bytes());
                out.extend_from_slice(&m.data);
            }
            Message::FillValue(m) => m.serialize(out),
            Message::Link(m) => {
                out.push(1);
                let mut flags = 0x03 & name_length_width_flag(m.name.len());
                if !matches!(m.target, LinkTarget::Hard(_)) {
                    flags |= 0x08;
                }
                out.push(flags);
                if flags & 0x08 != 0 {
                    out.push(match &m.target {
                        LinkTarget::Soft(_) => 1,
                        LinkTarget::Other { link_type, .. } => *link_type,
                        LinkTarget::Hard(_) => 0,
                    });
                }
                let width = 1usize << (flags & 0x03);
                for i in 0..width {
                    out.push((m.name.len() >> (8 * i)) as u8);
                }
                out.extend_from_slice(m.name.as_bytes());
                match &m.target {
                    LinkTarget::Hard(addr) => push_sized(out, *addr, offset_size),
                    LinkTarget::Soft(target) => {
                        out.extend_from_slice(&(target.len() as u16).to_le_bytes());
                        out.extend_from_slice(target.as_bytes());
                    }
                    LinkTarget::Other { data, .. } => {
                        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                        out.extend_from_slice(data);
                    }
                }
            }
            Message::ExternalDataFiles(m) => {
                out.push(1);
                out.extend_from_slice(&[0; 3]);
                out.extend_from_slice(&m.allocated.to_le_bytes());
                out.extend_from_slice(&m.used.to_le_bytes());
                push_sized(out, m.heap_address, offset_size);
                for entry in &m.entries {
                    push_sized(out, entry.name_offset, length_size);
                    push_sized(out, entry.file_offset, length_size);
                    push_sized(out, entry.size, length_size);
                }
            }
            Message::DataLayout(m) => m.serialize(out, offset_size, length_size),
            Message::GroupInfo(m) => {
                out.push(m.version);
                out.push(m.flags);
                if let (Some(a), Some(b)) = (m.max_compact, m.min_dense) {
                    out.extend_from_slice(&a.to_le_bytes());
                    out.extend_from_slice(&b.to_le_bytes());
                }
                if let (Some(a), Some(b)) = (m.estimated_entries, m.estimated_name_length) {
                    out.extend_from_slice(&a.to_le_bytes());
                    out.extend_from_slice(&b.to_le_bytes());
                }
            }
            Message::FilterPipeline(m) => m.serialize(out),
            Message::Attribute(m) => m.serialize(out, length_size),
            Message::ObjectHeaderContinuation(m) => {
                push_sized(out, m.offset, offset_size);
                push_sized(out, m.length, length_size);
            }
            Message::SymbolTable(m) => {
                push_sized(out, m.btree_address, offset_size);
                push_sized(out, m.heap_address, offset_size);
            }
            Message::ObjectModificationTime(seconds) => {
                out.push(1);
                out.extend_from_slice(&[0; 3]);
                out.extend_from_slice(&seconds.to_le_bytes());
            }
            Message::BtreeKValues(m) => {
                out.push(0);
                out.extend_from_slice(&m.indexed_storage_k.to_le_bytes());
                out.extend_from_slice(&m.group_internal_k.to_le_bytes());
                out.extend_from_slice(&m.group_leaf_k.to_le_bytes());
            }
            Message::AttributeInfo(m) => {
                out.push(m.version);
                out.push(m.flags);
                if let Some(v) = m.max_creation_index {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                push_sized(out, m.fractal_heap_address, offset_size);
                push_sized(out, m.name_btree_address, offset_size);
                if let Some(v) = m.creation_order_btree_address {
                    push_sized(out, v, offset_size);
                }
            }
            Message::ObjectReferenceCount(count) => {
                out.push(0);
                out.extend_from_slice(&count.to_le_bytes());
            }
            Message::Unknown { data, .. } => {
                out.extend_from_slice(data);
            }
        }
    }

    /// On-disk size: envelope plus the 8-byte-padded body.
    pub fn disk_size(&self, offset_size: u8, length_size: u8) -> u64 {
        let mut body = Vec::new();
        self.serialize_body(&mut body, offset_size, length_size);
        8 + parse::pad8(body.len()) as u64
    }
}

fn name_length_width_flag(len: usize) -> u8 {
    if len < 1 << 8 {
        0
    } else if len < 1 << 16 {
        1
    } else {
        2
    }
}

/// Append a message with its version-1 envelope, padding the body to an
/// 8-byte boundary.
pub fn push_message(out: &mut Vec<u8>, message: &Message, offset_size: u8, length_size: u8) {
    push_message_with_flags(out, message, 0, offset_size, length_size);
}

pub fn push_message_with_flags(
    out: &mut Vec<u8>,
    message: &Message,
    flags: u8,
    offset_size: u8,
    length_size: u8,
) {
    let mut body = Vec::new();
    message.serialize_body(&mut body, offset_size, length_size);
    body.resize(pad8(body.len()), 0);
    out.extend_from_slice(&message.type_code().to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.push(flags);
    out.extend_from_slice(&[0; 3]);
    out.extend_from_slice(&body);
}

/// Parse one message body. Unknown types become `Message::Unknown`; the
/// caller applies the flag policy.
pub fn parse_body(
    message_type: u16,
    flags: u8,
    body: &[u8],
    offset_size: u8,
    length_size: u8,
) -> Result<Message> {
    let message = match message_type {
        MSG_NIL => Message::Nil,
        MSG_DATASPACE => Message::Dataspace(dataspace(body, length_size)?.1),
        MSG_LINK_INFO => Message::LinkInfo(link_info(body, offset_size)?.1),
        MSG_DATATYPE => Message::Datatype(datatype::datatype(body)?.1),
        MSG_FILL_VALUE_OLD => {
            let (rest, size) = le_u32::<nom::error::VerboseError<&[u8]>>(body)
                .map_err(Hdf5Error::from)?;
            let data = rest
                .get(..size as usize)
                .ok_or(Hdf5Error::TruncatedBuffer {
                    needed: size as usize,
                    available: rest.len(),
                })?
                .to_vec();
            Message::FillValueOld(FillValueOld { data })
        }
        MSG_FILL_VALUE => Message::FillValue(fill_value(body)?.1),
        MSG_LINK => Message::Link(link(body, offset_size)?.1),
        MSG_EXTERNAL_FILES => {
            Message::ExternalDataFiles(external_data_files(body, offset_size, length_size)?.1)
        }
        MSG_DATA_LAYOUT => Message::DataLayout(data_layout(body, offset_size, length_size)?.1),
        MSG_GROUP_INFO => Message::GroupInfo(group_info(body)?.1),
        MSG_FILTER_PIPELINE => Message::FilterPipeline(filter_pipeline(body)?.1),
        MSG_ATTRIBUTE => Message::Attribute(attribute(body, length_size)?.1),
        MSG_CONTINUATION => {
            let (rest, offset) = address(offset_size)(body)?;
            let (_, length) = address(length_size)(rest)?;
            Message::ObjectHeaderContinuation(Continuation { offset, length })
        }
        MSG_SYMBOL_TABLE => {
            let (rest, btree_address) = address(offset_size)(body)?;
            let (_, heap_address) = address(offset_size)(rest)?;
            Message::SymbolTable(SymbolTableMessage {
                btree_address,
                heap_address,
            })
        }
        MSG_MODIFICATION_TIME => {
            let (rest, _version) = le_u8::<nom::error::VerboseError<&[u8]>>(body)
                .map_err(Hdf5Error::from)?;
            let (rest, _) = take::<_, _, nom::error::VerboseError<&[u8]>>(3usize)(rest)
                .map_err(Hdf5Error::from)?;
            let (_, seconds) =
                le_u32::<nom::error::VerboseError<&[u8]>>(rest).map_err(Hdf5Error::from)?;
            Message::ObjectModificationTime(seconds)
        }
        MSG_BTREE_K_VALUES => {
            let (rest, _version) = le_u8::<nom::error::VerboseError<&[u8]>>(body)
                .map_err(Hdf5Error::from)?;
            let (rest, indexed_storage_k) =
                le_u16::<nom::error::VerboseError<&[u8]>>(rest).map_err(Hdf5Error::from)?;
            let (rest, group_internal_k) =
                le_u16::<nom::error::VerboseError<&[u8]>>(rest).map_err(Hdf5Error::from)?;
            let (_, group_leaf_k) =
                le_u16::<nom::error::VerboseError<&[u8]>>(rest).map_err(Hdf5Error::from)?;
            Message::BtreeKValues(BtreeKValues {
                indexed_storage_k,
                group_internal_k,
                group_leaf_k,
            })
        }
        MSG_ATTRIBUTE_INFO => Message::AttributeInfo(attribute_info(body, offset_size)?.1),
        MSG_REFERENCE_COUNT => {
            let (rest, _version) = le_u8::<nom::error::VerboseError<&[u8]>>(body)
                .map_err(Hdf5Error::from)?;
            let (_, count) =
                le_u32::<nom::error::VerboseError<&[u8]>>(rest).map_err(Hdf5Error::from)?;
            Message::ObjectReferenceCount(count)
        }
        _ => Message::Unknown {
            message_type,
            flags,
            data: body.to_vec(),
        },
    };
    Ok(message)
}

/// How the reader treats messages it does not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePolicy {
    /// Any unknown message is an error.
    Strict,
    /// Unknown messages are kept as opaque bytes and reported as warnings,
    /// unless flag bit 7 demands failure.
    Lenient,
}

/// Read a complete object header at `address`, following continuation
/// blocks, and return its messages in stream order (continuations elided).
pub fn read_object_header(
    file: &[u8],
    address: u64,
    offset_size: u8,
    length_size: u8,
    policy: MessagePolicy,
    warnings: &mut Vec<String>,
) -> Result<Vec<Message>> {
    if address as usize >= file.len() {
        return Err(Hdf5Error::TruncatedBuffer {
            needed: address as usize,
            available: file.len(),
        });
    }
    let lead = file[address as usize];
    if lead != 1 && lead != b'O' {
        return Err(Hdf5Error::UnsupportedVersion {
            structure: "object header",
            version: lead,
        });
    }
    let (_, prefix) = parse::object_header_prefix(&file[address as usize..])?;
    match prefix {
        parse::ObjectHeaderPrefix::V1 {
            total_messages,
            header_size,
            ..
        } => read_v1_messages(
            file,
            address + 16,
            u64::from(header_size),
            total_messages,
            offset_size,
            length_size,
            policy,
            warnings,
        ),
        parse::ObjectHeaderPrefix::V2 {
            flags,
            times,
            attribute_phase,
            chunk0_size,
            tracks_creation_order,
        } => {
            let mut prefix_len = 4 + 1 + 1;
            if times.is_some() {
                prefix_len += 16;
            }
            if attribute_phase.is_some() {
                prefix_len += 4;
            }
            prefix_len += 1usize << (flags & 0x03);
            read_v2_messages(
                file,
                address + prefix_len as u64,
                chunk0_size,
                tracks_creation_order,
                offset_size,
                length_size,
                policy,
                warnings,
            )
        }
    }
}

fn apply_unknown_policy(
    message: Message,
    policy: MessagePolicy,
    warnings: &mut Vec<String>,
) -> Result<Option<Message>> {
    if let Message::Unknown {
        message_type,
        flags,
        ref data,
    } = message
    {
        if flags & FLAG_FAIL_ALWAYS_IF_UNKNOWN != 0 {
            return Err(Hdf5Error::UnknownMessage { message_type });
        }
        match policy {
            MessagePolicy::Strict => return Err(Hdf5Error::UnknownMessage { message_type }),
            MessagePolicy::Lenient => {
                log::warn!(
                    "keeping unknown message type {:#04x} ({} bytes) as opaque",
                    message_type,
                    data.len()
                );
                warnings.push(format!(
                    "unknown message type {:#04x} kept as {} opaque bytes",
                    message_type,
                    data.len()
                ));
            }
        }
    }
    Ok(Some(message))
}

#[allow(clippy::too_many_arguments)]
fn read_v1_messages(
    file: &[u8],
    block_start: u64,
    block_size: u64,
    total_messages: u16,
    offset_size: u8,
    length_size: u8,
    policy: MessagePolicy,
    warnings: &mut Vec<String>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    let mut blocks = vec![(block_start, block_size)];
    let mut visited: HashSet<u64> = blocks.iter().map(|&(start, _)| start).collect();
    let mut block_index = 0;
    let mut cursor = block_start;
    let mut block_end = block_start + block_size;

    for _ in 0..total_messages {
        // Move to the next continuation block when this one is exhausted.
        while cursor + 8 > block_end {
            block_index += 1;
            if block_index >= blocks.len() {
                return Err(Hdf5Error::CorruptStructure(
                    "object header ends before its declared message count".to_string(),
                ));
            }
            cursor = blocks[block_index].0;
            block_end = blocks[block_index].0 + blocks[block_index].1;
        }
        if block_end as usize > file.len() {
            return Err(Hdf5Error::TruncatedBuffer {
                needed: block_end as usize,
                available: file.len(),
            });
        }
        let envelope = &file[cursor as usize..];
        let message_type = u16::from_le_bytes([envelope[0], envelope[1]]);
        let size = u16::from_le_bytes([envelope[2], envelope[3]]);
        let flags = envelope[4];
        let body_start = cursor + 8;
        if body_start + u64::from(size) > block_end {
            return Err(Hdf5Error::TruncatedBuffer {
                needed: size as usize,
                available: (block_end - body_start) as usize,
            });
        }
        let body = &file[body_start as usize..(body_start + u64::from(size)) as usize];
        let message = parse_body(message_type, flags, body, offset_size, length_size)?;
        cursor = body_start + u64::from(size);

        if let Message::ObjectHeaderContinuation(continuation) = &message {
            if !visited.insert(continuation.offset) {
                return Err(Hdf5Error::CorruptStructure(format!(
                    "object header continuation cycle at {:#x}",
                    continuation.offset
                )));
            }
            blocks.push((continuation.offset, continuation.length));
            continue;
        }
        if let Some(message) = apply_unknown_policy(message, policy, warnings)? {
            messages.push(message);
        }
    }
    Ok(messages)
}

#[allow(clippy::too_many_arguments)]
fn read_v2_messages(
    file: &[u8],
    block_start: u64,
    block_size: u64,
    tracks_creation_order: bool,
    offset_size: u8,
    length_size: u8,
    policy: MessagePolicy,
    warnings: &mut Vec<String>,
) -> Result<Vec<Message>> {
    let envelope_size: u64 = if tracks_creation_order { 6 } else { 4 };
    let mut messages = Vec::new();
    let mut blocks = vec![(block_start, block_size)];
    let mut visited: HashSet<u64> = blocks.iter().map(|&(start, _)| start).collect();
    let mut block_index = 0;

    while block_index < blocks.len() {
        let (start, size) = blocks[block_index];
        block_index += 1;
        let mut cursor = start;
        let block_end = start + size;
        if block_end as usize > file.len() {
            return Err(Hdf5Error::TruncatedBuffer {
                needed: block_end as usize,
                available: file.len(),
            });
        }
        while cursor + envelope_size <= block_end {
            let envelope = &file[cursor as usize..];
            let message_type = u16::from(envelope[0]);
            let size = u16::from_le_bytes([envelope[1], envelope[2]]);
            let flags = envelope[3];
            if message_type == 0 && size == 0 {
                // Gap padding at the end of the block.
                break;
            }
            let body_start = cursor + envelope_size;
            if body_start + u64::from(size) > block_end {
                return Err(Hdf5Error::TruncatedBuffer {
                    needed: size as usize,
                    available: (block_end - body_start) as usize,
                });
            }
            let body = &file[body_start as usize..(body_start + u64::from(size)) as usize];
            let message = parse_body(message_type, flags, body, offset_size, length_size)?;
            cursor = body_start + u64::from(size);

            if let Message::ObjectHeaderContinuation(continuation) = &message {
                if !visited.insert(continuation.offset) {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "object header continuation cycle at {:#x}",
                        continuation.offset
                    )));
                }
                if continuation.length < 8 {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "continuation block of {} bytes cannot hold its framing",
                        continuation.length
                    )));
                }
                // Continuation blocks carry an OCHK signature and a
                // trailing checksum.
                blocks.push((continuation.offset + 4, continuation.length - 8));
                continue;
            }
            if let Some(message) = apply_unknown_policy(message, policy, warnings)? {
                messages.push(message);
            }
        }
    }
    Ok(messages)
}

pub(crate) fn push_sized(out: &mut Vec<u8>, value: u64, width: u8) {
    for i in 0..width {
        out.push((value >> (8 * u32::from(i))) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &Message) -> Message {
        let mut out = Vec::new();
        push_message(&mut out, message, 8, 8);
        let message_type = u16::from_le_bytes([out[0], out[1]]);
        let size = u16::from_le_bytes([out[2], out[3]]) as usize;
        let flags = out[4];
        parse_body(message_type, flags, &out[8..8 + size], 8, 8).unwrap()
    }

    #[test]
    fn dataspace_message_round_trips() {
        let message = Message::Dataspace(Dataspace::new(vec![3, 5]));
        assert_eq!(round_trip(&message), message);
        let message = Message::Dataspace(Dataspace {
            version: 1,
            dims: vec![4],
            max_dims: Some(vec![16]),
        });
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn layout_messages_round_trip() {
        let message = Message::DataLayout(DataLayout::Contiguous {
            address: 2048,
            size: 24,
        });
        assert_eq!(round_trip(&message), message);
        let message = Message::DataLayout(DataLayout::Chunked {
            btree_address: 4096,
            dims: vec![2, 4],
            element_size: 8,
        });
        assert_eq!(round_trip(&message), message);
        let message = Message::DataLayout(DataLayout::Compact {
            data: vec![1, 2, 3, 4],
        });
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn symbol_table_and_continuation_round_trip() {
        let message = Message::SymbolTable(SymbolTableMessage {
            btree_address: 136,
            heap_address: 680,
        });
        assert_eq!(round_trip(&message), message);
        let message = Message::ObjectHeaderContinuation(Continuation {
            offset: 1024,
            length: 120,
        });
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn attribute_message_round_trips() {
        let datatype = Datatype::fixed(4, true);
        let data = datatype
            .encode_element(&crate::datatype::DynamicValue::Int(12345), None)
            .unwrap();
        let message = Message::Attribute(Attribute {
            version: 1,
            name: "i32_attribute".to_string(),
            datatype,
            dataspace: Dataspace::new(vec![1]),
            data,
        });
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn fill_value_round_trips() {
        let message = Message::FillValue(FillValue::undefined());
        assert_eq!(round_trip(&message), message);
        let message = Message::FillValue(FillValue {
            version: 2,
            space_allocation_time: 2,
            fill_value_write_time: 2,
            defined: true,
            data: Some(vec![0, 0, 0x80, 0x3f]),
        });
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn filter_pipeline_round_trips() {
        let message = Message::FilterPipeline(FilterPipeline {
            version: 1,
            filters: vec![
                Filter {
                    id: 2,
                    name: "shuffle".to_string(),
                    flags: 0,
                    client_data: vec![8],
                },
                Filter {
                    id: 1,
                    name: "deflate".to_string(),
                    flags: 0,
                    client_data: vec![6],
                },
            ],
        });
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn unknown_messages_survive_as_opaque() {
        let message = Message::Unknown {
            message_type: 0xFE,
            flags: 0,
            data: vec![9; 8],
        };
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn modification_time_round_trips() {
        let message = Message::ObjectModificationTime(1_700_000_000);
        assert_eq!(round_trip(&message), message);
    }
}
