//! A pure-Rust HDF5 library: read and write version-0/1 superblock files
//! with full datatype fidelity.
//!
//! This library does not intend to support all features of HDF5 either in
//! the library or the specification; it covers the v1 metadata family
//! (plus v2 object-header reading) that the vast majority of files in the
//! wild actually use.
//!
//! Reading memory-maps the file and materializes a navigable tree:
//!
//! ```no_run
//! let file = hdf5file::open("demand.h5").unwrap();
//! let values: Vec<f64> = file.read_dataset("/Demand").unwrap();
//! ```
//!
//! Writing is declarative; `close()` commits a consistent image:
//!
//! ```no_run
//! use hdf5file::{Datatype, Dataspace, FileBuilder, LayoutSpec};
//! let mut builder = FileBuilder::create("demand.h5").unwrap();
//! let root = builder.root();
//! let ds = builder
//!     .create_dataset(root, "Demand", Datatype::float64(),
//!                     Dataspace::new(vec![3]), LayoutSpec::Contiguous)
//!     .unwrap();
//! builder.write_elements(ds, &[1.5f64, 2.25, 3.125]).unwrap();
//! builder.close().unwrap();
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

mod alloc;
mod btree;
mod datatype;
mod error;
mod fixed;
mod header;
mod heap;
mod parse;
mod read;
mod write;

pub use crate::alloc::WriteOptions;
pub use crate::datatype::{
    ArrayInfo, BitFieldInfo, ByteOrder, CharacterSet, CompoundInfo, CompoundMember, Converter,
    Datatype, DatatypeClass, DynamicValue, EnumInfo, FixedInfo, FloatInfo, Hdf5Type, OpaqueInfo,
    ReferenceInfo, ReferenceKind, Registry, StringInfo, TimeInfo, VlenInfo,
};
pub use crate::error::{Hdf5Error, Result};
pub use crate::fixed::{
    is_undefined, undefined_address, FixedInteger, FixedPoint, UNDEFINED_ADDRESS,
};
pub use crate::header::{DataLayout, Dataspace, Filter, FilterPipeline, MessagePolicy};
pub use crate::heap::{GlobalHeapAccess, GlobalHeapSink};
pub use crate::read::{DynamicIter, ElementIter};
pub use crate::write::{DatasetId, FileBuilder, GroupId, LayoutSpec, ObjectId};

/// Convenience function for [`Hdf5File::open`].
pub fn open<P: AsRef<Path>>(path: P) -> Result<Hdf5File> {
    Hdf5File::open(path)
}

/// Options for the read path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Downgrade unknown messages and per-object corruption into
    /// warnings attached to the tree instead of failing the open.
    pub lenient: bool,
}

/// An opened HDF5 file.
///
/// The file is memory-mapped; datasets with a native little-endian layout
/// can be viewed zero-copy via [`Hdf5File::view`].
pub struct Hdf5File {
    map: memmap::Mmap,
    superblock: parse::Hdf5Superblock,
    root_group: Group,
    registry: Registry,
    global_heap: heap::GlobalHeapCache,
    /// Every dataset's path, keyed by object-header address; this is how
    /// object references resolve back to datasets.
    dataset_index: BTreeMap<u64, String>,
    warnings: Vec<String>,
}

impl std::fmt::Debug for Hdf5File {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hdf5File")
            .field("attributes", &self.root_group.attributes.keys())
            .field("datasets", &self.root_group.datasets)
            .field("groups", &self.root_group.groups)
            .finish()
    }
}

/// One group in the hierarchy, with its children fully materialized.
#[derive(Debug)]
pub struct Group {
    pub(crate) header_address: u64,
    pub(crate) btree_address: u64,
    pub(crate) heap_address: u64,
    pub(crate) attributes: BTreeMap<String, header::Attribute>,
    pub(crate) datasets: BTreeMap<String, Dataset>,
    pub(crate) groups: BTreeMap<String, Group>,
    pub(crate) unknown_messages: Vec<(u16, Vec<u8>)>,
}

impl Group {
    pub fn header_address(&self) -> u64 {
        self.header_address
    }

    pub fn btree_address(&self) -> u64 {
        self.btree_address
    }

    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &Group)> {
        self.groups.iter().map(|(name, group)| (name.as_str(), group))
    }

    pub fn datasets(&self) -> impl Iterator<Item = (&str, &Dataset)> {
        self.datasets
            .iter()
            .map(|(name, dataset)| (name.as_str(), dataset))
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|name| name.as_str())
    }

    /// Messages the reader kept as opaque bytes in lenient mode.
    pub fn unknown_messages(&self) -> &[(u16, Vec<u8>)] {
        &self.unknown_messages
    }

    fn find_dataset(&self, dataset_path: &str) -> Option<&Dataset> {
        let mut parts = dataset_path.split('/').filter(|p| !p.is_empty());
        let mut current = self;
        let mut last = parts.next()?;
        for part in parts {
            current = current.groups.get(last)?;
            last = part;
        }
        current.datasets.get(last)
    }

    fn find_group(&self, group_path: &str) -> Option<&Group> {
        let mut current = self;
        for part in group_path.split('/').filter(|p| !p.is_empty()) {
            current = current.groups.get(part)?;
        }
        Some(current)
    }
}

/// One dataset's metadata; element data is pulled through the owning
/// [`Hdf5File`].
pub struct Dataset {
    pub(crate) header_address: u64,
    pub(crate) dataspace: Dataspace,
    pub(crate) datatype: Datatype,
    pub(crate) layout: DataLayout,
    pub(crate) fill_value: Option<Vec<u8>>,
    pub(crate) filters: Option<FilterPipeline>,
    pub(crate) attributes: BTreeMap<String, header::Attribute>,
    pub(crate) unknown_messages: Vec<(u16, Vec<u8>)>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("dimensions", &self.dataspace.dims)
            .field("datatype_class", &self.datatype.class_code())
            .field("layout_class", &self.layout.class())
            .finish()
    }
}

impl Dataset {
    pub fn header_address(&self) -> u64 {
        self.header_address
    }

    pub fn dimensions(&self) -> &[u64] {
        &self.dataspace.dims
    }

    pub fn element_count(&self) -> u64 {
        self.dataspace.element_count()
    }

    pub fn datatype(&self) -> &Datatype {
        &self.datatype
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Layout class code: 0 compact, 1 contiguous, 2 chunked, 3 virtual.
    pub fn layout_class(&self) -> u8 {
        self.layout.class()
    }

    pub fn data_address(&self) -> Option<u64> {
        match &self.layout {
            DataLayout::Contiguous { address, .. } => Some(*address),
            DataLayout::Chunked { btree_address, .. } => Some(*btree_address),
            _ => None,
        }
    }

    pub fn data_size(&self) -> Option<u64> {
        match &self.layout {
            DataLayout::Contiguous { size, .. } => Some(*size),
            DataLayout::Compact { data } => Some(data.len() as u64),
            _ => None,
        }
    }

    pub fn chunk_dimensions(&self) -> Option<Vec<u64>> {
        match &self.layout {
            DataLayout::Chunked { dims, .. } => {
                Some(dims.iter().map(|&d| u64::from(d)).collect())
            }
            _ => None,
        }
    }

    pub fn fill_value(&self) -> Option<&[u8]> {
        self.fill_value.as_deref()
    }

    pub fn filters(&self) -> Option<&FilterPipeline> {
        self.filters.as_ref()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|name| name.as_str())
    }

    pub fn unknown_messages(&self) -> &[(u16, Vec<u8>)] {
        &self.unknown_messages
    }
}

impl Hdf5File {
    /// Open an HDF5 file in strict mode.
    ///
    /// This function memory-maps the file and initializes a number of
    /// internal data structures to make access to data trivial.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Hdf5File::open_with(path, ReadOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: ReadOptions) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { memmap::Mmap::map(&file)? };
        let contents: &[u8] = &map;

        let (_, superblock) = parse::superblock(contents)?;
        if superblock.superblock_version > 1 {
            return Err(Hdf5Error::UnsupportedVersion {
                structure: "superblock",
                version: superblock.superblock_version,
            });
        }
        // A cancelled write may leave trailing unreferenced bytes, so the
        // end-of-file address may be less than the real length, never more.
        if superblock.end_of_file_address > contents.len() as u64 {
            return Err(Hdf5Error::CorruptStructure(format!(
                "end-of-file address {} beyond the {}-byte file",
                superblock.end_of_file_address,
                contents.len()
            )));
        }

        let policy = if options.lenient {
            MessagePolicy::Lenient
        } else {
            MessagePolicy::Strict
        };
        let mut warnings = Vec::new();
        let mut visited = HashSet::new();
        let root_address = superblock.root_group_symbol_table_entry.object_header_address;
        visited.insert(root_address);

        let root_group = {
            let mut ctx = read::TreeContext {
                file: contents,
                offset_size: superblock.offset_size,
                length_size: superblock.length_size,
                policy,
                warnings: &mut warnings,
                visited: &mut visited,
            };
            match read::parse_object(&mut ctx, root_address)? {
                read::ParsedObject::Group(group) => group,
                _ => {
                    return Err(Hdf5Error::CorruptStructure(
                        "root object is not a group".to_string(),
                    ))
                }
            }
        };

        let mut dataset_index = BTreeMap::new();
        index_datasets(&root_group, "", &mut dataset_index);

        let length_size = superblock.length_size;
        Ok(Hdf5File {
            map,
            superblock,
            root_group,
            registry: Registry::new(),
            global_heap: heap::GlobalHeapCache::new(length_size),
            dataset_index,
            warnings,
        })
    }

    pub fn root(&self) -> &Group {
        &self.root_group
    }

    /// Warnings collected during a lenient open.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn end_of_file_address(&self) -> u64 {
        self.superblock.end_of_file_address
    }

    pub fn offset_size(&self) -> u8 {
        self.superblock.offset_size
    }

    pub fn length_size(&self) -> u8 {
        self.superblock.length_size
    }

    pub fn group_leaf_node_k(&self) -> u16 {
        self.superblock.group_leaf_node_k
    }

    /// The converter registry used by the dynamic decode path.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn group(&self, path: &str) -> Option<&Group> {
        self.root_group.find_group(path)
    }

    pub fn dataset(&self, path: &str) -> Option<&Dataset> {
        self.root_group.find_dataset(path)
    }

    /// Resolve a dataset by its object-header address, as stored in an
    /// object reference.
    pub fn dataset_at_address(&self, address: u64) -> Option<&Dataset> {
        let path = self.dataset_index.get(&address)?;
        self.dataset(path)
    }

    /// The path of the dataset whose object header sits at `address`.
    pub fn dataset_path_at_address(&self, address: u64) -> Option<&str> {
        self.dataset_index.get(&address).map(String::as_str)
    }

    fn dataset_or_err(&self, path: &str) -> Result<&Dataset> {
        self.dataset(path).ok_or_else(|| {
            Hdf5Error::OrphanedEntry(format!("no dataset at path {:?}", path))
        })
    }

    /// Look up the provided path to a dataset and, if its stored layout
    /// matches `T` exactly, return a slice of the underlying file mapping.
    ///
    /// Note that this discards any dimension information associated with
    /// the dataset. Only contiguous little-endian layouts qualify; use
    /// [`Hdf5File::read_dataset`] otherwise.
    pub fn view<T: Hdf5Type>(&self, dataset_path: &str) -> Result<&[T]> {
        let dataset = self.dataset_or_err(dataset_path)?;
        if !dataset.datatype.admits::<T>() {
            return Err(Hdf5Error::TypeMismatch {
                expected: "a dataset stored in the requested native layout",
                found: format!("datatype class {}", dataset.datatype.class_code()),
            });
        }
        let (address, size) = match &dataset.layout {
            DataLayout::Contiguous { address, size } => (*address, *size),
            _ => {
                return Err(Hdf5Error::TypeMismatch {
                    expected: "a contiguous layout",
                    found: format!("layout class {}", dataset.layout.class()),
                })
            }
        };
        if is_undefined(address, self.superblock.offset_size) {
            return Ok(&[]);
        }
        let contents: &[u8] = &self.map;
        let start = address as usize;
        let end = start + size as usize;
        if end > contents.len() {
            return Err(Hdf5Error::CorruptStructure(format!(
                "contiguous data [{:#x}, {:#x}) beyond end of file",
                start, end
            )));
        }
        let bytes = &contents[start..end];
        let element = std::mem::size_of::<T>();
        if bytes.as_ptr() as usize % std::mem::align_of::<T>() != 0 || size as usize % element != 0
        {
            return Err(Hdf5Error::InvalidEncoding(
                "data region not aligned for a zero-copy view".to_string(),
            ));
        }
        // Alignment and size were just checked; the mapping outlives self.
        unsafe {
            Ok(std::slice::from_raw_parts(
                bytes.as_ptr() as *const T,
                size as usize / element,
            ))
        }
    }

    /// A lazy, finite iterator over the dataset's elements as `T`, in
    /// row-major dataspace order.
    pub fn iter_dataset<T: Hdf5Type>(&self, dataset_path: &str) -> Result<ElementIter<T>> {
        let dataset = self.dataset_or_err(dataset_path)?;
        if !dataset.datatype.admits::<T>() {
            return Err(Hdf5Error::TypeMismatch {
                expected: "a dataset datatype matching the element type",
                found: format!("datatype class {}", dataset.datatype.class_code()),
            });
        }
        let source = read::ElementSource::open(
            &self.map,
            self.superblock.offset_size,
            self.superblock.length_size,
            dataset,
        )?;
        Ok(ElementIter::new(
            source,
            dataset.datatype.size_in_bytes() as usize,
            dataset.element_count(),
        ))
    }

    pub fn read_dataset<T: Hdf5Type>(&self, dataset_path: &str) -> Result<Vec<T>> {
        self.iter_dataset(dataset_path)?.collect()
    }

    /// Iterate elements as [`DynamicValue`]s through the converter
    /// registry; variable-length data resolves through the global heap.
    pub fn iter_dynamic(&self, dataset_path: &str) -> Result<DynamicIter> {
        let dataset = self.dataset_or_err(dataset_path)?;
        let source = read::ElementSource::open(
            &self.map,
            self.superblock.offset_size,
            self.superblock.length_size,
            dataset,
        )?;
        Ok(DynamicIter::new(
            source,
            &self.registry,
            dataset.datatype.clone(),
            heap::FileHeapAccess {
                file: &self.map,
                cache: &self.global_heap,
            },
            dataset.element_count(),
        ))
    }

    pub fn read_dynamic(&self, dataset_path: &str) -> Result<Vec<DynamicValue>> {
        self.iter_dynamic(dataset_path)?.collect()
    }

    /// Read a root-group attribute as `T`.
    pub fn attr<T: Hdf5Type>(&self, name: &str) -> Result<T> {
        self.attr_of(&self.root_group, name)
    }

    /// Read a named attribute of any group as `T`.
    pub fn attr_of<T: Hdf5Type>(&self, group: &Group, name: &str) -> Result<T> {
        let attribute = group.attributes.get(name).ok_or_else(|| {
            Hdf5Error::OrphanedEntry(format!("no attribute named {:?}", name))
        })?;
        decode_attribute(attribute)
    }

    /// Read a named attribute of a dataset as `T`.
    pub fn dataset_attr<T: Hdf5Type>(&self, dataset: &Dataset, name: &str) -> Result<T> {
        let attribute = dataset.attributes.get(name).ok_or_else(|| {
            Hdf5Error::OrphanedEntry(format!("no attribute named {:?}", name))
        })?;
        decode_attribute(attribute)
    }

    /// Decode a group attribute dynamically through the registry.
    pub fn attr_dynamic(&self, group: &Group, name: &str) -> Result<DynamicValue> {
        let attribute = group.attributes.get(name).ok_or_else(|| {
            Hdf5Error::OrphanedEntry(format!("no attribute named {:?}", name))
        })?;
        let heap = heap::FileHeapAccess {
            file: &self.map,
            cache: &self.global_heap,
        };
        self.registry
            .decode(&attribute.datatype, &attribute.data, Some(&heap))
    }

    /// Fetch the raw source-mapping records of a virtual dataset from the
    /// global heap. The records are returned unparsed.
    pub fn virtual_mapping(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        match &dataset.layout {
            DataLayout::Virtual { address, index } => {
                self.global_heap
                    .get(&self.map, *address, *index as u16)
            }
            _ => Err(Hdf5Error::TypeMismatch {
                expected: "a virtual layout",
                found: format!("layout class {}", dataset.layout.class()),
            }),
        }
    }
}

fn index_datasets(group: &Group, prefix: &str, into: &mut BTreeMap<u64, String>) {
    for (name, dataset) in &group.datasets {
        into.insert(dataset.header_address, format!("{}/{}", prefix, name));
    }
    for (name, child) in &group.groups {
        index_datasets(child, &format!("{}/{}", prefix, name), into);
    }
}

fn decode_attribute<T: Hdf5Type>(attribute: &header::Attribute) -> Result<T> {
    if !attribute.datatype.admits::<T>() {
        return Err(Hdf5Error::TypeMismatch {
            expected: "an attribute stored in the requested native layout",
            found: format!("datatype class {}", attribute.datatype.class_code()),
        });
    }
    let size = attribute.datatype.size_in_bytes() as usize;
    if attribute.data.len() < size {
        return Err(Hdf5Error::TruncatedBuffer {
            needed: size,
            available: attribute.data.len(),
        });
    }
    Ok(T::from_le_bytes(&attribute.data[..size]))
}
