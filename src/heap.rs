//! Local heaps (link-name storage) and global heaps (variable-length
//! payload storage), read and write sides.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::alloc::Allocator;
use crate::error::{Hdf5Error, Result};
use crate::parse;

/// Default size of a freshly allocated global-heap collection.
pub const GLOBAL_HEAP_PAGE: u64 = 4096;

/// Initial size of a local heap's data segment.
pub const INITIAL_HEAP_SEGMENT: u64 = 88;

// ---------------------------------------------------------------------------
// Read side

/// Resolve a link-name offset inside a group's local heap.
///
/// Every offset held by a B-tree key or symbol-table entry must land on a
/// NUL-terminated string strictly inside the heap's data segment.
pub fn read_name(file: &[u8], heap: &parse::LocalHeap, offset: u64) -> Result<String> {
    if offset >= heap.data_segment_size {
        return Err(Hdf5Error::OrphanedEntry(format!(
            "link name offset {} outside a {}-byte heap segment",
            offset, heap.data_segment_size
        )));
    }
    let start = heap.address_of_data_segment + offset;
    let end = heap.address_of_data_segment + heap.data_segment_size;
    if end > file.len() as u64 {
        return Err(Hdf5Error::TruncatedBuffer {
            needed: end as usize,
            available: file.len(),
        });
    }
    let segment = &file[start as usize..end as usize];
    let len = segment
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| {
            Hdf5Error::CorruptStructure(format!(
                "link name at heap offset {} is not NUL-terminated",
                offset
            ))
        })?;
    Ok(String::from_utf8_lossy(&segment[..len]).into_owned())
}

/// Read access to global-heap objects, as needed by the datatype decoders.
pub trait GlobalHeapAccess {
    fn object(&self, address: u64, index: u32) -> Result<Vec<u8>>;
}

/// Write access to the global heap, as needed by the datatype encoders.
pub trait GlobalHeapSink {
    fn put_object(&mut self, data: &[u8]) -> Result<(u64, u32)>;
}

/// Collections parsed so far, keyed by file address. Owned by the file
/// object; interior mutability because reads are `&self`.
pub struct GlobalHeapCache {
    length_size: u8,
    collections: RefCell<HashMap<u64, HashMap<u16, Vec<u8>>>>,
}

impl GlobalHeapCache {
    pub fn new(length_size: u8) -> GlobalHeapCache {
        GlobalHeapCache {
            length_size,
            collections: RefCell::new(HashMap::new()),
        }
    }

    pub fn get(&self, file: &[u8], address: u64, index: u16) -> Result<Vec<u8>> {
        let mut collections = self.collections.borrow_mut();
        if !collections.contains_key(&address) {
            if address >= file.len() as u64 {
                return Err(Hdf5Error::UnreachableHeap { address, index });
            }
            let (_, collection) =
                parse::global_heap_collection(&file[address as usize..], self.length_size)?;
            let objects = collection
                .objects
                .into_iter()
                .map(|o| (o.index, o.data))
                .collect();
            collections.insert(address, objects);
        }
        collections[&address]
            .get(&index)
            .cloned()
            .ok_or(Hdf5Error::UnreachableHeap { address, index })
    }
}

/// Borrow of the file image plus its collection cache; the decoder-facing
/// view of the global heap.
#[derive(Clone)]
pub struct FileHeapAccess<'a> {
    pub file: &'a [u8],
    pub cache: &'a GlobalHeapCache,
}

impl<'a> GlobalHeapAccess for FileHeapAccess<'a> {
    fn object(&self, address: u64, index: u32) -> Result<Vec<u8>> {
        if index > u32::from(u16::MAX) {
            return Err(Hdf5Error::OutOfRange(format!(
                "global heap object index {}",
                index
            )));
        }
        self.cache.get(self.file, address, index as u16)
    }
}

// ---------------------------------------------------------------------------
// Write side

/// Append-only builder for one group's local heap.
///
/// Names never move relative to the segment start, but the segment itself
/// relocates (to a doubled region at end-of-file) when it fills.
pub struct LocalHeapBuilder {
    pub header_address: u64,
    pub data_address: u64,
    capacity: u64,
    cursor: u64,
    bytes: Vec<u8>,
    pub relocations: u32,
}

impl LocalHeapBuilder {
    /// A heap whose header and initial segment were already reserved,
    /// as for the root group.
    pub fn with_addresses(header_address: u64, data_address: u64, capacity: u64) -> LocalHeapBuilder {
        // Offset 0 holds the empty string used by leftmost B-tree keys.
        let mut bytes = vec![0u8; 8];
        bytes.reserve(capacity as usize);
        LocalHeapBuilder {
            header_address,
            data_address,
            capacity,
            cursor: 8,
            bytes,
            relocations: 0,
        }
    }

    /// Allocate header and initial segment for a new group.
    pub fn new(alloc: &mut Allocator) -> Result<LocalHeapBuilder> {
        let header_address = alloc.allocate(crate::alloc::LOCAL_HEAP_HEADER_SIZE)?;
        let data_address = alloc.allocate(INITIAL_HEAP_SEGMENT)?;
        Ok(LocalHeapBuilder::with_addresses(
            header_address,
            data_address,
            INITIAL_HEAP_SEGMENT,
        ))
    }

    /// Append `name` NUL-terminated at the free cursor and return its
    /// offset. The cursor advances by the 8-byte-aligned length.
    pub fn reserve(&mut self, name: &str, alloc: &mut Allocator) -> Result<u64> {
        let needed = parse::pad8(name.len() + 1) as u64;
        if self.cursor + needed > self.capacity {
            let mut new_capacity = self.capacity * 2;
            while self.cursor + needed > new_capacity {
                new_capacity *= 2;
            }
            let new_address = alloc.expand_local_heap(new_capacity)?;
            log::debug!(
                "local heap segment relocated {:#x} -> {:#x} ({} -> {} bytes)",
                self.data_address,
                new_address,
                self.capacity,
                new_capacity
            );
            self.data_address = new_address;
            self.capacity = new_capacity;
            self.relocations += 1;
        }
        let offset = self.cursor;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.bytes.resize((offset + needed) as usize, 0);
        self.cursor += needed;
        Ok(offset)
    }

    pub fn free_cursor(&self) -> u64 {
        self.cursor
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The data segment, padded to its full capacity.
    pub fn segment_bytes(&self) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        bytes.resize(self.capacity as usize, 0);
        bytes
    }
}

struct CollectionBuilder {
    address: u64,
    size: u64,
    used: u64,
    objects: Vec<(u16, Vec<u8>)>,
}

/// Builder for the file's global-heap collections.
pub struct GlobalHeapWriter {
    length_size: u8,
    collections: Vec<CollectionBuilder>,
}

impl GlobalHeapWriter {
    pub fn new(length_size: u8) -> GlobalHeapWriter {
        GlobalHeapWriter {
            length_size,
            collections: Vec::new(),
        }
    }

    fn header_size(&self) -> u64 {
        8 + u64::from(self.length_size)
    }

    fn object_header_size(&self) -> u64 {
        8 + u64::from(self.length_size)
    }

    /// Store a payload, appending to the current collection or allocating
    /// a new page-sized one when full.
    pub fn put(&mut self, alloc: &mut Allocator, data: &[u8]) -> Result<(u64, u16)> {
        let need = self.object_header_size() + parse::pad8_u64(data.len() as u64);
        let fits = self.collections.last().map(|c| {
            let free_marker = self.object_header_size();
            c.used + need + free_marker <= c.size || c.used + need == c.size
        });
        if fits != Some(true) {
            let size = GLOBAL_HEAP_PAGE.max(self.header_size() + need + self.object_header_size());
            let address = alloc.allocate_global_heap_collection(size)?;
            self.collections.push(CollectionBuilder {
                address,
                size,
                used: self.header_size(),
                objects: Vec::new(),
            });
        }
        let collection = self.collections.last_mut().expect("just ensured");
        let index = collection.objects.len() as u16 + 1;
        collection.objects.push((index, data.to_vec()));
        collection.used += need;
        Ok((collection.address, index))
    }

    /// Serialize every collection as `(address, bytes)` pairs for the
    /// positioned-write pass.
    pub fn serialized(&self) -> Vec<(u64, Vec<u8>)> {
        self.collections
            .iter()
            .map(|collection| {
                let mut out = Vec::with_capacity(collection.size as usize);
                out.extend_from_slice(b"GCOL");
                out.push(1);
                out.extend_from_slice(&[0, 0, 0]);
                push_sized(&mut out, collection.size, self.length_size);
                for (index, data) in &collection.objects {
                    out.extend_from_slice(&index.to_le_bytes());
                    out.extend_from_slice(&1u16.to_le_bytes());
                    out.extend_from_slice(&[0; 4]);
                    push_sized(&mut out, data.len() as u64, self.length_size);
                    out.extend_from_slice(data);
                    out.resize(parse::pad8(out.len()), 0);
                }
                // Object 0: the free tail, its size counting this header.
                let remaining = collection.size - out.len() as u64;
                if remaining >= self.object_header_size() {
                    out.extend_from_slice(&0u16.to_le_bytes());
                    out.extend_from_slice(&0u16.to_le_bytes());
                    out.extend_from_slice(&[0; 4]);
                    push_sized(&mut out, remaining, self.length_size);
                }
                out.resize(collection.size as usize, 0);
                (collection.address, out)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

fn push_sized(out: &mut Vec<u8>, value: u64, width: u8) {
    for i in 0..width {
        out.push((value >> (8 * u32::from(i))) as u8);
    }
}

/// Pairs the global-heap writer with the allocator for one encode call.
pub struct GlobalHeapSession<'a> {
    pub heap: &'a mut GlobalHeapWriter,
    pub alloc: &'a mut Allocator,
}

impl<'a> GlobalHeapSink for GlobalHeapSession<'a> {
    fn put_object(&mut self, data: &[u8]) -> Result<(u64, u32)> {
        let (address, index) = self.heap.put(self.alloc, data)?;
        Ok((address, u32::from(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::WriteOptions;

    #[test]
    fn local_heap_reserve_is_aligned() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut heap = LocalHeapBuilder::with_addresses(680, 712, INITIAL_HEAP_SEGMENT);
        let a = heap.reserve("ab", &mut alloc).unwrap();
        let b = heap.reserve("cdefghi", &mut alloc).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 16);
        assert_eq!(heap.free_cursor(), 24);
        let bytes = heap.segment_bytes();
        assert_eq!(&bytes[8..11], b"ab\0");
        assert_eq!(bytes.len() as u64, heap.capacity());
    }

    #[test]
    fn local_heap_doubles_and_relocates() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut heap = LocalHeapBuilder::with_addresses(680, 712, INITIAL_HEAP_SEGMENT);
        let long_name = "n".repeat(40);
        let mut offsets = Vec::new();
        for _ in 0..20 {
            offsets.push(heap.reserve(&long_name, &mut alloc).unwrap());
        }
        assert!(heap.relocations >= 1);
        assert_ne!(heap.data_address, 712);
        // Offsets stay stable relative to the segment start.
        assert_eq!(offsets[0], 8);
        assert_eq!(offsets[1], 56);
        let bytes = heap.segment_bytes();
        for &offset in &offsets {
            let start = offset as usize;
            assert_eq!(&bytes[start..start + 40], long_name.as_bytes());
            assert_eq!(bytes[start + 40], 0);
        }
    }

    #[test]
    fn global_heap_put_and_serialize() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut writer = GlobalHeapWriter::new(8);
        let (addr, index) = writer.put(&mut alloc, b"hello vlen").unwrap();
        assert_eq!(index, 1);
        let (addr2, index2) = writer.put(&mut alloc, b"more").unwrap();
        assert_eq!(addr, addr2);
        assert_eq!(index2, 2);

        let serialized = writer.serialized();
        assert_eq!(serialized.len(), 1);
        let (address, bytes) = &serialized[0];
        assert_eq!(*address, addr);
        assert_eq!(bytes.len() as u64, GLOBAL_HEAP_PAGE);
        let (_, collection) = parse::global_heap_collection(bytes, 8).unwrap();
        assert_eq!(collection.objects.len(), 2);
        assert_eq!(collection.objects[0].data, b"hello vlen");
        assert_eq!(collection.objects[1].data, b"more");
    }

    #[test]
    fn global_heap_opens_new_collection_when_full() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut writer = GlobalHeapWriter::new(8);
        let big = vec![7u8; 2000];
        let (a1, _) = writer.put(&mut alloc, &big).unwrap();
        let (a2, _) = writer.put(&mut alloc, &big).unwrap();
        let (a3, i3) = writer.put(&mut alloc, &big).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);
        assert_eq!(i3, 1);
    }
}
