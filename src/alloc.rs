//! The file-space allocator: a monotonic byte-offset cursor that lays out
//! every structure the writer emits. Existing blocks never move; growth
//! appends at end-of-file.

use crate::error::{Hdf5Error, Result};

pub const SUPERBLOCK_ADDRESS: u64 = 0;
pub const LOCAL_HEAP_HEADER_SIZE: u64 = 32;
/// First raw-data byte lands at or beyond this boundary.
pub const RAW_DATA_FLOOR: u64 = 2048;

/// Options for the write path. Defaults reproduce the reference layout:
/// superblock 0..96, root header 96..136, root B-tree 136..680, root heap
/// header 680..712, root heap data 712..800.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub offset_size: u8,
    pub length_size: u8,
    pub group_leaf_k: u16,
    pub group_internal_k: u16,
    /// Bytes reserved for each dataset's object-header block.
    pub object_header_block: u64,
    /// Hard cap on the file image; `AllocationExceeded` past it.
    pub max_file_size: Option<u64>,
}

impl Default for WriteOptions {
    fn default() -> WriteOptions {
        WriteOptions {
            offset_size: 8,
            length_size: 8,
            group_leaf_k: 4,
            group_internal_k: 16,
            object_header_block: 512,
            max_file_size: None,
        }
    }
}

impl WriteOptions {
    /// Version-0 superblock plus the embedded root symbol-table entry.
    pub fn superblock_size(&self) -> u64 {
        24 + 4 * u64::from(self.offset_size) + self.symbol_table_entry_size()
    }

    pub fn symbol_table_entry_size(&self) -> u64 {
        2 * u64::from(self.offset_size) + 8 + 16
    }

    /// A full B-tree node: header plus 2K children and 2K+1 keys.
    pub fn btree_node_size(&self) -> u64 {
        let k = u64::from(self.group_internal_k);
        8 + 2 * u64::from(self.offset_size)
            + 2 * k * u64::from(self.offset_size)
            + (2 * k + 1) * u64::from(self.length_size)
    }

    /// A full symbol-table node: header plus 2K entries.
    pub fn snod_size(&self) -> u64 {
        8 + 2 * u64::from(self.group_leaf_k) * self.symbol_table_entry_size()
    }
}

/// One allocation, for the addressing audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub size: u64,
}

pub struct Allocator {
    cursor: u64,
    records: Vec<Extent>,
    max_file_size: Option<u64>,
    first_raw_done: bool,
    pub root_header_address: u64,
    pub root_header_size: u64,
    pub root_btree_address: u64,
    pub root_heap_address: u64,
    pub root_heap_data_address: u64,
    pub root_heap_data_size: u64,
}

impl Allocator {
    /// Reserve the fixed prefix: superblock, root object header, root
    /// B-tree node, root local-heap header and initial data segment.
    pub fn new(opts: &WriteOptions) -> Allocator {
        let superblock_size = opts.superblock_size();
        // Prefix (16) plus one symbol-table message.
        let root_header_size = 16 + 8 + 2 * u64::from(opts.offset_size);
        let root_header_address = superblock_size;
        let root_btree_address = root_header_address + root_header_size;
        let root_heap_address = root_btree_address + opts.btree_node_size();
        let root_heap_data_address = root_heap_address + LOCAL_HEAP_HEADER_SIZE;
        let root_heap_data_size = crate::heap::INITIAL_HEAP_SEGMENT;

        let records = vec![
            Extent {
                offset: SUPERBLOCK_ADDRESS,
                size: superblock_size,
            },
            Extent {
                offset: root_header_address,
                size: root_header_size,
            },
            Extent {
                offset: root_btree_address,
                size: opts.btree_node_size(),
            },
            Extent {
                offset: root_heap_address,
                size: LOCAL_HEAP_HEADER_SIZE,
            },
            Extent {
                offset: root_heap_data_address,
                size: root_heap_data_size,
            },
        ];

        Allocator {
            cursor: root_heap_data_address + root_heap_data_size,
            records,
            max_file_size: opts.max_file_size,
            first_raw_done: false,
            root_header_address,
            root_header_size,
            root_btree_address,
            root_heap_address,
            root_heap_data_address,
            root_heap_data_size,
        }
    }

    /// Allocate an 8-byte-aligned extent at the current end of file.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let offset = align8(self.cursor);
        let end = offset + size;
        if let Some(limit) = self.max_file_size {
            if end > limit {
                return Err(Hdf5Error::AllocationExceeded {
                    limit,
                    requested: end,
                });
            }
        }
        self.records.push(Extent { offset, size });
        self.cursor = end;
        Ok(offset)
    }

    pub fn allocate_object_header(&mut self, size: u64) -> Result<u64> {
        let offset = self.allocate(size)?;
        log::debug!("object header block at {:#x} ({} bytes)", offset, size);
        Ok(offset)
    }

    /// Raw dataset data; the first such extent starts at or past the
    /// raw-data floor so metadata keeps the front of the file.
    pub fn allocate_raw_data(&mut self, size: u64) -> Result<u64> {
        if !self.first_raw_done {
            self.cursor = self.cursor.max(RAW_DATA_FLOOR);
            self.first_raw_done = true;
        }
        let offset = self.allocate(size)?;
        log::debug!("raw data at {:#x} ({} bytes)", offset, size);
        Ok(offset)
    }

    /// A relocated, doubled local-heap data segment.
    pub fn expand_local_heap(&mut self, size: u64) -> Result<u64> {
        self.allocate(size)
    }

    pub fn allocate_global_heap_collection(&mut self, size: u64) -> Result<u64> {
        let offset = self.allocate(size)?;
        log::debug!("global heap collection at {:#x} ({} bytes)", offset, size);
        Ok(offset)
    }

    /// The end-of-file address written into the superblock at close.
    pub fn end_of_file(&self) -> u64 {
        self.cursor
    }

    pub fn records(&self) -> &[Extent] {
        &self.records
    }
}

fn align8(offset: u64) -> u64 {
    (offset + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_layout() {
        let opts = WriteOptions::default();
        assert_eq!(opts.superblock_size(), 96);
        assert_eq!(opts.btree_node_size(), 544);
        assert_eq!(opts.snod_size(), 328);
        let alloc = Allocator::new(&opts);
        assert_eq!(alloc.root_header_address, 96);
        assert_eq!(alloc.root_header_size, 40);
        assert_eq!(alloc.root_btree_address, 136);
        assert_eq!(alloc.root_heap_address, 680);
        assert_eq!(alloc.root_heap_data_address, 712);
        assert_eq!(alloc.end_of_file(), 800);
    }

    #[test]
    fn allocations_are_monotonic_and_aligned() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let mut previous_end = 0;
        for size in &[3u64, 8, 1, 513, 40] {
            let offset = alloc.allocate(*size).unwrap();
            assert_eq!(offset % 8, 0);
            assert!(offset >= previous_end);
            previous_end = offset + size;
        }
        assert_eq!(alloc.end_of_file(), previous_end);
    }

    #[test]
    fn first_raw_data_lands_past_the_floor() {
        let mut alloc = Allocator::new(&WriteOptions::default());
        let header = alloc.allocate_object_header(512).unwrap();
        assert_eq!(header, 800);
        let raw = alloc.allocate_raw_data(24).unwrap();
        assert_eq!(raw, RAW_DATA_FLOOR);
        // Later raw allocations are only 8-aligned.
        let raw2 = alloc.allocate_raw_data(24).unwrap();
        assert_eq!(raw2, RAW_DATA_FLOOR + 24);
    }

    #[test]
    fn max_file_size_is_enforced() {
        let opts = WriteOptions {
            max_file_size: Some(1024),
            ..WriteOptions::default()
        };
        let mut alloc = Allocator::new(&opts);
        assert!(alloc.allocate(200).is_ok());
        match alloc.allocate(100) {
            Err(Hdf5Error::AllocationExceeded { limit, .. }) => assert_eq!(limit, 1024),
            other => panic!("expected AllocationExceeded, got {:?}", other.map(|_| ())),
        }
    }
}
