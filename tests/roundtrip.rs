use hdf5file::{
    Dataspace, Datatype, DatatypeClass, DynamicValue, FileBuilder, LayoutSpec, WriteOptions,
};

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Create a file with no datasets, close, reopen. The reference layout
/// pins the superblock, root header, B-tree, and heap addresses.
#[test]
fn empty_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t1.h5");

    FileBuilder::create(&path).unwrap().close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.end_of_file_address(), 800);
    assert_eq!(file.root().btree_address(), 136);
    assert_eq!(file.root().heap_address(), 680);
    assert_eq!(file.root().datasets().count(), 0);
    assert_eq!(file.root().groups().count(), 0);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 800);
    // Root object header: version 1, exactly one (symbol-table) message.
    assert_eq!(bytes[96], 1);
    assert_eq!(read_u16(&bytes, 98), 1);
    // Root B-tree node: group type, leaf level, zero entries used.
    assert_eq!(&bytes[136..140], b"TREE");
    assert_eq!(bytes[140], 0);
    assert_eq!(read_u16(&bytes, 142), 0);
    // Local heap header points at the reserved data segment.
    assert_eq!(&bytes[680..684], b"HEAP");
    assert_eq!(read_u64(&bytes, 704), 712);
}

/// One contiguous dataset of three doubles: layout class 1, 24 data
/// bytes at the raw-data floor, exact values back.
#[test]
fn contiguous_scalar_floats() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t2.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "Demand",
            Datatype::float64(),
            Dataspace::new(vec![3]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(ds, &[1.5f64, 2.25, 3.125]).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let dataset = file.dataset("/Demand").unwrap();
    assert_eq!(dataset.layout_class(), 1);
    assert_eq!(dataset.data_size(), Some(24));
    assert_eq!(dataset.data_address(), Some(2048));
    assert_eq!(dataset.dimensions(), &[3]);
    assert_eq!(
        file.read_dataset::<f64>("/Demand").unwrap(),
        vec![1.5, 2.25, 3.125]
    );
    // The zero-copy view sees the same bytes.
    assert_eq!(file.view::<f64>("/Demand").unwrap(), &[1.5, 2.25, 3.125]);
}

/// Compound records with string and integer members, offsets preserved.
#[test]
fn compound_shipments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t3.h5");

    let datatype = Datatype::compound(
        vec![
            ("id".to_string(), 0, Datatype::fixed(8, false)),
            ("orig".to_string(), 8, Datatype::string(2)),
            ("dest".to_string(), 10, Datatype::string(2)),
            ("weight".to_string(), 12, Datatype::fixed(2, false)),
        ],
        16,
    )
    .unwrap();

    let records = vec![
        DynamicValue::Compound(vec![
            ("id".to_string(), DynamicValue::Uint(7)),
            ("orig".to_string(), DynamicValue::Str("US".to_string())),
            ("dest".to_string(), DynamicValue::Str("CA".to_string())),
            ("weight".to_string(), DynamicValue::Uint(500)),
        ]),
        DynamicValue::Compound(vec![
            ("id".to_string(), DynamicValue::Uint(9)),
            ("orig".to_string(), DynamicValue::Str("US".to_string())),
            ("dest".to_string(), DynamicValue::Str("MX".to_string())),
            ("weight".to_string(), DynamicValue::Uint(1200)),
        ]),
    ];

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "shipments",
            datatype,
            Dataspace::new(vec![2]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_dynamic(ds, &records).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let dataset = file.dataset("/shipments").unwrap();
    match &dataset.datatype().class {
        DatatypeClass::Compound(info) => {
            let offsets: Vec<u64> = info.members.iter().map(|m| m.byte_offset).collect();
            assert_eq!(offsets, vec![0, 8, 10, 12]);
        }
        other => panic!("expected a compound datatype, found {:?}", other),
    }
    assert_eq!(file.read_dynamic("/shipments").unwrap(), records);
}

#[test]
fn compact_layout_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compact.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "small",
            Datatype::fixed(4, true),
            Dataspace::new(vec![4]),
            LayoutSpec::Compact,
        )
        .unwrap();
    builder.write_elements(ds, &[-1i32, 2, -3, 4]).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let dataset = file.dataset("/small").unwrap();
    assert_eq!(dataset.layout_class(), 0);
    assert_eq!(dataset.data_size(), Some(16));
    assert_eq!(file.read_dataset::<i32>("/small").unwrap(), vec![-1, 2, -3, 4]);
}

#[test]
fn chunked_one_dimension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunk1.h5");

    let values: Vec<f64> = (0..5).map(|i| i as f64 * 0.5).collect();
    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "series",
            Datatype::float64(),
            Dataspace::new(vec![5]),
            LayoutSpec::Chunked {
                chunk_dims: vec![2],
            },
        )
        .unwrap();
    builder.write_elements(ds, &values).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let dataset = file.dataset("/series").unwrap();
    assert_eq!(dataset.layout_class(), 2);
    assert_eq!(dataset.chunk_dimensions(), Some(vec![2]));
    assert_eq!(file.read_dataset::<f64>("/series").unwrap(), values);
}

#[test]
fn chunked_two_dimensions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunk2.h5");

    // 3x4 row-major grid, 2x3 chunks: edge chunks are partial.
    let values: Vec<i32> = (0..12).collect();
    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "grid",
            Datatype::fixed(4, true),
            Dataspace::new(vec![3, 4]),
            LayoutSpec::Chunked {
                chunk_dims: vec![2, 3],
            },
        )
        .unwrap();
    builder.write_elements(ds, &values).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.read_dataset::<i32>("/grid").unwrap(), values);
}

#[test]
fn nested_groups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let sensors = builder.create_group(root, "sensors").unwrap();
    let raw = builder.create_group(sensors, "raw").unwrap();
    let ds = builder
        .create_dataset(
            raw,
            "temps",
            Datatype::float32(),
            Dataspace::new(vec![2]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(ds, &[20.5f32, 21.0]).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert!(file.group("/sensors").is_some());
    assert!(file.group("/sensors/raw").is_some());
    assert_eq!(
        file.read_dataset::<f32>("/sensors/raw/temps").unwrap(),
        vec![20.5, 21.0]
    );
    assert!(file.dataset("/sensors/temps").is_none());
}

#[test]
fn vlen_strings_through_the_global_heap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vlen.h5");

    let values = vec![
        DynamicValue::Str("alpha".to_string()),
        DynamicValue::Str("a-longer-entry".to_string()),
        DynamicValue::Str("".to_string()),
    ];
    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "names",
            Datatype::vlen_string(),
            Dataspace::new(vec![3]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_dynamic(ds, &values).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.read_dynamic("/names").unwrap(), values);
}

#[test]
fn vlen_sequences_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vlen_seq.h5");

    let values = vec![
        DynamicValue::Vlen(vec![DynamicValue::Int(1), DynamicValue::Int(2)]),
        DynamicValue::Vlen(vec![]),
        DynamicValue::Vlen(vec![
            DynamicValue::Int(-5),
            DynamicValue::Int(10),
            DynamicValue::Int(-15),
        ]),
    ];
    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "ragged",
            Datatype::vlen(Datatype::fixed(4, true)),
            Dataspace::new(vec![3]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_dynamic(ds, &values).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.read_dynamic("/ragged").unwrap(), values);
}

#[test]
fn enum_dataset_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("enum.h5");

    let datatype = Datatype::enumeration(
        Datatype::fixed(2, true),
        vec![
            ("IDLE".to_string(), 0),
            ("BUSY".to_string(), 1),
            ("FAULT".to_string(), -1),
        ],
    )
    .unwrap();
    let values = vec![
        DynamicValue::Enum("BUSY".to_string(), 1),
        DynamicValue::Enum("FAULT".to_string(), -1),
        DynamicValue::Enum("IDLE".to_string(), 0),
    ];

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "states",
            datatype,
            Dataspace::new(vec![3]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_dynamic(ds, &values).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.read_dynamic("/states").unwrap(), values);
}

#[test]
fn object_references_resolve_by_address() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("refs.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let target = builder
        .create_dataset(
            root,
            "target",
            Datatype::float64(),
            Dataspace::new(vec![1]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(target, &[9.5f64]).unwrap();
    let target_address = builder.object_address(target.into()).unwrap();

    let refs = builder
        .create_dataset(
            root,
            "pointers",
            Datatype::object_reference(),
            Dataspace::new(vec![1]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder
        .write_dynamic(refs, &[DynamicValue::Reference(target_address)])
        .unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    match file.read_dynamic("/pointers").unwrap().as_slice() {
        [DynamicValue::Reference(address)] => {
            assert_eq!(file.dataset_path_at_address(*address), Some("/target"));
            let target = file.dataset_at_address(*address).unwrap();
            assert_eq!(target.dimensions(), &[1]);
        }
        other => panic!("expected one object reference, got {:?}", other),
    }
}

#[test]
fn unlinked_objects_disappear() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unlink.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    for name in &["keep", "drop"] {
        let ds = builder
            .create_dataset(
                root,
                name,
                Datatype::fixed(8, false),
                Dataspace::new(vec![1]),
                LayoutSpec::Contiguous,
            )
            .unwrap();
        builder.write_elements(ds, &[42u64]).unwrap();
    }
    assert!(builder.contains(root, "drop"));
    assert!(builder.unlink(root, "drop"));
    assert!(!builder.contains(root, "drop"));
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert!(file.dataset("/keep").is_some());
    assert!(file.dataset("/drop").is_none());
}

/// Every address the metadata references stays below the end-of-file
/// address, and the file is exactly as long as the superblock claims.
#[test]
fn addresses_stay_inside_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("addresses.h5");

    let mut builder = FileBuilder::create_with(
        &path,
        WriteOptions {
            max_file_size: Some(1 << 20),
            ..WriteOptions::default()
        },
    )
    .unwrap();
    let root = builder.root();
    let group = builder.create_group(root, "g").unwrap();
    for i in 0..3 {
        let ds = builder
            .create_dataset(
                group,
                &format!("d{}", i),
                Datatype::float64(),
                Dataspace::new(vec![8]),
                LayoutSpec::Contiguous,
            )
            .unwrap();
        builder.write_elements(ds, &[0.25f64; 8]).unwrap();
    }
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let eof = file.end_of_file_address();
    assert_eq!(eof, std::fs::metadata(&path).unwrap().len());
    let group = file.group("/g").unwrap();
    assert!(group.btree_address() < eof);
    assert!(group.heap_address() < eof);
    for (_, dataset) in group.datasets() {
        assert!(dataset.header_address() < eof);
        let address = dataset.data_address().unwrap();
        let size = dataset.data_size().unwrap();
        assert!(address + size <= eof);
    }
}
