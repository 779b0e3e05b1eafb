use hdf5file::{
    Dataspace, Datatype, FileBuilder, Hdf5Error, LayoutSpec, ReadOptions,
};

fn write_chunked(path: &std::path::Path) {
    let mut builder = FileBuilder::create(path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "series",
            Datatype::float64(),
            Dataspace::new(vec![4]),
            LayoutSpec::Chunked {
                chunk_dims: vec![2],
            },
        )
        .unwrap();
    builder
        .write_elements(ds, &[1.0f64, 2.0, 3.0, 4.0])
        .unwrap();
    builder.close().unwrap();
}

/// A chunk B-tree whose root's first child points back at the root must
/// terminate with `CyclicBtree`, not loop.
#[test]
fn chunk_tree_cycle_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cycle.h5");
    write_chunked(&path);

    let file = hdf5file::open(&path).unwrap();
    let root_address = file.dataset("/series").unwrap().data_address().unwrap();
    drop(file);

    let mut bytes = std::fs::read(&path).unwrap();
    let node = root_address as usize;
    // Pretend the node is internal so its children are tree nodes, and
    // point the first child back at the node itself. A one-dimensional
    // dataset stores two key dimensions, so the key is 24 bytes.
    bytes[node + 5] = 1;
    let child_at = node + 24 + 24;
    bytes[child_at..child_at + 8].copy_from_slice(&root_address.to_le_bytes());
    std::fs::write(&path, &bytes).unwrap();

    let file = hdf5file::open(&path).unwrap();
    match file.read_dataset::<f64>("/series") {
        Err(Hdf5Error::CyclicBtree { address }) => assert_eq!(address, root_address),
        other => panic!("expected CyclicBtree, got {:?}", other),
    }
}

fn write_plain(path: &std::path::Path) {
    let mut builder = FileBuilder::create(path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "values",
            Datatype::fixed(4, true),
            Dataspace::new(vec![2]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(ds, &[5i32, 6]).unwrap();
    builder.close().unwrap();
}

/// Rewrite the dataset header's trailing Nil message into an unknown
/// type 0xFE of size 8.
fn inject_unknown_message(path: &std::path::Path) {
    let mut bytes = std::fs::read(path).unwrap();
    // The first dataset header block sits at 800; messages start at 816.
    let mut cursor = 816usize;
    loop {
        assert!(cursor < 800 + 512, "no Nil message found to overwrite");
        let message_type = u16::from_le_bytes([bytes[cursor], bytes[cursor + 1]]);
        let size = u16::from_le_bytes([bytes[cursor + 2], bytes[cursor + 3]]) as usize;
        if message_type == 0 {
            bytes[cursor..cursor + 2].copy_from_slice(&0xFEu16.to_le_bytes());
            bytes[cursor + 2..cursor + 4].copy_from_slice(&8u16.to_le_bytes());
            bytes[cursor + 4] = 0; // flags: bit 7 clear
            break;
        }
        cursor += 8 + size;
    }
    std::fs::write(path, &bytes).unwrap();
}

/// Unknown message, flag bit 7 clear: strict mode fails, lenient mode
/// keeps it as opaque bytes.
#[test]
fn unknown_message_policy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unknown.h5");
    write_plain(&path);
    inject_unknown_message(&path);

    match hdf5file::open(&path) {
        Err(Hdf5Error::UnknownMessage { message_type }) => assert_eq!(message_type, 0xFE),
        other => panic!("expected UnknownMessage, got {:?}", other.map(|_| ())),
    }

    let file = hdf5file::Hdf5File::open_with(&path, ReadOptions { lenient: true }).unwrap();
    assert!(!file.warnings().is_empty());
    let dataset = file.dataset("/values").expect("dataset still present");
    assert_eq!(dataset.unknown_messages().len(), 1);
    assert_eq!(dataset.unknown_messages()[0].0, 0xFE);
    assert_eq!(dataset.unknown_messages()[0].1.len(), 8);
    assert_eq!(file.read_dataset::<i32>("/values").unwrap(), vec![5, 6]);
}

/// Flag bit 7 set means fail-always, even in lenient mode.
#[test]
fn unknown_message_with_fail_bit_is_always_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fail_bit.h5");
    write_plain(&path);
    inject_unknown_message(&path);
    {
        let mut bytes = std::fs::read(&path).unwrap();
        let mut cursor = 816usize;
        loop {
            let message_type = u16::from_le_bytes([bytes[cursor], bytes[cursor + 1]]);
            let size = u16::from_le_bytes([bytes[cursor + 2], bytes[cursor + 3]]) as usize;
            if message_type == 0xFE {
                bytes[cursor + 4] = 0x80;
                break;
            }
            cursor += 8 + size;
        }
        std::fs::write(&path, &bytes).unwrap();
    }

    let lenient = hdf5file::Hdf5File::open_with(&path, ReadOptions { lenient: true });
    // The object fails, and in lenient mode the failure downgrades to a
    // skipped child rather than a failed open.
    match lenient {
        Ok(file) => {
            assert!(file.dataset("/values").is_none());
            assert!(file
                .warnings()
                .iter()
                .any(|w| w.contains("skipped")));
        }
        Err(e) => panic!("lenient open should survive, got {:?}", e),
    }
}

#[test]
fn bad_signature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_hdf5.h5");
    std::fs::write(&path, b"definitely not an HDF5 file, but long enough").unwrap();

    match hdf5file::open(&path) {
        Err(Hdf5Error::Parse(context)) => assert!(context.contains("superblock")),
        other => panic!("expected a parse failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn end_of_file_beyond_real_length_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.h5");
    write_plain(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    // End-of-file address lives after 24 fixed bytes and two 8-byte
    // address fields.
    let eof_at = 24 + 16;
    bytes[eof_at..eof_at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
    std::fs::write(&path, &bytes).unwrap();

    match hdf5file::open(&path) {
        Err(Hdf5Error::CorruptStructure(_)) => {}
        other => panic!("expected CorruptStructure, got {:?}", other.map(|_| ())),
    }
}

/// Trailing unreferenced bytes (a cancelled later write) are tolerated.
#[test]
fn trailing_bytes_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trailing.h5");
    write_plain(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0xAB; 512]);
    std::fs::write(&path, &bytes).unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.read_dataset::<i32>("/values").unwrap(), vec![5, 6]);
}
