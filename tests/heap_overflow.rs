use hdf5file::{Dataspace, Datatype, FileBuilder, LayoutSpec};

fn long_name(i: usize) -> String {
    // 40 bytes exactly.
    format!("dataset_with_a_very_long_name_number_{:03}", i)
}

/// Twenty 40-byte link names overflow the 88-byte initial heap segment
/// several times over; the segment must relocate and every name must
/// still resolve by its original offset.
#[test]
fn local_heap_overflow_relocates_the_segment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t4.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    for i in 0..20 {
        let ds = builder
            .create_dataset(
                root,
                &long_name(i),
                Datatype::fixed(8, false),
                Dataspace::new(vec![1]),
                LayoutSpec::Contiguous,
            )
            .unwrap();
        builder.write_elements(ds, &[i as u64]).unwrap();
    }
    builder.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    // Root local-heap header at 680: the data-segment address moved away
    // from the reserved segment at 712, into the dynamic region.
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[704..712]);
    let segment_address = u64::from_le_bytes(buf);
    assert_ne!(segment_address, 712);
    assert!(segment_address >= 800);
    // The segment grew by doubling: 88 -> 176 -> 352 -> 704 -> 1408.
    buf.copy_from_slice(&bytes[688..696]);
    let segment_size = u64::from_le_bytes(buf);
    assert_eq!(segment_size, 1408);

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.root().datasets().count(), 20);
    for i in 0..20 {
        let name = long_name(i);
        let values = file
            .read_dataset::<u64>(&format!("/{}", name))
            .unwrap_or_else(|e| panic!("dataset {:?} unreadable: {}", name, e));
        assert_eq!(values, vec![i as u64]);
    }
}

/// Twenty entries with leaf K = 4 force SNOD splits; membership must
/// stay complete and sorted across the split nodes.
#[test]
fn snod_splits_preserve_membership() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("splits.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    // Insert in reverse order to exercise sorted placement.
    for i in (0..20).rev() {
        builder
            .create_dataset(
                root,
                &format!("k{:02}", i),
                Datatype::fixed(4, false),
                Dataspace::new(vec![1]),
                LayoutSpec::Contiguous,
            )
            .unwrap();
    }
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let names: Vec<&str> = file.root().datasets().map(|(name, _)| name).collect();
    assert_eq!(names.len(), 20);
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
    assert!(file.dataset("/k00").is_some());
    assert!(file.dataset("/k19").is_some());
}

/// Deep nesting: every level gets its own heap, B-tree, and SNOD.
#[test]
fn groups_nest_several_levels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deep.h5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let mut current = builder.root();
    for level in 0..5 {
        current = builder
            .create_group(current, &format!("level{}", level))
            .unwrap();
    }
    let ds = builder
        .create_dataset(
            current,
            "leaf",
            Datatype::fixed(2, true),
            Dataspace::new(vec![3]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(ds, &[-1i16, 0, 1]).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let path_str = "/level0/level1/level2/level3/level4/leaf";
    assert_eq!(file.read_dataset::<i16>(path_str).unwrap(), vec![-1, 0, 1]);
}
