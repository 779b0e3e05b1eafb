use hdf5file::{Dataspace, Datatype, FileBuilder, LayoutSpec, ObjectId};

#[test]
fn can_parse_attribute() {
    let dir = tempfile::tempdir().expect("Unable to create a scratch directory");
    let path = dir.path().join("attributes.hdf5");

    let mut builder = FileBuilder::create(&path).expect("Unable to create the file");
    let root = ObjectId::from(builder.root());
    builder.set_scalar_attribute(root, "i32_attribute", 12345i32).unwrap();
    builder.set_scalar_attribute(root, "i64_attribute", 12345i64).unwrap();
    builder.set_scalar_attribute(root, "f32_attribute", 1.2345f32).unwrap();
    builder.set_scalar_attribute(root, "f64_attribute", 1.2345f64).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).expect("Unable to open the file");
    println!("{:#?}", file);

    assert_eq!(file.attr::<i32>("i32_attribute").unwrap(), 12345);
    assert_eq!(file.attr::<i64>("i64_attribute").unwrap(), 12345);
    assert_eq!(file.attr::<f32>("f32_attribute").unwrap(), 1.2345);
    assert_eq!(file.attr::<f64>("f64_attribute").unwrap(), 1.2345);
}

#[test]
fn dataset_attributes_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ds_attrs.hdf5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "samples",
            Datatype::fixed(4, true),
            Dataspace::new(vec![2]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(ds, &[7i32, -7]).unwrap();
    builder
        .set_scalar_attribute(ObjectId::from(ds), "gain", 2.5f64)
        .unwrap();
    builder
        .set_scalar_attribute(ObjectId::from(ds), "channel", 3u16)
        .unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let dataset = file.dataset("/samples").expect("dataset is linked");
    let mut names: Vec<&str> = dataset.attribute_names().collect();
    names.sort_unstable();
    assert_eq!(names, ["channel", "gain"]);
    assert_eq!(file.dataset_attr::<f64>(dataset, "gain").unwrap(), 2.5);
    assert_eq!(file.dataset_attr::<u16>(dataset, "channel").unwrap(), 3);
}

/// Enough attributes to overflow the header block: the tail must move to
/// a continuation block and still read back.
#[test]
fn many_attributes_spill_to_a_continuation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spill.hdf5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = builder.root();
    let ds = builder
        .create_dataset(
            root,
            "wide",
            Datatype::float64(),
            Dataspace::new(vec![1]),
            LayoutSpec::Contiguous,
        )
        .unwrap();
    builder.write_elements(ds, &[0.5f64]).unwrap();
    for i in 0..30 {
        builder
            .set_scalar_attribute(ObjectId::from(ds), &format!("attr_{:02}", i), i as i64)
            .unwrap();
    }
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    let dataset = file.dataset("/wide").unwrap();
    assert_eq!(dataset.attribute_names().count(), 30);
    for i in 0..30 {
        assert_eq!(
            file.dataset_attr::<i64>(dataset, &format!("attr_{:02}", i)).unwrap(),
            i as i64
        );
    }
    assert_eq!(file.read_dataset::<f64>("/wide").unwrap(), vec![0.5]);
}

/// Root attributes do not fit beside the symbol-table message in the
/// 40-byte root header, so the whole stream spills.
#[test]
fn root_attributes_survive_the_tiny_root_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("root_attrs.hdf5");

    let mut builder = FileBuilder::create(&path).unwrap();
    let root = ObjectId::from(builder.root());
    builder.set_scalar_attribute(root, "version", 3u32).unwrap();
    builder.close().unwrap();

    let file = hdf5file::open(&path).unwrap();
    assert_eq!(file.attr::<u32>("version").unwrap(), 3);
    // The root group is still perfectly navigable.
    assert_eq!(file.root().datasets().count(), 0);
}
