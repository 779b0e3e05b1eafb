//! Companion command-line front-end.
//!
//! `--input <path>` dumps a file's tree; `--output <path> --schema <json>`
//! builds a file from a JSON schema; `--verify` cross-checks a round-trip.
//! Exit codes: 0 success, 1 corrupt file, 2 unsupported version,
//! 3 I/O error, 4 schema error.

use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, Command};
use serde::Deserialize;

use hdf5file::{
    Dataspace, Datatype, DynamicValue, FileBuilder, GroupId, Hdf5Error, Hdf5File, LayoutSpec,
    ReadOptions,
};

fn main() {
    env_logger::init();
    let matches = Command::new("hdf5file")
        .about("Read, write, and verify HDF5 files")
        .arg(
            Arg::new("input")
                .long("input")
                .value_name("PATH")
                .help("Open PATH and dump its hierarchy"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("PATH")
                .help("Write a new file at PATH from --schema"),
        )
        .arg(
            Arg::new("schema")
                .long("schema")
                .value_name("JSON")
                .help("JSON schema describing groups and datasets"),
        )
        .arg(
            Arg::new("verify")
                .long("verify")
                .action(ArgAction::SetTrue)
                .help("Cross-check: read every element back"),
        )
        .arg(
            Arg::new("lenient")
                .long("lenient")
                .action(ArgAction::SetTrue)
                .help("Downgrade unknown messages and per-object corruption to warnings"),
        )
        .get_matches();

    let result = run(
        matches.get_one::<String>("input").map(String::as_str),
        matches.get_one::<String>("output").map(String::as_str),
        matches.get_one::<String>("schema").map(String::as_str),
        matches.get_flag("verify"),
        matches.get_flag("lenient"),
    );
    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    if let Some(hdf5) = e.downcast_ref::<Hdf5Error>() {
        return match hdf5 {
            Hdf5Error::UnsupportedVersion { .. } | Hdf5Error::UnsupportedClass(_) => 2,
            Hdf5Error::Io(_) => 3,
            Hdf5Error::Schema(_) => 4,
            _ => 1,
        };
    }
    if e.downcast_ref::<std::io::Error>().is_some() {
        return 3;
    }
    if e.downcast_ref::<serde_json::Error>().is_some() {
        return 4;
    }
    1
}

fn run(
    input: Option<&str>,
    output: Option<&str>,
    schema: Option<&str>,
    verify: bool,
    lenient: bool,
) -> anyhow::Result<()> {
    match (input, output) {
        (Some(input), None) => dump(input, lenient, verify),
        (None, Some(output)) => {
            let schema_path = schema.ok_or(Hdf5Error::Schema(
                "--schema is required with --output".to_string(),
            ))?;
            let schema = load_schema(schema_path)?;
            build(output, &schema)?;
            if verify {
                verify_against_schema(output, &schema)?;
                println!("verified: {}", output);
            }
            Ok(())
        }
        _ => Err(anyhow!("exactly one of --input or --output is required")),
    }
}

fn dump(path: &str, lenient: bool, verify: bool) -> anyhow::Result<()> {
    let file = Hdf5File::open_with(path, ReadOptions { lenient })
        .with_context(|| format!("opening {}", path))?;
    println!(
        "{}: end of file {:#x}, offsets {} bytes",
        path,
        file.end_of_file_address(),
        file.offset_size()
    );
    let mut rendered = String::new();
    render_group(&mut rendered, file.root(), "/", 0);
    print!("{}", rendered);
    for warning in file.warnings() {
        println!("warning: {}", warning);
    }
    if verify {
        let mut checked = 0u64;
        verify_tree(&file, file.root(), String::new(), &mut checked)?;
        println!("verified {} elements", checked);
    }
    Ok(())
}

fn render_group(out: &mut String, group: &hdf5file::Group, name: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{}{}", indent, name);
    for attr in group.attribute_names() {
        let _ = writeln!(out, "{}  @{}", indent, attr);
    }
    for (name, dataset) in group.datasets() {
        let _ = writeln!(
            out,
            "{}  {} dims={:?} class={} layout={}",
            indent,
            name,
            dataset.dimensions(),
            dataset.datatype().class_code(),
            dataset.layout_class()
        );
        for attr in dataset.attribute_names() {
            let _ = writeln!(out, "{}    @{}", indent, attr);
        }
    }
    for (child_name, child) in group.groups() {
        render_group(out, child, child_name, depth + 1);
    }
}

fn verify_tree(
    file: &Hdf5File,
    group: &hdf5file::Group,
    prefix: String,
    checked: &mut u64,
) -> anyhow::Result<()> {
    for (name, _dataset) in group.datasets() {
        let path = format!("{}/{}", prefix, name);
        for value in file.iter_dynamic(&path)? {
            value.with_context(|| format!("reading {}", path))?;
            *checked += 1;
        }
    }
    for (name, child) in group.groups() {
        verify_tree(file, child, format!("{}/{}", prefix, name), checked)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Schema {
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    datasets: Vec<SchemaDataset>,
}

#[derive(Debug, Deserialize)]
struct SchemaDataset {
    path: String,
    datatype: String,
    #[serde(default)]
    dims: Option<Vec<u64>>,
    #[serde(default)]
    layout: Option<String>,
    #[serde(default)]
    chunk: Option<Vec<u64>>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

fn load_schema(path: &str) -> anyhow::Result<Schema> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let schema: Schema =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?;
    Ok(schema)
}

fn parse_datatype(name: &str) -> Result<Datatype, Hdf5Error> {
    if let Some(size) = name.strip_prefix("string:") {
        let size: u32 = size
            .parse()
            .map_err(|_| Hdf5Error::Schema(format!("bad string size in {:?}", name)))?;
        return Ok(Datatype::string(size));
    }
    match name {
        "i8" => Ok(Datatype::fixed(1, true)),
        "i16" => Ok(Datatype::fixed(2, true)),
        "i32" => Ok(Datatype::fixed(4, true)),
        "i64" => Ok(Datatype::fixed(8, true)),
        "u8" => Ok(Datatype::fixed(1, false)),
        "u16" => Ok(Datatype::fixed(2, false)),
        "u32" => Ok(Datatype::fixed(4, false)),
        "u64" => Ok(Datatype::fixed(8, false)),
        "f32" => Ok(Datatype::float32()),
        "f64" => Ok(Datatype::float64()),
        other => Err(Hdf5Error::Schema(format!("unknown datatype {:?}", other))),
    }
}

fn json_value(datatype: &Datatype, value: &serde_json::Value) -> Result<DynamicValue, Hdf5Error> {
    use hdf5file::DatatypeClass;
    match (&datatype.class, value) {
        (DatatypeClass::Fixed(info), serde_json::Value::Number(n)) => {
            if info.signed {
                n.as_i64().map(DynamicValue::Int).ok_or_else(|| {
                    Hdf5Error::Schema(format!("{} is not a signed integer", n))
                })
            } else {
                n.as_u64().map(DynamicValue::Uint).ok_or_else(|| {
                    Hdf5Error::Schema(format!("{} is not an unsigned integer", n))
                })
            }
        }
        (DatatypeClass::Float(_), serde_json::Value::Number(n)) => n
            .as_f64()
            .map(DynamicValue::Float)
            .ok_or_else(|| Hdf5Error::Schema(format!("{} is not a float", n))),
        (DatatypeClass::String(_), serde_json::Value::String(s)) => {
            Ok(DynamicValue::Str(s.clone()))
        }
        (_, other) => Err(Hdf5Error::Schema(format!(
            "value {} does not match datatype",
            other
        ))),
    }
}

fn split_path(path: &str) -> Result<(String, String), Hdf5Error> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Hdf5Error::Schema(format!("bad dataset path {:?}", path)));
    }
    match trimmed.rfind('/') {
        Some(i) => Ok((trimmed[..i].to_string(), trimmed[i + 1..].to_string())),
        None => Ok((String::new(), trimmed.to_string())),
    }
}

fn ensure_group(
    builder: &mut FileBuilder,
    known: &mut HashMap<String, GroupId>,
    path: &str,
) -> Result<GroupId, Hdf5Error> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(builder.root());
    }
    if let Some(&id) = known.get(trimmed) {
        return Ok(id);
    }
    let mut current = builder.root();
    let mut walked = String::new();
    for part in trimmed.split('/') {
        if !walked.is_empty() {
            walked.push('/');
        }
        walked.push_str(part);
        current = match known.get(&walked) {
            Some(&id) => id,
            None => {
                let id = builder.create_group(current, part)?;
                known.insert(walked.clone(), id);
                id
            }
        };
    }
    Ok(current)
}

fn build(path: &str, schema: &Schema) -> anyhow::Result<()> {
    let mut builder = FileBuilder::create(path)?;
    let mut known: HashMap<String, GroupId> = HashMap::new();

    for group in &schema.groups {
        ensure_group(&mut builder, &mut known, group)?;
    }

    for dataset in &schema.datasets {
        let datatype = parse_datatype(&dataset.datatype)?;
        let dims = dataset
            .dims
            .clone()
            .unwrap_or_else(|| vec![dataset.data.len() as u64]);
        let layout = match dataset.layout.as_deref() {
            None | Some("contiguous") => LayoutSpec::Contiguous,
            Some("compact") => LayoutSpec::Compact,
            Some("chunked") => {
                let chunk_dims = dataset.chunk.clone().ok_or_else(|| {
                    Hdf5Error::Schema(format!("{:?} is chunked but has no chunk dims", dataset.path))
                })?;
                LayoutSpec::Chunked { chunk_dims }
            }
            Some(other) => {
                return Err(Hdf5Error::Schema(format!("unknown layout {:?}", other)).into())
            }
        };
        let (group_path, name) = split_path(&dataset.path)?;
        let parent = ensure_group(&mut builder, &mut known, &group_path)?;
        let id = builder.create_dataset(parent, &name, datatype.clone(), Dataspace::new(dims), layout)?;

        let values = dataset
            .data
            .iter()
            .map(|v| json_value(&datatype, v))
            .collect::<Result<Vec<_>, _>>()?;
        builder.write_dynamic(id, &values)?;
    }

    builder.close()?;
    println!("wrote {}", path);
    Ok(())
}

fn verify_against_schema(path: &str, schema: &Schema) -> anyhow::Result<()> {
    let file = Hdf5File::open(path)?;
    for dataset in &schema.datasets {
        let datatype = parse_datatype(&dataset.datatype)?;
        let expected = dataset
            .data
            .iter()
            .map(|v| json_value(&datatype, v))
            .collect::<Result<Vec<_>, _>>()?;
        let path = format!("/{}", dataset.path.trim_matches('/'));
        let actual = file.read_dynamic(&path)?;
        if actual.len() < expected.len() {
            return Err(Hdf5Error::CorruptStructure(format!(
                "{:?} read back {} elements, wrote {}",
                path,
                actual.len(),
                expected.len()
            ))
            .into());
        }
        for (i, (a, e)) in actual.iter().zip(&expected).enumerate() {
            if a != e {
                return Err(Hdf5Error::CorruptStructure(format!(
                    "{:?} element {} read back {:?}, wrote {:?}",
                    path, i, a, e
                ))
                .into());
            }
        }
    }
    Ok(())
}
