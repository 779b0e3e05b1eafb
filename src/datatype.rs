//! The HDF5 datatype system: parsing, serialization, and element codecs
//! for the eleven on-disk classes.

use std::collections::HashMap;

use nom::bytes::streaming::{tag, take, take_till};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::error::{Hdf5Error, Result};
use crate::fixed::FixedPoint;
use crate::heap::{GlobalHeapAccess, GlobalHeapSink};
use crate::parse::{address, pad8, Result as ParseResult};

pub const CLASS_FIXED: u8 = 0;
pub const CLASS_FLOAT: u8 = 1;
pub const CLASS_TIME: u8 = 2;
pub const CLASS_STRING: u8 = 3;
pub const CLASS_BITFIELD: u8 = 4;
pub const CLASS_OPAQUE: u8 = 5;
pub const CLASS_COMPOUND: u8 = 6;
pub const CLASS_REFERENCE: u8 = 7;
pub const CLASS_ENUM: u8 = 8;
pub const CLASS_VLEN: u8 = 9;
pub const CLASS_ARRAY: u8 = 10;

/// On-disk size of a variable-length element: length, collection address,
/// object index.
pub const VLEN_POINTER_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    fn is_big(self) -> bool {
        self == ByteOrder::BigEndian
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedInfo {
    pub byte_order: ByteOrder,
    /// Raw lo/hi pad bits from the class bit-field.
    pub padding: u8,
    pub signed: bool,
    pub bit_offset: u16,
    pub bit_precision: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatInfo {
    pub byte_order: ByteOrder,
    pub padding: u8,
    /// 0 none, 1 MSB always set, 2 MSB implied.
    pub mantissa_normalization: u8,
    pub sign_location: u8,
    pub bit_offset: u16,
    pub bit_precision: u16,
    pub exponent_location: u8,
    pub exponent_size: u8,
    pub mantissa_location: u8,
    pub mantissa_size: u8,
    pub exponent_bias: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeInfo {
    pub byte_order: ByteOrder,
    pub bit_precision: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringPadding {
    NullTerminate,
    NullPad,
    SpacePad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Ascii,
    Utf8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringInfo {
    pub padding: StringPadding,
    pub character_set: CharacterSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitFieldInfo {
    pub byte_order: ByteOrder,
    pub padding: u8,
    pub bit_offset: u16,
    pub bit_precision: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueInfo {
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundMember {
    pub name: String,
    pub byte_offset: u64,
    /// Version-1 members may carry array dimensions; empty otherwise.
    pub dims: Vec<u32>,
    pub datatype: Datatype,
}

impl CompoundMember {
    /// Total stored size of this member, including v1 array dimensions.
    pub fn stored_size(&self) -> u64 {
        let n: u64 = self.dims.iter().map(|&d| u64::from(d)).product::<u64>().max(1);
        if self.dims.is_empty() {
            self.datatype.size_in_bytes()
        } else {
            n * self.datatype.size_in_bytes()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundInfo {
    pub members: Vec<CompoundMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Object,
    Region,
    Attribute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceInfo {
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub base: Box<Datatype>,
    pub names: Vec<String>,
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VlenInfo {
    /// 0 = sequence, 1 = string.
    pub kind: u8,
    pub padding: u8,
    pub character_set: u8,
    pub base: Box<Datatype>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    pub dims: Vec<u32>,
    pub base: Box<Datatype>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatatypeClass {
    Fixed(FixedInfo),
    Float(FloatInfo),
    Time(TimeInfo),
    String(StringInfo),
    BitField(BitFieldInfo),
    Opaque(OpaqueInfo),
    Compound(CompoundInfo),
    Reference(ReferenceInfo),
    Enum(EnumInfo),
    Vlen(VlenInfo),
    Array(ArrayInfo),
}

/// A parsed or constructed HDF5 datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct Datatype {
    pub version: u8,
    pub size: u32,
    pub class: DatatypeClass,
}

/// A decoded element, independent of any native struct layout.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bits(Vec<u8>),
    Opaque(Vec<u8>),
    Compound(Vec<(String, DynamicValue)>),
    Reference(u64),
    RegionReference { address: u64, index: u32 },
    Enum(String, i64),
    Vlen(Vec<DynamicValue>),
    Array(Vec<DynamicValue>),
    Time(u64),
}

// ---------------------------------------------------------------------------
// Parsing

fn byte_order_bit(bitfield: u32) -> ByteOrder {
    if bitfield & 1 == 0 {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    }
}

/// Read a NUL-terminated name, consuming the terminator.
fn nul_string(input: &[u8]) -> ParseResult<String> {
    let (input, bytes) = take_till(|b| b == 0)(input)?;
    let (input, _) = tag([0])(input)?;
    Ok((input, String::from_utf8_lossy(bytes).into_owned()))
}

/// Read a NUL-terminated name padded to a multiple of eight bytes.
fn padded_nul_string(input: &[u8]) -> ParseResult<String> {
    let (rest, name) = nul_string(input)?;
    let padding = pad8(name.len() + 1) - (name.len() + 1);
    let (rest, _) = take(padding)(rest)?;
    Ok((rest, name))
}

/// The minimal stored width for a v3 compound member offset, as a function
/// of the compound's total size.
fn member_offset_width(size: u32) -> u8 {
    if size < 1 << 8 {
        1
    } else if size < 1 << 16 {
        2
    } else if size < 1 << 24 {
        3
    } else {
        4
    }
}

fn compound_member<'a>(input: &'a [u8], version: u8, size: u32) -> ParseResult<'a, CompoundMember> {
    match version {
        1 => {
            let (input, name) = padded_nul_string(input)?;
            let (input, byte_offset) = le_u32(input)?;
            let (input, dimensionality) = le_u8(input)?;
            let (input, _) = take(3usize)(input)?;
            let (input, _permutation) = le_u32(input)?;
            let (input, _) = take(4usize)(input)?;
            let (input, raw_dims) = count(le_u32, 4)(input)?;
            let (input, datatype) = datatype(input)?;
            Ok((
                input,
                CompoundMember {
                    name,
                    byte_offset: u64::from(byte_offset),
                    dims: raw_dims[..dimensionality as usize].to_vec(),
                    datatype,
                },
            ))
        }
        2 => {
            let (input, name) = padded_nul_string(input)?;
            let (input, byte_offset) = le_u32(input)?;
            let (input, datatype) = datatype(input)?;
            Ok((
                input,
                CompoundMember {
                    name,
                    byte_offset: u64::from(byte_offset),
                    dims: Vec::new(),
                    datatype,
                },
            ))
        }
        _ => {
            let (input, name) = nul_string(input)?;
            let (input, byte_offset) = address(member_offset_width(size))(input)?;
            let (input, datatype) = datatype(input)?;
            Ok((
                input,
                CompoundMember {
                    name,
                    byte_offset,
                    dims: Vec::new(),
                    datatype,
                },
            ))
        }
    }
}

/// Parse a datatype message body.
pub fn datatype(input: &[u8]) -> ParseResult<Datatype> {
    context("datatype", |input| {
        let (input, class_and_version) = le_u8(input)?;
        let version = class_and_version >> 4;
        let raw_class = class_and_version & 0x0F;
        let (input, b0) = le_u8(input)?;
        let (input, b1) = le_u8(input)?;
        let (input, b2) = le_u8(input)?;
        let bitfield = u32::from(b0) | u32::from(b1) << 8 | u32::from(b2) << 16;
        let (input, size) = le_u32(input)?;

        let (input, class) = match raw_class {
            CLASS_FIXED => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                (
                    input,
                    DatatypeClass::Fixed(FixedInfo {
                        byte_order: byte_order_bit(bitfield),
                        padding: ((bitfield >> 1) & 0b11) as u8,
                        signed: bitfield & 0b1000 != 0,
                        bit_offset,
                        bit_precision,
                    }),
                )
            }
            CLASS_FLOAT => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                let (input, exponent_location) = le_u8(input)?;
                let (input, exponent_size) = le_u8(input)?;
                let (input, mantissa_location) = le_u8(input)?;
                let (input, mantissa_size) = le_u8(input)?;
                let (input, exponent_bias) = le_u32(input)?;
                (
                    input,
                    DatatypeClass::Float(FloatInfo {
                        byte_order: byte_order_bit(bitfield),
                        padding: ((bitfield >> 1) & 0b111) as u8,
                        mantissa_normalization: ((bitfield >> 4) & 0b11) as u8,
                        sign_location: ((bitfield >> 8) & 0xFF) as u8,
                        bit_offset,
                        bit_precision,
                        exponent_location,
                        exponent_size,
                        mantissa_location,
                        mantissa_size,
                        exponent_bias,
                    }),
                )
            }
            CLASS_TIME => {
                let (input, bit_precision) = le_u16(input)?;
                (
                    input,
                    DatatypeClass::Time(TimeInfo {
                        byte_order: byte_order_bit(bitfield),
                        bit_precision,
                    }),
                )
            }
            CLASS_STRING => {
                let padding = match bitfield & 0x0F {
                    0 => StringPadding::NullTerminate,
                    1 => StringPadding::NullPad,
                    _ => StringPadding::SpacePad,
                };
                let character_set = if (bitfield >> 4) & 0x0F == 1 {
                    CharacterSet::Utf8
                } else {
                    CharacterSet::Ascii
                };
                (
                    input,
                    DatatypeClass::String(StringInfo {
                        padding,
                        character_set,
                    }),
                )
            }
            CLASS_BITFIELD => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                (
                    input,
                    DatatypeClass::BitField(BitFieldInfo {
                        byte_order: byte_order_bit(bitfield),
                        padding: ((bitfield >> 1) & 0b11) as u8,
                        bit_offset,
                        bit_precision,
                    }),
                )
            }
            CLASS_OPAQUE => {
                let tag_len = (bitfield & 0xFF) as usize;
                let (input, tag_bytes) = take(tag_len)(input)?;
                let end = tag_bytes.iter().position(|&b| b == 0).unwrap_or(tag_len);
                let tag = String::from_utf8_lossy(&tag_bytes[..end]).into_owned();
                (input, DatatypeClass::Opaque(OpaqueInfo { tag }))
            }
            CLASS_COMPOUND => {
                let n_members = (bitfield & 0xFFFF) as usize;
                let mut members = Vec::with_capacity(n_members);
                let mut rest = input;
                for _ in 0..n_members {
                    let (r, member) = compound_member(rest, version, size)?;
                    members.push(member);
                    rest = r;
                }
                (rest, DatatypeClass::Compound(CompoundInfo { members }))
            }
            CLASS_REFERENCE => {
                let kind = match bitfield & 0x0F {
                    0 => ReferenceKind::Object,
                    1 => ReferenceKind::Region,
                    _ => ReferenceKind::Attribute,
                };
                (input, DatatypeClass::Reference(ReferenceInfo { kind }))
            }
            CLASS_ENUM => {
                let n_members = (bitfield & 0xFFFF) as usize;
                let (input, base) = datatype(input)?;
                let mut names = Vec::with_capacity(n_members);
                let mut rest = input;
                for _ in 0..n_members {
                    let (r, name) = if version >= 3 {
                        nul_string(rest)?
                    } else {
                        padded_nul_string(rest)?
                    };
                    names.push(name);
                    rest = r;
                }
                let base_size = base.size as usize;
                let mut values = Vec::with_capacity(n_members);
                for _ in 0..n_members {
                    let (r, raw) = take(base_size)(rest)?;
                    values.push(decode_enum_raw(&base, raw));
                    rest = r;
                }
                (
                    rest,
                    DatatypeClass::Enum(EnumInfo {
                        base: Box::new(base),
                        names,
                        values,
                    }),
                )
            }
            CLASS_VLEN => {
                let (input, base) = datatype(input)?;
                (
                    input,
                    DatatypeClass::Vlen(VlenInfo {
                        kind: (bitfield & 0x0F) as u8,
                        padding: ((bitfield >> 4) & 0x0F) as u8,
                        character_set: ((bitfield >> 8) & 0x0F) as u8,
                        base: Box::new(base),
                    }),
                )
            }
            CLASS_ARRAY => {
                let (input, dimensionality) = le_u8(input)?;
                let (input, _) = if version <= 2 {
                    take(3usize)(input)?
                } else {
                    (input, &input[..0])
                };
                let (input, dims) = count(le_u32, dimensionality as usize)(input)?;
                // Version 2 stores permutation indices, which were never used.
                let input = if version <= 2 {
                    count(le_u32, dimensionality as usize)(input)?.0
                } else {
                    input
                };
                let (input, base) = datatype(input)?;
                (
                    input,
                    DatatypeClass::Array(ArrayInfo {
                        dims,
                        base: Box::new(base),
                    }),
                )
            }
            _ => {
                return Err(nom::Err::Failure(nom::error::VerboseError {
                    errors: vec![(
                        input,
                        nom::error::VerboseErrorKind::Context("datatype class"),
                    )],
                }))
            }
        };

        Ok((
            input,
            Datatype {
                version,
                size,
                class,
            },
        ))
    })(input)
}

fn decode_enum_raw(base: &Datatype, raw: &[u8]) -> i64 {
    let signed = matches!(&base.class, DatatypeClass::Fixed(f) if f.signed);
    let big = matches!(
        &base.class,
        DatatypeClass::Fixed(f) if f.byte_order == ByteOrder::BigEndian
    );
    let mut value = 0u64;
    for (i, &b) in raw.iter().take(8).enumerate() {
        let shift = if big { 8 * (raw.len().min(8) - 1 - i) } else { 8 * i };
        value |= u64::from(b) << shift;
    }
    if signed && !raw.is_empty() {
        let bits = 8 * raw.len().min(8) as u32;
        if bits < 64 && value >> (bits - 1) != 0 {
            return (value | !((1u64 << bits) - 1)) as i64;
        }
    }
    value as i64
}

// ---------------------------------------------------------------------------
// Serialization

impl Datatype {
    pub fn class_code(&self) -> u8 {
        match &self.class {
            DatatypeClass::Fixed(_) => CLASS_FIXED,
            DatatypeClass::Float(_) => CLASS_FLOAT,
            DatatypeClass::Time(_) => CLASS_TIME,
            DatatypeClass::String(_) => CLASS_STRING,
            DatatypeClass::BitField(_) => CLASS_BITFIELD,
            DatatypeClass::Opaque(_) => CLASS_OPAQUE,
            DatatypeClass::Compound(_) => CLASS_COMPOUND,
            DatatypeClass::Reference(_) => CLASS_REFERENCE,
            DatatypeClass::Enum(_) => CLASS_ENUM,
            DatatypeClass::Vlen(_) => CLASS_VLEN,
            DatatypeClass::Array(_) => CLASS_ARRAY,
        }
    }

    fn bitfield_flags(&self) -> u32 {
        match &self.class {
            DatatypeClass::Fixed(f) => {
                let mut bits = 0;
                if f.byte_order.is_big() {
                    bits |= 1;
                }
                bits |= u32::from(f.padding & 0b11) << 1;
                if f.signed {
                    bits |= 0b1000;
                }
                bits
            }
            DatatypeClass::Float(f) => {
                let mut bits = 0;
                if f.byte_order.is_big() {
                    bits |= 1;
                }
                bits |= u32::from(f.padding & 0b111) << 1;
                bits |= u32::from(f.mantissa_normalization & 0b11) << 4;
                bits |= u32::from(f.sign_location) << 8;
                bits
            }
            DatatypeClass::Time(t) => {
                if t.byte_order.is_big() {
                    1
                } else {
                    0
                }
            }
            DatatypeClass::String(s) => {
                let padding = match s.padding {
                    StringPadding::NullTerminate => 0,
                    StringPadding::NullPad => 1,
                    StringPadding::SpacePad => 2,
                };
                let charset = match s.character_set {
                    CharacterSet::Ascii => 0,
                    CharacterSet::Utf8 => 1,
                };
                padding | charset << 4
            }
            DatatypeClass::BitField(b) => {
                let mut bits = 0;
                if b.byte_order.is_big() {
                    bits |= 1;
                }
                bits |= u32::from(b.padding & 0b11) << 1;
                bits
            }
            DatatypeClass::Opaque(o) => pad8(o.tag.len() + 1) as u32,
            DatatypeClass::Compound(c) => c.members.len() as u32,
            DatatypeClass::Reference(r) => match r.kind {
                ReferenceKind::Object => 0,
                ReferenceKind::Region => 1,
                ReferenceKind::Attribute => 2,
            },
            DatatypeClass::Enum(e) => e.names.len() as u32,
            DatatypeClass::Vlen(v) => {
                u32::from(v.kind) | u32::from(v.padding) << 4 | u32::from(v.character_set) << 8
            }
            DatatypeClass::Array(_) => 0,
        }
    }

    /// Serialize the datatype message body, the byte-for-byte inverse of
    /// [`datatype`].
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push((self.version << 4) | self.class_code());
        let bits = self.bitfield_flags();
        out.push(bits as u8);
        out.push((bits >> 8) as u8);
        out.push((bits >> 16) as u8);
        out.extend_from_slice(&self.size.to_le_bytes());

        match &self.class {
            DatatypeClass::Fixed(f) => {
                out.extend_from_slice(&f.bit_offset.to_le_bytes());
                out.extend_from_slice(&f.bit_precision.to_le_bytes());
            }
            DatatypeClass::Float(f) => {
                out.extend_from_slice(&f.bit_offset.to_le_bytes());
                out.extend_from_slice(&f.bit_precision.to_le_bytes());
                out.push(f.exponent_location);
                out.push(f.exponent_size);
                out.push(f.mantissa_location);
                out.push(f.mantissa_size);
                out.extend_from_slice(&f.exponent_bias.to_le_bytes());
            }
            DatatypeClass::Time(t) => {
                out.extend_from_slice(&t.bit_precision.to_le_bytes());
            }
            DatatypeClass::String(_) => {}
            DatatypeClass::BitField(b) => {
                out.extend_from_slice(&b.bit_offset.to_le_bytes());
                out.extend_from_slice(&b.bit_precision.to_le_bytes());
            }
            DatatypeClass::Opaque(o) => {
                let padded = pad8(o.tag.len() + 1);
                out.extend_from_slice(o.tag.as_bytes());
                out.resize(out.len() + padded - o.tag.len(), 0);
            }
            DatatypeClass::Compound(c) => {
                for member in &c.members {
                    self.serialize_member(member, out);
                }
            }
            DatatypeClass::Reference(_) => {}
            DatatypeClass::Enum(e) => {
                e.base.serialize(out);
                for name in &e.names {
                    if self.version >= 3 {
                        out.extend_from_slice(name.as_bytes());
                        out.push(0);
                    } else {
                        push_padded_name(out, name);
                    }
                }
                for &value in &e.values {
                    push_int_raw(out, &e.base, value);
                }
            }
            DatatypeClass::Vlen(v) => {
                v.base.serialize(out);
            }
            DatatypeClass::Array(a) => {
                out.push(a.dims.len() as u8);
                if self.version <= 2 {
                    out.extend_from_slice(&[0, 0, 0]);
                }
                for &dim in &a.dims {
                    out.extend_from_slice(&dim.to_le_bytes());
                }
                if self.version <= 2 {
                    for _ in &a.dims {
                        out.extend_from_slice(&0u32.to_le_bytes());
                    }
                }
                a.base.serialize(out);
            }
        }
    }

    fn serialize_member(&self, member: &CompoundMember, out: &mut Vec<u8>) {
        match self.version {
            1 => {
                push_padded_name(out, &member.name);
                out.extend_from_slice(&(member.byte_offset as u32).to_le_bytes());
                out.push(member.dims.len() as u8);
                out.extend_from_slice(&[0, 0, 0]);
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                for i in 0..4 {
                    let dim = member.dims.get(i).copied().unwrap_or(0);
                    out.extend_from_slice(&dim.to_le_bytes());
                }
                member.datatype.serialize(out);
            }
            2 => {
                push_padded_name(out, &member.name);
                out.extend_from_slice(&(member.byte_offset as u32).to_le_bytes());
                member.datatype.serialize(out);
            }
            _ => {
                out.extend_from_slice(member.name.as_bytes());
                out.push(0);
                let width = member_offset_width(self.size);
                for i in 0..width {
                    out.push((member.byte_offset >> (8 * u32::from(i))) as u8);
                }
                member.datatype.serialize(out);
            }
        }
    }

    /// Size of the serialized message body.
    pub fn serialized_size(&self) -> usize {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        buf.len()
    }
}

fn push_padded_name(out: &mut Vec<u8>, name: &str) {
    let padded = pad8(name.len() + 1);
    out.extend_from_slice(name.as_bytes());
    out.resize(out.len() + padded - name.len(), 0);
}

fn push_int_raw(out: &mut Vec<u8>, base: &Datatype, value: i64) {
    let size = base.size as usize;
    let big = matches!(
        &base.class,
        DatatypeClass::Fixed(f) if f.byte_order == ByteOrder::BigEndian
    );
    for i in 0..size {
        let shift = if big { 8 * (size - 1 - i) } else { 8 * i };
        out.push(if shift < 64 { (value as u64 >> shift) as u8 } else { 0 });
    }
}

// ---------------------------------------------------------------------------
// Constructors and validation

impl Datatype {
    /// Parse a datatype message body from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Datatype> {
        if let Some(&first) = buf.first() {
            if first & 0x0F > CLASS_ARRAY {
                return Err(Hdf5Error::UnsupportedClass(first & 0x0F));
            }
        }
        let (_, dt) = datatype(buf)?;
        Ok(dt)
    }

    pub fn fixed(size: u32, signed: bool) -> Datatype {
        Datatype {
            version: 1,
            size,
            class: DatatypeClass::Fixed(FixedInfo {
                byte_order: ByteOrder::LittleEndian,
                padding: 0,
                signed,
                bit_offset: 0,
                bit_precision: (8 * size) as u16,
            }),
        }
    }

    pub fn float32() -> Datatype {
        Datatype {
            version: 1,
            size: 4,
            class: DatatypeClass::Float(FloatInfo {
                byte_order: ByteOrder::LittleEndian,
                padding: 0,
                mantissa_normalization: 2,
                sign_location: 31,
                bit_offset: 0,
                bit_precision: 32,
                exponent_location: 23,
                exponent_size: 8,
                mantissa_location: 0,
                mantissa_size: 23,
                exponent_bias: 127,
            }),
        }
    }

    pub fn float64() -> Datatype {
        Datatype {
            version: 1,
            size: 8,
            class: DatatypeClass::Float(FloatInfo {
                byte_order: ByteOrder::LittleEndian,
                padding: 0,
                mantissa_normalization: 2,
                sign_location: 63,
                bit_offset: 0,
                bit_precision: 64,
                exponent_location: 52,
                exponent_size: 11,
                mantissa_location: 0,
                mantissa_size: 52,
                exponent_bias: 1023,
            }),
        }
    }

    /// A fixed-length ASCII string, NUL-terminated padding.
    pub fn string(size: u32) -> Datatype {
        Datatype {
            version: 1,
            size,
            class: DatatypeClass::String(StringInfo {
                padding: StringPadding::NullTerminate,
                character_set: CharacterSet::Ascii,
            }),
        }
    }

    pub fn time(size: u32) -> Datatype {
        Datatype {
            version: 1,
            size,
            class: DatatypeClass::Time(TimeInfo {
                byte_order: ByteOrder::LittleEndian,
                bit_precision: (8 * size) as u16,
            }),
        }
    }

    pub fn bitfield(size: u32) -> Datatype {
        Datatype {
            version: 1,
            size,
            class: DatatypeClass::BitField(BitFieldInfo {
                byte_order: ByteOrder::LittleEndian,
                padding: 0,
                bit_offset: 0,
                bit_precision: (8 * size) as u16,
            }),
        }
    }

    pub fn opaque(tag: &str, size: u32) -> Result<Datatype> {
        if !tag.is_ascii() || tag.len() + 1 > 256 {
            return Err(Hdf5Error::BadTag(tag.to_string()));
        }
        Ok(Datatype {
            version: 1,
            size,
            class: DatatypeClass::Opaque(OpaqueInfo {
                tag: tag.to_string(),
            }),
        })
    }

    pub fn object_reference() -> Datatype {
        Datatype {
            version: 1,
            size: 8,
            class: DatatypeClass::Reference(ReferenceInfo {
                kind: ReferenceKind::Object,
            }),
        }
    }

    pub fn region_reference() -> Datatype {
        Datatype {
            version: 1,
            size: 12,
            class: DatatypeClass::Reference(ReferenceInfo {
                kind: ReferenceKind::Region,
            }),
        }
    }

    /// A compound datatype; members are `(name, byte offset, datatype)`.
    pub fn compound(members: Vec<(String, u64, Datatype)>, size: u32) -> Result<Datatype> {
        let dt = Datatype {
            version: 1,
            size,
            class: DatatypeClass::Compound(CompoundInfo {
                members: members
                    .into_iter()
                    .map(|(name, byte_offset, datatype)| CompoundMember {
                        name,
                        byte_offset,
                        dims: Vec::new(),
                        datatype,
                    })
                    .collect(),
            }),
        };
        dt.validate()?;
        Ok(dt)
    }

    pub fn enumeration(base: Datatype, members: Vec<(String, i64)>) -> Result<Datatype> {
        if !matches!(base.class, DatatypeClass::Fixed(_)) {
            return Err(Hdf5Error::TypeMismatch {
                expected: "fixed-point enum base",
                found: format!("class {}", base.class_code()),
            });
        }
        let size = base.size;
        let (names, values) = members.into_iter().unzip();
        Ok(Datatype {
            version: 1,
            size,
            class: DatatypeClass::Enum(EnumInfo {
                base: Box::new(base),
                names,
                values,
            }),
        })
    }

    pub fn vlen(base: Datatype) -> Datatype {
        Datatype {
            version: 1,
            size: VLEN_POINTER_SIZE,
            class: DatatypeClass::Vlen(VlenInfo {
                kind: 0,
                padding: 0,
                character_set: 0,
                base: Box::new(base),
            }),
        }
    }

    pub fn vlen_string() -> Datatype {
        Datatype {
            version: 1,
            size: VLEN_POINTER_SIZE,
            class: DatatypeClass::Vlen(VlenInfo {
                kind: 1,
                padding: 0,
                character_set: 0,
                base: Box::new(Datatype::fixed(1, false)),
            }),
        }
    }

    pub fn array(dims: Vec<u32>, base: Datatype) -> Datatype {
        let n: u32 = dims.iter().product();
        Datatype {
            version: 2,
            size: n * base.size,
            class: DatatypeClass::Array(ArrayInfo {
                dims,
                base: Box::new(base),
            }),
        }
    }

    /// Element size on disk.
    pub fn size_in_bytes(&self) -> u64 {
        u64::from(self.size)
    }

    /// Whether elements indirect into the global heap.
    pub fn requires_global_heap(&self) -> bool {
        match &self.class {
            DatatypeClass::Vlen(_) => true,
            DatatypeClass::Reference(r) => r.kind != ReferenceKind::Object,
            DatatypeClass::Compound(c) => {
                c.members.iter().any(|m| m.datatype.requires_global_heap())
            }
            DatatypeClass::Array(a) => a.base.requires_global_heap(),
            _ => false,
        }
    }

    /// Check the structural invariants that cannot be encoded in the types:
    /// compound members must not overlap and must fit the declared size.
    pub fn validate(&self) -> Result<()> {
        if let DatatypeClass::Compound(c) = &self.class {
            let mut spans: Vec<(u64, u64, &str)> = c
                .members
                .iter()
                .map(|m| (m.byte_offset, m.byte_offset + m.stored_size(), m.name.as_str()))
                .collect();
            spans.sort();
            for window in spans.windows(2) {
                if window[0].1 > window[1].0 {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "compound members {:?} and {:?} overlap",
                        window[0].2, window[1].2
                    )));
                }
            }
            for (start, end, name) in &spans {
                let _ = start;
                if *end > self.size_in_bytes() {
                    return Err(Hdf5Error::CorruptStructure(format!(
                        "compound member {:?} extends past the compound size",
                        name
                    )));
                }
            }
            for member in &c.members {
                member.datatype.validate()?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Element decoding

fn assemble_bits(bytes: &[u8], big_endian: bool) -> u64 {
    let n = bytes.len().min(8);
    let mut raw = 0u64;
    for i in 0..n {
        let shift = if big_endian { 8 * (n - 1 - i) } else { 8 * i };
        raw |= u64::from(bytes[i]) << shift;
    }
    raw
}

fn decode_fixed(info: &FixedInfo, size: u32, bytes: &[u8]) -> Result<DynamicValue> {
    let fp = FixedPoint::read(
        bytes,
        size as usize,
        info.bit_offset,
        info.bit_precision,
        info.signed,
        info.byte_order.is_big(),
    )?;
    if info.signed {
        Ok(DynamicValue::Int(fp.to_integer::<i64>()?))
    } else {
        Ok(DynamicValue::Uint(fp.to_integer::<u64>()?))
    }
}

fn is_ieee_f64(info: &FloatInfo) -> bool {
    info.exponent_size == 11
        && info.mantissa_size == 52
        && info.exponent_location == 52
        && info.mantissa_location == 0
        && info.sign_location == 63
        && info.exponent_bias == 1023
}

fn is_ieee_f32(info: &FloatInfo) -> bool {
    info.exponent_size == 8
        && info.mantissa_size == 23
        && info.exponent_location == 23
        && info.mantissa_location == 0
        && info.sign_location == 31
        && info.exponent_bias == 127
}

fn decode_float(info: &FloatInfo, size: u32, bytes: &[u8]) -> Result<DynamicValue> {
    if size == 8 && is_ieee_f64(info) {
        let raw = assemble_bits(&bytes[..8], info.byte_order.is_big());
        return Ok(DynamicValue::Float(f64::from_bits(raw)));
    }
    if size == 4 && is_ieee_f32(info) {
        let raw = assemble_bits(&bytes[..4], info.byte_order.is_big()) as u32;
        return Ok(DynamicValue::Float(f64::from(f32::from_bits(raw))));
    }
    if size > 8 {
        return Err(Hdf5Error::UnknownConverter("wide floating-point"));
    }

    // A non-IEEE layout: reconstruct from the declared field positions.
    let raw = assemble_bits(&bytes[..size as usize], info.byte_order.is_big());
    let exp_mask = (1u64 << info.exponent_size) - 1;
    let man_mask = if info.mantissa_size >= 64 {
        u64::MAX
    } else {
        (1u64 << info.mantissa_size) - 1
    };
    let sign = (raw >> info.sign_location) & 1;
    let exponent = (raw >> info.exponent_location) & exp_mask;
    let mantissa = (raw >> info.mantissa_location) & man_mask;
    let scale = (2.0f64).powi(-i32::from(info.mantissa_size));
    let magnitude = if exponent == 0 && mantissa == 0 {
        0.0
    } else if exponent == exp_mask {
        if mantissa == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        let unbiased = exponent as i64 - i64::from(info.exponent_bias);
        let significand = match info.mantissa_normalization {
            2 => {
                if exponent == 0 {
                    mantissa as f64 * scale
                } else {
                    1.0 + mantissa as f64 * scale
                }
            }
            1 => mantissa as f64 * scale * 2.0,
            _ => mantissa as f64,
        };
        significand * (2.0f64).powi(unbiased as i32)
    };
    Ok(DynamicValue::Float(if sign == 1 { -magnitude } else { magnitude }))
}

fn decode_string(info: &StringInfo, bytes: &[u8]) -> Result<DynamicValue> {
    let trimmed: &[u8] = match info.padding {
        StringPadding::NullTerminate | StringPadding::NullPad => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            &bytes[..end]
        }
        StringPadding::SpacePad => {
            let end = bytes
                .iter()
                .rposition(|&b| b != b' ')
                .map(|p| p + 1)
                .unwrap_or(0);
            &bytes[..end]
        }
    };
    match info.character_set {
        CharacterSet::Ascii => {
            if !trimmed.is_ascii() {
                return Err(Hdf5Error::InvalidEncoding(
                    "non-ASCII bytes in an ASCII string".to_string(),
                ));
            }
            Ok(DynamicValue::Str(
                String::from_utf8_lossy(trimmed).into_owned(),
            ))
        }
        CharacterSet::Utf8 => String::from_utf8(trimmed.to_vec())
            .map(DynamicValue::Str)
            .map_err(|e| Hdf5Error::InvalidEncoding(e.to_string())),
    }
}

fn converter_fixed(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    match &dt.class {
        DatatypeClass::Fixed(info) => decode_fixed(info, dt.size, bytes),
        _ => Err(Hdf5Error::UnknownConverter("fixed-point")),
    }
}

fn converter_float(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    match &dt.class {
        DatatypeClass::Float(info) => decode_float(info, dt.size, bytes),
        _ => Err(Hdf5Error::UnknownConverter("floating-point")),
    }
}

fn converter_time(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    match &dt.class {
        DatatypeClass::Time(info) => Ok(DynamicValue::Time(assemble_bits(
            &bytes[..dt.size as usize],
            info.byte_order.is_big(),
        ))),
        _ => Err(Hdf5Error::UnknownConverter("time")),
    }
}

fn converter_string(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    match &dt.class {
        DatatypeClass::String(info) => decode_string(info, &bytes[..dt.size as usize]),
        _ => Err(Hdf5Error::UnknownConverter("string")),
    }
}

fn converter_bitfield(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    Ok(DynamicValue::Bits(bytes[..dt.size as usize].to_vec()))
}

fn converter_opaque(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    Ok(DynamicValue::Opaque(bytes[..dt.size as usize].to_vec()))
}

fn converter_compound(
    registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    let info = match &dt.class {
        DatatypeClass::Compound(info) => info,
        _ => return Err(Hdf5Error::UnknownConverter("compound")),
    };
    let mut fields = Vec::with_capacity(info.members.len());
    for member in &info.members {
        let start = member.byte_offset as usize;
        let end = start + member.stored_size() as usize;
        if end > bytes.len() {
            return Err(Hdf5Error::CorruptStructure(format!(
                "compound member {:?} extends past the element",
                member.name
            )));
        }
        let value = if member.dims.is_empty() {
            registry.decode(&member.datatype, &bytes[start..end], heap)?
        } else {
            let element = member.datatype.size as usize;
            let mut items = Vec::new();
            for chunk in bytes[start..end].chunks(element) {
                items.push(registry.decode(&member.datatype, chunk, heap)?);
            }
            DynamicValue::Array(items)
        };
        fields.push((member.name.clone(), value));
    }
    Ok(DynamicValue::Compound(fields))
}

fn converter_reference(
    _registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    _heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    let info = match &dt.class {
        DatatypeClass::Reference(info) => info,
        _ => return Err(Hdf5Error::UnknownConverter("reference")),
    };
    match info.kind {
        ReferenceKind::Object => Ok(DynamicValue::Reference(assemble_bits(&bytes[..8], false))),
        _ => {
            let address = assemble_bits(&bytes[..8], false);
            let index = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            Ok(DynamicValue::RegionReference { address, index })
        }
    }
}

fn converter_enum(
    registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    let info = match &dt.class {
        DatatypeClass::Enum(info) => info,
        _ => return Err(Hdf5Error::UnknownConverter("enum")),
    };
    let raw = match registry.decode(&info.base, bytes, heap)? {
        DynamicValue::Int(v) => v,
        DynamicValue::Uint(v) => v as i64,
        other => {
            return Err(Hdf5Error::TypeMismatch {
                expected: "integer enum base",
                found: format!("{:?}", other),
            })
        }
    };
    match info.values.iter().position(|&v| v == raw) {
        Some(i) => Ok(DynamicValue::Enum(info.names[i].clone(), raw)),
        None => Err(Hdf5Error::CorruptStructure(format!(
            "enum value {} has no named member",
            raw
        ))),
    }
}

fn converter_vlen(
    registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    let info = match &dt.class {
        DatatypeClass::Vlen(info) => info,
        _ => return Err(Hdf5Error::UnknownConverter("variable-length")),
    };
    if bytes.len() < VLEN_POINTER_SIZE as usize {
        return Err(Hdf5Error::TruncatedBuffer {
            needed: VLEN_POINTER_SIZE as usize,
            available: bytes.len(),
        });
    }
    let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let address = assemble_bits(&bytes[4..12], false);
    let index = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    let heap = heap.ok_or(Hdf5Error::UnknownConverter(
        "variable-length data without a global heap",
    ))?;
    let data = heap.object(address, index)?;

    if info.kind == 1 {
        let text = String::from_utf8(data)
            .map_err(|e| Hdf5Error::InvalidEncoding(e.to_string()))?;
        return Ok(DynamicValue::Str(text));
    }
    let element = info.base.size as usize;
    let expected = length as usize * element;
    if data.len() < expected {
        return Err(Hdf5Error::CorruptStructure(format!(
            "vlen payload of {} bytes, expected {}",
            data.len(),
            expected
        )));
    }
    let mut items = Vec::with_capacity(length as usize);
    for chunk in data[..expected].chunks(element) {
        items.push(registry.decode(&info.base, chunk, Some(heap))?);
    }
    Ok(DynamicValue::Vlen(items))
}

fn converter_array(
    registry: &Registry,
    dt: &Datatype,
    bytes: &[u8],
    heap: Option<&dyn GlobalHeapAccess>,
) -> Result<DynamicValue> {
    let info = match &dt.class {
        DatatypeClass::Array(info) => info,
        _ => return Err(Hdf5Error::UnknownConverter("array")),
    };
    let n: usize = info.dims.iter().map(|&d| d as usize).product();
    let element = info.base.size as usize;
    let mut items = Vec::with_capacity(n);
    for i in 0..n {
        let start = i * element;
        items.push(registry.decode(&info.base, &bytes[start..start + element], heap)?);
    }
    Ok(DynamicValue::Array(items))
}

/// One element converter; dispatched by datatype class.
pub type Converter =
    fn(&Registry, &Datatype, &[u8], Option<&dyn GlobalHeapAccess>) -> Result<DynamicValue>;

/// The converter registry. One per file object; never process-global.
pub struct Registry {
    converters: HashMap<u8, Converter>,
}

impl Registry {
    pub fn new() -> Registry {
        let mut converters: HashMap<u8, Converter> = HashMap::new();
        converters.insert(CLASS_FIXED, converter_fixed);
        converters.insert(CLASS_FLOAT, converter_float);
        converters.insert(CLASS_TIME, converter_time);
        converters.insert(CLASS_STRING, converter_string);
        converters.insert(CLASS_BITFIELD, converter_bitfield);
        converters.insert(CLASS_OPAQUE, converter_opaque);
        converters.insert(CLASS_COMPOUND, converter_compound);
        converters.insert(CLASS_REFERENCE, converter_reference);
        converters.insert(CLASS_ENUM, converter_enum);
        converters.insert(CLASS_VLEN, converter_vlen);
        converters.insert(CLASS_ARRAY, converter_array);
        Registry { converters }
    }

    /// Replace the converter for a datatype class.
    pub fn register(&mut self, class: u8, converter: Converter) {
        self.converters.insert(class, converter);
    }

    /// Decode one element of `dt` from `bytes`.
    pub fn decode(
        &self,
        dt: &Datatype,
        bytes: &[u8],
        heap: Option<&dyn GlobalHeapAccess>,
    ) -> Result<DynamicValue> {
        if bytes.len() < dt.size as usize {
            return Err(Hdf5Error::TruncatedBuffer {
                needed: dt.size as usize,
                available: bytes.len(),
            });
        }
        let converter = self
            .converters
            .get(&dt.class_code())
            .ok_or(Hdf5Error::UnknownConverter("unregistered datatype class"))?;
        converter(self, dt, bytes, heap)
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

// ---------------------------------------------------------------------------
// Element encoding

impl Datatype {
    /// Encode one element. Variable-length values are spilled through
    /// `heap`; fixed-size classes never touch it.
    pub fn encode_element(
        &self,
        value: &DynamicValue,
        heap: Option<&mut dyn GlobalHeapSink>,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.encode_into(value, &mut out, heap)?;
        Ok(out)
    }

    fn encode_into<'h>(
        &self,
        value: &DynamicValue,
        out: &mut [u8],
        mut heap: Option<&'h mut dyn GlobalHeapSink>,
    ) -> Result<Option<&'h mut dyn GlobalHeapSink>> {
        match (&self.class, value) {
            (DatatypeClass::Fixed(info), DynamicValue::Int(v)) => {
                let fp = FixedPoint::from_integer(
                    i128::from(*v),
                    self.size as usize,
                    info.bit_offset,
                    info.bit_precision,
                    info.signed,
                    info.byte_order.is_big(),
                )?;
                fp.write(out)?;
                Ok(heap)
            }
            (DatatypeClass::Fixed(info), DynamicValue::Uint(v)) => {
                let fp = FixedPoint::from_integer(
                    i128::from(*v),
                    self.size as usize,
                    info.bit_offset,
                    info.bit_precision,
                    info.signed,
                    info.byte_order.is_big(),
                )?;
                fp.write(out)?;
                Ok(heap)
            }
            (DatatypeClass::Float(info), DynamicValue::Float(v)) => {
                if self.size == 8 && is_ieee_f64(info) {
                    write_bits(out, v.to_bits(), 8, info.byte_order.is_big());
                    Ok(heap)
                } else if self.size == 4 && is_ieee_f32(info) {
                    write_bits(out, u64::from((*v as f32).to_bits()), 4, info.byte_order.is_big());
                    Ok(heap)
                } else {
                    Err(Hdf5Error::UnknownConverter("non-IEEE float encoding"))
                }
            }
            (DatatypeClass::Time(info), DynamicValue::Time(v))
            | (DatatypeClass::Time(info), DynamicValue::Uint(v)) => {
                write_bits(out, *v, self.size as usize, info.byte_order.is_big());
                Ok(heap)
            }
            (DatatypeClass::String(info), DynamicValue::Str(s)) => {
                let bytes = s.as_bytes();
                if bytes.len() > self.size as usize {
                    return Err(Hdf5Error::OutOfRange(format!(
                        "string of {} bytes into a {}-byte datatype",
                        bytes.len(),
                        self.size
                    )));
                }
                if info.character_set == CharacterSet::Ascii && !bytes.is_ascii() {
                    return Err(Hdf5Error::InvalidEncoding(
                        "non-ASCII bytes in an ASCII string".to_string(),
                    ));
                }
                out[..bytes.len()].copy_from_slice(bytes);
                let fill = match info.padding {
                    StringPadding::SpacePad => b' ',
                    _ => 0,
                };
                for b in &mut out[bytes.len()..] {
                    *b = fill;
                }
                Ok(heap)
            }
            (DatatypeClass::BitField(_), DynamicValue::Bits(bits)) => {
                if bits.len() != self.size as usize {
                    return Err(Hdf5Error::TypeMismatch {
                        expected: "bit-field of the declared width",
                        found: format!("{} bytes", bits.len()),
                    });
                }
                out.copy_from_slice(bits);
                Ok(heap)
            }
            (DatatypeClass::Opaque(_), DynamicValue::Opaque(bytes)) => {
                if bytes.len() != self.size as usize {
                    return Err(Hdf5Error::TypeMismatch {
                        expected: "opaque data of the declared size",
                        found: format!("{} bytes", bytes.len()),
                    });
                }
                out.copy_from_slice(bytes);
                Ok(heap)
            }
            (DatatypeClass::Compound(info), DynamicValue::Compound(fields)) => {
                for member in &info.members {
                    let value = fields
                        .iter()
                        .find(|(name, _)| name == &member.name)
                        .map(|(_, v)| v)
                        .ok_or_else(|| Hdf5Error::TypeMismatch {
                            expected: "a value for every compound member",
                            found: format!("missing {:?}", member.name),
                        })?;
                    let start = member.byte_offset as usize;
                    let end = start + member.stored_size() as usize;
                    heap = member
                        .datatype
                        .encode_into(value, &mut out[start..end], heap)?;
                }
                Ok(heap)
            }
            (DatatypeClass::Reference(info), DynamicValue::Reference(addr)) => {
                if info.kind != ReferenceKind::Object {
                    return Err(Hdf5Error::TypeMismatch {
                        expected: "an object reference",
                        found: "region reference value".to_string(),
                    });
                }
                write_bits(out, *addr, 8, false);
                Ok(heap)
            }
            (
                DatatypeClass::Reference(_),
                DynamicValue::RegionReference { address, index },
            ) => {
                write_bits(out, *address, 8, false);
                out[8..12].copy_from_slice(&index.to_le_bytes());
                Ok(heap)
            }
            (DatatypeClass::Enum(info), value) => {
                let raw = match value {
                    DynamicValue::Enum(name, _) => {
                        let i = info
                            .names
                            .iter()
                            .position(|n| n == name)
                            .ok_or_else(|| Hdf5Error::TypeMismatch {
                                expected: "a declared enum member",
                                found: name.clone(),
                            })?;
                        info.values[i]
                    }
                    DynamicValue::Int(v) => *v,
                    DynamicValue::Uint(v) => *v as i64,
                    other => {
                        return Err(Hdf5Error::TypeMismatch {
                            expected: "an enum member",
                            found: format!("{:?}", other),
                        })
                    }
                };
                let encoded = if matches!(&info.base.class, DatatypeClass::Fixed(f) if f.signed) {
                    DynamicValue::Int(raw)
                } else {
                    DynamicValue::Uint(raw as u64)
                };
                info.base.encode_into(&encoded, out, heap)
            }
            (DatatypeClass::Vlen(info), value) => {
                let heap = heap.ok_or(Hdf5Error::UnknownConverter(
                    "variable-length data without a global heap",
                ))?;
                let (payload, length) = match (info.kind, value) {
                    (1, DynamicValue::Str(s)) => (s.as_bytes().to_vec(), s.len() as u32),
                    (_, DynamicValue::Vlen(items)) => {
                        let mut payload = Vec::new();
                        for item in items {
                            payload.extend(info.base.encode_element(item, None)?);
                        }
                        (payload, items.len() as u32)
                    }
                    (_, other) => {
                        return Err(Hdf5Error::TypeMismatch {
                            expected: "a variable-length value",
                            found: format!("{:?}", other),
                        })
                    }
                };
                let (address, index) = heap.put_object(&payload)?;
                out[0..4].copy_from_slice(&length.to_le_bytes());
                write_bits(&mut out[4..12], address, 8, false);
                out[12..16].copy_from_slice(&index.to_le_bytes());
                Ok(Some(heap))
            }
            (DatatypeClass::Array(info), DynamicValue::Array(items)) => {
                let n: usize = info.dims.iter().map(|&d| d as usize).product();
                if items.len() != n {
                    return Err(Hdf5Error::TypeMismatch {
                        expected: "an array of the declared extent",
                        found: format!("{} elements", items.len()),
                    });
                }
                let element = info.base.size as usize;
                for (i, item) in items.iter().enumerate() {
                    heap = info.base.encode_into(
                        item,
                        &mut out[i * element..(i + 1) * element],
                        heap,
                    )?;
                }
                Ok(heap)
            }
            (_, other) => Err(Hdf5Error::TypeMismatch {
                expected: "a value matching the datatype class",
                found: format!("{:?}", other),
            }),
        }
    }
}

fn write_bits(out: &mut [u8], value: u64, size: usize, big_endian: bool) {
    for i in 0..size {
        let shift = if big_endian { 8 * (size - 1 - i) } else { 8 * i };
        out[i] = if shift < 64 { (value >> shift) as u8 } else { 0 };
    }
}

// ---------------------------------------------------------------------------
// Native element types

mod private {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for f32 {}
    impl Sealed for i64 {}
    impl Sealed for i32 {}
    impl Sealed for i16 {}
    impl Sealed for i8 {}
    impl Sealed for u64 {}
    impl Sealed for u32 {}
    impl Sealed for u16 {}
    impl Sealed for u8 {}
}

/// Identifies Rust types that this library can produce from HDF5 types.
pub trait Hdf5Type: private::Sealed + Copy {
    fn dtype() -> Datatype;
    fn from_le_bytes(bytes: &[u8]) -> Self;
    fn to_le_bytes(&self) -> Vec<u8>;
}

macro_rules! fixed_hdf5_type {
    ($($ty:ty, $size:expr, $signed:expr;)*) => {
        $(impl Hdf5Type for $ty {
            fn dtype() -> Datatype {
                Datatype::fixed($size, $signed)
            }
            fn from_le_bytes(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $size as usize];
                buf.copy_from_slice(&bytes[..$size as usize]);
                <$ty>::from_le_bytes(buf)
            }
            fn to_le_bytes(&self) -> Vec<u8> {
                <$ty>::to_le_bytes(*self).to_vec()
            }
        })*
    };
}

fixed_hdf5_type! {
    i8, 1, true;
    i16, 2, true;
    i32, 4, true;
    i64, 8, true;
    u8, 1, false;
    u16, 2, false;
    u32, 4, false;
    u64, 8, false;
}

impl Hdf5Type for f32 {
    fn dtype() -> Datatype {
        Datatype::float32()
    }
    fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(buf)
    }
    fn to_le_bytes(&self) -> Vec<u8> {
        f32::to_le_bytes(*self).to_vec()
    }
}

impl Hdf5Type for f64 {
    fn dtype() -> Datatype {
        Datatype::float64()
    }
    fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }
    fn to_le_bytes(&self) -> Vec<u8> {
        f64::to_le_bytes(*self).to_vec()
    }
}

impl Datatype {
    /// Whether elements of this datatype can be read directly as `T`.
    pub fn admits<T: Hdf5Type>(&self) -> bool {
        let want = T::dtype();
        if self.size != want.size {
            return false;
        }
        match (&self.class, &want.class) {
            (DatatypeClass::Fixed(have), DatatypeClass::Fixed(w)) => {
                have.signed == w.signed
                    && have.byte_order == ByteOrder::LittleEndian
                    && have.bit_offset == 0
                    && u32::from(have.bit_precision) == 8 * self.size
            }
            (DatatypeClass::Float(have), DatatypeClass::Float(_)) => {
                have.byte_order == ByteOrder::LittleEndian
                    && ((self.size == 8 && is_ieee_f64(have))
                        || (self.size == 4 && is_ieee_f32(have)))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(dt: &Datatype) -> Datatype {
        let mut buf = Vec::new();
        dt.serialize(&mut buf);
        // Streaming parsers want the buffer to outlive the parse.
        buf.extend_from_slice(&[0u8; 8]);
        let (_, parsed) = datatype(&buf).unwrap();
        parsed
    }

    #[test]
    fn fixed_parse_serialize_stability() {
        for &(size, signed) in &[(1u32, true), (2, false), (4, true), (8, false)] {
            let dt = Datatype::fixed(size, signed);
            assert_eq!(round_trip(&dt), dt);
        }
    }

    #[test]
    fn float_parse_serialize_stability() {
        assert_eq!(round_trip(&Datatype::float32()), Datatype::float32());
        assert_eq!(round_trip(&Datatype::float64()), Datatype::float64());
    }

    #[test]
    fn compound_parse_serialize_stability() {
        let dt = Datatype::compound(
            vec![
                ("id".to_string(), 0, Datatype::fixed(8, false)),
                ("orig".to_string(), 8, Datatype::string(2)),
                ("dest".to_string(), 10, Datatype::string(2)),
                ("weight".to_string(), 12, Datatype::fixed(2, false)),
            ],
            16,
        )
        .unwrap();
        assert_eq!(round_trip(&dt), dt);
    }

    #[test]
    fn enum_and_array_stability() {
        let base = Datatype::fixed(2, true);
        let dt = Datatype::enumeration(
            base,
            vec![("LOW".to_string(), -1), ("HIGH".to_string(), 7)],
        )
        .unwrap();
        assert_eq!(round_trip(&dt), dt);

        let arr = Datatype::array(vec![2, 3], Datatype::float32());
        assert_eq!(round_trip(&arr), arr);
    }

    #[test]
    fn vlen_and_opaque_stability() {
        let dt = Datatype::vlen(Datatype::fixed(4, true));
        assert_eq!(round_trip(&dt), dt);
        let dt = Datatype::vlen_string();
        assert_eq!(round_trip(&dt), dt);
        let dt = Datatype::opaque("sensor-frame", 32).unwrap();
        assert_eq!(round_trip(&dt), dt);
    }

    #[test]
    fn scalar_value_round_trips() {
        let registry = Registry::new();

        let dt = Datatype::fixed(4, true);
        let bytes = dt.encode_element(&DynamicValue::Int(-77), None).unwrap();
        assert_eq!(registry.decode(&dt, &bytes, None).unwrap(), DynamicValue::Int(-77));

        let dt = Datatype::float64();
        let bytes = dt.encode_element(&DynamicValue::Float(3.125), None).unwrap();
        assert_eq!(
            registry.decode(&dt, &bytes, None).unwrap(),
            DynamicValue::Float(3.125)
        );

        let dt = Datatype::string(8);
        let bytes = dt
            .encode_element(&DynamicValue::Str("abc".to_string()), None)
            .unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(
            registry.decode(&dt, &bytes, None).unwrap(),
            DynamicValue::Str("abc".to_string())
        );
    }

    #[test]
    fn string_padding_preserves_declared_size() {
        let dt = Datatype::string(6);
        let bytes = dt
            .encode_element(&DynamicValue::Str("hi".to_string()), None)
            .unwrap();
        assert_eq!(bytes, b"hi\0\0\0\0");
        let decoded = Registry::new().decode(&dt, &bytes, None).unwrap();
        let re_encoded = dt.encode_element(&decoded, None).unwrap();
        assert_eq!(re_encoded.len(), dt.size as usize);
        assert!(dt
            .encode_element(&DynamicValue::Str("too long!".to_string()), None)
            .is_err());
    }

    #[test]
    fn compound_values_round_trip() {
        let registry = Registry::new();
        let dt = Datatype::compound(
            vec![
                ("id".to_string(), 0, Datatype::fixed(8, false)),
                ("orig".to_string(), 8, Datatype::string(2)),
                ("dest".to_string(), 10, Datatype::string(2)),
                ("weight".to_string(), 12, Datatype::fixed(2, false)),
            ],
            16,
        )
        .unwrap();
        let record = DynamicValue::Compound(vec![
            ("id".to_string(), DynamicValue::Uint(7)),
            ("orig".to_string(), DynamicValue::Str("US".to_string())),
            ("dest".to_string(), DynamicValue::Str("CA".to_string())),
            ("weight".to_string(), DynamicValue::Uint(500)),
        ]);
        let bytes = dt.encode_element(&record, None).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(registry.decode(&dt, &bytes, None).unwrap(), record);
    }

    #[test]
    fn compound_overlap_is_rejected() {
        let result = Datatype::compound(
            vec![
                ("a".to_string(), 0, Datatype::fixed(8, false)),
                ("b".to_string(), 4, Datatype::fixed(4, false)),
            ],
            12,
        );
        assert!(result.is_err());

        let result = Datatype::compound(
            vec![("a".to_string(), 8, Datatype::fixed(8, false))],
            12,
        );
        assert!(result.is_err());
    }

    #[test]
    fn enum_values_round_trip() {
        let registry = Registry::new();
        let dt = Datatype::enumeration(
            Datatype::fixed(2, true),
            vec![("OFF".to_string(), 0), ("ON".to_string(), 1)],
        )
        .unwrap();
        let bytes = dt
            .encode_element(&DynamicValue::Enum("ON".to_string(), 1), None)
            .unwrap();
        assert_eq!(
            registry.decode(&dt, &bytes, None).unwrap(),
            DynamicValue::Enum("ON".to_string(), 1)
        );
    }

    #[test]
    fn big_endian_fixed_decodes() {
        let registry = Registry::new();
        let dt = Datatype {
            version: 1,
            size: 2,
            class: DatatypeClass::Fixed(FixedInfo {
                byte_order: ByteOrder::BigEndian,
                padding: 0,
                signed: false,
                bit_offset: 0,
                bit_precision: 16,
            }),
        };
        assert_eq!(
            registry.decode(&dt, &[0x01, 0x02], None).unwrap(),
            DynamicValue::Uint(0x0102)
        );
    }

    #[test]
    fn admits_checks_class_and_width() {
        assert!(Datatype::fixed(4, true).admits::<i32>());
        assert!(!Datatype::fixed(4, true).admits::<u32>());
        assert!(!Datatype::fixed(2, true).admits::<i32>());
        assert!(Datatype::float64().admits::<f64>());
        assert!(!Datatype::float64().admits::<f32>());
        assert!(!Datatype::string(4).admits::<u32>());
    }
}
