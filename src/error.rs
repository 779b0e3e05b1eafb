use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Hdf5Error>;

#[derive(Debug)]
pub enum Hdf5Error {
    Io(std::io::Error),
    /// A nom parser rejected the input; carries the parser context chain.
    Parse(String),
    /// Wrong magic bytes where a structure signature was expected.
    BadSignature {
        expected: &'static str,
        address: u64,
    },
    /// Superblock or object-header version outside the supported set.
    UnsupportedVersion {
        structure: &'static str,
        version: u8,
    },
    /// An invariant violation detected while walking the file.
    CorruptStructure(String),
    /// A structure declared a size that exceeds the remaining buffer.
    TruncatedBuffer {
        needed: usize,
        available: usize,
    },
    /// A message type outside the known set, surfaced per the flag policy.
    UnknownMessage {
        message_type: u16,
    },
    /// The caller requested a decoding the stored datatype does not support.
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    /// A numeric conversion would lose information.
    OutOfRange(String),
    /// The writer exceeded a pre-declared maximum file size.
    AllocationExceeded {
        limit: u64,
        requested: u64,
    },
    /// A B-tree node address was reached twice on one descent.
    CyclicBtree {
        address: u64,
    },
    /// A global-heap object reference did not resolve.
    UnreachableHeap {
        address: u64,
        index: u16,
    },
    /// A symbol-table entry points outside its group's structures.
    OrphanedEntry(String),
    /// Bytes that should decode as text or as a declared layout did not.
    InvalidEncoding(String),
    /// A datatype class byte outside 0..=10.
    UnsupportedClass(u8),
    /// An opaque datatype tag that is not NUL-terminated ASCII.
    BadTag(String),
    /// No converter registered for the requested decoding.
    UnknownConverter(&'static str),
    /// Filter id on the read path that the library cannot invert.
    UnsupportedFilter(u16),
    /// The CLI schema input was malformed (collaborator surface).
    Schema(String),
}

impl fmt::Display for Hdf5Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Hdf5Error::*;
        match self {
            Io(e) => write!(f, "I/O error: {}", e),
            Parse(msg) => write!(f, "parse error: {}", msg),
            BadSignature { expected, address } => {
                write!(f, "bad signature, expected {:?} at {:#x}", expected, address)
            }
            UnsupportedVersion { structure, version } => {
                write!(f, "unsupported {} version {}", structure, version)
            }
            CorruptStructure(msg) => write!(f, "corrupt structure: {}", msg),
            TruncatedBuffer { needed, available } => write!(
                f,
                "truncated buffer: needed {} bytes, {} available",
                needed, available
            ),
            UnknownMessage { message_type } => {
                write!(f, "unknown header message type {:#04x}", message_type)
            }
            TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            OutOfRange(msg) => write!(f, "out of range: {}", msg),
            AllocationExceeded { limit, requested } => write!(
                f,
                "allocation exceeded: limit {} bytes, requested {}",
                limit, requested
            ),
            CyclicBtree { address } => {
                write!(f, "cycle in B-tree at node address {:#x}", address)
            }
            UnreachableHeap { address, index } => write!(
                f,
                "global heap object ({:#x}, {}) does not resolve",
                address, index
            ),
            OrphanedEntry(msg) => write!(f, "orphaned entry: {}", msg),
            InvalidEncoding(msg) => write!(f, "invalid encoding: {}", msg),
            UnsupportedClass(class) => write!(f, "unsupported datatype class {}", class),
            BadTag(tag) => write!(f, "bad opaque tag {:?}", tag),
            UnknownConverter(what) => write!(f, "no converter registered for {}", what),
            UnsupportedFilter(id) => write!(f, "unsupported filter id {}", id),
            Schema(msg) => write!(f, "schema error: {}", msg),
        }
    }
}

impl std::error::Error for Hdf5Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Hdf5Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Hdf5Error {
    fn from(e: std::io::Error) -> Self {
        Hdf5Error::Io(e)
    }
}

impl<'a> From<nom::Err<nom::error::VerboseError<&'a [u8]>>> for Hdf5Error {
    fn from(e: nom::Err<nom::error::VerboseError<&'a [u8]>>) -> Self {
        use nom::error::VerboseErrorKind;
        match e {
            nom::Err::Incomplete(nom::Needed::Size(n)) => Hdf5Error::TruncatedBuffer {
                needed: n,
                available: 0,
            },
            nom::Err::Incomplete(nom::Needed::Unknown) => Hdf5Error::TruncatedBuffer {
                needed: 1,
                available: 0,
            },
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let contexts = e
                    .errors
                    .iter()
                    .filter_map(|(_, kind)| match kind {
                        VerboseErrorKind::Context(c) => Some(*c),
                        _ => None,
                    })
                    .rev()
                    .collect::<Vec<_>>();
                Hdf5Error::Parse(contexts.join(" > "))
            }
        }
    }
}
