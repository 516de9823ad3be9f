//! Error types for audit-log and VM-profile analysis.

/// Failures while decoding the msgpack record stream. Offsets are from the
/// start of the audit-log buffer.
#[derive(thiserror::Error, Debug)]
pub enum MsgpackError {
    #[error("unsupported msgpack tag 0x{tag:02x} at byte {offset}")]
    UnsupportedTag { tag: u8, offset: usize },
    #[error("msgpack value truncated at byte {offset}")]
    Truncated { offset: usize },
}

/// Failures while parsing a VM-profile blob or combining profiles.
#[derive(thiserror::Error, Debug)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad VM-profile magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported VM-profile version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("VM-profile blob truncated: expected {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("profile shapes differ: {a_traces}x{a_states} vs {b_traces}x{b_states}")]
    ShapeMismatch {
        a_traces: usize,
        a_states: usize,
        b_traces: usize,
        b_states: usize,
    },
}

/// Failures while loading or querying an audit-log model.
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Msgpack(#[from] MsgpackError),
    #[error(transparent)]
    Dwarf(#[from] birdwatch_dwarf::DwarfError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("audit log carries no DWARF blob (lj_dwarf.dwo)")]
    MissingDwarfBlob,
    #[error("address 0x{0:x} is not covered by the memory map")]
    MissingMemory(u64),
    #[error("memory at 0x{address:x} is too small: need {needed} bytes")]
    TruncatedMemory { address: u64, needed: usize },
    #[error("type {ty} has no field {field:?}")]
    MissingField { ty: String, field: String },
    #[error("cannot dereference value of type {0}")]
    Deref(String),
    #[error("cannot read {0} as a scalar")]
    NotScalar(String),
    #[error("record {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },
    #[error("unknown trace number {0}")]
    UnknownTrace(u16),
    #[error("profile timestamps for {0:?} must be non-decreasing")]
    ProfileOrder(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
