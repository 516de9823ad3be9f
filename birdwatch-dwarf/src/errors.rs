//! Error types for the ELF/DWARF loading library

/// Failures raised while walking the embedded ELF object or its DWARF
/// sections. Malformed input carries enough context (section names, tag and
/// form names, addresses) for an operator to file the gap.
#[derive(thiserror::Error, Debug)]
pub enum DwarfError {
    #[error("not an ELF image")]
    NotElf,
    #[error("unsupported ELF ABI: expected 64-bit little-endian")]
    UnsupportedAbi,
    #[error("ELF image has no section name table")]
    MissingSectionNameTable,
    #[error("required DWARF section {0} is missing")]
    MissingSection(&'static str),
    #[error("unsupported DWARF tag {0}")]
    UnsupportedTag(String),
    #[error("unsupported DWARF form {0}")]
    UnsupportedForm(String),
    #[error("no debug info entry named {0:?}")]
    MissingDie(String),
    #[error("debug info entry {0:?} does not describe a type")]
    NotAType(String),
    #[error("DWARF parsing error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("object file error: {0}")]
    Object(#[from] object::Error),
}

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, DwarfError>;
