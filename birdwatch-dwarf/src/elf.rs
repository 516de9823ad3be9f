//! Section access for the ELF object embedded in an audit log.

use crate::errors::{DwarfError, Result};
use object::{Object, ObjectSection};
use tracing::debug;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// A parsed view over an ELF object carried as a `blob` record.
///
/// The audit log embeds a relocatable 64-bit little-endian object whose only
/// interesting payload is its DWARF sections; everything else is tolerated
/// and ignored.
#[derive(Debug)]
pub struct ElfImage<'a> {
    object: object::File<'a>,
}

impl<'a> ElfImage<'a> {
    /// Validate the ELF header and open the section table.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 64 || data[..4] != ELF_MAGIC {
            return Err(DwarfError::NotElf);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(DwarfError::UnsupportedAbi);
        }
        // e_shoff and e_shstrndx are at fixed offsets in the 64-bit header.
        let e_shoff = u64::from_le_bytes(data[0x28..0x30].try_into().unwrap());
        let e_shstrndx = u16::from_le_bytes(data[0x3e..0x40].try_into().unwrap());
        if e_shoff == 0 || e_shstrndx == 0 {
            return Err(DwarfError::MissingSectionNameTable);
        }
        let object = object::File::parse(data)?;
        Ok(ElfImage { object })
    }

    /// Ordered `(name, bytes)` pairs for every named section, skipping the
    /// initial null section.
    pub fn sections(&self) -> impl Iterator<Item = (String, &'a [u8])> + '_ {
        self.object.sections().filter_map(|section| {
            let name = section.name().ok()?;
            if name.is_empty() {
                return None;
            }
            let data = section.data().ok()?;
            debug!(section = name, len = data.len(), "ELF section");
            Some((name.to_string(), data))
        })
    }
}
