//! Function prototypes and their co-located arrays.
//!
//! A `new_prototype` event points at a raw GCproto image. The prototype's
//! bytecode array sits immediately after the record struct in the same
//! allocation, and the `lineinfo` / `declname` pointers aim back into that
//! allocation too. Memory records are keyed by original process address,
//! so the co-location arithmetic reduces to plain reads at the pointer
//! values.

use crate::auditlog::memory::{string_at, Cursor, MemoryMap};
use crate::errors::Result;
use birdwatch_dwarf::DwarfInfo;
use tracing::debug;

/// A compiled function body: identity, names, line table, and bytecode.
/// Built once at the first `new_prototype` event for its address and never
/// mutated.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub address: u64,
    pub chunkname: String,
    /// Declaration name; `"?"` when the runtime recorded none.
    pub declname: String,
    pub firstline: i64,
    /// One line number per bytecode position.
    pub lineinfo: Vec<u32>,
    /// Raw 32-bit instruction words.
    pub bytecode: Vec<u32>,
}

impl Prototype {
    pub fn build(dwarf: &DwarfInfo, mem: &MemoryMap, address: u64) -> Result<Prototype> {
        let gcstr_ty = dwarf.type_named("GCstr")?;
        let proto_ty = dwarf.type_named("GCproto")?;
        let proto = Cursor::new(dwarf, mem, address, proto_ty);

        let sizebc = proto.field("sizebc")?.read_u64()?;
        let firstline = proto.field("firstline")?.read_i64()?;
        let numline = proto.field("numline")?.read_u64().unwrap_or(0);

        let chunkname_ptr = proto.field("chunkname")?.read_u64()?;
        let chunkname = string_at(dwarf, mem, gcstr_ty, chunkname_ptr)?;

        let declname_ptr = proto.field("declname")?.read_u64()?;
        let declname = if declname_ptr == 0 {
            "?".to_string()
        } else {
            cstring_at(mem, declname_ptr)?
        };

        // Line-info entry width: from the pointer's element type when the
        // debug info carries one, otherwise from the line count.
        let li_field = proto.field("lineinfo")?;
        let width = dwarf
            .pointee(li_field.ty)
            .map(|t| dwarf.size_of(t))
            .filter(|w| matches!(w, 1 | 2 | 4))
            .unwrap_or(if numline < 0x100 {
                1
            } else if numline < 0x10000 {
                2
            } else {
                4
            });
        let lineinfo_ptr = li_field.read_u64()?;
        let mut lineinfo = Vec::with_capacity(sizebc as usize);
        if lineinfo_ptr != 0 {
            for i in 0..sizebc {
                let raw = mem.bytes(lineinfo_ptr + i * width, width as usize)?;
                let mut buf = [0u8; 4];
                buf[..width as usize].copy_from_slice(raw);
                lineinfo.push(u32::from_le_bytes(buf));
            }
        }

        // The bytecode array is co-located right after the GCproto struct.
        let bc_base = address + dwarf.size_of(proto.ty);
        let mut bytecode = Vec::with_capacity(sizebc as usize);
        for i in 0..sizebc {
            let raw = mem.bytes(bc_base + i * 4, 4)?;
            bytecode.push(u32::from_le_bytes(raw.try_into().unwrap()));
        }

        debug!("prototype {declname} at {address:#x} ({sizebc} bytecodes)");
        Ok(Prototype {
            address,
            chunkname,
            declname,
            firstline,
            lineinfo,
            bytecode,
        })
    }

    /// Source line for a bytecode position, 0 when unknown.
    pub fn line(&self, bcpos: u32) -> u32 {
        self.lineinfo.get(bcpos as usize).copied().unwrap_or(0)
    }
}

/// NUL-terminated string read out of the memory map.
fn cstring_at(mem: &MemoryMap, address: u64) -> Result<String> {
    let (blob, offset) = mem
        .resolve(address)
        .ok_or(crate::errors::ModelError::MissingMemory(address))?;
    let tail = &blob.data[offset..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}
