//! The memory map: raw snapshots of runtime structures, addressable by
//! their original process-space address and readable through DWARF
//! descriptors.

use crate::errors::{ModelError, Result};
use birdwatch_dwarf::{DwarfInfo, TypeId};
use std::collections::BTreeMap;

/// One `memory` record: the raw bytes plus the typed view named by the
/// record's hint (always a pointer to the snapshotted structure).
#[derive(Debug)]
pub struct MemBlob {
    pub address: u64,
    pub hint: String,
    pub ty: TypeId,
    pub data: Box<[u8]>,
}

/// Address-keyed store of all memory records. Keys are canonical unsigned
/// 64-bit values regardless of how the address was encoded in the log.
#[derive(Debug, Default)]
pub struct MemoryMap {
    blobs: BTreeMap<u64, MemBlob>,
}

impl MemoryMap {
    pub fn insert(&mut self, blob: MemBlob) {
        self.blobs.insert(blob.address, blob);
    }

    /// Exact-address lookup.
    pub fn get(&self, address: u64) -> Option<&MemBlob> {
        self.blobs.get(&address)
    }

    /// Find the blob containing `address`, returning it and the offset of
    /// `address` within it. Pointers in trace state routinely aim into the
    /// middle of a snapshotted allocation.
    pub fn resolve(&self, address: u64) -> Option<(&MemBlob, usize)> {
        let (_, blob) = self.blobs.range(..=address).next_back()?;
        let offset = address - blob.address;
        if offset < blob.data.len() as u64 {
            Some((blob, offset as usize))
        } else {
            None
        }
    }

    /// `len` bytes starting at `address`, or the precise failure: the
    /// address is unmapped, or the containing blob is too small.
    pub fn bytes(&self, address: u64, len: usize) -> Result<&[u8]> {
        let (blob, offset) = self
            .resolve(address)
            .ok_or(ModelError::MissingMemory(address))?;
        blob.data
            .get(offset..offset + len)
            .ok_or(ModelError::TruncatedMemory {
                address,
                needed: len,
            })
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemBlob> {
        self.blobs.values()
    }
}

/// A typed read position: an address interpreted under a descriptor.
/// Field access and dereferencing produce new cursors; scalar reads go
/// through the memory map with little-endian interpretation.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    pub dwarf: &'a DwarfInfo,
    pub mem: &'a MemoryMap,
    pub addr: u64,
    pub ty: TypeId,
}

impl<'a> Cursor<'a> {
    pub fn new(dwarf: &'a DwarfInfo, mem: &'a MemoryMap, addr: u64, ty: TypeId) -> Self {
        Cursor {
            dwarf,
            mem,
            addr,
            ty,
        }
    }

    /// Move to a named member of the record at this address.
    pub fn field(&self, name: &str) -> Result<Cursor<'a>> {
        let field = self
            .dwarf
            .field(self.ty, name)
            .ok_or_else(|| ModelError::MissingField {
                ty: self.dwarf.type_display(self.ty),
                field: name.to_string(),
            })?;
        Ok(Cursor {
            addr: self.addr + field.offset,
            ty: field.ty,
            ..*self
        })
    }

    /// Step to the `i`-th element of an array of this cursor's type.
    pub fn index(&self, i: u64) -> Cursor<'a> {
        Cursor {
            addr: self.addr + i * self.dwarf.size_of(self.ty),
            ..*self
        }
    }

    /// Follow a pointer, yielding a cursor typed as the pointee at the
    /// pointed-to address.
    pub fn deref(&self) -> Result<Cursor<'a>> {
        let target = self
            .dwarf
            .pointee(self.ty)
            .ok_or_else(|| ModelError::Deref(self.dwarf.type_display(self.ty)))?;
        let addr = self.read_u64()?;
        Ok(Cursor {
            addr,
            ty: target,
            ..*self
        })
    }

    /// Raw little-endian read of this value's bytes, zero-extended.
    /// Single-member reference wrappers (`GCRef`, `MRef`) read as the
    /// 64-bit pointer they carry.
    pub fn read_u64(&self) -> Result<u64> {
        let size = self.dwarf.size_of(self.ty) as usize;
        if size == 0 || size > 8 {
            return Err(ModelError::NotScalar(self.dwarf.type_display(self.ty)));
        }
        let bytes = self.mem.bytes(self.addr, size)?;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Sign-extending read.
    pub fn read_i64(&self) -> Result<i64> {
        let size = self.dwarf.size_of(self.ty) as usize;
        let raw = self.read_u64()?;
        if size >= 8 {
            return Ok(raw as i64);
        }
        let shift = 64 - size as u32 * 8;
        Ok(((raw << shift) as i64) >> shift)
    }

    pub fn bytes(&self, len: usize) -> Result<&'a [u8]> {
        self.mem.bytes(self.addr, len)
    }
}

/// Read the payload of an interned string object at `addr`: the length
/// field from its header, then the bytes co-located after the header.
pub fn string_at(
    dwarf: &DwarfInfo,
    mem: &MemoryMap,
    gcstr_ty: TypeId,
    addr: u64,
) -> Result<String> {
    let header = Cursor::new(dwarf, mem, addr, gcstr_ty);
    let len = header.field("len")?.read_u64()? as usize;
    let payload = mem.bytes(addr + dwarf.size_of(gcstr_ty), len)?;
    Ok(String::from_utf8_lossy(payload).into_owned())
}
