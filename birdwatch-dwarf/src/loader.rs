//! DWARF bring-up over the audit log's embedded ELF blob.
//!
//! The blob carries split-DWARF sections (`.debug_info.dwo` and friends).
//! They are handed to gimli under their stripped names, every named DIE is
//! indexed, and layout descriptors are synthesized lazily per DIE on top of
//! the tree (see `types.rs`).

use crate::elf::ElfImage;
use crate::errors::{DwarfError, Result};
use crate::types::{Descriptor, Field, TypeId, TypeTable};
use gimli::{constants, AttributeValue, EndianSlice, LittleEndian};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::debug;

type Slice = EndianSlice<'static, LittleEndian>;
type Die<'a> = gimli::DebuggingInformationEntry<'a, 'a, Slice>;

/// Handle to a debug information entry: compilation unit index plus the
/// DIE's offset within that unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DieRef {
    pub(crate) unit: usize,
    pub(crate) offset: gimli::UnitOffset<usize>,
}

/// Parsed DWARF for one audit log: DIE tree, name index, and the descriptor
/// arena. Immutable after load except for the lazy descriptor caches.
#[derive(Debug)]
pub struct DwarfInfo {
    // Keeps the section bytes alive; `dwarf` and `units` hold 'static
    // slices into these boxes.
    _sections: HashMap<String, Box<[u8]>>,
    dwarf: gimli::Dwarf<Slice>,
    units: Vec<gimli::Unit<Slice>>,
    names: HashMap<String, DieRef>,
    types: RefCell<TypeTable>,
    hints: RefCell<HashMap<String, TypeId>>,
}

fn attr_u64(value: &AttributeValue<Slice>) -> Option<u64> {
    match value {
        AttributeValue::Udata(v) => Some(*v),
        AttributeValue::Data1(v) => Some(*v as u64),
        AttributeValue::Data2(v) => Some(*v as u64),
        AttributeValue::Data4(v) => Some(*v as u64),
        AttributeValue::Data8(v) => Some(*v),
        AttributeValue::Sdata(v) if *v >= 0 => Some(*v as u64),
        _ => None,
    }
}

fn attr_i64(value: &AttributeValue<Slice>) -> Option<i64> {
    match value {
        AttributeValue::Udata(v) => Some(*v as i64),
        AttributeValue::Sdata(v) => Some(*v),
        AttributeValue::Data1(v) => Some(*v as i64),
        AttributeValue::Data2(v) => Some(*v as i64),
        AttributeValue::Data4(v) => Some(*v as i64),
        AttributeValue::Data8(v) => Some(*v as i64),
        _ => None,
    }
}

impl DwarfInfo {
    /// Load the debug sections out of the embedded ELF object and index the
    /// DIE tree. `debug_info`, `debug_abbrev`, and `debug_str` are
    /// mandatory; other sections are tolerated and ignored.
    pub fn load(elf: &ElfImage) -> Result<Self> {
        let mut store: HashMap<String, Box<[u8]>> = HashMap::new();
        for (name, bytes) in elf.sections() {
            if name.contains(".debug_") {
                store.insert(name, bytes.into());
            }
        }
        for required in [".debug_info", ".debug_abbrev", ".debug_str"] {
            let dwo = format!("{required}.dwo");
            if !store.contains_key(&dwo) && !store.contains_key(required) {
                return Err(DwarfError::MissingSection(match required {
                    ".debug_info" => ".debug_info.dwo",
                    ".debug_abbrev" => ".debug_abbrev.dwo",
                    _ => ".debug_str.dwo",
                }));
            }
        }

        let load_section = |id: gimli::SectionId| -> std::result::Result<Slice, DwarfError> {
            let data: &[u8] = id
                .dwo_name()
                .and_then(|n| store.get(n))
                .or_else(|| store.get(id.name()))
                .map(|b| &b[..])
                .unwrap_or(&[]);
            // SAFETY: the boxed section bytes are owned by `_sections` for
            // the lifetime of this DwarfInfo and are never mutated.
            let data: &'static [u8] = unsafe { std::mem::transmute(data) };
            Ok(EndianSlice::new(data, LittleEndian))
        };
        let mut dwarf = gimli::Dwarf::load(load_section)?;
        dwarf.file_type = gimli::DwarfFileType::Dwo;

        let mut units = Vec::new();
        let mut names: HashMap<String, DieRef> = HashMap::new();
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let unit = dwarf.unit(header)?;
            let uidx = units.len();
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                // Forward declarations carry no layout; let the defining DIE
                // win the name slot.
                if matches!(
                    entry.attr_value(constants::DW_AT_declaration)?,
                    Some(AttributeValue::Flag(true))
                ) {
                    continue;
                }
                let Some(name_attr) = entry.attr_value(constants::DW_AT_name)? else {
                    continue;
                };
                let Ok(name) = dwarf.attr_string(&unit, name_attr) else {
                    continue;
                };
                let name = name.to_string_lossy().into_owned();
                names.entry(name).or_insert(DieRef {
                    unit: uidx,
                    offset: entry.offset(),
                });
            }
            units.push(unit);
        }
        debug!(units = units.len(), names = names.len(), "DWARF loaded");

        Ok(DwarfInfo {
            _sections: store,
            dwarf,
            units,
            names,
            types: RefCell::new(TypeTable::default()),
            hints: RefCell::new(HashMap::new()),
        })
    }

    /// Look up a DIE by its `name` attribute.
    pub fn find_die(&self, name: &str) -> Option<DieRef> {
        self.names.get(name).copied()
    }

    /// The value of a named enumerator constant, if the name resolves to one.
    pub fn constant(&self, name: &str) -> Option<i64> {
        let die = self.find_die(name)?;
        let unit = &self.units[die.unit];
        let entry = unit.entry(die.offset).ok()?;
        if entry.tag() != constants::DW_TAG_enumerator {
            return None;
        }
        let value = entry.attr_value(constants::DW_AT_const_value).ok()??;
        attr_i64(&value)
    }

    /// Synthesize (memoized) the layout descriptor for a DIE.
    pub fn descriptor_of(&self, die: DieRef) -> Result<TypeId> {
        let mut table = self.types.borrow_mut();
        self.synth(&mut table, die)
    }

    /// Descriptor for a type referenced by name (struct, union, enum, or
    /// typedef).
    pub fn type_named(&self, name: &str) -> Result<TypeId> {
        let die = self
            .find_die(name)
            .ok_or_else(|| DwarfError::MissingDie(name.to_string()))?;
        self.descriptor_of(die)
    }

    /// Resolve a `memory` record hint to the descriptor of the typed view it
    /// binds: a `variable` DIE contributes its own type (already a pointer,
    /// arrays having decayed), any other DIE is wrapped as a pointer to it.
    pub fn hint_descriptor(&self, hint: &str) -> Result<TypeId> {
        if let Some(&id) = self.hints.borrow().get(hint) {
            return Ok(id);
        }
        let die = self
            .find_die(hint)
            .ok_or_else(|| DwarfError::MissingDie(hint.to_string()))?;
        let unit = &self.units[die.unit];
        let entry = unit.entry(die.offset)?;
        let id = if entry.tag() == constants::DW_TAG_variable {
            let target = self
                .type_ref(&entry, die.unit)?
                .ok_or_else(|| DwarfError::NotAType(hint.to_string()))?;
            self.descriptor_of(target)?
        } else {
            let inner = self.descriptor_of(die)?;
            self.types.borrow_mut().push(Descriptor::Pointer {
                target: Some(inner),
            })
        };
        self.hints.borrow_mut().insert(hint.to_string(), id);
        Ok(id)
    }

    /// Wrap an existing descriptor in a pointer.
    pub fn pointer_to(&self, target: TypeId) -> TypeId {
        self.types.borrow_mut().push(Descriptor::Pointer {
            target: Some(target),
        })
    }

    // Layout queries, forwarded into the descriptor arena.

    pub fn size_of(&self, id: TypeId) -> u64 {
        self.types.borrow().size_of(id)
    }

    pub fn field(&self, id: TypeId, name: &str) -> Option<Field> {
        self.types.borrow().field(id, name)
    }

    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        self.types.borrow().pointee(id)
    }

    /// Resolve a typed value against an enum descriptor: the enumerator name
    /// for `value`, if any.
    pub fn enum_name(&self, id: TypeId, value: i64) -> Option<String> {
        self.types.borrow().enum_name(id, value)
    }

    pub fn enum_value(&self, id: TypeId, name: &str) -> Option<i64> {
        self.types.borrow().enum_value(id, name)
    }

    pub fn enum_variants(&self, id: TypeId) -> Vec<(String, i64)> {
        self.types.borrow().variants(id)
    }

    /// A cloned copy of the descriptor, for display and tests.
    pub fn descriptor(&self, id: TypeId) -> Descriptor {
        self.types.borrow().get(id).clone()
    }

    pub fn type_display(&self, id: TypeId) -> String {
        self.types.borrow().display(id)
    }

    // Synthesis internals.

    fn type_ref(&self, entry: &Die, unit_idx: usize) -> Result<Option<DieRef>> {
        match entry.attr_value(constants::DW_AT_type)? {
            Some(AttributeValue::UnitRef(offset)) => Ok(Some(DieRef {
                unit: unit_idx,
                offset,
            })),
            Some(other) => Err(DwarfError::UnsupportedForm(format!("{other:?}"))),
            None => Ok(None),
        }
    }

    fn die_name(&self, unit: &gimli::Unit<Slice>, entry: &Die) -> Result<Option<String>> {
        let Some(value) = entry.attr_value(constants::DW_AT_name)? else {
            return Ok(None);
        };
        let name = self.dwarf.attr_string(unit, value)?;
        Ok(Some(name.to_string_lossy().into_owned()))
    }

    fn synth(&self, table: &mut TypeTable, die: DieRef) -> Result<TypeId> {
        if let Some(&id) = table.by_die.get(&die) {
            return Ok(id);
        }
        let unit = &self.units[die.unit];
        let entry = unit.entry(die.offset)?;
        let tag = entry.tag();
        match tag {
            constants::DW_TAG_base_type => {
                let name = self
                    .die_name(unit, &entry)?
                    .unwrap_or_else(|| "?".to_string());
                let size = entry
                    .attr_value(constants::DW_AT_byte_size)?
                    .as_ref()
                    .and_then(attr_u64)
                    .unwrap_or(0);
                let id = table.push(Descriptor::Prim { name, size });
                table.by_die.insert(die, id);
                Ok(id)
            }
            constants::DW_TAG_pointer_type => {
                let id = table.push(Descriptor::Pointer { target: None });
                table.by_die.insert(die, id);
                if let Some(target) = self.type_ref(&entry, die.unit)? {
                    let t = self.synth(table, target)?;
                    table.replace(id, Descriptor::Pointer { target: Some(t) });
                }
                Ok(id)
            }
            constants::DW_TAG_subroutine_type => {
                let id = table.push(Descriptor::Pointer { target: None });
                table.by_die.insert(die, id);
                Ok(id)
            }
            constants::DW_TAG_array_type => {
                let target = self
                    .type_ref(&entry, die.unit)?
                    .ok_or_else(|| DwarfError::NotAType(format!("{tag}")))?;
                let id = table.push(Descriptor::Pointer { target: None });
                table.by_die.insert(die, id);
                let elem = self.synth(table, target)?;
                table.replace(id, Descriptor::Array { elem });
                Ok(id)
            }
            constants::DW_TAG_structure_type | constants::DW_TAG_union_type => {
                self.synth_record(table, die, &entry, tag == constants::DW_TAG_union_type)
            }
            constants::DW_TAG_enumeration_type => self.synth_enum(table, die, &entry),
            constants::DW_TAG_typedef => {
                let name = self
                    .die_name(unit, &entry)?
                    .unwrap_or_else(|| "?".to_string());
                let target = self
                    .type_ref(&entry, die.unit)?
                    .ok_or_else(|| DwarfError::NotAType(name.clone()))?;
                let id = table.push(Descriptor::Opaque { size: 0 });
                table.by_die.insert(die, id);
                let t = self.synth(table, target)?;
                table.replace(id, Descriptor::Alias { name, target: t });
                Ok(id)
            }
            constants::DW_TAG_const_type
            | constants::DW_TAG_volatile_type
            | constants::DW_TAG_member
            | constants::DW_TAG_variable => {
                let target = self
                    .type_ref(&entry, die.unit)?
                    .ok_or_else(|| DwarfError::NotAType(format!("{tag}")))?;
                let id = self.synth(table, target)?;
                table.by_die.insert(die, id);
                Ok(id)
            }
            other => Err(DwarfError::UnsupportedTag(other.to_string())),
        }
    }

    /// Build a struct or union descriptor. A size-only placeholder is
    /// installed in the arena before any member type is synthesized so that
    /// cyclic type graphs terminate. Struct members get explicit padding
    /// fields wherever the running offset falls short of the member's
    /// declared location, plus trailing padding up to the declared byte
    /// size; the union's byte size is authoritative as-is.
    fn synth_record(
        &self,
        table: &mut TypeTable,
        die: DieRef,
        entry: &Die,
        is_union: bool,
    ) -> Result<TypeId> {
        let unit = &self.units[die.unit];
        let name = self.die_name(unit, entry)?;
        let size = entry
            .attr_value(constants::DW_AT_byte_size)?
            .as_ref()
            .and_then(attr_u64)
            .unwrap_or(0);

        let id = table.push(Descriptor::Opaque { size });
        table.by_die.insert(die, id);

        let mut raw: Vec<(Option<String>, u64, DieRef)> = Vec::new();
        {
            let mut tree = unit.entries_tree(Some(die.offset))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let centry = child.entry();
                if centry.tag() != constants::DW_TAG_member {
                    continue;
                }
                let mname = self.die_name(unit, centry)?;
                let moffset = centry
                    .attr_value(constants::DW_AT_data_member_location)?
                    .as_ref()
                    .and_then(attr_u64)
                    .unwrap_or(0);
                let mtype = self.type_ref(centry, die.unit)?.ok_or_else(|| {
                    DwarfError::NotAType(mname.clone().unwrap_or_else(|| "<member>".to_string()))
                })?;
                raw.push((mname, moffset, mtype));
            }
        }

        let mut fields = Vec::new();
        if is_union {
            for (mname, _, mref) in raw {
                let fty = self.synth(table, mref)?;
                fields.push(Field {
                    name: mname,
                    offset: 0,
                    ty: fty,
                });
            }
            table.replace(id, Descriptor::Union { name, size, fields });
        } else {
            let mut cursor = 0u64;
            for (mname, moffset, mref) in raw {
                if cursor < moffset {
                    let pad = table.push(Descriptor::Opaque {
                        size: moffset - cursor,
                    });
                    fields.push(Field {
                        name: None,
                        offset: cursor,
                        ty: pad,
                    });
                }
                let fty = self.synth(table, mref)?;
                let fsize = table.size_of(fty);
                fields.push(Field {
                    name: mname,
                    offset: moffset,
                    ty: fty,
                });
                cursor = cursor.max(moffset + fsize);
            }
            if cursor < size {
                let pad = table.push(Descriptor::Opaque {
                    size: size - cursor,
                });
                fields.push(Field {
                    name: None,
                    offset: cursor,
                    ty: pad,
                });
            }
            table.replace(id, Descriptor::Struct { name, size, fields });
        }
        Ok(id)
    }

    fn synth_enum(&self, table: &mut TypeTable, die: DieRef, entry: &Die) -> Result<TypeId> {
        let unit = &self.units[die.unit];
        let name = self.die_name(unit, entry)?;
        let size = entry
            .attr_value(constants::DW_AT_byte_size)?
            .as_ref()
            .and_then(attr_u64)
            .unwrap_or(4);

        let mut variants = Vec::new();
        let mut tree = unit.entries_tree(Some(die.offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let centry = child.entry();
            if centry.tag() != constants::DW_TAG_enumerator {
                continue;
            }
            let Some(vname) = self.die_name(unit, centry)? else {
                continue;
            };
            let value = centry
                .attr_value(constants::DW_AT_const_value)?
                .as_ref()
                .and_then(attr_i64)
                .unwrap_or(0);
            variants.push((vname, value));
        }

        let id = table.push(Descriptor::Enum {
            name,
            size,
            variants,
        });
        table.by_die.insert(die, id);
        Ok(id)
    }
}
