//! Fixture builders: a DWARF4 section writer and a minimal ELF64 writer.
//!
//! The writers synthesize just enough of each format to exercise the loader:
//! one compilation unit, inline strings, data1/2/4/8 scalars, and
//! CU-relative ref4 type references.

#![allow(dead_code)]

use gimli::constants;

#[derive(Clone)]
pub enum AttrVal {
    Str(String),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// CU-relative reference to another DIE (by builder id).
    Ref(usize),
}

struct DieSpec {
    tag: u64,
    attrs: Vec<(u64, AttrVal)>,
    children: Vec<usize>,
}

/// Builds `.debug_info` / `.debug_abbrev` / `.debug_str` byte images for a
/// single DWARF4 compilation unit.
pub struct DwarfWriter {
    dies: Vec<DieSpec>,
}

const CU_HEADER_LEN: usize = 11; // length(4) version(2) abbrev_off(4) addr_size(1)

impl DwarfWriter {
    pub fn new() -> Self {
        let root = DieSpec {
            tag: constants::DW_TAG_compile_unit.0 as u64,
            attrs: vec![(
                constants::DW_AT_name.0 as u64,
                AttrVal::Str("lj_dwarf.c".to_string()),
            )],
            children: Vec::new(),
        };
        DwarfWriter { dies: vec![root] }
    }

    pub fn root(&self) -> usize {
        0
    }

    /// Add a DIE under `parent`, returning its builder id.
    pub fn die(&mut self, parent: usize, tag: gimli::DwTag, attrs: Vec<(gimli::DwAt, AttrVal)>) -> usize {
        let id = self.dies.len();
        self.dies.push(DieSpec {
            tag: tag.0 as u64,
            attrs: attrs
                .into_iter()
                .map(|(at, v)| (at.0 as u64, v))
                .collect(),
            children: Vec::new(),
        });
        self.dies[parent].children.push(id);
        id
    }

    /// Shorthand for a named struct/union member.
    pub fn member(&mut self, parent: usize, name: &str, offset: u64, ty: usize) -> usize {
        self.die(
            parent,
            constants::DW_TAG_member,
            vec![
                (constants::DW_AT_name, AttrVal::Str(name.to_string())),
                (constants::DW_AT_data_member_location, AttrVal::U16(offset as u16)),
                (constants::DW_AT_type, AttrVal::Ref(ty)),
            ],
        )
    }

    /// An unnamed member (anonymous aggregate) at the given offset.
    pub fn anon_member(&mut self, parent: usize, offset: u64, ty: usize) -> usize {
        self.die(
            parent,
            constants::DW_TAG_member,
            vec![
                (constants::DW_AT_data_member_location, AttrVal::U16(offset as u16)),
                (constants::DW_AT_type, AttrVal::Ref(ty)),
            ],
        )
    }

    pub fn base_type(&mut self, name: &str, size: u8) -> usize {
        self.die(
            0,
            constants::DW_TAG_base_type,
            vec![
                (constants::DW_AT_name, AttrVal::Str(name.to_string())),
                (constants::DW_AT_byte_size, AttrVal::U8(size)),
            ],
        )
    }

    pub fn pointer_to(&mut self, target: usize) -> usize {
        self.die(
            0,
            constants::DW_TAG_pointer_type,
            vec![(constants::DW_AT_type, AttrVal::Ref(target))],
        )
    }

    pub fn enumerator(&mut self, parent: usize, name: &str, value: u32) -> usize {
        self.die(
            parent,
            constants::DW_TAG_enumerator,
            vec![
                (constants::DW_AT_name, AttrVal::Str(name.to_string())),
                (constants::DW_AT_const_value, AttrVal::U32(value)),
            ],
        )
    }

    fn form_of(value: &AttrVal) -> u64 {
        match value {
            AttrVal::Str(_) => constants::DW_FORM_string.0 as u64,
            AttrVal::U8(_) => constants::DW_FORM_data1.0 as u64,
            AttrVal::U16(_) => constants::DW_FORM_data2.0 as u64,
            AttrVal::U32(_) => constants::DW_FORM_data4.0 as u64,
            AttrVal::U64(_) => constants::DW_FORM_data8.0 as u64,
            AttrVal::Ref(_) => constants::DW_FORM_ref4.0 as u64,
        }
    }

    fn value_len(value: &AttrVal) -> usize {
        match value {
            AttrVal::Str(s) => s.len() + 1,
            AttrVal::U8(_) => 1,
            AttrVal::U16(_) => 2,
            AttrVal::U32(_) => 4,
            AttrVal::U64(_) => 8,
            AttrVal::Ref(_) => 4,
        }
    }

    /// Serialize to `(debug_info, debug_abbrev, debug_str)`.
    pub fn sections(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        // Assign abbreviation codes by unique (tag, has_children, forms).
        let mut abbrev_keys: Vec<(u64, bool, Vec<u64>)> = Vec::new();
        let mut codes = vec![0usize; self.dies.len()];
        for (i, die) in self.dies.iter().enumerate() {
            let key = (
                die.tag,
                !die.children.is_empty(),
                die.attrs
                    .iter()
                    .map(|(at, v)| (at << 8) | Self::form_of(v))
                    .collect::<Vec<u64>>(),
            );
            codes[i] = match abbrev_keys.iter().position(|k| *k == key) {
                Some(pos) => pos + 1,
                None => {
                    abbrev_keys.push(key);
                    abbrev_keys.len()
                }
            };
        }

        let mut abbrev = Vec::new();
        for (i, (tag, has_children, packed)) in abbrev_keys.iter().enumerate() {
            write_uleb(&mut abbrev, (i + 1) as u64);
            write_uleb(&mut abbrev, *tag);
            abbrev.push(u8::from(*has_children));
            for p in packed {
                write_uleb(&mut abbrev, p >> 8);
                write_uleb(&mut abbrev, p & 0xff);
            }
            write_uleb(&mut abbrev, 0);
            write_uleb(&mut abbrev, 0);
        }
        write_uleb(&mut abbrev, 0);

        // Compute each DIE's CU-relative offset.
        let mut offsets = vec![0usize; self.dies.len()];
        let mut cursor = CU_HEADER_LEN;
        self.layout(0, &codes, &mut offsets, &mut cursor);
        let total = cursor;

        let mut info = Vec::with_capacity(total);
        info.extend_from_slice(&((total - 4) as u32).to_le_bytes());
        info.extend_from_slice(&4u16.to_le_bytes()); // DWARF version
        info.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        info.push(8); // address size
        self.emit(0, &codes, &offsets, &mut info);
        assert_eq!(info.len(), total);

        (info, abbrev, vec![0])
    }

    fn layout(&self, id: usize, codes: &[usize], offsets: &mut [usize], cursor: &mut usize) {
        offsets[id] = *cursor;
        let die = &self.dies[id];
        *cursor += uleb_len(codes[id] as u64);
        for (_, v) in &die.attrs {
            *cursor += Self::value_len(v);
        }
        if !die.children.is_empty() {
            for &child in &die.children {
                self.layout(child, codes, offsets, cursor);
            }
            *cursor += 1; // sibling list terminator
        }
    }

    fn emit(&self, id: usize, codes: &[usize], offsets: &[usize], out: &mut Vec<u8>) {
        let die = &self.dies[id];
        write_uleb(out, codes[id] as u64);
        for (_, v) in &die.attrs {
            match v {
                AttrVal::Str(s) => {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                AttrVal::U8(x) => out.push(*x),
                AttrVal::U16(x) => out.extend_from_slice(&x.to_le_bytes()),
                AttrVal::U32(x) => out.extend_from_slice(&x.to_le_bytes()),
                AttrVal::U64(x) => out.extend_from_slice(&x.to_le_bytes()),
                AttrVal::Ref(target) => {
                    out.extend_from_slice(&(offsets[*target] as u32).to_le_bytes())
                }
            }
        }
        if !die.children.is_empty() {
            for &child in &die.children {
                self.emit(child, codes, offsets, out);
            }
            out.push(0);
        }
    }
}

fn uleb_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn write_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Assemble a relocatable ELF64 little-endian image from named sections.
pub fn build_elf(sections: &[(&str, &[u8])]) -> Vec<u8> {
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for (name, _) in sections {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    let mut out = vec![0u8; 64];
    out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // ELFDATA2LSB
    out[6] = 1; // EV_CURRENT
    out[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
    out[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out[20..24].copy_from_slice(&1u32.to_le_bytes());

    let mut offsets = Vec::new();
    for (_, data) in sections {
        offsets.push(out.len() as u64);
        out.extend_from_slice(data);
    }
    let shstrtab_off = out.len() as u64;
    out.extend_from_slice(&shstrtab);
    while out.len() % 8 != 0 {
        out.push(0);
    }

    let e_shoff = out.len() as u64;
    let nsections = sections.len() as u16 + 2;
    let shdr = |name: u32, shtype: u32, off: u64, size: u64| {
        let mut h = vec![0u8; 64];
        h[0..4].copy_from_slice(&name.to_le_bytes());
        h[4..8].copy_from_slice(&shtype.to_le_bytes());
        h[24..32].copy_from_slice(&off.to_le_bytes());
        h[32..40].copy_from_slice(&size.to_le_bytes());
        h
    };
    out.extend_from_slice(&shdr(0, 0, 0, 0));
    for (i, (_, data)) in sections.iter().enumerate() {
        out.extend_from_slice(&shdr(name_offsets[i], 1, offsets[i], data.len() as u64));
    }
    out.extend_from_slice(&shdr(shstrtab_name, 3, shstrtab_off, shstrtab.len() as u64));

    out[0x28..0x30].copy_from_slice(&e_shoff.to_le_bytes());
    out[0x34..0x36].copy_from_slice(&64u16.to_le_bytes());
    out[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
    out[0x3c..0x3e].copy_from_slice(&nsections.to_le_bytes());
    out[0x3e..0x40].copy_from_slice(&(nsections - 1).to_le_bytes());
    out
}

/// Wrap DWARF sections in an ELF image under the `.dwo` suffix convention.
pub fn build_dwo_elf(writer: &DwarfWriter) -> Vec<u8> {
    let (info, abbrev, strs) = writer.sections();
    build_elf(&[
        (".debug_info.dwo", &info),
        (".debug_abbrev.dwo", &abbrev),
        (".debug_str.dwo", &strs),
        (".note.unrelated", b"ignored"),
    ])
}
