//! Layout descriptors synthesized from DWARF type DIEs.
//!
//! Descriptors live in an arena and refer to each other through integer ids,
//! so cyclic record graphs (a struct holding a pointer to itself, mutually
//! recursive runtime objects) are representable without reference cycles.
//! The synthesis pass installs a size-only placeholder in the arena before
//! recursing into members; see `loader.rs`.

use crate::loader::DieRef;
use std::collections::HashMap;

/// Arena index of a synthesized descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) u32);

/// One member of a record descriptor. Padding members carry no name and an
/// opaque type of the gap size.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: Option<String>,
    pub offset: u64,
    pub ty: TypeId,
}

/// The layout description of a type, reconstructed from its DIE chain.
#[derive(Debug, Clone)]
pub enum Descriptor {
    /// A base type such as `int` or `uint64_t`.
    Prim { name: String, size: u64 },
    /// A (possibly opaque) pointer. Subroutine types are opaque pointers.
    Pointer { target: Option<TypeId> },
    /// Arrays decay to a pointer to their element for layout purposes.
    Array { elem: TypeId },
    Struct {
        name: Option<String>,
        size: u64,
        fields: Vec<Field>,
    },
    Union {
        name: Option<String>,
        size: u64,
        fields: Vec<Field>,
    },
    Enum {
        name: Option<String>,
        size: u64,
        variants: Vec<(String, i64)>,
    },
    /// A fixed-size buffer with no further structure. Used for padding and
    /// as the self-reference placeholder while a record is being built.
    Opaque { size: u64 },
    /// A typedef, forwarding to its target.
    Alias { name: String, target: TypeId },
}

#[derive(Debug, Default)]
pub(crate) struct TypeTable {
    descs: Vec<Descriptor>,
    pub(crate) by_die: HashMap<DieRef, TypeId>,
}

impl TypeTable {
    pub(crate) fn push(&mut self, desc: Descriptor) -> TypeId {
        let id = TypeId(self.descs.len() as u32);
        self.descs.push(desc);
        id
    }

    pub(crate) fn replace(&mut self, id: TypeId, desc: Descriptor) {
        self.descs[id.0 as usize] = desc;
    }

    pub(crate) fn get(&self, id: TypeId) -> &Descriptor {
        &self.descs[id.0 as usize]
    }

    /// Strip typedef aliases down to the underlying descriptor.
    pub(crate) fn resolve(&self, id: TypeId) -> TypeId {
        let mut id = id;
        while let Descriptor::Alias { target, .. } = self.get(id) {
            id = *target;
        }
        id
    }

    pub(crate) fn size_of(&self, id: TypeId) -> u64 {
        match self.get(self.resolve(id)) {
            Descriptor::Prim { size, .. } => *size,
            Descriptor::Pointer { .. } | Descriptor::Array { .. } => 8,
            Descriptor::Struct { size, .. }
            | Descriptor::Union { size, .. }
            | Descriptor::Enum { size, .. }
            | Descriptor::Opaque { size } => *size,
            Descriptor::Alias { .. } => unreachable!("aliases are resolved"),
        }
    }

    /// Find a member by name, descending transparently into anonymous
    /// struct/union members the way C name lookup does. The returned offset
    /// is absolute within the outermost record.
    pub(crate) fn field(&self, id: TypeId, name: &str) -> Option<Field> {
        let fields = match self.get(self.resolve(id)) {
            Descriptor::Struct { fields, .. } | Descriptor::Union { fields, .. } => fields,
            _ => return None,
        };
        for f in fields {
            match &f.name {
                Some(n) if n == name => return Some(f.clone()),
                Some(_) => {}
                None => {
                    // Unnamed member: padding is opaque and has no fields;
                    // anonymous aggregates are searched recursively.
                    if let Some(inner) = self.field(f.ty, name) {
                        return Some(Field {
                            name: inner.name,
                            offset: f.offset + inner.offset,
                            ty: inner.ty,
                        });
                    }
                }
            }
        }
        None
    }

    /// The pointee of a pointer, or the element of a decayed array.
    pub(crate) fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(self.resolve(id)) {
            Descriptor::Pointer { target } => *target,
            Descriptor::Array { elem } => Some(*elem),
            _ => None,
        }
    }

    pub(crate) fn enum_name(&self, id: TypeId, value: i64) -> Option<String> {
        match self.get(self.resolve(id)) {
            Descriptor::Enum { variants, .. } => variants
                .iter()
                .find(|(_, v)| *v == value)
                .map(|(n, _)| n.clone()),
            _ => None,
        }
    }

    pub(crate) fn enum_value(&self, id: TypeId, name: &str) -> Option<i64> {
        match self.get(self.resolve(id)) {
            Descriptor::Enum { variants, .. } => variants
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    pub(crate) fn variants(&self, id: TypeId) -> Vec<(String, i64)> {
        match self.get(self.resolve(id)) {
            Descriptor::Enum { variants, .. } => variants.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn display(&self, id: TypeId) -> String {
        match self.get(id) {
            Descriptor::Prim { name, .. } => name.clone(),
            Descriptor::Pointer { target: None } => "*void".to_string(),
            Descriptor::Pointer { target: Some(t) } => format!("*{}", self.display(*t)),
            Descriptor::Array { elem } => format!("{}[]", self.display(*elem)),
            Descriptor::Struct { name, .. } => format!(
                "struct {}",
                name.as_deref().unwrap_or("<anonymous>")
            ),
            Descriptor::Union { name, .. } => {
                format!("union {}", name.as_deref().unwrap_or("<anonymous>"))
            }
            Descriptor::Enum { name, .. } => {
                format!("enum {}", name.as_deref().unwrap_or("<anonymous>"))
            }
            Descriptor::Opaque { size } => format!("opaque[{size}]"),
            Descriptor::Alias { name, .. } => name.clone(),
        }
    }
}
