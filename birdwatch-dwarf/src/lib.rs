//! ELF/DWARF loading and layout-descriptor synthesis for birdwatch.
//!
//! An audit log embeds a relocatable ELF object whose split-DWARF sections
//! describe every runtime structure the log snapshots. This crate walks the
//! ELF section table, drives gimli over the debug sections, and synthesizes
//! layout-accurate descriptors (records, unions, enums, pointers) that the
//! model layer uses to read raw memory images field by field.

pub mod elf;
pub mod errors;
pub mod loader;
pub mod types;

pub use elf::ElfImage;
pub use errors::{DwarfError, Result};
pub use loader::{DieRef, DwarfInfo};
pub use types::{Descriptor, Field, TypeId};
