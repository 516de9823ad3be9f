//! The audit-log model: replaying a record stream into a queryable graph
//! of prototypes, traces, and events.
//!
//! Loading is two passes. Pass A scans for the embedded DWARF blob and
//! brings up the debug info; pass B replays every record in order, binding
//! memory images into the map and materializing prototype/trace/abort
//! objects from the events. Everything is immutable after load.

pub mod event;
pub mod memory;
pub mod profiles;
pub mod prototype;
pub mod trace;

pub use event::{Event, EventPayload};
pub use memory::{MemBlob, MemoryMap};
pub use profiles::Snapshot;
pub use prototype::Prototype;
pub use trace::{BcLogEntry, LineInfo, Trace, TraceAbort, TraceView};

use crate::errors::{ModelError, Result};
use crate::msgpack::{self, Value};
use birdwatch_dwarf::{DwarfInfo, ElfImage, TypeId};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the blob record carrying the embedded ELF/DWARF object.
const DWARF_BLOB_NAME: &str = "lj_dwarf.dwo";

/// A fully loaded audit log.
#[derive(Debug)]
pub struct AuditModel {
    pub(crate) dwarf: DwarfInfo,
    pub(crate) mem: MemoryMap,
    /// Every event record, in stream order.
    pub events: Vec<Event>,
    /// Prototypes keyed by their original allocation address.
    pub prototypes: BTreeMap<u64, Prototype>,
    pub(crate) traces: BTreeMap<u16, Trace>,
    /// Failed trace attempts, in stream order.
    pub aborts: Vec<TraceAbort>,
    /// C-type registrations: id to description text.
    pub ctypes: BTreeMap<u64, String>,
    /// The `lj_ir_mode` operand-mode table view, when the log carries one.
    pub(crate) ir_mode_view: Option<(u64, TypeId)>,
    pub(crate) profiles: BTreeMap<String, Vec<Snapshot>>,
}

/// Load an audit log from disk. The §6.4-style convenience entry point.
pub fn load_auditlog(path: impl AsRef<Path>) -> Result<AuditModel> {
    AuditModel::load(path)
}

impl AuditModel {
    pub fn load(path: impl AsRef<Path>) -> Result<AuditModel> {
        let file = std::fs::File::open(path.as_ref())?;
        let data = unsafe { memmap2::Mmap::map(&file)? };
        info!(path = %path.as_ref().display(), len = data.len(), "loading audit log");
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<AuditModel> {
        let records = msgpack::read_all(data)?;

        // Pass A: DWARF bring-up. The blob is mandatory; nothing else in
        // the log is interpretable without it.
        let mut dwarf = None;
        for record in &records {
            if record.get("type").and_then(Value::as_str) == Some("blob")
                && record.get("name").and_then(Value::as_str) == Some(DWARF_BLOB_NAME)
            {
                let bytes = record
                    .get("data")
                    .and_then(Value::as_bytes)
                    .ok_or(ModelError::MissingDwarfBlob)?;
                let elf = ElfImage::parse(bytes)?;
                dwarf = Some(DwarfInfo::load(&elf)?);
                break;
            }
        }
        let mut model = AuditModel {
            dwarf: dwarf.ok_or(ModelError::MissingDwarfBlob)?,
            mem: MemoryMap::default(),
            events: Vec::new(),
            prototypes: BTreeMap::new(),
            traces: BTreeMap::new(),
            aborts: Vec::new(),
            ctypes: BTreeMap::new(),
            ir_mode_view: None,
            profiles: BTreeMap::new(),
        };

        // Pass B: replay.
        for (index, record) in records.iter().enumerate() {
            let rtype = record
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| ModelError::MalformedRecord {
                    index,
                    reason: "record has no type".to_string(),
                })?;
            match rtype {
                "memory" => model.bind_memory(index, record)?,
                "blob" => {}
                "event" => model.replay_event(index, record)?,
                other => debug!(index, kind = other, "ignoring unknown record type"),
            }
        }
        info!(
            events = model.events.len(),
            traces = model.traces.len(),
            prototypes = model.prototypes.len(),
            ctypes = model.ctypes.len(),
            "audit log loaded"
        );
        Ok(model)
    }

    fn bind_memory(&mut self, index: usize, record: &Value) -> Result<()> {
        let malformed = |reason: &str| ModelError::MalformedRecord {
            index,
            reason: reason.to_string(),
        };
        let address = record
            .get("address")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("memory record has no address"))?;
        let hint_raw = record
            .get("hint")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("memory record has no hint"))?;
        let data = record
            .get("data")
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("memory record has no data"))?;

        let hint = hint_ident(hint_raw);
        if hint.is_empty() {
            return Err(malformed("memory hint is not an identifier"));
        }
        let ty = self.dwarf.hint_descriptor(hint)?;
        if hint == "lj_ir_mode" {
            self.ir_mode_view = Some((address, ty));
        }
        self.mem.insert(MemBlob {
            address,
            hint: hint.to_string(),
            ty,
            data: data.into(),
        });
        Ok(())
    }

    fn replay_event(&mut self, index: usize, record: &Value) -> Result<()> {
        let malformed = |reason: String| ModelError::MalformedRecord { index, reason };
        let name = record
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("event record has no event name".to_string()))?
            .to_string();
        let nanotime = record
            .get("nanotime")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed(format!("event {name} has no nanotime")))?;

        let field = |key: &str| -> Result<u64> {
            record
                .get(key)
                .and_then(Value::as_u64)
                .ok_or_else(|| ModelError::MalformedRecord {
                    index,
                    reason: format!("event {name} has no {key} field"),
                })
        };

        let event_index = self.events.len();
        let payload = match name.as_str() {
            "new_prototype" => {
                let address = field("GCproto")?;
                let proto = Prototype::build(&self.dwarf, &self.mem, address)?;
                self.prototypes.entry(address).or_insert(proto);
                EventPayload::NewPrototype { address }
            }
            "new_ctypeid" => {
                let id = field("id")?;
                let desc = record
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                self.ctypes.insert(id, desc.clone());
                EventPayload::NewCtype { id, desc }
            }
            "trace_stop" => {
                let trace = Trace::build(
                    &self.dwarf,
                    &self.mem,
                    field("GCtrace")?,
                    field("jit_State")?,
                    event_index,
                    index,
                )?;
                let traceno = trace.traceno;
                self.traces.insert(traceno, trace);
                EventPayload::TraceStop { traceno }
            }
            "trace_abort" => {
                let abort = TraceAbort::build(
                    &self.dwarf,
                    &self.mem,
                    field("jit_State")?,
                    field("TraceError")?,
                    event_index,
                )?;
                self.aborts.push(abort);
                EventPayload::TraceAbort {
                    abort: self.aborts.len() - 1,
                }
            }
            "lex" => EventPayload::Lex,
            other => {
                debug!(index, event = other, "event with no model action");
                EventPayload::Other
            }
        };

        let first = self.events.first().map(|e| e.nanotime).unwrap_or(nanotime);
        let prev = self.events.last().map(|e| e.nanotime).unwrap_or(nanotime);
        if nanotime < prev {
            warn!(index, nanotime, prev, "event timestamps regress");
        }
        self.events.push(Event {
            index: event_index,
            name,
            nanotime,
            reltime: nanotime.saturating_sub(first),
            nanodelta: nanotime.saturating_sub(prev),
            payload,
        });
        Ok(())
    }

    /// Borrowing query handle for a trace number.
    pub fn trace(&self, traceno: u16) -> Option<TraceView<'_>> {
        self.traces
            .get(&traceno)
            .map(|trace| TraceView { model: self, trace })
    }

    /// All traces in trace-number order.
    pub fn traces(&self) -> impl Iterator<Item = TraceView<'_>> {
        self.traces
            .values()
            .map(move |trace| TraceView { model: self, trace })
    }

    pub fn trace_numbers(&self) -> impl Iterator<Item = u16> + '_ {
        self.traces.keys().copied()
    }

    pub(crate) fn traces_data(&self) -> impl Iterator<Item = &Trace> {
        self.traces.values()
    }

    pub fn dwarf(&self) -> &DwarfInfo {
        &self.dwarf
    }

    pub fn memory(&self) -> &MemoryMap {
        &self.mem
    }
}

/// The contiguous `[A-Za-z0-9_]+` identifier prefix of a memory hint.
fn hint_ident(raw: &str) -> &str {
    let end = raw
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(raw.len());
    &raw[..end]
}
