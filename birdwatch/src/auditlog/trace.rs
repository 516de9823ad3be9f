//! Traces, aborted trace attempts, and their queries.

use crate::auditlog::memory::{Cursor, MemoryMap};
use crate::auditlog::AuditModel;
use crate::bytecode::{self, Bytecode};
use crate::errors::{ModelError, Result};
use crate::ir::Irins;
use birdwatch_dwarf::DwarfInfo;
use std::sync::OnceLock;

/// One entry of the JIT state's bytecode log: the prototype being
/// executed, the position within it, and the frame depth at that moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BcLogEntry {
    pub pt: u64,
    pub pos: i32,
    pub framedepth: i32,
}

/// A successfully compiled trace, snapshotted at its `trace_stop` event.
#[derive(Debug)]
pub struct Trace {
    pub traceno: u16,
    pub gctrace_addr: u64,
    pub jit_state_addr: u64,
    /// Parent trace number; 0 for a root trace.
    pub parent: u16,
    pub startpc: u64,
    pub nins: u32,
    pub nk: u32,
    /// Address of the IR allocation start (`ir + nk`, the base-biased
    /// array re-homed to slot 0).
    pub ir_base_addr: u64,
    pub mcode_addr: u64,
    pub szmcode: u64,
    pub snap_addr: u64,
    pub nsnap: u32,
    pub snapmap_addr: u64,
    pub nsnapmap: u32,
    pub szirmcode_addr: u64,
    pub bclog: Vec<BcLogEntry>,
    /// Index of the creating `trace_stop` event.
    pub event_index: usize,
    pub(crate) children: OnceLock<Vec<u16>>,
}

/// A failed trace attempt: same bytecode-log contract as a trace, plus the
/// symbolic error resolved from the runtime's error enum.
#[derive(Debug)]
pub struct TraceAbort {
    pub jit_state_addr: u64,
    pub trace_error: String,
    pub parent: u16,
    pub startpc: u64,
    pub bclog: Vec<BcLogEntry>,
    pub event_index: usize,
}

/// Source attribution for one bytecode-log position.
#[derive(Debug, Clone, PartialEq)]
pub struct LineInfo {
    pub framedepth: i32,
    pub chunkname: String,
    pub chunkline: u32,
    pub declname: String,
    pub declline: i64,
}

fn resolve_fatal(mem: &MemoryMap, addr: u64) -> Result<()> {
    if addr != 0 && mem.resolve(addr).is_none() {
        return Err(ModelError::MissingMemory(addr));
    }
    Ok(())
}

fn read_bclog(dwarf: &DwarfInfo, mem: &MemoryMap, jit: &Cursor) -> Result<Vec<BcLogEntry>> {
    let bclog_field = jit.field("bclog")?;
    let bclog_ptr = bclog_field.read_u64()?;
    let nbclog = jit.field("nbclog")?.read_u64()?;
    if nbclog == 0 {
        return Ok(Vec::new());
    }
    resolve_fatal(mem, bclog_ptr)?;
    let entry_ty = dwarf
        .pointee(bclog_field.ty)
        .map(Ok)
        .unwrap_or_else(|| dwarf.type_named("BCRecLog"))?;
    let entries = Cursor::new(dwarf, mem, bclog_ptr, entry_ty);
    let mut bclog = Vec::with_capacity(nbclog as usize);
    for i in 0..nbclog {
        let entry = entries.index(i);
        bclog.push(BcLogEntry {
            pt: entry.field("pt")?.read_u64()?,
            pos: entry.field("pos")?.read_i64()? as i32,
            framedepth: entry.field("framedepth")?.read_i64()? as i32,
        });
    }
    Ok(bclog)
}

impl Trace {
    pub(crate) fn build(
        dwarf: &DwarfInfo,
        mem: &MemoryMap,
        gctrace_addr: u64,
        jit_state_addr: u64,
        event_index: usize,
        record_index: usize,
    ) -> Result<Trace> {
        resolve_fatal(mem, gctrace_addr)?;
        resolve_fatal(mem, jit_state_addr)?;

        let trace_ty = dwarf.type_named("GCtrace")?;
        let trace = Cursor::new(dwarf, mem, gctrace_addr, trace_ty);

        let raw_traceno = trace.field("traceno")?.read_u64()?;
        let traceno = raw_traceno as u16;
        if traceno as u64 != raw_traceno || traceno == 0 {
            return Err(ModelError::MalformedRecord {
                index: record_index,
                reason: format!("trace number {raw_traceno} out of range"),
            });
        }

        let nins = trace.field("nins")?.read_u64()? as u32;
        let nk = trace.field("nk")?.read_u64()? as u32;
        let ir_ptr = trace.field("ir")?.read_u64()?;
        let irins_size = dwarf.size_of(dwarf.type_named("IRIns")?);
        let ir_base_addr = ir_ptr + nk as u64 * irins_size;

        let mcode_addr = trace.field("mcode")?.read_u64()?;
        let szmcode = trace.field("szmcode")?.read_u64()?;
        let snap_addr = trace.field("snap")?.read_u64()?;
        let nsnap = trace.field("nsnap")?.read_u64()? as u32;
        let snapmap_addr = trace.field("snapmap")?.read_u64()?;
        let nsnapmap = trace.field("nsnapmap")?.read_u64()? as u32;
        let szirmcode_addr = trace.field("szirmcode")?.read_u64()?;
        for addr in [mcode_addr, snap_addr, snapmap_addr, ir_base_addr, szirmcode_addr] {
            resolve_fatal(mem, addr)?;
        }

        let jit_ty = dwarf.type_named("jit_State")?;
        let jit = Cursor::new(dwarf, mem, jit_state_addr, jit_ty);
        let parent = jit.field("parent")?.read_u64()? as u16;
        let startpc = jit.field("startpc")?.read_u64()?;
        let bclog = read_bclog(dwarf, mem, &jit)?;

        Ok(Trace {
            traceno,
            gctrace_addr,
            jit_state_addr,
            parent,
            startpc,
            nins,
            nk,
            ir_base_addr,
            mcode_addr,
            szmcode,
            snap_addr,
            nsnap,
            snapmap_addr,
            nsnapmap,
            szirmcode_addr,
            bclog,
            event_index,
            children: OnceLock::new(),
        })
    }

    /// Identity of this trace's entry point, shared with aborts that gave
    /// up at the same place.
    pub fn start_id(&self) -> String {
        format!("{}/{:#x}", self.parent, self.startpc)
    }
}

impl TraceAbort {
    pub(crate) fn build(
        dwarf: &DwarfInfo,
        mem: &MemoryMap,
        jit_state_addr: u64,
        trace_error: u64,
        event_index: usize,
    ) -> Result<TraceAbort> {
        resolve_fatal(mem, jit_state_addr)?;
        let jit_ty = dwarf.type_named("jit_State")?;
        let jit = Cursor::new(dwarf, mem, jit_state_addr, jit_ty);
        let parent = jit.field("parent")?.read_u64()? as u16;
        let startpc = jit.field("startpc")?.read_u64()?;
        let bclog = read_bclog(dwarf, mem, &jit)?;

        let te_ty = dwarf.type_named("TraceError")?;
        let trace_error = dwarf
            .enum_name(te_ty, trace_error as i64)
            .map(|name| {
                name.strip_prefix("LJ_TRERR_")
                    .map(str::to_string)
                    .unwrap_or(name)
            })
            .unwrap_or_else(|| trace_error.to_string());

        Ok(TraceAbort {
            jit_state_addr,
            trace_error,
            parent,
            startpc,
            bclog,
            event_index,
        })
    }

    pub fn start_id(&self) -> String {
        format!("{}/{:#x}", self.parent, self.startpc)
    }
}

/// Borrowing query handle over one trace of a loaded model.
#[derive(Clone, Copy)]
pub struct TraceView<'a> {
    pub(crate) model: &'a AuditModel,
    pub(crate) trace: &'a Trace,
}

impl<'a> TraceView<'a> {
    pub fn number(&self) -> u16 {
        self.trace.traceno
    }

    pub fn data(&self) -> &'a Trace {
        self.trace
    }

    pub fn start_id(&self) -> String {
        self.trace.start_id()
    }

    /// The parent trace; `None` for a root trace.
    pub fn parent(&self) -> Option<TraceView<'a>> {
        if self.trace.parent == 0 {
            return None;
        }
        self.model.trace(self.trace.parent)
    }

    /// Trace numbers whose parent is this trace, in trace-table order.
    pub fn children(&self) -> &'a [u16] {
        self.trace.children.get_or_init(|| {
            self.model
                .traces_data()
                .filter(|t| t.parent == self.trace.traceno)
                .map(|t| t.traceno)
                .collect()
        })
    }

    /// The creating `trace_stop` event plus every abort that shares this
    /// trace's start id.
    pub fn events(&self) -> Vec<&'a crate::auditlog::Event> {
        let start_id = self.start_id();
        let mut events = vec![&self.model.events[self.trace.event_index]];
        events.extend(
            self.model
                .aborts
                .iter()
                .filter(|abort| abort.start_id() == start_id)
                .map(|abort| &self.model.events[abort.event_index]),
        );
        events
    }

    /// Source attribution for one bytecode-log position. An unknown
    /// prototype renders as `'?'` with zero lines.
    pub fn lineinfo(&self, bcpos: usize) -> Option<LineInfo> {
        let entry = self.trace.bclog.get(bcpos)?;
        Some(match self.model.prototypes.get(&entry.pt) {
            Some(proto) => LineInfo {
                framedepth: entry.framedepth,
                chunkname: proto.chunkname.clone(),
                chunkline: proto.line(entry.pos.max(0) as u32),
                declname: proto.declname.clone(),
                declline: proto.firstline,
            },
            None => LineInfo {
                framedepth: entry.framedepth,
                chunkname: "?".to_string(),
                chunkline: 0,
                declname: "?".to_string(),
                declline: 0,
            },
        })
    }

    /// The frame-transition summary: one entry per change of frame depth,
    /// skipping frames whose prototype is unknown.
    pub fn contour(&self) -> Vec<LineInfo> {
        let mut out: Vec<LineInfo> = Vec::new();
        let mut last_depth: Option<i32> = None;
        for bcpos in 0..self.trace.bclog.len() {
            let Some(li) = self.lineinfo(bcpos) else {
                continue;
            };
            if li.declname != "?" && last_depth != Some(li.framedepth) {
                last_depth = Some(li.framedepth);
                out.push(li);
            }
        }
        out
    }

    /// One decoded instruction per logged bytecode position; `None` where
    /// the prototype is unknown or the position is out of range.
    pub fn bytecodes(&self) -> Vec<Option<Bytecode>> {
        self.trace
            .bclog
            .iter()
            .map(|entry| {
                let proto = self.model.prototypes.get(&entry.pt)?;
                let word = proto.bytecode.get(entry.pos.max(0) as usize)?;
                Some(bytecode::decode(*word))
            })
            .collect()
    }

    /// The reconstructed IR stream; see the `ir` module.
    pub fn instructions(&self) -> Result<Vec<Irins>> {
        crate::ir::instructions(self.model, self.trace)
    }
}
