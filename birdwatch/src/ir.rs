//! IR reconstruction.
//!
//! The compiler's IR lives in one allocation indexed by biased references:
//! slots below `REF_BIAS` hold the constant pool, slots above it the
//! emitted instructions. Rebasing by the trace's lowest reference turns
//! the whole thing into a zero-based array whose first `REF_BIAS - nk`
//! slots are constants. Opcode, type, and operand-mode names all come from
//! the audit log's own debug info, so the decoder tracks whatever compiler
//! revision wrote the log.

use crate::auditlog::memory::{string_at, Cursor};
use crate::auditlog::trace::Trace;
use crate::auditlog::AuditModel;
use crate::errors::{ModelError, Result};
use birdwatch_dwarf::DwarfError;
use tracing::debug;

/// Opcodes that consume the following slot as an inline 64-bit constant.
const CONST64_OPS: [&str; 5] = ["kgc", "kptr", "kkptr", "knum", "kint64"];

/// Opcodes whose second operand is an index literal, not an IR reference.
const INDEX_OPS: [&str; 11] = [
    "fpmath", "urefo", "urefc", "fref", "fload", "calln", "calll", "calls", "base", "pval",
    "rename",
];

const SLOAD_FLAGS: [(u16, &str); 6] = [
    (0x01, "parent"),
    (0x02, "frame"),
    (0x04, "typecheck"),
    (0x08, "convert"),
    (0x10, "readonly"),
    (0x20, "inherit"),
];

const XLOAD_FLAGS: [(u16, &str); 3] = [(0x01, "readonly"), (0x02, "volatile"), (0x04, "unaligned")];

/// A materialized constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IrConst {
    /// Zero-based slot in the rebased IR array.
    pub index: u32,
    pub ty: String,
    pub value: ConstValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Num(f64),
    Int(i64),
    Uint(u64),
    Str(String),
    /// A function constant, reduced to its prototype.
    Proto {
        address: u64,
        declname: Option<String>,
    },
    Raw(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Base-biased IR reference, rebased to the zero-based view; carries
    /// the constant when it points into the pool.
    Ref {
        index: u32,
        constant: Option<Box<IrConst>>,
    },
    Lit(u16),
    Cst(i32),
    /// Literal rendered as an index (upvalue slots, field ids, call ids).
    Index(u16),
    Flags {
        raw: u16,
        names: Vec<&'static str>,
    },
    Conv {
        src: String,
        dst: String,
        raw: u16,
    },
    Ctype {
        id: u64,
        desc: Option<String>,
    },
}

/// One decoded IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Irins {
    /// Zero-based slot in the rebased IR array.
    pub index: u32,
    pub opcode: String,
    pub ty: String,
    pub reg: u8,
    pub slot: u8,
    /// Sunk to a side exit: no register, no stack slot.
    pub sunk: bool,
    pub op1: Option<Operand>,
    pub op2: Option<Operand>,
}

impl std::fmt::Display for ConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstValue::Num(n) => write!(f, "{n}"),
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Uint(v) => write!(f, "{v:#x}"),
            ConstValue::Str(s) => write!(f, "{s:?}"),
            ConstValue::Proto { address, declname } => match declname {
                Some(name) => write!(f, "proto:{name}"),
                None => write!(f, "proto:{address:#x}"),
            },
            ConstValue::Raw(v) => write!(f, "{v:#x}"),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Ref {
                constant: Some(c), ..
            } => write!(f, "{}", c.value),
            Operand::Ref { index, .. } => write!(f, "{index:04}"),
            Operand::Lit(v) => write!(f, "#{v}"),
            Operand::Cst(v) => write!(f, "{v}"),
            Operand::Index(v) => write!(f, "#{v}"),
            Operand::Flags { names, raw } => {
                if names.is_empty() {
                    write!(f, "#{raw}")
                } else {
                    write!(f, "{}", names.join("."))
                }
            }
            Operand::Conv { src, dst, .. } => write!(f, "{src}.{dst}"),
            Operand::Ctype { id, desc } => match desc {
                Some(desc) => write!(f, "ctype:{desc}"),
                None => write!(f, "ctype:{id}"),
            },
        }
    }
}

impl std::fmt::Display for Irins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04} ", self.index)?;
        if self.sunk {
            write!(f, "{{sink}} ")?;
        }
        write!(f, "{:>6} {:<6}", self.ty, self.opcode)?;
        if let Some(op1) = &self.op1 {
            write!(f, " {op1}")?;
        }
        if let Some(op2) = &self.op2 {
            write!(f, " {op2}")?;
        }
        Ok(())
    }
}

/// Naming tables pulled out of DWARF once per decode.
struct IrTables {
    ref_bias: u32,
    ir_max: usize,
    op_names: Vec<Option<String>>,
    type_names: Vec<String>,
    mode: Vec<u8>,
    m_ref: u8,
    m_lit: u8,
    m_cst: u8,
}

impl IrTables {
    fn build(model: &AuditModel) -> Result<IrTables> {
        let dwarf = &model.dwarf;
        let missing = |name: &str| ModelError::Dwarf(DwarfError::MissingDie(name.to_string()));

        let ref_bias = dwarf.constant("REF_BIAS").ok_or_else(|| missing("REF_BIAS"))? as u32;
        let ir_max = dwarf.constant("IR__MAX").ok_or_else(|| missing("IR__MAX"))? as usize;

        let irop_ty = dwarf.type_named("IROp")?;
        let mut op_names = vec![None; ir_max];
        for (name, value) in dwarf.enum_variants(irop_ty) {
            if let Some(stripped) = name.strip_prefix("IR_") {
                if (0..ir_max as i64).contains(&value) && !stripped.starts_with('_') {
                    op_names[value as usize] = Some(stripped.to_lowercase());
                }
            }
        }

        let irt_ty = dwarf.type_named("IRType")?;
        let mut type_names = vec!["?".to_string(); 32];
        for (name, value) in dwarf.enum_variants(irt_ty) {
            if let Some(stripped) = name.strip_prefix("IRT_") {
                if (0..32).contains(&value) && !stripped.starts_with('_') {
                    type_names[value as usize] = stripped.to_lowercase();
                }
            }
        }

        let irmode_ty = dwarf.type_named("IRMode")?;
        let mode_value = |name: &str| -> Result<u8> {
            Ok(dwarf.enum_value(irmode_ty, name).ok_or_else(|| missing(name))? as u8)
        };
        let m_ref = mode_value("IRMref")?;
        let m_lit = mode_value("IRMlit")?;
        let m_cst = mode_value("IRMcst")?;

        let (mode_addr, _) = model.ir_mode_view.ok_or_else(|| missing("lj_ir_mode"))?;
        let mode = model.mem.bytes(mode_addr, ir_max)?.to_vec();

        Ok(IrTables {
            ref_bias,
            ir_max,
            op_names,
            type_names,
            mode,
            m_ref,
            m_lit,
            m_cst,
        })
    }

    fn op_name(&self, o: usize) -> Option<&str> {
        self.op_names.get(o).and_then(|n| n.as_deref())
    }
}

/// Decode the full IR stream of a trace: constants first (descending, so a
/// 64-bit constant can claim the payload slot above it), then the emitted
/// instructions.
pub fn instructions(model: &AuditModel, trace: &Trace) -> Result<Vec<Irins>> {
    let tables = IrTables::build(model)?;
    let dwarf = &model.dwarf;
    let irins_ty = dwarf.type_named("IRIns")?;
    let irins_size = dwarf.size_of(irins_ty);
    let slot_at = |i: usize| {
        Cursor::new(
            dwarf,
            &model.mem,
            trace.ir_base_addr + i as u64 * irins_size,
            irins_ty,
        )
    };

    let nk_count = tables.ref_bias.saturating_sub(trace.nk) as usize;
    let mut constants: Vec<Option<IrConst>> = (0..nk_count).map(|_| None).collect();
    for i in (0..nk_count).rev() {
        let cur = slot_at(i);
        let o = cur.field("o")?.read_u64()? as usize;
        let tname = tables.type_names[(cur.field("t")?.read_u64()? & 0x1f) as usize].clone();
        let op12 = cur.field("op12")?.read_u64()? as u32;
        let value = match tables.op_name(o) {
            Some(op) if CONST64_OPS.contains(&op) => {
                // The slot above carries the raw 64-bit payload.
                let payload =
                    u64::from_le_bytes(slot_at(i + 1).bytes(8)?.try_into().unwrap());
                if i + 1 < nk_count {
                    constants[i + 1] = None;
                }
                const64_value(model, &tname, payload)?
            }
            Some("kint") => ConstValue::Int(op12 as i32 as i64),
            _ => ConstValue::Raw(op12 as u64),
        };
        constants[i] = Some(IrConst {
            index: i as u32,
            ty: tname,
            value,
        });
    }

    let mut out = Vec::new();
    let ninstr = trace.nins.saturating_sub(tables.ref_bias) as usize;
    for i in 1..ninstr {
        let index = nk_count + i;
        let cur = slot_at(index);
        let o = cur.field("o")?.read_u64()? as usize;
        if o >= tables.ir_max {
            debug!(slot = index, opcode = o, "skipping out-of-range IR opcode");
            continue;
        }
        let opcode = tables
            .op_name(o)
            .map(str::to_string)
            .unwrap_or_else(|| format!("op{o}"));
        let ty = tables.type_names[(cur.field("t")?.read_u64()? & 0x1f) as usize].clone();
        let reg = cur.field("r")?.read_u64()? as u8;
        let slot = cur.field("s")?.read_u64()? as u8;
        let sunk = (reg == 253 || reg == 254) && (slot == 0 || slot == 255);
        let op1val = cur.field("op1")?.read_u64()? as u16;
        let op2val = cur.field("op2")?.read_u64()? as u16;
        let op12 = cur.field("op12")?.read_u64()? as u32;

        let mode = tables.mode[o];
        let mut op1 = operand(&tables, trace, &constants, mode & 3, op1val, op12);
        let mut op2 = operand(&tables, trace, &constants, (mode >> 2) & 3, op2val, op12);

        match opcode.as_str() {
            "sload" => op2 = Some(flags_operand(op2val, &SLOAD_FLAGS)),
            "xload" => op2 = Some(flags_operand(op2val, &XLOAD_FLAGS)),
            "conv" => {
                op2 = Some(Operand::Conv {
                    src: tables.type_names[(op2val & 0x1f) as usize].clone(),
                    dst: tables.type_names[((op2val >> 5) & 0x1f) as usize].clone(),
                    raw: op2val,
                })
            }
            "cnew" | "cnewi" => {
                if let Some(id) = ctype_id(&op1) {
                    op1 = Some(Operand::Ctype {
                        id,
                        desc: model.ctypes.get(&id).cloned(),
                    });
                }
            }
            name if INDEX_OPS.contains(&name) => op2 = Some(Operand::Index(op2val)),
            _ => {}
        }

        out.push(Irins {
            index: index as u32,
            opcode,
            ty,
            reg,
            slot,
            sunk,
            op1,
            op2,
        });
    }
    Ok(out)
}

fn operand(
    tables: &IrTables,
    trace: &Trace,
    constants: &[Option<IrConst>],
    mode: u8,
    val: u16,
    op12: u32,
) -> Option<Operand> {
    if mode == tables.m_ref {
        let index = (val as i64 - trace.nk as i64).max(0) as u32;
        let constant = if (val as u32) < tables.ref_bias {
            constants
                .get(index as usize)
                .and_then(|c| c.clone())
                .map(Box::new)
        } else {
            None
        };
        Some(Operand::Ref { index, constant })
    } else if mode == tables.m_lit {
        Some(Operand::Lit(val))
    } else if mode == tables.m_cst {
        Some(Operand::Cst(op12 as i32))
    } else {
        None
    }
}

fn flags_operand(raw: u16, table: &[(u16, &'static str)]) -> Operand {
    Operand::Flags {
        raw,
        names: table
            .iter()
            .filter(|(bit, _)| raw & bit != 0)
            .map(|(_, name)| *name)
            .collect(),
    }
}

fn ctype_id(op: &Option<Operand>) -> Option<u64> {
    match op {
        Some(Operand::Ref {
            constant: Some(c), ..
        }) => match c.value {
            ConstValue::Int(v) if v >= 0 => Some(v as u64),
            ConstValue::Uint(v) | ConstValue::Raw(v) => Some(v),
            _ => None,
        },
        _ => None,
    }
}

fn const64_value(model: &AuditModel, tname: &str, payload: u64) -> Result<ConstValue> {
    let dwarf = &model.dwarf;
    Ok(match tname {
        "num" => ConstValue::Num(f64::from_bits(payload)),
        "intp" => ConstValue::Uint(payload),
        "str" => {
            let gcstr_ty = dwarf.type_named("GCstr")?;
            ConstValue::Str(string_at(dwarf, &model.mem, gcstr_ty, payload)?)
        }
        "func" => {
            // The function's bytecode pointer sits right after its
            // prototype; step back to the GCproto.
            let gcfunc_ty = dwarf.type_named("GCfunc")?;
            let func = Cursor::new(dwarf, &model.mem, payload, gcfunc_ty);
            let pc = func
                .field("l")
                .and_then(|l| l.field("pc"))
                .or_else(|_| func.field("pc"))?
                .read_u64()?;
            let address = pc - dwarf.size_of(dwarf.type_named("GCproto")?);
            let declname = model.prototypes.get(&address).map(|p| p.declname.clone());
            ConstValue::Proto { address, declname }
        }
        _ => ConstValue::Raw(payload),
    })
}
