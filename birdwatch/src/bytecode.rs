//! Bytecode instruction decoding.
//!
//! A 32-bit instruction is `op(8)|a(8)|c(8)|b(8)` for three-operand forms
//! or `op(8)|a(8)|d(16)` for two-operand forms; which form applies is a
//! property of the operator. The schema table below is the runtime's
//! operator list in numbering order and must stay in sync with it.

/// Operand kinds. `None` marks an unused slot; a `None` B operand selects
/// the AD instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Variable slot.
    Var,
    /// Destination slot.
    Dst,
    /// Base slot (starts a range).
    Base,
    /// Read-only base slot.
    RBase,
    /// Upvalue index.
    Uv,
    /// Unsigned literal.
    Lit,
    /// Signed 16-bit literal.
    Lits,
    /// Primitive: 0 = nil, 1 = false, 2 = true.
    Pri,
    /// Number-constant index.
    Num,
    /// String-constant index.
    Str,
    /// Template-table index.
    Tab,
    /// Prototype index.
    Func,
    /// Cdata-constant index.
    Cdata,
    /// Branch target, biased by 0x8000.
    Jump,
}

/// Per-operator schema: operand kinds for A/B/C (or A/D) and a
/// human-readable summary.
pub struct OpDef {
    pub name: &'static str,
    pub a: Operand,
    pub b: Operand,
    pub cd: Operand,
    pub hint: &'static str,
}

macro_rules! opdef {
    ($name:literal, $a:ident, $b:ident, $cd:ident, $hint:literal) => {
        OpDef {
            name: $name,
            a: Operand::$a,
            b: Operand::$b,
            cd: Operand::$cd,
            hint: $hint,
        }
    };
}

/// The operator table, in opcode-numbering order.
pub const OPCODES: &[OpDef] = &[
    // Comparison ops. All branch by pairing with a following JMP.
    opdef!("ISLT", Var, None, Var, "Jump if A < D"),
    opdef!("ISGE", Var, None, Var, "Jump if A >= D"),
    opdef!("ISLE", Var, None, Var, "Jump if A <= D"),
    opdef!("ISGT", Var, None, Var, "Jump if A > D"),
    opdef!("ISEQV", Var, None, Var, "Jump if A = D"),
    opdef!("ISNEV", Var, None, Var, "Jump if A ~= D"),
    opdef!("ISEQS", Var, None, Str, "Jump if A = string constant D"),
    opdef!("ISNES", Var, None, Str, "Jump if A ~= string constant D"),
    opdef!("ISEQN", Var, None, Num, "Jump if A = number constant D"),
    opdef!("ISNEN", Var, None, Num, "Jump if A ~= number constant D"),
    opdef!("ISEQP", Var, None, Pri, "Jump if A = primitive D"),
    opdef!("ISNEP", Var, None, Pri, "Jump if A ~= primitive D"),
    // Unary test and copy ops.
    opdef!("ISTC", Dst, None, Var, "Copy D to A and jump, if D is true"),
    opdef!("ISFC", Dst, None, Var, "Copy D to A and jump, if D is false"),
    opdef!("IST", None, None, Var, "Jump if D is true"),
    opdef!("ISF", None, None, Var, "Jump if D is false"),
    opdef!("ISTYPE", Var, None, Lit, "Assert that A has type D"),
    opdef!("ISNUM", Var, None, Lit, "Assert that A is a number"),
    // Unary ops.
    opdef!("MOV", Dst, None, Var, "Copy D to A"),
    opdef!("NOT", Dst, None, Var, "Set A to boolean not of D"),
    opdef!("UNM", Dst, None, Var, "Set A to -D (unary minus)"),
    opdef!("LEN", Dst, None, Var, "Set A to #D (object length)"),
    // Binary ops. VN = variable/number-constant, NV = reversed operands,
    // VV = variable/variable.
    opdef!("ADDVN", Dst, Var, Num, "A = B + C"),
    opdef!("SUBVN", Dst, Var, Num, "A = B - C"),
    opdef!("MULVN", Dst, Var, Num, "A = B * C"),
    opdef!("DIVVN", Dst, Var, Num, "A = B / C"),
    opdef!("MODVN", Dst, Var, Num, "A = B % C"),
    opdef!("ADDNV", Dst, Var, Num, "A = C + B"),
    opdef!("SUBNV", Dst, Var, Num, "A = C - B"),
    opdef!("MULNV", Dst, Var, Num, "A = C * B"),
    opdef!("DIVNV", Dst, Var, Num, "A = C / B"),
    opdef!("MODNV", Dst, Var, Num, "A = C % B"),
    opdef!("ADDVV", Dst, Var, Var, "A = B + C"),
    opdef!("SUBVV", Dst, Var, Var, "A = B - C"),
    opdef!("MULVV", Dst, Var, Var, "A = B * C"),
    opdef!("DIVVV", Dst, Var, Var, "A = B / C"),
    opdef!("MODVV", Dst, Var, Var, "A = B % C"),
    opdef!("POW", Dst, Var, Var, "A = B ^ C"),
    opdef!("CAT", Dst, RBase, RBase, "A = B .. ~ .. C (concatenate slots B to C)"),
    // Constant ops.
    opdef!("KSTR", Dst, None, Str, "Set A to string constant D"),
    opdef!("KCDATA", Dst, None, Cdata, "Set A to cdata constant D"),
    opdef!("KSHORT", Dst, None, Lits, "Set A to 16 bit signed integer D"),
    opdef!("KNUM", Dst, None, Num, "Set A to number constant D"),
    opdef!("KPRI", Dst, None, Pri, "Set A to primitive D"),
    opdef!("KNIL", Base, None, Base, "Set slots A to D to nil"),
    // Upvalue and function ops.
    opdef!("UGET", Dst, None, Uv, "Set A to upvalue D"),
    opdef!("USETV", Uv, None, Var, "Set upvalue A to D"),
    opdef!("USETS", Uv, None, Str, "Set upvalue A to string constant D"),
    opdef!("USETN", Uv, None, Num, "Set upvalue A to number constant D"),
    opdef!("USETP", Uv, None, Pri, "Set upvalue A to primitive D"),
    opdef!("UCLO", RBase, None, Jump, "Close upvalues for slots >= A and jump to D"),
    opdef!("FNEW", Dst, None, Func, "Create new closure from prototype D and store it in A"),
    // Table ops.
    opdef!("TNEW", Dst, None, Lit, "Set A to new table with size D"),
    opdef!("TDUP", Dst, None, Tab, "Set A to duplicated template table D"),
    opdef!("GGET", Dst, None, Str, "A = _G[D]"),
    opdef!("GSET", Var, None, Str, "_G[D] = A"),
    opdef!("TGETV", Dst, Var, Var, "A = B[C]"),
    opdef!("TGETS", Dst, Var, Str, "A = B[C]"),
    opdef!("TGETB", Dst, Var, Lit, "A = B[C]"),
    opdef!("TGETR", Dst, Var, Var, "A = B[C] (rawget)"),
    opdef!("TSETV", Var, Var, Var, "B[C] = A"),
    opdef!("TSETS", Var, Var, Str, "B[C] = A"),
    opdef!("TSETB", Var, Var, Lit, "B[C] = A"),
    opdef!("TSETM", Base, None, Num, "(A-1)[D], (A-1)[D+1], ... = A, A+1, ..."),
    opdef!("TSETR", Var, Var, Var, "B[C] = A (rawset)"),
    // Calls and vararg handling.
    opdef!("CALLM", Base, Lit, Lit, "Call: A, ..., A+B-2 = A(A+1, ..., A+C+MULTRES)"),
    opdef!("CALL", Base, Lit, Lit, "Call: A, ..., A+B-2 = A(A+1, ..., A+C-1)"),
    opdef!("CALLMT", Base, None, Lit, "Tailcall: return A(A+1, ..., A+D+MULTRES)"),
    opdef!("CALLT", Base, None, Lit, "Tailcall: return A(A+1, ..., A+D-1)"),
    opdef!(
        "ITERC",
        Base,
        Lit,
        Lit,
        "Call iterator: A, A+1, A+2 = A-3, A-2, A-1; A, ..., A+B-2 = A(A+1, A+2)"
    ),
    opdef!("ITERN", Base, Lit, Lit, "Specialized ITERC, if iterator function A-3 is next()"),
    opdef!("VARG", Base, Lit, Lit, "Vararg: A, ..., A+B-2 = ..."),
    opdef!("ISNEXT", Base, None, Jump, "Verify ITERN specialization and jump"),
    // Returns.
    opdef!("RETM", Base, None, Lit, "return A, ..., A+D+MULTRES-1"),
    opdef!("RET", RBase, None, Lit, "return A, ..., A+D-2"),
    opdef!("RET0", RBase, None, Lit, "return"),
    opdef!("RET1", RBase, None, Lit, "return A"),
    // Loops and branches.
    opdef!("FORI", Base, None, Jump, "Numeric 'for' loop init"),
    opdef!("JFORI", Base, None, Jump, "Numeric 'for' loop init, JIT-compiled"),
    opdef!("FORL", Base, None, Jump, "Numeric 'for' loop"),
    opdef!("IFORL", Base, None, Jump, "Numeric 'for' loop, force interpreter"),
    opdef!("JFORL", Base, None, Lit, "Numeric 'for' loop, JIT-compiled"),
    opdef!("ITERL", Base, None, Jump, "Iterator 'for' loop"),
    opdef!("IITERL", Base, None, Jump, "Iterator 'for' loop, force interpreter"),
    opdef!("JITERL", Base, None, Lit, "Iterator 'for' loop, JIT-compiled"),
    opdef!("LOOP", RBase, None, Jump, "Generic loop"),
    opdef!("ILOOP", RBase, None, Jump, "Generic loop, force interpreter"),
    opdef!("JLOOP", RBase, None, Lit, "Generic loop, JIT-compiled"),
    opdef!("JMP", RBase, None, Jump, "Jump"),
    // Function headers.
    opdef!("FUNCF", RBase, None, None, "Fixed-arg Lua function"),
    opdef!("IFUNCF", RBase, None, None, "Fixed-arg Lua function, force interpreter"),
    opdef!("JFUNCF", RBase, None, Lit, "Fixed-arg Lua function, JIT-compiled"),
    opdef!("FUNCV", RBase, None, None, "Vararg Lua function"),
    opdef!("IFUNCV", RBase, None, None, "Vararg Lua function, force interpreter"),
    opdef!("JFUNCV", RBase, None, Lit, "Vararg Lua function, JIT-compiled"),
    opdef!("FUNCC", RBase, None, None, "Pseudo-header for C functions"),
    opdef!("FUNCCW", RBase, None, None, "Pseudo-header for wrapped C functions"),
];

const JUMP_BIAS: i32 = 0x8000;

/// A decoded instruction. `b`/`c` are set for the three-operand form,
/// `d` for the two-operand form; `j` is the unbiased branch offset when the
/// D operand is a jump target, `sd` the reinterpretation of D when it is a
/// signed literal, and `pri` the primitive name when it encodes one.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub op: String,
    pub a: u8,
    pub b: Option<u8>,
    pub c: Option<u8>,
    pub d: Option<u16>,
    pub j: Option<i32>,
    pub sd: Option<i16>,
    pub pri: Option<&'static str>,
    pub hint: String,
}

impl std::fmt::Display for Bytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<6} {:3}", self.op, self.a)?;
        if let (Some(b), Some(c)) = (self.b, self.c) {
            write!(f, " {b:3} {c:3}")?;
        } else if let Some(j) = self.j {
            write!(f, " => {j:+}")?;
        } else if let Some(sd) = self.sd {
            write!(f, " {sd}")?;
        } else if let Some(pri) = self.pri {
            write!(f, " {pri}")?;
        } else if let Some(d) = self.d {
            write!(f, " {d}")?;
        }
        write!(f, "  ; {}", self.hint)
    }
}

/// Decode one 32-bit instruction word.
pub fn decode(word: u32) -> Bytecode {
    let op = (word & 0xff) as u8;
    let a = ((word >> 8) & 0xff) as u8;
    let c = ((word >> 16) & 0xff) as u8;
    let b = ((word >> 24) & 0xff) as u8;
    let d = (word >> 16) as u16;

    let Some(def) = OPCODES.get(op as usize) else {
        return Bytecode {
            op: format!("0x{op:02x}"),
            a,
            b: Some(b),
            c: Some(c),
            d: Some(d),
            j: None,
            sd: None,
            pri: None,
            hint: "Unknown bytecode".to_string(),
        };
    };

    if def.b != Operand::None {
        Bytecode {
            op: def.name.to_string(),
            a,
            b: Some(b),
            c: Some(c),
            d: None,
            j: None,
            sd: None,
            pri: None,
            hint: def.hint.to_string(),
        }
    } else {
        Bytecode {
            op: def.name.to_string(),
            a,
            b: None,
            c: None,
            d: Some(d),
            j: (def.cd == Operand::Jump).then(|| d as i32 - JUMP_BIAS),
            sd: (def.cd == Operand::Lits).then(|| d as i16),
            pri: (def.cd == Operand::Pri).then(|| match d {
                0 => "nil",
                1 => "false",
                2 => "true",
                _ => "?",
            }),
            hint: def.hint.to_string(),
        }
    }
}

/// Opcode number for an operator name. Backs fixtures and renderers.
pub fn opcode_number(name: &str) -> Option<u8> {
    OPCODES.iter().position(|def| def.name == name).map(|i| i as u8)
}

/// Pack an instruction word in the operator's form. The inverse of
/// `decode`, used by tests and synthetic fixtures.
pub fn encode(op: u8, a: u8, b: u8, c: u8, d: u16) -> u32 {
    let abc = OPCODES
        .get(op as usize)
        .map(|def| def.b != Operand::None)
        .unwrap_or(false);
    if abc {
        (op as u32) | ((a as u32) << 8) | ((c as u32) << 16) | ((b as u32) << 24)
    } else {
        (op as u32) | ((a as u32) << 8) | ((d as u32) << 16)
    }
}
