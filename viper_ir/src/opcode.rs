//! Opcode enumeration and static per-opcode metadata
//!
//! Every opcode carries a metadata record describing its structural shape
//! (result arity, operand bounds, successor count) and its semantic class
//! (terminator, side effects, trapping behaviour, memory effects). Passes
//! consult this table instead of hard-coding opcode lists wherever possible.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory behaviour of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryEffects {
    None,
    Read,
    Write,
    ReadWrite,
    Unknown,
}

/// Number of successor labels a terminator carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccArity {
    Fixed(u8),
    /// Switch-style terminators with a label list of arbitrary length.
    Variadic,
}

/// Whether an opcode produces a result temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultArity {
    None,
    One,
    /// Calls: a result is present iff the callee returns non-void.
    Optional,
}

/// How the textual parser reads each operand position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    /// A plain value token (`%t3`, `42`, `1.5`, `null`).
    Value,
    /// Byte size immediate (alloca).
    Size,
    /// A string literal.
    StringLit,
    /// A global symbol name.
    GlobalName,
    /// Scrutinee followed by packed case values (switch.i32).
    Switch,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    /// Mnemonic as spelled by the textual IL format.
    pub mnemonic: &'static str,
    pub result: ResultArity,
    pub min_operands: u8,
    /// `u8::MAX` means variadic.
    pub max_operands: u8,
    pub operand_parse: &'static [ParseKind],
    pub successors: SuccArity,
    pub is_terminator: bool,
    pub has_side_effects: bool,
    /// Whether execution can trap; trapping instructions must survive DCE so
    /// the VM-observable trap status is preserved.
    pub can_trap: bool,
    pub memory: MemoryEffects,
}

const VARIADIC: u8 = u8::MAX;

const fn pure_op(mnemonic: &'static str, operands: u8) -> OpcodeInfo {
    OpcodeInfo {
        mnemonic,
        result: ResultArity::One,
        min_operands: operands,
        max_operands: operands,
        operand_parse: &[ParseKind::Value, ParseKind::Value],
        successors: SuccArity::Fixed(0),
        is_terminator: false,
        has_side_effects: false,
        can_trap: false,
        memory: MemoryEffects::None,
    }
}

const fn trapping_op(mnemonic: &'static str, operands: u8) -> OpcodeInfo {
    let mut info = pure_op(mnemonic, operands);
    info.can_trap = true;
    info
}

const fn terminator(mnemonic: &'static str, operands: u8, succs: SuccArity) -> OpcodeInfo {
    OpcodeInfo {
        mnemonic,
        result: ResultArity::None,
        min_operands: 0,
        max_operands: operands,
        operand_parse: &[ParseKind::Value],
        successors: succs,
        is_terminator: true,
        has_side_effects: true,
        can_trap: false,
        memory: MemoryEffects::None,
    }
}

/// All IL instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // Integer arithmetic (wrapping)
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    // Integer arithmetic, trapping on overflow
    IAddOvf,
    ISubOvf,
    IMulOvf,
    // Bitwise and shifts
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    // Integer compares
    ICmpEq,
    ICmpNe,
    SCmpLt,
    SCmpLe,
    SCmpGt,
    SCmpGe,
    UCmpLt,
    UCmpLe,
    UCmpGt,
    UCmpGe,
    // Float arithmetic and compares
    FAdd,
    FSub,
    FMul,
    FDiv,
    FCmpEq,
    FCmpNe,
    FCmpLt,
    FCmpLe,
    FCmpGt,
    FCmpGe,
    // Casts
    Sitofp,
    Fptosi,
    Zext1,
    Trunc1,
    // Memory
    Alloca,
    Load,
    Store,
    Gep,
    // Constants and addresses
    AddrOf,
    ConstStr,
    ConstNull,
    // Calls
    Call,
    CallIndirect,
    // Terminators
    Br,
    CBr,
    SwitchI32,
    Ret,
    Trap,
    ResumeSame,
    ResumeNext,
    ResumeLabel,
    // Checked operations trapping on invalid input
    IdxChk,
    SDivChk0,
    UDivChk0,
    SRemChk0,
    URemChk0,
    CastFpToSiRteChk,
    CastFpToUiRteChk,
    CastSiNarrowChk,
    CastUiNarrowChk,
}

impl Opcode {
    /// Static metadata for this opcode.
    pub fn info(self) -> OpcodeInfo {
        use Opcode::*;
        match self {
            Add => pure_op("add", 2),
            Sub => pure_op("sub", 2),
            Mul => pure_op("mul", 2),
            SDiv => trapping_op("sdiv", 2),
            UDiv => trapping_op("udiv", 2),
            SRem => trapping_op("srem", 2),
            URem => trapping_op("urem", 2),
            IAddOvf => trapping_op("iadd.ovf", 2),
            ISubOvf => trapping_op("isub.ovf", 2),
            IMulOvf => trapping_op("imul.ovf", 2),
            And => pure_op("and", 2),
            Or => pure_op("or", 2),
            Xor => pure_op("xor", 2),
            Shl => pure_op("shl", 2),
            LShr => pure_op("lshr", 2),
            AShr => pure_op("ashr", 2),
            ICmpEq => pure_op("icmp_eq", 2),
            ICmpNe => pure_op("icmp_ne", 2),
            SCmpLt => pure_op("scmp_lt", 2),
            SCmpLe => pure_op("scmp_le", 2),
            SCmpGt => pure_op("scmp_gt", 2),
            SCmpGe => pure_op("scmp_ge", 2),
            UCmpLt => pure_op("ucmp_lt", 2),
            UCmpLe => pure_op("ucmp_le", 2),
            UCmpGt => pure_op("ucmp_gt", 2),
            UCmpGe => pure_op("ucmp_ge", 2),
            FAdd => pure_op("fadd", 2),
            FSub => pure_op("fsub", 2),
            FMul => pure_op("fmul", 2),
            FDiv => pure_op("fdiv", 2),
            FCmpEq => pure_op("fcmp_eq", 2),
            FCmpNe => pure_op("fcmp_ne", 2),
            FCmpLt => pure_op("fcmp_lt", 2),
            FCmpLe => pure_op("fcmp_le", 2),
            FCmpGt => pure_op("fcmp_gt", 2),
            FCmpGe => pure_op("fcmp_ge", 2),
            Sitofp => pure_op("sitofp", 1),
            Fptosi => trapping_op("fptosi", 1),
            Zext1 => pure_op("zext1", 1),
            Trunc1 => pure_op("trunc1", 1),
            Alloca => OpcodeInfo {
                operand_parse: &[ParseKind::Size],
                ..pure_op("alloca", 1)
            },
            Load => OpcodeInfo {
                memory: MemoryEffects::Read,
                ..pure_op("load", 1)
            },
            Store => OpcodeInfo {
                mnemonic: "store",
                result: ResultArity::None,
                min_operands: 2,
                max_operands: 2,
                operand_parse: &[ParseKind::Value, ParseKind::Value],
                successors: SuccArity::Fixed(0),
                is_terminator: false,
                has_side_effects: true,
                can_trap: false,
                memory: MemoryEffects::Write,
            },
            Gep => pure_op("gep", 2),
            AddrOf => OpcodeInfo {
                operand_parse: &[ParseKind::GlobalName],
                ..pure_op("addr_of", 1)
            },
            ConstStr => OpcodeInfo {
                operand_parse: &[ParseKind::StringLit],
                ..pure_op("const_str", 1)
            },
            ConstNull => pure_op("const_null", 0),
            Call => OpcodeInfo {
                mnemonic: "call",
                result: ResultArity::Optional,
                min_operands: 0,
                max_operands: VARIADIC,
                operand_parse: &[ParseKind::Value],
                successors: SuccArity::Fixed(0),
                is_terminator: false,
                has_side_effects: true,
                can_trap: true,
                memory: MemoryEffects::Unknown,
            },
            CallIndirect => OpcodeInfo {
                mnemonic: "call_indirect",
                result: ResultArity::Optional,
                min_operands: 1,
                max_operands: VARIADIC,
                operand_parse: &[ParseKind::Value],
                successors: SuccArity::Fixed(0),
                is_terminator: false,
                has_side_effects: true,
                can_trap: true,
                memory: MemoryEffects::Unknown,
            },
            Br => terminator("br", 0, SuccArity::Fixed(1)),
            CBr => terminator("cbr", 1, SuccArity::Fixed(2)),
            SwitchI32 => OpcodeInfo {
                operand_parse: &[ParseKind::Switch],
                max_operands: VARIADIC,
                ..terminator("switch.i32", VARIADIC, SuccArity::Variadic)
            },
            Ret => terminator("ret", 1, SuccArity::Fixed(0)),
            Trap => OpcodeInfo {
                can_trap: true,
                ..terminator("trap", 0, SuccArity::Fixed(0))
            },
            ResumeSame => terminator("resume.same", 0, SuccArity::Fixed(0)),
            ResumeNext => terminator("resume.next", 0, SuccArity::Fixed(0)),
            ResumeLabel => terminator("resume.label", 0, SuccArity::Fixed(1)),
            IdxChk => trapping_op("idx.chk", 3),
            SDivChk0 => trapping_op("sdiv.chk0", 2),
            UDivChk0 => trapping_op("udiv.chk0", 2),
            SRemChk0 => trapping_op("srem.chk0", 2),
            URemChk0 => trapping_op("urem.chk0", 2),
            CastFpToSiRteChk => trapping_op("cast.fptosi.rte.chk", 1),
            CastFpToUiRteChk => trapping_op("cast.fptoui.rte.chk", 1),
            CastSiNarrowChk => trapping_op("cast.si.narrow.chk", 1),
            CastUiNarrowChk => trapping_op("cast.ui.narrow.chk", 1),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    pub fn is_terminator(self) -> bool {
        self.info().is_terminator
    }

    pub fn has_side_effects(self) -> bool {
        self.info().has_side_effects
    }

    pub fn can_trap(self) -> bool {
        self.info().can_trap
    }

    pub fn memory_effects(self) -> MemoryEffects {
        self.info().memory
    }

    pub fn reads_memory(self) -> bool {
        matches!(
            self.memory_effects(),
            MemoryEffects::Read | MemoryEffects::ReadWrite | MemoryEffects::Unknown
        )
    }

    pub fn writes_memory(self) -> bool {
        matches!(
            self.memory_effects(),
            MemoryEffects::Write | MemoryEffects::ReadWrite | MemoryEffects::Unknown
        )
    }

    /// Check opcodes trap on invalid input and otherwise pass a value through.
    pub fn is_check(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            IdxChk
                | SDivChk0
                | UDivChk0
                | SRemChk0
                | URemChk0
                | CastFpToSiRteChk
                | CastFpToUiRteChk
                | CastSiNarrowChk
                | CastUiNarrowChk
        )
    }

    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::CallIndirect)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminators_have_successor_metadata() {
        assert!(Opcode::Br.is_terminator());
        assert_eq!(Opcode::Br.info().successors, SuccArity::Fixed(1));
        assert_eq!(Opcode::CBr.info().successors, SuccArity::Fixed(2));
        assert_eq!(Opcode::SwitchI32.info().successors, SuccArity::Variadic);
        assert_eq!(Opcode::Ret.info().successors, SuccArity::Fixed(0));
        assert!(!Opcode::Store.is_terminator());
    }

    #[test]
    fn trapping_ops_are_flagged() {
        assert!(Opcode::IAddOvf.can_trap());
        assert!(Opcode::SDiv.can_trap());
        assert!(Opcode::IdxChk.can_trap());
        assert!(!Opcode::Add.can_trap());
        assert!(!Opcode::FAdd.can_trap());
    }

    #[test]
    fn memory_effects_match_semantics() {
        assert_eq!(Opcode::Load.memory_effects(), MemoryEffects::Read);
        assert_eq!(Opcode::Store.memory_effects(), MemoryEffects::Write);
        assert_eq!(Opcode::Call.memory_effects(), MemoryEffects::Unknown);
        assert_eq!(Opcode::Add.memory_effects(), MemoryEffects::None);
    }
}
