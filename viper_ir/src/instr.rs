//! Instructions, block parameters and basic blocks
//!
//! `Instr` uses one flexible layout for every instruction class: standard
//! operations use `operands`, calls additionally carry a callee name, and
//! branches carry target labels plus per-target branch arguments. A switch
//! packs its scrutinee and case values into `operands` and its default/case
//! targets into `labels`/`br_args`; the `switch_*` accessors are the single
//! source of truth for that layout.

use crate::{Opcode, Type, Value};
use serde::{Deserialize, Serialize};
use viper_common::SourceLoc;

/// Semantic hints attached to call instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttrs {
    /// Call cannot throw.
    pub nothrow: bool,
    /// Call may read memory but performs no writes.
    pub readonly: bool,
    /// Call performs no memory access and has no observable side effects.
    pub pure_fn: bool,
}

/// Attributes on function or block parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamAttrs {
    pub pure_fn: bool,
    pub readonly: bool,
    pub noalias: bool,
}

/// A typed function or block parameter with a dense SSA temp id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub id: u32,
    pub attrs: ParamAttrs,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type, id: u32) -> Self {
        Self { name: name.into(), ty, id, attrs: ParamAttrs::default() }
    }

    pub fn is_noalias(&self) -> bool {
        self.attrs.noalias
    }
}

/// A single IL instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    /// Destination temporary; absent for instructions without a result.
    pub result: Option<u32>,
    pub op: Opcode,
    /// Result type, or the access type for loads/stores.
    pub ty: Type,
    pub operands: Vec<Value>,
    /// Callee name; present only for direct calls.
    pub callee: Option<String>,
    /// Branch target labels; each must name a block in the same function.
    pub labels: Vec<String>,
    /// Branch arguments per target; outer length matches `labels`.
    pub br_args: Vec<Vec<Value>>,
    pub loc: SourceLoc,
    pub call_attrs: CallAttrs,
}

impl Instr {
    pub fn new(op: Opcode, ty: Type) -> Self {
        Self {
            result: None,
            op,
            ty,
            operands: Vec::new(),
            callee: None,
            labels: Vec::new(),
            br_args: Vec::new(),
            loc: SourceLoc::unknown(),
            call_attrs: CallAttrs::default(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.op.is_terminator()
    }

    fn require_switch(&self) {
        assert!(self.op == Opcode::SwitchI32, "expected switch instruction");
    }

    /// The value tested by a switch instruction.
    pub fn switch_scrutinee(&self) -> &Value {
        self.require_switch();
        &self.operands[0]
    }

    /// Default branch label of a switch.
    pub fn switch_default_label(&self) -> &str {
        self.require_switch();
        &self.labels[0]
    }

    /// Default branch arguments of a switch.
    pub fn switch_default_args(&self) -> &[Value] {
        self.require_switch();
        &self.br_args[0]
    }

    /// Number of explicit (non-default) case arms.
    pub fn switch_case_count(&self) -> usize {
        self.require_switch();
        self.labels.len().saturating_sub(1)
    }

    /// Guard value of case `index`.
    pub fn switch_case_value(&self, index: usize) -> &Value {
        self.require_switch();
        assert!(index < self.switch_case_count());
        &self.operands[index + 1]
    }

    /// Target label of case `index`.
    pub fn switch_case_label(&self, index: usize) -> &str {
        self.require_switch();
        assert!(index < self.switch_case_count());
        &self.labels[index + 1]
    }

    /// Branch arguments of case `index`.
    pub fn switch_case_args(&self, index: usize) -> &[Value] {
        self.require_switch();
        assert!(index < self.switch_case_count());
        &self.br_args[index + 1]
    }
}

/// A basic block: label, block parameters, instruction list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Unique within the owning function.
    pub label: String,
    /// Block parameters replace phi nodes; incoming terminators supply a
    /// matching argument per parameter.
    pub params: Vec<Param>,
    pub instructions: Vec<Instr>,
    /// Asserts the final instruction is a terminator.
    pub terminated: bool,
}

impl BasicBlock {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            params: Vec::new(),
            instructions: Vec::new(),
            terminated: false,
        }
    }

    /// The block's terminator, when the block is complete.
    pub fn terminator(&self) -> Option<&Instr> {
        if !self.terminated {
            return None;
        }
        self.instructions.last().filter(|i| i.is_terminator())
    }

    pub fn terminator_mut(&mut self) -> Option<&mut Instr> {
        if !self.terminated {
            return None;
        }
        self.instructions.last_mut().filter(|i| i.is_terminator())
    }

    /// Successor labels in terminator order.
    pub fn successor_labels(&self) -> &[String] {
        match self.terminator() {
            Some(term) => &term.labels,
            None => &[],
        }
    }
}
