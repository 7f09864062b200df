//! Structural verifier for the Viper IL
//!
//! Checks the module-level invariants between passes: SSA single-definition,
//! dominance of uses, block termination, branch-argument matching and
//! per-opcode structural conformance. The verifier never mutates the IR and
//! reports the first violated invariant with a source location.

use hashbrown::HashMap;
use thiserror::Error;
use viper_analysis::{build_cfg, compute_dominator_tree, BlockId};
use viper_common::{Diagnostic, Diagnostics, SourceLoc, ViperError};
use viper_ir::{
    Function, Instr, Module, Opcode, ResultArity, SuccArity, Type, Value,
};
use std::fmt;

/// Category of a verifier diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyErrorKind {
    SsaViolation,
    DominanceViolation,
    MalformedTerminator,
    BranchArgMismatch,
    TypeMismatch,
    MalformedInstruction,
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerifyErrorKind::SsaViolation => "SSA violation",
            VerifyErrorKind::DominanceViolation => "dominance violation",
            VerifyErrorKind::MalformedTerminator => "malformed terminator",
            VerifyErrorKind::BranchArgMismatch => "branch argument mismatch",
            VerifyErrorKind::TypeMismatch => "type mismatch",
            VerifyErrorKind::MalformedInstruction => "malformed instruction",
        };
        f.write_str(name)
    }
}

/// First invariant violation found in a module.
#[derive(Debug, Clone, Error)]
#[error("{kind} in @{function} ^{block}[{instr_index:?}] at {loc}: {message}")]
pub struct VerifyError {
    pub kind: VerifyErrorKind,
    pub function: String,
    pub block: String,
    pub instr_index: Option<usize>,
    pub loc: SourceLoc,
    pub message: String,
}

impl From<VerifyError> for ViperError {
    fn from(error: VerifyError) -> Self {
        ViperError::verify_error(error.to_string())
    }
}

impl From<&VerifyError> for Diagnostic {
    fn from(error: &VerifyError) -> Self {
        Diagnostic::error(error.to_string(), error.loc)
    }
}

/// Collect one diagnostic per failing function instead of stopping at the
/// first module-wide violation.
pub fn verify_module_diagnostics(module: &Module) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();
    for function in &module.functions {
        if let Err(error) = verify_function(function) {
            diagnostics.add(Diagnostic::from(&error));
        }
    }
    diagnostics
}

/// Where a temp id is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefSite {
    FuncParam,
    BlockParam(BlockId),
    Instr(BlockId, usize),
}

struct FunctionVerifier<'f> {
    function: &'f Function,
    defs: HashMap<u32, (DefSite, Type)>,
}

pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for function in &module.functions {
        verify_function(function)?;
    }
    Ok(())
}

pub fn verify_function(function: &Function) -> Result<(), VerifyError> {
    let mut v = FunctionVerifier { function, defs: HashMap::new() };
    v.check_entry_convention()?;
    v.collect_defs()?;
    v.check_blocks()?;
    v.check_dominance()?;
    Ok(())
}

impl<'f> FunctionVerifier<'f> {
    fn err(
        &self,
        kind: VerifyErrorKind,
        block: &str,
        instr_index: Option<usize>,
        loc: SourceLoc,
        message: impl Into<String>,
    ) -> VerifyError {
        VerifyError {
            kind,
            function: self.function.name.clone(),
            block: block.to_string(),
            instr_index,
            loc,
            message: message.into(),
        }
    }

    fn check_entry_convention(&self) -> Result<(), VerifyError> {
        if let Some(entry) = self.function.entry() {
            if !entry.params.is_empty() {
                return Err(self.err(
                    VerifyErrorKind::MalformedInstruction,
                    &entry.label,
                    None,
                    SourceLoc::unknown(),
                    "entry block must not declare block parameters",
                ));
            }
        }
        Ok(())
    }

    /// Every temp id has exactly one definition: a function parameter, a
    /// block parameter, or an instruction result.
    fn collect_defs(&mut self) -> Result<(), VerifyError> {
        for param in &self.function.params {
            if self
                .defs
                .insert(param.id, (DefSite::FuncParam, param.ty))
                .is_some()
            {
                return Err(self.err(
                    VerifyErrorKind::SsaViolation,
                    "",
                    None,
                    SourceLoc::unknown(),
                    format!("duplicate definition of %{}", param.id),
                ));
            }
        }
        for (bi, block) in self.function.blocks.iter().enumerate() {
            for param in &block.params {
                if self
                    .defs
                    .insert(param.id, (DefSite::BlockParam(bi), param.ty))
                    .is_some()
                {
                    return Err(self.err(
                        VerifyErrorKind::SsaViolation,
                        &block.label,
                        None,
                        SourceLoc::unknown(),
                        format!("duplicate definition of %{}", param.id),
                    ));
                }
            }
            for (ii, instr) in block.instructions.iter().enumerate() {
                if let Some(result) = instr.result {
                    if self
                        .defs
                        .insert(result, (DefSite::Instr(bi, ii), instr.ty))
                        .is_some()
                    {
                        return Err(self.err(
                            VerifyErrorKind::SsaViolation,
                            &block.label,
                            Some(ii),
                            instr.loc,
                            format!("duplicate definition of %{result}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn value_type(&self, value: &Value) -> Option<Type> {
        match value {
            Value::Temp(id) => self.defs.get(id).map(|(_, ty)| *ty),
            Value::ConstInt { is_bool: true, .. } => Some(Type::I1),
            // Untyped integer literals adapt to i32/i64 contexts.
            Value::ConstInt { is_bool: false, .. } => None,
            Value::ConstFloat(_) => Some(Type::F64),
            Value::ConstStr(_) => Some(Type::Str),
            Value::GlobalAddr(_) | Value::NullPtr => Some(Type::Ptr),
        }
    }

    fn value_matches(&self, value: &Value, expected: Type) -> bool {
        match value {
            // Untyped integer literals fit the wide integer types but never i1.
            Value::ConstInt { is_bool: false, .. } => {
                matches!(expected, Type::I32 | Type::I64)
            }
            Value::ConstInt { is_bool: true, .. } => expected == Type::I1,
            _ => match self.value_type(value) {
                Some(ty) => ty == expected,
                None => true,
            },
        }
    }

    fn check_blocks(&self) -> Result<(), VerifyError> {
        for block in &self.function.blocks {
            if !block.terminated || block.instructions.is_empty() {
                return Err(self.err(
                    VerifyErrorKind::MalformedTerminator,
                    &block.label,
                    None,
                    SourceLoc::unknown(),
                    "block is not terminated",
                ));
            }
            let last = block.instructions.len() - 1;
            for (ii, instr) in block.instructions.iter().enumerate() {
                if instr.is_terminator() != (ii == last) {
                    return Err(self.err(
                        VerifyErrorKind::MalformedTerminator,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        if instr.is_terminator() {
                            "terminator before end of block"
                        } else {
                            "final instruction is not a terminator"
                        },
                    ));
                }
                self.check_instr(block, ii, instr)?;
            }
            self.check_branch_args(block, &block.instructions[last], last)?;
        }
        Ok(())
    }

    fn check_instr(
        &self,
        block: &viper_ir::BasicBlock,
        ii: usize,
        instr: &Instr,
    ) -> Result<(), VerifyError> {
        let info = instr.op.info();

        let count = instr.operands.len();
        if count < info.min_operands as usize
            || (info.max_operands != u8::MAX && count > info.max_operands as usize)
        {
            return Err(self.err(
                VerifyErrorKind::MalformedInstruction,
                &block.label,
                Some(ii),
                instr.loc,
                format!("{} expects {}..={} operands, found {}",
                        instr.op, info.min_operands, info.max_operands, count),
            ));
        }

        match info.result {
            ResultArity::None => {
                if instr.result.is_some() {
                    return Err(self.err(
                        VerifyErrorKind::MalformedInstruction,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        format!("{} must not produce a result", instr.op),
                    ));
                }
            }
            ResultArity::One => {
                if instr.result.is_none() {
                    return Err(self.err(
                        VerifyErrorKind::MalformedInstruction,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        format!("{} must produce a result", instr.op),
                    ));
                }
            }
            ResultArity::Optional => {}
        }

        match info.successors {
            SuccArity::Fixed(n) => {
                if instr.labels.len() != n as usize {
                    return Err(self.err(
                        VerifyErrorKind::MalformedTerminator,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        format!("{} expects {} successor label(s), found {}",
                                instr.op, n, instr.labels.len()),
                    ));
                }
            }
            SuccArity::Variadic => {
                if instr.labels.is_empty() {
                    return Err(self.err(
                        VerifyErrorKind::MalformedTerminator,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        "switch requires a default label",
                    ));
                }
            }
        }

        // Targeted type rules beyond the generic shape checks.
        match instr.op {
            Opcode::CBr => {
                if let Some(cond) = instr.operands.first() {
                    if !self.value_matches(cond, Type::I1) {
                        return Err(self.err(
                            VerifyErrorKind::TypeMismatch,
                            &block.label,
                            Some(ii),
                            instr.loc,
                            "cbr condition must have type i1",
                        ));
                    }
                }
            }
            Opcode::Store => {
                if let Some(value) = instr.operands.get(1) {
                    if !self.value_matches(value, instr.ty) {
                        return Err(self.err(
                            VerifyErrorKind::TypeMismatch,
                            &block.label,
                            Some(ii),
                            instr.loc,
                            format!("stored value does not match access type {}", instr.ty),
                        ));
                    }
                }
            }
            Opcode::ICmpEq | Opcode::ICmpNe | Opcode::SCmpLt | Opcode::SCmpLe
            | Opcode::SCmpGt | Opcode::SCmpGe | Opcode::UCmpLt | Opcode::UCmpLe
            | Opcode::UCmpGt | Opcode::UCmpGe | Opcode::FCmpEq | Opcode::FCmpNe
            | Opcode::FCmpLt | Opcode::FCmpLe | Opcode::FCmpGt | Opcode::FCmpGe
            | Opcode::Trunc1 => {
                if instr.ty != Type::I1 {
                    return Err(self.err(
                        VerifyErrorKind::TypeMismatch,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        format!("{} must produce i1", instr.op),
                    ));
                }
            }
            Opcode::Ret => {
                let expects_value = !self.function.ret_type.is_void();
                if expects_value != (instr.operands.len() == 1) {
                    return Err(self.err(
                        VerifyErrorKind::TypeMismatch,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        "ret operand does not match function return type",
                    ));
                }
                if let Some(value) = instr.operands.first() {
                    if !self.value_matches(value, self.function.ret_type) {
                        return Err(self.err(
                            VerifyErrorKind::TypeMismatch,
                            &block.label,
                            Some(ii),
                            instr.loc,
                            "returned value does not match function return type",
                        ));
                    }
                }
            }
            Opcode::Call => {
                if instr.callee.as_deref().unwrap_or("").is_empty() {
                    return Err(self.err(
                        VerifyErrorKind::MalformedInstruction,
                        &block.label,
                        Some(ii),
                        instr.loc,
                        "call requires a callee name",
                    ));
                }
            }
            _ => {}
        }

        if instr.labels.len() != instr.br_args.len() && !instr.labels.is_empty() {
            return Err(self.err(
                VerifyErrorKind::BranchArgMismatch,
                &block.label,
                Some(ii),
                instr.loc,
                "branch argument lists do not match successor labels",
            ));
        }

        Ok(())
    }

    /// Branch arguments must match the target block's parameters in count and
    /// type.
    fn check_branch_args(
        &self,
        block: &viper_ir::BasicBlock,
        term: &Instr,
        ii: usize,
    ) -> Result<(), VerifyError> {
        for (li, label) in term.labels.iter().enumerate() {
            let Some(target) = self.function.find_block(label) else {
                return Err(self.err(
                    VerifyErrorKind::MalformedTerminator,
                    &block.label,
                    Some(ii),
                    term.loc,
                    format!("branch target ^{label} does not exist"),
                ));
            };
            let args: &[Value] = term.br_args.get(li).map_or(&[], |a| a.as_slice());
            if args.len() != target.params.len() {
                return Err(self.err(
                    VerifyErrorKind::BranchArgMismatch,
                    &block.label,
                    Some(ii),
                    term.loc,
                    format!(
                        "^{label} expects {} argument(s), found {}",
                        target.params.len(),
                        args.len()
                    ),
                ));
            }
            for (arg, param) in args.iter().zip(&target.params) {
                if !self.value_matches(arg, param.ty) {
                    return Err(self.err(
                        VerifyErrorKind::BranchArgMismatch,
                        &block.label,
                        Some(ii),
                        term.loc,
                        format!(
                            "argument for ^{label} parameter %{} must have type {}",
                            param.id, param.ty
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Every operand use must be dominated by its definition.
    fn check_dominance(&self) -> Result<(), VerifyError> {
        let cfg = build_cfg(self.function);
        let dom = compute_dominator_tree(&cfg);

        for (bi, block) in self.function.blocks.iter().enumerate() {
            if !cfg.is_reachable(bi) {
                continue;
            }
            let mut local: HashMap<u32, usize> = HashMap::new();
            for (ii, instr) in block.instructions.iter().enumerate() {
                let mut check_use = |id: u32| -> Result<(), VerifyError> {
                    let Some((site, _)) = self.defs.get(&id) else {
                        return Err(self.err(
                            VerifyErrorKind::SsaViolation,
                            &block.label,
                            Some(ii),
                            instr.loc,
                            format!("use of undefined temp %{id}"),
                        ));
                    };
                    let dominated = match site {
                        DefSite::FuncParam => true,
                        DefSite::BlockParam(db) => *db == bi || dom.strictly_dominates(*db, bi),
                        DefSite::Instr(db, di) => {
                            if *db == bi {
                                local.contains_key(&id) && *di < ii
                            } else {
                                dom.strictly_dominates(*db, bi)
                            }
                        }
                    };
                    if !dominated {
                        return Err(self.err(
                            VerifyErrorKind::DominanceViolation,
                            &block.label,
                            Some(ii),
                            instr.loc,
                            format!("use of %{id} is not dominated by its definition"),
                        ));
                    }
                    Ok(())
                };

                for operand in &instr.operands {
                    if let Some(id) = operand.as_temp() {
                        check_use(id)?;
                    }
                }
                for args in &instr.br_args {
                    for arg in args {
                        if let Some(id) = arg.as_temp() {
                            check_use(id)?;
                        }
                    }
                }
                if let Some(result) = instr.result {
                    local.insert(result, ii);
                }
            }
        }
        Ok(())
    }
}
