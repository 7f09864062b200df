//! Constant folding
//!
//! Folds instructions whose operands are all constants through the shared
//! evaluation kernel: two's-complement wrapping for plain integer ops,
//! IEEE-754 for floats. Instructions whose evaluation would trap are left in
//! place so the runtime trap is preserved.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use viper_ir::eval::{eval_binary, eval_unary};
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, Module, Type, Value};

#[derive(Default)]
pub struct ConstFold;

impl FunctionPass for ConstFold {
    fn id(&self) -> &str {
        "constfold"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let changed = fold_constants(&mut module.functions[func]);
        if !changed {
            return PreservedAnalyses::all();
        }
        PreservedAnalyses::none()
            .preserve_all_modules()
            .preserve_function(crate::ids::CFG)
            .preserve_function(crate::ids::DOMINATORS)
            .preserve_function(crate::ids::POST_DOMINATORS)
            .preserve_function(crate::ids::LOOP_INFO)
    }
}

/// Fold to a fixed point; returns true when anything was folded.
pub(crate) fn fold_constants(function: &mut Function) -> bool {
    let mut changed = false;
    let mut folded_total = 0usize;
    loop {
        let mut replacement: Option<(usize, usize, u32, Value)> = None;

        'search: for (bi, block) in function.blocks.iter().enumerate() {
            for (ii, instr) in block.instructions.iter().enumerate() {
                if instr.is_terminator() || instr.op.is_check() {
                    continue;
                }
                let Some(result) = instr.result else {
                    continue;
                };
                if !instr.operands.iter().all(Value::is_const) {
                    continue;
                }
                let outcome = match instr.operands.len() {
                    1 => eval_unary(instr.op, &instr.operands[0]),
                    2 => eval_binary(instr.op, &instr.operands[0], &instr.operands[1]),
                    _ => None,
                };
                // A trapping evaluation must stay in the program.
                if let Some(Ok(value)) = outcome {
                    let value = coerce_to(value, instr.ty);
                    replacement = Some((bi, ii, result, value));
                    break 'search;
                }
            }
        }

        match replacement {
            Some((bi, ii, result, value)) => {
                function.blocks[bi].instructions.remove(ii);
                replace_all_uses(function, result, &value);
                folded_total += 1;
                changed = true;
            }
            None => break,
        }
    }
    if changed {
        log::debug!("constfold: @{} folded {folded_total} instruction(s)", function.name);
    }
    changed
}

/// Match the folded constant to the instruction's declared result type.
fn coerce_to(value: Value, ty: Type) -> Value {
    match (&value, ty) {
        (Value::ConstInt { value: v, .. }, Type::I1) => Value::const_bool(*v != 0),
        (Value::ConstInt { value: v, is_bool: true }, _) if ty != Type::I1 => {
            Value::const_int(*v)
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::build::IRBuilder;
    use viper_ir::{Module, Opcode};

    #[test]
    fn folds_chained_arithmetic() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let a = b.binary(Opcode::Add, Type::I64, Value::const_int(20), Value::const_int(20));
        let c = b.binary(Opcode::Add, Type::I64, a, Value::const_int(2));
        b.ret(Some(c));

        let f = &mut module.functions[0];
        assert!(fold_constants(f));
        assert_eq!(f.blocks[0].instructions.len(), 1);
        assert_eq!(
            f.blocks[0].terminator().unwrap().operands[0],
            Value::const_int(42)
        );
    }

    #[test]
    fn keeps_trapping_evaluations() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let q = b.binary(Opcode::SDiv, Type::I64, Value::const_int(1), Value::const_int(0));
        b.ret(Some(q));

        let f = &mut module.functions[0];
        assert!(!fold_constants(f));
        assert_eq!(f.blocks[0].instructions.len(), 2);
    }

    #[test]
    fn folds_comparison_to_bool() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        let t = b.add_block("t");
        let e = b.add_block("e");
        b.set_insert_point(entry);
        let c = b.binary(Opcode::SCmpLt, Type::I1, Value::const_int(1), Value::const_int(2));
        b.cbr(c, "t", vec![], "e", vec![]);
        b.set_insert_point(t);
        b.ret(Some(Value::const_int(1)));
        b.set_insert_point(e);
        b.ret(Some(Value::const_int(0)));

        let f = &mut module.functions[0];
        assert!(fold_constants(f));
        let term = f.blocks[0].terminator().unwrap();
        assert_eq!(term.operands[0], Value::const_bool(true));
    }

    #[test]
    fn folds_safe_overflow_checked_ops_only() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let ok = b.binary(Opcode::IAddOvf, Type::I64, Value::const_int(1), Value::const_int(2));
        let bad = b.binary(
            Opcode::IMulOvf,
            Type::I64,
            Value::const_int(i64::MAX),
            Value::const_int(2),
        );
        let s = b.binary(Opcode::Add, Type::I64, ok, bad);
        b.ret(Some(s));

        let f = &mut module.functions[0];
        assert!(fold_constants(f));
        // The overflowing multiply must survive; the safe add folded into it.
        assert_eq!(f.blocks[0].instructions.len(), 3);
        assert!(f.blocks[0]
            .instructions
            .iter()
            .any(|i| i.op == Opcode::IMulOvf));
    }
}
