//! Peephole simplification
//!
//! Algebraic identities that can never introduce undefined behaviour or drop
//! a trap: `x + 0`, `x * 1`, `x - x`, double negation, reflexive integer
//! compares, shift-by-zero. Floating-point identities are deliberately
//! absent (`x + 0.0` changes signed zeros, `x * 1.0` changes NaN payloads).

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use hashbrown::HashMap;
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, Module, Opcode, Value};

#[derive(Default)]
pub struct Peephole;

impl FunctionPass for Peephole {
    fn id(&self) -> &str {
        "peephole"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let changed = run_peephole(&mut module.functions[func]);
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

fn is_zero(v: &Value) -> bool {
    matches!(v, Value::ConstInt { value: 0, is_bool: false })
}

fn is_one(v: &Value) -> bool {
    matches!(v, Value::ConstInt { value: 1, is_bool: false })
}

fn is_all_ones(v: &Value) -> bool {
    matches!(v, Value::ConstInt { value: -1, is_bool: false })
}

/// Simplify `instr` to an existing value, if a pattern applies.
///
/// `defs` maps temp ids to their defining (opcode, operands) for the
/// double-negation rewrite.
fn simplify(
    op: Opcode,
    operands: &[Value],
    defs: &HashMap<u32, (Opcode, Vec<Value>)>,
) -> Option<Value> {
    use Opcode::*;
    let a = operands.first()?;
    let b = operands.get(1);

    match op {
        Add | Or | Xor => {
            let b = b?;
            if is_zero(b) {
                return Some(a.clone());
            }
            if is_zero(a) {
                return Some(b.clone());
            }
            if op == Xor && a == b && a.as_temp().is_some() {
                return Some(Value::const_int(0));
            }
            if op == Or && a == b {
                return Some(a.clone());
            }
            None
        }
        Sub => {
            let b = b?;
            if is_zero(b) {
                return Some(a.clone());
            }
            if a == b && a.as_temp().is_some() {
                return Some(Value::const_int(0));
            }
            // sub 0, (sub 0, x) == x
            if is_zero(a) {
                if let Some(inner) = b.as_temp() {
                    if let Some((Opcode::Sub, inner_ops)) =
                        defs.get(&inner).map(|(o, v)| (*o, v.clone()))
                    {
                        if inner_ops.len() == 2 && is_zero(&inner_ops[0]) {
                            return Some(inner_ops[1].clone());
                        }
                    }
                }
            }
            None
        }
        Mul => {
            let b = b?;
            if is_one(b) {
                return Some(a.clone());
            }
            if is_one(a) {
                return Some(b.clone());
            }
            if is_zero(a) || is_zero(b) {
                return Some(Value::const_int(0));
            }
            None
        }
        And => {
            let b = b?;
            if is_all_ones(b) {
                return Some(a.clone());
            }
            if is_all_ones(a) {
                return Some(b.clone());
            }
            if is_zero(a) || is_zero(b) {
                return Some(Value::const_int(0));
            }
            if a == b {
                return Some(a.clone());
            }
            None
        }
        Shl | LShr | AShr => {
            let b = b?;
            if is_zero(b) {
                return Some(a.clone());
            }
            None
        }
        ICmpEq => {
            let b = b?;
            (a == b && a.as_temp().is_some()).then(|| Value::const_bool(true))
        }
        ICmpNe => {
            let b = b?;
            (a == b && a.as_temp().is_some()).then(|| Value::const_bool(false))
        }
        // trunc1 (zext1 x) == x when x is i1
        Trunc1 => {
            let inner = a.as_temp()?;
            let (Opcode::Zext1, inner_ops) = defs.get(&inner)? else {
                return None;
            };
            inner_ops.first().cloned()
        }
        _ => None,
    }
}

pub(crate) fn run_peephole(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut defs: HashMap<u32, (Opcode, Vec<Value>)> = HashMap::new();
        for block in &function.blocks {
            for instr in &block.instructions {
                if let Some(result) = instr.result {
                    defs.insert(result, (instr.op, instr.operands.clone()));
                }
            }
        }

        let mut rewrite: Option<(usize, usize, u32, Value)> = None;
        'search: for (bi, block) in function.blocks.iter().enumerate() {
            for (ii, instr) in block.instructions.iter().enumerate() {
                let Some(result) = instr.result else {
                    continue;
                };
                if instr.op.has_side_effects() || instr.op.can_trap() {
                    continue;
                }
                if let Some(value) = simplify(instr.op, &instr.operands, &defs) {
                    rewrite = Some((bi, ii, result, value));
                    break 'search;
                }
            }
        }

        match rewrite {
            Some((bi, ii, result, value)) => {
                function.blocks[bi].instructions.remove(ii);
                replace_all_uses(function, result, &value);
                changed = true;
            }
            None => break,
        }
    }
    if changed {
        log::debug!("peephole: @{} simplified", function.name);
    }
    changed
}
