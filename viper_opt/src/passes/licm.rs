//! Loop-invariant code motion
//!
//! Hoists an instruction from a loop header to the preheader when all of its
//! operands are loop-invariant and the opcode is pure and non-trapping.
//! Restricting hoisting to the header keeps the guaranteed-to-execute
//! condition trivially true. Loads additionally require that the loop
//! contains no aliasing write and no call that may write memory.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use crate::value_key::is_safe_cse_opcode;
use hashbrown::HashSet;
use viper_analysis::{AliasResult, BasicAA, Loop, LoopInfo, ModRefResult};
use viper_ir::{Function, Instr, Module, Opcode, Value};

#[derive(Default)]
pub struct Licm;

impl FunctionPass for Licm {
    fn id(&self) -> &str {
        "licm"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let loops = am
            .function_result::<LoopInfo>(crate::ids::LOOP_INFO, module, func)
            .loops()
            .to_vec();
        let aa = BasicAA::compute(module, &module.functions[func]);
        let function = &mut module.functions[func];

        let mut changed = false;
        for lp in &loops {
            changed |= hoist_from_loop(function, lp, &aa);
        }

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("licm: @{} hoisted invariant code", function.name);
        PreservedAnalyses::none()
            .preserve_all_modules()
            .preserve_function(crate::ids::CFG)
            .preserve_function(crate::ids::DOMINATORS)
            .preserve_function(crate::ids::POST_DOMINATORS)
            .preserve_function(crate::ids::LOOP_INFO)
    }
}

/// The dedicated preheader: the unique external predecessor whose sole
/// successor is the header (LoopSimplify provides one). Hoisting anywhere
/// less would execute the hoisted code on paths that never enter the loop.
fn find_preheader(function: &Function, lp: &Loop) -> Option<usize> {
    let mut preheader = None;
    for (bi, block) in function.blocks.iter().enumerate() {
        if lp.contains(&block.label) {
            continue;
        }
        let Some(term) = block.terminator() else {
            continue;
        };
        if !term.labels.iter().any(|l| *l == lp.header) {
            continue;
        }
        if preheader.is_some() {
            return None;
        }
        if term.op != Opcode::Br || term.labels.len() != 1 {
            return None;
        }
        preheader = Some(bi);
    }
    preheader
}

/// Values defined outside the loop (plus function parameters) are invariant.
fn seed_invariants(function: &Function, lp: &Loop) -> HashSet<u32> {
    let mut invariants = HashSet::new();
    for param in &function.params {
        invariants.insert(param.id);
    }
    for block in &function.blocks {
        if lp.contains(&block.label) {
            continue;
        }
        for param in &block.params {
            invariants.insert(param.id);
        }
        for instr in &block.instructions {
            if let Some(result) = instr.result {
                invariants.insert(result);
            }
        }
    }
    invariants
}

fn operands_invariant(instr: &Instr, invariants: &HashSet<u32>) -> bool {
    instr.operands.iter().all(|operand| match operand.as_temp() {
        Some(id) => invariants.contains(&id),
        None => true,
    })
}

/// True when no store or memory-writing call in the loop may clobber `ptr`.
fn load_is_safe(function: &Function, lp: &Loop, ptr: &Value, size: Option<u32>, aa: &BasicAA) -> bool {
    for block in &function.blocks {
        if !lp.contains(&block.label) {
            continue;
        }
        for instr in &block.instructions {
            match instr.op {
                Opcode::Store if !instr.operands.is_empty() => {
                    let store_size = BasicAA::type_size_bytes(instr.ty);
                    if aa.alias(&instr.operands[0], ptr, store_size, size)
                        != AliasResult::NoAlias
                    {
                        return false;
                    }
                }
                Opcode::Call | Opcode::CallIndirect => {
                    let mr = aa.mod_ref(instr);
                    if mr == ModRefResult::Mod || mr == ModRefResult::ModRef {
                        return false;
                    }
                }
                _ => {}
            }
        }
    }
    true
}

fn hoist_from_loop(function: &mut Function, lp: &Loop, aa: &BasicAA) -> bool {
    let Some(preheader) = find_preheader(function, lp) else {
        return false;
    };
    let Some(header) = function.block_index(&lp.header) else {
        return false;
    };

    let mut invariants = seed_invariants(function, lp);
    let mut changed = false;

    let mut idx = 0;
    while idx < function.blocks[header].instructions.len() {
        let instr = &function.blocks[header].instructions[idx];

        if instr.is_terminator() || instr.result.is_none() {
            idx += 1;
            continue;
        }

        let hoistable = if instr.op == Opcode::Load {
            let ptr = instr.operands[0].clone();
            let size = BasicAA::type_size_bytes(instr.ty);
            operands_invariant(instr, &invariants)
                && load_is_safe(function, lp, &ptr, size, aa)
        } else {
            is_safe_cse_opcode(instr.op) && operands_invariant(instr, &invariants)
        };

        if !hoistable {
            idx += 1;
            continue;
        }

        let hoisted = function.blocks[header].instructions.remove(idx);
        if let Some(result) = hoisted.result {
            invariants.insert(result);
        }
        let pre = &mut function.blocks[preheader];
        let insert_at = if pre.terminated && !pre.instructions.is_empty() {
            pre.instructions.len() - 1
        } else {
            pre.instructions.len()
        };
        pre.instructions.insert(insert_at, hoisted);
        changed = true;
        // Do not advance: the next instruction shifted into idx.
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{AnalysisManager, AnalysisRegistry};
    use crate::passes::LoopSimplify;
    use crate::pipeline::register_default_analyses;
    use viper_ir::build::IRBuilder;
    use viper_ir::Type;

    fn run_licm(module: &mut Module) -> bool {
        let mut registry = AnalysisRegistry::new();
        register_default_analyses(&mut registry);
        let mut am = AnalysisManager::new(&registry);
        let preserved = Licm.run(module, 0, &mut am);
        !preserved.preserves_all_function_analyses()
    }

    /// A loop with an invariant fadd in the header: after LoopSimplify has
    /// provided a preheader, LICM moves the fadd there.
    #[test]
    fn hoists_invariant_float_add_to_preheader() {
        let mut module = Module::new();
        {
            let mut b = IRBuilder::new(&mut module);
            b.start_function("f", Type::I64, &[("n", Type::I64), ("go", Type::I1)]);
            let entry = b.add_block("entry");
            let header = b.create_block("header", &[("i", Type::I64)]);
            let body = b.add_block("body");
            let exit = b.add_block("exit");

            // Entry is a conditional branch, so the header has no dedicated
            // preheader until LoopSimplify inserts one.
            b.set_insert_point(entry);
            b.cbr(Value::temp(1), "header", vec![Value::const_int(0)], "exit", vec![]);

            b.set_insert_point(header);
            let i = b.block_param(header, 0);
            let _inv = b.binary(
                Opcode::FAdd,
                Type::F64,
                Value::const_float(7.0),
                Value::const_float(5.0),
            );
            let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(0));
            b.cbr(c, "body", vec![], "exit", vec![]);

            b.set_insert_point(body);
            let i2 = b.binary(Opcode::Add, Type::I64, i, Value::const_int(1));
            b.br("header", vec![i2]);

            b.set_insert_point(exit);
            b.ret(Some(Value::const_int(0)));
        }

        // Canonicalise first, then hoist.
        {
            let mut registry = AnalysisRegistry::new();
            register_default_analyses(&mut registry);
            let mut am = AnalysisManager::new(&registry);
            LoopSimplify.run(&mut module, 0, &mut am);
        }
        assert!(run_licm(&mut module));

        let f = &module.functions[0];
        let header = f.find_block("header").unwrap();
        assert!(header.instructions.iter().all(|i| i.op != Opcode::FAdd));
        let preheader = f.find_block("header.preheader").unwrap();
        assert!(preheader.instructions.iter().any(|i| i.op == Opcode::FAdd));
    }

    #[test]
    fn does_not_hoist_loads_past_aliasing_stores() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("n", Type::I64)]);
        let entry = b.add_block("entry");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let body = b.add_block("body");
        let exit = b.add_block("exit");

        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(0));
        b.br("header", vec![Value::const_int(0)]);

        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        let _v = b.load(Type::I64, p.clone());
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(0));
        b.cbr(c, "body", vec![], "exit", vec![]);

        b.set_insert_point(body);
        // The loop writes the same location the header loads.
        b.store(Type::I64, p.clone(), i.clone());
        let i2 = b.binary(Opcode::Add, Type::I64, i, Value::const_int(1));
        b.br("header", vec![i2]);

        b.set_insert_point(exit);
        let out = b.load(Type::I64, p);
        b.ret(Some(out));

        assert!(!run_licm(&mut module));
        let f = &module.functions[0];
        let header_block = f.find_block("header").unwrap();
        assert!(header_block.instructions.iter().any(|i| i.op == Opcode::Load));
    }

    #[test]
    fn does_not_hoist_trapping_ops() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("n", Type::I64), ("d", Type::I64)]);
        let entry = b.add_block("entry");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let body = b.add_block("body");
        let exit = b.add_block("exit");

        b.set_insert_point(entry);
        b.br("header", vec![Value::const_int(0)]);
        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        // Would trap if d == 0 and the loop never runs; must stay put.
        let _q = b.binary(Opcode::SDiv, Type::I64, Value::const_int(100), Value::temp(1));
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(0));
        b.cbr(c, "body", vec![], "exit", vec![]);
        b.set_insert_point(body);
        let i2 = b.binary(Opcode::Add, Type::I64, i, Value::const_int(1));
        b.br("header", vec![i2]);
        b.set_insert_point(exit);
        b.ret(Some(Value::const_int(0)));

        assert!(!run_licm(&mut module));
    }
}
