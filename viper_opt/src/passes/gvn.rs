//! Global value numbering with redundant load elimination
//!
//! Dominator-tree preorder traversal threading a per-path state: a table of
//! pure expressions (as in EarlyCSE) plus a table of available loads keyed by
//! `(pointer, type, size)`. A load first tries an exact key match, then a
//! MustAlias fallback. Stores invalidate every load whose pointer is not
//! provably NoAlias with the stored address; calls that may write memory
//! invalidate everything, while Ref-only calls preserve the load table.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use crate::value_key::{make_value_key, ValueKey};
use hashbrown::HashMap;
use viper_analysis::{AliasResult, BasicAA, BlockId, DomTree, ModRefResult};
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, MemoryEffects, Module, Opcode, Type, Value};

#[derive(Default)]
pub struct Gvn;

/// A memoised load: pointer, access type, optional byte size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoadKey {
    ptr: Value,
    ty: Type,
    size: Option<u32>,
}

/// Per-path state copied into each dominator child.
#[derive(Default, Clone)]
struct State {
    exprs: HashMap<ValueKey, Value>,
    loads: HashMap<LoadKey, Value>,
}

impl FunctionPass for Gvn {
    fn id(&self) -> &str {
        "gvn"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        if module.functions[func].blocks.is_empty() {
            return PreservedAnalyses::all();
        }
        let dom = am
            .function_result::<DomTree>(crate::ids::DOMINATORS, module, func)
            .clone();
        // BasicAA is rebuilt here rather than borrowed from the cache: the
        // traversal needs it across mutations of the function.
        let aa = BasicAA::compute(module, &module.functions[func]);
        let function = &mut module.functions[func];

        let mut changed = false;
        visit_block(function, dom.entry(), &dom, &aa, State::default(), &mut changed);

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("gvn: @{} eliminated redundancies", function.name);
        PreservedAnalyses::none().preserve_all_modules()
    }
}

fn visit_block(
    function: &mut Function,
    block: BlockId,
    dom: &DomTree,
    aa: &BasicAA,
    mut state: State,
    changed: &mut bool,
) {
    let mut idx = 0;
    while idx < function.blocks[block].instructions.len() {
        let instr = &function.blocks[block].instructions[idx];

        // Redundant load elimination.
        if instr.op == Opcode::Load && instr.result.is_some() && !instr.operands.is_empty() {
            let result = instr.result.unwrap();
            let key = LoadKey {
                ptr: instr.operands[0].clone(),
                ty: instr.ty,
                size: BasicAA::type_size_bytes(instr.ty),
            };

            if let Some(available) = state.loads.get(&key) {
                let available = available.clone();
                function.blocks[block].instructions.remove(idx);
                replace_all_uses(function, result, &available);
                *changed = true;
                continue;
            }

            // MustAlias fallback over the memoised loads.
            let must_alias = state.loads.iter().find(|(k, _)| {
                k.ty == key.ty
                    && aa.alias(&k.ptr, &key.ptr, k.size, key.size) == AliasResult::MustAlias
            });
            if let Some((_, available)) = must_alias {
                let available = available.clone();
                function.blocks[block].instructions.remove(idx);
                replace_all_uses(function, result, &available);
                *changed = true;
                continue;
            }

            state.loads.insert(key, Value::temp(result));
            idx += 1;
            continue;
        }

        // Stores invalidate loads they may clobber.
        if instr.op == Opcode::Store && instr.operands.len() >= 2 {
            let store_ptr = instr.operands[0].clone();
            let store_size = BasicAA::type_size_bytes(instr.ty);
            state.loads.retain(|k, _| {
                aa.alias(&k.ptr, &store_ptr, k.size, store_size) == AliasResult::NoAlias
            });
            idx += 1;
            continue;
        }

        // Calls that may write clobber everything; Ref-only calls do not.
        if instr.op.is_call() {
            let mr = aa.mod_ref(instr);
            if mr != ModRefResult::NoModRef && mr != ModRefResult::Ref {
                state.loads.clear();
            }
            idx += 1;
            continue;
        }

        // Any other writing opcode clobbers the load table.
        let effects = instr.op.memory_effects();
        if effects == MemoryEffects::Write || effects == MemoryEffects::ReadWrite {
            state.loads.clear();
            idx += 1;
            continue;
        }

        // Pure expression numbering.
        if let Some(key) = make_value_key(instr) {
            let result = instr.result.unwrap();
            if let Some(existing) = state.exprs.get(&key) {
                let existing = existing.clone();
                function.blocks[block].instructions.remove(idx);
                replace_all_uses(function, result, &existing);
                *changed = true;
                continue;
            }
            state.exprs.insert(key, Value::temp(result));
            idx += 1;
            continue;
        }

        idx += 1;
    }

    for &child in dom.children_of(block) {
        visit_block(function, child, dom, aa, state.clone(), changed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::AnalysisRegistry;
    use crate::pipeline::register_default_analyses;
    use viper_ir::build::IRBuilder;
    use viper_ir::CallAttrs;

    fn run(module: &mut Module) -> bool {
        let mut registry = AnalysisRegistry::new();
        register_default_analyses(&mut registry);
        let mut am = AnalysisManager::new(&registry);
        let preserved = Gvn.run(module, 0, &mut am);
        !preserved.preserves_all_function_analyses()
    }

    /// A second load of the same pointer across a block boundary folds
    /// onto the first.
    #[test]
    fn eliminates_redundant_load_across_blocks() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        let next = b.create_block("next", &[("x", Type::I64)]);
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(7));
        let v1 = b.load(Type::I64, p.clone());
        b.br("next", vec![v1.clone()]);
        b.set_insert_point(next);
        let v2 = b.load(Type::I64, p);
        b.ret(Some(v2));

        assert!(run(&mut module));
        let f = &module.functions[0];
        assert_eq!(f.blocks[1].instructions.len(), 1);
        assert_eq!(f.blocks[1].terminator().unwrap().operands[0], v1);
    }

    #[test]
    fn stores_invalidate_aliasing_loads() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        let v1 = b.load(Type::I64, p.clone());
        b.store(Type::I64, p.clone(), Value::const_int(2));
        let v2 = b.load(Type::I64, p);
        let sum = b.binary(Opcode::Add, Type::I64, v1, v2);
        b.ret(Some(sum));

        // The second load must survive: the store in between clobbers it.
        assert!(!run(&mut module));
        let f = &module.functions[0];
        let loads = f.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::Load)
            .count();
        assert_eq!(loads, 2);
    }

    #[test]
    fn disjoint_store_preserves_memoised_load() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let base = b.alloca(16);
        let f0 = b.gep(base.clone(), Value::const_int(0));
        let f1 = b.gep(base, Value::const_int(8));
        b.store(Type::I64, f0.clone(), Value::const_int(1));
        let v1 = b.load(Type::I64, f0.clone());
        // Store to the disjoint field does not clobber the memoised load.
        b.store(Type::I64, f1, Value::const_int(2));
        let v2 = b.load(Type::I64, f0);
        let sum = b.binary(Opcode::Add, Type::I64, v1.clone(), v2);
        b.ret(Some(sum));

        assert!(run(&mut module));
        let f = &module.functions[0];
        let loads = f.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::Load)
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn readonly_calls_preserve_loads_but_writers_clobber() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        let v1 = b.load(Type::I64, p.clone());
        let ro = CallAttrs { readonly: true, ..Default::default() };
        b.call("opaque_reader", Type::Void, vec![], ro);
        let v2 = b.load(Type::I64, p.clone());
        b.call("opaque_writer", Type::Void, vec![], CallAttrs::default());
        let v3 = b.load(Type::I64, p);
        let s1 = b.binary(Opcode::Add, Type::I64, v1, v2);
        let s2 = b.binary(Opcode::Add, Type::I64, s1, v3);
        b.ret(Some(s2));

        assert!(run(&mut module));
        let f = &module.functions[0];
        let loads = f.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::Load)
            .count();
        // v2 folded onto v1 across the readonly call; v3 survives the writer.
        assert_eq!(loads, 2);
    }
}
