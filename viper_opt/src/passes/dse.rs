//! Dead-store elimination
//!
//! Three tiers, in increasing precision:
//! 1. intra-block: a backward scan kills a store when a later store in the
//!    same block MustAlias-overwrites it before any read;
//! 2. cross-block: a forward BFS from a store to a non-escaping alloca,
//!    conservative about calls;
//! 3. MemorySSA: the dead-store predicate, which additionally treats calls
//!    as transparent for non-escaping allocas — the precision the first two
//!    tiers cannot reach.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use viper_analysis::{
    build_cfg, compute_memory_ssa, AliasResult, BasicAA, MemorySSA, ModRefResult,
};
use viper_ir::{Function, Module, Opcode, Value};

#[derive(Default)]
pub struct Dse;

impl FunctionPass for Dse {
    fn id(&self) -> &str {
        "dse"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let aa = BasicAA::compute(module, &module.functions[func]);

        let function = &mut module.functions[func];
        let mut changed = run_intra_block_dse(function, &aa);
        changed |= run_cross_block_dse(function, &aa);

        // The MemorySSA tier: reuse the cached analysis only when the earlier
        // tiers left the function untouched; otherwise it is stale and must
        // be rebuilt from the current IR.
        let removed = if changed {
            let function = &module.functions[func];
            let cfg = build_cfg(function);
            let aa = BasicAA::compute(module, function);
            let mssa = compute_memory_ssa(function, &cfg, &aa);
            collect_memory_ssa_dead(&module.functions[func], &mssa)
        } else {
            let mssa = am.function_result::<MemorySSA>(crate::ids::MEMORY_SSA, module, func);
            collect_memory_ssa_dead(&module.functions[func], mssa)
        };
        let function = &mut module.functions[func];
        if !removed.is_empty() {
            erase_reverse(function, removed);
            changed = true;
        }

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("dse: @{} removed dead store(s)", function.name);
        PreservedAnalyses::none()
            .preserve_all_modules()
            .preserve_function(crate::ids::CFG)
            .preserve_function(crate::ids::DOMINATORS)
            .preserve_function(crate::ids::POST_DOMINATORS)
            .preserve_function(crate::ids::LOOP_INFO)
    }
}

/// Tracked address of a killed (later-overwritten) store.
struct KilledAddr {
    ptr: Value,
    size: Option<u32>,
}

/// Tier 1: backward scan within each block.
pub(crate) fn run_intra_block_dse(function: &mut Function, aa: &BasicAA) -> bool {
    let mut changed = false;
    for block in &mut function.blocks {
        let mut killed: Vec<KilledAddr> = Vec::new();
        let mut i = block.instructions.len();
        while i > 0 {
            i -= 1;
            let instr = &block.instructions[i];

            if instr.op == Opcode::Load && !instr.operands.is_empty() {
                // A read revives every address it may touch.
                let ptr = instr.operands[0].clone();
                let size = BasicAA::type_size_bytes(instr.ty);
                killed.retain(|k| {
                    aa.alias(&ptr, &k.ptr, size, k.size) == AliasResult::NoAlias
                });
                continue;
            }

            if instr.op.is_call() {
                if aa.mod_ref(instr) != ModRefResult::NoModRef {
                    killed.clear();
                }
                continue;
            }

            if instr.op == Opcode::Store && !instr.operands.is_empty() {
                if instr.operands[0].as_temp().is_none() {
                    continue;
                }
                let ptr = instr.operands[0].clone();
                let size = BasicAA::type_size_bytes(instr.ty);
                let dead = killed
                    .iter()
                    .any(|k| aa.alias(&ptr, &k.ptr, size, k.size) == AliasResult::MustAlias);
                if dead {
                    block.instructions.remove(i);
                    changed = true;
                    continue;
                }
                killed.push(KilledAddr { ptr, size });
            }
        }
    }
    changed
}

fn alloca_escapes(function: &Function, alloca: u32) -> bool {
    for block in &function.blocks {
        for instr in &block.instructions {
            if instr.op.is_call() {
                for operand in &instr.operands {
                    if operand.as_temp() == Some(alloca) {
                        return true;
                    }
                }
            }
            if instr.op == Opcode::Store
                && instr.operands.len() >= 2
                && instr.operands[1].as_temp() == Some(alloca)
            {
                return true;
            }
        }
    }
    false
}

fn block_reads_from(
    block: &viper_ir::BasicBlock,
    ptr: &Value,
    size: Option<u32>,
    aa: &BasicAA,
) -> bool {
    for instr in &block.instructions {
        if instr.op == Opcode::Load && !instr.operands.is_empty() {
            let load_size = BasicAA::type_size_bytes(instr.ty);
            if aa.alias(&instr.operands[0], ptr, load_size, size) != AliasResult::NoAlias {
                return true;
            }
        }
        if instr.op.is_call() {
            let mr = aa.mod_ref(instr);
            if mr == ModRefResult::Ref || mr == ModRefResult::ModRef {
                return true;
            }
        }
    }
    false
}

fn block_kills_store(
    block: &viper_ir::BasicBlock,
    ptr: &Value,
    size: Option<u32>,
    aa: &BasicAA,
) -> bool {
    for instr in &block.instructions {
        if instr.op == Opcode::Store && !instr.operands.is_empty() {
            let store_size = BasicAA::type_size_bytes(instr.ty);
            if aa.alias(&instr.operands[0], ptr, store_size, size) == AliasResult::MustAlias {
                return true;
            }
        }
    }
    false
}

/// Tier 2: forward BFS from each store to a non-escaping alloca. Conservative
/// about calls: any call that may read memory blocks elimination.
pub(crate) fn run_cross_block_dse(function: &mut Function, aa: &BasicAA) -> bool {
    if function.blocks.is_empty() {
        return false;
    }

    let mut to_remove: Vec<(usize, usize)> = Vec::new();

    for (bi, block) in function.blocks.iter().enumerate() {
        for (i, instr) in block.instructions.iter().enumerate() {
            if instr.op != Opcode::Store || instr.operands.is_empty() {
                continue;
            }
            let ptr = &instr.operands[0];
            let Some(alloca) = ptr.as_temp().filter(|&id| aa.is_alloca(id)) else {
                continue;
            };
            if alloca_escapes(function, alloca) {
                continue;
            }
            let store_size = BasicAA::type_size_bytes(instr.ty);

            // Rest of this block: any read or call blocks elimination; a
            // MustAlias overwrite is intra-block DSE territory.
            let mut dead = true;
            for next in &block.instructions[i + 1..] {
                match next.op {
                    Opcode::Load if !next.operands.is_empty() => {
                        let load_size = BasicAA::type_size_bytes(next.ty);
                        if aa.alias(&next.operands[0], ptr, load_size, store_size)
                            != AliasResult::NoAlias
                        {
                            dead = false;
                            break;
                        }
                    }
                    Opcode::Store if !next.operands.is_empty() => {
                        let next_size = BasicAA::type_size_bytes(next.ty);
                        if aa.alias(&next.operands[0], ptr, next_size, store_size)
                            == AliasResult::MustAlias
                        {
                            dead = false;
                            break;
                        }
                    }
                    Opcode::Call | Opcode::CallIndirect => {
                        if aa.mod_ref(next) != ModRefResult::NoModRef {
                            dead = false;
                            break;
                        }
                    }
                    _ => {}
                }
            }
            if !dead {
                continue;
            }

            // Successor worklist.
            let mut visited: Vec<String> = Vec::new();
            let mut worklist: Vec<String> = block.successor_labels().to_vec();
            let mut all_paths_kill = true;

            while let Some(label) = worklist.pop() {
                if !all_paths_kill {
                    break;
                }
                if visited.contains(&label) {
                    continue;
                }
                visited.push(label.clone());

                let Some(succ) = function.find_block(&label) else {
                    all_paths_kill = false;
                    continue;
                };
                if block_reads_from(succ, ptr, store_size, aa) {
                    all_paths_kill = false;
                    continue;
                }
                if block_kills_store(succ, ptr, store_size, aa) {
                    continue;
                }
                if succ.successor_labels().is_empty() {
                    // Exits without reading the location.
                    continue;
                }
                for next in succ.successor_labels() {
                    if !visited.contains(next) {
                        worklist.push(next.clone());
                    }
                }
            }

            if all_paths_kill && !visited.is_empty() {
                to_remove.push((bi, i));
            }
        }
    }

    if to_remove.is_empty() {
        return false;
    }
    erase_reverse(function, to_remove);
    true
}

/// Tier 3: collect stores the MemorySSA predicate proves dead.
fn collect_memory_ssa_dead(function: &Function, mssa: &MemorySSA) -> Vec<(usize, usize)> {
    let mut dead = Vec::new();
    for (bi, block) in function.blocks.iter().enumerate() {
        for (i, instr) in block.instructions.iter().enumerate() {
            if instr.op == Opcode::Store && mssa.is_dead_store(bi, i) {
                dead.push((bi, i));
            }
        }
    }
    dead
}

/// Erase (block, index) pairs highest-index-first so positions stay valid.
fn erase_reverse(function: &mut Function, mut sites: Vec<(usize, usize)>) {
    sites.sort_by(|a, b| b.cmp(a));
    for (bi, i) in sites {
        function.blocks[bi].instructions.remove(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{AnalysisManager, AnalysisRegistry};
    use crate::pipeline::register_default_analyses;
    use viper_ir::build::IRBuilder;
    use viper_ir::{CallAttrs, Type};

    fn run(module: &mut Module) -> bool {
        let mut registry = AnalysisRegistry::new();
        register_default_analyses(&mut registry);
        let mut am = AnalysisManager::new(&registry);
        let preserved = Dse.run(module, 0, &mut am);
        !preserved.preserves_all_function_analyses()
    }

    fn count_stores(module: &Module) -> usize {
        module.functions[0]
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter(|i| i.op == Opcode::Store)
            .count()
    }

    #[test]
    fn intra_block_overwrite_kills_earlier_store() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        b.store(Type::I64, p.clone(), Value::const_int(2));
        let v = b.load(Type::I64, p);
        b.ret(Some(v));

        assert!(run(&mut module));
        assert_eq!(count_stores(&module), 1);
    }

    #[test]
    fn intervening_load_blocks_elimination() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        let v = b.load(Type::I64, p.clone());
        b.store(Type::I64, p, Value::const_int(2));
        b.ret(Some(v));

        // First store is read before the overwrite; second store reaches the
        // exit unexamined. Both stay.
        assert!(!run(&mut module));
        assert_eq!(count_stores(&module), 2);
    }

    #[test]
    fn disjoint_fields_are_not_killed() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::Void, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let base = b.alloca(16);
        let f0 = b.gep(base.clone(), Value::const_int(0));
        let f1 = b.gep(base, Value::const_int(8));
        b.store(Type::I64, f0.clone(), Value::const_int(1));
        b.store(Type::I64, f1, Value::const_int(2));
        let v = b.load(Type::I64, f0);
        b.call("rt_print_i64", Type::Void, vec![v], CallAttrs::default());
        b.ret(None);

        assert!(!run(&mut module));
        assert_eq!(count_stores(&module), 2);
    }

    /// Only the MemorySSA tier can remove the first store here: the
    /// intervening call is transparent for the non-escaping alloca, while
    /// the conservative tiers treat it as a read barrier.
    #[test]
    fn memory_ssa_tier_sees_through_calls() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::Void, &[]);
        let entry = b.add_block("entry");
        let has_call = b.add_block("has_call");
        let exit = b.add_block("exit");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        b.br("has_call", vec![]);
        b.set_insert_point(has_call);
        b.call("external", Type::Void, vec![], CallAttrs::default());
        b.br("exit", vec![]);
        b.set_insert_point(exit);
        b.store(Type::I64, p, Value::const_int(2));
        b.ret(None);

        assert!(run(&mut module));
        // First store eliminated, second retained.
        assert_eq!(count_stores(&module), 1);
        let f = &module.functions[0];
        assert_eq!(
            f.find_block("exit").unwrap().instructions[0].op,
            Opcode::Store
        );
        assert!(f.blocks[0].instructions.iter().all(|i| i.op != Opcode::Store));
    }

    #[test]
    fn escaping_alloca_is_never_touched() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::Void, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        b.call("external", Type::Void, vec![p.clone()], CallAttrs::default());
        b.store(Type::I64, p, Value::const_int(2));
        b.ret(None);

        assert!(!run(&mut module));
        assert_eq!(count_stores(&module), 2);
    }
}
