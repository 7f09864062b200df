//! Promotion of allocas to SSA block parameters
//!
//! An alloca qualifies when its address is used only as the pointer operand
//! of direct loads and stores, all with one primitive access type. Stores
//! become SSA definitions, loads become uses of the reaching definition, and
//! joins where definitions diverge receive fresh block parameters placed at
//! the iterated dominance frontier of the defining blocks. A load with no
//! store on some path reads the type's zero value, matching the VM's
//! zero-initialised stack memory.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use hashbrown::{HashMap, HashSet};
use viper_analysis::{build_cfg, compute_dominator_tree, dominance_frontier, BlockId, CFGInfo};
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, Module, Opcode, Param, Type, Value};

#[derive(Default)]
pub struct Mem2Reg;

impl FunctionPass for Mem2Reg {
    fn id(&self) -> &str {
        "mem2reg"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let changed = promote_allocas(&mut module.functions[func]);
        if !changed {
            return PreservedAnalyses::all();
        }
        // Only block parameters and branch arguments changed; the graph
        // shape, dominators and loops are intact.
        PreservedAnalyses::none()
            .preserve_all_modules()
            .preserve_function(crate::ids::CFG)
            .preserve_function(crate::ids::DOMINATORS)
            .preserve_function(crate::ids::POST_DOMINATORS)
            .preserve_function(crate::ids::LOOP_INFO)
    }
}

/// One alloca selected for promotion.
struct Candidate {
    alloca: u32,
    ty: Type,
    def_blocks: HashSet<BlockId>,
}

fn zero_value(ty: Type) -> Value {
    match ty {
        Type::I1 => Value::const_bool(false),
        Type::F64 => Value::const_float(0.0),
        Type::Ptr => Value::null_ptr(),
        _ => Value::const_int(0),
    }
}

/// Find allocas accessed only by direct loads and stores of one primitive
/// type, with every access in a reachable block.
fn collect_candidates(function: &Function, cfg: &CFGInfo) -> Vec<Candidate> {
    let mut allocas: HashMap<u32, (Option<Type>, HashSet<BlockId>, bool)> = HashMap::new();

    for block in &function.blocks {
        for instr in &block.instructions {
            if instr.op == Opcode::Alloca {
                if let Some(result) = instr.result {
                    allocas.entry(result).or_insert((None, HashSet::new(), true));
                }
            }
        }
    }
    if allocas.is_empty() {
        return Vec::new();
    }

    for (bi, block) in function.blocks.iter().enumerate() {
        for instr in &block.instructions {
            let mut note_use = |id: u32, promotable: bool, is_def: bool, ty: Option<Type>| {
                if let Some(entry) = allocas.get_mut(&id) {
                    if !promotable || !cfg.is_reachable(bi) {
                        entry.2 = false;
                        return;
                    }
                    if let Some(ty) = ty {
                        match entry.0 {
                            None => entry.0 = Some(ty),
                            Some(existing) if existing != ty => entry.2 = false,
                            _ => {}
                        }
                    }
                    if is_def {
                        entry.1.insert(bi);
                    }
                }
            };

            match instr.op {
                Opcode::Load => {
                    if let Some(id) = instr.operands.first().and_then(Value::as_temp) {
                        note_use(id, true, false, Some(instr.ty));
                    }
                }
                Opcode::Store => {
                    if let Some(id) = instr.operands.first().and_then(Value::as_temp) {
                        note_use(id, true, true, Some(instr.ty));
                    }
                    // The address stored as a value disqualifies promotion.
                    if let Some(id) = instr.operands.get(1).and_then(Value::as_temp) {
                        note_use(id, false, false, None);
                    }
                }
                Opcode::Alloca => {}
                _ => {
                    for operand in &instr.operands {
                        if let Some(id) = operand.as_temp() {
                            note_use(id, false, false, None);
                        }
                    }
                }
            }
            for args in &instr.br_args {
                for arg in args {
                    if let Some(id) = arg.as_temp() {
                        if let Some(entry) = allocas.get_mut(&id) {
                            entry.2 = false;
                        }
                    }
                }
            }
        }
    }

    let mut candidates: Vec<Candidate> = allocas
        .into_iter()
        .filter_map(|(alloca, (ty, def_blocks, promotable))| {
            let ty = ty?;
            if !promotable || matches!(ty, Type::Str | Type::Void) {
                return None;
            }
            Some(Candidate { alloca, ty, def_blocks })
        })
        .collect();
    candidates.sort_by_key(|c| c.alloca);
    candidates
}

/// Iterated dominance frontier of the defining blocks.
fn phi_placement(
    candidate: &Candidate,
    frontier: &HashMap<BlockId, Vec<BlockId>>,
) -> HashSet<BlockId> {
    let mut phi_blocks = HashSet::new();
    let mut worklist: Vec<BlockId> = candidate.def_blocks.iter().copied().collect();
    let mut seen: HashSet<BlockId> = worklist.iter().copied().collect();

    while let Some(block) = worklist.pop() {
        let Some(df) = frontier.get(&block) else {
            continue;
        };
        for &join in df {
            if phi_blocks.insert(join) && seen.insert(join) {
                worklist.push(join);
            }
        }
    }
    phi_blocks
}

pub(crate) fn promote_allocas(function: &mut Function) -> bool {
    if function.blocks.is_empty() {
        return false;
    }
    let cfg = build_cfg(function);
    let dom = compute_dominator_tree(&cfg);
    let frontier = dominance_frontier(&cfg, &dom);

    // The entry block must stay parameter-free; a candidate whose joins
    // would reach it is abandoned rather than promoted partially.
    let candidates: Vec<(Candidate, HashSet<BlockId>)> = collect_candidates(function, &cfg)
        .into_iter()
        .map(|c| {
            let phis = phi_placement(&c, &frontier);
            (c, phis)
        })
        .filter(|(_, phis)| !phis.contains(&0))
        .collect();
    if candidates.is_empty() {
        return false;
    }
    let candidates_only: Vec<&Candidate> = candidates.iter().map(|(c, _)| c).collect();

    // Place block parameters; remember (block, alloca) -> param id.
    let mut next_id = viper_ir::util::next_temp_id(function);
    let mut phi_params: HashMap<(BlockId, u32), u32> = HashMap::new();
    for (candidate, phis) in &candidates {
        for &block in phis {
            let name = function
                .value_names
                .get(candidate.alloca as usize)
                .cloned()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "m2r".to_string());
            let id = next_id;
            next_id += 1;
            function.blocks[block]
                .params
                .push(Param::new(name.clone(), candidate.ty, id));
            function.set_value_name(id, name);
            phi_params.insert((block, candidate.alloca), id);
        }
    }

    // Rename along the dominator tree; record each block's outgoing value
    // per alloca for the edge-argument fill afterwards.
    let mut out_values: HashMap<BlockId, HashMap<u32, Value>> = HashMap::new();
    let mut removals: Vec<(BlockId, usize)> = Vec::new();
    let candidate_ids: HashSet<u32> = candidates_only.iter().map(|c| c.alloca).collect();
    let types: HashMap<u32, Type> = candidates_only.iter().map(|c| (c.alloca, c.ty)).collect();

    // Iterative preorder DFS carrying the reaching-definition map.
    let mut stack: Vec<(BlockId, HashMap<u32, Value>)> = vec![(dom.entry(), HashMap::new())];
    let mut replacements: Vec<(u32, Value)> = Vec::new();

    while let Some((block, mut current)) = stack.pop() {
        for candidate in &candidates_only {
            if let Some(&param) = phi_params.get(&(block, candidate.alloca)) {
                current.insert(candidate.alloca, Value::temp(param));
            }
        }

        for (ii, instr) in function.blocks[block].instructions.iter().enumerate() {
            match instr.op {
                Opcode::Alloca => {
                    if instr.result.is_some_and(|r| candidate_ids.contains(&r)) {
                        removals.push((block, ii));
                    }
                }
                Opcode::Load => {
                    let Some(ptr) = instr.operands.first().and_then(Value::as_temp) else {
                        continue;
                    };
                    if !candidate_ids.contains(&ptr) {
                        continue;
                    }
                    let value = current
                        .get(&ptr)
                        .cloned()
                        .unwrap_or_else(|| zero_value(types[&ptr]));
                    replacements.push((instr.result.expect("load result"), value));
                    removals.push((block, ii));
                }
                Opcode::Store => {
                    let Some(ptr) = instr.operands.first().and_then(Value::as_temp) else {
                        continue;
                    };
                    if !candidate_ids.contains(&ptr) {
                        continue;
                    }
                    current.insert(ptr, instr.operands[1].clone());
                    removals.push((block, ii));
                }
                _ => {}
            }
        }

        out_values.insert(block, current.clone());
        // Children pushed in reverse preserve preorder; each gets its own
        // copy of the reaching definitions.
        for &child in dom.children_of(block).iter().rev() {
            stack.push((child, current.clone()));
        }
    }

    // Loads may forward to other promoted loads; resolve chains before
    // rewriting.
    let resolved: HashMap<u32, Value> = {
        let direct: HashMap<u32, Value> = replacements.iter().cloned().collect();
        let mut resolved = HashMap::new();
        for (temp, mut value) in replacements {
            let mut hops = 0;
            while let Some(id) = value.as_temp() {
                match direct.get(&id) {
                    Some(next) if hops < 64 => {
                        value = next.clone();
                        hops += 1;
                    }
                    _ => break,
                }
            }
            resolved.insert(temp, value);
        }
        resolved
    };

    // Fill branch arguments on every edge into a phi block, in the same
    // candidate order the parameters were appended. Unreachable predecessors
    // have no renaming state and pass the zero value, keeping argument lists
    // aligned with the extended parameter lists.
    for (bi, block) in function.blocks.clone().iter().enumerate() {
        let Some(term) = block.terminator() else {
            continue;
        };
        for (li, label) in term.labels.iter().enumerate() {
            let Some(target) = cfg.block_id(label) else {
                continue;
            };
            for candidate in &candidates_only {
                if !phi_params.contains_key(&(target, candidate.alloca)) {
                    continue;
                }
                let value = out_values
                    .get(&bi)
                    .and_then(|m| m.get(&candidate.alloca))
                    .cloned()
                    .unwrap_or_else(|| zero_value(candidate.ty));
                let value = match value.as_temp().and_then(|id| resolved.get(&id)) {
                    Some(v) => v.clone(),
                    None => value,
                };
                let term = function.blocks[bi].terminator_mut().expect("terminator");
                term.br_args[li].push(value);
            }
        }
    }

    // Rewrite load uses, then drop the dead loads/stores/allocas.
    for (temp, value) in &resolved {
        replace_all_uses(function, *temp, value);
    }
    removals.sort_by(|a, b| b.cmp(a));
    for (block, idx) in removals {
        function.blocks[block].instructions.remove(idx);
    }

    log::debug!(
        "mem2reg: @{} promoted {} alloca(s)",
        function.name,
        candidates_only.len()
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::build::IRBuilder;
    use viper_ir::CallAttrs;
    use viper_verify::verify_module;
    use viper_vm::run_module;

    #[test]
    fn promotes_straight_line_alloca() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(41));
        let v = b.load(Type::I64, p.clone());
        let v2 = b.binary(Opcode::Add, Type::I64, v, Value::const_int(1));
        b.store(Type::I64, p.clone(), v2.clone());
        let out = b.load(Type::I64, p);
        b.ret(Some(out));

        assert!(promote_allocas(&mut module.functions[0]));
        assert!(verify_module(&module).is_ok());
        let f = &module.functions[0];
        assert!(f.blocks[0]
            .instructions
            .iter()
            .all(|i| !matches!(i.op, Opcode::Alloca | Opcode::Load | Opcode::Store)));
        assert_eq!(run_module(&module), Ok(42));
    }

    #[test]
    fn inserts_block_parameter_at_join() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        let left = b.add_block("left");
        let right = b.add_block("right");
        let join = b.add_block("join");

        b.set_insert_point(entry);
        let p = b.alloca(8);
        let c = b.binary(Opcode::SCmpGt, Type::I1, Value::const_int(1), Value::const_int(0));
        b.cbr(c, "left", vec![], "right", vec![]);
        b.set_insert_point(left);
        b.store(Type::I64, p.clone(), Value::const_int(10));
        b.br("join", vec![]);
        b.set_insert_point(right);
        b.store(Type::I64, p.clone(), Value::const_int(20));
        b.br("join", vec![]);
        b.set_insert_point(join);
        let v = b.load(Type::I64, p);
        b.ret(Some(v));

        let before = run_module(&module).unwrap();
        assert!(promote_allocas(&mut module.functions[0]));
        assert!(verify_module(&module).is_ok());

        let f = &module.functions[0];
        let join_block = f.find_block("join").unwrap();
        assert_eq!(join_block.params.len(), 1);
        assert!(f
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .all(|i| !matches!(i.op, Opcode::Load | Opcode::Store | Opcode::Alloca)));
        assert_eq!(run_module(&module), Ok(before));
    }

    #[test]
    fn promotes_loop_carried_memory_cell() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let exit = b.add_block("exit");

        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(0));
        b.br("header", vec![Value::const_int(0)]);

        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        let acc = b.load(Type::I64, p.clone());
        let acc2 = b.binary(Opcode::Add, Type::I64, acc, i.clone());
        b.store(Type::I64, p.clone(), acc2);
        let i2 = b.binary(Opcode::Add, Type::I64, i.clone(), Value::const_int(1));
        let c = b.binary(Opcode::SCmpLt, Type::I1, i2.clone(), Value::const_int(5));
        b.cbr(c, "header", vec![i2], "exit", vec![]);

        b.set_insert_point(exit);
        let out = b.load(Type::I64, p);
        b.ret(Some(out));

        let before = run_module(&module).unwrap();
        assert_eq!(before, 10); // 0+1+2+3+4

        assert!(promote_allocas(&mut module.functions[0]));
        assert!(verify_module(&module).is_ok());
        assert_eq!(run_module(&module), Ok(before));
    }

    #[test]
    fn address_taken_alloca_is_not_promoted() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        b.call("external", Type::Void, vec![p.clone()], CallAttrs::default());
        let v = b.load(Type::I64, p);
        b.ret(Some(v));

        assert!(!promote_allocas(&mut module.functions[0]));
    }

    #[test]
    fn load_before_any_store_reads_zero() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        let v = b.load(Type::I64, p);
        b.ret(Some(v));

        assert!(promote_allocas(&mut module.functions[0]));
        assert_eq!(run_module(&module), Ok(0));
    }
}
