//! Memory SSA: def-use chains for memory-touching operations
//!
//! Each store, load and memory-affecting call is assigned a `MemoryAccess`
//! node; stores produce defs, loads produce uses, and joins where reaching
//! defs diverge receive phis. The payoff is the dead-store predicate: for a
//! store to a non-escaping alloca, calls are transparent — they can neither
//! read nor write stack memory whose address never escapes — which lets DSE
//! eliminate stores a conservative CFG walk must keep.
//!
//! Access ids are dense and start at 1; id 0 is the LiveOnEntry sentinel.

use crate::alias::{AliasResult, BasicAA, ModRefResult};
use crate::cfg::{BlockId, CFGInfo};
use hashbrown::{HashMap, HashSet};
use viper_ir::{Function, Instr, Opcode, Value};

/// Role of a memory access in the def-use graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessKind {
    /// Synthetic root representing the memory state on function entry.
    LiveOnEntry,
    /// A store or modifying call defining a new memory version.
    Def,
    /// A load or reading call consuming a memory version.
    Use,
    /// A join-point merge of diverging incoming memory versions.
    Phi,
}

/// One node in the MemorySSA graph. Consumers hold ids and look nodes up
/// through the owning analysis.
#[derive(Debug, Clone)]
pub struct MemoryAccess {
    pub kind: MemAccessKind,
    /// Dense id; 0 is reserved for LiveOnEntry.
    pub id: u32,
    /// Containing block; `None` for LiveOnEntry.
    pub block: Option<BlockId>,
    /// Index into the block's instructions; `None` for phis and LiveOnEntry.
    pub instr_index: Option<usize>,
    /// Reaching def/phi for this use or def.
    pub defining_access: u32,
    /// For phis: one reaching def per predecessor, in predecessor order.
    pub incoming: Vec<u32>,
    /// Accesses that consume this def or phi.
    pub users: Vec<u32>,
}

/// Slot key for a block's phi inside the instruction map.
const PHI_SLOT: usize = usize::MAX;

/// MemorySSA result for one function.
#[derive(Debug, Clone, Default)]
pub struct MemorySSA {
    accesses: Vec<MemoryAccess>,
    instr_to_access: HashMap<(BlockId, usize), u32>,
    dead_stores: HashSet<u32>,
}

impl MemorySSA {
    /// True when the store at `block[instr_index]` is provably dead: every
    /// path to an exit overwrites it before any load reads it, with calls
    /// transparent for the non-escaping alloca it targets.
    pub fn is_dead_store(&self, block: BlockId, instr_index: usize) -> bool {
        self.instr_to_access
            .get(&(block, instr_index))
            .is_some_and(|id| self.dead_stores.contains(id))
    }

    /// The access assigned to an instruction, if it touches memory.
    pub fn access_for(&self, block: BlockId, instr_index: usize) -> Option<&MemoryAccess> {
        let &id = self.instr_to_access.get(&(block, instr_index))?;
        self.accesses.get(id as usize)
    }

    /// Full node table, LiveOnEntry first (for diagnostics and tests).
    pub fn accesses(&self) -> &[MemoryAccess] {
        &self.accesses
    }
}

/// True if the alloca's address is passed to a call or stored through
/// another pointer.
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
            if instr.op == Opcode::Store && instr.operands.len() >= 2 {
                if instr.operands[1].as_temp() == Some(alloca) {
                    return true;
                }
            }
        }
    }
    false
}

fn non_escaping_allocas(function: &Function) -> HashSet<u32> {
    let mut result = HashSet::new();
    for block in &function.blocks {
        for instr in &block.instructions {
            if instr.op == Opcode::Alloca {
                if let Some(id) = instr.result {
                    if !alloca_escapes(function, id) {
                        result.insert(id);
                    }
                }
            }
        }
    }
    result
}

fn is_non_escaping_target(ptr: Option<&Value>, non_escaping: &HashSet<u32>) -> bool {
    ptr.and_then(Value::as_temp)
        .is_some_and(|id| non_escaping.contains(&id))
}

/// Build MemorySSA for `function`.
///
/// Phase 1 identifies non-escaping allocas, phase 2 runs a forward RPO
/// dataflow (bounded by `|blocks| + 1` iterations) assigning defs/uses and
/// repairing phis until stable, phase 3 marks dead stores via a forward BFS
/// that treats calls as transparent for non-escaping allocas.
pub fn compute_memory_ssa(function: &Function, cfg: &CFGInfo, aa: &BasicAA) -> MemorySSA {
    let mut mssa = MemorySSA::default();
    if function.blocks.is_empty() {
        return mssa;
    }

    mssa.accesses.push(MemoryAccess {
        kind: MemAccessKind::LiveOnEntry,
        id: 0,
        block: None,
        instr_index: None,
        defining_access: 0,
        incoming: Vec::new(),
        users: Vec::new(),
    });

    let non_escaping = non_escaping_allocas(function);

    // out_def[B] = id of the live memory version at the end of block B.
    let mut out_def: HashMap<BlockId, u32> = HashMap::new();
    for b in 0..function.blocks.len() {
        out_def.insert(b, 0);
    }

    let max_iter = function.blocks.len() + 1;
    for _ in 0..max_iter {
        let mut changed = false;

        for &block in cfg.rpo() {
            let preds = cfg.predecessors_of(block);
            let mut in_def = 0u32;

            if !preds.is_empty() {
                let first = out_def[&preds[0]];
                let all_same = preds.iter().all(|p| out_def[p] == first);

                if all_same {
                    in_def = first;
                } else {
                    // Reaching defs diverge: materialise or repair a phi.
                    let phi_id = match mssa.instr_to_access.get(&(block, PHI_SLOT)) {
                        Some(&id) => {
                            let incoming: Vec<u32> = preds.iter().map(|p| out_def[p]).collect();
                            let phi = &mut mssa.accesses[id as usize];
                            if phi.incoming != incoming {
                                phi.incoming = incoming;
                                changed = true;
                            }
                            id
                        }
                        None => {
                            let id = mssa.accesses.len() as u32;
                            mssa.accesses.push(MemoryAccess {
                                kind: MemAccessKind::Phi,
                                id,
                                block: Some(block),
                                instr_index: None,
                                defining_access: 0,
                                incoming: preds.iter().map(|p| out_def[p]).collect(),
                                users: Vec::new(),
                            });
                            mssa.instr_to_access.insert((block, PHI_SLOT), id);
                            changed = true;
                            id
                        }
                    };
                    in_def = phi_id;
                }
            }

            let mut cur_def = in_def;

            for (i, instr) in function.blocks[block].instructions.iter().enumerate() {
                let existing = mssa.instr_to_access.get(&(block, i)).copied();

                match instr.op {
                    Opcode::Store => match existing {
                        None => {
                            let id = mssa.accesses.len() as u32;
                            mssa.accesses.push(MemoryAccess {
                                kind: MemAccessKind::Def,
                                id,
                                block: Some(block),
                                instr_index: Some(i),
                                defining_access: cur_def,
                                incoming: Vec::new(),
                                users: Vec::new(),
                            });
                            mssa.instr_to_access.insert((block, i), id);
                            cur_def = id;
                            changed = true;
                        }
                        Some(id) => {
                            let access = &mut mssa.accesses[id as usize];
                            if access.defining_access != cur_def {
                                access.defining_access = cur_def;
                                changed = true;
                            }
                            cur_def = id;
                        }
                    },
                    Opcode::Load => match existing {
                        None => {
                            let id = mssa.accesses.len() as u32;
                            mssa.accesses.push(MemoryAccess {
                                kind: MemAccessKind::Use,
                                id,
                                block: Some(block),
                                instr_index: Some(i),
                                defining_access: cur_def,
                                incoming: Vec::new(),
                                users: Vec::new(),
                            });
                            mssa.instr_to_access.insert((block, i), id);
                            mssa.accesses[cur_def as usize].users.push(id);
                            changed = true;
                        }
                        Some(id) => {
                            let old_def = mssa.accesses[id as usize].defining_access;
                            if old_def != cur_def {
                                let users = &mut mssa.accesses[old_def as usize].users;
                                users.retain(|&u| u != id);
                                mssa.accesses[id as usize].defining_access = cur_def;
                                mssa.accesses[cur_def as usize].users.push(id);
                                changed = true;
                            }
                        }
                    },
                    Opcode::Call | Opcode::CallIndirect => {
                        // Calls model global memory; transparency for
                        // non-escaping allocas is applied in the dead-store
                        // phase.
                        let mr = aa.mod_ref(instr);
                        if mr == ModRefResult::Mod || mr == ModRefResult::ModRef {
                            match existing {
                                None => {
                                    let id = mssa.accesses.len() as u32;
                                    mssa.accesses.push(MemoryAccess {
                                        kind: MemAccessKind::Def,
                                        id,
                                        block: Some(block),
                                        instr_index: Some(i),
                                        defining_access: cur_def,
                                        incoming: Vec::new(),
                                        users: Vec::new(),
                                    });
                                    mssa.instr_to_access.insert((block, i), id);
                                    cur_def = id;
                                    changed = true;
                                }
                                Some(id) => {
                                    let access = &mut mssa.accesses[id as usize];
                                    if access.defining_access != cur_def {
                                        access.defining_access = cur_def;
                                        changed = true;
                                    }
                                    cur_def = id;
                                }
                            }
                        } else if mr == ModRefResult::Ref {
                            match existing {
                                None => {
                                    let id = mssa.accesses.len() as u32;
                                    mssa.accesses.push(MemoryAccess {
                                        kind: MemAccessKind::Use,
                                        id,
                                        block: Some(block),
                                        instr_index: Some(i),
                                        defining_access: cur_def,
                                        incoming: Vec::new(),
                                        users: Vec::new(),
                                    });
                                    mssa.instr_to_access.insert((block, i), id);
                                    mssa.accesses[cur_def as usize].users.push(id);
                                    changed = true;
                                }
                                Some(id) => {
                                    let old_def = mssa.accesses[id as usize].defining_access;
                                    if old_def != cur_def {
                                        let users = &mut mssa.accesses[old_def as usize].users;
                                        users.retain(|&u| u != id);
                                        mssa.accesses[id as usize].defining_access = cur_def;
                                        mssa.accesses[cur_def as usize].users.push(id);
                                        changed = true;
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            if out_def[&block] != cur_def {
                out_def.insert(block, cur_def);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    mark_dead_stores(function, cfg, aa, &non_escaping, &mut mssa);
    log::trace!(
        "memory-ssa: {} accesses, {} dead store(s)",
        mssa.accesses.len() - 1,
        mssa.dead_stores.len()
    );
    mssa
}

/// Forward BFS per store to a non-escaping alloca. Calls are skipped
/// entirely: they cannot read or write stack memory whose address never
/// escapes. A store directly followed by an exit keeps its conservative
/// treatment (no successor was examined).
fn mark_dead_stores(
    function: &Function,
    cfg: &CFGInfo,
    aa: &BasicAA,
    non_escaping: &HashSet<u32>,
    mssa: &mut MemorySSA,
) {
    for (block_idx, block) in function.blocks.iter().enumerate() {
        for (i, instr) in block.instructions.iter().enumerate() {
            if instr.op != Opcode::Store || instr.operands.is_empty() {
                continue;
            }
            let ptr = &instr.operands[0];
            if !is_non_escaping_target(Some(ptr), non_escaping) {
                continue;
            }
            let store_size = BasicAA::type_size_bytes(instr.ty);

            // Scan the rest of this block first.
            let mut dead = true;
            for next in &block.instructions[i + 1..] {
                if scan_result(next, ptr, store_size, aa) != ScanOutcome::Transparent {
                    dead = false;
                    break;
                }
            }
            if !dead {
                continue;
            }

            // Cross-block BFS over successors.
            let mut visited: HashSet<BlockId> = HashSet::new();
            let mut worklist: Vec<BlockId> = cfg.successors_of(block_idx).to_vec();
            let mut all_paths_covered = true;

            'bfs: while let Some(succ) = worklist.pop() {
                if !visited.insert(succ) {
                    continue;
                }
                let succ_block = &function.blocks[succ];

                let mut killed = false;
                for next in &succ_block.instructions {
                    match scan_result(next, ptr, store_size, aa) {
                        ScanOutcome::Transparent => {}
                        ScanOutcome::Reads => {
                            all_paths_covered = false;
                            break 'bfs;
                        }
                        ScanOutcome::Kills => {
                            killed = true;
                            break;
                        }
                    }
                }
                if killed {
                    continue;
                }
                let succs = cfg.successors_of(succ);
                if succs.is_empty() {
                    // Path exits without reading.
                    continue;
                }
                for &s in succs {
                    if !visited.contains(&s) {
                        worklist.push(s);
                    }
                }
            }

            if all_paths_covered && !visited.is_empty() {
                if let Some(&id) = mssa.instr_to_access.get(&(block_idx, i)) {
                    mssa.dead_stores.insert(id);
                }
            }
        }
    }
}

#[derive(PartialEq, Eq)]
enum ScanOutcome {
    /// Instruction cannot observe or overwrite the tracked location.
    Transparent,
    /// Instruction may read the tracked location.
    Reads,
    /// Instruction definitely overwrites the tracked location.
    Kills,
}

fn scan_result(
    instr: &Instr,
    ptr: &Value,
    store_size: Option<u32>,
    aa: &BasicAA,
) -> ScanOutcome {
    match instr.op {
        Opcode::Load if !instr.operands.is_empty() => {
            let load_size = BasicAA::type_size_bytes(instr.ty);
            if aa.alias(&instr.operands[0], ptr, load_size, store_size) != AliasResult::NoAlias {
                ScanOutcome::Reads
            } else {
                ScanOutcome::Transparent
            }
        }
        Opcode::Store if !instr.operands.is_empty() => {
            let next_size = BasicAA::type_size_bytes(instr.ty);
            if aa.alias(&instr.operands[0], ptr, next_size, store_size) == AliasResult::MustAlias {
                ScanOutcome::Kills
            } else {
                ScanOutcome::Transparent
            }
        }
        // Calls cannot touch a non-escaping alloca.
        _ => ScanOutcome::Transparent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_cfg;
    use viper_ir::build::IRBuilder;
    use viper_ir::{CallAttrs, Module, Type};

    /// entry: %p = alloca 8; store %p, 1; br has_call
    /// has_call: call @external(); br exit
    /// exit: store %p, 2; ret
    fn store_call_store() -> Module {
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
        module
    }

    #[test]
    fn call_is_transparent_for_non_escaping_alloca() {
        let module = store_call_store();
        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let aa = BasicAA::compute(&module, f);
        let mssa = compute_memory_ssa(f, &cfg, &aa);

        // First store (entry, idx 1) is killed by the exit store; the call in
        // between cannot read the non-escaping alloca.
        assert!(mssa.is_dead_store(0, 1));
        // Second store reaches the exit unexamined, so it is retained.
        assert!(!mssa.is_dead_store(2, 0));
    }

    #[test]
    fn loads_keep_stores_alive() {
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

        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let aa = BasicAA::compute(&module, f);
        let mssa = compute_memory_ssa(f, &cfg, &aa);

        assert!(!mssa.is_dead_store(0, 1));
        let use_access = mssa.access_for(0, 2).unwrap();
        assert_eq!(use_access.kind, MemAccessKind::Use);
        // The load's reaching def is the first store.
        let def = mssa.access_for(0, 1).unwrap();
        assert_eq!(use_access.defining_access, def.id);
        assert!(def.users.contains(&use_access.id));
    }

    #[test]
    fn escaping_allocas_are_not_tracked_precisely() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::Void, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        // Address escapes into the call, so the store must stay.
        b.call("external", Type::Void, vec![p.clone()], CallAttrs::default());
        b.store(Type::I64, p, Value::const_int(2));
        b.ret(None);

        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let aa = BasicAA::compute(&module, f);
        let mssa = compute_memory_ssa(f, &cfg, &aa);
        assert!(!mssa.is_dead_store(0, 1));
    }

    #[test]
    fn diverging_defs_insert_a_phi() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("c", Type::I1)]);
        let entry = b.add_block("entry");
        let left = b.add_block("left");
        let right = b.add_block("right");
        let join = b.add_block("join");

        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.cbr(Value::temp(0), "left", vec![], "right", vec![]);
        b.set_insert_point(left);
        b.store(Type::I64, p.clone(), Value::const_int(1));
        b.br("join", vec![]);
        b.set_insert_point(right);
        b.store(Type::I64, p.clone(), Value::const_int(2));
        b.br("join", vec![]);
        b.set_insert_point(join);
        let v = b.load(Type::I64, p);
        b.ret(Some(v));

        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let aa = BasicAA::compute(&module, f);
        let mssa = compute_memory_ssa(f, &cfg, &aa);

        let phi = mssa
            .accesses()
            .iter()
            .find(|a| a.kind == MemAccessKind::Phi)
            .expect("phi at join");
        assert_eq!(phi.block, Some(join));
        assert_eq!(phi.incoming.len(), 2);
        // The join load consumes the phi.
        let load = mssa.access_for(join, 0).unwrap();
        assert_eq!(load.defining_access, phi.id);
    }
}
