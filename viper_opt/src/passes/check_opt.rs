//! Optimization of check opcodes
//!
//! Three phases over `idx.chk`, the `*.chk0` family and the checked casts:
//! 1. dominance-based redundancy: a check identical to one that already
//!    executed on every path is removed and its uses redirected;
//! 2. loop-invariant hoisting: a check in a loop header whose operands are
//!    invariant moves to the preheader, executing once instead of per
//!    iteration;
//! 3. constant folding: a check whose operands are constants and provably in
//!    range is replaced by its value.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use hashbrown::{HashMap, HashSet};
use viper_analysis::{BlockId, DomTree, Loop, LoopInfo};
use viper_ir::eval::eval_check;
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, Instr, Module, Opcode, Type, Value};

#[derive(Default)]
pub struct CheckOpt;

/// Two checks with the same key test the same condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CheckKey {
    op: Opcode,
    ty: Type,
    operands: Vec<Value>,
}

impl FunctionPass for CheckOpt {
    fn id(&self) -> &str {
        "check-opt"
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
        let loops = am
            .function_result::<LoopInfo>(crate::ids::LOOP_INFO, module, func)
            .loops()
            .to_vec();
        let function = &mut module.functions[func];

        let mut changed = eliminate_redundant_checks(function, &dom);
        for lp in &loops {
            changed |= hoist_invariant_checks(function, lp);
        }
        changed |= fold_safe_constant_checks(function);

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("check-opt: @{} optimised checks", function.name);
        // Instructions only moved or removed; the graph shape is intact.
        PreservedAnalyses::none()
            .preserve_all_modules()
            .preserve_function(crate::ids::CFG)
            .preserve_function(crate::ids::DOMINATORS)
            .preserve_function(crate::ids::POST_DOMINATORS)
            .preserve_function(crate::ids::LOOP_INFO)
    }
}

/// Phase 1: walk the dominator tree, passing each child a copy of the table
/// of checks seen on the path to it; a check whose key already appears is
/// redundant. Siblings never see each other's checks, so a match is always a
/// truly dominating one.
fn eliminate_redundant_checks(function: &mut Function, dom: &DomTree) -> bool {
    let mut changed = false;
    visit_checks(function, dom.entry(), dom, HashMap::new(), &mut changed);
    changed
}

fn visit_checks(
    function: &mut Function,
    block: BlockId,
    dom: &DomTree,
    mut dominating: HashMap<CheckKey, Option<u32>>,
    changed: &mut bool,
) {
    let mut idx = 0;
    while idx < function.blocks[block].instructions.len() {
        let instr = &function.blocks[block].instructions[idx];
        if !instr.op.is_check() {
            idx += 1;
            continue;
        }
        let key = CheckKey {
            op: instr.op,
            ty: instr.ty,
            operands: instr.operands.clone(),
        };
        match dominating.get(&key) {
            Some(prior_result) => {
                let redirect = instr.result.zip(*prior_result);
                function.blocks[block].instructions.remove(idx);
                if let Some((dead, prior)) = redirect {
                    replace_all_uses(function, dead, &Value::temp(prior));
                }
                *changed = true;
                // Do not advance: the next instruction shifted into idx.
            }
            None => {
                dominating.insert(key, instr.result);
                idx += 1;
            }
        }
    }

    for &child in dom.children_of(block) {
        visit_checks(function, child, dom, dominating.clone(), changed);
    }
}

/// The dedicated preheader; a hoisted check must only ever execute on paths
/// that were about to enter the loop, so a shared or conditional predecessor
/// disqualifies the loop.
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

/// Phase 2: hoist checks out of the loop header. The header executes on
/// every iteration and on loop entry, so hoisting to the preheader keeps the
/// trap timing ahead of the loop body.
fn hoist_invariant_checks(function: &mut Function, lp: &Loop) -> bool {
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
        if !instr.op.is_check() || !operands_invariant(instr, &invariants) {
            idx += 1;
            continue;
        }

        let hoisted = function.blocks[header].instructions.remove(idx);
        if let Some(result) = hoisted.result {
            // Hoisted results become invariant, enabling cascading hoists.
            invariants.insert(result);
        }
        let pre = &mut function.blocks[preheader];
        let mut insert_at = pre.instructions.len();
        if pre.terminated && insert_at > 0 {
            insert_at -= 1;
        }
        pre.instructions.insert(insert_at, hoisted);
        changed = true;
    }

    changed
}

/// Phase 3: fold checks whose operands are all constants and provably pass.
/// A check that would trap stays in the program.
fn fold_safe_constant_checks(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut fold: Option<(usize, usize, u32, Value)> = None;
        'search: for (bi, block) in function.blocks.iter().enumerate() {
            for (ii, instr) in block.instructions.iter().enumerate() {
                if !instr.op.is_check() {
                    continue;
                }
                let Some(result) = instr.result else {
                    continue;
                };
                if !instr.operands.iter().all(Value::is_const) {
                    continue;
                }
                if let Some(Ok(value)) = eval_check(instr.op, instr.ty, &instr.operands) {
                    fold = Some((bi, ii, result, value));
                    break 'search;
                }
            }
        }
        match fold {
            Some((bi, ii, result, value)) => {
                function.blocks[bi].instructions.remove(ii);
                replace_all_uses(function, result, &value);
                changed = true;
            }
            None => break,
        }
    }
    changed
}
