//! Control-flow graph simplification
//!
//! Four rewrites to a fixed point: fold terminators with constant conditions,
//! delete unreachable blocks, merge straight-line block pairs, and collapse
//! empty forwarding blocks.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use hashbrown::HashSet;
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, Instr, Module, Opcode, Type, Value};

#[derive(Default)]
pub struct SimplifyCfg;

impl FunctionPass for SimplifyCfg {
    fn id(&self) -> &str {
        "simplify-cfg"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let changed = simplify_function(&mut module.functions[func]);
        if !changed {
            return PreservedAnalyses::all();
        }
        PreservedAnalyses::none().preserve_all_modules()
    }
}

/// Run all simplifications to a fixed point; returns true when the function
/// changed.
pub(crate) fn simplify_function(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut round = false;
        round |= fold_constant_branches(function);
        round |= remove_unreachable_blocks(function);
        round |= merge_straight_line_pairs(function);
        round |= collapse_forwarders(function);
        if !round {
            break;
        }
        changed = true;
    }
    if changed {
        log::debug!("simplify-cfg: @{} reduced to {} block(s)", function.name, function.blocks.len());
    }
    changed
}

/// Rewrite `cbr`/`switch.i32` with constant scrutinee into plain branches.
fn fold_constant_branches(function: &mut Function) -> bool {
    let mut changed = false;
    for block in &mut function.blocks {
        let Some(term) = block.instructions.last_mut() else {
            continue;
        };
        match term.op {
            Opcode::CBr => {
                let Some(cond) = term.operands.first().and_then(Value::as_const_int) else {
                    continue;
                };
                let taken = if cond != 0 { 0 } else { 1 };
                let label = term.labels[taken].clone();
                let args = term.br_args.get(taken).cloned().unwrap_or_default();
                *term = branch_to(label, args, term.clone());
                changed = true;
            }
            Opcode::SwitchI32 => {
                let Some(scrutinee) = term.switch_scrutinee().as_const_int() else {
                    continue;
                };
                let mut taken = 0usize;
                for case in 0..term.switch_case_count() {
                    if term.switch_case_value(case).as_const_int() == Some(scrutinee) {
                        taken = case + 1;
                        break;
                    }
                }
                let label = term.labels[taken].clone();
                let args = term.br_args.get(taken).cloned().unwrap_or_default();
                *term = branch_to(label, args, term.clone());
                changed = true;
            }
            _ => {}
        }
    }
    changed
}

fn branch_to(label: String, args: Vec<Value>, original: Instr) -> Instr {
    let mut br = Instr::new(Opcode::Br, Type::Void);
    br.labels = vec![label];
    br.br_args = vec![args];
    br.loc = original.loc;
    br
}

fn remove_unreachable_blocks(function: &mut Function) -> bool {
    if function.blocks.is_empty() {
        return false;
    }
    let mut reachable: HashSet<String> = HashSet::new();
    let mut worklist = vec![function.blocks[0].label.clone()];
    while let Some(label) = worklist.pop() {
        if !reachable.insert(label.clone()) {
            continue;
        }
        if let Some(block) = function.find_block(&label) {
            for succ in block.successor_labels() {
                if !reachable.contains(succ) {
                    worklist.push(succ.clone());
                }
            }
        }
    }
    let before = function.blocks.len();
    function.blocks.retain(|b| reachable.contains(&b.label));
    function.blocks.len() != before
}

/// Merge B -> C when B's only successor is C, C's only predecessor is B, and
/// B ends in an unconditional branch. C's parameters are substituted by the
/// branch arguments and its body absorbed into B.
fn merge_straight_line_pairs(function: &mut Function) -> bool {
    let mut changed = false;
    'outer: loop {
        let mut merge: Option<(usize, usize)> = None;
        for (bi, block) in function.blocks.iter().enumerate() {
            let Some(term) = block.terminator() else {
                continue;
            };
            if term.op != Opcode::Br {
                continue;
            }
            let target = &term.labels[0];
            if *target == block.label {
                continue;
            }
            let Some(ci) = function.block_index(target) else {
                continue;
            };
            if ci == 0 {
                continue; // never merge the entry block away
            }
            // C must have exactly one incoming edge, from B.
            let mut incoming = 0usize;
            for other in &function.blocks {
                for label in other.successor_labels() {
                    if label == target {
                        incoming += 1;
                    }
                }
            }
            if incoming != 1 {
                continue;
            }
            merge = Some((bi, ci));
            break;
        }

        let Some((bi, ci)) = merge else {
            break 'outer;
        };

        // Substitute C's params with the branch arguments.
        let args = function.blocks[bi]
            .terminator()
            .map(|t| t.br_args[0].clone())
            .unwrap_or_default();
        let params: Vec<u32> = function.blocks[ci].params.iter().map(|p| p.id).collect();
        debug_assert_eq!(args.len(), params.len());
        for (param, arg) in params.iter().zip(&args) {
            replace_all_uses(function, *param, arg);
        }

        let mut tail = std::mem::take(&mut function.blocks[ci].instructions);
        let terminated = function.blocks[ci].terminated;
        let removed_label = function.blocks[ci].label.clone();
        let merged = &mut function.blocks[bi];
        merged.instructions.pop(); // drop the Br
        merged.instructions.append(&mut tail);
        merged.terminated = terminated;
        function.remove_block(&removed_label);
        changed = true;
    }
    changed
}

/// Redirect edges through blocks that only forward to another block.
///
/// Safe only when the forwarded arguments are constants or the forwarder's
/// own parameters; any other temp need not dominate the predecessors.
fn collapse_forwarders(function: &mut Function) -> bool {
    let mut changed = false;
    for di in 1..function.blocks.len() {
        let forwarder = &function.blocks[di];
        if forwarder.instructions.len() != 1 {
            continue;
        }
        let Some(term) = forwarder.terminator() else {
            continue;
        };
        if term.op != Opcode::Br || term.labels[0] == forwarder.label {
            continue;
        }

        let param_ids: Vec<u32> = forwarder.params.iter().map(|p| p.id).collect();
        let forward_args = term.br_args[0].clone();
        let safe = forward_args.iter().all(|arg| match arg.as_temp() {
            Some(id) => param_ids.contains(&id),
            None => true,
        });
        if !safe {
            continue;
        }
        // The forwarder dominates its target, so its params may have uses
        // beyond the forwarded arguments; those would be stranded.
        let params_escape = param_ids.iter().any(|&id| {
            let in_args = forward_args
                .iter()
                .filter(|a| a.as_temp() == Some(id))
                .count();
            viper_ir::util::count_temp_uses(function, id) != in_args
        });
        if params_escape {
            continue;
        }

        let d_label = forwarder.label.clone();
        let target = term.labels[0].clone();

        // Rewrite every edge into the forwarder to target its destination,
        // substituting the forwarder's params with the edge's arguments.
        let mut rewrote = false;
        for pi in 0..function.blocks.len() {
            if pi == di {
                continue;
            }
            let pred = &mut function.blocks[pi];
            let Some(term) = pred.terminator_mut() else {
                continue;
            };
            for li in 0..term.labels.len() {
                if term.labels[li] != d_label {
                    continue;
                }
                let incoming = term.br_args[li].clone();
                let new_args: Vec<Value> = forward_args
                    .iter()
                    .map(|arg| match arg.as_temp() {
                        Some(id) => {
                            let at = param_ids.iter().position(|&p| p == id).unwrap();
                            incoming[at].clone()
                        }
                        None => arg.clone(),
                    })
                    .collect();
                term.labels[li] = target.clone();
                term.br_args[li] = new_args;
                rewrote = true;
            }
        }
        changed |= rewrote;
        // The forwarder becomes unreachable and is swept by the next round.
    }
    changed
}
