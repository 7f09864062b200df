//! Loop canonicalisation
//!
//! Ensures each natural loop has a dedicated preheader (a block whose sole
//! job is to branch to the header) and merges multiple trivially equivalent
//! latches into one forwarding block. SSA is preserved by cloning the header
//! parameters with fresh ids and threading them through the new blocks'
//! branch-argument lists.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use viper_analysis::{Loop, LoopInfo};
use viper_ir::util::{make_unique_label, next_temp_id};
use viper_ir::{BasicBlock, Function, Instr, Module, Opcode, Type, Value};

#[derive(Default)]
pub struct LoopSimplify;

impl FunctionPass for LoopSimplify {
    fn id(&self) -> &str {
        "loop-simplify"
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
        let function = &mut module.functions[func];

        let mut changed = false;
        for lp in &loops {
            changed |= ensure_preheader(function, lp);
            changed |= merge_trivial_latches(function, lp);
        }

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("loop-simplify: @{} canonicalised {} loop(s)", function.name, loops.len());
        PreservedAnalyses::none().preserve_all_modules()
    }
}

/// Edges entering the header from outside the loop: (pred block, label slot).
fn outside_edges(function: &Function, lp: &Loop) -> Vec<(usize, usize)> {
    let mut edges = Vec::new();
    for (bi, block) in function.blocks.iter().enumerate() {
        if lp.contains(&block.label) {
            continue;
        }
        let Some(term) = block.terminator() else {
            continue;
        };
        for (li, label) in term.labels.iter().enumerate() {
            if *label == lp.header {
                edges.push((bi, li));
            }
        }
    }
    edges
}

/// Clone the header parameters with fresh ids into a forwarding block that
/// branches unconditionally to the header.
fn make_forwarding_block(function: &mut Function, header: usize, label: String) -> BasicBlock {
    let mut block = BasicBlock::new(label);
    let mut id = next_temp_id(function);
    let header_params = function.blocks[header].params.clone();

    block.params.reserve(header_params.len());
    for param in &header_params {
        let mut clone = param.clone();
        clone.id = id;
        function.set_value_name(id, clone.name.clone());
        id += 1;
        block.params.push(clone);
    }

    let mut branch = Instr::new(Opcode::Br, Type::Void);
    branch.labels.push(function.blocks[header].label.clone());
    branch
        .br_args
        .push(block.params.iter().map(|p| Value::temp(p.id)).collect());
    block.instructions.push(branch);
    block.terminated = true;
    block
}

/// Insert `<header>.preheader` when the header has multiple external
/// predecessors or its single external predecessor is not a dedicated
/// unconditional branch.
pub(crate) fn ensure_preheader(function: &mut Function, lp: &Loop) -> bool {
    let Some(header) = function.block_index(&lp.header) else {
        return false;
    };
    let edges = outside_edges(function, lp);
    if edges.is_empty() {
        return false;
    }

    if edges.len() == 1 {
        let (pred, _) = edges[0];
        let term = function.blocks[pred].terminator();
        let dedicated = term
            .map(|t| t.op == Opcode::Br && t.labels.len() == 1 && t.labels[0] == lp.header)
            .unwrap_or(false);
        if dedicated {
            return false;
        }
    }

    let label = make_unique_label(function, &format!("{}.preheader", lp.header));
    let preheader = make_forwarding_block(function, header, label.clone());

    for (pred, slot) in edges {
        let Some(term) = function.blocks[pred].terminator_mut() else {
            continue;
        };
        term.labels[slot] = label.clone();
    }

    function.blocks.push(preheader);
    true
}

fn values_equal(lhs: &[Value], rhs: &[Value]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(a, b)| a == b)
}

/// Merge multiple latches into `<header>.latch` when every latch is a single
/// unconditional branch with identical argument vectors.
pub(crate) fn merge_trivial_latches(function: &mut Function, lp: &Loop) -> bool {
    if lp.latches.len() <= 1 {
        return false;
    }
    let Some(header) = function.block_index(&lp.header) else {
        return false;
    };

    let mut latch_indices = Vec::new();
    for label in &lp.latches {
        match function.block_index(label) {
            Some(idx) => latch_indices.push(idx),
            None => return false,
        }
    }

    // Every latch must be exactly `br header(args)` with one shared args
    // vector.
    let mut canonical_args: Option<Vec<Value>> = None;
    for &latch in &latch_indices {
        let block = &function.blocks[latch];
        if block.instructions.len() != 1 {
            return false;
        }
        let Some(term) = block.terminator() else {
            return false;
        };
        if term.op != Opcode::Br || term.labels.len() != 1 || term.labels[0] != lp.header {
            return false;
        }
        let args = term.br_args.first().cloned().unwrap_or_default();
        match &canonical_args {
            None => canonical_args = Some(args),
            Some(existing) => {
                if !values_equal(existing, &args) {
                    return false;
                }
            }
        }
    }
    let canonical_args = canonical_args.unwrap_or_default();

    let label = make_unique_label(function, &format!("{}.latch", lp.header));
    let new_latch = make_forwarding_block(function, header, label.clone());

    for &latch in &latch_indices {
        let Some(term) = function.blocks[latch].terminator_mut() else {
            continue;
        };
        term.labels[0] = label.clone();
        if !term.br_args.is_empty() {
            term.br_args[0] = canonical_args.clone();
        }
    }

    function.blocks.push(new_latch);
    true
}
