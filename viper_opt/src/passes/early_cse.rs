//! Early common subexpression elimination
//!
//! Value-numbers pure, side-effect-free instructions along dominator-tree
//! paths: the tree is walked in preorder and each child starts from a copy of
//! its parent's expression table, so a block sees exactly the expressions of
//! its dominating ancestors. Memory loads are GVN's job; trapping operations
//! are never touched.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use crate::value_key::{make_value_key, ValueKey};
use hashbrown::HashMap;
use viper_analysis::{BlockId, DomTree};
use viper_ir::util::replace_all_uses;
use viper_ir::{Function, Module, Value};

#[derive(Default)]
pub struct EarlyCse;

impl FunctionPass for EarlyCse {
    fn id(&self) -> &str {
        "early-cse"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let dom = am
            .function_result::<DomTree>(crate::ids::DOMINATORS, module, func)
            .clone();
        let function = &mut module.functions[func];
        if function.blocks.is_empty() {
            return PreservedAnalyses::all();
        }

        let mut changed = false;
        visit_block(function, dom.entry(), &dom, HashMap::new(), &mut changed);

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("early-cse: @{} eliminated redundant expressions", function.name);
        PreservedAnalyses::none().preserve_all_modules()
    }
}

/// Process one block, then recurse into dominator children with a copy of the
/// accumulated table so only dominating facts are visible below.
fn visit_block(
    function: &mut Function,
    block: BlockId,
    dom: &DomTree,
    mut table: HashMap<ValueKey, Value>,
    changed: &mut bool,
) {
    let mut idx = 0;
    while idx < function.blocks[block].instructions.len() {
        let instr = &function.blocks[block].instructions[idx];
        let Some(key) = make_value_key(instr) else {
            idx += 1;
            continue;
        };
        let result = instr.result.expect("CSE candidate without result");

        match table.get(&key) {
            Some(existing) => {
                let existing = existing.clone();
                function.blocks[block].instructions.remove(idx);
                replace_all_uses(function, result, &existing);
                *changed = true;
                // Do not advance: the next instruction shifted into idx.
            }
            None => {
                table.insert(key, Value::temp(result));
                idx += 1;
            }
        }
    }

    for &child in dom.children_of(block) {
        visit_block(function, child, dom, table.clone(), changed);
    }
}
