//! Trivial dead-code elimination
//!
//! Removes instructions whose results are unused and whose execution is
//! unobservable: no side effects, no memory effects, and no trapping
//! behaviour. Trapping instructions always survive, since removing one would
//! change the program's VM-observable trap status.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use hashbrown::HashMap;
use viper_ir::{Function, MemoryEffects, Module};

#[derive(Default)]
pub struct Dce;

impl FunctionPass for Dce {
    fn id(&self) -> &str {
        "dce"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let changed = run_dce(&mut module.functions[func]);
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

/// Iterate removal to a fixed point within the function.
pub(crate) fn run_dce(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut use_counts: HashMap<u32, usize> = HashMap::new();
        for block in &function.blocks {
            for instr in &block.instructions {
                for operand in &instr.operands {
                    if let Some(id) = operand.as_temp() {
                        *use_counts.entry(id).or_default() += 1;
                    }
                }
                for args in &instr.br_args {
                    for arg in args {
                        if let Some(id) = arg.as_temp() {
                            *use_counts.entry(id).or_default() += 1;
                        }
                    }
                }
            }
        }

        let mut removed = 0usize;
        for block in &mut function.blocks {
            block.instructions.retain(|instr| {
                let Some(result) = instr.result else {
                    return true;
                };
                let info = instr.op.info();
                let removable = !info.is_terminator
                    && !info.has_side_effects
                    && !info.can_trap
                    && info.memory == MemoryEffects::None
                    && use_counts.get(&result).copied().unwrap_or(0) == 0;
                if removable {
                    removed += 1;
                }
                !removable
            });
        }

        if removed == 0 {
            break;
        }
        log::debug!("dce: @{} removed {removed} instruction(s)", function.name);
        changed = true;
    }
    changed
}
