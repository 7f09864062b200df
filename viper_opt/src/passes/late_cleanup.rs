//! Final cleanup of transformation debris
//!
//! Runs DCE, SimplifyCFG and ConstFold to a fixed point. Canonical pipelines
//! end with this pass so the debris left by unrolling, inlining and the loop
//! passes (dead compares, straight-line chains, constant branches) is swept
//! before the module leaves the optimizer.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::passes::constfold::fold_constants;
use crate::passes::dce::run_dce;
use crate::passes::simplify_cfg::simplify_function;
use crate::registry::FunctionPass;
use viper_ir::{Function, Module};

#[derive(Default)]
pub struct LateCleanup;

impl FunctionPass for LateCleanup {
    fn id(&self) -> &str {
        "late-cleanup"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let changed = cleanup_to_fixpoint(&mut module.functions[func]);
        if !changed {
            return PreservedAnalyses::all();
        }
        PreservedAnalyses::none().preserve_all_modules()
    }
}

pub(crate) fn cleanup_to_fixpoint(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut round = false;
        round |= run_dce(function);
        round |= simplify_function(function);
        round |= fold_constants(function);
        if !round {
            break;
        }
        changed = true;
    }
    changed
}
