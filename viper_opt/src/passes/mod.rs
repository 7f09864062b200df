//! Transformation passes
//!
//! Every pass preserves SSA, dominance and program semantics, and reports its
//! preserved analyses accurately. Failure inside a pass is a bug: passes use
//! assertions, never recoverable errors.

pub mod check_opt;
pub mod constfold;
pub mod dce;
pub mod dse;
pub mod early_cse;
pub mod gvn;
pub mod indvars;
pub mod inline;
pub mod late_cleanup;
pub mod licm;
pub mod loop_simplify;
pub mod loop_unroll;
pub mod mem2reg;
pub mod peephole;
pub mod simplify_cfg;

pub use check_opt::CheckOpt;
pub use constfold::ConstFold;
pub use dce::Dce;
pub use dse::Dse;
pub use early_cse::EarlyCse;
pub use gvn::Gvn;
pub use indvars::IndVarSimplify;
pub use inline::{Inline, InlineConfig};
pub use late_cleanup::LateCleanup;
pub use licm::Licm;
pub use loop_simplify::LoopSimplify;
pub use loop_unroll::{LoopUnroll, LoopUnrollConfig};
pub use mem2reg::Mem2Reg;
pub use peephole::Peephole;
pub use simplify_cfg::SimplifyCfg;
