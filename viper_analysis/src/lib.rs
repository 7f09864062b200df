//! Analyses computed over the Viper IL
//!
//! Every analysis owns its derived data and references IR nodes only through
//! dense indices (`BlockId` positions into `Function::blocks`, temp ids).
//! Results are therefore valid exactly until the IR is next modified; the
//! analysis manager in `viper_opt` recomputes them on demand based on each
//! pass's preservation summary.

pub mod alias;
pub mod bitset;
pub mod cfg;
pub mod dom;
pub mod liveness;
pub mod loops;
pub mod memory_ssa;
pub mod signatures;

pub use alias::{AliasResult, BasicAA, ModRefResult};
pub use bitset::BitSet;
pub use cfg::{build_cfg, BlockId, CFGInfo};
pub use dom::{compute_dominator_tree, compute_post_dominator_tree, dominance_frontier, DomTree,
              PostDomTree};
pub use liveness::{compute_liveness, LivenessInfo};
pub use loops::{compute_loop_info, Loop, LoopExit, LoopInfo};
pub use memory_ssa::{compute_memory_ssa, MemAccessKind, MemoryAccess, MemorySSA};
pub use signatures::{default_signatures, RuntimeSignatures, Signature, StaticSignatures};
