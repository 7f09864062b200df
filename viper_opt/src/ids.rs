//! Canonical spellings of the built-in analysis identifiers
//!
//! Analyses are cached and invalidated by string key. Using these constants
//! instead of raw literals turns a typo into a compile error and keeps the
//! full set of registered analyses visible in one place.

/// Control-flow graph analysis.
pub const CFG: &str = "cfg";

/// Dominator-tree analysis.
pub const DOMINATORS: &str = "dominators";

/// Post-dominator-tree analysis.
pub const POST_DOMINATORS: &str = "post-dominators";

/// Natural-loop analysis.
pub const LOOP_INFO: &str = "loop-info";

/// Liveness analysis.
pub const LIVENESS: &str = "liveness";

/// Basic alias analysis.
pub const BASIC_AA: &str = "basic-aa";

/// Memory SSA analysis.
pub const MEMORY_SSA: &str = "memory-ssa";
