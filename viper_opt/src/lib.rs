//! The Viper optimization pipeline
//!
//! Takes verified IL and produces semantically equivalent, more efficient IL.
//! Passes are registered by string id, run in pipeline order by the executor,
//! and report which analyses they preserved; the analysis manager recomputes
//! the rest lazily. The defining correctness property is differential: every
//! pass preserves the VM-observable result of the program.

pub mod ids;
pub mod manager;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod value_key;

pub use manager::{AnalysisCounts, AnalysisManager, AnalysisRegistry, FuncId, PreservedAnalyses};
pub use pipeline::{IRSize, PassManager, PassMetrics};
pub use registry::{FunctionPass, ModulePass, PassRegistry};
pub use value_key::{is_commutative_cse, is_safe_cse_opcode, make_value_key, ValueKey};
