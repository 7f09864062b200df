//! Pass manager and pipeline executor
//!
//! The manager owns the pass and analysis registries plus the named
//! pipelines. Execution walks the pipeline in order: instantiate the pass,
//! run it (function passes once per function), invalidate analyses from the
//! preservation summary, and optionally verify the module between passes.
//! Unknown pass ids are skipped. Pipelines are re-entrant: running one twice
//! on the same module is valid.

use crate::ids;
use crate::manager::{AnalysisCounts, AnalysisManager, AnalysisRegistry};
use crate::passes;
use crate::registry::{PassFactory, PassRegistry};
use hashbrown::HashMap;
use std::time::{Duration, Instant};
use viper_analysis::{
    build_cfg, compute_dominator_tree, compute_liveness, compute_loop_info,
    compute_memory_ssa, compute_post_dominator_tree, BasicAA,
};
use viper_ir::Module;

/// Block/instruction totals of a module, captured around each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IRSize {
    pub blocks: usize,
    pub instructions: usize,
}

impl IRSize {
    fn of(module: &Module) -> Self {
        let mut size = IRSize::default();
        for function in &module.functions {
            size.blocks += function.blocks.len();
            for block in &function.blocks {
                size.instructions += block.instructions.len();
            }
        }
        size
    }
}

/// Per-pass execution metrics handed to the instrumentation hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassMetrics {
    pub before: IRSize,
    pub after: IRSize,
    pub analyses_computed: AnalysisCounts,
    pub duration: Duration,
}

type MetricsHook = Box<dyn Fn(&str, &PassMetrics)>;

/// Register the built-in function analyses under their canonical ids.
pub fn register_default_analyses(registry: &mut AnalysisRegistry) {
    registry.register_function_analysis(ids::CFG, |module: &Module, func| {
        build_cfg(&module.functions[func])
    });
    registry.register_function_analysis(ids::DOMINATORS, |module: &Module, func| {
        let cfg = build_cfg(&module.functions[func]);
        compute_dominator_tree(&cfg)
    });
    registry.register_function_analysis(ids::POST_DOMINATORS, |module: &Module, func| {
        let cfg = build_cfg(&module.functions[func]);
        compute_post_dominator_tree(&cfg)
    });
    registry.register_function_analysis(ids::LOOP_INFO, |module: &Module, func| {
        let function = &module.functions[func];
        let cfg = build_cfg(function);
        let dom = compute_dominator_tree(&cfg);
        compute_loop_info(function, &cfg, &dom)
    });
    registry.register_function_analysis(ids::LIVENESS, |module: &Module, func| {
        let function = &module.functions[func];
        let cfg = build_cfg(function);
        compute_liveness(function, &cfg)
    });
    registry.register_function_analysis(ids::BASIC_AA, |module: &Module, func| {
        BasicAA::compute(module, &module.functions[func])
    });
    registry.register_function_analysis(ids::MEMORY_SSA, |module: &Module, func| {
        let function = &module.functions[func];
        let cfg = build_cfg(function);
        let aa = BasicAA::compute(module, function);
        compute_memory_ssa(function, &cfg, &aa)
    });
}

/// Register every built-in transform under its canonical id.
pub fn register_default_passes(registry: &mut PassRegistry) {
    registry.register_function_pass("simplify-cfg", || Box::new(passes::SimplifyCfg));
    registry.register_function_pass("mem2reg", || Box::new(passes::Mem2Reg));
    registry.register_function_pass("constfold", || Box::new(passes::ConstFold));
    registry.register_function_pass("peephole", || Box::new(passes::Peephole));
    registry.register_function_pass("dce", || Box::new(passes::Dce));
    registry.register_function_pass("early-cse", || Box::new(passes::EarlyCse));
    registry.register_function_pass("gvn", || Box::new(passes::Gvn));
    registry.register_function_pass("dse", || Box::new(passes::Dse));
    registry.register_function_pass("licm", || Box::new(passes::Licm));
    registry.register_function_pass("loop-simplify", || Box::new(passes::LoopSimplify));
    registry.register_function_pass("indvars", || Box::new(passes::IndVarSimplify));
    registry.register_function_pass("loop-unroll", || Box::new(passes::LoopUnroll::default()));
    registry.register_function_pass("check-opt", || Box::new(passes::CheckOpt));
    registry.register_function_pass("late-cleanup", || Box::new(passes::LateCleanup));
    registry.register_module_pass("inline", || Box::new(passes::Inline::default()));
}

/// Owns registries and named pipelines; entry point of the optimizer.
pub struct PassManager {
    passes: PassRegistry,
    analyses: AnalysisRegistry,
    pipelines: HashMap<String, Vec<String>>,
    verify_between_passes: bool,
    metrics_hook: Option<MetricsHook>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Build a manager with all default analyses, passes and the canonical
    /// `O0`/`O1`/`O2` pipelines registered.
    pub fn new() -> Self {
        let mut passes = PassRegistry::new();
        register_default_passes(&mut passes);
        let mut analyses = AnalysisRegistry::new();
        register_default_analyses(&mut analyses);

        let mut pm = PassManager {
            passes,
            analyses,
            pipelines: HashMap::new(),
            verify_between_passes: cfg!(debug_assertions),
            metrics_hook: None,
        };

        pm.register_pipeline("O0", &[]);
        pm.register_pipeline(
            "O1",
            &["simplify-cfg", "mem2reg", "constfold", "peephole", "dce", "early-cse"],
        );
        pm.register_pipeline(
            "O2",
            &[
                "simplify-cfg",
                "mem2reg",
                "constfold",
                "peephole",
                "dce",
                "early-cse",
                "gvn",
                "loop-simplify",
                "licm",
                "indvars",
                "loop-unroll",
                "check-opt",
                "dse",
                "inline",
                "early-cse",
                "dce",
                "late-cleanup",
            ],
        );
        pm
    }

    pub fn passes(&self) -> &PassRegistry {
        &self.passes
    }

    pub fn passes_mut(&mut self) -> &mut PassRegistry {
        &mut self.passes
    }

    pub fn analyses(&self) -> &AnalysisRegistry {
        &self.analyses
    }

    pub fn register_pipeline(&mut self, id: &str, pipeline: &[&str]) {
        self.pipelines
            .insert(id.to_string(), pipeline.iter().map(|s| s.to_string()).collect());
    }

    pub fn get_pipeline(&self, id: &str) -> Option<&[String]> {
        self.pipelines.get(id).map(|p| p.as_slice())
    }

    /// Enable or disable verification between passes (defaults to on in
    /// debug builds).
    pub fn set_verify_between_passes(&mut self, enable: bool) {
        self.verify_between_passes = enable;
    }

    /// Install a hook receiving per-pass metrics.
    pub fn set_metrics_hook(&mut self, hook: impl Fn(&str, &PassMetrics) + 'static) {
        self.metrics_hook = Some(Box::new(hook));
    }

    /// Run an ad-hoc sequence of pass ids.
    pub fn run(&self, module: &mut Module, pipeline: &[&str]) {
        let ids: Vec<String> = pipeline.iter().map(|s| s.to_string()).collect();
        self.run_ids(module, &ids);
    }

    /// Run a registered pipeline; returns false when the id is unknown.
    pub fn run_pipeline(&self, module: &mut Module, pipeline_id: &str) -> bool {
        let Some(pipeline) = self.pipelines.get(pipeline_id) else {
            return false;
        };
        let pipeline = pipeline.clone();
        self.run_ids(module, &pipeline);
        true
    }

    fn run_ids(&self, module: &mut Module, pipeline: &[String]) {
        let mut am = AnalysisManager::new(&self.analyses);

        for pass_id in pipeline {
            let Some(factory) = self.passes.lookup(pass_id) else {
                log::warn!("skipping unknown pass '{pass_id}'");
                continue;
            };

            let before = IRSize::of(module);
            let counts_before = am.counts();
            let started = Instant::now();

            match factory {
                PassFactory::Module(make) => {
                    let mut pass = make();
                    let preserved = pass.run(module, &mut am);
                    am.invalidate_after_module_pass(&preserved);
                }
                PassFactory::Function(make) => {
                    for func in 0..module.functions.len() {
                        let mut pass = make();
                        let preserved = pass.run(module, func, &mut am);
                        am.invalidate_after_function_pass(&preserved, func);
                    }
                }
            }

            let metrics = PassMetrics {
                before,
                after: IRSize::of(module),
                analyses_computed: AnalysisCounts {
                    module_computations: am.counts().module_computations
                        - counts_before.module_computations,
                    function_computations: am.counts().function_computations
                        - counts_before.function_computations,
                },
                duration: started.elapsed(),
            };
            log::debug!(
                "pass '{pass_id}': {}b/{}i -> {}b/{}i in {:?}",
                metrics.before.blocks,
                metrics.before.instructions,
                metrics.after.blocks,
                metrics.after.instructions,
                metrics.duration
            );
            if let Some(hook) = &self.metrics_hook {
                hook(pass_id, &metrics);
            }

            if self.verify_between_passes {
                if let Err(error) = viper_verify::verify_module(module) {
                    panic!("IL verification failed after pass '{pass_id}': {error}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use viper_ir::build::IRBuilder;
    use viper_ir::{Opcode, Type, Value};

    fn sample_module() -> Module {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let p = b.alloca(8);
        b.store(Type::I64, p.clone(), Value::const_int(40));
        let v = b.load(Type::I64, p);
        let out = b.binary(Opcode::Add, Type::I64, v, Value::const_int(2));
        b.ret(Some(out));
        module
    }

    #[test]
    fn unknown_pipeline_is_reported() {
        let pm = PassManager::new();
        let mut module = sample_module();
        assert!(!pm.run_pipeline(&mut module, "O9"));
        assert!(pm.run_pipeline(&mut module, "O0"));
    }

    #[test]
    fn unknown_pass_ids_are_skipped() {
        let pm = PassManager::new();
        let mut module = sample_module();
        let before = module.clone();
        pm.run(&mut module, &["no-such-pass"]);
        assert_eq!(module, before);
    }

    #[test]
    fn o1_collapses_memory_roundtrip_to_constant() {
        let pm = PassManager::new();
        let mut module = sample_module();
        assert!(pm.run_pipeline(&mut module, "O1"));

        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 1);
        let term = f.blocks[0].terminator().unwrap();
        assert_eq!(term.op, Opcode::Ret);
        assert_eq!(term.operands[0], Value::const_int(42));
    }

    #[test]
    fn pipelines_are_reentrant() {
        let pm = PassManager::new();
        let mut module = sample_module();
        assert!(pm.run_pipeline(&mut module, "O2"));
        let once = module.clone();
        assert!(pm.run_pipeline(&mut module, "O2"));
        assert_eq!(module, once);
    }

    #[test]
    fn metrics_hook_observes_each_pass() {
        let mut pm = PassManager::new();
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        pm.set_metrics_hook(move |id, metrics| {
            assert!(metrics.after.instructions <= metrics.before.instructions);
            sink.borrow_mut().push(id.to_string());
        });

        let mut module = sample_module();
        pm.run(&mut module, &["dce", "constfold"]);
        assert_eq!(*seen.borrow(), vec!["dce".to_string(), "constfold".to_string()]);
    }
}
