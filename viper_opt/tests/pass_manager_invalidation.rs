//! Analysis caching across pass execution
//!
//! SimplifyCFG reshapes the graph, so a cached CFG must be recomputed after
//! the pass reports non-preservation — and must be served from cache when a
//! pass preserves everything.

use viper_analysis::CFGInfo;
use viper_opt::passes::SimplifyCfg;
use viper_opt::registry::FunctionPass;
use viper_opt::{ids, AnalysisManager, AnalysisRegistry, PassManager};
use viper_ir::build::IRBuilder;
use viper_ir::{Module, Opcode, Type, Value};

fn module_with_foldable_branch() -> Module {
    let mut module = Module::new();
    let mut b = IRBuilder::new(&mut module);
    b.start_function("f", Type::I64, &[]);
    let entry = b.add_block("entry");
    b.add_block("then");
    b.add_block("else");
    b.set_insert_point(entry);
    b.cbr(Value::const_bool(true), "then", vec![], "else", vec![]);
    b.set_insert_point(1);
    b.ret(Some(Value::const_int(1)));
    b.set_insert_point(2);
    b.ret(Some(Value::const_int(2)));
    module
}

#[test]
fn simplify_cfg_invalidates_cached_cfg() {
    let mut module = module_with_foldable_branch();
    let mut analyses = AnalysisRegistry::new();
    viper_opt::pipeline::register_default_analyses(&mut analyses);
    let mut am = AnalysisManager::new(&analyses);

    let before = am.function_result::<CFGInfo>(ids::CFG, &module, 0);
    assert_eq!(before.rpo().len(), 3);
    assert_eq!(am.counts().function_computations, 1);

    let preserved = SimplifyCfg.run(&mut module, 0, &mut am);
    assert!(!preserved.is_function_preserved(ids::CFG));
    am.invalidate_after_function_pass(&preserved, 0);

    // The cache recomputes from the simplified graph.
    let after = am.function_result::<CFGInfo>(ids::CFG, &module, 0);
    assert_eq!(after.rpo().len(), 1);
    assert_eq!(am.counts().function_computations, 2);

    // A second run changes nothing and preserves everything, so the cache is
    // reused as-is.
    let preserved = SimplifyCfg.run(&mut module, 0, &mut am);
    assert!(preserved.preserves_all_function_analyses());
    am.invalidate_after_function_pass(&preserved, 0);
    let _ = am.function_result::<CFGInfo>(ids::CFG, &module, 0);
    assert_eq!(am.counts().function_computations, 2);
}

#[test]
fn o1_then_o2_equals_o2_structurally_on_simple_input() {
    let pm = PassManager::new();

    let mut chained = module_with_foldable_branch();
    assert!(pm.run_pipeline(&mut chained, "O1"));
    assert!(pm.run_pipeline(&mut chained, "O2"));

    let mut direct = module_with_foldable_branch();
    assert!(pm.run_pipeline(&mut direct, "O2"));

    assert_eq!(chained, direct);
}

#[test]
fn custom_passes_compose_with_builtins() {
    let mut pm = PassManager::new();
    // A project-specific cleanup registered through the closure convenience.
    pm.passes_mut().register_function_fn("strip-names", |f| {
        f.value_names.iter_mut().for_each(|n| n.clear());
    });

    let mut module = module_with_foldable_branch();
    pm.run(&mut module, &["simplify-cfg", "strip-names"]);

    let f = &module.functions[0];
    assert_eq!(f.blocks.len(), 1);
    assert!(f.value_names.iter().all(|n| n.is_empty()));
}

#[test]
fn check_opt_preserves_graph_analyses() {
    let mut module = Module::new();
    let mut b = IRBuilder::new(&mut module);
    b.start_function("f", Type::I64, &[("idx", Type::I64)]);
    let entry = b.add_block("entry");
    let then = b.add_block("then");
    b.set_insert_point(entry);
    let c1 = b.check(
        Opcode::IdxChk,
        Type::I32,
        vec![Value::temp(0), Value::const_int(0), Value::const_int(10)],
    );
    b.br("then", vec![]);
    b.set_insert_point(then);
    let c2 = b.check(
        Opcode::IdxChk,
        Type::I32,
        vec![Value::temp(0), Value::const_int(0), Value::const_int(10)],
    );
    let s = b.binary(Opcode::Add, Type::I64, c1, c2);
    b.ret(Some(s));

    let mut analyses = AnalysisRegistry::new();
    viper_opt::pipeline::register_default_analyses(&mut analyses);
    let mut am = AnalysisManager::new(&analyses);

    let _ = am.function_result::<CFGInfo>(ids::CFG, &module, 0);
    let computations = am.counts().function_computations;

    let preserved = viper_opt::passes::CheckOpt.run(&mut module, 0, &mut am);
    am.invalidate_after_function_pass(&preserved, 0);

    // The pass removed an instruction but kept the graph: the cached CFG
    // survives (dominators were computed by the pass itself).
    assert!(preserved.is_function_preserved(ids::CFG));
    let _ = am.function_result::<CFGInfo>(ids::CFG, &module, 0);
    assert_eq!(am.counts().function_computations - computations, 2);
}
