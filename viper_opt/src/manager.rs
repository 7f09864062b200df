//! Analysis caching and preservation-driven invalidation
//!
//! Analyses register compute functions keyed by string id; the manager
//! computes them on first request, caches the result, and evicts entries
//! after each pass according to the pass's `PreservedAnalyses` summary.
//! Function-scoped results are keyed by `(analysis id, function index)`.

use hashbrown::{HashMap, HashSet};
use std::any::Any;
use viper_ir::Module;

/// Dense index of a function inside `Module::functions`.
pub type FuncId = usize;

/// Which analyses remain valid after a pass execution.
///
/// Three states per scope: everything preserved, an explicit set preserved,
/// or nothing preserved (the default).
#[derive(Debug, Clone, Default)]
pub struct PreservedAnalyses {
    preserve_all_modules: bool,
    preserve_all_functions: bool,
    module_analyses: HashSet<String>,
    function_analyses: HashSet<String>,
}

impl PreservedAnalyses {
    /// Every module and function analysis remains valid.
    pub fn all() -> Self {
        PreservedAnalyses {
            preserve_all_modules: true,
            preserve_all_functions: true,
            ..Default::default()
        }
    }

    /// Nothing remains valid.
    pub fn none() -> Self {
        PreservedAnalyses::default()
    }

    /// Mark one module-scoped analysis as preserved.
    pub fn preserve_module(mut self, id: &str) -> Self {
        self.module_analyses.insert(id.to_string());
        self
    }

    /// Mark one function-scoped analysis as preserved.
    pub fn preserve_function(mut self, id: &str) -> Self {
        self.function_analyses.insert(id.to_string());
        self
    }

    pub fn preserve_all_modules(mut self) -> Self {
        self.preserve_all_modules = true;
        self
    }

    pub fn preserve_all_functions(mut self) -> Self {
        self.preserve_all_functions = true;
        self
    }

    pub fn preserves_all_module_analyses(&self) -> bool {
        self.preserve_all_modules
    }

    pub fn preserves_all_function_analyses(&self) -> bool {
        self.preserve_all_functions
    }

    pub fn is_module_preserved(&self, id: &str) -> bool {
        self.preserve_all_modules || self.module_analyses.contains(id)
    }

    pub fn is_function_preserved(&self, id: &str) -> bool {
        self.preserve_all_functions || self.function_analyses.contains(id)
    }

    pub fn has_module_preservations(&self) -> bool {
        !self.module_analyses.is_empty()
    }

    pub fn has_function_preservations(&self) -> bool {
        !self.function_analyses.is_empty()
    }
}

type ModuleFactory = Box<dyn Fn(&Module) -> Box<dyn Any>>;
type FunctionFactory = Box<dyn Fn(&Module, FuncId) -> Box<dyn Any>>;

/// Registered analysis compute functions.
#[derive(Default)]
pub struct AnalysisRegistry {
    module_analyses: HashMap<String, ModuleFactory>,
    function_analyses: HashMap<String, FunctionFactory>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module_analysis<T: Any>(
        &mut self,
        id: &str,
        compute: impl Fn(&Module) -> T + 'static,
    ) {
        self.module_analyses.insert(
            id.to_string(),
            Box::new(move |module| Box::new(compute(module))),
        );
    }

    pub fn register_function_analysis<T: Any>(
        &mut self,
        id: &str,
        compute: impl Fn(&Module, FuncId) -> T + 'static,
    ) {
        self.function_analyses.insert(
            id.to_string(),
            Box::new(move |module, func| Box::new(compute(module, func))),
        );
    }

    pub fn has_module_analysis(&self, id: &str) -> bool {
        self.module_analyses.contains_key(id)
    }

    pub fn has_function_analysis(&self, id: &str) -> bool {
        self.function_analyses.contains_key(id)
    }
}

/// Number of analyses computed so far, for diagnostics and caching tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisCounts {
    pub module_computations: usize,
    pub function_computations: usize,
}

/// Lazily computes and caches analysis results during pipeline execution.
pub struct AnalysisManager<'r> {
    registry: &'r AnalysisRegistry,
    module_cache: HashMap<String, Box<dyn Any>>,
    function_cache: HashMap<String, HashMap<FuncId, Box<dyn Any>>>,
    counts: AnalysisCounts,
}

impl<'r> AnalysisManager<'r> {
    pub fn new(registry: &'r AnalysisRegistry) -> Self {
        AnalysisManager {
            registry,
            module_cache: HashMap::new(),
            function_cache: HashMap::new(),
            counts: AnalysisCounts::default(),
        }
    }

    /// Retrieve or compute a module-scoped analysis result.
    ///
    /// Panics on an unknown id or a result type mismatch; both indicate a
    /// wiring bug, not a recoverable condition.
    pub fn module_result<T: Any>(&mut self, id: &str, module: &Module) -> &T {
        let registry = self.registry;
        let factory = registry
            .module_analyses
            .get(id)
            .unwrap_or_else(|| panic!("unknown module analysis '{id}'"));
        if !self.module_cache.contains_key(id) {
            let result = factory(module);
            self.module_cache.insert(id.to_string(), result);
            self.counts.module_computations += 1;
        }
        self.module_cache[id]
            .downcast_ref::<T>()
            .expect("analysis result type mismatch")
    }

    /// Retrieve or compute a function-scoped analysis result.
    pub fn function_result<T: Any>(&mut self, id: &str, module: &Module, func: FuncId) -> &T {
        let registry = self.registry;
        let factory = registry
            .function_analyses
            .get(id)
            .unwrap_or_else(|| panic!("unknown function analysis '{id}'"));
        let per_fn = self.function_cache.entry(id.to_string()).or_default();
        if !per_fn.contains_key(&func) {
            let result = factory(module, func);
            per_fn.insert(func, result);
            self.counts.function_computations += 1;
        }
        per_fn[&func]
            .downcast_ref::<T>()
            .expect("analysis result type mismatch")
    }

    /// Evict module-scoped results not preserved by a module pass.
    pub fn invalidate_after_module_pass(&mut self, preserved: &PreservedAnalyses) {
        if preserved.preserves_all_module_analyses() {
            self.invalidate_functions_after_module_pass(preserved);
            return;
        }
        if !preserved.has_module_preservations() {
            self.module_cache.clear();
        } else {
            self.module_cache
                .retain(|id, _| preserved.is_module_preserved(id));
        }
        self.invalidate_functions_after_module_pass(preserved);
    }

    /// A module pass may have touched any function, so function-scoped caches
    /// are evicted for every function.
    fn invalidate_functions_after_module_pass(&mut self, preserved: &PreservedAnalyses) {
        if preserved.preserves_all_function_analyses() {
            return;
        }
        if !preserved.has_function_preservations() {
            self.function_cache.clear();
        } else {
            self.function_cache
                .retain(|id, _| preserved.is_function_preserved(id));
        }
    }

    /// Evict function-scoped results for `func` not preserved by a function
    /// pass.
    pub fn invalidate_after_function_pass(&mut self, preserved: &PreservedAnalyses, func: FuncId) {
        if preserved.preserves_all_function_analyses() {
            return;
        }
        if !preserved.has_function_preservations() {
            for per_fn in self.function_cache.values_mut() {
                per_fn.remove(&func);
            }
        } else {
            for (id, per_fn) in self.function_cache.iter_mut() {
                if !preserved.is_function_preserved(id) {
                    per_fn.remove(&func);
                }
            }
        }
        self.function_cache.retain(|_, per_fn| !per_fn.is_empty());
    }

    pub fn counts(&self) -> AnalysisCounts {
        self.counts
    }
}
