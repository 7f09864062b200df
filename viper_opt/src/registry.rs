//! Pass registration infrastructure
//!
//! Passes are registered by unique string id as factories producing fresh
//! instances; pipelines then refer to passes purely by id. Module passes see
//! the whole module; function passes are run once per function by the
//! executor, addressed by dense function index so alias analysis can still
//! consult module context.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use hashbrown::HashMap;
use std::rc::Rc;
use viper_ir::{Function, Module};

/// A transformation over a whole module.
pub trait ModulePass {
    /// Unique identifier for this pass.
    fn id(&self) -> &str;

    /// Execute the transformation and report preserved analyses.
    fn run(&mut self, module: &mut Module, am: &mut AnalysisManager) -> PreservedAnalyses;
}

/// A transformation over a single function, identified by index into the
/// module.
pub trait FunctionPass {
    /// Unique identifier for this pass.
    fn id(&self) -> &str;

    /// Execute the transformation and report preserved analyses.
    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses;
}

/// Factory for one registered pass.
pub enum PassFactory {
    Module(Box<dyn Fn() -> Box<dyn ModulePass>>),
    Function(Box<dyn Fn() -> Box<dyn FunctionPass>>),
}

/// Registry mapping pass ids to factories.
#[derive(Default)]
pub struct PassRegistry {
    registry: HashMap<String, PassFactory>,
}

struct LambdaModulePass {
    id: String,
    callback: Rc<dyn Fn(&mut Module, &mut AnalysisManager) -> PreservedAnalyses>,
}

impl ModulePass for LambdaModulePass {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, module: &mut Module, am: &mut AnalysisManager) -> PreservedAnalyses {
        (self.callback)(module, am)
    }
}

struct LambdaFunctionPass {
    id: String,
    callback: Rc<dyn Fn(&mut Module, FuncId, &mut AnalysisManager) -> PreservedAnalyses>,
}

impl FunctionPass for LambdaFunctionPass {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        (self.callback)(module, func, am)
    }
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module pass via an instance factory.
    pub fn register_module_pass(
        &mut self,
        id: &str,
        factory: impl Fn() -> Box<dyn ModulePass> + 'static,
    ) {
        self.registry
            .insert(id.to_string(), PassFactory::Module(Box::new(factory)));
    }

    /// Register a function pass via an instance factory.
    pub fn register_function_pass(
        &mut self,
        id: &str,
        factory: impl Fn() -> Box<dyn FunctionPass> + 'static,
    ) {
        self.registry
            .insert(id.to_string(), PassFactory::Function(Box::new(factory)));
    }

    /// Register a module pass implemented by a callback with analysis access.
    pub fn register_module_callback(
        &mut self,
        id: &str,
        callback: impl Fn(&mut Module, &mut AnalysisManager) -> PreservedAnalyses + 'static,
    ) {
        let callback: Rc<dyn Fn(&mut Module, &mut AnalysisManager) -> PreservedAnalyses> =
            Rc::new(callback);
        let pass_id = id.to_string();
        self.register_module_pass(id, move || {
            Box::new(LambdaModulePass { id: pass_id.clone(), callback: callback.clone() })
        });
    }

    /// Register a function pass implemented by a callback with analysis
    /// access.
    pub fn register_function_callback(
        &mut self,
        id: &str,
        callback: impl Fn(&mut Module, FuncId, &mut AnalysisManager) -> PreservedAnalyses + 'static,
    ) {
        let callback: Rc<dyn Fn(&mut Module, FuncId, &mut AnalysisManager) -> PreservedAnalyses> =
            Rc::new(callback);
        let pass_id = id.to_string();
        self.register_function_pass(id, move || {
            Box::new(LambdaFunctionPass { id: pass_id.clone(), callback: callback.clone() })
        });
    }

    /// Register a plain function-transforming closure; it is assumed to
    /// preserve nothing.
    pub fn register_function_fn(&mut self, id: &str, f: impl Fn(&mut Function) + 'static) {
        self.register_function_callback(id, move |module, func, _| {
            f(&mut module.functions[func]);
            PreservedAnalyses::none()
        });
    }

    /// Register a plain module-transforming closure; it is assumed to
    /// preserve nothing.
    pub fn register_module_fn(&mut self, id: &str, f: impl Fn(&mut Module) + 'static) {
        self.register_module_callback(id, move |module, _| {
            f(module);
            PreservedAnalyses::none()
        });
    }

    /// Look up a registered pass; `None` when the id is unknown.
    pub fn lookup(&self, id: &str) -> Option<&PassFactory> {
        self.registry.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::AnalysisRegistry;
    use viper_ir::Type;

    #[test]
    fn callbacks_wrap_into_passes() {
        let mut registry = PassRegistry::new();
        registry.register_function_fn("rename", |f| f.name = "renamed".into());

        let mut module = Module::new();
        module.add_function(Function::new("original", Type::Void));

        let analyses = AnalysisRegistry::new();
        let mut am = AnalysisManager::new(&analyses);

        match registry.lookup("rename") {
            Some(PassFactory::Function(factory)) => {
                let mut pass = factory();
                assert_eq!(pass.id(), "rename");
                let preserved = pass.run(&mut module, 0, &mut am);
                assert!(!preserved.preserves_all_function_analyses());
            }
            _ => panic!("expected function pass"),
        }
        assert_eq!(module.functions[0].name, "renamed");
        assert!(registry.lookup("missing").is_none());
    }
}
