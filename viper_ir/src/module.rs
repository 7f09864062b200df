//! Modules and functions

use crate::{BasicBlock, Param, Type};
use serde::{Deserialize, Serialize};

/// Function-level attributes used by alias analysis and the inliner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnAttrs {
    /// No memory access and no observable side effects.
    pub pure_fn: bool,
    /// May read memory but never writes it.
    pub readonly: bool,
}

/// Forward declaration of an externally defined function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extern {
    pub name: String,
    pub ret_type: Type,
    pub params: Vec<Type>,
    pub attrs: FnAttrs,
}

/// Module-level data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlobalValue {
    /// A named string constant.
    Str(String),
    /// A zero-initialised byte buffer of the given size.
    Buffer(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub value: GlobalValue,
}

/// An IL function in SSA form.
///
/// The first block is the entry block. Entry takes no block parameters; the
/// function's parameters are directly usable SSA temporaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub ret_type: Type,
    pub params: Vec<Param>,
    pub blocks: Vec<BasicBlock>,
    /// Human-readable names indexed by temp id; empty string when unnamed.
    pub value_names: Vec<String>,
    pub attrs: FnAttrs,
}

impl Function {
    pub fn new(name: impl Into<String>, ret_type: Type) -> Self {
        Self {
            name: name.into(),
            ret_type,
            params: Vec::new(),
            blocks: Vec::new(),
            value_names: Vec::new(),
            attrs: FnAttrs::default(),
        }
    }

    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn find_block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn find_block_mut(&mut self, label: &str) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    pub fn add_block(&mut self, block: BasicBlock) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn remove_block(&mut self, label: &str) -> bool {
        match self.block_index(label) {
            Some(idx) => {
                self.blocks.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Record a human-readable name for a temp id, growing the table.
    pub fn set_value_name(&mut self, id: u32, name: impl Into<String>) {
        let idx = id as usize;
        if self.value_names.len() <= idx {
            self.value_names.resize(idx + 1, String::new());
        }
        self.value_names[idx] = name.into();
    }
}

/// A translation unit: functions plus externs and global data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Function>,
    pub externs: Vec<Extern>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    pub fn remove_function(&mut self, name: &str) -> bool {
        match self.functions.iter().position(|f| f.name == name) {
            Some(idx) => {
                self.functions.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn find_function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn find_extern(&self, name: &str) -> Option<&Extern> {
        self.externs.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::IRBuilder;
    use crate::{Opcode, Type, Value};
    use pretty_assertions::assert_eq;

    #[test]
    fn modules_round_trip_through_json() {
        let mut module = Module::new();
        module.externs.push(Extern {
            name: "rt_print_i64".into(),
            ret_type: Type::Void,
            params: vec![Type::I64],
            attrs: FnAttrs::default(),
        });
        module.globals.push(Global {
            name: "greeting".into(),
            value: GlobalValue::Str("hello".into()),
        });
        {
            let mut b = IRBuilder::new(&mut module);
            b.start_function("main", Type::I64, &[]);
            let entry = b.add_block("entry");
            b.set_insert_point(entry);
            let v = b.binary(Opcode::Add, Type::I64, Value::const_int(1), Value::const_int(2));
            b.ret(Some(v));
        }

        let text = serde_json::to_string(&module).expect("serialize");
        let back: Module = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(module, back);
    }

    #[test]
    fn function_lookup_and_removal() {
        let mut module = Module::new();
        module.add_function(Function::new("a", Type::Void));
        module.add_function(Function::new("b", Type::I64));

        assert!(module.find_function("a").is_some());
        assert!(module.remove_function("a"));
        assert!(!module.remove_function("a"));
        assert!(module.find_function("a").is_none());
        assert_eq!(module.functions.len(), 1);
    }
}
