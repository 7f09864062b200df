//! BasicAA: conservative alias analysis over SSA pointers
//!
//! Flow-insensitive reasoning about allocation sites: distinct allocas never
//! alias, `noalias` parameters never alias each other, locals never alias
//! globals, and constant-offset GEPs into the same base are disambiguated by
//! their access ranges. Everything else is MayAlias.

use crate::signatures::{default_signatures, RuntimeSignatures, Signature};
use hashbrown::{HashMap, HashSet};
use viper_ir::{Function, Instr, Module, Opcode, Type, Value};

/// Relationship between two pointer-like values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// Memory-effect summary of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModRefResult {
    NoModRef,
    Ref,
    Mod,
    ModRef,
}

#[derive(Debug, Clone, Copy, Default)]
struct CallEffect {
    pure_fn: bool,
    readonly: bool,
}

/// Alias analysis state for one function, with optional module context for
/// callee attribute lookup.
pub struct BasicAA {
    allocas: HashSet<u32>,
    noalias_params: HashSet<u32>,
    /// Constant-offset GEPs: result temp -> (base temp, byte offset).
    geps: HashMap<u32, (u32, i64)>,
    /// Effects of callees defined in the module (authoritative).
    defined_callees: HashMap<String, CallEffect>,
    /// Effects declared on module externs (merged with the runtime registry).
    extern_callees: HashMap<String, CallEffect>,
    signatures: &'static (dyn RuntimeSignatures + Sync),
}

impl BasicAA {
    /// Build analysis state for `function` inside `module`, using the
    /// production runtime registry.
    pub fn compute(module: &Module, function: &Function) -> Self {
        Self::with_signatures(Some(module), function, default_signatures())
    }

    /// Build analysis state with an explicit runtime registry (tests inject a
    /// mock here).
    pub fn with_signatures(
        module: Option<&Module>,
        function: &Function,
        signatures: &'static (dyn RuntimeSignatures + Sync),
    ) -> Self {
        let mut aa = BasicAA {
            allocas: HashSet::new(),
            noalias_params: HashSet::new(),
            geps: HashMap::new(),
            defined_callees: HashMap::new(),
            extern_callees: HashMap::new(),
            signatures,
        };

        for param in &function.params {
            if param.is_noalias() {
                aa.noalias_params.insert(param.id);
            }
        }
        for block in &function.blocks {
            for instr in &block.instructions {
                match instr.op {
                    Opcode::Alloca => {
                        if let Some(result) = instr.result {
                            aa.allocas.insert(result);
                        }
                    }
                    Opcode::Gep => {
                        if let (Some(result), Some(base), Some(offset)) = (
                            instr.result,
                            instr.operands.first().and_then(Value::as_temp),
                            instr.operands.get(1).and_then(Value::as_const_int),
                        ) {
                            aa.geps.insert(result, (base, offset));
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(module) = module {
            for f in &module.functions {
                aa.defined_callees.insert(
                    f.name.clone(),
                    CallEffect { pure_fn: f.attrs.pure_fn, readonly: f.attrs.readonly },
                );
            }
            for e in &module.externs {
                aa.extern_callees.insert(
                    e.name.clone(),
                    CallEffect { pure_fn: e.attrs.pure_fn, readonly: e.attrs.readonly },
                );
            }
        }

        aa
    }

    /// Byte size of an access of primitive type; `None` for opaque types.
    pub fn type_size_bytes(ty: Type) -> Option<u32> {
        match ty {
            Type::I1 => Some(1),
            Type::I32 => Some(4),
            Type::I64 | Type::F64 | Type::Ptr => Some(8),
            Type::Void | Type::Str => None,
        }
    }

    pub fn is_alloca(&self, id: u32) -> bool {
        self.allocas.contains(&id)
    }

    fn is_noalias_param(&self, id: u32) -> bool {
        self.noalias_params.contains(&id)
    }

    /// Chase constant-offset GEPs back to a root temp and accumulated offset.
    fn resolve(&self, id: u32) -> (u32, i64) {
        let mut root = id;
        let mut offset = 0i64;
        // Bounded walk; GEP chains in SSA form cannot cycle, the bound is a
        // guard against malformed input.
        for _ in 0..64 {
            match self.geps.get(&root) {
                Some(&(base, delta)) => {
                    offset = offset.wrapping_add(delta);
                    root = base;
                }
                None => break,
            }
        }
        (root, offset)
    }

    /// Alias query with optional per-access byte sizes refining the GEP rule.
    pub fn alias(
        &self,
        lhs: &Value,
        rhs: &Value,
        lhs_size: Option<u32>,
        rhs_size: Option<u32>,
    ) -> AliasResult {
        if lhs == rhs {
            return AliasResult::MustAlias;
        }

        match (lhs, rhs) {
            (Value::Temp(a), Value::Temp(b)) => {
                let (root_a, off_a) = self.resolve(*a);
                let (root_b, off_b) = self.resolve(*b);

                if root_a != root_b {
                    if self.is_alloca(root_a) && self.is_alloca(root_b) {
                        return AliasResult::NoAlias;
                    }
                    if self.is_noalias_param(root_a) && self.is_noalias_param(root_b) {
                        return AliasResult::NoAlias;
                    }
                    return AliasResult::MayAlias;
                }

                // Same base object: compare constant access ranges.
                if off_a == off_b && lhs_size == rhs_size {
                    return AliasResult::MustAlias;
                }
                if let (Some(sa), Some(sb)) = (lhs_size, rhs_size) {
                    let end_a = off_a.wrapping_add(sa as i64);
                    let end_b = off_b.wrapping_add(sb as i64);
                    if end_a <= off_b || end_b <= off_a {
                        return AliasResult::NoAlias;
                    }
                }
                AliasResult::MayAlias
            }
            (Value::Temp(t), Value::GlobalAddr(_)) | (Value::GlobalAddr(_), Value::Temp(t)) => {
                let (root, _) = self.resolve(*t);
                if self.is_alloca(root) {
                    AliasResult::NoAlias
                } else {
                    AliasResult::MayAlias
                }
            }
            _ => AliasResult::MayAlias,
        }
    }

    fn callee_effect(&self, name: &str) -> CallEffect {
        // A module definition is authoritative; the runtime registry is a
        // fallback for callees the module does not define.
        if let Some(effect) = self.defined_callees.get(name) {
            return *effect;
        }
        let mut effect = self.extern_callees.get(name).copied().unwrap_or_default();
        if let Some(Signature { pure_fn, readonly }) = self.signatures.lookup(name) {
            effect.pure_fn |= pure_fn;
            effect.readonly |= readonly;
        }
        effect
    }

    /// Classify the memory behaviour of an instruction. Calls combine their
    /// own attributes with callee knowledge; everything else is conservative.
    pub fn mod_ref(&self, instr: &Instr) -> ModRefResult {
        if !instr.op.is_call() {
            return ModRefResult::ModRef;
        }

        let mut pure_fn = instr.call_attrs.pure_fn;
        let mut readonly = instr.call_attrs.readonly;
        if let Some(callee) = &instr.callee {
            let effect = self.callee_effect(callee);
            pure_fn |= effect.pure_fn;
            readonly |= effect.readonly;
        }

        if pure_fn {
            ModRefResult::NoModRef
        } else if readonly {
            ModRefResult::Ref
        } else {
            ModRefResult::ModRef
        }
    }
}
