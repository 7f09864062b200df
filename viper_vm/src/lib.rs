//! Reference interpreter for the Viper IL
//!
//! Executes a module directly for testing purposes. Traps are ordinary `Err`
//! values rather than process aborts, so the differential harness can compare
//! trap status and return values across optimization pipelines in-process.
//! Arithmetic is delegated to `viper_ir::eval`, the same kernel the constant
//! folder uses, so VM and optimizer semantics cannot drift apart.

use std::collections::HashMap;
use thiserror::Error;
use viper_ir::eval::{eval_binary, eval_check, eval_unary};
use viper_ir::{
    Function, GlobalValue, Instr, Module, Opcode, TrapKind, Type, Value,
};

/// Why execution stopped without producing a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A trapping instruction fired; this is defined program behaviour.
    #[error("trap: {0}")]
    Trap(#[from] TrapKind),
    /// The module is malformed or uses a feature the VM does not model;
    /// reaching this in the harness is a test failure, not program behaviour.
    #[error("vm error: {0}")]
    Malformed(String),
}

fn malformed(message: impl Into<String>) -> VmError {
    VmError::Malformed(message.into())
}

impl From<VmError> for viper_common::ViperError {
    fn from(error: VmError) -> Self {
        viper_common::ViperError::vm_error(error.to_string())
    }
}

/// Runtime value held in SSA temporaries.
#[derive(Debug, Clone, PartialEq)]
enum RtValue {
    Int(i64),
    Float(f64),
    Ptr(u64),
    Str(String),
    Unit,
}

const CALL_DEPTH_LIMIT: usize = 64;
const FUEL: u64 = 50_000_000;

/// Execute `main` of the module and return its `i64` result.
pub fn run_module(module: &Module) -> Result<i64, VmError> {
    let main = module
        .find_function("main")
        .ok_or_else(|| malformed("no main function"))?;

    let mut vm = Vm::new(module);
    match vm.exec_function(main, Vec::new(), 0)? {
        RtValue::Int(v) => Ok(v),
        other => Err(malformed(format!("main returned non-integer value {other:?}"))),
    }
}

struct Vm<'m> {
    module: &'m Module,
    /// Flat byte arena; address 0 is reserved so null never points at data.
    memory: Vec<u8>,
    globals: HashMap<String, u64>,
    fuel: u64,
}

impl<'m> Vm<'m> {
    fn new(module: &'m Module) -> Self {
        let mut vm = Vm {
            module,
            memory: vec![0u8; 8],
            globals: HashMap::new(),
            fuel: FUEL,
        };
        for global in &module.globals {
            let addr = match &global.value {
                GlobalValue::Str(s) => {
                    let addr = vm.memory.len() as u64;
                    vm.memory.extend_from_slice(s.as_bytes());
                    vm.memory.push(0);
                    addr
                }
                GlobalValue::Buffer(size) => vm.bump(*size as usize),
            };
            vm.globals.insert(global.name.clone(), addr);
        }
        vm
    }

    fn bump(&mut self, size: usize) -> u64 {
        let addr = self.memory.len() as u64;
        self.memory.resize(self.memory.len() + size.max(1), 0);
        addr
    }

    fn burn(&mut self) -> Result<(), VmError> {
        if self.fuel == 0 {
            return Err(malformed("fuel exhausted"));
        }
        self.fuel -= 1;
        Ok(())
    }

    fn exec_function(
        &mut self,
        function: &'m Function,
        args: Vec<RtValue>,
        depth: usize,
    ) -> Result<RtValue, VmError> {
        if depth > CALL_DEPTH_LIMIT {
            return Err(malformed("call depth limit exceeded"));
        }
        if args.len() != function.params.len() {
            return Err(malformed(format!(
                "@{} expects {} argument(s), got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }

        let mut env: HashMap<u32, RtValue> = HashMap::new();
        for (param, arg) in function.params.iter().zip(args) {
            env.insert(param.id, arg);
        }

        let mut block_idx = 0usize;
        'blocks: loop {
            let block = function
                .blocks
                .get(block_idx)
                .ok_or_else(|| malformed("branch into missing block"))?;

            for instr in &block.instructions {
                self.burn()?;

                if instr.is_terminator() {
                    match self.exec_terminator(instr, &env)? {
                        Flow::Jump(target, values) => {
                            let target_block = function
                                .find_block(&target)
                                .ok_or_else(|| malformed(format!("missing block ^{target}")))?;
                            if values.len() != target_block.params.len() {
                                return Err(malformed(format!(
                                    "^{target} argument count mismatch"
                                )));
                            }
                            let ids: Vec<u32> =
                                target_block.params.iter().map(|p| p.id).collect();
                            for (id, value) in ids.into_iter().zip(values) {
                                env.insert(id, value);
                            }
                            block_idx = function
                                .block_index(&target)
                                .ok_or_else(|| malformed("missing block index"))?;
                            continue 'blocks;
                        }
                        Flow::Return(value) => return Ok(value),
                    }
                }

                self.exec_instr(instr, &mut env, depth)?;
            }

            return Err(malformed(format!(
                "block ^{} fell through without terminator",
                block.label
            )));
        }
    }

    fn exec_terminator(
        &mut self,
        instr: &Instr,
        env: &HashMap<u32, RtValue>,
    ) -> Result<Flow, VmError> {
        match instr.op {
            Opcode::Br => {
                let args = self.branch_args(instr, 0, env)?;
                Ok(Flow::Jump(instr.labels[0].clone(), args))
            }
            Opcode::CBr => {
                let cond = self.operand(instr, 0, env)?;
                let taken = match cond {
                    RtValue::Int(v) => v != 0,
                    other => return Err(malformed(format!("cbr on {other:?}"))),
                };
                let idx = if taken { 0 } else { 1 };
                let args = self.branch_args(instr, idx, env)?;
                Ok(Flow::Jump(instr.labels[idx].clone(), args))
            }
            Opcode::SwitchI32 => {
                let scrutinee = match self.operand(instr, 0, env)? {
                    RtValue::Int(v) => v,
                    other => return Err(malformed(format!("switch on {other:?}"))),
                };
                let mut target = 0usize;
                for case in 0..instr.switch_case_count() {
                    if instr.switch_case_value(case).as_const_int() == Some(scrutinee) {
                        target = case + 1;
                        break;
                    }
                }
                let args = self.branch_args(instr, target, env)?;
                Ok(Flow::Jump(instr.labels[target].clone(), args))
            }
            Opcode::Ret => {
                let value = if instr.operands.is_empty() {
                    RtValue::Unit
                } else {
                    self.operand(instr, 0, env)?
                };
                Ok(Flow::Return(value))
            }
            Opcode::Trap => Err(TrapKind::Explicit.into()),
            Opcode::ResumeSame | Opcode::ResumeNext | Opcode::ResumeLabel => Err(malformed(
                "resume terminator outside an exception handler",
            )),
            other => Err(malformed(format!("unexpected terminator {other}"))),
        }
    }

    fn exec_instr(
        &mut self,
        instr: &Instr,
        env: &mut HashMap<u32, RtValue>,
        depth: usize,
    ) -> Result<(), VmError> {
        match instr.op {
            Opcode::Alloca => {
                let size = match self.operand(instr, 0, env)? {
                    RtValue::Int(v) if v >= 0 => v as usize,
                    other => return Err(malformed(format!("alloca size {other:?}"))),
                };
                let addr = self.bump(size);
                self.set_result(instr, RtValue::Ptr(addr), env)?;
            }
            Opcode::Load => {
                let addr = self.pointer_operand(instr, 0, env)?;
                let value = self.read_memory(addr, instr.ty)?;
                self.set_result(instr, value, env)?;
            }
            Opcode::Store => {
                let addr = self.pointer_operand(instr, 0, env)?;
                let value = self.operand(instr, 1, env)?;
                self.write_memory(addr, instr.ty, value)?;
            }
            Opcode::Gep => {
                let base = self.pointer_operand(instr, 0, env)?;
                let offset = match self.operand(instr, 1, env)? {
                    RtValue::Int(v) => v,
                    other => return Err(malformed(format!("gep offset {other:?}"))),
                };
                self.set_result(instr, RtValue::Ptr(base.wrapping_add_signed(offset)), env)?;
            }
            Opcode::AddrOf => {
                let name = match instr.operands.first() {
                    Some(Value::GlobalAddr(name)) => name.clone(),
                    other => return Err(malformed(format!("addr_of operand {other:?}"))),
                };
                let addr = *self
                    .globals
                    .get(&name)
                    .ok_or_else(|| malformed(format!("unknown global @{name}")))?;
                self.set_result(instr, RtValue::Ptr(addr), env)?;
            }
            Opcode::ConstStr => {
                let value = match instr.operands.first() {
                    Some(Value::ConstStr(s)) => RtValue::Str(s.clone()),
                    other => return Err(malformed(format!("const_str operand {other:?}"))),
                };
                self.set_result(instr, value, env)?;
            }
            Opcode::ConstNull => {
                self.set_result(instr, RtValue::Ptr(0), env)?;
            }
            Opcode::Call => {
                let callee = instr
                    .callee
                    .clone()
                    .ok_or_else(|| malformed("call without callee"))?;
                let mut args = Vec::with_capacity(instr.operands.len());
                for i in 0..instr.operands.len() {
                    args.push(self.operand(instr, i, env)?);
                }
                let result = self.dispatch_call(&callee, args, depth)?;
                if instr.result.is_some() {
                    self.set_result(instr, result, env)?;
                }
            }
            Opcode::CallIndirect => {
                return Err(malformed("call_indirect is not modelled by the test VM"));
            }
            op if op.is_check() => {
                let consts = self.const_operands(instr, env)?;
                let outcome = eval_check(op, instr.ty, &consts)
                    .ok_or_else(|| malformed(format!("cannot evaluate {op}")))?;
                let value = outcome.map_err(VmError::Trap)?;
                self.set_result(instr, self.from_const(&value, instr.ty)?, env)?;
            }
            op => {
                // Pure arithmetic, compares and casts route through the shared
                // evaluation kernel.
                let consts = self.const_operands(instr, env)?;
                let outcome = match consts.len() {
                    1 => eval_unary(op, &consts[0]),
                    2 => eval_binary(op, &consts[0], &consts[1]),
                    _ => None,
                }
                .ok_or_else(|| malformed(format!("cannot evaluate {op}")))?;
                let value = outcome.map_err(VmError::Trap)?;
                self.set_result(instr, self.from_const(&value, instr.ty)?, env)?;
            }
        }
        Ok(())
    }

    fn dispatch_call(
        &mut self,
        callee: &str,
        args: Vec<RtValue>,
        depth: usize,
    ) -> Result<RtValue, VmError> {
        if let Some(function) = self.module.find_function(callee) {
            return self.exec_function(function, args, depth + 1);
        }
        // A small subset of the runtime library, enough for tests.
        match (callee, args.as_slice()) {
            ("rt_abs_i64", [RtValue::Int(v)]) => Ok(RtValue::Int(v.wrapping_abs())),
            ("rt_abs_f64", [RtValue::Float(v)]) => Ok(RtValue::Float(v.abs())),
            ("rt_sqrt", [RtValue::Float(v)]) => Ok(RtValue::Float(v.sqrt())),
            ("rt_pow", [RtValue::Float(a), RtValue::Float(b)]) => Ok(RtValue::Float(a.powf(*b))),
            ("rt_floor", [RtValue::Float(v)]) => Ok(RtValue::Float(v.floor())),
            ("rt_ceil", [RtValue::Float(v)]) => Ok(RtValue::Float(v.ceil())),
            ("rt_str_len", [RtValue::Str(s)]) => Ok(RtValue::Int(s.len() as i64)),
            ("rt_str_concat", [RtValue::Str(a), RtValue::Str(b)]) => {
                Ok(RtValue::Str(format!("{a}{b}")))
            }
            ("rt_str_eq", [RtValue::Str(a), RtValue::Str(b)]) => {
                Ok(RtValue::Int((a == b) as i64))
            }
            ("rt_print_str", [RtValue::Str(s)]) => {
                log::debug!("rt_print_str: {s}");
                Ok(RtValue::Unit)
            }
            ("rt_print_i64", [RtValue::Int(v)]) => {
                log::debug!("rt_print_i64: {v}");
                Ok(RtValue::Unit)
            }
            ("rt_print_f64", [RtValue::Float(v)]) => {
                log::debug!("rt_print_f64: {v}");
                Ok(RtValue::Unit)
            }
            // Opaque external used by DSE/alias tests: touches no test-visible
            // state.
            ("external", _) => Ok(RtValue::Unit),
            _ => Err(malformed(format!("unknown callee @{callee}"))),
        }
    }

    fn operand(
        &self,
        instr: &Instr,
        index: usize,
        env: &HashMap<u32, RtValue>,
    ) -> Result<RtValue, VmError> {
        let value = instr
            .operands
            .get(index)
            .ok_or_else(|| malformed(format!("{} missing operand {index}", instr.op)))?;
        self.value(value, env)
    }

    fn value(&self, value: &Value, env: &HashMap<u32, RtValue>) -> Result<RtValue, VmError> {
        match value {
            Value::Temp(id) => env
                .get(id)
                .cloned()
                .ok_or_else(|| malformed(format!("read of unset temp %{id}"))),
            Value::ConstInt { value, .. } => Ok(RtValue::Int(*value)),
            Value::ConstFloat(f) => Ok(RtValue::Float(*f)),
            Value::ConstStr(s) => Ok(RtValue::Str(s.clone())),
            Value::GlobalAddr(name) => self
                .globals
                .get(name)
                .map(|&a| RtValue::Ptr(a))
                .ok_or_else(|| malformed(format!("unknown global @{name}"))),
            Value::NullPtr => Ok(RtValue::Ptr(0)),
        }
    }

    fn branch_args(
        &self,
        instr: &Instr,
        index: usize,
        env: &HashMap<u32, RtValue>,
    ) -> Result<Vec<RtValue>, VmError> {
        let mut out = Vec::new();
        if let Some(args) = instr.br_args.get(index) {
            for arg in args {
                out.push(self.value(arg, env)?);
            }
        }
        Ok(out)
    }

    fn pointer_operand(
        &self,
        instr: &Instr,
        index: usize,
        env: &HashMap<u32, RtValue>,
    ) -> Result<u64, VmError> {
        match self.operand(instr, index, env)? {
            RtValue::Ptr(addr) => Ok(addr),
            other => Err(malformed(format!("expected pointer, found {other:?}"))),
        }
    }

    /// Convert a runtime value to a constant for the shared eval kernel.
    fn to_const(&self, value: &RtValue) -> Result<Value, VmError> {
        match value {
            RtValue::Int(v) => Ok(Value::const_int(*v)),
            RtValue::Float(f) => Ok(Value::const_float(*f)),
            // Pointer arithmetic introduced by strength reduction runs on the
            // integer kernel.
            RtValue::Ptr(a) => Ok(Value::const_int(*a as i64)),
            other => Err(malformed(format!("non-arithmetic value {other:?}"))),
        }
    }

    fn const_operands(
        &self,
        instr: &Instr,
        env: &HashMap<u32, RtValue>,
    ) -> Result<Vec<Value>, VmError> {
        let mut out = Vec::with_capacity(instr.operands.len());
        for i in 0..instr.operands.len() {
            let rt = self.operand(instr, i, env)?;
            out.push(self.to_const(&rt)?);
        }
        Ok(out)
    }

    fn from_const(&self, value: &Value, ty: Type) -> Result<RtValue, VmError> {
        match value {
            Value::ConstInt { value, .. } => {
                if ty == Type::Ptr {
                    Ok(RtValue::Ptr(*value as u64))
                } else {
                    Ok(RtValue::Int(*value))
                }
            }
            Value::ConstFloat(f) => Ok(RtValue::Float(*f)),
            other => Err(malformed(format!("unexpected evaluation result {other:?}"))),
        }
    }

    fn set_result(
        &self,
        instr: &Instr,
        value: RtValue,
        env: &mut HashMap<u32, RtValue>,
    ) -> Result<(), VmError> {
        let result = instr
            .result
            .ok_or_else(|| malformed(format!("{} without result temp", instr.op)))?;
        env.insert(result, value);
        Ok(())
    }

    fn check_range(&self, addr: u64, size: usize) -> Result<usize, VmError> {
        let start = addr as usize;
        if addr == 0 || start.checked_add(size).map_or(true, |end| end > self.memory.len()) {
            return Err(malformed(format!("out-of-bounds access at {addr}")));
        }
        Ok(start)
    }

    fn read_memory(&self, addr: u64, ty: Type) -> Result<RtValue, VmError> {
        match ty {
            Type::I1 => {
                let at = self.check_range(addr, 1)?;
                Ok(RtValue::Int((self.memory[at] != 0) as i64))
            }
            Type::I32 => {
                let at = self.check_range(addr, 4)?;
                let bytes: [u8; 4] = self.memory[at..at + 4].try_into().unwrap();
                Ok(RtValue::Int(i32::from_le_bytes(bytes) as i64))
            }
            Type::I64 => {
                let at = self.check_range(addr, 8)?;
                let bytes: [u8; 8] = self.memory[at..at + 8].try_into().unwrap();
                Ok(RtValue::Int(i64::from_le_bytes(bytes)))
            }
            Type::F64 => {
                let at = self.check_range(addr, 8)?;
                let bytes: [u8; 8] = self.memory[at..at + 8].try_into().unwrap();
                Ok(RtValue::Float(f64::from_le_bytes(bytes)))
            }
            Type::Ptr => {
                let at = self.check_range(addr, 8)?;
                let bytes: [u8; 8] = self.memory[at..at + 8].try_into().unwrap();
                Ok(RtValue::Ptr(u64::from_le_bytes(bytes)))
            }
            Type::Void | Type::Str => Err(malformed(format!("load of type {ty}"))),
        }
    }

    fn write_memory(&mut self, addr: u64, ty: Type, value: RtValue) -> Result<(), VmError> {
        match (ty, value) {
            (Type::I1, RtValue::Int(v)) => {
                let at = self.check_range(addr, 1)?;
                self.memory[at] = (v != 0) as u8;
            }
            (Type::I32, RtValue::Int(v)) => {
                let at = self.check_range(addr, 4)?;
                self.memory[at..at + 4].copy_from_slice(&(v as i32).to_le_bytes());
            }
            (Type::I64, RtValue::Int(v)) => {
                let at = self.check_range(addr, 8)?;
                self.memory[at..at + 8].copy_from_slice(&v.to_le_bytes());
            }
            (Type::F64, RtValue::Float(f)) => {
                let at = self.check_range(addr, 8)?;
                self.memory[at..at + 8].copy_from_slice(&f.to_le_bytes());
            }
            (Type::Ptr, RtValue::Ptr(p)) => {
                let at = self.check_range(addr, 8)?;
                self.memory[at..at + 8].copy_from_slice(&p.to_le_bytes());
            }
            (ty, value) => {
                return Err(malformed(format!("store of {value:?} as {ty}")));
            }
        }
        Ok(())
    }
}

enum Flow {
    Jump(String, Vec<RtValue>),
    Return(RtValue),
}
