//! Programmatic IR construction
//!
//! The builder owns a mutable borrow of the module and addresses functions
//! and blocks by dense index, so references stay valid while blocks are
//! appended. Temp ids are allocated monotonically per function and never
//! reused.

use crate::{BasicBlock, CallAttrs, Function, Instr, Module, Opcode, Param, Type, Value};
use viper_common::SourceLoc;

/// Incremental builder for IL modules.
pub struct IRBuilder<'m> {
    module: &'m mut Module,
    cur_func: Option<usize>,
    cur_block: Option<usize>,
    next_temp: u32,
}

impl<'m> IRBuilder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self { module, cur_func: None, cur_block: None, next_temp: 0 }
    }

    /// Begin a new function; parameters receive ids `0..n`.
    pub fn start_function(
        &mut self,
        name: impl Into<String>,
        ret_type: Type,
        params: &[(&str, Type)],
    ) -> usize {
        let mut function = Function::new(name, ret_type);
        for (i, (pname, pty)) in params.iter().enumerate() {
            function.params.push(Param::new(*pname, *pty, i as u32));
            function.set_value_name(i as u32, *pname);
        }
        self.next_temp = params.len() as u32;
        self.cur_block = None;
        let idx = self.module.add_function(function);
        self.cur_func = Some(idx);
        idx
    }

    fn func_mut(&mut self) -> &mut Function {
        let idx = self.cur_func.expect("no function started");
        &mut self.module.functions[idx]
    }

    pub fn func(&self) -> &Function {
        let idx = self.cur_func.expect("no function started");
        &self.module.functions[idx]
    }

    /// Reserve a fresh temp id in the current function.
    pub fn reserve_temp_id(&mut self) -> u32 {
        let id = self.next_temp;
        self.next_temp += 1;
        let f = self.func_mut();
        if f.value_names.len() <= id as usize {
            f.value_names.resize(id as usize + 1, String::new());
        }
        id
    }

    /// Append a parameterless block to the current function.
    pub fn add_block(&mut self, label: impl Into<String>) -> usize {
        self.create_block(label, &[])
    }

    /// Append a block with typed parameters; each receives a fresh temp id.
    pub fn create_block(&mut self, label: impl Into<String>, params: &[(&str, Type)]) -> usize {
        let mut block = BasicBlock::new(label);
        for (pname, pty) in params {
            let id = self.reserve_temp_id();
            block.params.push(Param::new(*pname, *pty, id));
            self.func_mut().set_value_name(id, *pname);
        }
        let f = self.func_mut();
        f.blocks.push(block);
        f.blocks.len() - 1
    }

    pub fn set_insert_point(&mut self, block: usize) {
        assert!(block < self.func().blocks.len(), "insert point out of range");
        self.cur_block = Some(block);
    }

    /// SSA value of block parameter `index` of `block`.
    pub fn block_param(&self, block: usize, index: usize) -> Value {
        Value::temp(self.func().blocks[block].params[index].id)
    }

    pub fn block_label(&self, block: usize) -> String {
        self.func().blocks[block].label.clone()
    }

    /// Append a pre-built instruction at the insert point.
    pub fn emit(&mut self, instr: Instr) {
        let terminator = instr.is_terminator();
        let block = self.cur_block.expect("no insert point set");
        let f = self.func_mut();
        f.blocks[block].instructions.push(instr);
        if terminator {
            f.blocks[block].terminated = true;
        }
    }

    /// Emit a binary operation and return its result value.
    pub fn binary(&mut self, op: Opcode, ty: Type, lhs: Value, rhs: Value) -> Value {
        let result = self.reserve_temp_id();
        let mut instr = Instr::new(op, ty);
        instr.result = Some(result);
        instr.operands = vec![lhs, rhs];
        self.emit(instr);
        Value::temp(result)
    }

    /// Emit a unary operation and return its result value.
    pub fn unary(&mut self, op: Opcode, ty: Type, operand: Value) -> Value {
        let result = self.reserve_temp_id();
        let mut instr = Instr::new(op, ty);
        instr.result = Some(result);
        instr.operands = vec![operand];
        self.emit(instr);
        Value::temp(result)
    }

    /// Emit a check opcode with explicit operands.
    pub fn check(&mut self, op: Opcode, ty: Type, operands: Vec<Value>) -> Value {
        assert!(op.is_check());
        let result = self.reserve_temp_id();
        let mut instr = Instr::new(op, ty);
        instr.result = Some(result);
        instr.operands = operands;
        self.emit(instr);
        Value::temp(result)
    }

    /// Stack allocation of `size` bytes; returns the pointer temp.
    pub fn alloca(&mut self, size: i64) -> Value {
        let result = self.reserve_temp_id();
        let mut instr = Instr::new(Opcode::Alloca, Type::Ptr);
        instr.result = Some(result);
        instr.operands = vec![Value::const_int(size)];
        self.emit(instr);
        Value::temp(result)
    }

    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        let result = self.reserve_temp_id();
        let mut instr = Instr::new(Opcode::Load, ty);
        instr.result = Some(result);
        instr.operands = vec![ptr];
        self.emit(instr);
        Value::temp(result)
    }

    pub fn store(&mut self, ty: Type, ptr: Value, value: Value) {
        let mut instr = Instr::new(Opcode::Store, ty);
        instr.operands = vec![ptr, value];
        self.emit(instr);
    }

    pub fn gep(&mut self, base: Value, offset: Value) -> Value {
        let result = self.reserve_temp_id();
        let mut instr = Instr::new(Opcode::Gep, Type::Ptr);
        instr.result = Some(result);
        instr.operands = vec![base, offset];
        self.emit(instr);
        Value::temp(result)
    }

    /// Direct call; returns the result temp when `ret_type` is non-void.
    pub fn call(
        &mut self,
        callee: impl Into<String>,
        ret_type: Type,
        args: Vec<Value>,
        attrs: CallAttrs,
    ) -> Option<Value> {
        let mut instr = Instr::new(Opcode::Call, ret_type);
        instr.callee = Some(callee.into());
        instr.operands = args;
        instr.call_attrs = attrs;
        let result = if ret_type.is_void() {
            None
        } else {
            let id = self.reserve_temp_id();
            instr.result = Some(id);
            Some(Value::temp(id))
        };
        self.emit(instr);
        result
    }

    pub fn br(&mut self, target: impl Into<String>, args: Vec<Value>) {
        let mut instr = Instr::new(Opcode::Br, Type::Void);
        instr.labels = vec![target.into()];
        instr.br_args = vec![args];
        self.emit(instr);
    }

    pub fn cbr(
        &mut self,
        cond: Value,
        true_target: impl Into<String>,
        true_args: Vec<Value>,
        false_target: impl Into<String>,
        false_args: Vec<Value>,
    ) {
        let mut instr = Instr::new(Opcode::CBr, Type::Void);
        instr.operands = vec![cond];
        instr.labels = vec![true_target.into(), false_target.into()];
        instr.br_args = vec![true_args, false_args];
        self.emit(instr);
    }

    /// Emit a `switch.i32` with the packed operand/label/args layout.
    pub fn switch_i32(
        &mut self,
        scrutinee: Value,
        default_target: impl Into<String>,
        default_args: Vec<Value>,
        cases: Vec<(i64, String, Vec<Value>)>,
    ) {
        let mut instr = Instr::new(Opcode::SwitchI32, Type::Void);
        instr.operands.push(scrutinee);
        instr.labels.push(default_target.into());
        instr.br_args.push(default_args);
        for (value, label, args) in cases {
            instr.operands.push(Value::const_int(value));
            instr.labels.push(label);
            instr.br_args.push(args);
        }
        self.emit(instr);
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.ret_at(value, SourceLoc::unknown());
    }

    pub fn ret_at(&mut self, value: Option<Value>, loc: SourceLoc) {
        let mut instr = Instr::new(Opcode::Ret, Type::Void);
        if let Some(v) = value {
            instr.operands.push(v);
        }
        instr.loc = loc;
        self.emit(instr);
    }

    pub fn trap(&mut self) {
        self.emit(Instr::new(Opcode::Trap, Type::Void));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_diamond_with_block_params() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        let then_bb = b.add_block("then");
        let else_bb = b.add_block("else");
        let merge = b.create_block("merge", &[("acc", Type::I64)]);

        b.set_insert_point(entry);
        let x = b.binary(Opcode::Add, Type::I64, Value::const_int(1), Value::const_int(2));
        let cond = b.binary(Opcode::SCmpGt, Type::I1, x.clone(), Value::const_int(0));
        b.cbr(cond, "then", vec![], "else", vec![]);

        b.set_insert_point(then_bb);
        b.br("merge", vec![x.clone()]);
        b.set_insert_point(else_bb);
        b.br("merge", vec![Value::const_int(0)]);

        b.set_insert_point(merge);
        let acc = b.block_param(merge, 0);
        b.ret(Some(acc));

        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 4);
        assert!(f.blocks.iter().all(|blk| blk.terminated));
        assert_eq!(f.blocks[3].params.len(), 1);
        // Temp ids are unique and dense.
        assert_eq!(f.blocks[3].params[0].id, 0);
        assert_eq!(f.blocks[0].instructions[0].result, Some(1));
        assert_eq!(f.blocks[0].instructions[1].result, Some(2));
    }
}
