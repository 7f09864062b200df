//! Induction variable simplification and strength reduction
//!
//! Recognises counted loops with a single latch updating an integer
//! induction variable by a constant, then rewrites `base + i * stride`
//! address computations in the header into a loop-carried temporary:
//! initialised in the preheader, incremented by `stride * step` in the
//! latch, threaded through a new block parameter on the header.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use viper_analysis::{Loop, LoopInfo};
use viper_ir::usedef::UseDefInfo;
use viper_ir::util::{count_temp_uses, next_temp_id};
use viper_ir::{Function, Instr, Module, Opcode, Param, Value};

#[derive(Default)]
pub struct IndVarSimplify;

/// A simple induction variable: which header parameter it is, its constant
/// step, and the latch parameter carrying it around the backedge.
struct IndVar {
    header_param_index: usize,
    step: i64,
    latch_param_id: u32,
}

/// A matched `base + i * stride` expression in the header.
struct AddrExpr {
    addr_id: u32,
    stride: i64,
    base: Value,
    mul_id: u32,
}

impl FunctionPass for IndVarSimplify {
    fn id(&self) -> &str {
        "indvars"
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        am: &mut AnalysisManager,
    ) -> PreservedAnalyses {
        let loops = am
            .function_result::<LoopInfo>(crate::ids::LOOP_INFO, module, func)
            .loops()
            .to_vec();
        let function = &mut module.functions[func];

        let mut changed = false;
        for lp in &loops {
            changed |= strength_reduce(function, lp);
        }

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("indvars: @{} reduced address computation", function.name);
        PreservedAnalyses::none().preserve_all_modules()
    }
}

fn label_index(term: &Instr, target: &str) -> Option<usize> {
    term.labels.iter().position(|l| l == target)
}

fn find_instr_by_result(block: &viper_ir::BasicBlock, temp: u32) -> Option<&Instr> {
    block
        .instructions
        .iter()
        .find(|i| i.result == Some(temp))
}

/// The unique external predecessor of the loop header.
fn find_preheader(function: &Function, lp: &Loop) -> Option<usize> {
    let mut preheader = None;
    for (bi, block) in function.blocks.iter().enumerate() {
        if lp.contains(&block.label) {
            continue;
        }
        let Some(term) = block.terminator() else {
            continue;
        };
        if !term.labels.iter().any(|l| *l == lp.header) {
            continue;
        }
        if preheader.is_some() && preheader != Some(bi) {
            return None;
        }
        preheader = Some(bi);
    }
    preheader
}

/// Detect `i' = i +/- C` on the backedge, where `i` is a latch parameter fed
/// by a header parameter.
fn detect_ind_var(function: &Function, header: usize, latch: usize) -> Option<IndVar> {
    let latch_block = &function.blocks[latch];
    let latch_term = latch_block.terminator()?;
    let header_label = function.blocks[header].label.clone();
    let to_header = label_index(latch_term, &header_label)?;
    let args_to_header = latch_term.br_args.get(to_header)?;
    if args_to_header.len() != function.blocks[header].params.len() {
        return None;
    }

    for arg in args_to_header {
        let Some(arg_id) = arg.as_temp() else {
            continue;
        };
        let Some(update) = find_instr_by_result(latch_block, arg_id) else {
            continue;
        };
        if update.op != Opcode::Add && update.op != Opcode::Sub {
            continue;
        }
        let a = update.operands.first();
        let b = update.operands.get(1);
        let (var, step_const) = match (a, b) {
            (Some(Value::Temp(id)), Some(Value::ConstInt { value, .. })) => (*id, *value),
            (Some(Value::ConstInt { value, .. }), Some(Value::Temp(id)))
                if update.op == Opcode::Add =>
            {
                (*id, *value)
            }
            _ => continue,
        };

        // Only direct use of a latch parameter is handled.
        if !latch_block.params.iter().any(|p| p.id == var) {
            continue;
        }
        let latch_param_id = var;

        // Map the latch parameter back to a header parameter through the
        // header -> latch branch arguments.
        let header_block = &function.blocks[header];
        let header_term = header_block.terminator()?;
        let to_latch = label_index(header_term, &latch_block.label)?;
        let args_to_latch = header_term.br_args.get(to_latch)?;
        if args_to_latch.len() != latch_block.params.len() {
            return None;
        }
        let slot = latch_block.params.iter().position(|p| p.id == latch_param_id)?;
        let from_header = args_to_latch.get(slot)?;
        let from_header_id = from_header.as_temp()?;
        let header_param_index = header_block
            .params
            .iter()
            .position(|p| p.id == from_header_id);
        let Some(header_param_index) = header_param_index else {
            continue;
        };

        let step = if update.op == Opcode::Sub { -step_const } else { step_const };
        return Some(IndVar { header_param_index, step, latch_param_id });
    }

    None
}

/// Find `base + (i * stride)` in the header where the multiply is single-use.
fn find_addr_expr(function: &Function, header: usize, ind_var_id: u32) -> Option<AddrExpr> {
    let block = &function.blocks[header];
    for instr in &block.instructions {
        let Some(result) = instr.result else {
            continue;
        };
        if instr.op != Opcode::Add || instr.operands.len() != 2 {
            continue;
        }
        for (mul_side, base_side) in [(0usize, 1usize), (1, 0)] {
            let Some(mul_temp) = instr.operands[mul_side].as_temp() else {
                continue;
            };
            let Some(mul_instr) = find_instr_by_result(block, mul_temp) else {
                continue;
            };
            if mul_instr.op != Opcode::Mul || mul_instr.operands.len() != 2 {
                continue;
            }
            let m0 = &mul_instr.operands[0];
            let m1 = &mul_instr.operands[1];
            let stride = match (m0.as_temp(), m1.as_temp()) {
                (Some(id), None) if id == ind_var_id => m1.as_const_int(),
                (None, Some(id)) if id == ind_var_id => m0.as_const_int(),
                _ => None,
            };
            let Some(stride) = stride else {
                continue;
            };
            if count_temp_uses(function, mul_temp) != 1 {
                continue;
            }
            return Some(AddrExpr {
                addr_id: result,
                stride,
                base: instr.operands[base_side].clone(),
                mul_id: mul_temp,
            });
        }
    }
    None
}

fn strength_reduce(function: &mut Function, lp: &Loop) -> bool {
    let Some(header) = function.block_index(&lp.header) else {
        return false;
    };
    let Some(preheader) = find_preheader(function, lp) else {
        return false;
    };
    if lp.latches.len() != 1 {
        return false;
    }
    let Some(latch) = function.block_index(&lp.latches[0]) else {
        return false;
    };

    let Some(iv) = detect_ind_var(function, header, latch) else {
        return false;
    };
    let ind_var_id = function.blocks[header].params[iv.header_param_index].id;
    log::trace!(
        "indvars: ^{} iv %{} (latch %{}) step {}",
        lp.header,
        ind_var_id,
        iv.latch_param_id,
        iv.step
    );
    let Some(addr) = find_addr_expr(function, header, ind_var_id) else {
        return false;
    };

    let addr_ty = match find_instr_by_result(&function.blocks[header], addr.addr_id) {
        Some(instr) => instr.ty,
        None => return false,
    };
    let mul_ty = match find_instr_by_result(&function.blocks[header], addr.mul_id) {
        Some(instr) => instr.ty,
        None => return false,
    };

    let header_label = function.blocks[header].label.clone();
    let latch_label = function.blocks[latch].label.clone();

    // The carried value is threaded only through the header -> latch edge,
    // so that edge must be the latch's sole incoming edge. Any other
    // predecessor (or a second edge from the header, or a self-looping
    // header acting as its own latch) would leave the new latch parameter
    // unsupplied.
    let header_edges_to_latch = function.blocks[header]
        .terminator()
        .map_or(0, |t| t.labels.iter().filter(|l| **l == latch_label).count());
    if header_edges_to_latch != 1 {
        return false;
    }
    let only_header_feeds_latch = function.blocks.iter().enumerate().all(|(bi, block)| {
        bi == header
            || block
                .terminator()
                .map_or(true, |t| t.labels.iter().all(|l| *l != latch_label))
    });
    if !only_header_feeds_latch {
        return false;
    }

    // Initial induction value from the preheader's branch into the header;
    // checked before the new parameter is appended.
    let ph_args = {
        let Some(term) = function.blocks[preheader].terminator() else {
            return false;
        };
        let Some(to_header) = label_index(term, &header_label) else {
            return false;
        };
        match term.br_args.get(to_header) {
            Some(args) if args.len() == function.blocks[header].params.len() => args.clone(),
            _ => return false,
        }
    };
    let init_i = ph_args[iv.header_param_index].clone();

    let mut next_id = next_temp_id(function);

    // Loop-carried address parameter on the header.
    let addr_param_id = next_id;
    next_id += 1;
    function.blocks[header]
        .params
        .push(Param::new("addr", addr_ty, addr_param_id));
    function.set_value_name(addr_param_id, "addr");

    // Preheader computes addr0 = base + init_i * stride.
    let mul0_id = next_id;
    next_id += 1;
    let mut mul0 = Instr::new(Opcode::Mul, mul_ty);
    mul0.result = Some(mul0_id);
    mul0.operands = vec![init_i, Value::const_int(addr.stride)];

    let add0_id = next_id;
    next_id += 1;
    let mut add0 = Instr::new(Opcode::Add, addr_ty);
    add0.result = Some(add0_id);
    add0.operands = vec![addr.base.clone(), Value::temp(mul0_id)];

    {
        let pre = &mut function.blocks[preheader];
        let mut insert_at = pre.instructions.len();
        if pre.terminated && insert_at > 0 {
            insert_at -= 1;
        }
        pre.instructions.insert(insert_at, mul0);
        pre.instructions.insert(insert_at + 1, add0);
        let term = pre.terminator_mut().expect("preheader terminator");
        let to_header = label_index(term, &header_label).expect("preheader targets header");
        term.br_args[to_header].push(Value::temp(add0_id));
    }

    // Latch carries the address through a new parameter.
    let latch_addr_id = next_id;
    next_id += 1;
    function.blocks[latch]
        .params
        .push(Param::new("addr.l", addr_ty, latch_addr_id));
    function.set_value_name(latch_addr_id, "addr.l");

    {
        let term = match function.blocks[header].terminator_mut() {
            Some(term) => term,
            None => return false,
        };
        let Some(to_latch) = label_index(term, &latch_label) else {
            return false;
        };
        term.br_args[to_latch].push(Value::temp(addr_param_id));
    }

    // Latch increments by stride * step and feeds the backedge.
    let inc = addr.stride.wrapping_mul(iv.step);
    let add_inc_id = next_id;
    let mut add_inc = Instr::new(Opcode::Add, addr_ty);
    add_inc.result = Some(add_inc_id);
    add_inc.operands = vec![Value::temp(latch_addr_id), Value::const_int(inc)];

    {
        let latch_block = &mut function.blocks[latch];
        let insert_at = latch_block.instructions.len() - 1;
        latch_block.instructions.insert(insert_at, add_inc);
        let term = latch_block.terminator_mut().expect("latch terminator");
        let to_header = label_index(term, &header_label).expect("latch targets header");
        term.br_args[to_header].push(Value::temp(add_inc_id));
    }

    // Redirect users of the old address computation to the carried parameter
    // and drop the now-dead add/mul.
    let mut use_info = UseDefInfo::new(function);
    use_info.replace_all_uses(function, addr.addr_id, &Value::temp(addr_param_id));

    let header_block = &mut function.blocks[header];
    header_block
        .instructions
        .retain(|i| i.result != Some(addr.addr_id));
    if count_temp_uses(function, addr.mul_id) == 0 {
        function.blocks[header]
            .instructions
            .retain(|i| i.result != Some(addr.mul_id));
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{AnalysisManager, AnalysisRegistry};
    use crate::pipeline::register_default_analyses;
    use viper_ir::build::IRBuilder;
    use viper_ir::Type;
    use viper_verify::verify_module;

    fn run(module: &mut Module) -> bool {
        let mut registry = AnalysisRegistry::new();
        register_default_analyses(&mut registry);
        let mut am = AnalysisManager::new(&registry);
        let preserved = IndVarSimplify.run(module, 0, &mut am);
        !preserved.preserves_all_function_analyses()
    }

    /// `addr = base + i * 8` in the header becomes a loop-carried parameter
    /// initialised in the preheader and bumped by 8 in the latch.
    #[test]
    fn rewrites_header_address_computation() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("base", Type::I64), ("n", Type::I64)]);
        let pre = b.add_block("pre");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let latch = b.create_block("latch", &[("i.l", Type::I64)]);
        let exit = b.add_block("exit");

        b.set_insert_point(pre);
        b.br("header", vec![Value::const_int(0)]);

        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        let mul = b.binary(Opcode::Mul, Type::I64, i.clone(), Value::const_int(8));
        let addr = b.binary(Opcode::Add, Type::I64, Value::temp(0), mul);
        let cmp = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(1));
        // The address flows out through the exit so it has a use.
        b.cbr(cmp, "latch", vec![i.clone()], "exit", vec![]);

        b.set_insert_point(latch);
        let il = b.block_param(latch, 0);
        let i2 = b.binary(Opcode::Add, Type::I64, il, Value::const_int(1));
        b.br("header", vec![i2]);

        b.set_insert_point(exit);
        b.ret(Some(addr.clone()));

        assert!(run(&mut module));
        assert!(verify_module(&module).is_ok());

        let f = &module.functions[0];
        let header_block = f.find_block("header").unwrap();
        // New loop-carried parameter; the mul/add pair is gone from the
        // header.
        assert_eq!(header_block.params.len(), 2);
        assert!(header_block.instructions.iter().all(|i| i.op != Opcode::Mul));
        assert_eq!(header_block.instructions.len(), 2); // cmp + cbr

        // The preheader computes the initial address.
        let pre_block = f.find_block("pre").unwrap();
        assert!(pre_block.instructions.iter().any(|i| i.op == Opcode::Mul));
        let term = pre_block.terminator().unwrap();
        assert_eq!(term.br_args[0].len(), 2);

        // The latch bumps the carried address by stride * step = 8.
        let latch_block = f.find_block("latch").unwrap();
        assert_eq!(latch_block.params.len(), 2);
        let bump = latch_block
            .instructions
            .iter()
            .find(|i| i.op == Opcode::Add && i.operands.get(1) == Some(&Value::const_int(8)))
            .expect("address increment");
        let back = latch_block.terminator().unwrap();
        assert_eq!(back.br_args[0].len(), 2);
        assert_eq!(back.br_args[0][1], Value::temp(bump.result.unwrap()));
    }

    /// A latch fed by two in-loop edges cannot carry the new parameter
    /// through the header edge alone; the loop is left untouched.
    #[test]
    fn skips_latch_with_multiple_predecessors() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("base", Type::I64), ("n", Type::I64)]);
        let pre = b.add_block("pre");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let bypass = b.add_block("bypass");
        let latch = b.create_block("latch", &[("i.l", Type::I64)]);
        let exit = b.add_block("exit");

        b.set_insert_point(pre);
        b.br("header", vec![Value::const_int(0)]);

        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        let mul = b.binary(Opcode::Mul, Type::I64, i.clone(), Value::const_int(8));
        let _addr = b.binary(Opcode::Add, Type::I64, Value::temp(0), mul);
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(1));
        b.cbr(c, "latch", vec![i], "bypass", vec![]);

        b.set_insert_point(bypass);
        b.br("latch", vec![Value::const_int(3)]);

        b.set_insert_point(latch);
        let il = b.block_param(latch, 0);
        let i2 = b.binary(Opcode::Add, Type::I64, il.clone(), Value::const_int(1));
        let c2 = b.binary(Opcode::SCmpLt, Type::I1, il, Value::temp(1));
        b.cbr(c2, "header", vec![i2], "exit", vec![]);

        b.set_insert_point(exit);
        b.ret(Some(Value::const_int(0)));

        assert!(!run(&mut module));
        let f = &module.functions[0];
        assert_eq!(f.find_block("header").unwrap().params.len(), 1);
        assert_eq!(f.find_block("latch").unwrap().params.len(), 1);
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn skips_loops_without_counted_shape() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("n", Type::I64)]);
        let pre = b.add_block("pre");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let exit = b.add_block("exit");
        b.set_insert_point(pre);
        b.br("header", vec![Value::const_int(0)]);
        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        // Update is i * 2, not i + C.
        let i2 = b.binary(Opcode::Mul, Type::I64, i.clone(), Value::const_int(2));
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(0));
        b.cbr(c, "header", vec![i2], "exit", vec![]);
        b.set_insert_point(exit);
        b.ret(Some(i));

        assert!(!run(&mut module));
    }
}
