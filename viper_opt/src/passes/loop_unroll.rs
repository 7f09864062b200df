//! Full unrolling of small counted loops
//!
//! A loop qualifies when it has a single latch, a single exit edge leaving
//! from the header's conditional branch, an induction variable compared
//! against a constant, a constant initial value, and a constant step. The
//! trip count is found by simulating the exit test. The body is replicated
//! into the preheader once per iteration with fresh temp ids; the final
//! header evaluation is replicated too (its instructions execute on the
//! exiting pass), then the preheader branches straight to the exit with the
//! final values and the loop blocks are deleted.

use crate::manager::{AnalysisManager, FuncId, PreservedAnalyses};
use crate::registry::FunctionPass;
use hashbrown::HashMap;
use viper_analysis::{Loop, LoopInfo};
use viper_ir::util::next_temp_id;
use viper_ir::{Function, Instr, Module, Opcode, Value};

/// Configuration parameters for loop unrolling.
pub struct LoopUnrollConfig {
    /// Maximum trip count for full unrolling.
    pub full_unroll_threshold: u32,
    /// Maximum loop body size (instructions) considered at all.
    pub max_loop_size: usize,
}

impl Default for LoopUnrollConfig {
    fn default() -> Self {
        Self { full_unroll_threshold: 8, max_loop_size: 50 }
    }
}

#[derive(Default)]
pub struct LoopUnroll {
    config: LoopUnrollConfig,
}

impl LoopUnroll {
    pub fn with_config(config: LoopUnrollConfig) -> Self {
        Self { config }
    }
}

/// Shape of a recognised counted loop.
struct CountedLoop {
    iv_param_index: usize,
    trip_count: u32,
}

impl FunctionPass for LoopUnroll {
    fn id(&self) -> &str {
        "loop-unroll"
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
            // Innermost loops only.
            if !lp.children.is_empty() {
                continue;
            }
            changed |= try_full_unroll(function, lp, &self.config);
        }

        if !changed {
            return PreservedAnalyses::all();
        }
        log::debug!("loop-unroll: @{} fully unrolled", function.name);
        PreservedAnalyses::none().preserve_all_modules()
    }
}

fn label_index(term: &Instr, target: &str) -> Option<usize> {
    term.labels.iter().position(|l| l == target)
}

/// The dedicated preheader. Unrolling rewrites the preheader's terminator to
/// jump straight to the exit, which is only sound when the loop is its sole
/// successor.
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
        if preheader.is_some() {
            return None;
        }
        if term.op != Opcode::Br || term.labels.len() != 1 {
            return None;
        }
        preheader = Some(bi);
    }
    preheader
}

fn eval_exit_test(op: Opcode, lhs: i64, rhs: i64) -> Option<bool> {
    Some(match op {
        Opcode::SCmpLt => lhs < rhs,
        Opcode::SCmpLe => lhs <= rhs,
        Opcode::SCmpGt => lhs > rhs,
        Opcode::SCmpGe => lhs >= rhs,
        Opcode::ICmpEq => lhs == rhs,
        Opcode::ICmpNe => lhs != rhs,
        _ => return None,
    })
}

/// Recognise the counted-loop pattern and simulate its trip count.
fn analyze_counted_loop(
    function: &Function,
    lp: &Loop,
    header: usize,
    latch: usize,
    preheader: usize,
    threshold: u32,
) -> Option<CountedLoop> {
    if lp.latches.len() != 1 || lp.exits.len() != 1 {
        return None;
    }

    let header_block = &function.blocks[header];
    let header_term = header_block.terminator()?;
    if header_term.op != Opcode::CBr || header_term.labels.len() != 2 {
        return None;
    }

    let exit_target = &lp.exits[0].to;
    let exit_branch_idx = if header_term.labels[0] == *exit_target {
        0
    } else if header_term.labels[1] == *exit_target {
        1
    } else {
        return None; // exit is not from the header
    };

    let cond_id = header_term.operands.first()?.as_temp()?;
    let cmp = header_block
        .instructions
        .iter()
        .find(|i| i.result == Some(cond_id))?;
    if cmp.operands.len() != 2 {
        return None;
    }
    eval_exit_test(cmp.op, 0, 0)?;

    // One side a header parameter, the other a constant bound.
    let (iv_param_index, bound, iv_is_lhs) = match (
        cmp.operands[0].as_temp(),
        cmp.operands[1].as_const_int(),
        cmp.operands[0].as_const_int(),
        cmp.operands[1].as_temp(),
    ) {
        (Some(id), Some(bound), _, _) => {
            let index = header_block.params.iter().position(|p| p.id == id)?;
            (index, bound, true)
        }
        (_, _, Some(bound), Some(id)) => {
            let index = header_block.params.iter().position(|p| p.id == id)?;
            (index, bound, false)
        }
        _ => return None,
    };

    // Constant initial value from the preheader.
    let ph_term = function.blocks[preheader].terminator()?;
    let to_header = label_index(ph_term, &header_block.label)?;
    let init_args = ph_term.br_args.get(to_header)?;
    let init = init_args.get(iv_param_index)?.as_const_int()?;

    // Constant step from the backedge.
    let latch_block = &function.blocks[latch];
    let latch_term = latch_block.terminator()?;
    let back = label_index(latch_term, &header_block.label)?;
    let latch_args = latch_term.br_args.get(back)?;
    let next_id = latch_args.get(iv_param_index)?.as_temp()?;

    let step_instr = latch_block
        .instructions
        .iter()
        .chain(&header_block.instructions)
        .find(|i| i.result == Some(next_id))?;

    // The step source is the latch parameter that receives the IV (or the
    // header parameter itself in single-block loops).
    let mut iv_id = header_block.params[iv_param_index].id;
    if latch != header {
        let to_latch = label_index(header_term, &latch_block.label)?;
        let args_to_latch = header_term.br_args.get(to_latch)?;
        for (i, arg) in args_to_latch.iter().enumerate() {
            if arg.as_temp() == Some(iv_id) && i < latch_block.params.len() {
                iv_id = latch_block.params[i].id;
                break;
            }
        }
    }

    let step = match step_instr.op {
        Opcode::Add | Opcode::IAddOvf => {
            let a = &step_instr.operands[0];
            let b = &step_instr.operands[1];
            if a.as_temp() == Some(iv_id) {
                b.as_const_int()?
            } else if b.as_temp() == Some(iv_id) {
                a.as_const_int()?
            } else {
                return None;
            }
        }
        Opcode::Sub | Opcode::ISubOvf => {
            let a = &step_instr.operands[0];
            let b = &step_instr.operands[1];
            if a.as_temp() == Some(iv_id) {
                -(b.as_const_int()?)
            } else {
                return None;
            }
        }
        _ => return None,
    };
    if step == 0 {
        return None;
    }

    // Simulate the loop; `loop_while_true` when the false edge exits.
    let loop_while_true = exit_branch_idx == 1;
    let mut iv = init;
    let mut trip_count = None;
    for iter in 0..=threshold {
        let (lhs, rhs) = if iv_is_lhs { (iv, bound) } else { (bound, iv) };
        let cond = eval_exit_test(cmp.op, lhs, rhs)?;
        if cond != loop_while_true {
            trip_count = Some(iter);
            break;
        }
        iv = iv.checked_add(step)?;
    }
    let trip_count = trip_count?;
    if trip_count == 0 {
        return None;
    }

    Some(CountedLoop { iv_param_index, trip_count })
}

fn remap(value: &Value, map: &HashMap<u32, Value>) -> Value {
    match value.as_temp() {
        Some(id) => map.get(&id).cloned().unwrap_or_else(|| value.clone()),
        None => value.clone(),
    }
}

/// Clone one instruction with remapped operands and a fresh result id.
fn clone_instr(
    instr: &Instr,
    map: &mut HashMap<u32, Value>,
    next_id: &mut u32,
) -> Instr {
    let mut cloned = instr.clone();
    for operand in &mut cloned.operands {
        *operand = remap(operand, map);
    }
    if let Some(old) = cloned.result {
        let fresh = *next_id;
        *next_id += 1;
        cloned.result = Some(fresh);
        map.insert(old, Value::temp(fresh));
    }
    cloned
}

fn try_full_unroll(function: &mut Function, lp: &Loop, config: &LoopUnrollConfig) -> bool {
    // Only simple one- or two-block loops.
    if lp.blocks.len() > 2 {
        return false;
    }
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

    let loop_size: usize = lp
        .blocks
        .iter()
        .filter_map(|l| function.find_block(l))
        .map(|b| b.instructions.len())
        .sum();
    if loop_size > config.max_loop_size {
        return false;
    }

    let Some(counted) = analyze_counted_loop(
        function,
        lp,
        header,
        latch,
        preheader,
        config.full_unroll_threshold,
    ) else {
        return false;
    };
    if counted.trip_count > config.full_unroll_threshold {
        return false;
    }

    let header_label = function.blocks[header].label.clone();
    let latch_label = function.blocks[latch].label.clone();
    let exit_label = lp.exits[0].to.clone();
    if function.block_index(&exit_label).is_none() {
        return false;
    }

    let header_term = function.blocks[header].terminator().cloned().unwrap();
    let exit_branch_idx = if header_term.labels[0] == exit_label { 0 } else { 1 };
    let exit_args = header_term
        .br_args
        .get(exit_branch_idx)
        .cloned()
        .unwrap_or_default();

    let header_body: Vec<Instr> = function.blocks[header]
        .instructions
        .iter()
        .take(function.blocks[header].instructions.len() - 1)
        .cloned()
        .collect();
    let latch_body: Vec<Instr> = if latch != header {
        function.blocks[latch]
            .instructions
            .iter()
            .take(function.blocks[latch].instructions.len() - 1)
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    let latch_term = function.blocks[latch].terminator().cloned().unwrap();

    // Initial values for the header parameters.
    let ph_term = function.blocks[preheader].terminator().cloned().unwrap();
    let Some(to_header) = label_index(&ph_term, &header_label) else {
        return false;
    };
    let mut current_values = ph_term.br_args[to_header].clone();
    if current_values.len() != function.blocks[header].params.len() {
        return false;
    }

    let header_params: Vec<u32> = function.blocks[header].params.iter().map(|p| p.id).collect();
    let latch_params: Vec<u32> = function.blocks[latch].params.iter().map(|p| p.id).collect();

    let mut next_id = next_temp_id(function);
    let mut unrolled: Vec<Instr> = Vec::new();
    let mut value_map: HashMap<u32, Value> = HashMap::new();

    for _ in 0..counted.trip_count {
        value_map.clear();
        for (param, value) in header_params.iter().zip(&current_values) {
            value_map.insert(*param, value.clone());
        }

        for instr in &header_body {
            unrolled.push(clone_instr(instr, &mut value_map, &mut next_id));
        }

        if latch != header {
            // Thread the header -> latch branch arguments into the latch
            // parameters; they may reference values computed just above.
            let to_latch = match label_index(&header_term, &latch_label) {
                Some(i) => i,
                None => return false,
            };
            let args: Vec<Value> = header_term.br_args[to_latch]
                .iter()
                .map(|a| remap(a, &value_map))
                .collect();
            for (param, value) in latch_params.iter().zip(args) {
                value_map.insert(*param, value);
            }
            for instr in &latch_body {
                unrolled.push(clone_instr(instr, &mut value_map, &mut next_id));
            }
        }

        // Next iteration's header parameter values from the backedge.
        let back = match label_index(&latch_term, &header_label) {
            Some(i) => i,
            None => return false,
        };
        current_values = latch_term.br_args[back]
            .iter()
            .map(|a| remap(a, &value_map))
            .collect();
    }

    // The exiting header evaluation still runs the header body once.
    value_map.clear();
    for (param, value) in header_params.iter().zip(&current_values) {
        value_map.insert(*param, value.clone());
    }
    for instr in &header_body {
        unrolled.push(clone_instr(instr, &mut value_map, &mut next_id));
    }
    let final_exit_args: Vec<Value> = exit_args.iter().map(|a| remap(a, &value_map)).collect();

    // Splice everything into the preheader and retarget it at the exit.
    {
        let pre = &mut function.blocks[preheader];
        let insert_at = pre.instructions.len() - 1;
        for (offset, instr) in unrolled.into_iter().enumerate() {
            pre.instructions.insert(insert_at + offset, instr);
        }
        let term = pre.terminator_mut().expect("preheader terminator");
        *term = Instr::new(Opcode::Br, viper_ir::Type::Void);
        term.labels = vec![exit_label];
        term.br_args = vec![final_exit_args];
    }

    // Delete the original loop blocks.
    function
        .blocks
        .retain(|b| !lp.blocks.contains(b.label.as_str()));

    log::trace!(
        "loop-unroll: unrolled {} iteration(s) of ^{} (iv param {})",
        counted.trip_count,
        header_label,
        counted.iv_param_index
    );
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
    use viper_vm::run_module;

    fn run(module: &mut Module) -> bool {
        let mut registry = AnalysisRegistry::new();
        register_default_analyses(&mut registry);
        let mut am = AnalysisManager::new(&registry);
        let preserved = LoopUnroll::default().run(module, 0, &mut am);
        !preserved.preserves_all_function_analyses()
    }

    /// Accumulate `0..=bound` in a single-block counted loop.
    fn counted_sum(bound: i64) -> Module {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("main", Type::I64, &[]);
        let pre = b.add_block("pre");
        let header = b.create_block("header", &[("i", Type::I64), ("acc", Type::I64)]);
        let exit = b.create_block("exit", &[("r", Type::I64)]);

        b.set_insert_point(pre);
        b.br("header", vec![Value::const_int(0), Value::const_int(0)]);

        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        let acc = b.block_param(header, 1);
        let acc2 = b.binary(Opcode::Add, Type::I64, acc, i.clone());
        let i2 = b.binary(Opcode::Add, Type::I64, i.clone(), Value::const_int(1));
        // The exit test reads the parameter, the do-while shape the lowering
        // produces for counted loops.
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::const_int(bound));
        b.cbr(c, "header", vec![i2, acc2.clone()], "exit", vec![acc2]);

        b.set_insert_point(exit);
        let r = b.block_param(exit, 0);
        b.ret(Some(r));
        module
    }

    #[test]
    fn fully_unrolls_and_preserves_result() {
        let mut module = counted_sum(4);
        let expected = run_module(&module).unwrap();

        assert!(run(&mut module));
        assert!(verify_module(&module).is_ok());

        let f = &module.functions[0];
        assert!(f.find_block("header").is_none());
        assert_eq!(run_module(&module).unwrap(), expected);
    }

    #[test]
    fn respects_trip_count_threshold() {
        let mut module = counted_sum(100);
        assert!(!run(&mut module));
        assert!(module.functions[0].find_block("header").is_some());
    }

    #[test]
    fn unrolls_two_block_loop_with_separate_latch() {
        let mut module = Module::new();
        {
            let mut b = IRBuilder::new(&mut module);
            b.start_function("main", Type::I64, &[]);
            let pre = b.add_block("pre");
            let header = b.create_block("header", &[("i", Type::I64), ("acc", Type::I64)]);
            let latch = b.create_block("latch", &[("i.l", Type::I64), ("acc.l", Type::I64)]);
            let exit = b.create_block("exit", &[("r", Type::I64)]);

            b.set_insert_point(pre);
            b.br("header", vec![Value::const_int(0), Value::const_int(1)]);

            b.set_insert_point(header);
            let i = b.block_param(header, 0);
            let acc = b.block_param(header, 1);
            let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::const_int(3));
            b.cbr(c, "latch", vec![i, acc.clone()], "exit", vec![acc]);

            b.set_insert_point(latch);
            let il = b.block_param(latch, 0);
            let accl = b.block_param(latch, 1);
            let acc2 = b.binary(Opcode::Mul, Type::I64, accl, Value::const_int(2));
            let i2 = b.binary(Opcode::Add, Type::I64, il, Value::const_int(1));
            b.br("header", vec![i2, acc2]);

            b.set_insert_point(exit);
            let r = b.block_param(exit, 0);
            b.ret(Some(r));
        }

        let expected = run_module(&module).unwrap();
        assert_eq!(expected, 8); // 1 * 2^3

        assert!(run(&mut module));
        assert!(verify_module(&module).is_ok());
        assert!(module.functions[0].find_block("latch").is_none());
        assert_eq!(run_module(&module).unwrap(), expected);
    }
}
