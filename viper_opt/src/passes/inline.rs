//! Function inlining
//!
//! Sweeps call sites over the module, inlining callees whose adjusted cost
//! (instruction count minus a single-use bonus and a per-constant-argument
//! bonus) stays below the threshold and whose block count fits the budget.
//! The callee's blocks are cloned into the caller with fresh temp ids and
//! labels; the call becomes a branch into the clone's entry (which receives
//! the arguments as block parameters) and every return becomes a branch to a
//! continuation block carrying the return value. Recursive callees are never
//! inlined, and each sweep only considers call sites that existed when the
//! sweep started, so the sweep count bounds transitive inlining depth.

use crate::manager::{AnalysisManager, PreservedAnalyses};
use crate::registry::ModulePass;
use hashbrown::{HashMap, HashSet};
use viper_ir::util::{next_temp_id, replace_all_uses};
use viper_ir::{BasicBlock, Function, Instr, Module, Opcode, Param, Type, Value};

/// Thresholds controlling what gets inlined.
pub struct InlineConfig {
    /// Adjusted callee cost must stay strictly below this.
    pub instr_threshold: i64,
    /// Maximum number of callee blocks.
    pub block_budget: usize,
    /// Number of inlining sweeps (bounds transitive inlining depth).
    pub depth: usize,
    /// Cost credit when the callee has exactly one call site in the module.
    pub single_use_bonus: i64,
    /// Cost credit per constant argument at the call site.
    pub const_arg_bonus: i64,
}

impl Default for InlineConfig {
    fn default() -> Self {
        Self {
            instr_threshold: 80,
            block_budget: 8,
            depth: 3,
            single_use_bonus: 20,
            const_arg_bonus: 5,
        }
    }
}

#[derive(Default)]
pub struct Inline {
    config: InlineConfig,
}

impl Inline {
    pub fn with_config(config: InlineConfig) -> Self {
        Self { config }
    }
}

impl ModulePass for Inline {
    fn id(&self) -> &str {
        "inline"
    }

    fn run(&mut self, module: &mut Module, _am: &mut AnalysisManager) -> PreservedAnalyses {
        let mut changed = false;
        for _ in 0..self.config.depth {
            if !inline_sweep(module, &self.config) {
                break;
            }
            changed = true;
        }
        if !changed {
            return PreservedAnalyses::all();
        }
        PreservedAnalyses::none()
    }
}

/// Functions that can reach themselves through the call graph.
fn recursive_functions(module: &Module) -> HashSet<String> {
    let mut callees: HashMap<&str, HashSet<&str>> = HashMap::new();
    for function in &module.functions {
        let entry = callees.entry(function.name.as_str()).or_default();
        for block in &function.blocks {
            for instr in &block.instructions {
                if instr.op == Opcode::Call {
                    if let Some(name) = instr.callee.as_deref() {
                        entry.insert(name);
                    }
                }
            }
        }
    }

    let mut recursive = HashSet::new();
    for function in &module.functions {
        let start = function.name.as_str();
        let mut worklist: Vec<&str> = callees
            .get(start)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(next) = worklist.pop() {
            if next == start {
                recursive.insert(start.to_string());
                break;
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(more) = callees.get(next) {
                worklist.extend(more.iter().copied());
            }
        }
    }
    recursive
}

fn call_site_counts(module: &Module) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for function in &module.functions {
        for block in &function.blocks {
            for instr in &block.instructions {
                if instr.op == Opcode::Call {
                    if let Some(name) = &instr.callee {
                        *counts.entry(name.clone()).or_default() += 1;
                    }
                }
            }
        }
    }
    counts
}

fn callee_size(function: &Function) -> usize {
    function.blocks.iter().map(|b| b.instructions.len()).sum()
}

/// One sweep: repeatedly inline the next eligible call site outside blocks
/// created during this sweep.
fn inline_sweep(module: &mut Module, config: &InlineConfig) -> bool {
    let recursive = recursive_functions(module);
    let counts = call_site_counts(module);
    // Blocks minted during this sweep, per caller; call sites inside them
    // wait for the next sweep.
    let mut fresh: HashMap<usize, HashSet<String>> = HashMap::new();
    let mut changed = false;

    loop {
        let Some((fi, bi, ii, callee_name)) =
            find_inline_site(module, config, &recursive, &counts, &fresh)
        else {
            break;
        };
        let callee = module
            .find_function(&callee_name)
            .expect("eligible callee exists")
            .clone();
        let new_labels = inline_call_site(&mut module.functions[fi], bi, ii, &callee);
        log::debug!(
            "inline: @{} <- @{} ({} block(s) cloned)",
            module.functions[fi].name,
            callee_name,
            new_labels.len()
        );
        fresh.entry(fi).or_default().extend(new_labels);
        changed = true;
    }
    changed
}

fn find_inline_site(
    module: &Module,
    config: &InlineConfig,
    recursive: &HashSet<String>,
    counts: &HashMap<String, usize>,
    fresh: &HashMap<usize, HashSet<String>>,
) -> Option<(usize, usize, usize, String)> {
    for (fi, function) in module.functions.iter().enumerate() {
        let skip = fresh.get(&fi);
        for (bi, block) in function.blocks.iter().enumerate() {
            if skip.is_some_and(|s| s.contains(&block.label)) {
                continue;
            }
            for (ii, instr) in block.instructions.iter().enumerate() {
                if instr.op != Opcode::Call {
                    continue;
                }
                let Some(name) = instr.callee.as_deref() else {
                    continue;
                };
                if name == function.name || recursive.contains(name) {
                    continue;
                }
                let Some(callee) = module.find_function(name) else {
                    continue;
                };
                if callee.blocks.is_empty() || callee.blocks.len() > config.block_budget {
                    continue;
                }
                if instr.operands.len() != callee.params.len() {
                    continue;
                }
                // The clone's entry receives arguments as block parameters,
                // which only works when nothing branches back to it.
                let entry_label = &callee.blocks[0].label;
                let entry_targeted = callee
                    .blocks
                    .iter()
                    .filter_map(|b| b.terminator())
                    .any(|t| t.labels.iter().any(|l| l == entry_label));
                if entry_targeted {
                    continue;
                }

                let mut cost = callee_size(callee) as i64;
                if counts.get(name).copied().unwrap_or(0) == 1 {
                    cost -= config.single_use_bonus;
                }
                let const_args = instr.operands.iter().filter(|v| v.is_const()).count();
                cost -= config.const_arg_bonus * const_args as i64;
                if cost >= config.instr_threshold {
                    continue;
                }
                return Some((fi, bi, ii, name.to_string()));
            }
        }
    }
    None
}

/// Generate a label unique against the caller and against labels already
/// handed out during this inlining.
fn unique_label(caller: &Function, taken: &mut HashSet<String>, base: String) -> String {
    let mut candidate = base.clone();
    let mut suffix = 0u32;
    while caller.blocks.iter().any(|b| b.label == candidate) || taken.contains(&candidate) {
        suffix += 1;
        candidate = format!("{base}.{suffix}");
    }
    taken.insert(candidate.clone());
    candidate
}

fn remap_value(value: &Value, id_map: &HashMap<u32, u32>) -> Value {
    match value.as_temp() {
        Some(id) => match id_map.get(&id) {
            Some(&fresh) => Value::temp(fresh),
            None => value.clone(),
        },
        None => value.clone(),
    }
}

/// Splice `callee` into `caller` at the call `caller.blocks[bi][ii]`.
/// Returns the labels of all blocks created in the caller.
fn inline_call_site(
    caller: &mut Function,
    bi: usize,
    ii: usize,
    callee: &Function,
) -> Vec<String> {
    let call = caller.blocks[bi].instructions[ii].clone();
    debug_assert_eq!(call.op, Opcode::Call);

    let mut next_id = next_temp_id(caller);
    let mut allocate = |old: u32, name: &str, id_map: &mut HashMap<u32, u32>,
                        names: &mut Vec<(u32, String)>| {
        let fresh = *id_map.entry(old).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        names.push((fresh, name.to_string()));
        fresh
    };

    // Fresh ids for every definition in the callee.
    let mut id_map: HashMap<u32, u32> = HashMap::new();
    let mut names: Vec<(u32, String)> = Vec::new();
    for param in &callee.params {
        allocate(param.id, &param.name, &mut id_map, &mut names);
    }
    for block in &callee.blocks {
        for param in &block.params {
            allocate(param.id, &param.name, &mut id_map, &mut names);
        }
        for instr in &block.instructions {
            if let Some(result) = instr.result {
                let name = callee
                    .value_names
                    .get(result as usize)
                    .cloned()
                    .unwrap_or_default();
                allocate(result, &name, &mut id_map, &mut names);
            }
        }
    }

    // Fresh labels for every callee block plus the continuation.
    let mut taken: HashSet<String> = HashSet::new();
    let mut label_map: HashMap<String, String> = HashMap::new();
    for block in &callee.blocks {
        let base = format!("inl.{}.{}", callee.name, block.label);
        let label = unique_label(caller, &mut taken, base);
        label_map.insert(block.label.clone(), label);
    }
    let cont_label = unique_label(
        caller,
        &mut taken,
        format!("{}.cont", caller.blocks[bi].label),
    );

    // Split the caller block: everything after the call moves into the
    // continuation, which keeps the original terminator.
    let tail = caller.blocks[bi].instructions.split_off(ii + 1);
    caller.blocks[bi].instructions.pop(); // the call itself
    let mut cont = BasicBlock::new(cont_label.clone());
    cont.instructions = tail;
    cont.terminated = caller.blocks[bi].terminated;

    // The continuation receives the return value as a parameter.
    let cont_param = call.result.map(|result| {
        let id = next_id;
        next_id += 1;
        cont.params.push(Param::new("ret", call.ty, id));
        (result, id)
    });

    // The caller block now branches into the clone's entry with the call
    // arguments.
    let entry_label = label_map[&callee.blocks[0].label].clone();
    let mut enter = Instr::new(Opcode::Br, Type::Void);
    enter.labels = vec![entry_label];
    enter.br_args = vec![call.operands.clone()];
    enter.loc = call.loc;
    caller.blocks[bi].instructions.push(enter);
    caller.blocks[bi].terminated = true;

    // Clone the callee blocks.
    let mut new_labels = vec![cont_label.clone()];
    for (index, block) in callee.blocks.iter().enumerate() {
        let label = label_map[&block.label].clone();
        new_labels.push(label.clone());
        let mut cloned = BasicBlock::new(label);

        // The entry clone takes the callee's function parameters as block
        // parameters; other blocks keep their own (remapped) parameters.
        let params = if index == 0 { &callee.params } else { &block.params };
        for param in params {
            let mut p = param.clone();
            p.id = id_map[&param.id];
            cloned.params.push(p);
        }

        for instr in &block.instructions {
            if instr.op == Opcode::Ret {
                let mut br = Instr::new(Opcode::Br, Type::Void);
                br.labels = vec![cont_label.clone()];
                let args = match (&cont_param, instr.operands.first()) {
                    (Some(_), Some(value)) => vec![remap_value(value, &id_map)],
                    _ => Vec::new(),
                };
                br.br_args = vec![args];
                br.loc = instr.loc;
                cloned.instructions.push(br);
                continue;
            }
            let mut copy = instr.clone();
            if let Some(result) = copy.result {
                copy.result = Some(id_map[&result]);
            }
            for operand in &mut copy.operands {
                *operand = remap_value(operand, &id_map);
            }
            for args in &mut copy.br_args {
                for arg in args.iter_mut() {
                    *arg = remap_value(arg, &id_map);
                }
            }
            for label in &mut copy.labels {
                if let Some(mapped) = label_map.get(label) {
                    *label = mapped.clone();
                }
            }
            cloned.instructions.push(copy);
        }
        cloned.terminated = true;
        caller.blocks.push(cloned);
    }
    caller.blocks.push(cont);

    // Wire the call result to the continuation parameter.
    if let Some((result, param)) = cont_param {
        replace_all_uses(caller, result, &Value::temp(param));
    }
    for (id, name) in names {
        caller.set_value_name(id, name);
    }

    new_labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{AnalysisManager, AnalysisRegistry};
    use crate::pipeline::register_default_analyses;
    use viper_ir::build::IRBuilder;
    use viper_ir::CallAttrs;
    use viper_verify::verify_module;
    use viper_vm::run_module;

    fn run_inline(module: &mut Module) -> bool {
        let mut registry = AnalysisRegistry::new();
        register_default_analyses(&mut registry);
        let mut am = AnalysisManager::new(&registry);
        let preserved = Inline::default().run(module, &mut am);
        !preserved.preserves_all_module_analyses()
    }

    fn module_with_helper() -> Module {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);

        b.start_function("square_plus_one", Type::I64, &[("x", Type::I64)]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let sq = b.binary(Opcode::Mul, Type::I64, Value::temp(0), Value::temp(0));
        let r = b.binary(Opcode::Add, Type::I64, sq, Value::const_int(1));
        b.ret(Some(r));

        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let v = b
            .call(
                "square_plus_one",
                Type::I64,
                vec![Value::const_int(6)],
                CallAttrs::default(),
            )
            .unwrap();
        let out = b.binary(Opcode::Add, Type::I64, v, Value::const_int(5));
        b.ret(Some(out));
        module
    }

    #[test]
    fn inlines_small_callee_and_preserves_result() {
        let mut module = module_with_helper();
        let expected = run_module(&module).unwrap();
        assert_eq!(expected, 42);

        assert!(run_inline(&mut module));
        assert!(verify_module(&module).is_ok());

        let main = module.find_function("main").unwrap();
        assert!(main
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .all(|i| i.op != Opcode::Call));
        assert_eq!(run_module(&module), Ok(expected));
    }

    #[test]
    fn recursive_callees_are_skipped() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);

        b.start_function("count", Type::I64, &[("n", Type::I64)]);
        let entry = b.add_block("entry");
        let rec = b.add_block("rec");
        let done = b.add_block("done");
        b.set_insert_point(entry);
        let c = b.binary(Opcode::SCmpGt, Type::I1, Value::temp(0), Value::const_int(0));
        b.cbr(c, "rec", vec![], "done", vec![]);
        b.set_insert_point(rec);
        let n1 = b.binary(Opcode::Sub, Type::I64, Value::temp(0), Value::const_int(1));
        let r = b.call("count", Type::I64, vec![n1], CallAttrs::default()).unwrap();
        b.ret(Some(r));
        b.set_insert_point(done);
        b.ret(Some(Value::const_int(0)));

        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let v = b.call("count", Type::I64, vec![Value::const_int(3)], CallAttrs::default())
            .unwrap();
        b.ret(Some(v));

        assert!(!run_inline(&mut module));
    }

    #[test]
    fn oversized_callees_are_skipped() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);

        b.start_function("big", Type::I64, &[("x", Type::I64)]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let mut acc = Value::temp(0);
        for _ in 0..120 {
            acc = b.binary(Opcode::Add, Type::I64, acc, Value::const_int(1));
        }
        b.ret(Some(acc));

        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let v = b.call("big", Type::I64, vec![Value::const_int(1)], CallAttrs::default())
            .unwrap();
        b.ret(Some(v));

        assert!(!run_inline(&mut module));
    }

    #[test]
    fn inlines_branching_callee_with_continuation() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);

        b.start_function("pick", Type::I64, &[("c", Type::I1)]);
        let entry = b.add_block("entry");
        let yes = b.add_block("yes");
        let no = b.add_block("no");
        b.set_insert_point(entry);
        b.cbr(Value::temp(0), "yes", vec![], "no", vec![]);
        b.set_insert_point(yes);
        b.ret(Some(Value::const_int(10)));
        b.set_insert_point(no);
        b.ret(Some(Value::const_int(20)));

        b.start_function("main", Type::I64, &[]);
        let entry = b.add_block("entry");
        b.set_insert_point(entry);
        let v = b
            .call("pick", Type::I64, vec![Value::const_bool(true)], CallAttrs::default())
            .unwrap();
        let out = b.binary(Opcode::Mul, Type::I64, v, Value::const_int(3));
        b.ret(Some(out));

        let expected = run_module(&module).unwrap();
        assert_eq!(expected, 30);

        assert!(run_inline(&mut module));
        assert!(verify_module(&module).is_ok());
        assert_eq!(run_module(&module), Ok(expected));

        // Both returns feed one continuation block.
        let main = module.find_function("main").unwrap();
        let cont = main.find_block("entry.cont").expect("continuation block");
        assert_eq!(cont.params.len(), 1);
    }
}
