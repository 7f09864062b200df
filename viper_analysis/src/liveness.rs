//! Backwards liveness over SSA temporaries
//!
//! `use[B]` holds temps read before redefinition in B (operands and branch
//! arguments alike); `def[B]` holds block parameters and instruction results.
//! Iterating in reverse RPO, `live_out[B] = U live_in[succ]` and
//! `live_in[B] = use[B] | (live_out[B] - def[B])` until the sets stabilise.

use crate::bitset::BitSet;
use crate::cfg::{BlockId, CFGInfo};
use viper_ir::Function;

/// Per-block live-in/live-out bitsets indexed by temp id.
#[derive(Debug, Clone)]
pub struct LivenessInfo {
    value_count: usize,
    live_in: Vec<BitSet>,
    live_out: Vec<BitSet>,
}

impl LivenessInfo {
    pub fn live_in(&self, block: BlockId) -> &BitSet {
        &self.live_in[block]
    }

    pub fn live_out(&self, block: BlockId) -> &BitSet {
        &self.live_out[block]
    }

    /// Capacity of the temp id universe tracked by the analysis.
    pub fn value_count(&self) -> usize {
        self.value_count
    }
}

fn value_capacity(function: &Function) -> usize {
    let capacity = viper_ir::util::next_temp_id(function) as usize;
    capacity.max(function.value_names.len())
}

pub fn compute_liveness(function: &Function, cfg: &CFGInfo) -> LivenessInfo {
    let value_count = value_capacity(function);
    let block_count = function.blocks.len();

    let mut uses = vec![BitSet::new(value_count); block_count];
    let mut defs = vec![BitSet::new(value_count); block_count];

    for (idx, block) in function.blocks.iter().enumerate() {
        let (use_set, def_set) = (&mut uses[idx], &mut defs[idx]);
        for param in &block.params {
            def_set.insert(param.id as usize);
        }
        for instr in &block.instructions {
            let mut note_use = |id: u32| {
                let id = id as usize;
                if !def_set.contains(id) {
                    use_set.insert(id);
                }
            };
            for operand in &instr.operands {
                if let Some(id) = operand.as_temp() {
                    note_use(id);
                }
            }
            for args in &instr.br_args {
                for arg in args {
                    if let Some(id) = arg.as_temp() {
                        note_use(id);
                    }
                }
            }
            if let Some(result) = instr.result {
                def_set.insert(result as usize);
            }
        }
    }

    let mut live_in = vec![BitSet::new(value_count); block_count];
    let mut live_out = vec![BitSet::new(value_count); block_count];

    // Reverse RPO over reachable blocks, then any stragglers; the fixpoint
    // loop makes the order a performance detail only.
    let mut order: Vec<BlockId> = cfg.rpo().iter().rev().copied().collect();
    for b in 0..block_count {
        if !cfg.is_reachable(b) {
            order.push(b);
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &block in &order {
            let mut out = BitSet::new(value_count);
            for &succ in cfg.successors_of(block) {
                out.union_with(&live_in[succ]);
            }
            if out != live_out[block] {
                live_out[block] = out;
                changed = true;
            }

            let mut inn = uses[block].clone();
            inn.union_with_masked(&live_out[block], &defs[block]);
            if inn != live_in[block] {
                live_in[block] = inn;
                changed = true;
            }
        }
    }

    LivenessInfo { value_count, live_in, live_out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_cfg;
    use viper_ir::build::IRBuilder;
    use viper_ir::{Module, Opcode, Type, Value};

    #[test]
    fn branch_arguments_count_as_uses() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("x", Type::I64)]);
        let entry = b.add_block("entry");
        let next = b.create_block("next", &[("v", Type::I64)]);

        b.set_insert_point(entry);
        let t = b.binary(Opcode::Add, Type::I64, Value::temp(0), Value::const_int(1));
        b.br("next", vec![t.clone()]);

        b.set_insert_point(next);
        let v = b.block_param(next, 0);
        b.ret(Some(v));

        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let live = compute_liveness(f, &cfg);

        let t_id = t.as_temp().unwrap() as usize;
        // x (temp 0) is live into entry; the add result is live across the edge
        // but dead at entry of `next` (it is consumed by the branch argument).
        assert!(live.live_in(entry).contains(0));
        assert!(!live.live_in(next).contains(t_id));
        // The block parameter is defined by `next`, not live into it.
        let v_id = v.as_temp().unwrap() as usize;
        assert!(!live.live_in(next).contains(v_id));
    }

    #[test]
    fn loop_carried_values_are_live_around_the_backedge() {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("n", Type::I64)]);
        let entry = b.add_block("entry");
        let header = b.create_block("header", &[("i", Type::I64)]);
        let body = b.add_block("body");
        let exit = b.add_block("exit");

        b.set_insert_point(entry);
        b.br("header", vec![Value::const_int(0)]);
        b.set_insert_point(header);
        let i = b.block_param(header, 0);
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(0));
        b.cbr(c, "body", vec![], "exit", vec![]);
        b.set_insert_point(body);
        let i2 = b.binary(Opcode::Add, Type::I64, i.clone(), Value::const_int(1));
        b.br("header", vec![i2]);
        b.set_insert_point(exit);
        b.ret(Some(i));

        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let live = compute_liveness(f, &cfg);

        // n is live through the whole loop (used by the header compare).
        assert!(live.live_in(header).contains(0));
        assert!(live.live_out(body).contains(0));
        // i is live out of the header into both body and exit.
        let i_id = f.blocks[header].params[0].id as usize;
        assert!(live.live_out(header).contains(i_id));
    }
}
