//! Control-flow graph summary for one function

use hashbrown::HashMap;
use smallvec::SmallVec;
use viper_ir::Function;

/// Dense index of a block inside `Function::blocks`.
pub type BlockId = usize;

/// Successor/predecessor maps plus a reverse post-order enumeration of the
/// blocks reachable from entry.
///
/// Successor order matches the terminator's label vector, so for a
/// conditional branch the true target comes first.
#[derive(Debug, Clone, Default)]
pub struct CFGInfo {
    pub successors: HashMap<BlockId, SmallVec<[BlockId; 2]>>,
    pub predecessors: HashMap<BlockId, SmallVec<[BlockId; 2]>>,
    label_to_block: HashMap<String, BlockId>,
    rpo: Vec<BlockId>,
    rpo_index: HashMap<BlockId, usize>,
}

impl CFGInfo {
    pub fn block_id(&self, label: &str) -> Option<BlockId> {
        self.label_to_block.get(label).copied()
    }

    pub fn successors_of(&self, block: BlockId) -> &[BlockId] {
        self.successors.get(&block).map_or(&[], |s| s.as_slice())
    }

    pub fn predecessors_of(&self, block: BlockId) -> &[BlockId] {
        self.predecessors.get(&block).map_or(&[], |s| s.as_slice())
    }

    /// Blocks reachable from entry, in reverse post-order.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Position of a block in the reverse post-order, if reachable.
    pub fn rpo_index(&self, block: BlockId) -> Option<usize> {
        self.rpo_index.get(&block).copied()
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_index.contains_key(&block)
    }
}

/// Build the CFG summary in one linear pass over each block's terminator.
pub fn build_cfg(function: &Function) -> CFGInfo {
    let mut info = CFGInfo::default();

    for (idx, block) in function.blocks.iter().enumerate() {
        info.label_to_block.insert(block.label.clone(), idx);
        info.successors.entry(idx).or_default();
        info.predecessors.entry(idx).or_default();
    }

    for (idx, block) in function.blocks.iter().enumerate() {
        let Some(term) = block.terminator() else {
            continue;
        };
        for label in &term.labels {
            if let Some(&succ) = info.label_to_block.get(label) {
                info.successors.get_mut(&idx).unwrap().push(succ);
            }
        }
    }

    for (&block, succs) in &info.successors {
        for &succ in succs {
            info.predecessors.get_mut(&succ).unwrap().push(block);
        }
    }
    // Deterministic predecessor order regardless of hash iteration.
    for preds in info.predecessors.values_mut() {
        preds.sort_unstable();
    }

    if !function.blocks.is_empty() {
        info.rpo = post_order(&info, 0);
        info.rpo.reverse();
        for (i, &b) in info.rpo.iter().enumerate() {
            info.rpo_index.insert(b, i);
        }
    }

    info
}

/// Iterative DFS post-order from `entry` following successor edges.
fn post_order(info: &CFGInfo, entry: BlockId) -> Vec<BlockId> {
    let mut order = Vec::new();
    let mut visited = vec![false; info.successors.len()];
    // (block, next successor index to visit)
    let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
    visited[entry] = true;

    while let Some(top) = stack.len().checked_sub(1) {
        let (block, next) = stack[top];
        let succs = info.successors_of(block);
        if next < succs.len() {
            stack[top].1 += 1;
            let succ = succs[next];
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            order.push(block);
            stack.pop();
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::build::IRBuilder;
    use pretty_assertions::assert_eq;
    use viper_ir::{Module, Opcode, Type, Value};

    fn diamond() -> Module {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("x", Type::I64)]);
        let entry = b.add_block("entry");
        b.add_block("then");
        b.add_block("else");
        let merge = b.create_block("merge", &[("v", Type::I64)]);
        b.set_insert_point(entry);
        let cond = b.binary(Opcode::SCmpGt, Type::I1, Value::temp(0), Value::const_int(0));
        b.cbr(cond, "then", vec![], "else", vec![]);
        b.set_insert_point(1);
        b.br("merge", vec![Value::const_int(1)]);
        b.set_insert_point(2);
        b.br("merge", vec![Value::const_int(2)]);
        b.set_insert_point(merge);
        let v = b.block_param(merge, 0);
        b.ret(Some(v));
        module
    }

    #[test]
    fn successor_order_matches_terminator_labels() {
        let module = diamond();
        let cfg = build_cfg(&module.functions[0]);
        assert_eq!(cfg.successors_of(0), &[1, 2]);
        assert_eq!(cfg.predecessors_of(3), &[1, 2]);
        assert!(cfg.successors_of(3).is_empty());
    }

    #[test]
    fn rpo_starts_at_entry_and_covers_reachable_blocks() {
        let module = diamond();
        let cfg = build_cfg(&module.functions[0]);
        assert_eq!(cfg.rpo().len(), 4);
        assert_eq!(cfg.rpo()[0], 0);
        assert_eq!(cfg.rpo_index(0), Some(0));
        // Merge block is last in any RPO of a diamond.
        assert_eq!(cfg.rpo()[3], 3);
    }
}
