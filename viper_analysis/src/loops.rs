//! Natural-loop discovery from the dominator tree
//!
//! A back-edge `a -> b` where `b` dominates `a` defines a loop with header
//! `b` containing every block that reaches `a` without passing through `b`.
//! Loops sharing a header are merged; the result is ordered innermost-first.

use crate::cfg::{BlockId, CFGInfo};
use crate::dom::DomTree;
use hashbrown::HashSet;
use viper_ir::Function;

/// One loop-exiting edge, by block label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopExit {
    pub from: String,
    pub to: String,
}

/// A natural loop described by block labels.
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: String,
    pub blocks: HashSet<String>,
    /// Blocks with a back-edge to the header.
    pub latches: Vec<String>,
    pub exits: Vec<LoopExit>,
    /// Header of the innermost enclosing loop, if nested.
    pub parent: Option<String>,
    /// Headers of directly nested loops.
    pub children: Vec<String>,
}

impl Loop {
    pub fn contains(&self, label: &str) -> bool {
        self.blocks.contains(label)
    }
}

/// Loops of one function, innermost first.
#[derive(Debug, Clone, Default)]
pub struct LoopInfo {
    loops: Vec<Loop>,
}

impl LoopInfo {
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn loop_for_header(&self, header: &str) -> Option<&Loop> {
        self.loops.iter().find(|l| l.header == header)
    }
}

pub fn compute_loop_info(function: &Function, cfg: &CFGInfo, dom: &DomTree) -> LoopInfo {
    let label_of = |b: BlockId| function.blocks[b].label.clone();

    // Discover back-edges and grow one loop per header.
    let mut loops: Vec<(BlockId, HashSet<BlockId>, Vec<BlockId>)> = Vec::new();
    for &block in cfg.rpo() {
        for &succ in cfg.successors_of(block) {
            if !dom.dominates(succ, block) {
                continue;
            }
            // succ is a loop header, block is a latch.
            let slot = match loops.iter().position(|(h, ..)| *h == succ) {
                Some(found) => found,
                None => {
                    loops.push((succ, HashSet::new(), Vec::new()));
                    loops.len() - 1
                }
            };
            let (_, body, latches) = &mut loops[slot];
            body.insert(succ);
            latches.push(block);
            // Backward walk from the latch collecting blocks that reach it
            // without passing through the header.
            let mut worklist = vec![block];
            while let Some(b) = worklist.pop() {
                if !body.insert(b) {
                    continue;
                }
                for &pred in cfg.predecessors_of(b) {
                    if !body.contains(&pred) && cfg.is_reachable(pred) {
                        worklist.push(pred);
                    }
                }
            }
        }
    }

    let mut result: Vec<Loop> = loops
        .iter()
        .map(|(header, body, latches)| {
            let mut exits = Vec::new();
            for &b in body {
                for &succ in cfg.successors_of(b) {
                    if !body.contains(&succ) {
                        exits.push(LoopExit { from: label_of(b), to: label_of(succ) });
                    }
                }
            }
            exits.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
            let mut latch_labels: Vec<String> = latches.iter().map(|&l| label_of(l)).collect();
            latch_labels.sort();
            latch_labels.dedup();
            Loop {
                header: label_of(*header),
                blocks: body.iter().map(|&b| label_of(b)).collect(),
                latches: latch_labels,
                exits,
                parent: None,
                children: Vec::new(),
            }
        })
        .collect();

    // Nesting: the parent of a loop is the smallest other loop containing its
    // header.
    let snapshots: Vec<(String, usize, HashSet<String>)> = result
        .iter()
        .map(|l| (l.header.clone(), l.blocks.len(), l.blocks.clone()))
        .collect();
    for l in &mut result {
        let mut best: Option<(usize, &str)> = None;
        for (header, size, blocks) in &snapshots {
            if header == &l.header || !blocks.contains(&l.header) {
                continue;
            }
            if best.map_or(true, |(bs, _)| *size < bs) {
                best = Some((*size, header));
            }
        }
        l.parent = best.map(|(_, h)| h.to_string());
    }
    let parents: Vec<(String, Option<String>)> = result
        .iter()
        .map(|l| (l.header.clone(), l.parent.clone()))
        .collect();
    for l in &mut result {
        l.children = parents
            .iter()
            .filter(|(_, p)| p.as_deref() == Some(l.header.as_str()))
            .map(|(h, _)| h.clone())
            .collect();
    }

    // Innermost first: nested loops are strictly smaller than their parents.
    result.sort_by_key(|l| l.blocks.len());

    log::trace!(
        "loop-info: {} loop(s) {:?}",
        result.len(),
        result.iter().map(|l| &l.header).collect::<Vec<_>>()
    );
    LoopInfo { loops: result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_cfg, compute_dominator_tree};
    use viper_ir::build::IRBuilder;
    use viper_ir::{Module, Opcode, Type, Value};

    /// entry -> outer; outer -> inner | done; inner -> inner_body;
    /// inner_body -> inner | outer_latch; outer_latch -> outer
    fn nested_loops() -> Module {
        let mut module = Module::new();
        let mut b = IRBuilder::new(&mut module);
        b.start_function("f", Type::I64, &[("n", Type::I64)]);
        let entry = b.add_block("entry");
        let outer = b.create_block("outer", &[("i", Type::I64)]);
        let inner = b.create_block("inner", &[("j", Type::I64)]);
        let inner_body = b.add_block("inner_body");
        let outer_latch = b.add_block("outer_latch");
        let done = b.add_block("done");

        b.set_insert_point(entry);
        b.br("outer", vec![Value::const_int(0)]);

        b.set_insert_point(outer);
        let i = b.block_param(outer, 0);
        let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::temp(0));
        b.cbr(c, "inner", vec![Value::const_int(0)], "done", vec![]);

        b.set_insert_point(inner);
        let j = b.block_param(inner, 0);
        let c2 = b.binary(Opcode::SCmpLt, Type::I1, j.clone(), Value::const_int(4));
        b.cbr(c2, "inner_body", vec![], "outer_latch", vec![]);

        b.set_insert_point(inner_body);
        let j2 = b.binary(Opcode::Add, Type::I64, j, Value::const_int(1));
        b.br("inner", vec![j2]);

        b.set_insert_point(outer_latch);
        let i2 = b.binary(Opcode::Add, Type::I64, i, Value::const_int(1));
        b.br("outer", vec![i2]);

        b.set_insert_point(done);
        b.ret(Some(Value::const_int(0)));
        module
    }

    #[test]
    fn discovers_nested_loops_innermost_first() {
        let module = nested_loops();
        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let dom = compute_dominator_tree(&cfg);
        let info = compute_loop_info(f, &cfg, &dom);

        assert_eq!(info.loops().len(), 2);
        let first = &info.loops()[0];
        let second = &info.loops()[1];
        assert_eq!(first.header, "inner");
        assert_eq!(second.header, "outer");
        assert_eq!(first.parent.as_deref(), Some("outer"));
        assert_eq!(second.children, vec!["inner".to_string()]);
        assert_eq!(first.latches, vec!["inner_body".to_string()]);
        assert!(second.blocks.contains("inner_body"));
        assert!(!second.blocks.contains("done"));
    }

    #[test]
    fn records_exit_edges() {
        let module = nested_loops();
        let f = &module.functions[0];
        let cfg = build_cfg(f);
        let dom = compute_dominator_tree(&cfg);
        let info = compute_loop_info(f, &cfg, &dom);

        let inner = info.loop_for_header("inner").unwrap();
        assert!(inner
            .exits
            .iter()
            .any(|e| e.from == "inner" && e.to == "outer_latch"));
        let outer = info.loop_for_header("outer").unwrap();
        assert!(outer.exits.iter().any(|e| e.to == "done"));
    }
}
