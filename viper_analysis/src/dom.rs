//! Dominator and post-dominator trees
//!
//! Both trees are computed by iterative data-flow over the reverse post-order
//! until a fixed point is reached. The post-dominator variant runs on the
//! reversed CFG with a synthetic exit joining all returning blocks.

use crate::cfg::{BlockId, CFGInfo};
use hashbrown::HashMap;

/// Synthetic exit node used by the post-dominator tree.
pub const VIRTUAL_EXIT: BlockId = usize::MAX;

/// Immediate-dominator tree over reachable blocks.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    /// Immediate dominator per block; the entry maps to itself.
    pub idom: HashMap<BlockId, BlockId>,
    /// Children per block in the dominator tree.
    pub children: HashMap<BlockId, Vec<BlockId>>,
    entry: BlockId,
}

impl DomTree {
    /// True when `a` dominates `b` (reflexive). Follows the idom chain up
    /// from `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        loop {
            let Some(&parent) = self.idom.get(&cur) else {
                return false;
            };
            if parent == cur {
                return false; // reached the entry
            }
            if parent == a {
                return true;
            }
            cur = parent;
        }
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Immediate dominator; `None` for the entry block and unreachable blocks.
    pub fn idom_of(&self, block: BlockId) -> Option<BlockId> {
        let &parent = self.idom.get(&block)?;
        if parent == block {
            None
        } else {
            Some(parent)
        }
    }

    pub fn children_of(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map_or(&[], |c| c.as_slice())
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Dominator-tree preorder starting at the entry.
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.idom.len());
        let mut stack = vec![self.entry];
        while let Some(block) = stack.pop() {
            order.push(block);
            // Push in reverse so children visit in recorded order.
            for &child in self.children_of(block).iter().rev() {
                stack.push(child);
            }
        }
        order
    }
}

/// Compute the dominator tree for the reachable blocks of a function.
pub fn compute_dominator_tree(cfg: &CFGInfo) -> DomTree {
    let rpo = cfg.rpo();
    let mut tree = DomTree::default();
    let Some(&entry) = rpo.first() else {
        return tree;
    };
    tree.entry = entry;

    let idom = solve_idoms(rpo, entry, |b| cfg.predecessors_of(b).to_vec(), |b| {
        cfg.rpo_index(b)
    });

    finish_tree(&mut tree, idom, entry);
    tree
}

/// Post-dominator tree; edges reversed, synthetic exit joins all blocks whose
/// terminator has no successors.
#[derive(Debug, Clone, Default)]
pub struct PostDomTree {
    pub idom: HashMap<BlockId, BlockId>,
    pub children: HashMap<BlockId, Vec<BlockId>>,
}

impl PostDomTree {
    /// True when `a` post-dominates `b` (reflexive).
    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        loop {
            let Some(&parent) = self.idom.get(&cur) else {
                return false;
            };
            if parent == a {
                return true;
            }
            if parent == VIRTUAL_EXIT || parent == cur {
                return false;
            }
            cur = parent;
        }
    }
}

pub fn compute_post_dominator_tree(cfg: &CFGInfo) -> PostDomTree {
    let mut tree = PostDomTree::default();
    if cfg.rpo().is_empty() {
        return tree;
    }

    // Reverse post-order of the reversed graph: process exits first. A
    // post-order of the forward graph (the reverse of the forward RPO) gives
    // exactly that, with the virtual exit prepended.
    let mut order: Vec<BlockId> = vec![VIRTUAL_EXIT];
    order.extend(cfg.rpo().iter().rev().copied());

    let mut order_index: HashMap<BlockId, usize> = HashMap::new();
    for (i, &b) in order.iter().enumerate() {
        order_index.insert(b, i);
    }

    // Predecessors in the reversed graph = forward successors; every exit
    // block additionally feeds the virtual exit.
    let rev_preds = |b: BlockId| -> Vec<BlockId> {
        if b == VIRTUAL_EXIT {
            Vec::new()
        } else if cfg.successors_of(b).is_empty() {
            vec![VIRTUAL_EXIT]
        } else {
            cfg.successors_of(b).to_vec()
        }
    };

    let idom = solve_idoms(&order, VIRTUAL_EXIT, rev_preds, |b| {
        order_index.get(&b).copied()
    });

    for (&block, &parent) in &idom {
        tree.idom.insert(block, parent);
        if parent != block {
            tree.children.entry(parent).or_default().push(block);
        }
    }
    for children in tree.children.values_mut() {
        children.sort_unstable();
    }
    tree
}

/// Iterative idom solver shared by both tree variants (Cooper/Harvey/Kennedy
/// style intersection over RPO numbers).
fn solve_idoms(
    order: &[BlockId],
    entry: BlockId,
    preds: impl Fn(BlockId) -> Vec<BlockId>,
    order_index: impl Fn(BlockId) -> Option<usize>,
) -> HashMap<BlockId, BlockId> {
    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(entry, entry);

    let intersect = |idom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
        loop {
            if a == b {
                return a;
            }
            let (ai, bi) = (order_index(a), order_index(b));
            let (Some(ai), Some(bi)) = (ai, bi) else {
                return entry;
            };
            if ai > bi {
                a = idom[&a];
            } else {
                b = idom[&b];
            }
        }
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &block in order.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for pred in preds(block) {
                if !idom.contains_key(&pred) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(cur) => intersect(&idom, pred, cur),
                });
            }
            if let Some(new_idom) = new_idom {
                if idom.get(&block) != Some(&new_idom) {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }
    }
    idom
}

fn finish_tree(tree: &mut DomTree, idom: HashMap<BlockId, BlockId>, entry: BlockId) {
    for (&block, &parent) in &idom {
        tree.idom.insert(block, parent);
        if block != entry {
            tree.children.entry(parent).or_default().push(block);
        }
    }
    for children in tree.children.values_mut() {
        children.sort_unstable();
    }
}

/// Dominance frontier per block: the join points where a definition in the
/// block stops dominating. Used by Mem2Reg to place block parameters.
pub fn dominance_frontier(cfg: &CFGInfo, tree: &DomTree) -> HashMap<BlockId, Vec<BlockId>> {
    let mut frontier: HashMap<BlockId, Vec<BlockId>> = HashMap::new();

    for &block in cfg.rpo() {
        let preds = cfg.predecessors_of(block);
        if preds.len() < 2 {
            continue;
        }
        let Some(idom) = tree.idom.get(&block).copied() else {
            continue;
        };
        for &pred in preds {
            if !cfg.is_reachable(pred) {
                continue;
            }
            let mut runner = pred;
            while runner != idom {
                let entry = frontier.entry(runner).or_default();
                if !entry.contains(&block) {
                    entry.push(block);
                }
                match tree.idom_of(runner) {
                    Some(next) => runner = next,
                    None => break,
                }
            }
        }
    }
    frontier
}
