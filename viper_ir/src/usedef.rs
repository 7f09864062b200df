//! Use-def chain tracking for efficient SSA value replacement
//!
//! Instead of scanning every instruction to replace uses of a temporary, the
//! use sites are collected once; replacement then visits only actual uses.
//! Use sites are recorded as dense index paths rather than pointers so the
//! info stays sound across `Vec` reallocation, but it becomes stale as soon
//! as instructions are inserted or removed. Rebuild after such edits.

use crate::{Function, Value};
use std::collections::HashMap;

/// Location of one use of a temporary inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseSlot {
    Operand(usize),
    /// (successor index, argument index) inside a terminator's branch args.
    BrArg(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseSite {
    pub block: usize,
    pub instr: usize,
    pub slot: UseSlot,
}

/// Tracks use locations for SSA temporaries to enable O(uses) replacement.
#[derive(Debug, Default)]
pub struct UseDefInfo {
    uses: HashMap<u32, Vec<UseSite>>,
}

impl UseDefInfo {
    /// Build use-def chains for all temporaries in `function`.
    pub fn new(function: &Function) -> Self {
        let mut info = UseDefInfo::default();
        for (bi, block) in function.blocks.iter().enumerate() {
            for (ii, instr) in block.instructions.iter().enumerate() {
                for (oi, operand) in instr.operands.iter().enumerate() {
                    if let Some(id) = operand.as_temp() {
                        info.uses.entry(id).or_default().push(UseSite {
                            block: bi,
                            instr: ii,
                            slot: UseSlot::Operand(oi),
                        });
                    }
                }
                for (si, args) in instr.br_args.iter().enumerate() {
                    for (ai, arg) in args.iter().enumerate() {
                        if let Some(id) = arg.as_temp() {
                            info.uses.entry(id).or_default().push(UseSite {
                                block: bi,
                                instr: ii,
                                slot: UseSlot::BrArg(si, ai),
                            });
                        }
                    }
                }
            }
        }
        info
    }

    /// Replace all uses of `temp` with `replacement`, visiting only use sites.
    pub fn replace_all_uses(
        &mut self,
        function: &mut Function,
        temp: u32,
        replacement: &Value,
    ) -> usize {
        let Some(sites) = self.uses.remove(&temp) else {
            return 0;
        };

        for site in &sites {
            let instr = &mut function.blocks[site.block].instructions[site.instr];
            match site.slot {
                UseSlot::Operand(oi) => instr.operands[oi] = replacement.clone(),
                UseSlot::BrArg(si, ai) => instr.br_args[si][ai] = replacement.clone(),
            }
        }

        let count = sites.len();
        if let Some(id) = replacement.as_temp() {
            self.uses.entry(id).or_default().extend(sites);
        }
        count
    }

    pub fn has_uses(&self, temp: u32) -> bool {
        self.uses.get(&temp).is_some_and(|sites| !sites.is_empty())
    }

    pub fn use_count(&self, temp: u32) -> usize {
        self.uses.get(&temp).map_or(0, |sites| sites.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BasicBlock, Instr, Opcode, Type};

    #[test]
    fn replacement_visits_only_use_sites_and_rechains() {
        let mut f = Function::new("f", Type::I64);
        let mut b = BasicBlock::new("entry");
        let mut a = Instr::new(Opcode::Add, Type::I64);
        a.result = Some(2);
        a.operands = vec![Value::temp(0), Value::temp(1)];
        b.instructions.push(a);
        let mut r = Instr::new(Opcode::Ret, Type::Void);
        r.operands = vec![Value::temp(2)];
        b.instructions.push(r);
        b.terminated = true;
        f.blocks.push(b);

        let mut info = UseDefInfo::new(&f);
        assert_eq!(info.use_count(0), 1);
        assert_eq!(info.replace_all_uses(&mut f, 0, &Value::temp(1)), 1);
        assert_eq!(info.use_count(0), 0);
        // The rewritten site now counts as a use of temp 1.
        assert_eq!(info.use_count(1), 2);
        assert_eq!(
            f.blocks[0].instructions[0].operands,
            vec![Value::temp(1), Value::temp(1)]
        );
    }
}
