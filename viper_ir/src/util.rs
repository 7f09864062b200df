//! Shared IR manipulation helpers used across passes

use crate::{Function, Value};

/// Compute the next unused temp id by scanning parameters, block parameters,
/// instruction results, operands and branch arguments.
pub fn next_temp_id(function: &Function) -> u32 {
    let mut next = 0u32;
    let mut update = |id: u32| {
        if id + 1 > next {
            next = id + 1;
        }
    };

    for param in &function.params {
        update(param.id);
    }
    for block in &function.blocks {
        for param in &block.params {
            update(param.id);
        }
        for instr in &block.instructions {
            if let Some(result) = instr.result {
                update(result);
            }
            for operand in &instr.operands {
                if let Some(id) = operand.as_temp() {
                    update(id);
                }
            }
            for args in &instr.br_args {
                for arg in args {
                    if let Some(id) = arg.as_temp() {
                        update(id);
                    }
                }
            }
        }
    }
    next
}

/// Replace every use of `temp` with `replacement` across the function.
///
/// Walks all operands and branch arguments; definitions are untouched. Returns
/// the number of replaced uses.
pub fn replace_all_uses(function: &mut Function, temp: u32, replacement: &Value) -> usize {
    let mut count = 0;
    for block in &mut function.blocks {
        for instr in &mut block.instructions {
            for operand in &mut instr.operands {
                if operand.as_temp() == Some(temp) {
                    *operand = replacement.clone();
                    count += 1;
                }
            }
            for args in &mut instr.br_args {
                for arg in args {
                    if arg.as_temp() == Some(temp) {
                        *arg = replacement.clone();
                        count += 1;
                    }
                }
            }
        }
    }
    count
}

/// Count uses of a temp across operands and branch arguments.
pub fn count_temp_uses(function: &Function, temp: u32) -> usize {
    let mut count = 0;
    for block in &function.blocks {
        for instr in &block.instructions {
            count += instr
                .operands
                .iter()
                .filter(|v| v.as_temp() == Some(temp))
                .count();
            for args in &instr.br_args {
                count += args.iter().filter(|v| v.as_temp() == Some(temp)).count();
            }
        }
    }
    count
}

/// Generate a block label not yet present in the function, starting from
/// `base` and appending `.1`, `.2`, ... as needed.
pub fn make_unique_label(function: &Function, base: &str) -> String {
    let mut candidate = base.to_string();
    let mut suffix = 0u32;
    while function.blocks.iter().any(|b| b.label == candidate) {
        suffix += 1;
        candidate = format!("{base}.{suffix}");
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BasicBlock, Instr, Opcode, Type};

    #[test]
    fn next_temp_id_scans_all_value_positions() {
        let mut f = Function::new("f", Type::I64);
        let mut b = BasicBlock::new("entry");
        let mut add = Instr::new(Opcode::Add, Type::I64);
        add.result = Some(4);
        add.operands = vec![Value::temp(9), Value::const_int(1)];
        b.instructions.push(add);
        let mut br = Instr::new(Opcode::Br, Type::Void);
        br.labels.push("entry".into());
        br.br_args.push(vec![Value::temp(12)]);
        b.instructions.push(br);
        b.terminated = true;
        f.blocks.push(b);

        assert_eq!(next_temp_id(&f), 13);
    }

    #[test]
    fn replace_all_uses_rewrites_operands_and_branch_args() {
        let mut f = Function::new("f", Type::I64);
        let mut b = BasicBlock::new("entry");
        let mut add = Instr::new(Opcode::Add, Type::I64);
        add.result = Some(1);
        add.operands = vec![Value::temp(0), Value::temp(0)];
        b.instructions.push(add);
        let mut br = Instr::new(Opcode::Br, Type::Void);
        br.labels.push("exit".into());
        br.br_args.push(vec![Value::temp(0)]);
        b.instructions.push(br);
        f.blocks.push(b);

        let replaced = replace_all_uses(&mut f, 0, &Value::const_int(5));
        assert_eq!(replaced, 3);
        assert_eq!(count_temp_uses(&f, 0), 0);
    }
}
