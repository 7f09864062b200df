//! Expression identity keys for EarlyCSE and GVN
//!
//! Normalises commutative operands to a canonical order and gates which
//! opcodes are safe for expression CSE: pure, non-trapping, no memory
//! effects. Floats hash by bit pattern (see `viper_ir::Value`), so NaN
//! payloads behave in hash tables.

use viper_ir::{Instr, MemoryEffects, Opcode, Type, Value};

/// Normalised key describing a pure instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueKey {
    pub op: Opcode,
    pub ty: Type,
    pub operands: Vec<Value>,
}

/// True when operand order does not affect the result.
pub fn is_commutative_cse(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        Add | Mul
            | And
            | Or
            | Xor
            | ICmpEq
            | ICmpNe
            | FAdd
            | FMul
            | FCmpEq
            | FCmpNe
    )
}

/// Whitelist of opcodes safe for expression-based CSE/GVN: no side effects,
/// no traps, no memory access.
pub fn is_safe_cse_opcode(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        Add | Sub
            | Mul
            | And
            | Or
            | Xor
            | Shl
            | LShr
            | AShr
            | ICmpEq
            | ICmpNe
            | SCmpLt
            | SCmpLe
            | SCmpGt
            | SCmpGe
            | UCmpLt
            | UCmpLe
            | UCmpGt
            | UCmpGe
            | FAdd
            | FSub
            | FMul
            | FCmpEq
            | FCmpNe
            | FCmpLt
            | FCmpLe
            | FCmpGt
            | FCmpGe
            | Sitofp
            | Zext1
            | Trunc1
    )
}

/// Stable rank for canonical operand ordering: temps first, then integer,
/// float and symbolic constants, each tie-broken by payload.
fn rank(value: &Value) -> (u8, u64, &str) {
    match value {
        Value::Temp(id) => (3, *id as u64, ""),
        Value::ConstInt { value, is_bool } => {
            (2, (*value as u64) ^ (*is_bool as u64), "")
        }
        Value::ConstFloat(f) => (1, f.to_bits(), ""),
        Value::ConstStr(s) | Value::GlobalAddr(s) => (0, 0, s.as_str()),
        Value::NullPtr => (0, 0, "null"),
    }
}

fn normalise_operands(instr: &Instr) -> Vec<Value> {
    let mut operands = instr.operands.clone();
    if operands.len() == 2 && is_commutative_cse(instr.op) && rank(&operands[0]) < rank(&operands[1])
    {
        operands.swap(0, 1);
    }
    operands
}

/// Build a normalised expression key when `instr` is a CSE candidate.
///
/// Rejects terminators, side-effecting and trapping instructions, memory
/// operations, and anything without a result.
pub fn make_value_key(instr: &Instr) -> Option<ValueKey> {
    let info = instr.op.info();
    if info.is_terminator || info.has_side_effects || info.can_trap {
        return None;
    }
    if info.memory != MemoryEffects::None {
        return None;
    }
    instr.result?;
    if !is_safe_cse_opcode(instr.op) {
        return None;
    }

    Some(ValueKey {
        op: instr.op,
        ty: instr.ty,
        operands: normalise_operands(instr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: Value, b: Value) -> Instr {
        let mut instr = Instr::new(Opcode::Add, Type::I64);
        instr.result = Some(9);
        instr.operands = vec![a, b];
        instr
    }

    #[test]
    fn commutative_operands_normalise_to_one_key() {
        let k1 = make_value_key(&add(Value::temp(1), Value::temp(2))).unwrap();
        let k2 = make_value_key(&add(Value::temp(2), Value::temp(1))).unwrap();
        assert_eq!(k1, k2);

        let k3 = make_value_key(&add(Value::const_int(3), Value::temp(1))).unwrap();
        let k4 = make_value_key(&add(Value::temp(1), Value::const_int(3))).unwrap();
        assert_eq!(k3, k4);
    }

    #[test]
    fn non_commutative_order_is_preserved() {
        let mut sub = Instr::new(Opcode::Sub, Type::I64);
        sub.result = Some(9);
        sub.operands = vec![Value::temp(1), Value::temp(2)];
        let k1 = make_value_key(&sub).unwrap();
        sub.operands = vec![Value::temp(2), Value::temp(1)];
        let k2 = make_value_key(&sub).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn unsafe_opcodes_are_rejected() {
        let mut load = Instr::new(Opcode::Load, Type::I64);
        load.result = Some(1);
        load.operands = vec![Value::temp(0)];
        assert!(make_value_key(&load).is_none());

        let mut div = Instr::new(Opcode::SDiv, Type::I64);
        div.result = Some(1);
        div.operands = vec![Value::temp(0), Value::const_int(2)];
        assert!(make_value_key(&div).is_none());

        let mut ovf = Instr::new(Opcode::IAddOvf, Type::I64);
        ovf.result = Some(1);
        ovf.operands = vec![Value::temp(0), Value::const_int(2)];
        assert!(make_value_key(&ovf).is_none());
    }
}
