//! Constant evaluation shared by the folder and the reference interpreter
//!
//! Integer wrapping, trap conditions and float behaviour are defined here
//! once. The constant folder may only fold what this module evaluates, and
//! the VM executes through the same functions, so a fold can never produce a
//! value or trap status the VM would not.

use crate::{Opcode, Type, Value};
use thiserror::Error;

/// Reason an instruction trapped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    #[error("integer overflow")]
    Overflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("bounds check failed")]
    Bounds,
    #[error("invalid cast")]
    InvalidCast,
    #[error("trap instruction executed")]
    Explicit,
}

fn int_pair(lhs: &Value, rhs: &Value) -> Option<(i64, i64)> {
    Some((lhs.as_const_int()?, rhs.as_const_int()?))
}

fn float_pair(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
    Some((lhs.as_const_float()?, rhs.as_const_float()?))
}

fn sdiv(a: i64, b: i64) -> Result<i64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    if a == i64::MIN && b == -1 {
        return Err(TrapKind::Overflow);
    }
    Ok(a / b)
}

fn srem(a: i64, b: i64) -> Result<i64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    if a == i64::MIN && b == -1 {
        return Err(TrapKind::Overflow);
    }
    Ok(a % b)
}

fn udiv(a: i64, b: i64) -> Result<i64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(((a as u64) / (b as u64)) as i64)
}

fn urem(a: i64, b: i64) -> Result<i64, TrapKind> {
    if b == 0 {
        return Err(TrapKind::DivideByZero);
    }
    Ok(((a as u64) % (b as u64)) as i64)
}

/// Evaluate a two-operand instruction over constant operands.
///
/// Returns `None` when the opcode is not a binary value operation or an
/// operand is not a constant of the expected kind.
pub fn eval_binary(op: Opcode, lhs: &Value, rhs: &Value) -> Option<Result<Value, TrapKind>> {
    use Opcode::*;

    // Shift amounts are masked to the 0..=63 range.
    let result = match op {
        Add => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a.wrapping_add(b)))
        }
        Sub => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a.wrapping_sub(b)))
        }
        Mul => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a.wrapping_mul(b)))
        }
        SDiv => {
            let (a, b) = int_pair(lhs, rhs)?;
            sdiv(a, b).map(Value::const_int)
        }
        UDiv => {
            let (a, b) = int_pair(lhs, rhs)?;
            udiv(a, b).map(Value::const_int)
        }
        SRem => {
            let (a, b) = int_pair(lhs, rhs)?;
            srem(a, b).map(Value::const_int)
        }
        URem => {
            let (a, b) = int_pair(lhs, rhs)?;
            urem(a, b).map(Value::const_int)
        }
        IAddOvf => {
            let (a, b) = int_pair(lhs, rhs)?;
            a.checked_add(b).map(Value::const_int).ok_or(TrapKind::Overflow)
        }
        ISubOvf => {
            let (a, b) = int_pair(lhs, rhs)?;
            a.checked_sub(b).map(Value::const_int).ok_or(TrapKind::Overflow)
        }
        IMulOvf => {
            let (a, b) = int_pair(lhs, rhs)?;
            a.checked_mul(b).map(Value::const_int).ok_or(TrapKind::Overflow)
        }
        And => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a & b))
        }
        Or => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a | b))
        }
        Xor => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a ^ b))
        }
        Shl => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a.wrapping_shl((b & 63) as u32)))
        }
        LShr => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(((a as u64) >> (b & 63)) as i64))
        }
        AShr => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_int(a >> (b & 63)))
        }
        ICmpEq => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool(a == b))
        }
        ICmpNe => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool(a != b))
        }
        SCmpLt => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool(a < b))
        }
        SCmpLe => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool(a <= b))
        }
        SCmpGt => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool(a > b))
        }
        SCmpGe => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool(a >= b))
        }
        UCmpLt => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool((a as u64) < (b as u64)))
        }
        UCmpLe => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool((a as u64) <= (b as u64)))
        }
        UCmpGt => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool((a as u64) > (b as u64)))
        }
        UCmpGe => {
            let (a, b) = int_pair(lhs, rhs)?;
            Ok(Value::const_bool((a as u64) >= (b as u64)))
        }
        FAdd => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_float(a + b))
        }
        FSub => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_float(a - b))
        }
        FMul => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_float(a * b))
        }
        FDiv => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_float(a / b))
        }
        FCmpEq => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_bool(a == b))
        }
        FCmpNe => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_bool(a != b))
        }
        FCmpLt => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_bool(a < b))
        }
        FCmpLe => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_bool(a <= b))
        }
        FCmpGt => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_bool(a > b))
        }
        FCmpGe => {
            let (a, b) = float_pair(lhs, rhs)?;
            Ok(Value::const_bool(a >= b))
        }
        _ => return None,
    };
    Some(result)
}

/// Evaluate a one-operand cast over a constant operand.
pub fn eval_unary(op: Opcode, operand: &Value) -> Option<Result<Value, TrapKind>> {
    let result = match op {
        Opcode::Sitofp => {
            let v = operand.as_const_int()?;
            Ok(Value::const_float(v as f64))
        }
        Opcode::Fptosi => {
            let f = operand.as_const_float()?;
            fp_to_int(f.trunc()).map(Value::const_int)
        }
        Opcode::Zext1 => {
            let v = operand.as_const_int()?;
            Ok(Value::const_int((v != 0) as i64))
        }
        Opcode::Trunc1 => {
            let v = operand.as_const_int()?;
            Ok(Value::const_bool(v != 0))
        }
        _ => return None,
    };
    Some(result)
}

fn fp_to_int(t: f64) -> Result<i64, TrapKind> {
    // Exact i64 range check; 2^63 as f64 is exact, so `< 9.22e18` is sound.
    if t.is_nan() || t < -(2f64.powi(63)) || t >= 2f64.powi(63) {
        return Err(TrapKind::InvalidCast);
    }
    Ok(t as i64)
}

fn narrow_range(ty: Type, signed: bool) -> Option<(i64, i64)> {
    match (ty, signed) {
        (Type::I32, true) => Some((i32::MIN as i64, i32::MAX as i64)),
        (Type::I32, false) => Some((0, u32::MAX as i64)),
        (Type::I64, true) => Some((i64::MIN, i64::MAX)),
        (Type::I64, false) => Some((0, i64::MAX)),
        _ => None,
    }
}

/// Evaluate a check opcode over constant operands.
///
/// Checks trap on invalid input and otherwise pass their value through:
/// `idx.chk v, lo, hi` yields `v`, the `*.chk0` family yields the quotient or
/// remainder, the cast checks yield the converted value.
pub fn eval_check(op: Opcode, ty: Type, operands: &[Value]) -> Option<Result<Value, TrapKind>> {
    use Opcode::*;
    let result = match op {
        IdxChk => {
            let v = operands.first()?.as_const_int()?;
            let lo = operands.get(1)?.as_const_int()?;
            let hi = operands.get(2)?.as_const_int()?;
            if v < lo || v > hi {
                Err(TrapKind::Bounds)
            } else {
                Ok(Value::const_int(v))
            }
        }
        SDivChk0 => {
            let (a, b) = int_pair(operands.first()?, operands.get(1)?)?;
            sdiv(a, b).map(Value::const_int)
        }
        UDivChk0 => {
            let (a, b) = int_pair(operands.first()?, operands.get(1)?)?;
            udiv(a, b).map(Value::const_int)
        }
        SRemChk0 => {
            let (a, b) = int_pair(operands.first()?, operands.get(1)?)?;
            srem(a, b).map(Value::const_int)
        }
        URemChk0 => {
            let (a, b) = int_pair(operands.first()?, operands.get(1)?)?;
            urem(a, b).map(Value::const_int)
        }
        CastSiNarrowChk => {
            let v = operands.first()?.as_const_int()?;
            let (lo, hi) = narrow_range(ty, true)?;
            if v < lo || v > hi {
                Err(TrapKind::InvalidCast)
            } else {
                Ok(Value::const_int(v))
            }
        }
        CastUiNarrowChk => {
            let v = operands.first()?.as_const_int()?;
            let (lo, hi) = narrow_range(ty, false)?;
            if v < lo || v > hi {
                Err(TrapKind::InvalidCast)
            } else {
                Ok(Value::const_int(v))
            }
        }
        CastFpToSiRteChk => {
            let f = operands.first()?.as_const_float()?;
            let rounded = round_ties_even(f);
            match fp_to_int(rounded) {
                Ok(v) => {
                    let (lo, hi) = narrow_range(ty, true)?;
                    if v < lo || v > hi {
                        Err(TrapKind::InvalidCast)
                    } else {
                        Ok(Value::const_int(v))
                    }
                }
                Err(trap) => Err(trap),
            }
        }
        CastFpToUiRteChk => {
            let f = operands.first()?.as_const_float()?;
            let rounded = round_ties_even(f);
            match fp_to_int(rounded) {
                Ok(v) => {
                    let (lo, hi) = narrow_range(ty, false)?;
                    if v < lo || v > hi {
                        Err(TrapKind::InvalidCast)
                    } else {
                        Ok(Value::const_int(v))
                    }
                }
                Err(trap) => Err(trap),
            }
        }
        _ => return None,
    };
    Some(result)
}

fn round_ties_even(f: f64) -> f64 {
    let rounded = f.round();
    if (f - f.trunc()).abs() == 0.5 {
        // Halfway case: round to the even neighbour.
        let down = f.floor();
        let up = f.ceil();
        if (down / 2.0).fract() == 0.0 {
            down
        } else {
            up
        }
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_and_trapping_arithmetic() {
        let max = Value::const_int(i64::MAX);
        let one = Value::const_int(1);
        assert_eq!(
            eval_binary(Opcode::Add, &max, &one),
            Some(Ok(Value::const_int(i64::MIN)))
        );
        assert_eq!(
            eval_binary(Opcode::IAddOvf, &max, &one),
            Some(Err(TrapKind::Overflow))
        );
        assert_eq!(
            eval_binary(Opcode::SDiv, &one, &Value::const_int(0)),
            Some(Err(TrapKind::DivideByZero))
        );
        assert_eq!(
            eval_binary(Opcode::SDiv, &Value::const_int(i64::MIN), &Value::const_int(-1)),
            Some(Err(TrapKind::Overflow))
        );
    }

    #[test]
    fn shifts_mask_their_amount() {
        let v = Value::const_int(1);
        assert_eq!(
            eval_binary(Opcode::Shl, &v, &Value::const_int(64)),
            Some(Ok(Value::const_int(1)))
        );
        assert_eq!(
            eval_binary(Opcode::AShr, &Value::const_int(-8), &Value::const_int(1)),
            Some(Ok(Value::const_int(-4)))
        );
    }

    #[test]
    fn compares_yield_bool_constants() {
        assert_eq!(
            eval_binary(Opcode::SCmpLt, &Value::const_int(-1), &Value::const_int(0)),
            Some(Ok(Value::const_bool(true)))
        );
        assert_eq!(
            eval_binary(Opcode::UCmpLt, &Value::const_int(-1), &Value::const_int(0)),
            Some(Ok(Value::const_bool(false)))
        );
    }

    #[test]
    fn non_constant_operands_do_not_evaluate() {
        assert_eq!(eval_binary(Opcode::Add, &Value::temp(0), &Value::const_int(1)), None);
    }

    #[test]
    fn checks_pass_value_through_or_trap() {
        let args = [Value::const_int(5), Value::const_int(0), Value::const_int(10)];
        assert_eq!(
            eval_check(Opcode::IdxChk, Type::I32, &args),
            Some(Ok(Value::const_int(5)))
        );
        let out = [Value::const_int(11), Value::const_int(0), Value::const_int(10)];
        assert_eq!(
            eval_check(Opcode::IdxChk, Type::I32, &out),
            Some(Err(TrapKind::Bounds))
        );
        assert_eq!(
            eval_check(
                Opcode::SDivChk0,
                Type::I64,
                &[Value::const_int(7), Value::const_int(0)]
            ),
            Some(Err(TrapKind::DivideByZero))
        );
    }

    #[test]
    fn fptosi_traps_out_of_range() {
        assert_eq!(
            eval_unary(Opcode::Fptosi, &Value::const_float(1e30)),
            Some(Err(TrapKind::InvalidCast))
        );
        assert_eq!(
            eval_unary(Opcode::Fptosi, &Value::const_float(-2.7)),
            Some(Ok(Value::const_int(-2)))
        );
    }
}
