//! SSA values and constants

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// An operand of an IL instruction.
///
/// Equality and hashing are by payload, not identity: two `ConstFloat`s
/// compare equal when their bit patterns match, which keeps NaN payloads
/// stable inside CSE hash tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Reference to an SSA temporary by dense id.
    Temp(u32),
    /// Integer constant; `is_bool` marks `i1` literals.
    ConstInt { value: i64, is_bool: bool },
    /// Floating-point constant.
    ConstFloat(f64),
    /// String literal.
    ConstStr(String),
    /// Address of a named global.
    GlobalAddr(String),
    /// The null pointer.
    NullPtr,
}

impl Value {
    pub fn temp(id: u32) -> Self {
        Value::Temp(id)
    }

    pub fn const_int(value: i64) -> Self {
        Value::ConstInt { value, is_bool: false }
    }

    pub fn const_bool(value: bool) -> Self {
        Value::ConstInt { value: value as i64, is_bool: true }
    }

    pub fn const_float(value: f64) -> Self {
        Value::ConstFloat(value)
    }

    pub fn const_str(value: impl Into<String>) -> Self {
        Value::ConstStr(value.into())
    }

    pub fn global_addr(name: impl Into<String>) -> Self {
        Value::GlobalAddr(name.into())
    }

    pub fn null_ptr() -> Self {
        Value::NullPtr
    }

    /// Temp id when this value references an SSA temporary.
    pub fn as_temp(&self) -> Option<u32> {
        match self {
            Value::Temp(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Value::ConstInt { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_const_float(&self) -> Option<f64> {
        match self {
            Value::ConstFloat(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        !matches!(self, Value::Temp(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Temp(a), Value::Temp(b)) => a == b,
            (
                Value::ConstInt { value: a, is_bool: ab },
                Value::ConstInt { value: b, is_bool: bb },
            ) => a == b && ab == bb,
            (Value::ConstFloat(a), Value::ConstFloat(b)) => a.to_bits() == b.to_bits(),
            (Value::ConstStr(a), Value::ConstStr(b)) => a == b,
            (Value::GlobalAddr(a), Value::GlobalAddr(b)) => a == b,
            (Value::NullPtr, Value::NullPtr) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Temp(id) => id.hash(state),
            Value::ConstInt { value, is_bool } => {
                value.hash(state);
                is_bool.hash(state);
            }
            Value::ConstFloat(f) => f.to_bits().hash(state),
            Value::ConstStr(s) | Value::GlobalAddr(s) => s.hash(state),
            Value::NullPtr => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Temp(id) => write!(f, "%t{id}"),
            Value::ConstInt { value, is_bool: false } => write!(f, "{value}"),
            Value::ConstInt { value, is_bool: true } => {
                write!(f, "{}", if *value != 0 { "true" } else { "false" })
            }
            Value::ConstFloat(v) => write!(f, "{v}"),
            Value::ConstStr(s) => write!(f, "{s:?}"),
            Value::GlobalAddr(name) => write!(f, "@{name}"),
            Value::NullPtr => write!(f, "null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn float_values_compare_by_bits() {
        let nan1 = Value::const_float(f64::NAN);
        let nan2 = Value::const_float(f64::NAN);
        assert_eq!(nan1, nan2);
        assert_eq!(hash_of(&nan1), hash_of(&nan2));

        let pos = Value::const_float(0.0);
        let neg = Value::const_float(-0.0);
        assert_ne!(pos, neg);
    }

    #[test]
    fn bool_and_int_literals_are_distinct() {
        assert_ne!(Value::const_int(1), Value::const_bool(true));
        assert_eq!(Value::const_bool(true), Value::const_bool(true));
    }
}
