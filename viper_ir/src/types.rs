//! IL type system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive IL types.
///
/// `Ptr` is an untyped byte pointer; the access width of a load or store comes
/// from the instruction's result/operand type, not from the pointer. `Str` is
/// an opaque runtime string handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    I1,
    I32,
    I64,
    F64,
    Ptr,
    Str,
}

impl Type {
    pub fn is_void(self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Type::I1 | Type::I32 | Type::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::F64)
    }

    /// Mnemonic used by the textual IL format.
    pub fn name(self) -> &'static str {
        match self {
            Type::Void => "void",
            Type::I1 => "i1",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F64 => "f64",
            Type::Ptr => "ptr",
            Type::Str => "str",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
