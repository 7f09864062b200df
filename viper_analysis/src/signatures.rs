//! Runtime-library signature oracle
//!
//! The optimizer consumes runtime signatures read-only: alias analysis asks
//! whether a named runtime helper is pure or readonly when classifying call
//! effects. The production table is static; tests inject mocks through the
//! trait.

/// Memory-effect summary of one runtime function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// No memory access and no observable side effects.
    pub pure_fn: bool,
    /// Reads memory but never writes it.
    pub readonly: bool,
}

/// Read-only oracle mapping runtime function names to their signatures.
pub trait RuntimeSignatures {
    fn lookup(&self, name: &str) -> Option<Signature>;
}

/// Production table of runtime helpers linked by lowered programs.
pub struct StaticSignatures;

const PURE: Signature = Signature { pure_fn: true, readonly: false };
const READONLY: Signature = Signature { pure_fn: false, readonly: true };
const EFFECTFUL: Signature = Signature { pure_fn: false, readonly: false };

static RUNTIME_TABLE: &[(&str, Signature)] = &[
    ("rt_abs_i64", PURE),
    ("rt_abs_f64", PURE),
    ("rt_sqrt", PURE),
    ("rt_pow", PURE),
    ("rt_floor", PURE),
    ("rt_ceil", PURE),
    ("rt_sin", PURE),
    ("rt_cos", PURE),
    ("rt_str_len", READONLY),
    ("rt_str_eq", READONLY),
    ("rt_str_cmp", READONLY),
    ("rt_str_concat", READONLY),
    ("rt_str_substr", READONLY),
    ("rt_to_str_i64", PURE),
    ("rt_to_str_f64", PURE),
    ("rt_print_str", EFFECTFUL),
    ("rt_print_i64", EFFECTFUL),
    ("rt_print_f64", EFFECTFUL),
    ("rt_input_line", EFFECTFUL),
    ("rt_rand", EFFECTFUL),
    ("rt_alloc", EFFECTFUL),
    ("rt_free", EFFECTFUL),
];

impl RuntimeSignatures for StaticSignatures {
    fn lookup(&self, name: &str) -> Option<Signature> {
        RUNTIME_TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, sig)| *sig)
    }
}

/// The default production registry.
pub fn default_signatures() -> &'static (dyn RuntimeSignatures + Sync) {
    static INSTANCE: StaticSignatures = StaticSignatures;
    &INSTANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_classifies_known_helpers() {
        let sigs = default_signatures();
        assert_eq!(sigs.lookup("rt_sqrt"), Some(PURE));
        assert_eq!(sigs.lookup("rt_str_len"), Some(READONLY));
        assert_eq!(sigs.lookup("rt_print_str"), Some(EFFECTFUL));
        assert_eq!(sigs.lookup("no_such_helper"), None);
    }
}
