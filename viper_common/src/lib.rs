//! Common utilities shared by every crate of the Viper optimizer core

pub mod diagnostics;
pub mod error;
pub mod loc;

pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{ViperError, ViperResult};
pub use loc::SourceLoc;
