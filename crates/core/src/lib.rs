//! # Warden Core
//!
//! Domain types, the error taxonomy, and command-line helpers for the Warden
//! input-validation and audit gateway. This crate has **no framework
//! dependencies**; the validator, executor, and gateway crates all depend
//! inward on it.

pub mod command;
pub mod error;
pub mod validation;

// Re-export key types at crate root for ergonomics
pub use command::{CommandPlan, SplitError};
pub use error::{Error, ErrorKind, GatewayError, Result};
pub use validation::{CallerContext, OperationKind, Outcome, ValidationRequest, ValidationResult};
