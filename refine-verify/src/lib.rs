#![forbid(unsafe_code)]

//! Refinement checking of source/target program pairs.
//!
//! A [`Transform`] pairs two [`Function`]s. [`TransformVerify`] enumerates the
//! typings both accept, executes each side into a [`State`] and asks the
//! solver for an input on which the target is less defined, more poisonous or
//! returns a different value than the source.

pub mod config;
pub mod errors;
pub mod ir;
pub mod printer;
pub mod state;
pub mod transform;
pub mod typing;

pub use config::VerifyConfig;
pub use errors::{Errors, VerifyError};
pub use ir::{Function, Predicate, Side, StateValue, Type, Value, ValueKind};
pub use printer::{DefaultPrinter, ModelPrinter, print_aggregate};
pub use state::State;
pub use transform::{
    Transform, TransformPrintOpts, TransformVerify, error, preprocess, verify_transforms,
};
pub use typing::{TypingAssignments, TypingStatus};
