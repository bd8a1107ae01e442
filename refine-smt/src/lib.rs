#![forbid(unsafe_code)]

//! Symbolic terms and solver sessions for refinement checking.
//!
//! [`Term`]s are immutable, hash-consed boolean and bit-vector expressions owned
//! by a [`Context`]. A [`Solver`] decides satisfiability of asserted terms
//! through a pluggable [`Backend`]: the built-in exhaustive
//! [`EnumerationBackend`], or Z3 when built with `--features z3`.

pub mod backends;
pub mod config;
pub mod error;
mod eval;
pub mod model;
pub mod solver;
pub mod sort;
pub mod term;

pub use backends::EnumerationBackend;
#[cfg(feature = "z3")]
pub use backends::Z3Backend;
pub use config::{BackendKind, SmtProfile, SolverConfig};
pub use error::SmtError;
pub use model::Model;
pub use solver::{Backend, Query, SatResult, Solver, SolverScope};
pub use sort::Sort;
pub use term::{Context, Term};
