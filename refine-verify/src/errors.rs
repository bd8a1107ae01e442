use std::fmt;

use miette::Diagnostic;
use refine_smt::{Model, SmtError};
use thiserror::Error;

/// One failure record produced while verifying a transform.
#[derive(Debug, Error, Diagnostic)]
pub enum VerifyError {
    #[error("program doesn't type check")]
    #[diagnostic(
        code(refine::verify::type_inference),
        help("source and target have no common typing")
    )]
    TypeInference,

    /// A counterexample to refinement. `report` is the rendered message,
    /// input values and the diverging values.
    #[error("{report}")]
    #[diagnostic(code(refine::verify::refinement))]
    Refinement {
        message: String,
        /// Name of the value the divergence was localized to, if any.
        var: Option<String>,
        model: Model,
        report: String,
    },

    #[error("Source and target don't have the same return domain")]
    #[diagnostic(code(refine::verify::return_domain))]
    ReturnDomain,

    #[error("inconclusive: {0}")]
    #[diagnostic(
        code(refine::verify::inconclusive),
        help("raise the solver timeout or enumeration budget, or use the z3 backend")
    )]
    Inconclusive(String),

    #[error("symbolic execution failed: {0}")]
    #[diagnostic(code(refine::verify::execution))]
    Execution(String),

    #[error("invalid verifier configuration: {0}")]
    #[diagnostic(code(refine::verify::config))]
    Config(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Solver(#[from] SmtError),
}

impl VerifyError {
    /// Whether this record disproves the transform, as opposed to failing to
    /// decide it.
    pub fn is_unsound(&self) -> bool {
        matches!(self, VerifyError::Refinement { .. } | VerifyError::ReturnDomain)
    }
}

/// Ordered sink of failure records.
#[derive(Debug, Default)]
pub struct Errors {
    errs: Vec<VerifyError>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, err: VerifyError) {
        self.errs.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errs.len()
    }

    /// True when at least one record is a genuine counterexample.
    pub fn is_unsound(&self) -> bool {
        self.errs.iter().any(VerifyError::is_unsound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerifyError> {
        self.errs.iter()
    }
}

impl IntoIterator for Errors {
    type Item = VerifyError;
    type IntoIter = std::vec::IntoIter<VerifyError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errs.into_iter()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errs.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "ERROR: {e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_counterexamples_are_unsound() {
        let mut errs = Errors::new();
        assert!(errs.is_empty());
        errs.add(VerifyError::Inconclusive("timeout".into()));
        assert!(!errs.is_unsound());
        errs.add(VerifyError::ReturnDomain);
        assert!(errs.is_unsound());
        assert_eq!(errs.len(), 2);
        assert_eq!(
            errs.to_string(),
            "ERROR: inconclusive: timeout\n\nERROR: Source and target don't have the same return domain\n"
        );
    }

    #[test]
    fn solver_errors_keep_their_diagnostic_code() {
        let err = VerifyError::from(SmtError::Config("bad".into()));
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("refine::smt::config"));
    }
}
