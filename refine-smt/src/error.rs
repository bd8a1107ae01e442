use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SmtError {
    #[error("solver backend `{0}` is not available in this build")]
    #[diagnostic(
        code(refine::smt::backend_unavailable),
        help("rebuild with `--features refine-smt/z3`")
    )]
    BackendUnavailable(String),

    #[error("solver backend error: {0}")]
    #[diagnostic(code(refine::smt::backend))]
    Backend(String),

    #[error("invalid solver configuration: {0}")]
    #[diagnostic(code(refine::smt::config))]
    Config(String),
}
