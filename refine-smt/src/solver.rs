use std::ops::{Deref, DerefMut};

use tracing::{debug, trace};

use crate::backends::EnumerationBackend;
use crate::config::{BackendKind, SolverConfig};
use crate::error::SmtError;
use crate::model::Model;
use crate::term::Term;

/// Result of a satisfiability check.
#[derive(Debug, Clone, PartialEq)]
pub enum SatResult {
    Sat(Model),
    Unsat,
    /// Timeout, resource limit, or incompleteness of the backend.
    Unknown(String),
}

impl SatResult {
    pub fn is_sat(&self) -> bool {
        matches!(self, SatResult::Sat(_))
    }

    pub fn is_unsat(&self) -> bool {
        matches!(self, SatResult::Unsat)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, SatResult::Unknown(_))
    }

    pub fn model(&self) -> Option<&Model> {
        match self {
            SatResult::Sat(m) => Some(m),
            _ => None,
        }
    }
}

/// Decision procedure behind a [`Solver`].
///
/// Any implementation is substitutable: the verifier only relies on
/// assert/push/pop/check. A `Sat` answer must carry a model that assigns every
/// free variable of the asserted terms.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn push(&mut self);

    fn pop(&mut self);

    fn assert(&mut self, term: &Term) -> Result<(), SmtError>;

    fn check(&mut self) -> Result<SatResult, SmtError>;
}

/// Incremental solver session with a scoped assertion stack.
pub struct Solver {
    backend: Box<dyn Backend>,
    depth: usize,
    checks: u64,
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("backend", &self.backend.name())
            .field("depth", &self.depth)
            .field("checks", &self.checks)
            .finish()
    }
}

impl Solver {
    pub fn new(config: &SolverConfig) -> Result<Self, SmtError> {
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Enumerate => Box::new(EnumerationBackend::new(config)),
            #[cfg(feature = "z3")]
            BackendKind::Z3 => Box::new(crate::backends::Z3Backend::new(config)),
            #[cfg(not(feature = "z3"))]
            BackendKind::Z3 => return Err(SmtError::BackendUnavailable("z3".to_string())),
        };
        Ok(Self::with_backend(backend))
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            depth: 0,
            checks: 0,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of `check` calls made on this session.
    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// Add a hard constraint to the current scope.
    ///
    /// # Panics
    /// If `term` is not boolean.
    pub fn assert(&mut self, term: &Term) -> Result<(), SmtError> {
        assert!(term.is_bool(), "asserting non-boolean term {term}");
        trace!(%term, depth = self.depth, "assert");
        self.backend.assert(term)
    }

    /// Open a scope; everything asserted through the guard is retracted when
    /// it is dropped, on every exit path.
    pub fn scope(&mut self) -> SolverScope<'_> {
        self.backend.push();
        self.depth += 1;
        SolverScope { solver: self }
    }

    pub fn check(&mut self) -> Result<SatResult, SmtError> {
        self.checks += 1;
        let res = self.backend.check()?;
        debug!(
            backend = self.backend.name(),
            depth = self.depth,
            result = match &res {
                SatResult::Sat(_) => "sat",
                SatResult::Unsat => "unsat",
                SatResult::Unknown(_) => "unknown",
            },
            "check"
        );
        Ok(res)
    }

    /// Rule out `model`: assert that at least one of its variables takes a
    /// different value. An empty model blocks everything.
    pub fn block(&mut self, model: &Model, ctx: &crate::Context) -> Result<(), SmtError> {
        self.assert(&!model.as_constraint(ctx))
    }

    /// Check each query in its own scope, in order. The first query that is not
    /// `Unsat` has its handler called with the result and stops the run.
    /// Returns `true` when every query was `Unsat`.
    pub fn check_queries<'q>(
        &mut self,
        queries: impl IntoIterator<Item = Query<'q>>,
    ) -> Result<bool, SmtError> {
        for q in queries {
            let mut scope = self.scope();
            scope.assert(&q.term)?;
            let res = scope.check()?;
            drop(scope);
            if !res.is_unsat() {
                (q.on_failure)(&res);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn pop(&mut self) {
        debug_assert!(self.depth > 0, "pop without a matching push");
        self.backend.pop();
        self.depth -= 1;
    }
}

/// A query for [`Solver::check_queries`] and what to do when it is not `Unsat`.
pub struct Query<'q> {
    pub term: Term,
    pub on_failure: Box<dyn FnOnce(&SatResult) + 'q>,
}

impl<'q> Query<'q> {
    pub fn new(term: Term, on_failure: impl FnOnce(&SatResult) + 'q) -> Self {
        Self {
            term,
            on_failure: Box::new(on_failure),
        }
    }
}

/// Guard for an open solver scope; pops it on drop.
pub struct SolverScope<'s> {
    solver: &'s mut Solver,
}

impl Deref for SolverScope<'_> {
    type Target = Solver;

    fn deref(&self) -> &Solver {
        self.solver
    }
}

impl DerefMut for SolverScope<'_> {
    fn deref_mut(&mut self) -> &mut Solver {
        self.solver
    }
}

impl Drop for SolverScope<'_> {
    fn drop(&mut self) {
        self.solver.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records the calls it receives and answers from a script.
    struct MockBackend {
        log: Rc<RefCell<Vec<String>>>,
        answers: Vec<SatResult>,
    }

    impl Backend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn push(&mut self) {
            self.log.borrow_mut().push("push".into());
        }

        fn pop(&mut self) {
            self.log.borrow_mut().push("pop".into());
        }

        fn assert(&mut self, term: &Term) -> Result<(), SmtError> {
            self.log.borrow_mut().push(format!("assert {term}"));
            Ok(())
        }

        fn check(&mut self) -> Result<SatResult, SmtError> {
            self.log.borrow_mut().push("check".into());
            if self.answers.is_empty() {
                return Err(SmtError::Backend("script exhausted".into()));
            }
            Ok(self.answers.remove(0))
        }
    }

    fn mock(answers: Vec<SatResult>) -> (Solver, Rc<RefCell<Vec<String>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let backend = MockBackend {
            log: Rc::clone(&log),
            answers,
        };
        (Solver::with_backend(Box::new(backend)), log)
    }

    #[test]
    fn scopes_pop_on_early_return() {
        let ctx = Context::new();
        let (mut solver, log) = mock(vec![]);
        let p = ctx.mk_bool_var("p");

        fn failing(solver: &mut Solver, p: &Term) -> Result<SatResult, SmtError> {
            let mut outer = solver.scope();
            outer.assert(p)?;
            let mut inner = outer.scope();
            inner.check()
        }

        assert!(failing(&mut solver, &p).is_err());
        assert_eq!(solver.depth(), 0);
        assert_eq!(
            *log.borrow(),
            vec!["push", "assert p", "push", "check", "pop", "pop"]
        );
    }

    #[test]
    fn check_queries_stops_at_first_non_unsat() {
        let ctx = Context::new();
        let (mut solver, log) = mock(vec![
            SatResult::Unsat,
            SatResult::Unknown("timeout".into()),
            SatResult::Unsat,
        ]);
        let seen = RefCell::new(Vec::new());
        let all_unsat = solver
            .check_queries(vec![
                Query::new(ctx.mk_bool_var("a"), |_| seen.borrow_mut().push("a")),
                Query::new(ctx.mk_bool_var("b"), |r| {
                    assert!(r.is_unknown());
                    seen.borrow_mut().push("b")
                }),
                Query::new(ctx.mk_bool_var("c"), |_| seen.borrow_mut().push("c")),
            ])
            .unwrap();
        assert!(!all_unsat);
        assert_eq!(*seen.borrow(), vec!["b"]);
        assert_eq!(solver.checks(), 2);
        assert_eq!(log.borrow().iter().filter(|l| *l == "pop").count(), 2);
    }

    #[test]
    #[should_panic(expected = "non-boolean")]
    fn asserting_a_bit_vector_panics() {
        let ctx = Context::new();
        let (mut solver, _) = mock(vec![]);
        let _ = solver.assert(&ctx.mk_var("x", 4));
    }

    #[cfg(not(feature = "z3"))]
    #[test]
    fn z3_backend_requires_the_feature() {
        let cfg = SolverConfig {
            backend: BackendKind::Z3,
            ..SolverConfig::default()
        };
        assert!(matches!(Solver::new(&cfg), Err(SmtError::BackendUnavailable(_))));
    }
}
