use refine_smt::{Context, Model, SatResult, Solver, SolverConfig, Term};
use tracing::debug;

use crate::errors::VerifyError;

/// Where an enumeration of typings stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingStatus {
    /// The constraint has no solution at all.
    Unsat,
    /// The current typing is the only one.
    SingleSolution,
    /// The current typing is one of several.
    MultipleSolutions,
    /// Every typing has been visited.
    Exhausted,
}

/// Enumerates the distinct solutions of a typing constraint.
///
/// `s` holds the constraint plus a blocking clause for every typing already
/// visited; `sneg` holds only the constraint and answers whether a second
/// solution exists.
pub struct TypingAssignments {
    ctx: Context,
    s: Solver,
    sneg: Solver,
    current: Option<Model>,
    status: TypingStatus,
    visited: usize,
}

impl std::fmt::Debug for TypingAssignments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingAssignments")
            .field("status", &self.status)
            .field("current", &self.current)
            .field("visited", &self.visited)
            .finish()
    }
}

impl TypingAssignments {
    pub fn new(constraint: &Term, config: &SolverConfig) -> Result<Self, VerifyError> {
        let ctx = constraint.context();
        let mut s = Solver::new(config)?;
        let mut sneg = Solver::new(config)?;

        if constraint.is_true() {
            return Ok(Self {
                ctx,
                s,
                sneg,
                current: Some(Model::new()),
                status: TypingStatus::SingleSolution,
                visited: 1,
            });
        }

        s.assert(constraint)?;
        sneg.assert(constraint)?;
        let mut ty = Self {
            ctx,
            s,
            sneg,
            current: None,
            status: TypingStatus::Unsat,
            visited: 0,
        };
        if let Some(model) = ty.next_solution()? {
            let single = ty.is_only_solution(&model)?;
            ty.status = if single {
                TypingStatus::SingleSolution
            } else {
                TypingStatus::MultipleSolutions
            };
            ty.current = Some(model);
            ty.visited = 1;
        }
        debug!(status = ?ty.status, "typing constraint decided");
        Ok(ty)
    }

    pub fn status(&self) -> TypingStatus {
        self.status
    }

    /// True while there is a current typing to verify under.
    pub fn has_typing(&self) -> bool {
        matches!(
            self.status,
            TypingStatus::SingleSolution | TypingStatus::MultipleSolutions
        )
    }

    pub fn is_unsat(&self) -> bool {
        self.status == TypingStatus::Unsat
    }

    pub fn has_single_typing(&self) -> bool {
        self.status == TypingStatus::SingleSolution
    }

    /// The current typing: an assignment to the type-selector variables.
    pub fn model(&self) -> Option<&Model> {
        self.current.as_ref().filter(|_| self.has_typing())
    }

    /// Number of typings visited so far.
    pub fn visited(&self) -> usize {
        self.visited
    }

    /// Block the current typing and move to the next one, or to `Exhausted`.
    pub fn advance(&mut self) -> Result<(), VerifyError> {
        if !self.has_typing() {
            return Ok(());
        }
        if self.status == TypingStatus::SingleSolution {
            self.status = TypingStatus::Exhausted;
            self.current = None;
            return Ok(());
        }
        if let Some(prev) = self.current.take() {
            self.s.block(&prev, &self.ctx)?;
        }
        match self.next_solution()? {
            Some(model) => {
                debug!(visited = self.visited, typing = %model, "next typing");
                self.current = Some(model);
                self.visited += 1;
            }
            None => self.status = TypingStatus::Exhausted,
        }
        Ok(())
    }

    fn next_solution(&mut self) -> Result<Option<Model>, VerifyError> {
        match self.s.check()? {
            SatResult::Sat(m) => Ok(Some(m)),
            SatResult::Unsat => Ok(None),
            SatResult::Unknown(reason) => Err(VerifyError::Inconclusive(format!(
                "typing enumeration: {reason}"
            ))),
        }
    }

    fn is_only_solution(&mut self, model: &Model) -> Result<bool, VerifyError> {
        let mut scope = self.sneg.scope();
        scope.block(model, &self.ctx)?;
        match scope.check()? {
            SatResult::Unsat => Ok(true),
            SatResult::Sat(_) => Ok(false),
            SatResult::Unknown(reason) => Err(VerifyError::Inconclusive(format!(
                "typing uniqueness: {reason}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(constraint: &Term) -> (Vec<Model>, bool) {
        let mut ty = TypingAssignments::new(constraint, &SolverConfig::default()).unwrap();
        let single = ty.has_single_typing();
        let mut seen = Vec::new();
        while ty.has_typing() {
            seen.push(ty.model().cloned().unwrap());
            ty.advance().unwrap();
        }
        assert_eq!(ty.visited(), seen.len());
        (seen, single)
    }

    #[test]
    fn visits_each_solution_exactly_once() {
        let ctx = Context::new();
        let a = ctx.mk_bool_var("a");
        let b = ctx.mk_bool_var("b");
        let cases = [
            (&a & &!&a, 0),
            (&a & &b, 1),
            (&a ^ &b, 2),
            (&a | &b, 3),
        ];
        for (constraint, k) in cases {
            let (seen, single) = collect(&constraint);
            assert_eq!(seen.len(), k, "{constraint}");
            assert_eq!(single, k == 1, "{constraint}");
            for (i, m) in seen.iter().enumerate() {
                assert_eq!(m.get_bool(&constraint), Some(true));
                assert!(seen[..i].iter().all(|prev| prev != m), "revisited {m}");
            }
        }
    }

    #[test]
    fn contradiction_is_unsat_immediately() {
        let ctx = Context::new();
        let x = ctx.mk_bool_var("x");
        let ty = TypingAssignments::new(&(&x & &!&x), &SolverConfig::default()).unwrap();
        assert!(ty.is_unsat());
        assert!(!ty.has_typing());
        assert!(ty.model().is_none());
    }

    #[test]
    fn trivial_constraint_has_one_empty_typing() {
        let ctx = Context::new();
        let mut ty = TypingAssignments::new(&ctx.mk_true(), &SolverConfig::default()).unwrap();
        assert_eq!(ty.status(), TypingStatus::SingleSolution);
        assert!(ty.model().is_some_and(Model::is_empty));
        ty.advance().unwrap();
        assert_eq!(ty.status(), TypingStatus::Exhausted);
        assert!(ty.model().is_none());
    }

    #[test]
    fn width_selector_typings() {
        let ctx = Context::new();
        let w = ctx.mk_var("ty_w", 8);
        let c = w.equal(&ctx.mk_uint(8, 8)) | w.equal(&ctx.mk_uint(16, 8));
        let (seen, single) = collect(&c);
        assert!(!single);
        let widths: Vec<u64> = seen.iter().filter_map(|m| m.get_uint(&w)).collect();
        assert_eq!(widths, vec![8, 16]);
    }

    #[test]
    fn unknown_is_inconclusive() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 32);
        let cfg = SolverConfig {
            max_enum_bits: 8,
            ..SolverConfig::default()
        };
        let err = TypingAssignments::new(&x.ugt(&ctx.mk_uint(3, 32)), &cfg).unwrap_err();
        assert!(matches!(err, VerifyError::Inconclusive(_)));
    }
}
