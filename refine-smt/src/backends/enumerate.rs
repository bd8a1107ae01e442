use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use num_bigint::BigUint;
use num_traits::One;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::SolverConfig;
use crate::error::SmtError;
use crate::eval::Value;
use crate::model::{EvalError, Evaluator, MAX_QUANTIFIER_BITS, Model};
use crate::solver::{Backend, SatResult};
use crate::term::Term;

/// Decides formulas by trying every assignment of their free variables.
///
/// Complete for small search spaces and always available; answers `Unknown`
/// once the free variables span more than `max_enum_bits` bits or the
/// timeout elapses. Universal quantifiers are expanded the same way.
pub struct EnumerationBackend {
    scopes: Vec<Vec<Term>>,
    max_bits: u32,
    timeout: Option<Duration>,
}

impl EnumerationBackend {
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            scopes: vec![Vec::new()],
            max_bits: config.max_enum_bits,
            timeout: config.timeout(),
        }
    }

    fn assertions(&self) -> impl Iterator<Item = &Term> {
        self.scopes.iter().flatten()
    }
}

impl Backend for EnumerationBackend {
    fn name(&self) -> &'static str {
        "enumerate"
    }

    fn push(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    fn assert(&mut self, term: &Term) -> Result<(), SmtError> {
        if let Some(top) = self.scopes.last_mut() {
            top.push(term.clone());
        }
        Ok(())
    }

    fn check(&mut self) -> Result<SatResult, SmtError> {
        if self.assertions().any(Term::is_false) {
            return Ok(SatResult::Unsat);
        }
        let pending: Vec<&Term> = self.assertions().filter(|t| !t.is_true()).collect();
        let vars: BTreeSet<Term> = pending.iter().flat_map(|t| t.free_vars()).collect();
        let total: u32 = vars.iter().map(|v| v.sort().bit_len()).sum();
        if total > self.max_bits {
            return Ok(SatResult::Unknown(format!(
                "search space of {total} bits exceeds the limit of {}",
                self.max_bits
            )));
        }
        debug!(vars = vars.len(), bits = total, assertions = pending.len(), "enumerating");

        let deadline = self.timeout.map(|d| Instant::now() + d);
        let mut ev = Evaluator::new(FxHashMap::default(), MAX_QUANTIFIER_BITS, deadline);
        let end = BigUint::one() << total;
        let mut raw = BigUint::default();
        while raw < end {
            let mut offset = 0;
            for v in &vars {
                let sort = v.sort();
                ev.set(v.clone(), Value::from_bits(sort, &(&raw >> offset)));
                offset += sort.bit_len();
            }

            let mut memo = FxHashMap::default();
            let mut all_hold = true;
            for t in &pending {
                match ev.eval(t, &mut memo) {
                    Ok(v) if v.as_bool() => {}
                    Ok(_) => {
                        all_hold = false;
                        break;
                    }
                    Err(EvalError::Timeout) => return Ok(SatResult::Unknown("timeout".into())),
                    Err(e) => return Ok(SatResult::Unknown(e.to_string())),
                }
            }
            if all_hold {
                let env: FxHashMap<Term, Value> = vars
                    .iter()
                    .filter_map(|v| Some((v.clone(), ev.env().get(v)?.clone())))
                    .collect();
                return Ok(SatResult::Sat(Model::from_env(&env)));
            }
            raw += 1u32;
        }
        Ok(SatResult::Unsat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Solver};

    fn solver(max_bits: u32) -> Solver {
        let cfg = SolverConfig {
            max_enum_bits: max_bits,
            ..SolverConfig::default()
        };
        Solver::with_backend(Box::new(EnumerationBackend::new(&cfg)))
    }

    #[test]
    fn finds_a_model_for_linear_constraint() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 8);
        let mut s = solver(16);
        s.assert(&(&x + &ctx.mk_uint(3, 8)).equal(&ctx.mk_uint(10, 8))).unwrap();
        let res = s.check().unwrap();
        assert_eq!(res.model().and_then(|m| m.get_uint(&x)), Some(7));
    }

    #[test]
    fn scoped_assertions_are_retracted() {
        let ctx = Context::new();
        let p = ctx.mk_bool_var("p");
        let mut s = solver(16);
        s.assert(&p).unwrap();
        {
            let mut inner = s.scope();
            inner.assert(&!&p).unwrap();
            assert!(inner.check().unwrap().is_unsat());
        }
        assert!(s.check().unwrap().is_sat());
    }

    #[test]
    fn large_search_space_is_unknown() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 32);
        let mut s = solver(16);
        s.assert(&x.ugt(&ctx.mk_uint(5, 32))).unwrap();
        assert!(s.check().unwrap().is_unknown());
    }

    #[test]
    fn deadline_interrupts_an_exhaustive_search() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 24);
        let cfg = SolverConfig {
            timeout_ms: 1,
            max_enum_bits: 24,
            ..SolverConfig::default()
        };
        let mut s = Solver::with_backend(Box::new(EnumerationBackend::new(&cfg)));
        // 2 is not a square mod 2^24, so without the deadline every value is tried.
        s.assert(&(&x * &x).equal(&ctx.mk_uint(2, 24))).unwrap();
        let res = s.check().unwrap();
        assert!(res.is_unknown());
        assert!(matches!(res, SatResult::Unknown(ref why) if why == "timeout"));
    }

    #[test]
    fn universally_quantified_formula() {
        let ctx = Context::new();
        let k = ctx.mk_var("k", 4);
        let u = ctx.mk_var("u", 4);
        // exists k. forall u. (u & k) == 0  -> only k = 0
        let mut s = solver(16);
        s.assert(&Term::forall(&[u.clone()], &(&u & &k).equal(&ctx.mk_uint(0, 4))))
            .unwrap();
        let res = s.check().unwrap();
        let m = res.model().expect("sat");
        assert_eq!(m.get_uint(&k), Some(0));
        assert!(m.get(&u).is_none());
    }

    #[test]
    fn model_assigns_every_free_variable() {
        let ctx = Context::new();
        let a = ctx.mk_bool_var("a");
        let b = ctx.mk_bool_var("b");
        let mut s = solver(16);
        s.assert(&(&a | &b)).unwrap();
        let res = s.check().unwrap();
        let m = res.model().expect("sat");
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_bool(&(&a | &b)), Some(true));
    }
}
