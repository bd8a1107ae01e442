use std::collections::{BTreeSet, HashMap};

use num_bigint::BigUint;
use z3::ast::{Ast, BV, Bool, Dynamic};
use z3::{Config, Context as Z3Context, Params, SatResult as Z3SatResult};

use crate::config::SolverConfig;
use crate::error::SmtError;
use crate::model::Model;
use crate::solver::{Backend, SatResult};
use crate::sort::Sort;
use crate::term::{Op, Term};

thread_local! {
    // One Z3 context per thread, leaked so solvers can borrow it for 'static
    // without self-referential structs. Z3 contexts are not thread-safe, which
    // also makes this the unit of isolation between parallel verifications.
    static Z3_CTX: &'static Z3Context = {
        let mut cfg = Config::new();
        cfg.set_model_generation(true);
        Box::leak(Box::new(Z3Context::new(&cfg)))
    };
}

pub struct Z3Backend {
    ctx: &'static Z3Context,
    solver: z3::Solver<'static>,
    /// Translations, keyed by term. Entries made inside a scope are dropped
    /// when it is popped, so the memo does not keep dead terms alive.
    memo: HashMap<Term, Dynamic<'static>>,
    memo_order: Vec<Term>,
    memo_marks: Vec<usize>,
    /// Asserted terms per scope, to know which variables a model must cover.
    scopes: Vec<Vec<Term>>,
}

impl Z3Backend {
    pub fn new(config: &SolverConfig) -> Self {
        let ctx = Z3_CTX.with(|c| *c);
        let solver = z3::Solver::new(ctx);
        if let Some(timeout) = config.timeout() {
            let mut params = Params::new(ctx);
            let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            params.set_u32("timeout", ms);
            solver.set_params(&params);
        }
        Self {
            ctx,
            solver,
            memo: HashMap::new(),
            memo_order: Vec::new(),
            memo_marks: Vec::new(),
            scopes: vec![Vec::new()],
        }
    }

    fn translate(&mut self, root: &Term) -> Result<Dynamic<'static>, SmtError> {
        // (term, operands already scheduled)
        let mut stack = vec![(root.clone(), false)];
        while let Some((t, expanded)) = stack.pop() {
            if self.memo.contains_key(&t) {
                continue;
            }
            if !expanded && !t.args().is_empty() {
                stack.push((t.clone(), true));
                let memo = &self.memo;
                stack.extend(
                    t.args()
                        .iter()
                        .filter(|a| !memo.contains_key(*a))
                        .map(|a| (a.clone(), false)),
                );
                continue;
            }
            let out = self.translate_node(&t)?;
            self.memo_order.push(t.clone());
            self.memo.insert(t, out);
        }
        self.memo
            .get(root)
            .cloned()
            .ok_or_else(|| SmtError::Backend(format!("no translation for {root}")))
    }

    /// Translate one node whose operands are already in the memo.
    fn translate_node(&self, t: &Term) -> Result<Dynamic<'static>, SmtError> {
        let ctx = self.ctx;
        let args = t
            .args()
            .iter()
            .map(|a| {
                self.memo
                    .get(a)
                    .cloned()
                    .ok_or_else(|| SmtError::Backend(format!("operand {a} translated out of order")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let bv = |i: usize| -> Result<BV<'static>, SmtError> {
            args[i]
                .as_bv()
                .ok_or_else(|| SmtError::Backend(format!("expected bit-vector operand in {t}")))
        };
        let bool_ = |i: usize| -> Result<Bool<'static>, SmtError> {
            args[i]
                .as_bool()
                .ok_or_else(|| SmtError::Backend(format!("expected boolean operand in {t}")))
        };

        let out = match t.op() {
            Op::BoolConst(b) => Dynamic::from_ast(&Bool::from_bool(ctx, *b)),
            Op::BvConst(v) => Dynamic::from_ast(&bv_const(ctx, v, t.bits())),
            Op::Var(name) => match t.sort() {
                Sort::Bool => Dynamic::from_ast(&Bool::new_const(ctx, name.as_ref())),
                Sort::BitVec(w) => Dynamic::from_ast(&BV::new_const(ctx, name.as_ref(), w)),
            },
            Op::Forall => {
                let n = args.len() - 1;
                let bounds: Vec<&dyn Ast<'static>> =
                    args[..n].iter().map(|a| a as &dyn Ast<'static>).collect();
                let body = bool_(n)?;
                Dynamic::from_ast(&z3::ast::forall_const(ctx, &bounds, &[], &body))
            }
            Op::Not => Dynamic::from_ast(&bool_(0)?.not()),
            Op::And => Dynamic::from_ast(&Bool::and(ctx, &[&bool_(0)?, &bool_(1)?])),
            Op::Or => Dynamic::from_ast(&Bool::or(ctx, &[&bool_(0)?, &bool_(1)?])),
            Op::Xor => Dynamic::from_ast(&bool_(0)?.xor(&bool_(1)?)),
            Op::Eq => Dynamic::from_ast(&args[0]._eq(&args[1])),
            Op::Ite => bool_(0)?.ite(&args[1], &args[2]),
            Op::Neg => Dynamic::from_ast(&bv(0)?.bvneg()),
            Op::Add => Dynamic::from_ast(&bv(0)?.bvadd(&bv(1)?)),
            Op::Sub => Dynamic::from_ast(&bv(0)?.bvsub(&bv(1)?)),
            Op::Mul => Dynamic::from_ast(&bv(0)?.bvmul(&bv(1)?)),
            Op::Udiv => Dynamic::from_ast(&bv(0)?.bvudiv(&bv(1)?)),
            Op::Sdiv => Dynamic::from_ast(&bv(0)?.bvsdiv(&bv(1)?)),
            Op::Urem => Dynamic::from_ast(&bv(0)?.bvurem(&bv(1)?)),
            Op::Srem => Dynamic::from_ast(&bv(0)?.bvsrem(&bv(1)?)),
            Op::BvNot => Dynamic::from_ast(&bv(0)?.bvnot()),
            Op::BvAnd => Dynamic::from_ast(&bv(0)?.bvand(&bv(1)?)),
            Op::BvOr => Dynamic::from_ast(&bv(0)?.bvor(&bv(1)?)),
            Op::BvXor => Dynamic::from_ast(&bv(0)?.bvxor(&bv(1)?)),
            Op::Shl => Dynamic::from_ast(&bv(0)?.bvshl(&bv(1)?)),
            Op::Lshr => Dynamic::from_ast(&bv(0)?.bvlshr(&bv(1)?)),
            Op::Ashr => Dynamic::from_ast(&bv(0)?.bvashr(&bv(1)?)),
            Op::Ult => Dynamic::from_ast(&bv(0)?.bvult(&bv(1)?)),
            Op::Ule => Dynamic::from_ast(&bv(0)?.bvule(&bv(1)?)),
            Op::Slt => Dynamic::from_ast(&bv(0)?.bvslt(&bv(1)?)),
            Op::Sle => Dynamic::from_ast(&bv(0)?.bvsle(&bv(1)?)),
            Op::Concat => Dynamic::from_ast(&bv(0)?.concat(&bv(1)?)),
            Op::Extract { high, low } => Dynamic::from_ast(&bv(0)?.extract(*high, *low)),
            Op::ZeroExt(n) => Dynamic::from_ast(&bv(0)?.zero_ext(*n)),
            Op::SignExt(n) => Dynamic::from_ast(&bv(0)?.sign_ext(*n)),
        };
        Ok(out)
    }

    fn read_model(&mut self, z3_model: &z3::Model<'static>) -> Result<Model, SmtError> {
        let vars: BTreeSet<Term> = self.scopes.iter().flatten().flat_map(|t| t.free_vars()).collect();
        let mut model = Model::new();
        for var in vars {
            let ctx = var.context();
            let ast = self.translate(&var)?;
            let value = match var.sort() {
                Sort::Bool => {
                    let b = ast
                        .as_bool()
                        .and_then(|b| z3_model.eval(&b, true))
                        .and_then(|b| b.as_bool())
                        .ok_or_else(|| SmtError::Backend(format!("no model value for {var}")))?;
                    ctx.mk_bool(b)
                }
                Sort::BitVec(w) => {
                    let b = ast
                        .as_bv()
                        .ok_or_else(|| SmtError::Backend(format!("no model value for {var}")))?;
                    ctx.mk_uint_big(read_bv(z3_model, &b, w, &var)?, w)
                }
            };
            model.insert(var, value);
        }
        Ok(model)
    }
}

/// Constants wider than 64 bits are assembled from 64-bit chunks.
fn bv_const(ctx: &'static Z3Context, v: &BigUint, bits: u32) -> BV<'static> {
    let digits = v.to_u64_digits();
    let mut out: Option<BV<'static>> = None;
    let mut lo = 0;
    while lo < bits {
        let w = (bits - lo).min(64);
        let digit = digits.get((lo / 64) as usize).copied().unwrap_or(0);
        let chunk = BV::from_u64(ctx, digit, w);
        out = Some(match out {
            None => chunk,
            Some(low_part) => chunk.concat(&low_part),
        });
        lo += w;
    }
    out.unwrap_or_else(|| BV::from_u64(ctx, 0, bits))
}

fn read_bv(
    z3_model: &z3::Model<'static>,
    b: &BV<'static>,
    bits: u32,
    var: &Term,
) -> Result<BigUint, SmtError> {
    let mut digits = Vec::new();
    let mut lo = 0;
    while lo < bits {
        let hi = (lo + 63).min(bits - 1);
        let chunk = if lo == 0 && hi == bits - 1 { b.clone() } else { b.extract(hi, lo) };
        let d = z3_model
            .eval(&chunk, true)
            .and_then(|c| c.as_u64())
            .ok_or_else(|| SmtError::Backend(format!("no model value for {var}")))?;
        digits.push(d);
        lo = hi + 1;
    }
    let mut out = BigUint::default();
    for d in digits.iter().rev() {
        out = (out << 64u32) | BigUint::from(*d);
    }
    Ok(out)
}

impl Backend for Z3Backend {
    fn name(&self) -> &'static str {
        "z3"
    }

    fn push(&mut self) {
        self.solver.push();
        self.scopes.push(Vec::new());
        self.memo_marks.push(self.memo_order.len());
    }

    fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.solver.pop(1);
            self.scopes.pop();
            if let Some(mark) = self.memo_marks.pop() {
                for t in self.memo_order.drain(mark..) {
                    self.memo.remove(&t);
                }
            }
        }
    }

    fn assert(&mut self, term: &Term) -> Result<(), SmtError> {
        let ast = self.translate(term)?;
        let b = ast
            .as_bool()
            .ok_or_else(|| SmtError::Backend(format!("asserted term {term} is not boolean")))?;
        self.solver.assert(&b);
        if let Some(top) = self.scopes.last_mut() {
            top.push(term.clone());
        }
        Ok(())
    }

    fn check(&mut self) -> Result<SatResult, SmtError> {
        match self.solver.check() {
            Z3SatResult::Unsat => Ok(SatResult::Unsat),
            Z3SatResult::Unknown => Ok(SatResult::Unknown(
                self.solver
                    .get_reason_unknown()
                    .unwrap_or_else(|| "unknown".to_string()),
            )),
            Z3SatResult::Sat => {
                let z3_model = self
                    .solver
                    .get_model()
                    .ok_or_else(|| SmtError::Backend("sat without a model".into()))?;
                Ok(SatResult::Sat(self.read_model(&z3_model)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Solver};

    #[test]
    fn z3_agrees_with_constant_semantics() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 8);
        let mut s = Solver::with_backend(Box::new(Z3Backend::new(&SolverConfig::default())));
        s.assert(&x.sdiv(&ctx.mk_int(-2, 8)).equal(&ctx.mk_int(3, 8))).unwrap();
        s.assert(&x.slt(&ctx.mk_uint(0, 8))).unwrap();
        let res = s.check().unwrap();
        let m = res.model().expect("sat");
        let v = m.get_int(&x).unwrap();
        assert!(v == -6 || v == -7);
    }

    #[test]
    fn popping_a_scope_forgets_its_translations() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 8);
        let mut b = Z3Backend::new(&SolverConfig::default());
        b.assert(&x.ugt(&ctx.mk_uint(1, 8))).unwrap();
        let outer = b.memo.len();
        b.push();
        b.assert(&(&x * &ctx.mk_uint(3, 8)).equal(&ctx.mk_uint(9, 8)))
            .unwrap();
        assert!(b.memo.len() > outer);
        b.pop();
        assert_eq!(b.memo.len(), outer);
        assert_eq!(b.memo_order.len(), outer);
        assert!(b.check().unwrap().is_sat());
    }

    #[test]
    fn wide_constants_round_trip() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 100);
        let big = (BigUint::from(1u8) << 99u32) | BigUint::from(12345u32);
        let mut s = Solver::with_backend(Box::new(Z3Backend::new(&SolverConfig::default())));
        s.assert(&x.equal(&ctx.mk_uint_big(big.clone(), 100))).unwrap();
        let res = s.check().unwrap();
        assert_eq!(res.model().unwrap().eval(&x).as_big_uint(), Some(&big));
    }
}
