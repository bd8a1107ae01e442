use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use num_bigint::BigUint;
use num_traits::One;
use rustc_hash::FxHashMap;

use crate::eval::{self, Value};
use crate::term::{Op, Term};

/// Largest number of bound bits a quantifier may range over when evaluated
/// concretely.
pub const MAX_QUANTIFIER_BITS: u32 = 16;

/// Satisfying assignment returned by a `Sat` check: free variable -> constant.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Model {
    assignments: BTreeMap<Term, Term>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value of a variable.
    ///
    /// # Panics
    /// If `var` is not a variable, `value` is not a constant, or their sorts
    /// differ.
    pub fn insert(&mut self, var: Term, value: Term) {
        assert!(var.is_var(), "model key {var} is not a variable");
        assert!(value.is_const(), "model value {value} is not a constant");
        assert_eq!(var.sort(), value.sort(), "model value sort mismatch for {var}");
        self.assignments.insert(var, value);
    }

    pub fn get(&self, var: &Term) -> Option<&Term> {
        self.assignments.get(var)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Term, &Term)> {
        self.assignments.iter()
    }

    /// Value of `t` under this model. Variables the model does not mention are
    /// read as zero (or `false`). Quantifiers over more than
    /// [`MAX_QUANTIFIER_BITS`] bound bits are left symbolic, with the model's
    /// assignments substituted in.
    pub fn eval(&self, t: &Term) -> Term {
        let env = self.env();
        let mut ev = Evaluator::new(env, MAX_QUANTIFIER_BITS, None);
        match ev.eval(t, &mut FxHashMap::default()) {
            Ok(v) => t.context().from_value(v),
            Err(_) => self
                .assignments
                .iter()
                .fold(t.clone(), |acc, (var, val)| acc.subst(var, val)),
        }
    }

    pub fn get_uint(&self, t: &Term) -> Option<u64> {
        self.eval(t).as_uint()
    }

    pub fn get_int(&self, t: &Term) -> Option<i64> {
        self.eval(t).as_int()
    }

    pub fn get_bool(&self, t: &Term) -> Option<bool> {
        self.eval(t).as_bool()
    }

    /// Conjunction of `var == value` over every assignment. Asserting its
    /// negation rules this model out.
    pub fn as_constraint(&self, ctx: &crate::Context) -> Term {
        let eqs: Vec<Term> = self.assignments.iter().map(|(k, v)| k.equal(v)).collect();
        Term::and_all(ctx, &eqs)
    }

    pub(crate) fn env(&self) -> FxHashMap<Term, Value> {
        self.assignments
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), v.value()?)))
            .collect()
    }

    pub(crate) fn from_env(env: &FxHashMap<Term, Value>) -> Self {
        let mut model = Model::new();
        for (var, val) in env {
            model.insert(var.clone(), var.context().from_value(val.clone()));
        }
        model
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (var, val) in &self.assignments {
            writeln!(f, "{var} = {val}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.assignments.iter()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EvalError {
    QuantifierTooLarge(u32),
    Timeout,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::QuantifierTooLarge(bits) => {
                write!(f, "quantifier ranges over {bits} bound bits")
            }
            EvalError::Timeout => write!(f, "timeout"),
        }
    }
}

const DEADLINE_CHECK_INTERVAL: u64 = 1 << 12;

/// Concrete evaluator over an environment of variable values.
pub(crate) struct Evaluator {
    env: FxHashMap<Term, Value>,
    max_quantifier_bits: u32,
    deadline: Option<Instant>,
    steps: u64,
}

impl Evaluator {
    pub(crate) fn new(
        env: FxHashMap<Term, Value>,
        max_quantifier_bits: u32,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            env,
            max_quantifier_bits,
            deadline,
            steps: 0,
        }
    }

    pub(crate) fn set(&mut self, var: Term, val: Value) -> Option<Value> {
        self.env.insert(var, val)
    }

    pub(crate) fn env(&self) -> &FxHashMap<Term, Value> {
        &self.env
    }

    fn tick(&mut self) -> Result<(), EvalError> {
        self.steps += 1;
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(EvalError::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Value of `t` if it is a leaf or already in `memo`.
    fn known(&self, t: &Term, memo: &FxHashMap<Term, Value>) -> Option<Value> {
        if let Some(v) = t.value() {
            return Some(v);
        }
        if let Op::Var(_) = t.op() {
            return Some(
                self.env
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| Value::zero(t.sort())),
            );
        }
        memo.get(t).cloned()
    }

    /// Evaluate `root` with an explicit worklist. `ite`, `and` and `or`
    /// evaluate their first operand and then only the operand they need.
    pub(crate) fn eval(
        &mut self,
        root: &Term,
        memo: &mut FxHashMap<Term, Value>,
    ) -> Result<Value, EvalError> {
        // (term, operands already scheduled)
        let mut stack = vec![(root.clone(), false)];
        while let Some((t, expanded)) = stack.pop() {
            if self.known(&t, memo).is_some() {
                continue;
            }
            let args = t.args();
            if !expanded {
                self.tick()?;
                stack.push((t.clone(), true));
                match t.op() {
                    Op::Forall => {}
                    Op::Ite | Op::And | Op::Or => stack.push((args[0].clone(), false)),
                    _ => stack.extend(args.iter().rev().map(|a| (a.clone(), false))),
                }
                continue;
            }

            let v = match t.op() {
                Op::Forall => self.eval_forall(&t)?,
                Op::Ite | Op::And | Op::Or => {
                    let Some(first) = self.known(&args[0], memo) else {
                        unreachable!("first operand is evaluated before its parent")
                    };
                    let c = first.as_bool();
                    let next = match t.op() {
                        Op::And if !c => None,
                        Op::Or if c => None,
                        Op::Ite if !c => Some(&args[2]),
                        _ => Some(&args[1]),
                    };
                    match next {
                        None => Value::Bool(c),
                        Some(n) => match self.known(n, memo) {
                            Some(v) => v,
                            None => {
                                stack.push((t.clone(), true));
                                stack.push((n.clone(), false));
                                continue;
                            }
                        },
                    }
                }
                op => {
                    let Some(vals) = args
                        .iter()
                        .map(|a| self.known(a, memo))
                        .collect::<Option<Vec<_>>>()
                    else {
                        unreachable!("operands are evaluated before their parent")
                    };
                    eval::apply(op, &vals)
                }
            };
            memo.insert(t.clone(), v);
        }
        match self.known(root, memo) {
            Some(v) => Ok(v),
            None => unreachable!("root is evaluated when the worklist drains"),
        }
    }

    fn eval_forall(&mut self, t: &Term) -> Result<Value, EvalError> {
        let (binders, body) = t.args().split_at(t.args().len() - 1);
        let total: u32 = binders.iter().map(|b| b.sort().bit_len()).sum();
        if total > self.max_quantifier_bits {
            return Err(EvalError::QuantifierTooLarge(total));
        }

        let saved: Vec<Option<Value>> = binders.iter().map(|b| self.env.get(b).cloned()).collect();
        let mut result = Ok(Value::Bool(true));
        let mut raw = BigUint::default();
        let end = BigUint::one() << total;
        while raw < end {
            let mut offset = 0;
            for b in binders {
                let sort = b.sort();
                self.env.insert(b.clone(), Value::from_bits(sort, &(&raw >> offset)));
                offset += sort.bit_len();
            }
            match self.eval(&body[0], &mut FxHashMap::default()) {
                Ok(v) if v.as_bool() => {}
                Ok(_) => {
                    result = Ok(Value::Bool(false));
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            raw += 1u32;
        }

        for (b, prev) in binders.iter().zip(saved) {
            match prev {
                Some(v) => self.env.insert(b.clone(), v),
                None => self.env.remove(b),
            };
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;

    #[test]
    fn eval_reads_assignments_and_defaults_to_zero() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 8);
        let y = ctx.mk_var("y", 8);
        let mut m = Model::new();
        m.insert(x.clone(), ctx.mk_uint(40, 8));
        assert_eq!(m.get_uint(&(&x + &ctx.mk_uint(2, 8))), Some(42));
        assert_eq!(m.get_uint(&y), Some(0));
        assert_eq!(m.get_bool(&x.ugt(&y)), Some(true));
    }

    #[test]
    fn eval_expands_small_quantifiers() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 3);
        let k = ctx.mk_var("k", 3);
        let m = Model::new();
        // forall x. x <=u 7
        assert_eq!(m.get_bool(&Term::forall(&[x.clone()], &x.ule(&ctx.mk_uint(7, 3)))), Some(true));
        // forall x. x <u k, false for every k
        let q = Term::forall(&[x.clone()], &x.ult(&k));
        let mut m = Model::new();
        m.insert(k.clone(), ctx.mk_uint(7, 3));
        assert_eq!(m.get_bool(&q), Some(false));
    }

    #[test]
    fn oversized_quantifiers_stay_symbolic() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 32);
        let k = ctx.mk_var("k", 32);
        let q = Term::forall(&[x.clone()], &x.ule(&k));
        let mut m = Model::new();
        m.insert(k.clone(), ctx.mk_uint(3, 32));
        let out = m.eval(&q);
        assert!(!out.is_const());
        assert!(!out.free_vars().contains(&k));
    }

    #[test]
    fn as_constraint_blocks_exactly_the_model() {
        let ctx = Context::new();
        let a = ctx.mk_bool_var("a");
        let x = ctx.mk_var("x", 2);
        let mut m = Model::new();
        m.insert(a.clone(), ctx.mk_true());
        m.insert(x.clone(), ctx.mk_uint(2, 2));
        let c = m.as_constraint(&ctx);
        assert_eq!(m.get_bool(&c), Some(true));
        let mut other = m.clone();
        other.insert(x.clone(), ctx.mk_uint(1, 2));
        assert_eq!(other.get_bool(&c), Some(false));
    }
}
