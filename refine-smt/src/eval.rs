//! Concrete semantics of every operator a [`Term`](crate::Term) can apply.
//!
//! The same functions back constant folding at construction time, model
//! evaluation and the built-in enumeration backend, so the three can never
//! disagree about what an operator means. Division and shift corner cases follow
//! SMT-LIB: `bvudiv x 0 = ~0`, `bvurem x 0 = x`, `bvsdiv x 0 = (x < 0 ? 1 : ~0)`,
//! `bvsrem x 0 = x`, and shifting by at least the width yields zero (or the sign
//! fill for `bvashr`).

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};

use crate::sort::Sort;
use crate::term::Op;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Value {
    Bool(bool),
    Bv { bits: u32, val: BigUint },
}

impl Value {
    pub(crate) fn bv(bits: u32, val: BigUint) -> Self {
        Value::Bv { bits, val }
    }

    pub(crate) fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Bv { .. } => unreachable!("operand sorts are checked at construction"),
        }
    }

    fn as_bv(&self) -> (u32, &BigUint) {
        match self {
            Value::Bv { bits, val } => (*bits, val),
            Value::Bool(_) => unreachable!("operand sorts are checked at construction"),
        }
    }

    /// Zero of the given sort; used for variables a model leaves unassigned.
    pub(crate) fn zero(sort: Sort) -> Self {
        match sort {
            Sort::Bool => Value::Bool(false),
            Sort::BitVec(bits) => Value::bv(bits, BigUint::zero()),
        }
    }

    /// Decode a value of `sort` from the low bits of `raw`.
    pub(crate) fn from_bits(sort: Sort, raw: &BigUint) -> Self {
        match sort {
            Sort::Bool => Value::Bool(!raw.is_zero()),
            Sort::BitVec(bits) => Value::bv(bits, raw & mask(bits)),
        }
    }
}

pub(crate) fn mask(bits: u32) -> BigUint {
    (BigUint::one() << bits) - BigUint::one()
}

pub(crate) fn to_signed(val: &BigUint, bits: u32) -> BigInt {
    let v = BigInt::from_biguint(Sign::Plus, val.clone());
    if bits > 0 && val.bit(u64::from(bits - 1)) {
        v - (BigInt::one() << bits)
    } else {
        v
    }
}

pub(crate) fn from_signed(val: &BigInt, bits: u32) -> BigUint {
    let modulus = BigInt::one() << bits;
    let mut r = val % &modulus;
    if r.sign() == Sign::Minus {
        r += &modulus;
    }
    r.to_biguint().unwrap_or_default()
}

fn shift_amount(amount: &BigUint, bits: u32) -> Option<u32> {
    amount.to_u32().filter(|s| *s < bits)
}

fn is_negative(val: &BigUint, bits: u32) -> bool {
    val.bit(u64::from(bits - 1))
}

/// Apply a non-leaf, non-binder operator to concrete operand values.
pub(crate) fn apply(op: &Op, args: &[Value]) -> Value {
    match op {
        Op::BoolConst(_) | Op::BvConst(_) | Op::Var(_) | Op::Forall => {
            unreachable!("leaves and binders are not applied")
        }
        Op::Not => Value::Bool(!args[0].as_bool()),
        Op::And => Value::Bool(args[0].as_bool() && args[1].as_bool()),
        Op::Or => Value::Bool(args[0].as_bool() || args[1].as_bool()),
        Op::Xor => Value::Bool(args[0].as_bool() ^ args[1].as_bool()),
        Op::Eq => Value::Bool(args[0] == args[1]),
        Op::Ite => {
            if args[0].as_bool() {
                args[1].clone()
            } else {
                args[2].clone()
            }
        }
        Op::Concat => {
            let (wa, a) = args[0].as_bv();
            let (wb, b) = args[1].as_bv();
            Value::bv(wa + wb, (a << wb) | b)
        }
        Op::Extract { high, low } => {
            let (_, a) = args[0].as_bv();
            Value::bv(high - low + 1, (a >> *low) & mask(high - low + 1))
        }
        Op::ZeroExt(n) => {
            let (w, a) = args[0].as_bv();
            Value::bv(w + n, a.clone())
        }
        Op::SignExt(n) => {
            let (w, a) = args[0].as_bv();
            let val = if is_negative(a, w) {
                a | (mask(w + n) ^ mask(w))
            } else {
                a.clone()
            };
            Value::bv(w + n, val)
        }
        Op::Neg => {
            let (w, a) = args[0].as_bv();
            Value::bv(w, ((BigUint::one() << w) - a) & mask(w))
        }
        Op::BvNot => {
            let (w, a) = args[0].as_bv();
            Value::bv(w, a ^ mask(w))
        }
        _ => apply_binary(op, &args[0], &args[1]),
    }
}

fn apply_binary(op: &Op, lhs: &Value, rhs: &Value) -> Value {
    let (w, a) = lhs.as_bv();
    let (_, b) = rhs.as_bv();
    let m = mask(w);
    match op {
        Op::Add => Value::bv(w, (a + b) & m),
        Op::Sub => Value::bv(w, ((a + (BigUint::one() << w)) - b) & m),
        Op::Mul => Value::bv(w, (a * b) & m),
        Op::Udiv => {
            if b.is_zero() {
                Value::bv(w, m)
            } else {
                Value::bv(w, a / b)
            }
        }
        Op::Urem => {
            if b.is_zero() {
                Value::bv(w, a.clone())
            } else {
                Value::bv(w, a % b)
            }
        }
        Op::Sdiv => {
            if b.is_zero() {
                let val = if is_negative(a, w) { BigUint::one() } else { m };
                Value::bv(w, val)
            } else {
                // BigInt division truncates toward zero, like bvsdiv.
                let q = to_signed(a, w) / to_signed(b, w);
                Value::bv(w, from_signed(&q, w))
            }
        }
        Op::Srem => {
            if b.is_zero() {
                Value::bv(w, a.clone())
            } else {
                let r = to_signed(a, w) % to_signed(b, w);
                Value::bv(w, from_signed(&r, w))
            }
        }
        Op::BvAnd => Value::bv(w, a & b),
        Op::BvOr => Value::bv(w, a | b),
        Op::BvXor => Value::bv(w, a ^ b),
        Op::Shl => match shift_amount(b, w) {
            Some(s) => Value::bv(w, (a << s) & m),
            None => Value::bv(w, BigUint::zero()),
        },
        Op::Lshr => match shift_amount(b, w) {
            Some(s) => Value::bv(w, a >> s),
            None => Value::bv(w, BigUint::zero()),
        },
        Op::Ashr => {
            let neg = is_negative(a, w);
            match shift_amount(b, w) {
                Some(s) => {
                    let shifted = a >> s;
                    let val = if neg { shifted | (&m ^ (&m >> s)) } else { shifted };
                    Value::bv(w, val)
                }
                None => Value::bv(w, if neg { m } else { BigUint::zero() }),
            }
        }
        Op::Ult => Value::Bool(a < b),
        Op::Ule => Value::Bool(a <= b),
        Op::Slt => Value::Bool(to_signed(a, w) < to_signed(b, w)),
        Op::Sle => Value::Bool(to_signed(a, w) <= to_signed(b, w)),
        other => unreachable!("{other:?} is not a binary bit-vector operator"),
    }
}
