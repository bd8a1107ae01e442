use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use num_bigint::{BigInt, BigUint};
use num_traits::{ToPrimitive, Zero};
use rustc_hash::{FxHashMap, FxHasher};

use crate::eval::{self, Value};
use crate::sort::Sort;

/// Operator at the root of a term node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    BoolConst(bool),
    BvConst(BigUint),
    Var(Arc<str>),
    /// Children are the bound variables followed by the body.
    Forall,

    Not,
    And,
    Or,
    Xor,
    Eq,
    Ite,

    Neg,
    Add,
    Sub,
    Mul,
    Udiv,
    Sdiv,
    Urem,
    Srem,

    BvNot,
    BvAnd,
    BvOr,
    BvXor,
    Shl,
    Lshr,
    Ashr,

    Ult,
    Ule,
    Slt,
    Sle,

    Concat,
    Extract { high: u32, low: u32 },
    ZeroExt(u32),
    SignExt(u32),
}

impl Op {
    fn is_leaf(&self) -> bool {
        matches!(self, Op::BoolConst(_) | Op::BvConst(_) | Op::Var(_))
    }

    fn smt_name(&self) -> &'static str {
        match self {
            Op::BoolConst(_) | Op::BvConst(_) | Op::Var(_) => "",
            Op::Forall => "forall",
            Op::Not => "not",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Eq => "=",
            Op::Ite => "ite",
            Op::Neg => "bvneg",
            Op::Add => "bvadd",
            Op::Sub => "bvsub",
            Op::Mul => "bvmul",
            Op::Udiv => "bvudiv",
            Op::Sdiv => "bvsdiv",
            Op::Urem => "bvurem",
            Op::Srem => "bvsrem",
            Op::BvNot => "bvnot",
            Op::BvAnd => "bvand",
            Op::BvOr => "bvor",
            Op::BvXor => "bvxor",
            Op::Shl => "bvshl",
            Op::Lshr => "bvlshr",
            Op::Ashr => "bvashr",
            Op::Ult => "bvult",
            Op::Ule => "bvule",
            Op::Slt => "bvslt",
            Op::Sle => "bvsle",
            Op::Concat => "concat",
            Op::Extract { .. } => "extract",
            Op::ZeroExt(_) => "zero_extend",
            Op::SignExt(_) => "sign_extend",
        }
    }
}

struct Node {
    op: Op,
    sort: Sort,
    args: Box<[Term]>,
    hash: u64,
    id: u64,
    ctx: Arc<ContextInner>,
}

/// Children this node owns alone are torn down from a worklist, so dropping a
/// deep chain does not recurse once per level.
impl Drop for Node {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.args).into_vec();
        while let Some(t) = stack.pop() {
            if let Some(mut node) = Arc::into_inner(t.node) {
                stack.extend(std::mem::take(&mut node.args).into_vec());
            }
        }
    }
}

#[derive(Default)]
struct ContextInner {
    /// Structural hash -> nodes with that hash. Only weak references are kept,
    /// so a node dies with its last `Term`; dead slots are purged lazily.
    table: Mutex<FxHashMap<u64, Vec<Weak<Node>>>>,
    next_id: AtomicU64,
    inserts_since_sweep: AtomicU64,
}

const SWEEP_INTERVAL: u64 = 4096;

/// Owner of the term graph. Every [`Term`] keeps its context alive.
///
/// Structurally identical terms built in the same context are the same node,
/// which makes `==` a pointer comparison. Independent verification runs should
/// use independent contexts.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("live_terms", &self.live_terms())
            .finish()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned nodes that still have at least one owner.
    pub fn live_terms(&self) -> usize {
        let table = self.inner.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .values()
            .flat_map(|bucket| bucket.iter())
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn mk_true(&self) -> Term {
        self.mk_bool(true)
    }

    pub fn mk_false(&self) -> Term {
        self.mk_bool(false)
    }

    pub fn mk_bool(&self, b: bool) -> Term {
        intern(&self.inner, Op::BoolConst(b), Sort::Bool, Vec::new())
    }

    /// Bit-vector constant. `n` must be representable in `bits` unsigned bits.
    pub fn mk_uint(&self, n: u64, bits: u32) -> Term {
        self.mk_uint_big(BigUint::from(n), bits)
    }

    /// Bit-vector constant holding the two's-complement encoding of `n`, which
    /// must be representable in `bits` signed bits.
    pub fn mk_int(&self, n: i64, bits: u32) -> Term {
        assert!(bits > 0, "zero-width bit-vector constant");
        let v = BigInt::from(n);
        let bound = BigInt::from(1) << (bits - 1);
        assert!(
            v >= -bound.clone() && v < bound,
            "{n} does not fit in {bits} signed bits"
        );
        self.mk_uint_big(eval::from_signed(&v, bits), bits)
    }

    pub fn mk_uint_big(&self, n: BigUint, bits: u32) -> Term {
        assert!(bits > 0, "zero-width bit-vector constant");
        assert!(n.bits() <= u64::from(bits), "{n} does not fit in {bits} bits");
        intern(&self.inner, Op::BvConst(n), Sort::BitVec(bits), Vec::new())
    }

    /// Free bit-vector variable. The name is the identity: the same name and
    /// width always denote the same variable.
    pub fn mk_var(&self, name: &str, bits: u32) -> Term {
        assert!(bits > 0, "zero-width bit-vector variable `{name}`");
        intern(&self.inner, Op::Var(name.into()), Sort::BitVec(bits), Vec::new())
    }

    pub fn mk_bool_var(&self, name: &str) -> Term {
        intern(&self.inner, Op::Var(name.into()), Sort::Bool, Vec::new())
    }

    /// Variable of an arbitrary sort.
    pub fn mk_var_of_sort(&self, name: &str, sort: Sort) -> Term {
        match sort {
            Sort::Bool => self.mk_bool_var(name),
            Sort::BitVec(bits) => self.mk_var(name, bits),
        }
    }

    /// Smallest signed value of the width (`100...0`).
    pub fn int_min(&self, bits: u32) -> Term {
        assert!(bits > 0, "zero-width bit-vector constant");
        self.mk_uint_big(BigUint::from(1u8) << (bits - 1), bits)
    }

    /// Largest signed value of the width (`011...1`).
    pub fn int_max(&self, bits: u32) -> Term {
        assert!(bits > 0, "zero-width bit-vector constant");
        self.mk_uint_big(eval::mask(bits - 1), bits)
    }

    pub fn all_ones(&self, bits: u32) -> Term {
        assert!(bits > 0, "zero-width bit-vector constant");
        self.mk_uint_big(eval::mask(bits), bits)
    }

    pub(crate) fn from_value(&self, v: Value) -> Term {
        const_from_value(&self.inner, v)
    }
}

fn const_from_value(ctx: &Arc<ContextInner>, v: Value) -> Term {
    match v {
        Value::Bool(b) => intern(ctx, Op::BoolConst(b), Sort::Bool, Vec::new()),
        Value::Bv { bits, val } => intern(ctx, Op::BvConst(val), Sort::BitVec(bits), Vec::new()),
    }
}

fn structural_hash(op: &Op, sort: Sort, args: &[Term]) -> u64 {
    let mut h = FxHasher::default();
    op.hash(&mut h);
    sort.hash(&mut h);
    for a in args {
        h.write_u64(a.node.hash);
    }
    h.finish()
}

fn intern(ctx: &Arc<ContextInner>, op: Op, sort: Sort, args: Vec<Term>) -> Term {
    let hash = structural_hash(&op, sort, &args);
    let mut table = ctx.table.lock().unwrap_or_else(PoisonError::into_inner);
    let bucket = table.entry(hash).or_default();
    let mut found = None;
    bucket.retain(|weak| match weak.upgrade() {
        Some(node) => {
            if found.is_none()
                && node.op == op
                && node.sort == sort
                && node.args.len() == args.len()
                && node.args.iter().zip(&args).all(|(a, b)| a == b)
            {
                found = Some(node);
            }
            true
        }
        None => false,
    });
    if let Some(node) = found {
        return Term { node };
    }

    let node = Arc::new(Node {
        op,
        sort,
        args: args.into_boxed_slice(),
        hash,
        id: ctx.next_id.fetch_add(1, AtomicOrdering::Relaxed),
        ctx: Arc::clone(ctx),
    });
    bucket.push(Arc::downgrade(&node));

    if ctx.inserts_since_sweep.fetch_add(1, AtomicOrdering::Relaxed) >= SWEEP_INTERVAL {
        ctx.inserts_since_sweep.store(0, AtomicOrdering::Relaxed);
        table.retain(|_, bucket| {
            bucket.retain(|w| w.strong_count() > 0);
            !bucket.is_empty()
        });
    }
    Term { node }
}

/// Immutable, hash-consed SMT term: a boolean or a fixed-width bit-vector.
///
/// Cloning shares the node. Equality (`==`) is structural and constant time;
/// semantic equality needs a solver query on [`Term::equal`].
#[derive(Clone)]
pub struct Term {
    node: Arc<Node>,
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.node.hash);
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Container ordering only; carries no meaning beyond creation order.
impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node
            .id
            .cmp(&other.node.id)
            .then_with(|| Arc::as_ptr(&self.node).cmp(&Arc::as_ptr(&other.node)))
    }
}

impl Term {
    fn ctx(&self) -> &Arc<ContextInner> {
        &self.node.ctx
    }

    pub fn context(&self) -> Context {
        Context {
            inner: Arc::clone(self.ctx()),
        }
    }

    pub(crate) fn op(&self) -> &Op {
        &self.node.op
    }

    pub(crate) fn args(&self) -> &[Term] {
        &self.node.args
    }

    pub fn sort(&self) -> Sort {
        self.node.sort
    }

    pub fn is_bool(&self) -> bool {
        self.node.sort.is_bool()
    }

    /// Width of a bit-vector term.
    ///
    /// # Panics
    /// On boolean terms, which have no width.
    pub fn bits(&self) -> u32 {
        match self.node.sort {
            Sort::BitVec(w) => w,
            Sort::Bool => panic!("bits() of boolean term {self}"),
        }
    }

    /// Creation-order identifier, unique within a context.
    pub fn id(&self) -> u64 {
        self.node.id
    }

    /// Structural hash: equal for structurally equal terms regardless of the
    /// order in which they were built.
    pub fn hash_code(&self) -> u64 {
        self.node.hash
    }

    pub fn is_const(&self) -> bool {
        matches!(self.node.op, Op::BoolConst(_) | Op::BvConst(_))
    }

    pub fn is_var(&self) -> bool {
        matches!(self.node.op, Op::Var(_))
    }

    pub fn var_name(&self) -> Option<&str> {
        match &self.node.op {
            Op::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self.node.op, Op::BoolConst(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self.node.op, Op::BoolConst(false))
    }

    pub fn is_zero(&self) -> bool {
        matches!(&self.node.op, Op::BvConst(v) if v.is_zero())
    }

    pub fn is_all_ones(&self) -> bool {
        match (&self.node.op, self.node.sort) {
            (Op::BvConst(v), Sort::BitVec(w)) => *v == eval::mask(w),
            _ => false,
        }
    }

    /// Value of a bit-vector literal, if it is one and fits in 64 bits.
    pub fn as_uint(&self) -> Option<u64> {
        match &self.node.op {
            Op::BvConst(v) => v.to_u64(),
            _ => None,
        }
    }

    /// Signed value of a bit-vector literal, if it is one and fits in 64 bits.
    pub fn as_int(&self) -> Option<i64> {
        match (&self.node.op, self.node.sort) {
            (Op::BvConst(v), Sort::BitVec(w)) => eval::to_signed(v, w).to_i64(),
            _ => None,
        }
    }

    pub fn as_big_uint(&self) -> Option<&BigUint> {
        match &self.node.op {
            Op::BvConst(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.node.op {
            Op::BoolConst(b) => Some(b),
            _ => None,
        }
    }

    /// If this is a logical negation, the negated term.
    pub fn is_not(&self) -> Option<&Term> {
        match self.node.op {
            Op::Not => Some(&self.node.args[0]),
            _ => None,
        }
    }

    pub(crate) fn value(&self) -> Option<Value> {
        match &self.node.op {
            Op::BoolConst(b) => Some(Value::Bool(*b)),
            Op::BvConst(v) => Some(Value::bv(self.bits(), v.clone())),
            _ => None,
        }
    }

    fn same_ctx(&self, rhs: &Term) {
        assert!(
            Arc::ptr_eq(self.ctx(), rhs.ctx()),
            "terms from different contexts: {self} and {rhs}"
        );
    }

    fn same_bv(&self, rhs: &Term, what: &str) -> u32 {
        self.same_ctx(rhs);
        match (self.node.sort, rhs.node.sort) {
            (Sort::BitVec(a), Sort::BitVec(b)) if a == b => a,
            (a, b) => panic!("{what}: operand sorts differ or are not bit-vectors ({a} vs {b})"),
        }
    }

    fn expect_bool(&self, what: &str) {
        assert!(self.is_bool(), "{what}: expected a boolean, got {self}");
    }

    fn expect_bv(&self, what: &str) -> u32 {
        match self.node.sort {
            Sort::BitVec(w) => w,
            Sort::Bool => panic!("{what}: expected a bit-vector, got {self}"),
        }
    }

    /// Build an application, folding constants and applying local rewrites.
    fn app(&self, op: Op, sort: Sort, args: Vec<Term>) -> Term {
        if let Some(t) = simplify(&op, &args) {
            return t;
        }
        if args.iter().all(Term::is_const) {
            let vals: Vec<Value> = args.iter().filter_map(Term::value).collect();
            return const_from_value(self.ctx(), eval::apply(&op, &vals));
        }
        intern(self.ctx(), op, sort, args)
    }

    fn bv_binop(&self, rhs: &Term, op: Op) -> Term {
        let w = self.same_bv(rhs, op.smt_name());
        self.app(op, Sort::BitVec(w), vec![self.clone(), rhs.clone()])
    }

    fn bv_cmp(&self, rhs: &Term, op: Op) -> Term {
        self.same_bv(rhs, op.smt_name());
        self.app(op, Sort::Bool, vec![self.clone(), rhs.clone()])
    }

    fn bool_binop(&self, rhs: &Term, op: Op) -> Term {
        self.same_ctx(rhs);
        self.expect_bool(op.smt_name());
        rhs.expect_bool(op.smt_name());
        self.app(op, Sort::Bool, vec![self.clone(), rhs.clone()])
    }

    pub fn sdiv(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Sdiv)
    }

    pub fn udiv(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Udiv)
    }

    pub fn srem(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Srem)
    }

    pub fn urem(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Urem)
    }

    pub fn shl(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Shl)
    }

    pub fn ashr(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Ashr)
    }

    pub fn lshr(&self, rhs: &Term) -> Term {
        self.bv_binop(rhs, Op::Lshr)
    }

    pub fn add_no_soverflow(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "add_no_soverflow");
        let sum = self.sext(1) + rhs.sext(1);
        top_two_bits_agree(&sum)
    }

    pub fn add_no_uoverflow(&self, rhs: &Term) -> Term {
        let w = self.same_bv(rhs, "add_no_uoverflow");
        let sum = self.zext(1) + rhs.zext(1);
        sum.extract(w, w).equal(&self.context().mk_uint(0, 1))
    }

    pub fn sub_no_soverflow(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "sub_no_soverflow");
        let diff = self.sext(1) - rhs.sext(1);
        top_two_bits_agree(&diff)
    }

    pub fn sub_no_uoverflow(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "sub_no_uoverflow");
        self.uge(rhs)
    }

    pub fn mul_no_soverflow(&self, rhs: &Term) -> Term {
        let w = self.same_bv(rhs, "mul_no_soverflow");
        let prod = self.sext(w) * rhs.sext(w);
        prod.equal(&prod.extract(w - 1, 0).sext(w))
    }

    pub fn mul_no_uoverflow(&self, rhs: &Term) -> Term {
        let w = self.same_bv(rhs, "mul_no_uoverflow");
        let prod = self.zext(w) * rhs.zext(w);
        prod.extract(2 * w - 1, w).equal(&self.context().mk_uint(0, w))
    }

    /// True when the signed division leaves no remainder.
    pub fn sdiv_exact(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "sdiv_exact");
        (&self.sdiv(rhs) * rhs).equal(self)
    }

    pub fn udiv_exact(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "udiv_exact");
        (&self.udiv(rhs) * rhs).equal(self)
    }

    pub fn shl_no_soverflow(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "shl_no_soverflow");
        self.shl(rhs).ashr(rhs).equal(self)
    }

    pub fn shl_no_uoverflow(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "shl_no_uoverflow");
        self.shl(rhs).lshr(rhs).equal(self)
    }

    /// True when no set bit is shifted out.
    pub fn ashr_exact(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "ashr_exact");
        self.ashr(rhs).shl(rhs).equal(self)
    }

    pub fn lshr_exact(&self, rhs: &Term) -> Term {
        self.same_bv(rhs, "lshr_exact");
        self.lshr(rhs).shl(rhs).equal(self)
    }

    /// SMT equality of two terms of the same sort.
    pub fn equal(&self, rhs: &Term) -> Term {
        self.same_ctx(rhs);
        assert_eq!(
            self.sort(),
            rhs.sort(),
            "equality between different sorts: {self} and {rhs}"
        );
        self.app(Op::Eq, Sort::Bool, vec![self.clone(), rhs.clone()])
    }

    pub fn distinct(&self, rhs: &Term) -> Term {
        !self.equal(rhs)
    }

    pub fn implies(&self, rhs: &Term) -> Term {
        &!self | rhs
    }

    /// `self && !rhs`: the negation of `self.implies(rhs)`.
    pub fn not_implies(&self, rhs: &Term) -> Term {
        self & &!rhs
    }

    pub fn ule(&self, rhs: &Term) -> Term {
        self.bv_cmp(rhs, Op::Ule)
    }

    pub fn ult(&self, rhs: &Term) -> Term {
        self.bv_cmp(rhs, Op::Ult)
    }

    pub fn uge(&self, rhs: &Term) -> Term {
        rhs.ule(self)
    }

    pub fn ugt(&self, rhs: &Term) -> Term {
        rhs.ult(self)
    }

    pub fn sle(&self, rhs: &Term) -> Term {
        self.bv_cmp(rhs, Op::Sle)
    }

    pub fn slt(&self, rhs: &Term) -> Term {
        self.bv_cmp(rhs, Op::Slt)
    }

    pub fn sge(&self, rhs: &Term) -> Term {
        rhs.sle(self)
    }

    pub fn sgt(&self, rhs: &Term) -> Term {
        rhs.slt(self)
    }

    /// Widen by `amount` bits, replicating the sign bit.
    pub fn sext(&self, amount: u32) -> Term {
        let w = self.expect_bv("sext");
        self.app(Op::SignExt(amount), Sort::BitVec(w + amount), vec![self.clone()])
    }

    /// Widen by `amount` zero bits.
    pub fn zext(&self, amount: u32) -> Term {
        let w = self.expect_bv("zext");
        self.app(Op::ZeroExt(amount), Sort::BitVec(w + amount), vec![self.clone()])
    }

    /// `self` in the high bits, `rhs` in the low bits.
    pub fn concat(&self, rhs: &Term) -> Term {
        self.same_ctx(rhs);
        let a = self.expect_bv("concat");
        let b = rhs.expect_bv("concat");
        self.app(Op::Concat, Sort::BitVec(a + b), vec![self.clone(), rhs.clone()])
    }

    /// Bits `[low, high]`, inclusive.
    pub fn extract(&self, high: u32, low: u32) -> Term {
        let w = self.expect_bv("extract");
        assert!(
            low <= high && high < w,
            "extract({high}, {low}) out of range for width {w}"
        );
        self.app(
            Op::Extract { high, low },
            Sort::BitVec(high - low + 1),
            vec![self.clone()],
        )
    }

    pub fn mk_if(cond: &Term, then: &Term, els: &Term) -> Term {
        cond.same_ctx(then);
        cond.same_ctx(els);
        cond.expect_bool("ite");
        assert_eq!(
            then.sort(),
            els.sort(),
            "ite branches have different sorts: {then} and {els}"
        );
        cond.app(Op::Ite, then.sort(), vec![cond.clone(), then.clone(), els.clone()])
    }

    /// Universally quantify `vars` in `body`. An empty variable list returns
    /// the body unchanged.
    pub fn forall(vars: &[Term], body: &Term) -> Term {
        body.expect_bool("forall");
        if vars.is_empty() || body.is_const() {
            return body.clone();
        }
        let mut args = Vec::with_capacity(vars.len() + 1);
        for v in vars {
            body.same_ctx(v);
            assert!(v.is_var(), "forall binder {v} is not a variable");
            args.push(v.clone());
        }
        args.push(body.clone());
        intern(body.ctx(), Op::Forall, Sort::Bool, args)
    }

    /// Conjunction of all terms; `true` when empty.
    pub fn and_all<'a>(ctx: &Context, terms: impl IntoIterator<Item = &'a Term>) -> Term {
        terms
            .into_iter()
            .fold(ctx.mk_true(), |acc, t| &acc & t)
    }

    /// Disjunction of all terms; `false` when empty.
    pub fn or_all<'a>(ctx: &Context, terms: impl IntoIterator<Item = &'a Term>) -> Term {
        terms
            .into_iter()
            .fold(ctx.mk_false(), |acc, t| &acc | t)
    }

    /// Replace every free occurrence of the variable `var` by `replacement`.
    pub fn subst(&self, var: &Term, replacement: &Term) -> Term {
        assert!(var.is_var(), "subst target {var} is not a variable");
        assert_eq!(var.sort(), replacement.sort(), "subst changes the sort of {var}");
        self.same_ctx(replacement);
        subst_iter(self, var, replacement)
    }

    /// Free variables, in container order.
    pub fn free_vars(&self) -> BTreeSet<Term> {
        collect_free_vars(self)
    }

    /// Number of distinct nodes reachable from this term.
    pub fn dag_size(&self) -> usize {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.clone()];
        while let Some(t) = stack.pop() {
            if seen.insert(t.clone()) {
                stack.extend(t.args().iter().cloned());
            }
        }
        seen.len()
    }
}

fn top_two_bits_agree(t: &Term) -> Term {
    let w = t.bits();
    t.extract(w - 1, w - 1).equal(&t.extract(w - 2, w - 2))
}

fn subst_iter(root: &Term, var: &Term, rep: &Term) -> Term {
    let mut memo: HashMap<Term, Term> = HashMap::new();
    // (term, children already rewritten)
    let mut stack = vec![(root.clone(), false)];
    while let Some((t, expanded)) = stack.pop() {
        if memo.contains_key(&t) {
            continue;
        }
        if t == *var {
            memo.insert(t, rep.clone());
            continue;
        }
        let shadowed = *t.op() == Op::Forall && t.args()[..t.args().len() - 1].contains(var);
        if t.op().is_leaf() || shadowed {
            memo.insert(t.clone(), t);
            continue;
        }
        if !expanded {
            stack.push((t.clone(), true));
            for a in t.args() {
                if !memo.contains_key(a) {
                    stack.push((a.clone(), false));
                }
            }
            continue;
        }

        let args: Vec<Term> = t.args().iter().map(|a| memo[a].clone()).collect();
        let out = if args.iter().zip(t.args()).all(|(a, b)| a == b) {
            t.clone()
        } else if *t.op() == Op::Forall {
            let (binders, body) = args.split_at(args.len() - 1);
            Term::forall(binders, &body[0])
        } else {
            t.app(t.op().clone(), t.sort(), args)
        };
        memo.insert(t, out);
    }
    memo[root].clone()
}

fn collect_free_vars(root: &Term) -> BTreeSet<Term> {
    let mut out = BTreeSet::new();
    // Binder sets in scope; a body under different binders is visited again.
    let mut scopes: Vec<BTreeSet<Term>> = vec![BTreeSet::new()];
    let mut seen: HashSet<(Term, usize)> = HashSet::new();
    let mut stack = vec![(root.clone(), 0usize)];
    while let Some((t, scope)) = stack.pop() {
        match t.op() {
            Op::Var(_) => {
                if !scopes[scope].contains(&t) {
                    out.insert(t);
                }
            }
            Op::BoolConst(_) | Op::BvConst(_) => {}
            Op::Forall => {
                let (binders, body) = t.args().split_at(t.args().len() - 1);
                let mut inner = scopes[scope].clone();
                inner.extend(binders.iter().cloned());
                scopes.push(inner);
                stack.push((body[0].clone(), scopes.len() - 1));
            }
            _ => {
                if seen.insert((t.clone(), scope)) {
                    stack.extend(t.args().iter().map(|a| (a.clone(), scope)));
                }
            }
        }
    }
    out
}

/// Local rewrites applied before constant folding. Returns `None` when no rule
/// fires.
fn simplify(op: &Op, args: &[Term]) -> Option<Term> {
    match op {
        Op::Not => {
            if let Some(inner) = args[0].is_not() {
                return Some(inner.clone());
            }
            None
        }
        Op::And => {
            let (a, b) = (&args[0], &args[1]);
            if a.is_false() || b.is_true() || a == b {
                Some(a.clone())
            } else if b.is_false() || a.is_true() {
                Some(b.clone())
            } else {
                None
            }
        }
        Op::Or => {
            let (a, b) = (&args[0], &args[1]);
            if a.is_true() || b.is_false() || a == b {
                Some(a.clone())
            } else if b.is_true() || a.is_false() {
                Some(b.clone())
            } else {
                None
            }
        }
        Op::Eq => {
            if args[0] == args[1] {
                Some(args[0].context().mk_true())
            } else {
                None
            }
        }
        Op::Ite => {
            let (c, t, e) = (&args[0], &args[1], &args[2]);
            if c.is_true() || t == e {
                Some(t.clone())
            } else if c.is_false() {
                Some(e.clone())
            } else {
                None
            }
        }
        Op::Add | Op::BvOr | Op::BvXor if args[0].is_zero() => Some(args[1].clone()),
        Op::Add | Op::Sub | Op::BvOr | Op::BvXor | Op::Shl | Op::Lshr | Op::Ashr
            if args[1].is_zero() =>
        {
            Some(args[0].clone())
        }
        Op::Ult | Op::Slt if args[0] == args[1] => Some(args[0].context().mk_false()),
        Op::Ule | Op::Sle if args[0] == args[1] => Some(args[0].context().mk_true()),
        Op::ZeroExt(0) | Op::SignExt(0) => Some(args[0].clone()),
        Op::Extract { high, low } => {
            let t = &args[0];
            if *low == 0 && *high + 1 == t.bits() {
                return Some(t.clone());
            }
            if let Op::Extract { low: inner_low, .. } = t.op() {
                return Some(t.args()[0].extract(high + inner_low, low + inner_low));
            }
            None
        }
        Op::Concat => {
            let (a, b) = (&args[0], &args[1]);
            match (a.op(), b.op()) {
                (Op::Extract { high, low }, Op::Extract { high: bh, low: bl })
                    if a.args()[0] == b.args()[0] && *low == bh + 1 =>
                {
                    Some(a.args()[0].extract(*high, *bl))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

macro_rules! bv_or_bool_op {
    ($trait:ident, $method:ident, $bv:expr, $boolean:expr) => {
        impl ops::$trait<&Term> for &Term {
            type Output = Term;
            fn $method(self, rhs: &Term) -> Term {
                if self.is_bool() {
                    self.bool_binop(rhs, $boolean)
                } else {
                    self.bv_binop(rhs, $bv)
                }
            }
        }
        impl ops::$trait<Term> for Term {
            type Output = Term;
            fn $method(self, rhs: Term) -> Term {
                ops::$trait::$method(&self, &rhs)
            }
        }
        impl ops::$trait<&Term> for Term {
            type Output = Term;
            fn $method(self, rhs: &Term) -> Term {
                ops::$trait::$method(&self, rhs)
            }
        }
    };
}

macro_rules! bv_op {
    ($trait:ident, $method:ident, $bv:expr) => {
        impl ops::$trait<&Term> for &Term {
            type Output = Term;
            fn $method(self, rhs: &Term) -> Term {
                self.bv_binop(rhs, $bv)
            }
        }
        impl ops::$trait<Term> for Term {
            type Output = Term;
            fn $method(self, rhs: Term) -> Term {
                ops::$trait::$method(&self, &rhs)
            }
        }
        impl ops::$trait<&Term> for Term {
            type Output = Term;
            fn $method(self, rhs: &Term) -> Term {
                ops::$trait::$method(&self, rhs)
            }
        }
    };
}

bv_op!(Add, add, Op::Add);
bv_op!(Sub, sub, Op::Sub);
bv_op!(Mul, mul, Op::Mul);
bv_op!(Shl, shl, Op::Shl);
// On booleans `&`, `|` and `^` are the logical connectives.
bv_or_bool_op!(BitAnd, bitand, Op::BvAnd, Op::And);
bv_or_bool_op!(BitOr, bitor, Op::BvOr, Op::Or);
bv_or_bool_op!(BitXor, bitxor, Op::BvXor, Op::Xor);

/// Logical negation on booleans, bitwise complement on bit-vectors.
impl ops::Not for &Term {
    type Output = Term;
    fn not(self) -> Term {
        match self.sort() {
            Sort::Bool => self.app(Op::Not, Sort::Bool, vec![self.clone()]),
            Sort::BitVec(w) => self.app(Op::BvNot, Sort::BitVec(w), vec![self.clone()]),
        }
    }
}

impl ops::Not for Term {
    type Output = Term;
    fn not(self) -> Term {
        !&self
    }
}

impl ops::Neg for &Term {
    type Output = Term;
    fn neg(self) -> Term {
        let w = self.expect_bv("bvneg");
        self.app(Op::Neg, Sort::BitVec(w), vec![self.clone()])
    }
}

impl ops::Neg for Term {
    type Output = Term;
    fn neg(self) -> Term {
        -&self
    }
}

impl ops::BitAndAssign<&Term> for Term {
    fn bitand_assign(&mut self, rhs: &Term) {
        self.expect_bool("&=");
        *self = &*self & rhs;
    }
}

impl ops::BitOrAssign<&Term> for Term {
    fn bitor_assign(&mut self, rhs: &Term) {
        self.expect_bool("|=");
        *self = &*self | rhs;
    }
}

enum Piece<'a> {
    Term(&'a Term),
    Space,
    Close,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack = vec![Piece::Term(self)];
        while let Some(piece) = stack.pop() {
            let t = match piece {
                Piece::Space => {
                    f.write_str(" ")?;
                    continue;
                }
                Piece::Close => {
                    f.write_str(")")?;
                    continue;
                }
                Piece::Term(t) => t,
            };
            match t.op() {
                Op::BoolConst(b) => write!(f, "{b}")?,
                Op::BvConst(v) => {
                    let w = t.bits();
                    if w % 4 == 0 {
                        write!(f, "#x{:0>width$}", v.to_str_radix(16), width = (w / 4) as usize)?
                    } else {
                        write!(f, "#b{:0>width$}", v.to_str_radix(2), width = w as usize)?
                    }
                }
                Op::Var(name) => f.write_str(name)?,
                Op::Forall => {
                    let (binders, body) = t.args().split_at(t.args().len() - 1);
                    f.write_str("(forall (")?;
                    for (i, b) in binders.iter().enumerate() {
                        if i > 0 {
                            f.write_str(" ")?;
                        }
                        write!(f, "({b} {})", b.sort())?;
                    }
                    f.write_str(") ")?;
                    stack.push(Piece::Close);
                    stack.push(Piece::Term(&body[0]));
                }
                op => {
                    match op {
                        Op::Extract { high, low } => write!(f, "((_ extract {high} {low})")?,
                        Op::ZeroExt(n) | Op::SignExt(n) => {
                            write!(f, "((_ {} {n})", op.smt_name())?
                        }
                        _ => write!(f, "({}", op.smt_name())?,
                    }
                    stack.push(Piece::Close);
                    for a in t.args().iter().rev() {
                        stack.push(Piece::Term(a));
                        stack.push(Piece::Space);
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
