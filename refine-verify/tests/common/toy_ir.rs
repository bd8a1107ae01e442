//! A straight-line integer IR, just rich enough to exercise the verifier.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use refine_smt::{Context, Model, Term};
use refine_verify::{
    Function, Predicate, Side, State, StateValue, Type, Value, ValueKind, VerifyError,
};

#[derive(Clone, Debug)]
pub enum Operand {
    Var(&'static str),
    Const(u64),
}

pub use Operand::{Const, Var};

#[derive(Clone, Debug)]
pub enum Inst {
    Add(Operand, Operand),
    /// Poison on signed overflow.
    AddNsw(Operand, Operand),
    Mul(Operand, Operand),
    /// Poison when the amount is not below the width.
    Shl(Operand, Operand),
    /// Undefined behavior when the divisor is zero.
    Udiv(Operand, Operand),
    Undef,
}

/// Name of the type-selector variable shared by all ambiguous fragments.
pub const WIDTH_SELECTOR: &str = "ty_width";

pub struct ToyFn {
    pub name: String,
    pub bits: u32,
    /// Widths the fragment may be instantiated at; empty means `bits` only.
    pub width_choices: Vec<u32>,
    pub inputs: Vec<&'static str>,
    pub body: Vec<(&'static str, Inst)>,
    pub ret: Option<Operand>,
    pub extra_constraint: Option<fn(&Context) -> Term>,
}

impl ToyFn {
    pub fn new(name: &str, bits: u32) -> Self {
        Self {
            name: name.to_string(),
            bits,
            width_choices: Vec::new(),
            inputs: Vec::new(),
            body: Vec::new(),
            ret: None,
            extra_constraint: None,
        }
    }

    pub fn input(mut self, name: &'static str) -> Self {
        self.inputs.push(name);
        self
    }

    pub fn inst(mut self, name: &'static str, inst: Inst) -> Self {
        self.body.push((name, inst));
        self
    }

    pub fn ret(mut self, op: Operand) -> Self {
        self.ret = Some(op);
        self
    }

    pub fn widths(mut self, choices: &[u32]) -> Self {
        self.width_choices = choices.to_vec();
        self
    }

    pub fn constraint(mut self, c: fn(&Context) -> Term) -> Self {
        self.extra_constraint = Some(c);
        self
    }

    pub fn boxed(self) -> Box<dyn Function> {
        Box::new(self)
    }

    fn ty(&self) -> Type {
        Type::Int(self.bits)
    }

    fn operand(
        &self,
        ctx: &Context,
        env: &HashMap<&'static str, StateValue>,
        op: &Operand,
    ) -> Result<StateValue, VerifyError> {
        match op {
            Operand::Const(c) => Ok(StateValue::defined(ctx.mk_uint(*c, self.bits))),
            Operand::Var(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| VerifyError::Execution(format!("use of undefined value {name}"))),
        }
    }
}

fn fmt_operand(op: &Operand) -> String {
    match op {
        Operand::Var(v) => v.to_string(),
        Operand::Const(c) => c.to_string(),
    }
}

impl Function for ToyFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_constraints(&self, ctx: &Context) -> Term {
        let mut c = ctx.mk_true();
        if let Some(sel) = self.type_selector(ctx, None) {
            let choices: Vec<Term> = self
                .width_choices
                .iter()
                .map(|w| sel.equal(&ctx.mk_uint(u64::from(*w), 8)))
                .collect();
            c &= &Term::or_all(ctx, &choices);
        }
        if let Some(extra) = self.extra_constraint {
            c &= &extra(ctx);
        }
        c
    }

    fn type_selector(&self, ctx: &Context, _value: Option<&str>) -> Option<Term> {
        (!self.width_choices.is_empty()).then(|| ctx.mk_var(WIDTH_SELECTOR, 8))
    }

    fn instr_names(&self) -> Vec<String> {
        self.body.iter().map(|(n, _)| n.to_string()).collect()
    }

    fn fixup_types(&mut self, typing: &Model) {
        if self.width_choices.is_empty() {
            return;
        }
        let chosen = typing
            .iter()
            .find(|(var, _)| var.var_name() == Some(WIDTH_SELECTOR))
            .and_then(|(_, w)| w.as_uint());
        if let Some(w) = chosen {
            self.bits = w as u32;
        }
    }

    fn execute(&self, side: Side, ctx: &Context) -> Result<State, VerifyError> {
        let mut st = State::new(side, ctx);
        let mut env: HashMap<&'static str, StateValue> = HashMap::new();
        let mut undef_of: HashMap<&'static str, BTreeSet<Term>> = HashMap::new();
        let tag = match side {
            Side::Source => "src",
            Side::Target => "tgt",
        };

        for name in &self.inputs {
            let sv = StateValue::defined(ctx.mk_var(name, self.bits));
            st.add_value(Value::new(*name, ValueKind::Input, self.ty()), sv.clone());
            env.insert(*name, sv);
        }

        for (name, inst) in &self.body {
            let both = |a: &Operand, b: &Operand| -> Result<(StateValue, StateValue), VerifyError> {
                Ok((self.operand(ctx, &env, a)?, self.operand(ctx, &env, b)?))
            };
            let sv = match inst {
                Inst::Add(a, b) => {
                    let (a, b) = both(a, b)?;
                    StateValue::new(&a.value + &b.value, &a.non_poison & &b.non_poison)
                }
                Inst::AddNsw(a, b) => {
                    let (a, b) = both(a, b)?;
                    let np = &(&a.non_poison & &b.non_poison) & &a.value.add_no_soverflow(&b.value);
                    StateValue::new(&a.value + &b.value, np)
                }
                Inst::Mul(a, b) => {
                    let (a, b) = both(a, b)?;
                    StateValue::new(&a.value * &b.value, &a.non_poison & &b.non_poison)
                }
                Inst::Shl(a, b) => {
                    let (a, b) = both(a, b)?;
                    let in_range = b.value.ult(&ctx.mk_uint(u64::from(self.bits), self.bits));
                    let np = &(&a.non_poison & &b.non_poison) & &in_range;
                    StateValue::new(a.value.shl(&b.value), np)
                }
                Inst::Udiv(a, b) => {
                    let (a, b) = both(a, b)?;
                    st.add_ub(&b.value.equal(&ctx.mk_uint(0, self.bits)));
                    StateValue::new(a.value.udiv(&b.value), &a.non_poison & &b.non_poison)
                }
                Inst::Undef => {
                    let var = ctx.mk_var(&format!("undef!{tag}!{name}"), self.bits);
                    st.add_undef_var(var.clone());
                    undef_of.entry(*name).or_default().insert(var.clone());
                    StateValue::defined(var)
                }
            };
            st.add_value(Value::new(*name, ValueKind::Instr, self.ty()), sv.clone());
            env.insert(*name, sv);
        }

        if let Some(ret) = &self.ret {
            let sv = self.operand(ctx, &env, ret)?;
            let undef = match ret {
                Operand::Var(v) => undef_of.get(v).cloned().unwrap_or_default(),
                Operand::Const(_) => BTreeSet::new(),
            };
            st.set_return(self.ty(), sv, undef);
        }
        Ok(st)
    }

    fn print(&self, out: &mut dyn fmt::Write, print_header: bool) -> fmt::Result {
        let ty = self.ty();
        if print_header {
            let args: Vec<String> = self.inputs.iter().map(|i| format!("{ty} {i}")).collect();
            writeln!(out, "define {ty} @{}({}) {{", self.name, args.join(", "))?;
        }
        for (name, inst) in &self.body {
            let rhs = match inst {
                Inst::Add(a, b) => format!("add {}, {}", fmt_operand(a), fmt_operand(b)),
                Inst::AddNsw(a, b) => format!("add nsw {}, {}", fmt_operand(a), fmt_operand(b)),
                Inst::Mul(a, b) => format!("mul {}, {}", fmt_operand(a), fmt_operand(b)),
                Inst::Shl(a, b) => format!("shl {}, {}", fmt_operand(a), fmt_operand(b)),
                Inst::Udiv(a, b) => format!("udiv {}, {}", fmt_operand(a), fmt_operand(b)),
                Inst::Undef => "undef".to_string(),
            };
            writeln!(out, "  {name} = {rhs}")?;
        }
        match &self.ret {
            Some(op) => writeln!(out, "  ret {ty} {}", fmt_operand(op))?,
            None => writeln!(out, "  unreachable")?,
        }
        if print_header {
            writeln!(out, "}}")?;
        }
        Ok(())
    }
}

/// `input <u bound` over a named source input.
pub struct UltPre {
    pub input: &'static str,
    pub bound: u64,
}

impl fmt::Display for UltPre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} u< {}", self.input, self.bound)
    }
}

impl Predicate for UltPre {
    fn to_smt(&self, src: &State) -> Term {
        match src.lookup(self.input) {
            Some((_, sv)) => {
                let bits = sv.value.bits();
                sv.value.ult(&src.context().mk_uint(self.bound, bits))
            }
            None => src.context().mk_false(),
        }
    }
}
