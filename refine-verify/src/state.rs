use std::collections::BTreeSet;

use refine_smt::{Context, Term};

use crate::ir::{Side, StateValue, Type, Value};

/// Symbolic state of one executed program fragment.
#[derive(Debug, Clone)]
pub struct State {
    side: Side,
    ctx: Context,
    values: Vec<(Value, StateValue)>,
    return_value: Option<(Type, StateValue)>,
    return_undef_vars: BTreeSet<Term>,
    /// Condition under which execution has no undefined behavior.
    domain: Term,
    precondition: Term,
    axioms: Term,
    quant_vars: BTreeSet<Term>,
    undef_vars: BTreeSet<Term>,
}

impl State {
    pub fn new(side: Side, ctx: &Context) -> Self {
        Self {
            side,
            ctx: ctx.clone(),
            values: Vec::new(),
            return_value: None,
            return_undef_vars: BTreeSet::new(),
            domain: ctx.mk_true(),
            precondition: ctx.mk_true(),
            axioms: ctx.mk_true(),
            quant_vars: BTreeSet::new(),
            undef_vars: BTreeSet::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_source(&self) -> bool {
        self.side == Side::Source
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Record the value computed for `var`, in execution order.
    pub fn add_value(&mut self, var: Value, val: StateValue) {
        self.values.push((var, val));
    }

    pub fn values(&self) -> &[(Value, StateValue)] {
        &self.values
    }

    /// Last value recorded under `name`.
    pub fn lookup(&self, name: &str) -> Option<&(Value, StateValue)> {
        self.values.iter().rev().find(|(v, _)| v.name == name)
    }

    /// Mark the fragment as returning `val`. `undef_vars` are the undef
    /// variables the returned value depends on.
    pub fn set_return(&mut self, ty: Type, val: StateValue, undef_vars: BTreeSet<Term>) {
        self.return_value = Some((ty, val));
        self.return_undef_vars = undef_vars;
    }

    pub fn return_value(&self) -> Option<&(Type, StateValue)> {
        self.return_value.as_ref()
    }

    pub fn return_undef_vars(&self) -> &BTreeSet<Term> {
        &self.return_undef_vars
    }

    /// Execution hits undefined behavior when `ub` holds.
    pub fn add_ub(&mut self, ub: &Term) {
        self.domain &= &!ub;
    }

    pub fn domain(&self) -> &Term {
        &self.domain
    }

    pub fn add_pre(&mut self, cond: &Term) {
        self.precondition &= cond;
    }

    pub fn precondition(&self) -> &Term {
        &self.precondition
    }

    pub fn add_axiom(&mut self, axiom: &Term) {
        self.axioms &= axiom;
    }

    pub fn axioms(&self) -> &Term {
        &self.axioms
    }

    pub fn add_quant_var(&mut self, var: Term) {
        self.quant_vars.insert(var);
    }

    pub fn quant_vars(&self) -> &BTreeSet<Term> {
        &self.quant_vars
    }

    /// Register a variable standing for an undef value: any value may be
    /// chosen for it independently.
    pub fn add_undef_var(&mut self, var: Term) {
        self.undef_vars.insert(var);
    }

    pub fn undef_vars(&self) -> &BTreeSet<Term> {
        &self.undef_vars
    }
}
