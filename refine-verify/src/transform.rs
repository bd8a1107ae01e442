use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::{self, Write};

use rayon::prelude::*;
use refine_smt::{Context, Model, Query, SatResult, Solver, Term};
use tracing::{debug, info, warn};

use crate::config::VerifyConfig;
use crate::errors::{Errors, VerifyError};
use crate::ir::{Function, Predicate, Side, StateValue, Type, Value};
use crate::printer::{DefaultPrinter, ModelPrinter};
use crate::state::State;
use crate::typing::TypingAssignments;

#[derive(Clone, Copy, Debug)]
pub struct TransformPrintOpts {
    pub print_fn_header: bool,
}

impl Default for TransformPrintOpts {
    fn default() -> Self {
        Self {
            print_fn_header: true,
        }
    }
}

/// A source/target pair to check, with an optional precondition.
pub struct Transform {
    pub name: String,
    pub src: Box<dyn Function>,
    pub tgt: Box<dyn Function>,
    pub precondition: Option<Box<dyn Predicate>>,
}

impl Transform {
    pub fn new(name: impl Into<String>, src: Box<dyn Function>, tgt: Box<dyn Function>) -> Self {
        Self {
            name: name.into(),
            src,
            tgt,
            precondition: None,
        }
    }

    pub fn with_precondition(mut self, pre: Box<dyn Predicate>) -> Self {
        self.precondition = Some(pre);
        self
    }

    pub fn print(&self, out: &mut dyn Write, opts: TransformPrintOpts) -> fmt::Result {
        out.write_str("\n----------------------------------------\n")?;
        if !self.name.is_empty() {
            writeln!(out, "Name: {}", self.name)?;
        }
        if let Some(pre) = &self.precondition {
            writeln!(out, "Pre: {pre}")?;
        }
        self.src.print(out, opts.print_fn_header)?;
        out.write_str("=>\n")?;
        self.tgt.print(out, opts.print_fn_header)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f, TransformPrintOpts::default())
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.name)
            .field("src", &self.src.name())
            .field("tgt", &self.tgt.name())
            .field("has_precondition", &self.precondition.is_some())
            .finish()
    }
}

/// Close `e` over the quantified variables: booleans are expanded in place,
/// the others are universally quantified. Variables `e` does not mention are
/// dropped.
pub fn preprocess(qvars: &BTreeSet<Term>, undef_qvars: &BTreeSet<Term>, e: Term) -> Term {
    let free = e.free_vars();
    let mut e = e;
    let mut bound = Vec::new();
    for var in qvars.iter().chain(undef_qvars).filter(|v| free.contains(*v)) {
        if var.is_bool() {
            let ctx = var.context();
            e = e.subst(var, &ctx.mk_true()) & e.subst(var, &ctx.mk_false());
        } else if !bound.contains(var) {
            bound.push(var.clone());
        }
    }
    Term::forall(&bound, &e)
}

/// Record the outcome of a failed refinement query in `errs`.
///
/// `Unknown` becomes an inconclusive record. `Sat` becomes a refinement
/// record whose report lists the inputs, the intermediate values up to `var`
/// and whatever `print_var_val` adds.
#[allow(clippy::too_many_arguments)]
pub fn error(
    errs: &mut Errors,
    src: &State,
    tgt: &State,
    r: &SatResult,
    var: Option<&Value>,
    msg: &str,
    check_each_var: bool,
    printer: &dyn ModelPrinter,
    print_var_val: impl FnOnce(&mut dyn Write, &Model) -> fmt::Result,
) {
    let model = match r {
        SatResult::Unsat => return,
        SatResult::Unknown(reason) => {
            errs.add(VerifyError::Inconclusive(reason.clone()));
            return;
        }
        SatResult::Sat(m) => m,
    };

    let mut s = String::new();
    let written = write_report(&mut s, src, tgt, model, var, msg, check_each_var, printer)
        .and_then(|()| print_var_val(&mut s, model));
    if written.is_err() {
        warn!(msg, "counterexample rendering failed");
    }
    errs.add(VerifyError::Refinement {
        message: msg.to_string(),
        var: var.map(|v| v.name.clone()),
        model: model.clone(),
        report: s,
    });
}

#[allow(clippy::too_many_arguments)]
fn write_report(
    s: &mut String,
    src: &State,
    tgt: &State,
    m: &Model,
    var: Option<&Value>,
    msg: &str,
    check_each_var: bool,
    printer: &dyn ModelPrinter,
) -> fmt::Result {
    let var_name = var.map(|v| v.name.as_str()).unwrap_or("");
    s.push_str(msg);
    if let Some(v) = var {
        write!(s, " for {v}")?;
    }
    s.push_str("\n\nExample:\n");
    for (v, val) in src.values() {
        if !v.is_input() {
            continue;
        }
        write!(s, "{v} = ")?;
        printer.print_model_val(s, src, m, Some(v), &v.ty, val, 0)?;
        s.push('\n');
    }

    let mut seen = BTreeSet::new();
    for st in [src, tgt] {
        if !check_each_var {
            write!(s, "\n{}:\n", st.side())?;
        }
        for (v, val) in st.values() {
            if v.name == var_name {
                break;
            }
            if !v.is_instr() || (check_each_var && !seen.insert(v.name.as_str())) {
                continue;
            }
            write!(s, "{v} = ")?;
            printer.print_model_val(s, st, m, Some(v), &v.ty, val, 0)?;
            s.push('\n');
        }
        if check_each_var {
            break;
        }
    }
    Ok(())
}

/// Verifier for one transform.
pub struct TransformVerify<'t> {
    t: &'t mut Transform,
    ctx: Context,
    config: VerifyConfig,
    printer: &'t dyn ModelPrinter,
}

impl<'t> TransformVerify<'t> {
    /// Terms for this transform live in a fresh context.
    pub fn new(t: &'t mut Transform, config: VerifyConfig) -> Self {
        Self {
            t,
            ctx: Context::new(),
            config,
            printer: &DefaultPrinter,
        }
    }

    pub fn with_printer(mut self, printer: &'t dyn ModelPrinter) -> Self {
        self.printer = printer;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn transform(&self) -> &Transform {
        &*self.t
    }

    /// Execute both fragments under the current typing.
    pub fn exec(&self) -> Result<(State, State), VerifyError> {
        let src = self.t.src.execute(Side::Source, &self.ctx)?;
        let tgt = self.t.tgt.execute(Side::Target, &self.ctx)?;
        Ok((src, tgt))
    }

    /// Typings under which both fragments, and the precondition, are well
    /// typed and agree on the return type. With `check_each_var`, values of
    /// the same name must agree too.
    pub fn get_typings(&self) -> Result<TypingAssignments, VerifyError> {
        let ctx = &self.ctx;
        let mut c = self.t.src.type_constraints(ctx) & self.t.tgt.type_constraints(ctx);
        if let Some(pre) = &self.t.precondition {
            c &= &pre.type_constraints(ctx);
        }
        if let (Some(a), Some(b)) = (
            self.t.src.type_selector(ctx, None),
            self.t.tgt.type_selector(ctx, None),
        ) {
            c &= &a.equal(&b);
        }
        if self.config.check_each_var {
            for name in self.t.src.instr_names() {
                if let (Some(a), Some(b)) = (
                    self.t.src.type_selector(ctx, Some(&name)),
                    self.t.tgt.type_selector(ctx, Some(&name)),
                ) {
                    c &= &a.equal(&b);
                }
            }
        }
        TypingAssignments::new(&c, &self.config.solver)
    }

    pub fn fixup_types(&mut self, ty: &TypingAssignments) {
        if let Some(m) = ty.model() {
            self.t.src.fixup_types(m);
            self.t.tgt.fixup_types(m);
        }
    }

    /// Check refinement under the typing currently fixed.
    pub fn verify(&self) -> Errors {
        let mut errs = Errors::new();
        if let Err(e) = self.verify_into(&mut errs) {
            errs.add(e);
        }
        errs
    }

    fn verify_into(&self, errs: &mut Errors) -> Result<(), VerifyError> {
        let (src, tgt) = self.exec()?;
        let mut solver = Solver::new(&self.config.solver)?;

        if self.config.check_each_var {
            for (var, a) in src.values() {
                if !var.is_instr() {
                    continue;
                }
                let Some((_, b)) = tgt.lookup(&var.name) else {
                    debug!(var = %var.name, "no target value of the same name");
                    continue;
                };
                self.check_refinement(errs, &mut solver, &src, &tgt, Some(var), &var.ty, a, b, None)?;
                if !errs.is_empty() {
                    return Ok(());
                }
            }
        }

        match (src.return_value(), tgt.return_value()) {
            (Some((ty, a)), Some((_, b))) => {
                let undef = src.return_undef_vars();
                self.check_refinement(errs, &mut solver, &src, &tgt, None, ty, a, b, Some(undef))?;
            }
            (None, None) => {}
            _ => errs.add(VerifyError::ReturnDomain),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_refinement(
        &self,
        errs: &mut Errors,
        solver: &mut Solver,
        src: &State,
        tgt: &State,
        var: Option<&Value>,
        ty: &Type,
        a: &StateValue,
        b: &StateValue,
        undef: Option<&BTreeSet<Term>>,
    ) -> Result<(), VerifyError> {
        if a.value.sort() != b.value.sort() {
            return Err(VerifyError::Execution(format!(
                "{} has sort {} in the source but {} in the target",
                var.map(|v| v.name.as_str()).unwrap_or("return value"),
                a.value.sort(),
                b.value.sort()
            )));
        }

        let mut pre = match &self.t.precondition {
            Some(p) => p.to_smt(src),
            None => self.ctx.mk_true(),
        };
        pre &= &(src.precondition() & tgt.precondition());
        let axioms = src.axioms() & tgt.axioms();

        let qvars = src.quant_vars();
        let mut undef_qvars = src.undef_vars().clone();
        if let Some(u) = undef {
            undef_qvars.extend(u.iter().cloned());
        }

        let dom_a = src.domain();
        let dom_b = tgt.domain();
        let dom = dom_a & dom_b;
        let (poison_cnstr, value_cnstr) = ty.refines(a, b);

        let close = |e: Term| &axioms & &preprocess(qvars, &undef_qvars, e);
        let failure: RefCell<Option<(SatResult, &'static str, bool)>> = RefCell::new(None);
        let on = |msg: &'static str, print_value: bool| {
            let failure = &failure;
            move |r: &SatResult| *failure.borrow_mut() = Some((r.clone(), msg, print_value))
        };
        solver.check_queries(vec![
            Query::new(
                close(&pre & &dom_a.not_implies(dom_b)),
                on("Source is more defined than target", false),
            ),
            Query::new(
                close(&pre & &(&dom & &!&poison_cnstr)),
                on("Target is more poisonous than source", true),
            ),
            Query::new(
                close(&pre & &(&dom & &!&value_cnstr)),
                on("Value mismatch", true),
            ),
        ])?;

        if let Some((r, msg, print_value)) = failure.into_inner() {
            debug!(msg, var = var.map(|v| v.name.as_str()), "refinement query failed");
            error(
                errs,
                src,
                tgt,
                &r,
                var,
                msg,
                self.config.check_each_var,
                self.printer,
                |s, m| {
                    if !print_value {
                        return Ok(());
                    }
                    s.write_str("Source value: ")?;
                    self.printer.print_model_val(s, src, m, var, ty, a, 0)?;
                    s.write_str("\nTarget value: ")?;
                    self.printer.print_model_val(s, tgt, m, var, ty, b, 0)?;
                    s.write_char('\n')
                },
            );
        }
        Ok(())
    }

    /// Verify under every typing, stopping at the first one that fails.
    pub fn run(&mut self) -> Errors {
        let mut typings = match self.get_typings() {
            Ok(t) => t,
            Err(e) => {
                let mut errs = Errors::new();
                errs.add(e);
                return errs;
            }
        };
        if typings.is_unsat() {
            info!(transform = %self.t.name, "no valid typing");
            let mut errs = Errors::new();
            errs.add(VerifyError::TypeInference);
            return errs;
        }

        while typings.has_typing() {
            // a lone typing with no selectors leaves nothing to fix up
            let trivial = typings.has_single_typing() && typings.model().is_some_and(Model::is_empty);
            if !trivial {
                self.fixup_types(&typings);
            }
            let errs = self.verify();
            if !errs.is_empty() {
                info!(
                    transform = %self.t.name,
                    typing = typings.visited(),
                    unsound = errs.is_unsound(),
                    "transform doesn't verify"
                );
                return errs;
            }
            if let Err(e) = typings.advance() {
                let mut errs = Errors::new();
                errs.add(e);
                return errs;
            }
        }
        info!(transform = %self.t.name, typings = typings.visited(), "transform verified");
        Errors::new()
    }
}

/// Verify independent transforms in parallel, each with its own term context
/// and solver sessions. Results are in input order.
pub fn verify_transforms(transforms: &mut [Transform], config: &VerifyConfig) -> Vec<Errors> {
    transforms
        .par_iter_mut()
        .map(|t| TransformVerify::new(t, config.clone()).run())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_expands_booleans_and_binds_the_rest() {
        let ctx = Context::new();
        let b = ctx.mk_bool_var("b");
        let u = ctx.mk_var("u", 4);
        let x = ctx.mk_var("x", 4);
        let unused = ctx.mk_var("unused", 4);
        let e = Term::mk_if(&b, &x.equal(&u), &x.ult(&u));
        let q: BTreeSet<Term> = [b.clone(), unused.clone()].into_iter().collect();
        let undef: BTreeSet<Term> = [u.clone()].into_iter().collect();

        let out = preprocess(&q, &undef, e);
        let free = out.free_vars();
        assert!(free.contains(&x));
        assert!(!free.contains(&b) && !free.contains(&u) && !free.contains(&unused));
        // forall u. x == u && x <u u  is false for every x
        let mut m = Model::new();
        m.insert(x.clone(), ctx.mk_uint(3, 4));
        assert_eq!(m.get_bool(&out), Some(false));
    }

    #[test]
    fn preprocess_without_quantified_vars_is_identity() {
        let ctx = Context::new();
        let x = ctx.mk_var("x", 4);
        let e = x.ugt(&ctx.mk_uint(2, 4));
        assert_eq!(preprocess(&BTreeSet::new(), &BTreeSet::new(), e.clone()), e);
    }
}
