//! Boundary to the intermediate representation.
//!
//! The verifier does not know instruction semantics. A program fragment is
//! anything implementing [`Function`]: it reports its typing constraints,
//! accepts a chosen typing, and executes itself into a [`State`].

use std::fmt;

use refine_smt::{Context, Model, Term};

use crate::errors::VerifyError;
use crate::state::State;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Source => "Source",
            Side::Target => "Target",
        })
    }
}

/// Concrete type of a value once typing is fixed.
///
/// Aggregates are laid out as one bit-vector, child 0 in the lowest bits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Int(u32),
    Vector { lanes: u32, elem: Box<Type> },
    Struct(Vec<Type>),
}

impl Type {
    pub fn bits(&self) -> u32 {
        match self {
            Type::Int(w) => *w,
            Type::Vector { lanes, elem } => lanes * elem.bits(),
            Type::Struct(fields) => fields.iter().map(Type::bits).sum(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Type::Int(_))
    }

    pub fn num_children(&self) -> usize {
        match self {
            Type::Int(_) => 0,
            Type::Vector { lanes, .. } => *lanes as usize,
            Type::Struct(fields) => fields.len(),
        }
    }

    pub fn child(&self, i: usize) -> Option<&Type> {
        match self {
            Type::Int(_) => None,
            Type::Vector { lanes, elem } => (i < *lanes as usize).then_some(elem.as_ref()),
            Type::Struct(fields) => fields.get(i),
        }
    }

    fn child_offset(&self, i: usize) -> u32 {
        match self {
            Type::Int(_) => 0,
            Type::Vector { elem, .. } => i as u32 * elem.bits(),
            Type::Struct(fields) => fields[..i].iter().map(Type::bits).sum(),
        }
    }

    /// Child `i` of an aggregate value. The poison flag of an aggregate is a
    /// bit-vector with one bit per child; a boolean flag covers every child.
    ///
    /// # Panics
    /// If the type is not an aggregate or `i` is out of range.
    pub fn extract_child(&self, val: &StateValue, i: usize) -> StateValue {
        let child = self
            .child(i)
            .unwrap_or_else(|| panic!("type {self} has no child {i}"));
        let lo = self.child_offset(i);
        let value = val.value.extract(lo + child.bits() - 1, lo);
        let non_poison = if val.non_poison.is_bool() {
            val.non_poison.clone()
        } else {
            let idx = i as u32;
            val.non_poison
                .extract(idx, idx)
                .equal(&val.non_poison.context().mk_uint(1, 1))
        };
        StateValue { value, non_poison }
    }

    /// Refinement of `src` by `tgt` at this type, split into the poison part
    /// and the value part.
    pub fn refines(&self, src: &StateValue, tgt: &StateValue) -> (Term, Term) {
        if !self.is_aggregate() {
            let poison = src.non_poison.implies(&tgt.non_poison);
            let both = &src.non_poison & &tgt.non_poison;
            let value = both.implies(&src.value.equal(&tgt.value));
            return (poison, value);
        }
        let ctx = src.value.context();
        let mut poison = ctx.mk_true();
        let mut value = ctx.mk_true();
        for i in 0..self.num_children() {
            let child = self.child(i).unwrap_or(self);
            let (p, v) = child.refines(&self.extract_child(src, i), &self.extract_child(tgt, i));
            poison &= &p;
            value &= &v;
        }
        (poison, value)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int(w) => write!(f, "i{w}"),
            Type::Vector { lanes, elem } => write!(f, "<{lanes} x {elem}>"),
            Type::Struct(fields) => {
                f.write_str("{")?;
                for (i, t) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{t}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Input,
    ConstantInput,
    Instr,
}

/// A named program value as the verifier sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub name: String,
    pub kind: ValueKind,
    pub ty: Type,
}

impl Value {
    pub fn new(name: impl Into<String>, kind: ValueKind, ty: Type) -> Self {
        Self {
            name: name.into(),
            kind,
            ty,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, ValueKind::Input | ValueKind::ConstantInput)
    }

    pub fn is_instr(&self) -> bool {
        self.kind == ValueKind::Instr
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ty, self.name)
    }
}

/// Symbolic value paired with the condition under which it is not poison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateValue {
    pub value: Term,
    pub non_poison: Term,
}

impl StateValue {
    pub fn new(value: Term, non_poison: Term) -> Self {
        Self { value, non_poison }
    }

    /// A value that is never poison.
    pub fn defined(value: Term) -> Self {
        let non_poison = value.context().mk_true();
        Self { value, non_poison }
    }
}

/// A program fragment: one side of a transform.
pub trait Function: Send {
    fn name(&self) -> &str;

    /// Boolean constraint over type-selector variables. It holds exactly for
    /// the typings under which the fragment is well typed.
    fn type_constraints(&self, ctx: &Context) -> Term;

    /// Term naming the type chosen for `value` (the return value when `None`),
    /// or `None` when that type is not ambiguous. Source and target selectors
    /// are required to be equal.
    fn type_selector(&self, _ctx: &Context, _value: Option<&str>) -> Option<Term> {
        None
    }

    /// Names of the fragment's instructions, in program order.
    fn instr_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Commit to the typing in `typing`.
    fn fixup_types(&mut self, typing: &Model);

    /// Build the symbolic state of this fragment.
    fn execute(&self, side: Side, ctx: &Context) -> Result<State, VerifyError>;

    /// Print the fragment, with or without its header line.
    fn print(&self, out: &mut dyn fmt::Write, print_header: bool) -> fmt::Result;
}

/// Side condition restricting the inputs a transform is checked on.
pub trait Predicate: Send + fmt::Display {
    fn type_constraints(&self, ctx: &Context) -> Term {
        ctx.mk_true()
    }

    /// The condition over the source state's values.
    fn to_smt(&self, src: &State) -> Term;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_layout_and_display() {
        let ty = Type::Struct(vec![
            Type::Int(8),
            Type::Vector {
                lanes: 2,
                elem: Box::new(Type::Int(4)),
            },
        ]);
        assert_eq!(ty.to_string(), "{i8, <2 x i4>}");
        assert_eq!(ty.bits(), 16);
        assert_eq!(ty.num_children(), 2);
        assert_eq!(ty.child_offset(1), 8);
    }

    #[test]
    fn extract_child_reads_per_lane_poison() {
        let ctx = Context::new();
        let ty = Type::Vector {
            lanes: 2,
            elem: Box::new(Type::Int(4)),
        };
        let v = StateValue::new(ctx.mk_uint(0x5a, 8), ctx.mk_uint(0b10, 2));
        let lane0 = ty.extract_child(&v, 0);
        let lane1 = ty.extract_child(&v, 1);
        assert_eq!(lane0.value.as_uint(), Some(0xa));
        assert!(lane0.non_poison.is_false());
        assert_eq!(lane1.value.as_uint(), Some(0x5));
        assert!(lane1.non_poison.is_true());
    }

    #[test]
    fn int_refinement_allows_poison_source() {
        let ctx = Context::new();
        let ty = Type::Int(8);
        let poison = StateValue::new(ctx.mk_uint(1, 8), ctx.mk_false());
        let two = StateValue::defined(ctx.mk_uint(2, 8));
        let (p, v) = ty.refines(&poison, &two);
        assert!(p.is_true() && v.is_true());
        let (p, v) = ty.refines(&two, &poison);
        assert!(p.is_false());
        assert!(v.is_true());
    }

    #[test]
    fn aggregate_refinement_checks_every_child() {
        let ctx = Context::new();
        let ty = Type::Struct(vec![Type::Int(4), Type::Int(4)]);
        let a = StateValue::defined(ctx.mk_uint(0x12, 8));
        let b = StateValue::defined(ctx.mk_uint(0x13, 8));
        let (p, v) = ty.refines(&a, &b);
        assert!(p.is_true());
        assert!(v.is_false());
    }
}
