use std::fmt::{self, Write};

use refine_smt::Model;

use crate::ir::{StateValue, Type, Value};
use crate::state::State;

/// Renders concrete counterexample values.
pub trait ModelPrinter: Sync {
    /// Print `val`, of type `ty`, as it evaluates under `model`. `child` is the
    /// index of `val` inside its parent aggregate, `0` at the top level.
    #[allow(clippy::too_many_arguments)]
    fn print_model_val(
        &self,
        out: &mut dyn Write,
        state: &State,
        model: &Model,
        var: Option<&Value>,
        ty: &Type,
        val: &StateValue,
        child: usize,
    ) -> fmt::Result;
}

/// Prints integers as `#x05 (5)`, negative ones as `#xff (255, -1)`, poison
/// as `poison`, and aggregates element-wise.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPrinter;

impl ModelPrinter for DefaultPrinter {
    fn print_model_val(
        &self,
        out: &mut dyn Write,
        state: &State,
        model: &Model,
        var: Option<&Value>,
        ty: &Type,
        val: &StateValue,
        child: usize,
    ) -> fmt::Result {
        if val.non_poison.is_bool() && model.get_bool(&val.non_poison) == Some(false) {
            return out.write_str("poison");
        }

        if !ty.is_aggregate() {
            let c = model.eval(&val.value);
            return match c.as_big_uint() {
                Some(u) => {
                    write!(out, "{c} ({u}")?;
                    if let Some(i) = c.as_int().filter(|i| *i < 0) {
                        write!(out, ", {i}")?;
                    }
                    out.write_char(')')
                }
                None => write!(out, "{c}"),
            };
        }

        print_aggregate(self, out, state, model, var, ty, val)
    }
}

/// Print an aggregate as `{ a, b }` (structs) or `< a, b >` (vectors), handing
/// each child to `printer` with its index in `ty`.
pub fn print_aggregate(
    printer: &(impl ModelPrinter + ?Sized),
    out: &mut dyn Write,
    state: &State,
    model: &Model,
    var: Option<&Value>,
    ty: &Type,
    val: &StateValue,
) -> fmt::Result {
    let (open, close) = match ty {
        Type::Struct(_) => ("{ ", " }"),
        _ => ("< ", " >"),
    };
    out.write_str(open)?;
    for i in 0..ty.num_children() {
        if i > 0 {
            out.write_str(", ")?;
        }
        let child_ty = ty.child(i).unwrap_or(ty);
        let child_val = ty.extract_child(val, i);
        printer.print_model_val(out, state, model, var, child_ty, &child_val, i)?;
    }
    out.write_str(close)
}
