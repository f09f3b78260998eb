//! Boundary conditions: extending a function with an out-of-range default.

use crate::bounds::BoundsBox;
use crate::expr::ExprId;
use crate::module::Module;

/// Builds `{func}_ce`: a wrapper returning `func` inside `bounds` and zero
/// outside, so consumers may read past the traced region. Returns the
/// wrapper's name.
pub fn extend_with_default(m: &mut Module, func: &str, bounds: &BoundsBox) -> String {
    let f = m.funcs[func].clone();
    assert_eq!(f.dimensions(), bounds.len(), "bounds box rank mismatch");
    let wrapper = format!("{func}_ce");

    let arg_vars: Vec<ExprId> = f.args.iter().map(|a| m.var(a)).collect::<Vec<_>>();
    let mut cond: Option<ExprId> = None;
    for (dim, &var) in arg_vars.iter().enumerate() {
        let lo = m.lit(bounds[dim].min as i32);
        let hi = m.lit(bounds[dim].max as i32);
        let above = m.ge(var, lo);
        let below = m.le(var, hi);
        let in_dim = m.and(above, below);
        cond = Some(match cond {
            Some(c) => m.and(c, in_dim),
            None => in_dim,
        });
    }
    let cond = cond.expect("boundary wrapper of a zero-dimensional function");

    let value_count = m.funcs[func].values().len();
    let mut values = Vec::with_capacity(value_count);
    for i in 0..value_count {
        let read = m.read_elem(func, arg_vars.clone(), i);
        let hot = m.likely(read);
        let zero = m.zero(m.ty(read));
        values.push(m.select(cond, hot, zero));
    }
    let args: Vec<&str> = f.args.iter().map(String::as_str).collect();
    m.define(&wrapper, &args, values);
    wrapper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Interval;

    #[test]
    fn test_wrapper_guards_all_dimensions() {
        let mut m = Module::new();
        let one = m.lit(1.0f32);
        m.define("f", &["x", "y"], vec![one]);
        let name = extend_with_default(&mut m, "f", &vec![Interval::new(0, 3), Interval::new(1, 2)]);
        assert_eq!(name, "f_ce");
        let w = m.func("f_ce").unwrap();
        assert_eq!(w.args, vec!["x", "y"]);
        let shown = m.show(w.values()[0]).to_string();
        assert!(shown.contains("likely(f(x, y))"), "got {shown}");
        assert!(shown.contains("(y <= 2)"), "got {shown}");
    }
}
