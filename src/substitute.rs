//! Substitution over arena expressions.
//!
//! All rewriters return the original id when nothing changed, so untouched
//! sub-expressions keep their identity and stay shared.

use crate::expr::{ExprId, ExprKind};
use crate::module::Module;
use crate::traversal::gather_rvariables;

/// Replaces every free occurrence of the variable `name` with
/// `replacement`. A let binding of the same name shadows the substitution
/// in its body.
pub fn substitute(m: &mut Module, name: &str, replacement: ExprId, expr: ExprId) -> ExprId {
    rewrite(
        m,
        expr,
        Some(name),
        &mut |m, id| match m.kind(id) {
            ExprKind::Var { name: n, .. } if n == name => Some(replacement),
            _ => None,
        },
    )
}

/// Replaces every sub-expression structurally equal to `target` with
/// `replacement`.
pub fn substitute_expr(m: &mut Module, target: ExprId, replacement: ExprId, expr: ExprId) -> ExprId {
    rewrite(m, expr, None, &mut |m, id| {
        if m.expr_eq(id, target) {
            Some(replacement)
        } else {
            None
        }
    })
}

/// Inlines every let binding: `let v = e in b` becomes `b[v := e]` with the
/// binding value itself inlined first.
pub fn substitute_in_all_lets(m: &mut Module, expr: ExprId) -> ExprId {
    match m.kind(expr).clone() {
        ExprKind::Let { name, value, body } => {
            let value = substitute_in_all_lets(m, value);
            let body = substitute_in_all_lets(m, body);
            substitute(m, &name, value, body)
        }
        ExprKind::Const(_) | ExprKind::Var { .. } => expr,
        ExprKind::Cast(v) => {
            let nv = substitute_in_all_lets(m, v);
            if nv == v {
                expr
            } else {
                m.cast(m.ty(expr), nv)
            }
        }
        ExprKind::Binary { op, a, b } => {
            let na = substitute_in_all_lets(m, a);
            let nb = substitute_in_all_lets(m, b);
            if na == a && nb == b {
                expr
            } else {
                m.binary(op, na, nb)
            }
        }
        ExprKind::Cmp { op, a, b } => {
            let na = substitute_in_all_lets(m, a);
            let nb = substitute_in_all_lets(m, b);
            if na == a && nb == b {
                expr
            } else {
                m.cmp(op, na, nb)
            }
        }
        ExprKind::Select {
            cond,
            if_true,
            if_false,
        } => {
            let nc = substitute_in_all_lets(m, cond);
            let nt = substitute_in_all_lets(m, if_true);
            let nf = substitute_in_all_lets(m, if_false);
            if nc == cond && nt == if_true && nf == if_false {
                expr
            } else {
                m.select(nc, nt, nf)
            }
        }
        ExprKind::Call {
            kind,
            name,
            args,
            value_index,
        } => {
            let new_args: Vec<ExprId> = args
                .iter()
                .map(|&a| substitute_in_all_lets(m, a))
                .collect();
            if new_args == args {
                expr
            } else {
                let ty = m.ty(expr);
                m.push(
                    ExprKind::Call {
                        kind,
                        name,
                        args: new_args,
                        value_index,
                    },
                    ty,
                )
            }
        }
    }
}

/// Substitutes a variable in `expr` and additionally rewrites the
/// predicates of every reduction domain the result refers to. Reduction
/// predicates live on the domain, not in the expression tree, so a plain
/// substitution would miss them.
pub fn substitute_rdom_predicate(
    m: &mut Module,
    name: &str,
    replacement: ExprId,
    expr: ExprId,
) -> ExprId {
    let substituted = substitute(m, name, replacement, expr);
    let mut domains: Vec<_> = gather_rvariables(m, substituted)
        .into_values()
        .map(|info| info.rdom)
        .collect();
    domains.sort_unstable();
    domains.dedup();
    for dom in domains {
        if let Some(pred) = m.rdoms[dom.0].predicate {
            let new_pred = substitute(m, name, replacement, pred);
            m.rdoms[dom.0].predicate = Some(new_pred);
        }
    }
    substituted
}

/// Generic bottom-up rewriter. `rule` is consulted on the rebuilt node; a
/// `Some` result replaces it. A let binding of `shadow` stops the rewrite
/// from entering its body. Unchanged nodes keep their id.
fn rewrite(
    m: &mut Module,
    expr: ExprId,
    shadow: Option<&str>,
    rule: &mut dyn FnMut(&mut Module, ExprId) -> Option<ExprId>,
) -> ExprId {
    let rebuilt = match m.kind(expr).clone() {
        ExprKind::Const(_) | ExprKind::Var { .. } => expr,
        ExprKind::Cast(v) => {
            let nv = rewrite(m, v, shadow, rule);
            if nv == v {
                expr
            } else {
                m.cast(m.ty(expr), nv)
            }
        }
        ExprKind::Binary { op, a, b } => {
            let na = rewrite(m, a, shadow, rule);
            let nb = rewrite(m, b, shadow, rule);
            if na == a && nb == b {
                expr
            } else {
                m.binary(op, na, nb)
            }
        }
        ExprKind::Cmp { op, a, b } => {
            let na = rewrite(m, a, shadow, rule);
            let nb = rewrite(m, b, shadow, rule);
            if na == a && nb == b {
                expr
            } else {
                m.cmp(op, na, nb)
            }
        }
        ExprKind::Select {
            cond,
            if_true,
            if_false,
        } => {
            let nc = rewrite(m, cond, shadow, rule);
            let nt = rewrite(m, if_true, shadow, rule);
            let nf = rewrite(m, if_false, shadow, rule);
            if nc == cond && nt == if_true && nf == if_false {
                expr
            } else {
                m.select(nc, nt, nf)
            }
        }
        ExprKind::Let { name, value, body } => {
            let nv = rewrite(m, value, shadow, rule);
            let nb = if shadow == Some(name.as_str()) {
                body
            } else {
                rewrite(m, body, shadow, rule)
            };
            if nv == value && nb == body {
                expr
            } else {
                m.let_in(&name, nv, nb)
            }
        }
        ExprKind::Call {
            kind,
            name,
            args,
            value_index,
        } => {
            let new_args: Vec<ExprId> = args
                .iter()
                .map(|&a| rewrite(m, a, shadow, rule))
                .collect();
            if new_args == args {
                expr
            } else {
                let ty = m.ty(expr);
                m.push(
                    ExprKind::Call {
                        kind,
                        name,
                        args: new_args,
                        value_index,
                    },
                    ty,
                )
            }
        }
    };
    rule(m, rebuilt).unwrap_or(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_by_name() {
        let mut m = Module::new();
        let x = m.var("x");
        let one = m.lit(1i32);
        let e = m.add(x, one);
        let y = m.var("y");
        let out = substitute(&mut m, "x", y, e);
        assert_eq!(m.show(out).to_string(), "(y + 1)");
    }

    #[test]
    fn test_substitute_respects_shadowing() {
        let mut m = Module::new();
        let x_outer = m.var("x");
        let x_inner = m.var("x");
        let two = m.lit(2i32);
        let body = m.mul(x_inner, two);
        let bound = m.let_in("x", x_outer, body);
        let seven = m.lit(7i32);
        let out = substitute(&mut m, "x", seven, bound);
        // Only the binding value is rewritten; the body reference stays.
        assert_eq!(m.show(out).to_string(), "(let x = 7 in (x * 2))");
    }

    #[test]
    fn test_substitute_expr_is_structural() {
        let mut m = Module::new();
        let x1 = m.var("x");
        let x2 = m.var("x");
        let one = m.lit(1i32);
        let t1 = m.add(x1, one);
        let t2 = m.add(x2, one);
        let e = m.mul(t1, t2);
        let y = m.var("y");
        let target = {
            let x = m.var("x");
            let one = m.lit(1i32);
            m.add(x, one)
        };
        let out = substitute_expr(&mut m, target, y, e);
        assert_eq!(m.show(out).to_string(), "(y * y)");
    }

    #[test]
    fn test_substitute_in_all_lets() {
        let mut m = Module::new();
        let x = m.var("x");
        let one = m.lit(1i32);
        let value = m.add(x, one);
        let t = m.var("t");
        let body = m.mul(t, t);
        let e = m.let_in("t", value, body);
        let out = substitute_in_all_lets(&mut m, e);
        assert_eq!(m.show(out).to_string(), "((x + 1) * (x + 1))");
    }

    #[test]
    fn test_unchanged_expression_keeps_identity() {
        let mut m = Module::new();
        let x = m.var("x");
        let one = m.lit(1i32);
        let e = m.add(x, one);
        let z = m.lit(0i32);
        let out = substitute(&mut m, "missing", z, e);
        assert_eq!(out, e);
    }
}
