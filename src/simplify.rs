//! Bottom-up algebraic simplification.
//!
//! This is deliberately a small rule set: constant folding plus the
//! identities the differentiation engines lean on (`x + 0`, `x * 1`,
//! `x * 0`, `x - x`, select on a constant condition, dead lets). Unchanged
//! expressions keep their id so shared nodes stay shared.

use crate::expr::{BinOp, CmpOp, Const, ExprId, ExprKind, ScalarType};
use crate::module::Module;
use crate::traversal::has_variable;

pub fn simplify(m: &mut Module, expr: ExprId) -> ExprId {
    match m.kind(expr).clone() {
        ExprKind::Const(_) | ExprKind::Var { .. } => expr,
        ExprKind::Cast(v) => {
            let nv = simplify(m, v);
            let ty = m.ty(expr);
            if m.ty(nv) == ty {
                return nv;
            }
            if let Some(c) = m.is_const(nv) {
                return m.const_of(ty, c.to_f64());
            }
            if nv == v {
                expr
            } else {
                m.cast(ty, nv)
            }
        }
        ExprKind::Binary { op, a, b } => {
            let na = simplify(m, a);
            let nb = simplify(m, b);
            if let Some(folded) = simplify_binary(m, op, na, nb) {
                return folded;
            }
            if na == a && nb == b {
                expr
            } else {
                m.binary(op, na, nb)
            }
        }
        ExprKind::Cmp { op, a, b } => {
            let na = simplify(m, a);
            let nb = simplify(m, b);
            if let (Some(ca), Some(cb)) = (m.is_const(na), m.is_const(nb)) {
                let (l, r) = (ca.to_f64(), cb.to_f64());
                let v = match op {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    CmpOp::Eq => l == r,
                };
                return m.lit(v);
            }
            if op == CmpOp::Eq && m.expr_eq(na, nb) {
                return m.lit(true);
            }
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
            let nc = simplify(m, cond);
            let nt = simplify(m, if_true);
            let nf = simplify(m, if_false);
            if let Some(Const::Bool(c)) = m.is_const(nc) {
                return if c { nt } else { nf };
            }
            if m.expr_eq(nt, nf) {
                return nt;
            }
            if nc == cond && nt == if_true && nf == if_false {
                expr
            } else {
                m.select(nc, nt, nf)
            }
        }
        ExprKind::Let { name, value, body } => {
            let nv = simplify(m, value);
            let nb = simplify(m, body);
            if !has_variable(m, nb, &name) {
                return nb;
            }
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
            let new_args: Vec<ExprId> = args.iter().map(|&arg| simplify(m, arg)).collect();
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

fn simplify_binary(m: &mut Module, op: BinOp, a: ExprId, b: ExprId) -> Option<ExprId> {
    if let (Some(l), Some(r)) = (m.is_const(a), m.is_const(b)) {
        if let Some(folded) = fold(op, l, r, m.ty(a)) {
            return Some(m.push(ExprKind::Const(folded), folded.ty()));
        }
    }
    match op {
        BinOp::Add => {
            if m.is_zero(a) {
                return Some(b);
            }
            if m.is_zero(b) {
                return Some(a);
            }
        }
        BinOp::Sub => {
            if m.is_zero(b) {
                return Some(a);
            }
            if m.expr_eq(a, b) {
                return Some(m.zero(m.ty(a)));
            }
            // (x + c) - c => x, (c + x) - c => x
            if let ExprKind::Binary {
                op: BinOp::Add,
                a: aa,
                b: ab,
            } = *m.kind(a)
            {
                if m.expr_eq(ab, b) {
                    return Some(aa);
                }
                if m.expr_eq(aa, b) {
                    return Some(ab);
                }
            }
        }
        BinOp::Mul => {
            if m.is_zero(a) || m.is_zero(b) {
                return Some(m.zero(m.ty(a)));
            }
            if m.is_one(a) {
                return Some(b);
            }
            if m.is_one(b) {
                return Some(a);
            }
        }
        BinOp::Div => {
            if m.is_one(b) {
                return Some(a);
            }
            if m.is_zero(a) {
                return Some(a);
            }
            if m.expr_eq(a, b) {
                return Some(m.one(m.ty(a)));
            }
        }
        BinOp::Min | BinOp::Max => {
            if m.expr_eq(a, b) {
                return Some(a);
            }
        }
    }
    None
}

fn fold(op: BinOp, l: Const, r: Const, ty: ScalarType) -> Option<Const> {
    if ty.is_int() {
        let (a, b) = (l.to_f64() as i64, r.to_f64() as i64);
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            // Index division rounds towards negative infinity, matching
            // the interpreter.
            BinOp::Div => {
                if b == 0 {
                    return None;
                }
                a.div_euclid(b)
            }
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
        };
        return Some(Const::of(ty, v as f64));
    }
    if ty.is_float() {
        let (a, b) = (l.to_f64(), r.to_f64());
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
        };
        return Some(Const::of(ty, v));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    type Build = fn(&mut Module) -> ExprId;

    #[rstest]
    // Constant folding
    #[case::add_consts((|m| { let a = m.lit(1.0f32); let b = m.lit(2.0f32); m.add(a, b) }) as Build, "3")]
    #[case::int_div_floors((|m| { let a = m.lit(-3i32); let b = m.lit(4i32); m.div(a, b) }) as Build, "-1")]
    // Identities
    #[case::add_zero((|m| { let x = m.var("x"); let z = m.lit(0i32); m.add(x, z) }) as Build, "x")]
    #[case::zero_add((|m| { let x = m.var("x"); let z = m.lit(0i32); m.add(z, x) }) as Build, "x")]
    #[case::sub_self((|m| { let x = m.var("x"); let y = m.var("x"); m.sub(x, y) }) as Build, "0")]
    #[case::sub_cancels_add((|m| {
        let x = m.var("x"); let one = m.lit(1i32);
        let s = m.add(x, one); let one2 = m.lit(1i32); m.sub(s, one2)
    }) as Build, "x")]
    #[case::mul_zero((|m| { let x = m.var("x"); let z = m.lit(0.0f32); m.mul(x, z) }) as Build, "0")]
    #[case::mul_one((|m| { let x = m.var("x"); let o = m.lit(1.0f32); m.mul(o, x) }) as Build, "x")]
    #[case::div_one((|m| { let x = m.var("x"); let o = m.lit(1i32); m.div(x, o) }) as Build, "x")]
    #[case::div_self((|m| { let x = m.var("x"); let y = m.var("x"); m.div(x, y) }) as Build, "1")]
    #[case::min_self((|m| { let x = m.var("x"); let y = m.var("x"); m.min(x, y) }) as Build, "x")]
    // Select and comparisons
    #[case::select_true((|m| {
        let c = m.lit(true); let x = m.var("x"); let y = m.var("y"); m.select(c, x, y)
    }) as Build, "x")]
    #[case::select_folded_cond((|m| {
        let a = m.lit(1i32); let b = m.lit(2i32);
        let c = m.lt(b, a); let x = m.var("x"); let y = m.var("y"); m.select(c, x, y)
    }) as Build, "y")]
    #[case::eq_self((|m| { let x = m.var("x"); let y = m.var("x"); m.eq(x, y) }) as Build, "true")]
    // Lets
    #[case::dead_let((|m| {
        let v = m.var("v"); let x = m.var("x"); m.let_in("t", v, x)
    }) as Build, "x")]
    // Casts
    #[case::cast_const((|m| { let c = m.lit(3i32); m.cast(ScalarType::F32, c) }) as Build, "3")]
    fn test_simplify(#[case] build: Build, #[case] expected: &str) {
        let mut m = Module::new();
        let e = build(&mut m);
        let s = simplify(&mut m, e);
        assert_eq!(m.show(s).to_string(), expected);
    }

    #[test]
    fn test_nested_simplification() {
        let mut m = Module::new();
        let x = m.var("x");
        let z = m.lit(0i32);
        let o = m.lit(1i32);
        let inner = m.mul(x, o);
        let e = m.add(inner, z);
        let s = simplify(&mut m, e);
        assert_eq!(m.show(s).to_string(), "x");
    }

    #[test]
    fn test_unchanged_keeps_identity() {
        let mut m = Module::new();
        let x = m.var("x");
        let y = m.var("y");
        let e = m.add(x, y);
        assert_eq!(simplify(&mut m, e), e);
    }
}
