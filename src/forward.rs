//! Forward-mode accumulation: tangent propagation through a function
//! pipeline.
//!
//! Unlike the reverse engine this needs no scattering: each function's
//! tangent is itself a function of the same shape, so a single topological
//! walk rewrites every stage value through the per-node chain rule while a
//! tangent table maps already-transformed producers to their tangents.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{DerivativeError, Result};
use crate::expr::{BinOp, CallKind, ExprId, ExprKind};
use crate::module::Module;
use crate::simplify::simplify;
use crate::traversal::realization_order;

/// Shadow bindings for let-bound tangents, pushed and popped as the walk
/// enters and leaves each binding.
#[derive(Debug, Default)]
pub struct LexicalScope {
    stack: Vec<(String, ExprId)>,
}

impl LexicalScope {
    pub fn new() -> Self {
        LexicalScope::default()
    }

    pub fn push(&mut self, name: &str, tangent: ExprId) {
        self.stack.push((name.to_string(), tangent));
    }

    pub fn pop(&mut self, name: &str) {
        let popped = self.stack.pop();
        debug_assert!(matches!(&popped, Some((n, _)) if n == name));
    }

    pub fn get(&self, name: &str) -> Option<ExprId> {
        self.stack
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|&(_, t)| t)
    }
}

/// The result of a forward pass: the transformed module and the name of
/// the forward-transformed output function.
#[derive(Debug, Clone)]
pub struct Tangents {
    pub module: Module,
    pub output: String,
}

/// Transforms every function reachable from `output` into its tangent,
/// chaining per-function results through the table: each transformed
/// function becomes the tangent source for its dependents, across the pure
/// definition and every update stage in order.
pub fn propagate_tangents(
    module: &Module,
    output: &str,
    tangents: &BTreeMap<String, String>,
) -> Result<Tangents> {
    let mut m = module.clone();
    let order = realization_order(&m, output)?;
    let mut table = tangents.clone();
    debug!("forward pass over {} functions", order.len());

    for name in &order {
        let f = m.funcs[name].clone();
        let fwd_name = format!("{name}_fwd");
        for (stage_index, stage) in f.stages.iter().enumerate() {
            let mut values = Vec::with_capacity(stage.values.len());
            for &value in &stage.values {
                let mut scope = LexicalScope::new();
                let tangent = propagate_tangent(&mut m, value, &table, &mut scope)?;
                values.push(tangent);
            }
            if stage_index == 0 {
                let arg_refs: Vec<&str> = f.args.iter().map(String::as_str).collect();
                m.define(&fwd_name, &arg_refs, values);
                // From here on, self-references resolve to the tangent.
                table.insert(name.clone(), fwd_name.clone());
            } else {
                let lhs = stage.lhs.clone().expect("update stage carries write indices");
                m.define_update(&fwd_name, lhs, values, stage.rdom);
            }
        }
    }

    Ok(Tangents {
        module: m,
        output: format!("{output}_fwd"),
    })
}

/// Tangent of one expression under the chain rule. `tangents` maps
/// stored-function/buffer names to their tangent functions; anything
/// absent differentiates to zero.
pub fn propagate_tangent(
    m: &mut Module,
    expr: ExprId,
    tangents: &BTreeMap<String, String>,
    scope: &mut LexicalScope,
) -> Result<ExprId> {
    let ty = m.ty(expr);
    match m.kind(expr).clone() {
        ExprKind::Const(_) | ExprKind::Cmp { .. } => Ok(m.zero(ty)),
        ExprKind::Var { name, .. } => Ok(scope.get(&name).unwrap_or_else(|| m.zero(ty))),
        ExprKind::Cast(v) => {
            let d = propagate_tangent(m, v, tangents, scope)?;
            Ok(m.cast(ty, d))
        }
        ExprKind::Binary { op, a, b } => {
            let da = propagate_tangent(m, a, tangents, scope)?;
            let db = propagate_tangent(m, b, tangents, scope)?;
            let d = match op {
                BinOp::Add => m.add(da, db),
                BinOp::Sub => m.sub(da, db),
                BinOp::Mul => {
                    // d(fg) = f dg + g df
                    let t0 = m.mul(a, db);
                    let t1 = m.mul(da, b);
                    m.add(t0, t1)
                }
                BinOp::Div => {
                    // d(f/g) = (g df - f dg) / g^2
                    let t0 = m.mul(b, da);
                    let t1 = m.mul(a, db);
                    let num = m.sub(t0, t1);
                    let den = m.mul(b, b);
                    m.div(num, den)
                }
                BinOp::Min => {
                    let c = m.lt(a, b);
                    m.select(c, da, db)
                }
                BinOp::Max => {
                    let c = m.gt(a, b);
                    m.select(c, da, db)
                }
            };
            Ok(simplify(m, d))
        }
        ExprKind::Select {
            cond,
            if_true,
            if_false,
        } => {
            let dt = propagate_tangent(m, if_true, tangents, scope)?;
            let df = propagate_tangent(m, if_false, tangents, scope)?;
            Ok(m.select(cond, dt, df))
        }
        ExprKind::Let { name, value, body } => {
            let dvalue = propagate_tangent(m, value, tangents, scope)?;
            let fwd_name = format!("{name}_fwd");
            let shadow = m.var(&fwd_name);
            scope.push(&name, shadow);
            let dbody = propagate_tangent(m, body, tangents, scope)?;
            scope.pop(&name);
            let inner = m.let_in(&fwd_name, dvalue, dbody);
            Ok(m.let_in(&name, value, inner))
        }
        ExprKind::Call {
            kind,
            name,
            args,
            value_index,
        } => match kind {
            CallKind::Extern => extern_tangent(m, &name, expr, &args, tangents, scope),
            CallKind::Intrinsic => intrinsic_tangent(m, &name, expr, &args, tangents, scope),
            CallKind::Function | CallKind::Buffer => match tangents.get(&name) {
                Some(tangent_fn) => {
                    let tangent_fn = tangent_fn.clone();
                    Ok(m.read_elem(&tangent_fn, args, value_index))
                }
                None => Ok(m.zero(ty)),
            },
        },
    }
}

fn extern_tangent(
    m: &mut Module,
    name: &str,
    expr: ExprId,
    args: &[ExprId],
    tangents: &BTreeMap<String, String>,
    scope: &mut LexicalScope,
) -> Result<ExprId> {
    let ty = m.ty(expr);
    let x = args[0];
    let out = match name {
        "exp" => {
            // d exp(f) = exp(f) f'
            let d = propagate_tangent(m, x, tangents, scope)?;
            m.mul(expr, d)
        }
        "log" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            m.div(d, x)
        }
        "sin" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let c = m.call_extern("cos", vec![x], ty);
            m.mul(c, d)
        }
        "cos" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let s = m.call_extern("sin", vec![x], ty);
            let ns = m.neg(s);
            m.mul(ns, d)
        }
        "tan" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let c = m.call_extern("cos", vec![x], ty);
            let cc = m.mul(c, c);
            m.div(d, cc)
        }
        "asin" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let one = m.one(ty);
            let xx = m.mul(x, x);
            let diff = m.sub(one, xx);
            let den = m.call_extern("sqrt", vec![diff], ty);
            m.div(d, den)
        }
        "acos" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let one = m.one(ty);
            let xx = m.mul(x, x);
            let diff = m.sub(one, xx);
            let den = m.call_extern("sqrt", vec![diff], ty);
            let nd = m.neg(d);
            m.div(nd, den)
        }
        "atan" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let one = m.one(ty);
            let xx = m.mul(x, x);
            let den = m.add(xx, one);
            m.div(d, den)
        }
        "atan2" => {
            // d atan2(f, g) = (g f' - f g') / (f^2 + g^2)
            let y = args[0];
            let x = args[1];
            let dy = propagate_tangent(m, y, tangents, scope)?;
            let dx = propagate_tangent(m, x, tangents, scope)?;
            let yy = m.mul(y, y);
            let xx = m.mul(x, x);
            let norm = m.add(yy, xx);
            let t0 = m.mul(dy, x);
            let t1 = m.mul(dx, y);
            let num = m.sub(t0, t1);
            m.div(num, norm)
        }
        "sinh" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let c = m.call_extern("cosh", vec![x], ty);
            m.mul(d, c)
        }
        "cosh" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let s = m.call_extern("sinh", vec![x], ty);
            m.mul(d, s)
        }
        "tanh" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let c = m.call_extern("cosh", vec![x], ty);
            let cc = m.mul(c, c);
            m.div(d, cc)
        }
        "asinh" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let one = m.one(ty);
            let xx = m.mul(x, x);
            let sum = m.add(one, xx);
            let den = m.call_extern("sqrt", vec![sum], ty);
            m.div(d, den)
        }
        "acosh" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let one = m.one(ty);
            let lo = m.sub(x, one);
            let hi = m.add(x, one);
            let prod = m.mul(lo, hi);
            let den = m.call_extern("sqrt", vec![prod], ty);
            m.div(d, den)
        }
        "atanh" => {
            let d = propagate_tangent(m, x, tangents, scope)?;
            let one = m.one(ty);
            let xx = m.mul(x, x);
            let den = m.sub(one, xx);
            m.div(d, den)
        }
        "sqrt" => {
            // d sqrt(f) = f' / (2 sqrt(f))
            let d = propagate_tangent(m, x, tangents, scope)?;
            let half = m.const_of(ty, 0.5);
            let hd = m.mul(half, d);
            m.div(hd, expr)
        }
        "pow" => {
            // d pow(f, g) = pow(f, g - 1) (g f' + f log(f) g'), with the
            // log term suppressed when g' is identically zero so 0^g stays
            // finite.
            let b = args[1];
            let da = propagate_tangent(m, x, tangents, scope)?;
            let db = propagate_tangent(m, b, tangents, scope)?;
            let one = m.one(ty);
            let bm1 = m.sub(b, one);
            let p = m.call_extern("pow", vec![x, bm1], ty);
            let t0 = m.mul(b, da);
            let zero = m.zero(ty);
            let lg = m.call_extern("log", vec![x], ty);
            let xlg = m.mul(x, lg);
            let t1 = m.mul(xlg, db);
            let db_zero = m.eq(db, zero);
            let guarded = m.select(db_zero, zero, t1);
            let sum = m.add(t0, guarded);
            m.mul(p, sum)
        }
        "fast_inverse" => {
            // d f^(-1) = -f' f^(-2)
            let d = propagate_tangent(m, x, tangents, scope)?;
            let inv = m.call_extern("fast_inverse", vec![x], ty);
            let nd = m.neg(d);
            let t = m.mul(nd, inv);
            m.mul(t, inv)
        }
        "fast_inverse_sqrt" => {
            // d f^(-1/2) = -1/2 f' f^(-3/2)
            let d = propagate_tangent(m, x, tangents, scope)?;
            let inv = m.call_extern("fast_inverse_sqrt", vec![x], ty);
            let neg_half = m.const_of(ty, -0.5);
            let t0 = m.mul(neg_half, d);
            let t1 = m.mul(t0, inv);
            let t2 = m.mul(t1, inv);
            m.mul(t2, inv)
        }
        "ceil" | "floor" | "round" | "trunc" | "print" => m.zero(ty),
        _ => return Err(DerivativeError::UnsupportedDerivative(name.to_string())),
    };
    Ok(simplify(m, out))
}

fn intrinsic_tangent(
    m: &mut Module,
    name: &str,
    expr: ExprId,
    args: &[ExprId],
    tangents: &BTreeMap<String, String>,
    scope: &mut LexicalScope,
) -> Result<ExprId> {
    match name {
        "abs" => {
            let x = args[0];
            let d = propagate_tangent(m, x, tangents, scope)?;
            let zero = m.zero(m.ty(x));
            let pos = m.gt(x, zero);
            let nd = m.neg(d);
            Ok(m.select(pos, d, nd))
        }
        "lerp" => {
            // z = a (1 - w) + b w
            // dz = -(w - 1) a' + (b - a) w' + w b'
            let (a, b, w) = (args[0], args[1], args[2]);
            let da = propagate_tangent(m, a, tangents, scope)?;
            let db = propagate_tangent(m, b, tangents, scope)?;
            let dw = propagate_tangent(m, w, tangents, scope)?;
            let one = m.one(m.ty(a));
            let wm1 = m.sub(w, one);
            let nwm1 = m.neg(wm1);
            let t0 = m.mul(nwm1, da);
            let bma = m.sub(b, a);
            let t1 = m.mul(bma, dw);
            let t2 = m.mul(w, db);
            let sum = m.add(t0, t1);
            Ok(m.add(sum, t2))
        }
        "likely" => {
            let d = propagate_tangent(m, args[0], tangents, scope)?;
            Ok(m.likely(d))
        }
        "return_second" => propagate_tangent(m, args[1], tangents, scope),
        "undef" => {
            let ty = m.ty(expr);
            Ok(m.zero(ty))
        }
        "reinterpret" => {
            let d = propagate_tangent(m, args[0], tangents, scope)?;
            let d = simplify(m, d);
            if m.is_zero(d) {
                Ok(d)
            } else {
                // A bit-reinterpretation has no meaningful derivative.
                Err(DerivativeError::UnsupportedDerivative(
                    "reinterpret".to_string(),
                ))
            }
        }
        _ => Err(DerivativeError::UnsupportedDerivative(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_without_tangent_is_zero() {
        let mut m = Module::new();
        let x = m.var("x");
        let mut scope = LexicalScope::new();
        let d = propagate_tangent(&mut m, x, &BTreeMap::new(), &mut scope).unwrap();
        assert!(m.is_zero(d));
    }

    #[test]
    fn test_let_introduces_shadow_binding() {
        let mut m = Module::new();
        let b = {
            let x = m.var("x");
            m.read_buffer("in", vec![x])
        };
        let t = m.var("t");
        let body = m.mul(t, t);
        let e = m.let_in("t", b, body);

        let mut tangents = BTreeMap::new();
        tangents.insert("in".to_string(), "d_in".to_string());
        let mut scope = LexicalScope::new();
        let d = propagate_tangent(&mut m, e, &tangents, &mut scope).unwrap();
        let shown = m.show(d).to_string();
        assert!(shown.contains("let t_fwd = d_in(x)"), "got {shown}");
        assert!(shown.contains("t_fwd"), "got {shown}");
    }

    #[test]
    fn test_unknown_extern_is_fatal() {
        let mut m = Module::new();
        let x = m.var("x");
        let b = m.read_buffer("in", vec![x]);
        let call = m.call_extern("erf", vec![b], crate::expr::ScalarType::F32);
        let mut scope = LexicalScope::new();
        let err = propagate_tangent(&mut m, call, &BTreeMap::new(), &mut scope).unwrap_err();
        assert!(matches!(err, DerivativeError::UnsupportedDerivative(_)));
    }

    #[test]
    fn test_reinterpret_of_constant_is_allowed() {
        let mut m = Module::new();
        let c = m.lit(1.5f32);
        let r = m.call_intrinsic("reinterpret", vec![c], crate::expr::ScalarType::I32);
        let mut scope = LexicalScope::new();
        let d = propagate_tangent(&mut m, r, &BTreeMap::new(), &mut scope).unwrap();
        assert!(m.is_zero(d));
    }
}
