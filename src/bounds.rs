//! Interval arithmetic and the bounds oracle.
//!
//! `infer_bounds` answers one question for the reverse engine: over which
//! integer box must each function's adjoint be accounted for? Starting from
//! the seeded output box it walks consumers-first and unions the interval
//! of every read's index expressions into the callee's box.

use std::collections::BTreeMap;

use log::warn;
use rustc_hash::FxHashMap;

use crate::error::{DerivativeError, Result};
use crate::expr::{BinOp, ExprId, ExprKind};
use crate::module::Module;
use crate::traversal::realization_order;

/// A closed integer interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub min: i64,
    pub max: i64,
}

impl Interval {
    pub fn new(min: i64, max: i64) -> Self {
        Interval { min, max }
    }

    pub fn point(v: i64) -> Self {
        Interval { min: v, max: v }
    }

    pub fn extent(&self) -> i64 {
        self.max - self.min + 1
    }

    pub fn contains(&self, v: i64) -> bool {
        self.min <= v && v <= self.max
    }

    pub fn union(&self, other: Interval) -> Interval {
        Interval {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Per-function index box, one interval per dimension.
pub type BoundsBox = Vec<Interval>;

/// Conservative interval of an integer index expression under the given
/// variable bounds. `None` when the expression cannot be bounded (e.g. it
/// contains a call).
pub fn expr_interval(
    m: &Module,
    expr: ExprId,
    env: &FxHashMap<String, Interval>,
) -> Option<Interval> {
    match m.kind(expr) {
        ExprKind::Const(c) => Some(Interval::point(c.to_f64() as i64)),
        ExprKind::Var { name, .. } => env.get(name).copied(),
        ExprKind::Cast(v) => expr_interval(m, *v, env),
        ExprKind::Binary { op, a, b } => {
            let a = expr_interval(m, *a, env)?;
            let b = expr_interval(m, *b, env)?;
            let i = match op {
                BinOp::Add => Interval::new(a.min + b.min, a.max + b.max),
                BinOp::Sub => Interval::new(a.min - b.max, a.max - b.min),
                BinOp::Mul => corner_fold(a, b, |x, y| x.checked_mul(y))?,
                BinOp::Div => {
                    if b.contains(0) {
                        return None;
                    }
                    corner_fold(a, b, |x, y| Some(x.div_euclid(y)))?
                }
                BinOp::Min => Interval::new(a.min.min(b.min), a.max.min(b.max)),
                BinOp::Max => Interval::new(a.min.max(b.min), a.max.max(b.max)),
            };
            Some(i)
        }
        ExprKind::Select {
            if_true, if_false, ..
        } => {
            let t = expr_interval(m, *if_true, env)?;
            let f = expr_interval(m, *if_false, env)?;
            Some(t.union(f))
        }
        ExprKind::Let { name, value, body } => {
            let bound = expr_interval(m, *value, env)?;
            let mut inner = env.clone();
            inner.insert(name.clone(), bound);
            expr_interval(m, *body, &inner)
        }
        ExprKind::Cmp { .. } | ExprKind::Call { .. } => None,
    }
}

fn corner_fold(
    a: Interval,
    b: Interval,
    f: impl Fn(i64, i64) -> Option<i64>,
) -> Option<Interval> {
    let corners = [
        f(a.min, b.min)?,
        f(a.min, b.max)?,
        f(a.max, b.min)?,
        f(a.max, b.max)?,
    ];
    Some(Interval::new(
        *corners.iter().min().unwrap(),
        *corners.iter().max().unwrap(),
    ))
}

/// Infers a bounds box for every function (and every read buffer)
/// transitively reachable from `output`, seeded with `seed` as the output's
/// box. The result covers every index any traced stage reads from or
/// writes to.
pub fn infer_bounds(
    m: &Module,
    output: &str,
    seed: &[(i64, i64)],
) -> Result<BTreeMap<String, BoundsBox>> {
    let out = m
        .func(output)
        .ok_or_else(|| DerivativeError::UnknownFunction(output.to_string()))?;
    if seed.len() != out.dimensions() {
        return Err(DerivativeError::DimensionMismatch {
            expected: out.dimensions(),
            found: seed.len(),
        });
    }

    let order = realization_order(m, output)?;
    let mut boxes: BTreeMap<String, BoundsBox> = BTreeMap::new();
    for buffer in m.buffers.values() {
        let bbox = (0..buffer.dimensions())
            .map(|d| {
                let (min, max) = buffer.interval(d);
                Interval::new(min, max)
            })
            .collect();
        boxes.insert(buffer.name.clone(), bbox);
    }
    boxes.insert(
        output.to_string(),
        seed.iter().map(|&(lo, hi)| Interval::new(lo, hi)).collect(),
    );

    // Consumers first: each function's own box is complete (up to
    // self-reference) before its producers are examined.
    for name in order.iter().rev() {
        let f = m.func(name).unwrap().clone();
        boxes
            .entry(name.clone())
            .or_insert_with(|| vec![Interval::point(0); f.dimensions()]);
        for stage_index in (0..f.stages.len()).rev() {
            let stage = &f.stages[stage_index];
            let own = boxes[name.as_str()].clone();
            let mut env: FxHashMap<String, Interval> = FxHashMap::default();
            for (arg, interval) in f.args.iter().zip(own.iter()) {
                env.insert(arg.clone(), *interval);
            }
            if let Some(rdom) = stage.rdom {
                for var in &m.rdom(rdom).vars {
                    env.insert(var.name.clone(), Interval::new(var.min, var.max()));
                }
            }
            // Updates may write outside the consumer-visible region.
            if let Some(lhs) = &stage.lhs {
                for (dim, &index) in lhs.iter().enumerate() {
                    match expr_interval(m, index, &env) {
                        Some(interval) => {
                            let entry = boxes.get_mut(name.as_str()).unwrap();
                            entry[dim] = entry[dim].union(interval);
                        }
                        None => warn!(
                            "cannot bound write index {} of `{name}`",
                            m.show(index)
                        ),
                    }
                }
            }
            let mut exprs: Vec<ExprId> = stage.values.clone();
            if let Some(lhs) = &stage.lhs {
                exprs.extend(lhs.iter().copied());
            }
            if let Some(rdom) = stage.rdom {
                if let Some(pred) = m.rdom(rdom).predicate {
                    exprs.push(pred);
                }
            }
            for expr in exprs {
                record_read_bounds(m, expr, &env, &mut boxes);
            }
        }
    }
    Ok(boxes)
}

/// Walks one expression and unions the interval of every
/// stored-function/buffer read's indices into the callee's box.
fn record_read_bounds(
    m: &Module,
    expr: ExprId,
    env: &FxHashMap<String, Interval>,
    boxes: &mut BTreeMap<String, BoundsBox>,
) {
    match m.kind(expr) {
        ExprKind::Const(_) | ExprKind::Var { .. } => {}
        ExprKind::Cast(v) => record_read_bounds(m, *v, env, boxes),
        ExprKind::Binary { a, b, .. } | ExprKind::Cmp { a, b, .. } => {
            record_read_bounds(m, *a, env, boxes);
            record_read_bounds(m, *b, env, boxes);
        }
        ExprKind::Select {
            cond,
            if_true,
            if_false,
        } => {
            record_read_bounds(m, *cond, env, boxes);
            record_read_bounds(m, *if_true, env, boxes);
            record_read_bounds(m, *if_false, env, boxes);
        }
        ExprKind::Let { name, value, body } => {
            record_read_bounds(m, *value, env, boxes);
            let mut inner = env.clone();
            if let Some(bound) = expr_interval(m, *value, env) {
                inner.insert(name.clone(), bound);
            }
            record_read_bounds(m, *body, &inner, boxes);
        }
        ExprKind::Call {
            kind, name, args, ..
        } => {
            use crate::expr::CallKind;
            if matches!(kind, CallKind::Function | CallKind::Buffer) {
                let intervals: Option<Vec<Interval>> =
                    args.iter().map(|&arg| expr_interval(m, arg, env)).collect();
                match intervals {
                    Some(intervals) => match boxes.get_mut(name) {
                        Some(entry) => {
                            for (dim, interval) in intervals.into_iter().enumerate() {
                                entry[dim] = entry[dim].union(interval);
                            }
                        }
                        None => {
                            boxes.insert(name.clone(), intervals);
                        }
                    },
                    None => warn!("cannot bound a read of `{name}`"),
                }
            }
            for &arg in args {
                record_read_bounds(m, arg, env, boxes);
            }
        }
    }
}
