//! A reference interpreter: realizes functions over integer boxes.
//!
//! This exists to observe what the differentiation passes built: tests
//! evaluate adjoints against finite differences through it. It is a
//! test/debug facility: malformed input (an unbound variable, a read
//! outside a realized box) panics rather than threading errors through
//! every arithmetic case.

use std::cell::RefCell;
use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashMap;

use crate::bounds::BoundsBox;
use crate::expr::{BinOp, CallKind, CmpOp, ExprId, ExprKind};
use crate::module::Module;

type Env = FxHashMap<String, f64>;

pub struct Realizer<'m> {
    module: &'m Module,
    bounds: BTreeMap<String, BoundsBox>,
    cache: RefCell<FxHashMap<String, Vec<ArrayD<f64>>>>,
}

impl<'m> Realizer<'m> {
    /// `bounds` assigns a realization box to every function that has
    /// update stages or is read densely; update-free functions without a
    /// box are evaluated pointwise on demand.
    pub fn new(module: &'m Module, bounds: BTreeMap<String, BoundsBox>) -> Self {
        Realizer {
            module,
            bounds,
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn add_bounds(&mut self, func: &str, bbox: BoundsBox) {
        self.bounds.insert(func.to_string(), bbox);
    }

    /// Densely realizes one function over its box: the pure stage first,
    /// then every update in program order.
    pub fn realize(&self, func: &str) -> Vec<ArrayD<f64>> {
        self.ensure_realized(func);
        self.cache.borrow()[func].clone()
    }

    /// The tuple value of `func` at one integer point.
    pub fn value(&self, func: &str, point: &[i64]) -> Vec<f64> {
        let f = self
            .module
            .func(func)
            .unwrap_or_else(|| panic!("unknown function `{func}`"));
        if let Some(bbox) = self.bounds.get(func).cloned() {
            if point_in_box(point, &bbox) {
                self.ensure_realized(func);
                let cache = self.cache.borrow();
                let arrays = &cache[func];
                let idx = box_offset(point, &bbox);
                return arrays.iter().map(|a| a[IxDyn(&idx)]).collect();
            }
        }
        assert!(
            f.num_updates() == 0,
            "read of `{func}` at {point:?} outside its realized box"
        );
        self.pointwise(func, point)
    }

    fn pointwise(&self, func: &str, point: &[i64]) -> Vec<f64> {
        let f = &self.module.funcs[func];
        let mut env = Env::default();
        for (arg, &coord) in f.args.iter().zip(point.iter()) {
            env.insert(arg.clone(), coord as f64);
        }
        f.values()
            .iter()
            .map(|&v| {
                if self.module.is_undef(v) {
                    0.0
                } else {
                    self.eval(v, &env, None)
                }
            })
            .collect()
    }

    fn ensure_realized(&self, func: &str) {
        if self.cache.borrow().contains_key(func) {
            return;
        }
        let arrays = self.compute(func);
        self.cache.borrow_mut().insert(func.to_string(), arrays);
    }

    fn compute(&self, func: &str) -> Vec<ArrayD<f64>> {
        let m = self.module;
        let f = m.funcs[func].clone();
        let bbox = self
            .bounds
            .get(func)
            .unwrap_or_else(|| panic!("no realization box for `{func}`"))
            .clone();
        assert_eq!(bbox.len(), f.dimensions(), "box rank mismatch for `{func}`");
        let shape: Vec<usize> = bbox.iter().map(|iv| iv.extent() as usize).collect();
        let value_count = f.values().len();
        let mut arrays: Vec<ArrayD<f64>> = (0..value_count)
            .map(|_| ArrayD::zeros(IxDyn(&shape)))
            .collect();

        // Pure definition.
        for_each_point(&bbox, &mut |point| {
            let mut env = Env::default();
            for (arg, &coord) in f.args.iter().zip(point.iter()) {
                env.insert(arg.clone(), coord as f64);
            }
            let idx = box_offset(point, &bbox);
            for (slot, &value) in f.stages[0].values.iter().enumerate() {
                if m.is_undef(value) {
                    continue;
                }
                arrays[slot][IxDyn(&idx)] = self.eval(value, &env, None);
            }
        });

        // Updates, sequentially; self-reads observe the partial state.
        for stage in &f.stages[1..] {
            let lhs = stage.lhs.as_ref().expect("update stage carries write indices");
            // Pure loops cover the dimensions whose variable the write
            // indices mention.
            let pure_dims: Vec<usize> = f
                .args
                .iter()
                .enumerate()
                .filter(|(_, arg)| {
                    lhs.iter()
                        .any(|&l| crate::traversal::has_variable(m, l, arg))
                })
                .map(|(d, _)| d)
                .collect();
            let pure_box: BoundsBox = pure_dims.iter().map(|&d| bbox[d]).collect();
            let rdom = stage.rdom.map(|rd| m.rdom(rd).clone());
            let rdom_box: BoundsBox = rdom
                .iter()
                .flat_map(|rd| rd.vars.iter())
                .map(|v| crate::bounds::Interval::new(v.min, v.max()))
                .collect();

            for_each_point(&pure_box, &mut |pure_point| {
                for_each_point(&rdom_box, &mut |rpoint| {
                    let mut env = Env::default();
                    for (&d, &coord) in pure_dims.iter().zip(pure_point.iter()) {
                        env.insert(f.args[d].clone(), coord as f64);
                    }
                    if let Some(rd) = &rdom {
                        for (var, &coord) in rd.vars.iter().zip(rpoint.iter()) {
                            env.insert(var.name.clone(), coord as f64);
                        }
                        if let Some(pred) = rd.predicate {
                            if self.eval(pred, &env, Some((func, arrays.as_slice(), &bbox))) == 0.0 {
                                return;
                            }
                        }
                    }
                    let target: Vec<i64> = lhs
                        .iter()
                        .map(|&l| self.eval(l, &env, Some((func, arrays.as_slice(), &bbox))).round() as i64)
                        .collect();
                    if !point_in_box(&target, &bbox) {
                        return;
                    }
                    let stored: Vec<Option<f64>> = stage
                        .values
                        .iter()
                        .map(|&v| {
                            if m.is_undef(v) {
                                None
                            } else {
                                Some(self.eval(v, &env, Some((func, arrays.as_slice(), &bbox))))
                            }
                        })
                        .collect();
                    let idx = box_offset(&target, &bbox);
                    for (slot, value) in stored.into_iter().enumerate() {
                        if let Some(v) = value {
                            arrays[slot][IxDyn(&idx)] = v;
                        }
                    }
                });
            });
        }
        arrays
    }

    fn eval(&self, expr: ExprId, env: &Env, current: Option<(&str, &[ArrayD<f64>], &BoundsBox)>) -> f64 {
        let m = self.module;
        match m.kind(expr) {
            ExprKind::Const(c) => c.to_f64(),
            ExprKind::Var { name, .. } => *env
                .get(name)
                .unwrap_or_else(|| panic!("unbound variable `{name}`")),
            ExprKind::Cast(v) => {
                let x = self.eval(*v, env, current);
                if m.ty(expr).is_int() {
                    x.trunc()
                } else {
                    x
                }
            }
            ExprKind::Binary { op, a, b } => {
                let x = self.eval(*a, env, current);
                let y = self.eval(*b, env, current);
                match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => {
                        if m.ty(expr).is_int() {
                            (x as i64).div_euclid(y as i64) as f64
                        } else {
                            x / y
                        }
                    }
                    BinOp::Min => x.min(y),
                    BinOp::Max => x.max(y),
                }
            }
            ExprKind::Cmp { op, a, b } => {
                let x = self.eval(*a, env, current);
                let y = self.eval(*b, env, current);
                let v = match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Gt => x > y,
                    CmpOp::Ge => x >= y,
                    CmpOp::Eq => x == y,
                };
                f64::from(u8::from(v))
            }
            // Branches evaluate lazily so boundary-condition wrappers
            // never touch the out-of-range read they guard against.
            ExprKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                if self.eval(*cond, env, current) != 0.0 {
                    self.eval(*if_true, env, current)
                } else {
                    self.eval(*if_false, env, current)
                }
            }
            ExprKind::Let { name, value, body } => {
                let bound = self.eval(*value, env, current);
                let mut inner = env.clone();
                inner.insert(name.clone(), bound);
                self.eval(*body, &inner, current)
            }
            ExprKind::Call {
                kind,
                name,
                args,
                value_index,
            } => match kind {
                CallKind::Extern => self.eval_extern(name, args, env, current),
                CallKind::Intrinsic => match name.as_str() {
                    "abs" => self.eval(args[0], env, current).abs(),
                    "lerp" => {
                        let a = self.eval(args[0], env, current);
                        let b = self.eval(args[1], env, current);
                        let w = self.eval(args[2], env, current);
                        a * (1.0 - w) + b * w
                    }
                    "likely" => self.eval(args[0], env, current),
                    "return_second" => self.eval(args[1], env, current),
                    "undef" => 0.0,
                    _ => panic!("cannot evaluate intrinsic `{name}`"),
                },
                CallKind::Function => {
                    let point: Vec<i64> = args
                        .iter()
                        .map(|&a| self.eval(a, env, current).round() as i64)
                        .collect();
                    if let Some((cur_name, arrays, cur_box)) = current {
                        if cur_name == name {
                            assert!(
                                point_in_box(&point, cur_box),
                                "self-read of `{name}` at {point:?} outside its box"
                            );
                            let idx = box_offset(&point, cur_box);
                            return arrays[*value_index][IxDyn(&idx)];
                        }
                    }
                    self.value(name, &point)[*value_index]
                }
                CallKind::Buffer => {
                    let buffer = &m.buffers[name];
                    let idx: Vec<usize> = args
                        .iter()
                        .enumerate()
                        .map(|(d, &a)| {
                            let coord = self.eval(a, env, current).round() as i64;
                            let (lo, hi) = buffer.interval(d);
                            assert!(
                                lo <= coord && coord <= hi,
                                "read of buffer `{name}` at {coord} outside [{lo}, {hi}]"
                            );
                            (coord - lo) as usize
                        })
                        .collect();
                    buffer.data[IxDyn(&idx)]
                }
            },
        }
    }

    fn eval_extern(
        &self,
        name: &str,
        args: &[ExprId],
        env: &Env,
        current: Option<(&str, &[ArrayD<f64>], &BoundsBox)>,
    ) -> f64 {
        let x = self.eval(args[0], env, current);
        match name {
            "exp" => x.exp(),
            "log" => x.ln(),
            "sin" => x.sin(),
            "cos" => x.cos(),
            "tan" => x.tan(),
            "asin" => x.asin(),
            "acos" => x.acos(),
            "atan" => x.atan(),
            "atan2" => x.atan2(self.eval(args[1], env, current)),
            "sinh" => x.sinh(),
            "cosh" => x.cosh(),
            "tanh" => x.tanh(),
            "asinh" => x.asinh(),
            "acosh" => x.acosh(),
            "atanh" => x.atanh(),
            "ceil" => x.ceil(),
            "floor" => x.floor(),
            "round" => x.round(),
            "trunc" => x.trunc(),
            "sqrt" => x.sqrt(),
            "pow" => x.powf(self.eval(args[1], env, current)),
            "fast_inverse" => x.recip(),
            "fast_inverse_sqrt" => x.sqrt().recip(),
            "print" => x,
            _ => panic!("cannot evaluate extern `{name}`"),
        }
    }
}

fn point_in_box(point: &[i64], bbox: &BoundsBox) -> bool {
    point.len() == bbox.len()
        && point
            .iter()
            .zip(bbox.iter())
            .all(|(&p, iv)| iv.contains(p))
}

fn box_offset(point: &[i64], bbox: &BoundsBox) -> Vec<usize> {
    point
        .iter()
        .zip(bbox.iter())
        .map(|(&p, iv)| (p - iv.min) as usize)
        .collect()
}

/// Calls `f` with every point of the box, last dimension fastest. A
/// zero-dimensional box yields the single empty point.
fn for_each_point(bbox: &BoundsBox, f: &mut impl FnMut(&[i64])) {
    let mut point: Vec<i64> = bbox.iter().map(|iv| iv.min).collect();
    if bbox.is_empty() {
        f(&point);
        return;
    }
    loop {
        f(&point);
        let mut dim = bbox.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            if point[dim] < bbox[dim].max {
                point[dim] += 1;
                for trailing in dim + 1..bbox.len() {
                    point[trailing] = bbox[trailing].min;
                }
                break;
            }
        }
    }
}
