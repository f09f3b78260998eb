//! Reverse-mode accumulation: from a seeded output adjoint to one
//! derivative accumulator per (function, stage) pair.
//!
//! The engine walks functions consumers-first and stages last-to-first.
//! Within a stage it seeds the tuple roots with reads of the stage's own
//! adjoint, pushes adjoints down the expression forest with the per-node
//! rule table, and crosses function boundaries only at stored-function and
//! buffer reads, where the scatter resolver rewrites the read's index
//! expressions into a valid accumulation on the target.

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use rustc_hash::FxHashSet;

use crate::boundary::extend_with_default;
use crate::bounds::{infer_bounds, BoundsBox};
use crate::error::{DerivativeError, Result};
use crate::expr::{BinOp, CallKind, ExprId, ExprKind, ScalarType};
use crate::func::{Function, RDomId, RVar, Stage, StageKey};
use crate::module::Module;
use crate::simplify::simplify;
use crate::substitute::{
    substitute, substitute_expr, substitute_in_all_lets, substitute_rdom_predicate,
};
use crate::traversal::{
    add_let_expression, extract_rdom, find_buffer_reads, gather_rvariables, gather_variables,
    has_variable, realization_order, sort_expressions, RVarInfo,
};

/// The result of a reverse pass: the transformed module plus the mapping
/// from stage key to the adjoint accumulator defined in it.
#[derive(Debug, Clone)]
pub struct Derivative {
    pub module: Module,
    adjoints: BTreeMap<StageKey, String>,
}

impl Derivative {
    pub fn adjoints(&self) -> &BTreeMap<StageKey, String> {
        &self.adjoints
    }

    /// Name of the adjoint accumulator for one (function, stage) pair.
    pub fn adjoint_name(&self, func: &str, stage: i32) -> Option<&str> {
        self.adjoints
            .get(&StageKey::new(func, stage))
            .map(String::as_str)
    }

    pub fn adjoint(&self, func: &str, stage: i32) -> Option<&Function> {
        self.adjoint_name(func, stage)
            .and_then(|name| self.module.func(name))
    }
}

/// Propagates the seed adjoint of `output` back through every reachable
/// function and buffer. `seed` must have the output's dimensionality and
/// `output_bounds` one `(min, max)` pair per output dimension.
pub fn propagate_adjoints(
    module: &Module,
    output: &str,
    seed: &str,
    output_bounds: &[(i64, i64)],
) -> Result<Derivative> {
    let out = module
        .func(output)
        .ok_or_else(|| DerivativeError::UnknownFunction(output.to_string()))?;
    let seed_fn = module
        .func(seed)
        .ok_or_else(|| DerivativeError::UnknownFunction(seed.to_string()))?;
    if seed_fn.dimensions() != out.dimensions() {
        return Err(DerivativeError::DimensionMismatch {
            expected: out.dimensions(),
            found: seed_fn.dimensions(),
        });
    }
    if output_bounds.len() != out.dimensions() {
        return Err(DerivativeError::DimensionMismatch {
            expected: out.dimensions(),
            found: output_bounds.len(),
        });
    }

    let mut engine = ReverseAccumulator {
        module: module.clone(),
        adjoints: BTreeMap::new(),
        func_bounds: BTreeMap::new(),
        current_func: String::new(),
        current_stage: -1,
    };
    engine.run(output, seed, output_bounds)?;
    Ok(Derivative {
        module: engine.module,
        adjoints: engine.adjoints,
    })
}

/// Convenience: seeds with a read of `buffer` and derives the output
/// bounds from the buffer's own extents.
pub fn propagate_adjoints_buffer(module: &Module, output: &str, buffer: &str) -> Result<Derivative> {
    let out = module
        .func(output)
        .ok_or_else(|| DerivativeError::UnknownFunction(output.to_string()))?;
    let buf = module
        .buffers
        .get(buffer)
        .ok_or_else(|| DerivativeError::UnknownFunction(buffer.to_string()))?;
    if buf.dimensions() != out.dimensions() {
        return Err(DerivativeError::DimensionMismatch {
            expected: out.dimensions(),
            found: buf.dimensions(),
        });
    }
    let bounds: Vec<(i64, i64)> = (0..buf.dimensions()).map(|d| buf.interval(d)).collect();
    let args = out.args.clone();

    let mut m = module.clone();
    let seed_name = format!("{buffer}_seed__");
    let arg_vars: Vec<ExprId> = args.iter().map(|a| m.var(a)).collect();
    let value = m.read_buffer(buffer, arg_vars);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    m.define(&seed_name, &arg_refs, vec![value]);
    propagate_adjoints(&m, output, &seed_name, &bounds)
}

/// Convenience: all-ones seed over a degenerate single-point bound, for
/// scalar-style losses.
pub fn propagate_adjoints_scalar(module: &Module, output: &str) -> Result<Derivative> {
    let out = module
        .func(output)
        .ok_or_else(|| DerivativeError::UnknownFunction(output.to_string()))?;
    let args = out.args.clone();
    let bounds = vec![(0, 0); args.len()];

    let mut m = module.clone();
    let seed_name = format!("{output}_seed__");
    let values = m
        .value_types(output)
        .into_iter()
        .map(|ty| m.one(ty))
        .collect();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    m.define(&seed_name, &arg_refs, values);
    propagate_adjoints(&m, output, &seed_name, &bounds)
}

/// Scratch state for one stage; discarded when the stage is done.
#[derive(Default)]
struct StageContext {
    /// Accumulated adjoint per expression identity. A second contribution
    /// to the same identity is summed, which is the chain rule for shared
    /// sub-expressions.
    expr_adjoints: rustc_hash::FxHashMap<ExprId, ExprId>,
    let_values: BTreeMap<String, ExprId>,
    let_order: Vec<String>,
}

/// First write installs the contribution; later writes to the same
/// identity sum into it.
fn accumulate(m: &mut Module, ctx: &mut StageContext, id: ExprId, contribution: ExprId) {
    match ctx.expr_adjoints.get(&id).copied() {
        Some(existing) => {
            let sum = m.add(existing, contribution);
            ctx.expr_adjoints.insert(id, sum);
        }
        None => {
            ctx.expr_adjoints.insert(id, contribution);
        }
    }
}

struct ReverseAccumulator {
    module: Module,
    adjoints: BTreeMap<StageKey, String>,
    func_bounds: BTreeMap<String, BoundsBox>,
    current_func: String,
    current_stage: i32,
}

impl ReverseAccumulator {
    fn run(&mut self, output: &str, seed: &str, output_bounds: &[(i64, i64)]) -> Result<()> {
        let order = realization_order(&self.module, output)?;
        self.func_bounds = infer_bounds(&self.module, output, output_bounds)?;
        debug!("reverse pass over {} functions", order.len());

        // One zero-valued stub per stage key, the final stage of the sink
        // seeded with the caller's adjoint.
        for (func_id, name) in order.iter().enumerate() {
            let f = self.module.funcs[name].clone();
            let value_tys = self.module.value_types(name);
            for stage in -1..=f.last_stage() {
                let adjoint_name = format!("{name}_{}_d_def__", stage + 1);
                let is_final = func_id == order.len() - 1 && stage == f.last_stage();
                let values = if is_final {
                    let seed_slots = self.module.value_types(seed).len();
                    (0..seed_slots)
                        .map(|i| {
                            let args: Vec<ExprId> =
                                f.args.iter().map(|a| self.module.var(a)).collect();
                            self.module.read_elem(seed, args, i)
                        })
                        .collect()
                } else {
                    value_tys.iter().map(|&ty| self.module.zero(ty)).collect()
                };
                let arg_refs: Vec<&str> = f.args.iter().map(String::as_str).collect();
                self.module.define(&adjoint_name, &arg_refs, values);
                let key = StageKey::new(name.clone(), stage);
                debug_assert!(!self.adjoints.contains_key(&key));
                self.adjoints.insert(key, adjoint_name);
            }
        }

        // Stubs for raw buffers, guarding against a buffer shadowing a
        // function's accumulator.
        let mut buffer_reads = BTreeMap::new();
        for name in &order {
            buffer_reads.extend(find_buffer_reads(&self.module, name));
        }
        for (buf_name, info) in &buffer_reads {
            let key = StageKey::new(buf_name.clone(), -1);
            if self.adjoints.contains_key(&key) {
                return Err(DerivativeError::NamingConflict(buf_name.clone()));
            }
            let stub = format!("{buf_name}_d__");
            let args: Vec<String> = (0..info.dimensions).map(|i| format!("i{i}")).collect();
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let zero = self.module.zero(info.ty);
            self.module.define(&stub, &arg_refs, vec![zero]);
            self.adjoints.insert(key, stub);
        }

        // Consumers before producers, stages last-to-first.
        for name in order.iter().rev() {
            let f = self.module.funcs[name].clone();
            self.current_func = name.clone();
            for stage in (-1..=f.last_stage()).rev() {
                self.current_stage = stage;
                let key = StageKey::new(name.clone(), stage);
                debug!("propagating through {key}");

                // First visit: bound the accumulator with a zero exterior,
                // keeping the unwrapped definition around for scheduling.
                if stage == f.last_stage() && f.dimensions() > 0 {
                    let adjoint_name = self.adjoints[&key].clone();
                    self.adjoints.insert(
                        StageKey::new(format!("{name}_unbounded"), stage),
                        adjoint_name.clone(),
                    );
                    let bbox = self.func_bounds[name.as_str()].clone();
                    let wrapped = extend_with_default(&mut self.module, &adjoint_name, &bbox);
                    self.adjoints.insert(key.clone(), wrapped);
                }

                if stage >= 0 {
                    self.init_previous_stage(&f, stage);
                }

                self.process_stage(&f, stage)?;
            }
        }
        Ok(())
    }

    /// Flows the adjoint of update `stage` into the preceding stage's
    /// accumulator: copied for all indices except the ones the update just
    /// wrote, which are masked to zero. A write at exactly the pure
    /// variables overwrites everything, so nothing flows back at all.
    fn init_previous_stage(&mut self, f: &Function, stage: i32) {
        let key = StageKey::new(f.name.clone(), stage);
        let prev_key = StageKey::new(f.name.clone(), stage - 1);
        let current_name = self.adjoints[&key].clone();
        let prev_name = self.adjoints[&prev_key].clone();
        let update = f.stage(stage).clone();
        let update_lhs = update.lhs.expect("update stage carries write indices");

        let is_noop = update_lhs.len() == f.args.len()
            && update_lhs.iter().zip(f.args.iter()).all(|(&l, a)| {
                matches!(self.module.kind(l), ExprKind::Var { name, .. } if name == a)
            });

        let value_tys = self.module.value_types(&f.name);
        let mut stages = Vec::new();
        if is_noop {
            let values = value_tys.iter().map(|&ty| self.module.zero(ty)).collect();
            stages.push(Stage {
                lhs: None,
                values,
                rdom: None,
            });
        } else {
            let values = (0..value_tys.len())
                .map(|i| {
                    let args: Vec<ExprId> = f.args.iter().map(|a| self.module.var(a)).collect();
                    self.module.read_elem(&current_name, args, i)
                })
                .collect();
            stages.push(Stage {
                lhs: None,
                values,
                rdom: None,
            });
            let zeros = value_tys.iter().map(|&ty| self.module.zero(ty)).collect();
            stages.push(Stage {
                lhs: Some(update_lhs),
                values: zeros,
                rdom: update.rdom,
            });
        }
        self.module.funcs.insert(
            prev_name.clone(),
            Function {
                name: prev_name,
                args: f.args.clone(),
                stages,
            },
        );
    }

    fn process_stage(&mut self, f: &Function, stage: i32) -> Result<()> {
        let key = StageKey::new(f.name.clone(), stage);
        let stage_def = f.stage(stage).clone();
        let expr_list = sort_expressions(&self.module, &stage_def.values);

        let mut ctx = StageContext::default();
        for &id in &expr_list {
            if let ExprKind::Let { name, value, .. } = self.module.kind(id) {
                if !ctx.let_values.contains_key(name) {
                    ctx.let_values.insert(name.clone(), *value);
                    ctx.let_order.push(name.clone());
                }
            }
        }

        // Seed each tuple root with a read of this stage's accumulator at
        // the stage's own write-index tuple.
        let write_args: Vec<ExprId> = match &stage_def.lhs {
            Some(lhs) => lhs.clone(),
            None => f.args.iter().map(|a| self.module.var(a)).collect(),
        };
        let adjoint_name = self.adjoints[&key].clone();
        for (i, &root) in stage_def.values.iter().enumerate() {
            let seed = self.module.read_elem(&adjoint_name, write_args.clone(), i);
            ctx.expr_adjoints.insert(root, seed);
        }

        for &id in expr_list.iter().rev() {
            self.visit(id, &mut ctx)?;
        }
        Ok(())
    }

    /// Applies the reverse derivative rule of one node, distributing its
    /// accumulated adjoint to its operands.
    fn visit(&mut self, id: ExprId, ctx: &mut StageContext) -> Result<()> {
        let Some(&adjoint) = ctx.expr_adjoints.get(&id) else {
            // Reachable only through non-differentiable edges (e.g. the
            // value of an unused let); nothing flows here.
            return Ok(());
        };
        let node_ty = self.module.ty(id);
        match self.module.kind(id).clone() {
            ExprKind::Const(_) | ExprKind::Cmp { .. } => {}
            ExprKind::Var { name, .. } => {
                // A let-bound variable re-routes its adjoint into the
                // bound value, scoped under the same binding.
                if let Some(&value) = ctx.let_values.get(&name) {
                    let m = &mut self.module;
                    let wrapped = m.let_in(&name, value, adjoint);
                    accumulate(m, ctx, value, wrapped);
                }
            }
            ExprKind::Cast(v) => {
                let m = &mut self.module;
                if node_ty.is_float() {
                    accumulate(m, ctx, v, adjoint);
                } else {
                    let zero = m.zero(node_ty);
                    accumulate(m, ctx, v, zero);
                }
            }
            ExprKind::Binary { op, a, b } => self.visit_binary(ctx, op, a, b, adjoint),
            ExprKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                let m = &mut self.module;
                let zero = m.zero(node_ty);
                let t = m.select(cond, adjoint, zero);
                accumulate(m, ctx, if_true, t);
                let f = m.select(cond, zero, adjoint);
                accumulate(m, ctx, if_false, f);
            }
            ExprKind::Let { body, .. } => accumulate(&mut self.module, ctx, body, adjoint),
            ExprKind::Call {
                kind,
                name,
                args,
                value_index,
            } => match kind {
                CallKind::Extern => self.visit_extern(ctx, &name, &args, node_ty, adjoint)?,
                CallKind::Intrinsic => self.visit_intrinsic(ctx, &name, &args, node_ty, adjoint),
                CallKind::Function | CallKind::Buffer => {
                    self.scatter(ctx, kind, &name, &args, value_index, adjoint)?;
                }
            },
        }
        Ok(())
    }

    fn visit_binary(
        &mut self,
        ctx: &mut StageContext,
        op: BinOp,
        a: ExprId,
        b: ExprId,
        adjoint: ExprId,
    ) {
        let m = &mut self.module;
        match op {
            BinOp::Add => {
                accumulate(m, ctx, a, adjoint);
                accumulate(m, ctx, b, adjoint);
            }
            BinOp::Sub => {
                accumulate(m, ctx, a, adjoint);
                let neg = m.neg(adjoint);
                accumulate(m, ctx, b, neg);
            }
            BinOp::Mul => {
                let da = m.mul(adjoint, b);
                let db = m.mul(adjoint, a);
                accumulate(m, ctx, a, da);
                accumulate(m, ctx, b, db);
            }
            BinOp::Div => {
                let da = m.div(adjoint, b);
                let neg = m.neg(adjoint);
                let num = m.mul(neg, a);
                let den = m.mul(b, b);
                let db = m.div(num, den);
                accumulate(m, ctx, a, da);
                accumulate(m, ctx, b, db);
            }
            // The sub-gradient at ties goes to `a`.
            BinOp::Min => {
                let ty = m.ty(adjoint);
                let zero = m.zero(ty);
                let take_a = m.le(a, b);
                let da = m.select(take_a, adjoint, zero);
                let take_b = m.lt(b, a);
                let db = m.select(take_b, adjoint, zero);
                accumulate(m, ctx, a, da);
                accumulate(m, ctx, b, db);
            }
            BinOp::Max => {
                let ty = m.ty(adjoint);
                let zero = m.zero(ty);
                let take_a = m.ge(a, b);
                let da = m.select(take_a, adjoint, zero);
                let take_b = m.gt(b, a);
                let db = m.select(take_b, adjoint, zero);
                accumulate(m, ctx, a, da);
                accumulate(m, ctx, b, db);
            }
        }
    }

    fn visit_extern(
        &mut self,
        ctx: &mut StageContext,
        name: &str,
        args: &[ExprId],
        ty: ScalarType,
        adjoint: ExprId,
    ) -> Result<()> {
        let m = &mut self.module;
        let x = args[0];
        match name {
            "exp" => {
                // d/dx exp(x) = exp(x)
                let e = m.call_extern("exp", vec![x], ty);
                let d = m.mul(adjoint, e);
                accumulate(m, ctx, x, d);
            }
            "log" => {
                // d/dx log(x) = 1 / x
                let d = m.div(adjoint, x);
                accumulate(m, ctx, x, d);
            }
            "sin" => {
                let c = m.call_extern("cos", vec![x], ty);
                let d = m.mul(adjoint, c);
                accumulate(m, ctx, x, d);
            }
            "cos" => {
                let s = m.call_extern("sin", vec![x], ty);
                let na = m.neg(adjoint);
                let d = m.mul(na, s);
                accumulate(m, ctx, x, d);
            }
            "tan" => {
                // d/dx tan(x) = 1 / cos(x)^2
                let c = m.call_extern("cos", vec![x], ty);
                let cc = m.mul(c, c);
                let d = m.div(adjoint, cc);
                accumulate(m, ctx, x, d);
            }
            "asin" => {
                // d/dx asin(x) = 1 / sqrt(1 - x^2)
                let den = one_minus_square_sqrt(m, x, ty);
                let d = m.div(adjoint, den);
                accumulate(m, ctx, x, d);
            }
            "acos" => {
                let den = one_minus_square_sqrt(m, x, ty);
                let na = m.neg(adjoint);
                let d = m.div(na, den);
                accumulate(m, ctx, x, d);
            }
            "atan" => {
                // d/dx atan(x) = 1 / (1 + x^2)
                let one = m.one(ty);
                let xx = m.mul(x, x);
                let den = m.add(one, xx);
                let d = m.div(adjoint, den);
                accumulate(m, ctx, x, d);
            }
            "atan2" => {
                let y = args[0];
                let x = args[1];
                let yy = m.mul(y, y);
                let xx = m.mul(x, x);
                let norm = m.add(yy, xx);
                // d/dy atan2(y, x) = x / (x^2 + y^2)
                let ax = m.mul(adjoint, x);
                let dy = m.div(ax, norm);
                accumulate(m, ctx, y, dy);
                // d/dx atan2(y, x) = -y / (x^2 + y^2)
                let na = m.neg(adjoint);
                let ay = m.mul(na, y);
                let dx = m.div(ay, norm);
                accumulate(m, ctx, x, dx);
            }
            "sinh" => {
                let c = m.call_extern("cosh", vec![x], ty);
                let d = m.mul(adjoint, c);
                accumulate(m, ctx, x, d);
            }
            "cosh" => {
                let s = m.call_extern("sinh", vec![x], ty);
                let d = m.mul(adjoint, s);
                accumulate(m, ctx, x, d);
            }
            "tanh" => {
                let c = m.call_extern("cosh", vec![x], ty);
                let cc = m.mul(c, c);
                let d = m.div(adjoint, cc);
                accumulate(m, ctx, x, d);
            }
            "asinh" => {
                // d/dx asinh(x) = 1 / sqrt(1 + x^2)
                let one = m.one(ty);
                let xx = m.mul(x, x);
                let sum = m.add(one, xx);
                let den = m.call_extern("sqrt", vec![sum], ty);
                let d = m.div(adjoint, den);
                accumulate(m, ctx, x, d);
            }
            "acosh" => {
                // d/dx acosh(x) = 1 / (sqrt(x - 1) sqrt(x + 1))
                let one = m.one(ty);
                let lo = m.sub(x, one);
                let hi = m.add(x, one);
                let slo = m.call_extern("sqrt", vec![lo], ty);
                let shi = m.call_extern("sqrt", vec![hi], ty);
                let den = m.mul(slo, shi);
                let d = m.div(adjoint, den);
                accumulate(m, ctx, x, d);
            }
            "atanh" => {
                // d/dx atanh(x) = 1 / (1 - x^2)
                let one = m.one(ty);
                let xx = m.mul(x, x);
                let den = m.sub(one, xx);
                let d = m.div(adjoint, den);
                accumulate(m, ctx, x, d);
            }
            "sqrt" => {
                let half = m.const_of(ty, 0.5);
                let ah = m.mul(adjoint, half);
                let s = m.call_extern("sqrt", vec![x], ty);
                let d = m.div(ah, s);
                accumulate(m, ctx, x, d);
            }
            "pow" => {
                let b = args[1];
                let one = m.one(ty);
                let bm1 = m.sub(b, one);
                let p = m.call_extern("pow", vec![x, bm1], ty);
                let ab = m.mul(adjoint, b);
                let da = m.mul(ab, p);
                accumulate(m, ctx, x, da);
                let p_full = m.call_extern("pow", vec![x, b], ty);
                let lg = m.call_extern("log", vec![x], ty);
                let ap = m.mul(adjoint, p_full);
                let db = m.mul(ap, lg);
                accumulate(m, ctx, b, db);
            }
            "fast_inverse" => {
                // d/dx 1/x = -1/x^2
                let inv = m.call_extern("fast_inverse", vec![x], ty);
                let na = m.neg(adjoint);
                let t = m.mul(na, inv);
                let d = m.mul(t, inv);
                accumulate(m, ctx, x, d);
            }
            "fast_inverse_sqrt" => {
                // d/dx x^(-1/2) = -1/2 x^(-3/2)
                let inv = m.call_extern("fast_inverse_sqrt", vec![x], ty);
                let neg_half = m.const_of(ty, -0.5);
                let t0 = m.mul(neg_half, adjoint);
                let t1 = m.mul(t0, inv);
                let t2 = m.mul(t1, inv);
                let d = m.mul(t2, inv);
                accumulate(m, ctx, x, d);
            }
            "ceil" | "floor" | "round" | "trunc" | "print" => {
                let zero = m.zero(ty);
                accumulate(m, ctx, x, zero);
            }
            _ => return Err(DerivativeError::UnsupportedDerivative(name.to_string())),
        }
        Ok(())
    }

    fn visit_intrinsic(
        &mut self,
        ctx: &mut StageContext,
        name: &str,
        args: &[ExprId],
        ty: ScalarType,
        adjoint: ExprId,
    ) {
        let m = &mut self.module;
        match name {
            "abs" => {
                let x = args[0];
                let zero = m.zero(ty);
                let pos = m.gt(x, zero);
                let one = m.one(ty);
                let neg_one = m.const_of(ty, -1.0);
                let sign = m.select(pos, one, neg_one);
                let d = m.mul(adjoint, sign);
                accumulate(m, ctx, x, d);
            }
            "lerp" => {
                // z = a (1 - w) + b w
                let (a, b, w) = (args[0], args[1], args[2]);
                let one = m.one(ty);
                let omw = m.sub(one, w);
                let da = m.mul(adjoint, omw);
                accumulate(m, ctx, a, da);
                let db = m.mul(adjoint, w);
                accumulate(m, ctx, b, db);
                let bma = m.sub(b, a);
                let dw = m.mul(adjoint, bma);
                accumulate(m, ctx, w, dw);
            }
            "likely" => accumulate(m, ctx, args[0], adjoint),
            "return_second" => {
                let zero = m.zero(ty);
                accumulate(m, ctx, args[0], zero);
                accumulate(m, ctx, args[1], adjoint);
            }
            "undef" => {}
            _ => {
                // Unknown intrinsics degrade to a zero gradient instead of
                // failing the whole pass.
                warn!("dropping gradients at call to `{name}`");
                let zero = m.zero(ty);
                for &arg in args {
                    accumulate(m, ctx, arg, zero);
                }
            }
        }
    }

    /// Turns a stored-function/buffer read with an accumulated adjoint into
    /// a contribution on the target's accumulator: resolve the target stage,
    /// canonicalize the write indices (inverting where possible, scattering
    /// over reduction variables where not), fold the recognizable strided
    /// patterns, merge reduction domains, and write back.
    fn scatter(
        &mut self,
        ctx: &StageContext,
        kind: CallKind,
        read_name: &str,
        args: &[ExprId],
        value_index: usize,
        adjoint_in: ExprId,
    ) -> Result<()> {
        // Contributions leave the stage body, so re-wrap the let bindings
        // they mention.
        let mut adjoint = add_let_expression(&mut self.module, adjoint_in, &ctx.let_values, &ctx.let_order);
        let mut lhs: Vec<ExprId> = args
            .iter()
            .map(|&a| add_let_expression(&mut self.module, a, &ctx.let_values, &ctx.let_order))
            .collect();
        let adjoint_before = adjoint;
        let lhs_before = lhs.clone();

        // A self-referential read targets the preceding stage; anything
        // else targets the read function's final stage (or a buffer stub).
        let target_key = match kind {
            CallKind::Function => {
                if read_name == self.current_func {
                    StageKey::new(read_name, self.current_stage - 1)
                } else {
                    let updates = self.module.funcs[read_name].num_updates();
                    StageKey::new(read_name, updates as i32 - 1)
                }
            }
            CallKind::Buffer => StageKey::new(read_name, -1),
            _ => unreachable!("scatter only handles stored reads"),
        };
        let target_adjoint = self
            .adjoints
            .get(&target_key)
            .cloned()
            .unwrap_or_else(|| panic!("no adjoint accumulator for {target_key}"));
        let target_args = self.module.funcs[&target_adjoint].args.clone();
        assert_eq!(
            target_args.len(),
            lhs.len(),
            "read of `{read_name}` has wrong arity"
        );
        trace!(
            "scatter {} -> {target_key}: {}",
            self.current_func,
            self.module.show(adjoint)
        );

        let current_key = StageKey::new(self.current_func.clone(), self.current_stage);
        let current_adjoint = self.adjoints[&current_key].clone();
        let current_args = self.module.funcs[&current_adjoint].args.clone();
        let current_bounds = self.func_bounds[self.current_func.as_str()].clone();

        // Fresh substitution variables, one per target dimension.
        let new_args: Vec<String> = (0..target_args.len()).map(|i| format!("u{i}_")).collect();

        // Invert single-variable write indices: for `target(x - 1)` we set
        // `u0_ = x - 1`, solve `x = u0_ + 1`, and read the adjoint shifted.
        let mut canonicalized = vec![false; lhs.len()];
        let mut canonicalized_vars: FxHashSet<String> = FxHashSet::default();
        for arg_id in 0..lhs.len() {
            let vars = gather_variables(&self.module, lhs[arg_id], &current_args);
            if vars.len() != 1 {
                continue;
            }
            let u = self.module.var(&new_args[arg_id]);
            let Some(inverse) = solve_inverse(&mut self.module, lhs[arg_id], u, &vars[0]) else {
                continue;
            };
            adjoint = substitute_rdom_predicate(&mut self.module, &vars[0], inverse, adjoint);
            lhs[arg_id] = u;
            canonicalized[arg_id] = true;
            canonicalized_vars.insert(vars[0].clone());
        }

        // Whatever could not be inverted scatters: the remaining pure
        // variables range over the current function's bounds box.
        let bounds_pairs: Vec<(i64, i64)> = current_bounds
            .iter()
            .map(|iv| (iv.min, iv.extent()))
            .collect();
        let mut scatter_rdom: Option<RDomId> = None;
        for lhs_id in 0..lhs.len() {
            if canonicalized[lhs_id] {
                continue;
            }
            let vars = gather_variables(&self.module, lhs[lhs_id], &current_args);
            for var in vars {
                if canonicalized_vars.contains(&var) {
                    continue;
                }
                let Some(arg_id) = current_args.iter().position(|a| *a == var) else {
                    continue;
                };
                let rd = match scatter_rdom {
                    Some(rd) => rd,
                    None => {
                        let rd = self.module.reduction(&bounds_pairs);
                        scatter_rdom = Some(rd);
                        rd
                    }
                };
                let rvar = self.module.rvar(rd, arg_id);
                lhs[lhs_id] = substitute(&mut self.module, &var, rvar, lhs[lhs_id]);
                adjoint = substitute(&mut self.module, &var, rvar, adjoint);
            }
        }

        // Close the implicit sum over dimensions absent from the left-hand
        // side: free pure variables remaining on the right range over their
        // own bound.
        let mut free_dims = Vec::new();
        for (arg_id, arg) in current_args.iter().enumerate() {
            if has_variable(&self.module, adjoint, arg) {
                free_dims.push(arg_id);
            }
        }
        if !free_dims.is_empty() {
            let sub_bounds: Vec<(i64, i64)> = free_dims
                .iter()
                .map(|&d| (current_bounds[d].min, current_bounds[d].extent()))
                .collect();
            let rd = self.module.reduction(&sub_bounds);
            for (i, &arg_id) in free_dims.iter().enumerate() {
                let rvar = self.module.rvar(rd, i);
                adjoint = substitute(&mut self.module, &current_args[arg_id], rvar, adjoint);
            }
        }

        self.fold_scatter_patterns(&mut lhs, &mut adjoint, &target_key, &target_args);

        let merged = self.merge_rdoms(
            &mut lhs,
            &mut adjoint,
            &lhs_before,
            adjoint_before,
            &new_args,
            &target_args,
        );

        // Substitution variables served their purpose; name the target's
        // canonical arguments again.
        for (arg_id, u) in new_args.iter().enumerate() {
            let canon = self.module.var(&target_args[arg_id]);
            for l in lhs.iter_mut() {
                *l = substitute(&mut self.module, u, canon, *l);
            }
            adjoint = substitute_rdom_predicate(&mut self.module, u, canon, adjoint);
        }
        adjoint = simplify(&mut self.module, adjoint);

        self.write_contribution(&target_adjoint, lhs, adjoint, value_index, merged);
        Ok(())
    }

    /// Two opportunistic rewrites that undo needless scattering:
    ///
    /// * an index that is exactly one reduction variable covering the
    ///   target's bound on that axis collapses back to a pure variable;
    /// * `stride * r_outer + r_inner` with `r_inner` over `[0, stride)`
    ///   collapses to a pure variable `v`, replacing `r_outer` by
    ///   `v / stride`, the inverse of strided downsampling.
    fn fold_scatter_patterns(
        &mut self,
        lhs: &mut [ExprId],
        adjoint: &mut ExprId,
        target_key: &StageKey,
        target_args: &[String],
    ) {
        let target_box = self.func_bounds.get(target_key.func.as_str()).cloned();
        for i in 0..lhs.len() {
            let lhs_arg = substitute_in_all_lets(&mut self.module, lhs[i]);
            match self.module.kind(lhs_arg).clone() {
                ExprKind::Var {
                    name: var_name,
                    rdom: Some((rd, slot)),
                } => {
                    let dom = self.module.rdom(rd).clone();
                    let trivial = dom
                        .predicate
                        .map_or(true, |p| self.module.is_const_true(p));
                    if !trivial {
                        continue;
                    }
                    let Some(tb) = &target_box else { continue };
                    let rvar = &dom.vars[slot];
                    if rvar.min <= tb[i].min && rvar.max() >= tb[i].max {
                        let canon = self.module.var(&target_args[i]);
                        lhs[i] = canon;
                        for j in 0..lhs.len() {
                            if j != i {
                                let s = substitute(&mut self.module, &var_name, canon, lhs[j]);
                                lhs[j] = simplify(&mut self.module, s);
                            }
                        }
                        let s = substitute(&mut self.module, &var_name, canon, *adjoint);
                        *adjoint = simplify(&mut self.module, s);
                    }
                }
                ExprKind::Binary {
                    op: BinOp::Add,
                    a,
                    b,
                } => {
                    let (mul_side, var_side) = match (self.module.kind(a), self.module.kind(b)) {
                        (ExprKind::Binary { op: BinOp::Mul, .. }, ExprKind::Var { .. }) => (a, b),
                        (ExprKind::Var { .. }, ExprKind::Binary { op: BinOp::Mul, .. }) => (b, a),
                        _ => continue,
                    };
                    let ExprKind::Var {
                        rdom: Some((inner_rd, inner_slot)),
                        ..
                    } = self.module.kind(var_side).clone()
                    else {
                        continue;
                    };
                    let &ExprKind::Binary {
                        op: BinOp::Mul,
                        a: ma,
                        b: mb,
                    } = self.module.kind(mul_side)
                    else {
                        unreachable!()
                    };
                    let is_rvar = |m: &Module, e: ExprId| {
                        matches!(m.kind(e), ExprKind::Var { rdom: Some(_), .. })
                    };
                    let (stride, outer) = if is_rvar(&self.module, ma) {
                        (mb, ma)
                    } else {
                        (ma, mb)
                    };
                    let ExprKind::Var {
                        name: outer_name,
                        rdom: Some(_),
                    } = self.module.kind(outer).clone()
                    else {
                        continue;
                    };
                    let Some(stride_c) = self.module.is_const(stride) else {
                        continue;
                    };
                    let inner = self.module.rdom(inner_rd).vars[inner_slot].clone();
                    if inner.min != 0 || inner.extent != stride_c.to_f64() as i64 {
                        continue;
                    }
                    let canon = self.module.var(&target_args[i]);
                    lhs[i] = canon;
                    let flat = substitute_in_all_lets(&mut self.module, *adjoint);
                    *adjoint = substitute_expr(&mut self.module, lhs_arg, canon, flat);
                    let ratio = self.module.div(canon, stride);
                    *adjoint = substitute(&mut self.module, &outer_name, ratio, *adjoint);
                    *adjoint = simplify(&mut self.module, *adjoint);
                }
                _ => {}
            }
        }
    }

    /// At most one reduction domain survives per stage: partition the
    /// contributing variables into newly introduced and pre-existing, order
    /// new before old (each sorted by owning domain and declaration index),
    /// build one normalized domain, and conjoin the predicates.
    fn merge_rdoms(
        &mut self,
        lhs: &mut [ExprId],
        adjoint: &mut ExprId,
        lhs_before: &[ExprId],
        adjoint_before: ExprId,
        new_args: &[String],
        target_args: &[String],
    ) -> Option<RDomId> {
        let mut rvar_map = gather_rvariables(&self.module, *adjoint);
        for &l in lhs.iter() {
            rvar_map.extend(gather_rvariables(&self.module, l));
        }
        let mut org_map = gather_rvariables(&self.module, adjoint_before);
        for &l in lhs_before {
            org_map.extend(gather_rvariables(&self.module, l));
        }

        let (mut new_rvars, mut old_rvars): (Vec<RVarInfo>, Vec<RVarInfo>) = (vec![], vec![]);
        for (name, info) in &rvar_map {
            if org_map.contains_key(name) {
                old_rvars.push(info.clone());
            } else {
                new_rvars.push(info.clone());
            }
        }
        new_rvars.sort_by_key(|i| (i.rdom, i.index));
        old_rvars.sort_by_key(|i| (i.rdom, i.index));
        let ordered: Vec<RVarInfo> = new_rvars.into_iter().chain(old_rvars).collect();
        if ordered.is_empty() {
            return None;
        }

        let base = self.module.fresh_name("r");
        let vars: Vec<RVar> = ordered
            .iter()
            .enumerate()
            .map(|(i, info)| RVar {
                name: format!("{base}_{i}"),
                min: info.min,
                extent: info.extent,
            })
            .collect();
        let merged = self.module.add_rdom(vars, None);

        let mut domains: Vec<RDomId> = rvar_map.values().map(|i| i.rdom).collect();
        domains.sort_unstable();
        domains.dedup();
        let mut predicate = self.module.lit(true);
        for dom in domains {
            if let Some(p) = self.module.rdom(dom).predicate {
                let conj = self.module.and(predicate, p);
                predicate = simplify(&mut self.module, conj);
            }
        }

        for (slot, info) in ordered.iter().enumerate() {
            let mv = self.module.rvar(merged, slot);
            *adjoint = substitute(&mut self.module, &info.name, mv, *adjoint);
            for l in lhs.iter_mut() {
                *l = substitute(&mut self.module, &info.name, mv, *l);
            }
            predicate = substitute(&mut self.module, &info.name, mv, predicate);
        }
        if !self.module.is_const_true(predicate) {
            for (arg_id, u) in new_args.iter().enumerate() {
                let canon = self.module.var(&target_args[arg_id]);
                predicate = substitute(&mut self.module, u, canon, predicate);
            }
            self.module.rdoms[merged.0].predicate = Some(predicate);
        }
        Some(merged)
    }

    /// Lands `target(lhs) += adjoint`: folded into the zero-valued pure
    /// definition when possible, merged additively into a matching latest
    /// update, or appended as a brand-new update stage.
    fn write_contribution(
        &mut self,
        target: &str,
        lhs: Vec<ExprId>,
        adjoint: ExprId,
        value_index: usize,
        merged: Option<RDomId>,
    ) {
        let tf = self.module.funcs[target].clone();
        let value_count = tf.values().len();

        let can_merge = if tf.num_updates() == 0 {
            let plain = lhs.iter().zip(tf.args.iter()).all(|(&l, a)| {
                matches!(self.module.kind(l), ExprKind::Var { name, .. } if name == a)
            });
            plain && extract_rdom(&self.module, adjoint).is_none()
        } else {
            let last = tf.stages.last().unwrap();
            let prev_lhs = last.lhs.as_ref().expect("update stage carries write indices");
            let same_lhs = prev_lhs.len() == lhs.len()
                && prev_lhs
                    .iter()
                    .zip(lhs.iter())
                    .all(|(&p, &l)| self.module.expr_eq(p, l));
            same_lhs
                && match (last.rdom, merged) {
                    (None, None) => true,
                    (Some(prev_rd), Some(mrd)) => {
                        let prev_vars = &self.module.rdom(prev_rd).vars;
                        let merged_vars = &self.module.rdom(mrd).vars;
                        prev_vars.len() == merged_vars.len()
                            && prev_vars
                                .iter()
                                .zip(merged_vars.iter())
                                .all(|(p, q)| p.min == q.min && p.extent == q.extent)
                    }
                    _ => false,
                }
        };

        if !can_merge {
            let mut values = Vec::with_capacity(value_count);
            let value_tys = self.module.value_types(target);
            for i in 0..value_count {
                if i == value_index {
                    let read = self.module.read_elem(target, lhs.clone(), i);
                    values.push(self.module.add(read, adjoint));
                } else {
                    values.push(self.module.undef(value_tys[i]));
                }
            }
            self.module.define_update(target, lhs, values, merged);
            return;
        }

        if tf.num_updates() == 0 {
            let mut stages = tf.stages;
            let old = stages[0].values[value_index];
            let sum = self.module.add(old, adjoint);
            stages[0].values[value_index] = simplify(&mut self.module, sum);
            self.module.funcs.get_mut(target).unwrap().stages = stages;
            return;
        }

        let last_idx = tf.stages.len() - 1;
        let mut stage = tf.stages[last_idx].clone();
        let mut adjoint = adjoint;
        if let (Some(prev_rd), Some(mrd)) = (stage.rdom, merged) {
            // Speak in the existing stage's reduction variables.
            let merged_vars = self.module.rdom(mrd).vars.clone();
            for (slot, mv) in merged_vars.iter().enumerate() {
                let pv = self.module.rvar(prev_rd, slot);
                adjoint = substitute(&mut self.module, &mv.name, pv, adjoint);
            }
        }
        let old = stage.values[value_index];
        // `+=` on one tuple slot leaves an explicit undef in the trailing
        // position; unwrap it instead of adding to it.
        let base = match self.module.kind(old) {
            &ExprKind::Binary {
                op: BinOp::Add,
                a,
                b,
            } if self.module.is_undef(b) => a,
            _ => old,
        };
        let sum = self.module.add(base, adjoint);
        stage.values[value_index] = simplify(&mut self.module, sum);
        self.module.funcs.get_mut(target).unwrap().stages[last_idx] = stage;
    }
}

fn one_minus_square_sqrt(m: &mut Module, x: ExprId, ty: ScalarType) -> ExprId {
    let one = m.one(ty);
    let xx = m.mul(x, x);
    let diff = m.sub(one, xx);
    m.call_extern("sqrt", vec![diff], ty)
}

/// Symbolically inverts `u == e(v)` for the single-occurrence variable `v`,
/// returning `v` expressed in terms of `u`. Only additive chains invert;
/// multiplicative indices are non-bijective over the integers and are left
/// to the generic scatter (and the strided-pattern fold).
fn solve_inverse(m: &mut Module, e: ExprId, u: ExprId, var: &str) -> Option<ExprId> {
    let e = substitute_in_all_lets(m, e);
    let mut cur = simplify(m, e);
    let mut acc = u;
    loop {
        match m.kind(cur).clone() {
            ExprKind::Var { name, .. } if name == var => return Some(acc),
            ExprKind::Binary {
                op: BinOp::Add,
                a,
                b,
            } => match (has_variable(m, a, var), has_variable(m, b, var)) {
                (true, false) => {
                    acc = m.sub(acc, b);
                    cur = a;
                }
                (false, true) => {
                    acc = m.sub(acc, a);
                    cur = b;
                }
                _ => return None,
            },
            ExprKind::Binary {
                op: BinOp::Sub,
                a,
                b,
            } => match (has_variable(m, a, var), has_variable(m, b, var)) {
                (true, false) => {
                    acc = m.add(acc, b);
                    cur = a;
                }
                (false, true) => {
                    acc = m.sub(a, acc);
                    cur = b;
                }
                _ => return None,
            },
            _ => return None,
        }
    }
}
