//! Traversal utilities over the function graph and expression forests.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::error::{DerivativeError, Result};
use crate::expr::{CallKind, ExprId, ExprKind, ScalarType};
use crate::func::{Function, RDomId};
use crate::module::Module;

/// Information about one reduction variable occurring in an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct RVarInfo {
    pub name: String,
    pub rdom: RDomId,
    pub index: usize,
    pub min: i64,
    pub extent: i64,
}

/// Information about one raw-buffer read site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferReadInfo {
    pub dimensions: usize,
    pub ty: ScalarType,
}

/// Total order over the functions transitively called from `root`,
/// producers before consumers, the root last.
pub fn realization_order(m: &Module, root: &str) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut visited = FxHashSet::default();
    visit_func(m, root, &mut visited, &mut order)?;
    Ok(order)
}

fn visit_func(
    m: &Module,
    name: &str,
    visited: &mut FxHashSet<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if !visited.insert(name.to_string()) {
        return Ok(());
    }
    let f = m
        .func(name)
        .ok_or_else(|| DerivativeError::UnknownFunction(name.to_string()))?;
    for callee in function_calls(m, f) {
        if callee != name {
            visit_func(m, &callee, visited, order)?;
        }
    }
    order.push(name.to_string());
    Ok(())
}

/// Names of stored functions a function reads, in order of appearance
/// across all stages (left-hand sides and predicates included).
fn function_calls(m: &Module, f: &Function) -> Vec<String> {
    let mut calls = Vec::new();
    for expr in stage_exprs(m, f) {
        collect_calls(m, expr, CallKind::Function, &mut calls);
    }
    calls
}

fn stage_exprs(m: &Module, f: &Function) -> Vec<ExprId> {
    let mut exprs = Vec::new();
    for stage in &f.stages {
        if let Some(lhs) = &stage.lhs {
            exprs.extend(lhs.iter().copied());
        }
        exprs.extend(stage.values.iter().copied());
        if let Some(rdom) = stage.rdom {
            if let Some(pred) = m.rdom(rdom).predicate {
                exprs.push(pred);
            }
        }
    }
    exprs
}

fn collect_calls(m: &Module, expr: ExprId, want: CallKind, out: &mut Vec<String>) {
    walk(m, expr, &mut |m, id| {
        if let ExprKind::Call { kind, name, .. } = m.kind(id) {
            if *kind == want && !out.contains(name) {
                out.push(name.clone());
            }
        }
    });
}

/// Every raw-buffer read of a function, keyed by buffer name.
pub fn find_buffer_reads(m: &Module, func: &str) -> BTreeMap<String, BufferReadInfo> {
    let mut reads = BTreeMap::new();
    let Some(f) = m.func(func) else {
        return reads;
    };
    for expr in stage_exprs(m, f) {
        walk(m, expr, &mut |m, id| {
            if let ExprKind::Call {
                kind: CallKind::Buffer,
                name,
                args,
                ..
            } = m.kind(id)
            {
                reads.insert(
                    name.clone(),
                    BufferReadInfo {
                        dimensions: args.len(),
                        ty: m.ty(id),
                    },
                );
            }
        });
    }
    reads
}

/// Topologically sorts the expression forest of one stage's tuple values:
/// every node reachable along a differentiable edge, each identity exactly
/// once, operands before consumers, the roots last.
///
/// Select conditions, comparison operands and the index arguments of
/// stored-function/buffer reads carry no derivative, so the sort does not
/// descend into them; adjoints never flow there.
pub fn sort_expressions(m: &Module, roots: &[ExprId]) -> Vec<ExprId> {
    let mut sorted = Vec::new();
    let mut visited = FxHashSet::default();
    for &root in roots {
        sort_visit(m, root, &mut visited, &mut sorted);
    }
    sorted
}

fn sort_visit(m: &Module, id: ExprId, visited: &mut FxHashSet<ExprId>, out: &mut Vec<ExprId>) {
    if !visited.insert(id) {
        return;
    }
    match m.kind(id) {
        ExprKind::Const(_) | ExprKind::Var { .. } | ExprKind::Cmp { .. } => {}
        ExprKind::Cast(v) => sort_visit(m, *v, visited, out),
        ExprKind::Binary { a, b, .. } => {
            sort_visit(m, *a, visited, out);
            sort_visit(m, *b, visited, out);
        }
        ExprKind::Select {
            if_true, if_false, ..
        } => {
            sort_visit(m, *if_true, visited, out);
            sort_visit(m, *if_false, visited, out);
        }
        ExprKind::Let { value, body, .. } => {
            sort_visit(m, *value, visited, out);
            sort_visit(m, *body, visited, out);
        }
        ExprKind::Call { kind, args, .. } => match kind {
            CallKind::Extern | CallKind::Intrinsic => {
                for &arg in args {
                    sort_visit(m, arg, visited, out);
                }
            }
            CallKind::Function | CallKind::Buffer => {}
        },
    }
    out.push(id);
}

/// Distinct variable names from `allowed` occurring in `expr`, in order of
/// appearance.
pub fn gather_variables(m: &Module, expr: ExprId, allowed: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    walk(m, expr, &mut |m, id| {
        if let ExprKind::Var { name, .. } = m.kind(id) {
            if allowed.contains(name) && !found.contains(name) {
                found.push(name.clone());
            }
        }
    });
    found
}

/// Every reduction variable occurring in `expr`, keyed by name.
pub fn gather_rvariables(m: &Module, expr: ExprId) -> BTreeMap<String, RVarInfo> {
    let mut found = BTreeMap::new();
    walk(m, expr, &mut |m, id| {
        if let ExprKind::Var {
            name,
            rdom: Some((rdom, index)),
        } = m.kind(id)
        {
            let var = &m.rdom(*rdom).vars[*index];
            found.insert(
                name.clone(),
                RVarInfo {
                    name: name.clone(),
                    rdom: *rdom,
                    index: *index,
                    min: var.min,
                    extent: var.extent,
                },
            );
        }
    });
    found
}

/// The first reduction domain referenced anywhere in `expr`, if any.
pub fn extract_rdom(m: &Module, expr: ExprId) -> Option<RDomId> {
    gather_rvariables(m, expr)
        .into_values()
        .map(|info| info.rdom)
        .next()
}

pub fn has_variable(m: &Module, expr: ExprId, name: &str) -> bool {
    let mut found = false;
    walk(m, expr, &mut |m, id| {
        if let ExprKind::Var { name: n, .. } = m.kind(id) {
            if n == name {
                found = true;
            }
        }
    });
    found
}

/// Wraps `expr` with the let bindings it references, innermost-last, so a
/// contribution lifted out of a stage body stays well scoped.
pub fn add_let_expression(
    m: &mut Module,
    expr: ExprId,
    let_values: &BTreeMap<String, ExprId>,
    let_order: &[String],
) -> ExprId {
    let mut wrapped = expr;
    for name in let_order.iter().rev() {
        if has_variable(m, wrapped, name) {
            let value = let_values[name];
            wrapped = m.let_in(name, value, wrapped);
        }
    }
    wrapped
}

/// Exhaustive pre-order walk of an expression tree (every edge, including
/// conditions and call arguments).
fn walk(m: &Module, expr: ExprId, f: &mut impl FnMut(&Module, ExprId)) {
    f(m, expr);
    match m.kind(expr) {
        ExprKind::Const(_) | ExprKind::Var { .. } => {}
        ExprKind::Cast(v) => walk(m, *v, f),
        ExprKind::Binary { a, b, .. } | ExprKind::Cmp { a, b, .. } => {
            walk(m, *a, f);
            walk(m, *b, f);
        }
        ExprKind::Select {
            cond,
            if_true,
            if_false,
        } => {
            walk(m, *cond, f);
            walk(m, *if_true, f);
            walk(m, *if_false, f);
        }
        ExprKind::Let { value, body, .. } => {
            walk(m, *value, f);
            walk(m, *body, f);
        }
        ExprKind::Call { args, .. } => {
            for &arg in args {
                walk(m, arg, f);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realization_order_producers_first() {
        let mut m = Module::new();
        let x = m.var("x");
        let b = m.read_buffer("input", vec![x]);
        m.define("a", &["x"], vec![b]);
        let x2 = m.var("x");
        let ra = m.read("a", vec![x2]);
        m.define("mid", &["x"], vec![ra]);
        let x3 = m.var("x");
        let rm = m.read("mid", vec![x3]);
        m.define("out", &["x"], vec![rm]);

        let order = realization_order(&m, "out").unwrap();
        assert_eq!(order, vec!["a", "mid", "out"]);
    }

    #[test]
    fn test_sort_visits_shared_nodes_once() {
        let mut m = Module::new();
        let x = m.var("x");
        let shared = {
            let b = m.read_buffer("input", vec![x]);
            let two = m.lit(2.0f32);
            m.mul(b, two)
        };
        let e = m.add(shared, shared);
        let sorted = sort_expressions(&m, &[e]);
        assert_eq!(sorted.iter().filter(|&&n| n == shared).count(), 1);
        // Operands come before their consumer.
        let shared_pos = sorted.iter().position(|&n| n == shared).unwrap();
        let root_pos = sorted.iter().position(|&n| n == e).unwrap();
        assert!(shared_pos < root_pos);
        assert_eq!(root_pos, sorted.len() - 1);
    }

    #[test]
    fn test_sort_skips_select_condition() {
        let mut m = Module::new();
        let x = m.var("x");
        let zero = m.lit(0i32);
        let cond = m.gt(x, zero);
        let t = m.lit(1.0f32);
        let f = m.lit(2.0f32);
        let e = m.select(cond, t, f);
        let sorted = sort_expressions(&m, &[e]);
        assert!(!sorted.contains(&cond));
        assert!(sorted.contains(&t));
        assert!(sorted.contains(&f));
    }

    #[test]
    fn test_gather_variables_filters_and_dedups() {
        let mut m = Module::new();
        let x = m.var("x");
        let y = m.var("y");
        let r = m.var("r");
        let s = m.add(x, y);
        let t = m.add(s, r);
        let x2 = m.var("x");
        let e = m.mul(t, x2);
        let allowed = vec!["x".to_string(), "y".to_string()];
        assert_eq!(gather_variables(&m, e, &allowed), vec!["x", "y"]);
    }

    #[test]
    fn test_gather_rvariables() {
        let mut m = Module::new();
        let rd = m.reduction(&[(0, 8), (2, 3)]);
        let r0 = m.rvar(rd, 0);
        let r1 = m.rvar(rd, 1);
        let e = m.add(r0, r1);
        let found = gather_rvariables(&m, e);
        assert_eq!(found.len(), 2);
        let info = found.values().find(|i| i.index == 1).unwrap();
        assert_eq!((info.min, info.extent), (2, 3));
    }

    #[test]
    fn test_add_let_expression_wraps_only_referenced() {
        let mut m = Module::new();
        let one = m.lit(1.0f32);
        let two = m.lit(2.0f32);
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), one);
        values.insert("b".to_string(), two);
        let order = vec!["a".to_string(), "b".to_string()];
        let a = m.var("a");
        let wrapped = add_let_expression(&mut m, a, &values, &order);
        assert_eq!(m.show(wrapped).to_string(), "(let a = 1 in a)");
    }
}
