//! The module: expression arena, function table, reduction domains and
//! buffers.
//!
//! The `Module` owns every expression node. Builder methods hand back
//! [`ExprId`]s; reusing an id in several parents is how sub-expressions are
//! shared, and the differentiation engines key their scratch state on those
//! ids.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::ArrayD;

use crate::expr::{BinOp, CallKind, CmpOp, Const, ExprId, ExprKind, ExprNode, ScalarType};
use crate::func::{Buffer, Function, RDom, RDomId, RVar, Stage};

#[derive(Debug, Clone, Default)]
pub struct Module {
    exprs: Vec<ExprNode>,
    pub funcs: BTreeMap<String, Function>,
    pub rdoms: Vec<RDom>,
    pub buffers: BTreeMap<String, Buffer>,
    fresh_counter: usize,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    // --- Arena access ---

    pub fn push(&mut self, kind: ExprKind, ty: ScalarType) -> ExprId {
        let id = ExprId(self.exprs.len());
        self.exprs.push(ExprNode { kind, ty });
        id
    }

    pub fn kind(&self, id: ExprId) -> &ExprKind {
        &self.exprs[id.0].kind
    }

    pub fn ty(&self, id: ExprId) -> ScalarType {
        self.exprs[id.0].ty
    }

    /// A fresh, module-unique name with the given prefix.
    pub fn fresh_name(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}{}", self.fresh_counter);
        self.fresh_counter += 1;
        name
    }

    // --- Leaf constructors ---

    pub fn lit(&mut self, c: impl Into<Const>) -> ExprId {
        let c = c.into();
        self.push(ExprKind::Const(c), c.ty())
    }

    /// A constant of the requested type, from an `f64` value.
    pub fn const_of(&mut self, ty: ScalarType, v: f64) -> ExprId {
        self.push(ExprKind::Const(Const::of(ty, v)), ty)
    }

    pub fn zero(&mut self, ty: ScalarType) -> ExprId {
        self.const_of(ty, 0.0)
    }

    pub fn one(&mut self, ty: ScalarType) -> ExprId {
        self.const_of(ty, 1.0)
    }

    /// An index variable. Index variables are `I32`.
    pub fn var(&mut self, name: &str) -> ExprId {
        self.push(
            ExprKind::Var {
                name: name.to_string(),
                rdom: None,
            },
            ScalarType::I32,
        )
    }

    /// A reference to slot `index` of a reduction domain.
    pub fn rvar(&mut self, rdom: RDomId, index: usize) -> ExprId {
        let name = self.rdoms[rdom.0].vars[index].name.clone();
        self.push(
            ExprKind::Var {
                name,
                rdom: Some((rdom, index)),
            },
            ScalarType::I32,
        )
    }

    // --- Operators ---

    pub fn cast(&mut self, ty: ScalarType, value: ExprId) -> ExprId {
        self.push(ExprKind::Cast(value), ty)
    }

    pub fn binary(&mut self, op: BinOp, a: ExprId, b: ExprId) -> ExprId {
        let ty = self.ty(a);
        self.push(ExprKind::Binary { op, a, b }, ty)
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinOp::Add, a, b)
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinOp::Mul, a, b)
    }

    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinOp::Div, a, b)
    }

    pub fn min(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinOp::Min, a, b)
    }

    pub fn max(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.binary(BinOp::Max, a, b)
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        let zero = self.zero(self.ty(a));
        self.sub(zero, a)
    }

    pub fn cmp(&mut self, op: CmpOp, a: ExprId, b: ExprId) -> ExprId {
        self.push(ExprKind::Cmp { op, a, b }, ScalarType::Bool)
    }

    pub fn lt(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.cmp(CmpOp::Lt, a, b)
    }

    pub fn le(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.cmp(CmpOp::Le, a, b)
    }

    pub fn gt(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.cmp(CmpOp::Gt, a, b)
    }

    pub fn ge(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.cmp(CmpOp::Ge, a, b)
    }

    pub fn eq(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.cmp(CmpOp::Eq, a, b)
    }

    pub fn and(&mut self, a: ExprId, b: ExprId) -> ExprId {
        // Boolean conjunction as a select keeps the node set closed.
        let f = self.lit(false);
        self.select(a, b, f)
    }

    pub fn select(&mut self, cond: ExprId, if_true: ExprId, if_false: ExprId) -> ExprId {
        let ty = self.ty(if_true);
        self.push(
            ExprKind::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    pub fn let_in(&mut self, name: &str, value: ExprId, body: ExprId) -> ExprId {
        let ty = self.ty(body);
        self.push(
            ExprKind::Let {
                name: name.to_string(),
                value,
                body,
            },
            ty,
        )
    }

    // --- Calls ---

    pub fn call_extern(&mut self, name: &str, args: Vec<ExprId>, ty: ScalarType) -> ExprId {
        self.push(
            ExprKind::Call {
                kind: CallKind::Extern,
                name: name.to_string(),
                args,
                value_index: 0,
            },
            ty,
        )
    }

    pub fn call_intrinsic(&mut self, name: &str, args: Vec<ExprId>, ty: ScalarType) -> ExprId {
        self.push(
            ExprKind::Call {
                kind: CallKind::Intrinsic,
                name: name.to_string(),
                args,
                value_index: 0,
            },
            ty,
        )
    }

    pub fn likely(&mut self, a: ExprId) -> ExprId {
        let ty = self.ty(a);
        self.call_intrinsic("likely", vec![a], ty)
    }

    /// An explicitly undefined value; stores of it are skipped.
    pub fn undef(&mut self, ty: ScalarType) -> ExprId {
        self.call_intrinsic("undef", vec![], ty)
    }

    pub fn is_undef(&self, id: ExprId) -> bool {
        matches!(
            self.kind(id),
            ExprKind::Call {
                kind: CallKind::Intrinsic,
                name,
                ..
            } if name == "undef"
        )
    }

    /// Reads slot 0 of a stored function.
    pub fn read(&mut self, func: &str, args: Vec<ExprId>) -> ExprId {
        self.read_elem(func, args, 0)
    }

    /// Reads one slot of a (possibly tuple-valued) stored function.
    pub fn read_elem(&mut self, func: &str, args: Vec<ExprId>, value_index: usize) -> ExprId {
        let ty = self
            .funcs
            .get(func)
            .map(|f| self.ty(f.values()[value_index]))
            .unwrap_or(ScalarType::F32);
        self.push(
            ExprKind::Call {
                kind: CallKind::Function,
                name: func.to_string(),
                args,
                value_index,
            },
            ty,
        )
    }

    pub fn read_buffer(&mut self, name: &str, args: Vec<ExprId>) -> ExprId {
        let ty = self
            .buffers
            .get(name)
            .map(|b| b.ty)
            .unwrap_or(ScalarType::F32);
        self.push(
            ExprKind::Call {
                kind: CallKind::Buffer,
                name: name.to_string(),
                args,
                value_index: 0,
            },
            ty,
        )
    }

    // --- Functions, domains, buffers ---

    /// Defines (or redefines) the pure stage of a function.
    pub fn define(&mut self, name: &str, args: &[&str], values: Vec<ExprId>) {
        self.funcs.insert(
            name.to_string(),
            Function {
                name: name.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                stages: vec![Stage {
                    lhs: None,
                    values,
                    rdom: None,
                }],
            },
        );
    }

    /// Appends an update stage to an existing function.
    ///
    /// # Panics
    ///
    /// Panics if the function has no pure definition yet.
    pub fn define_update(
        &mut self,
        name: &str,
        lhs: Vec<ExprId>,
        values: Vec<ExprId>,
        rdom: Option<RDomId>,
    ) {
        let f = self
            .funcs
            .get_mut(name)
            .unwrap_or_else(|| panic!("update of undefined function `{name}`"));
        f.stages.push(Stage {
            lhs: Some(lhs),
            values,
            rdom,
        });
    }

    pub fn func(&self, name: &str) -> Option<&Function> {
        self.funcs.get(name)
    }

    /// Value types of a function's tuple, taken from its pure definition.
    pub fn value_types(&self, name: &str) -> Vec<ScalarType> {
        let f = &self.funcs[name];
        f.values().iter().map(|&v| self.ty(v)).collect()
    }

    /// Creates a reduction domain over the given `(min, extent)` ranges with
    /// fresh variable names.
    pub fn reduction(&mut self, bounds: &[(i64, i64)]) -> RDomId {
        let base = self.fresh_name("r");
        let vars = bounds
            .iter()
            .enumerate()
            .map(|(i, &(min, extent))| RVar {
                name: format!("{base}_{i}"),
                min,
                extent,
            })
            .collect();
        self.add_rdom(vars, None)
    }

    pub fn add_rdom(&mut self, vars: Vec<RVar>, predicate: Option<ExprId>) -> RDomId {
        let id = RDomId(self.rdoms.len());
        self.rdoms.push(RDom { vars, predicate });
        id
    }

    pub fn rdom(&self, id: RDomId) -> &RDom {
        &self.rdoms[id.0]
    }

    pub fn add_buffer(&mut self, name: &str, ty: ScalarType, mins: Vec<i64>, data: ArrayD<f64>) {
        assert_eq!(mins.len(), data.ndim(), "buffer mins/data rank mismatch");
        self.buffers.insert(
            name.to_string(),
            Buffer {
                name: name.to_string(),
                ty,
                mins,
                data,
            },
        );
    }

    // --- Structural helpers ---

    pub fn is_const(&self, id: ExprId) -> Option<Const> {
        match self.kind(id) {
            ExprKind::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_zero(&self, id: ExprId) -> bool {
        self.is_const(id).is_some_and(Const::is_zero)
    }

    pub fn is_one(&self, id: ExprId) -> bool {
        self.is_const(id).is_some_and(Const::is_one)
    }

    pub fn is_const_true(&self, id: ExprId) -> bool {
        matches!(self.kind(id), ExprKind::Const(Const::Bool(true)))
    }

    /// Structural equality of two expressions. Variables compare by name;
    /// this is distinct from identity (`ExprId`) equality.
    pub fn expr_eq(&self, a: ExprId, b: ExprId) -> bool {
        if a == b {
            return true;
        }
        match (self.kind(a), self.kind(b)) {
            (ExprKind::Const(x), ExprKind::Const(y)) => x == y,
            (ExprKind::Var { name: x, .. }, ExprKind::Var { name: y, .. }) => x == y,
            (ExprKind::Cast(x), ExprKind::Cast(y)) => {
                self.ty(a) == self.ty(b) && self.expr_eq(*x, *y)
            }
            (
                ExprKind::Binary { op: o1, a: a1, b: b1 },
                ExprKind::Binary { op: o2, a: a2, b: b2 },
            ) => o1 == o2 && self.expr_eq(*a1, *a2) && self.expr_eq(*b1, *b2),
            (
                ExprKind::Cmp { op: o1, a: a1, b: b1 },
                ExprKind::Cmp { op: o2, a: a2, b: b2 },
            ) => o1 == o2 && self.expr_eq(*a1, *a2) && self.expr_eq(*b1, *b2),
            (
                ExprKind::Select {
                    cond: c1,
                    if_true: t1,
                    if_false: f1,
                },
                ExprKind::Select {
                    cond: c2,
                    if_true: t2,
                    if_false: f2,
                },
            ) => self.expr_eq(*c1, *c2) && self.expr_eq(*t1, *t2) && self.expr_eq(*f1, *f2),
            (
                ExprKind::Let {
                    name: n1,
                    value: v1,
                    body: b1,
                },
                ExprKind::Let {
                    name: n2,
                    value: v2,
                    body: b2,
                },
            ) => n1 == n2 && self.expr_eq(*v1, *v2) && self.expr_eq(*b1, *b2),
            (
                ExprKind::Call {
                    kind: k1,
                    name: n1,
                    args: a1,
                    value_index: i1,
                },
                ExprKind::Call {
                    kind: k2,
                    name: n2,
                    args: a2,
                    value_index: i2,
                },
            ) => {
                k1 == k2
                    && n1 == n2
                    && i1 == i2
                    && a1.len() == a2.len()
                    && a1.iter().zip(a2.iter()).all(|(&x, &y)| self.expr_eq(x, y))
            }
            _ => false,
        }
    }

    /// Pretty-printer handle for one expression.
    pub fn show(&self, id: ExprId) -> ExprDisplay<'_> {
        ExprDisplay { module: self, id }
    }
}

/// Displays an expression by walking the arena.
pub struct ExprDisplay<'a> {
    module: &'a Module,
    id: ExprId,
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.module;
        match m.kind(self.id) {
            ExprKind::Const(c) => write!(f, "{c}"),
            ExprKind::Var { name, .. } => write!(f, "{name}"),
            ExprKind::Cast(v) => write!(f, "cast<{:?}>({})", m.ty(self.id), m.show(*v)),
            ExprKind::Binary { op, a, b } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Min => return write!(f, "min({}, {})", m.show(*a), m.show(*b)),
                    BinOp::Max => return write!(f, "max({}, {})", m.show(*a), m.show(*b)),
                };
                write!(f, "({} {sym} {})", m.show(*a), m.show(*b))
            }
            ExprKind::Cmp { op, a, b } => {
                let sym = match op {
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                    CmpOp::Eq => "==",
                };
                write!(f, "({} {sym} {})", m.show(*a), m.show(*b))
            }
            ExprKind::Select {
                cond,
                if_true,
                if_false,
            } => write!(
                f,
                "select({}, {}, {})",
                m.show(*cond),
                m.show(*if_true),
                m.show(*if_false)
            ),
            ExprKind::Let { name, value, body } => {
                write!(f, "(let {name} = {} in {})", m.show(*value), m.show(*body))
            }
            ExprKind::Call {
                name,
                args,
                value_index,
                ..
            } => {
                write!(f, "{name}(")?;
                for (i, &arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m.show(arg))?;
                }
                write!(f, ")")?;
                if *value_index > 0 {
                    write!(f, "[{value_index}]")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut m = Module::new();
        let x = m.var("x");
        let one = m.lit(1i32);
        let sum = m.add(x, one);
        let call = m.read("f", vec![sum]);
        assert_eq!(m.show(call).to_string(), "f((x + 1))");
    }

    #[test]
    fn test_expr_eq_is_structural() {
        let mut m = Module::new();
        let a = m.var("x");
        let b = m.var("x");
        assert_ne!(a, b);
        assert!(m.expr_eq(a, b));

        let one = m.lit(1i32);
        let s1 = m.add(a, one);
        let s2 = m.add(b, one);
        assert!(m.expr_eq(s1, s2));
        let s3 = m.sub(a, one);
        assert!(!m.expr_eq(s1, s3));
    }

    #[test]
    fn test_reduction_names_are_unique() {
        let mut m = Module::new();
        let r0 = m.reduction(&[(0, 4)]);
        let r1 = m.reduction(&[(0, 4)]);
        assert_ne!(m.rdom(r0).vars[0].name, m.rdom(r1).vars[0].name);
    }
}
