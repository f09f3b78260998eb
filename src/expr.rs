//! Expression node kinds for the array IR.
//!
//! Expressions form a DAG, not a tree: nodes live in the arena owned by
//! [`crate::module::Module`] and reference their operands by [`ExprId`].
//! Sharing a sub-expression means reusing its id, and derivative
//! accumulation is keyed by id, never by structural equality.

use std::fmt;

use crate::func::RDomId;

/// Scalar element types carried by every expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl ScalarType {
    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub fn is_int(self) -> bool {
        matches!(self, ScalarType::I32 | ScalarType::I64)
    }
}

/// A typed constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    Bool(bool),
}

impl Const {
    pub fn ty(self) -> ScalarType {
        match self {
            Const::F32(_) => ScalarType::F32,
            Const::F64(_) => ScalarType::F64,
            Const::I32(_) => ScalarType::I32,
            Const::I64(_) => ScalarType::I64,
            Const::Bool(_) => ScalarType::Bool,
        }
    }

    /// Builds a constant of the requested type from an `f64` value.
    pub fn of(ty: ScalarType, v: f64) -> Self {
        match ty {
            ScalarType::F32 => Const::F32(v as f32),
            ScalarType::F64 => Const::F64(v),
            ScalarType::I32 => Const::I32(v as i32),
            ScalarType::I64 => Const::I64(v as i64),
            ScalarType::Bool => Const::Bool(v != 0.0),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Const::F32(v) => f64::from(v),
            Const::F64(v) => v,
            Const::I32(v) => f64::from(v),
            Const::I64(v) => v as f64,
            Const::Bool(v) => f64::from(u8::from(v)),
        }
    }

    pub fn is_zero(self) -> bool {
        self.to_f64() == 0.0
    }

    pub fn is_one(self) -> bool {
        self.to_f64() == 1.0
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::F32(v) => write!(f, "{v}"),
            Const::F64(v) => write!(f, "{v}"),
            Const::I32(v) => write!(f, "{v}"),
            Const::I64(v) => write!(f, "{v}"),
            Const::Bool(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_const_from {
    ($variant:ident, $num_type:ident) => {
        impl From<$num_type> for Const {
            fn from(v: $num_type) -> Self {
                Const::$variant(v)
            }
        }
    };
}

impl_const_from!(F32, f32);
impl_const_from!(F64, f64);
impl_const_from!(I32, i32);
impl_const_from!(I64, i64);
impl_const_from!(Bool, bool);

/// Identity of an expression node inside the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub usize);

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

/// Comparison operators; the result type is always [`ScalarType::Bool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// Classifies what a [`ExprKind::Call`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// A known math primitive (`exp`, `sin`, `pow`, ...).
    Extern,
    /// A compiler intrinsic (`abs`, `lerp`, `likely`, ...).
    Intrinsic,
    /// A read of another stored function at the given indices.
    Function,
    /// A read of a raw input buffer at the given indices.
    Buffer,
}

/// The closed set of expression node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Const(Const),
    /// A scalar variable. Reduction variables carry a back-reference to
    /// their owning domain and slot; the domain is not owned by the node.
    Var {
        name: String,
        rdom: Option<(RDomId, usize)>,
    },
    /// Conversion to the node's own type.
    Cast(ExprId),
    Binary {
        op: BinOp,
        a: ExprId,
        b: ExprId,
    },
    Cmp {
        op: CmpOp,
        a: ExprId,
        b: ExprId,
    },
    Select {
        cond: ExprId,
        if_true: ExprId,
        if_false: ExprId,
    },
    Let {
        name: String,
        value: ExprId,
        body: ExprId,
    },
    Call {
        kind: CallKind,
        name: String,
        args: Vec<ExprId>,
        /// Which slot of a tuple-valued function this read selects.
        value_index: usize,
    },
}

/// One arena slot: a node kind plus its scalar type.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub ty: ScalarType,
}
