//! Functions, stages, reduction domains and buffers.

use std::fmt;

use ndarray::ArrayD;

use crate::expr::{ExprId, ScalarType};

/// Identity of a reduction domain inside the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RDomId(pub usize);

/// One reduction variable: a name and the half-open range it walks.
#[derive(Debug, Clone, PartialEq)]
pub struct RVar {
    pub name: String,
    pub min: i64,
    pub extent: i64,
}

impl RVar {
    /// Largest index value the variable takes.
    pub fn max(&self) -> i64 {
        self.min + self.extent - 1
    }
}

/// A finite implicit index set a stage sums over, with an optional
/// boolean predicate restricting it.
#[derive(Debug, Clone, PartialEq)]
pub struct RDom {
    pub vars: Vec<RVar>,
    pub predicate: Option<ExprId>,
}

/// One definition of a function.
///
/// The pure definition writes at the function's own argument tuple and has
/// `lhs == None`; update stages carry explicit left-hand-side index
/// expressions. Stages are immutable values: rewriting a function means
/// replacing entries of its stage list, never mutating shared state.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub lhs: Option<Vec<ExprId>>,
    pub values: Vec<ExprId>,
    pub rdom: Option<RDomId>,
}

/// A named function: a pure definition followed by zero or more sequential
/// update (overwrite) stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub args: Vec<String>,
    /// `stages[0]` is the pure definition, `stages[i + 1]` is update `i`.
    pub stages: Vec<Stage>,
}

impl Function {
    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    pub fn num_updates(&self) -> usize {
        self.stages.len() - 1
    }

    /// Stage index of the final definition (`-1` when there are no updates).
    pub fn last_stage(&self) -> i32 {
        self.num_updates() as i32 - 1
    }

    /// Looks up a stage by its signed index (`-1` for the pure definition).
    pub fn stage(&self, stage: i32) -> &Stage {
        &self.stages[(stage + 1) as usize]
    }

    pub fn values(&self) -> &[ExprId] {
        &self.stages[0].values
    }
}

/// Identifies one (function, stage) pair. Stage `-1` is the pure
/// definition; `0..k-1` are the sequential updates in program order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageKey {
    pub func: String,
    pub stage: i32,
}

impl StageKey {
    pub fn new(func: impl Into<String>, stage: i32) -> Self {
        StageKey {
            func: func.into(),
            stage,
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.func, self.stage)
    }
}

/// A raw input buffer: dense `f64` storage plus the minimum index of each
/// dimension. Extents are the data shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub name: String,
    pub ty: ScalarType,
    pub mins: Vec<i64>,
    pub data: ArrayD<f64>,
}

impl Buffer {
    pub fn dimensions(&self) -> usize {
        self.mins.len()
    }

    pub fn extent(&self, dim: usize) -> i64 {
        self.data.shape()[dim] as i64
    }

    /// Closed interval of valid indices along one dimension.
    pub fn interval(&self, dim: usize) -> (i64, i64) {
        (self.mins[dim], self.mins[dim] + self.extent(dim) - 1)
    }
}
