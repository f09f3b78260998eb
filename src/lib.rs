//! Lyre: automatic differentiation over a functional array IR.
//!
//! Computations are named [`Function`]s over integer index spaces: one pure
//! definition plus zero or more sequential update (overwrite) stages,
//! optionally driven by implicit finite index sets ([`RDom`]s). Lyre
//! differentiates such pipelines symbolically, in both directions:
//!
//! - **Reverse mode** ([`propagate_adjoints`]): given an output and a seed
//!   adjoint, produce one derivative-accumulator function per
//!   (function, stage) pair, handling shared sub-expressions, implicit
//!   sums, and multi-stage overwrites.
//! - **Forward mode** ([`propagate_tangents`]): rewrite the whole pipeline
//!   into its directional derivative, driven by a tangent table.
//!
//! # Architecture
//!
//! - **expr / func / module**: the expression arena, stages, reduction
//!   domains and buffers
//! - **simplify / substitute / traversal / bounds / boundary**: the
//!   collaborators the engines lean on
//! - **reverse**: adjoint propagation, index canonicalization, scattering
//!   and reduction-domain merging
//! - **forward**: tangent propagation
//! - **interp**: a reference interpreter for observing results
//!
//! # Example
//!
//! ```
//! use lyre::{propagate_adjoints_scalar, Module};
//!
//! let mut m = Module::new();
//! let x = m.var("x");
//! let b = m.read_buffer("input", vec![x]);
//! let e = m.call_extern("exp", vec![b], lyre::ScalarType::F32);
//! m.define("out", &["x"], vec![e]);
//!
//! let d = propagate_adjoints_scalar(&m, "out").unwrap();
//! assert!(d.adjoint_name("input", -1).is_some());
//! ```

pub mod boundary;
pub mod bounds;
pub mod error;
pub mod expr;
pub mod forward;
pub mod func;
pub mod interp;
pub mod module;
pub mod reverse;
pub mod simplify;
pub mod substitute;
pub mod traversal;

pub use bounds::{infer_bounds, BoundsBox, Interval};
pub use error::{DerivativeError, Result};
pub use expr::{BinOp, CallKind, CmpOp, Const, ExprId, ExprKind, ScalarType};
pub use forward::{propagate_tangent, propagate_tangents, LexicalScope, Tangents};
pub use func::{Buffer, Function, RDom, RDomId, RVar, Stage, StageKey};
pub use interp::Realizer;
pub use module::Module;
pub use reverse::{
    propagate_adjoints, propagate_adjoints_buffer, propagate_adjoints_scalar, Derivative,
};
