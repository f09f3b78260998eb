//! Error types for the differentiation passes.

use thiserror::Error;

/// Errors surfaced by the reverse and forward accumulation engines.
///
/// Every fatal condition aborts the whole pass: callers either receive a
/// complete stage-keyed adjoint mapping or an error, never a partially
/// populated one.
#[derive(Debug, Error)]
pub enum DerivativeError {
    /// A call has no derivative rule (unknown external function, or an
    /// intrinsic the forward engine cannot handle).
    #[error("the derivative of `{0}` is not implemented")]
    UnsupportedDerivative(String),

    /// A call is none of {external, intrinsic, stored-function, buffer}.
    #[error("unknown call type of operation `{0}`")]
    InvalidCallType(String),

    /// A buffer shares its name with a function, so their derivative
    /// accumulators would collide.
    #[error("naming conflict between buffer and function `{0}`")]
    NamingConflict(String),

    /// Seed or bounds dimensionality disagrees with the output function.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// A root, seed or buffer name is absent from the module.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
}

pub type Result<T> = std::result::Result<T, DerivativeError>;
