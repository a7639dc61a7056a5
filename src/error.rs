//! Caller-error surface (§7 `CALLER_ERROR`).
//!
//! Everything else in the error taxonomy (`DOMAIN_INACTIVE`, `NO_SOURCE`,
//! `OUT_OF_BOUNDS`, `COLLAPSED`, `BUDGET`, `INTERNAL`,
//! `PARTIAL_FIELDS_UNKNOWN`) is carried in-band in `QueryMeta` — see
//! `domain::meta`. `CallerError` is reserved for the small set of operations
//! that genuinely fail outright: bad arguments, a full capsule array, an
//! absent capsule id.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerError {
    NullArgument(&'static str),
    ZeroSampleDim,
    InvalidTier,
    CapsuleArrayFull,
    CapsuleNotFound(u64),
}

impl fmt::Display for CallerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerError::NullArgument(name) => write!(f, "required argument '{name}' was not provided"),
            CallerError::ZeroSampleDim => write!(f, "sample_dim must be non-zero"),
            CallerError::InvalidTier => write!(f, "resolution tier is not valid for this operation"),
            CallerError::CapsuleArrayFull => write!(f, "capsule array is at capacity"),
            CallerError::CapsuleNotFound(id) => write!(f, "no capsule with id {id}"),
        }
    }
}

impl std::error::Error for CallerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_mention_the_field() {
        assert!(CallerError::CapsuleNotFound(7).to_string().contains('7'));
        assert!(CallerError::ZeroSampleDim.to_string().contains("sample_dim"));
    }
}
