use thiserror::Error;

/// Errors from group operations. All variants are recoverable at the caller;
/// the engine state is untouched when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AoiError {
    #[error("an element with this key already exists")]
    KeyExists,
    #[error("no element with this key")]
    KeyNotFound,
}
