//! Error types for document and allocator operations.

use crate::position::Position;

/// Something the caller referred to is not in the document.
///
/// Always recoverable: concurrent deletes of the same character are an
/// expected race, so callers treat this as a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    /// The position to delete is absent.
    Position(Position),
    /// The position to insert after is absent (deleted concurrently).
    Anchor(Position),
}

/// Errors raised by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    NotFound(NotFound),
    /// The ordering guarantee no longer holds (comparator disagreement,
    /// counter overflow). The owning room must be discarded.
    InvariantViolation(String),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }

    /// Whether this error must fault the room that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::InvariantViolation(_))
    }
}

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFound::Position(p) => write!(f, "Position not found: {p}"),
            NotFound::Anchor(p) => write!(f, "Anchor position not found: {p}"),
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::NotFound(e) => write!(f, "{e}"),
            CoreError::InvariantViolation(e) => write!(f, "Invariant violation: {e}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<NotFound> for CoreError {
    fn from(e: NotFound) -> Self {
        CoreError::NotFound(e)
    }
}
