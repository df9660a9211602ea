//! Error types for context capture and wrapping.

use thiserror::Error;

/// Errors raised while constructing context-aware wrappers.
///
/// Manager misbehavior at capture, activation, or close time is never
/// surfaced as an error; it is logged and contained so one manager cannot
/// break the others. Only construction-time configuration problems reach
/// the caller.
#[derive(Error, Debug)]
pub enum ContextError {
    /// Neither a snapshot nor a snapshot supplier was provided.
    #[error("no context snapshot provided")]
    MissingSnapshot,
}
