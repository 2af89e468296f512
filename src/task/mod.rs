pub mod history;
pub mod model;
pub mod status;
pub mod store;

/// Validation failures reported straight back to the caller. Nothing is
/// persisted when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Please enter a title.")]
    EmptyTitle,
    #[error("invalid deadline: {0}")]
    InvalidDeadline(String),
}
