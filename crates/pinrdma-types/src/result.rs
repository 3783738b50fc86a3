use crate::status::Status;

/// Result type used at the session trigger boundary.
pub type Result<T> = std::result::Result<T, Status>;
