use thiserror::Error;

/// Failures reported by a [`crate::store::DocumentStore`], either from a
/// request or through a subscription.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document `{0}` does not exist")]
    NotFound(String),

    #[error("permission denied for `{0}`")]
    PermissionDenied(String),

    #[error("write to `{path}` rejected: {reason}")]
    Rejected { path: String, reason: String },

    #[error("document `{path}` is malformed")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Errors that mean "this document is gone for us" rather than a transient fault.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::PermissionDenied(_) | StoreError::Malformed { .. }
        )
    }
}

/// Caller contract violations. These are returned as errors rather than
/// folded into soft results so misuse surfaces immediately.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HabitError {
    #[error("habit `{0}` is not loaded")]
    UnknownHabit(String),

    #[error("day {day_of_year} is out of range for year {year}")]
    InvalidDate { year: i32, day_of_year: u32 },

    #[error("weekday index {0} is out of range (0..=6)")]
    InvalidWeekday(u8),

    #[error("habit `{0}` is not archived")]
    NotArchived(String),

    #[error("no week is in view")]
    NoWeekInView,
}
