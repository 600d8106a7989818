use thiserror::Error;

/// Errors surfaced at the store/command boundary. Low-level modules keep
/// returning `String` messages; they are wrapped here as `Remote` or
/// `Storage`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DashboardError {
    #[error("{0}")]
    Validation(String),

    /// Deliberately the same for unknown accounts and wrong passwords.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Insufficient stock for {product}: {available} available, {requested} requested")]
    InsufficientStock {
        product: String,
        available: i64,
        requested: u32,
    },

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Local storage failed: {0}")]
    Storage(String),
}

pub type DashboardResult<T> = Result<T, DashboardError>;
