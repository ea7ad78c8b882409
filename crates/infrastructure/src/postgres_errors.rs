use leasehold_core::AppError;

/// SQLSTATE classes and codes that clear up on retry: connection exceptions,
/// serialization failures, deadlocks and administrator shutdowns.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03")
}

/// Maps a sqlx failure of `operation` to `StoreUnavailable` when retrying may
/// help and to `Internal` otherwise.
pub(crate) fn store_error(error: sqlx::Error, operation: &str) -> AppError {
    let transient = match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(database_error) => database_error
            .code()
            .as_deref()
            .is_some_and(is_transient_sqlstate),
        _ => false,
    };

    if transient {
        AppError::StoreUnavailable(format!("failed to {operation}: {error}"))
    } else {
        AppError::Internal(format!("failed to {operation}: {error}"))
    }
}
