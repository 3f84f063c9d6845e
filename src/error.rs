use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction aborted: reader {0} exceeded its lifetime")]
    TransactionAborted(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DecentError {
    /// Corruption errors mark the database read-only until restart.
    pub fn is_corruption(&self) -> bool {
        matches!(self, DecentError::Corruption(_))
    }
}

pub type Result<T> = std::result::Result<T, DecentError>;
