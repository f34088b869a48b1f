use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory allocation error")]
    Memory,

    #[error("Workgroup not available")]
    NotAvailable,

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::Memory => -2,
            Error::NotAvailable => -3,
            Error::Mapping(_) => -4,
            Error::Config(_) => -5,
        }
    }

    /// Conditions the caller is expected to retry rather than report.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotAvailable)
    }
}
