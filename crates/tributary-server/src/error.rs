use thiserror::Error;

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("no free port in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("pending change not found: {0}")]
    NotFound(String),
}
