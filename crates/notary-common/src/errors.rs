use crate::types::RequestNumber;

#[derive(thiserror::Error, Debug)]
pub enum NotaryError {
    #[error("no transaction numbers available")]
    Exhausted,
    #[error("nymbox hash mismatch")]
    BoxMismatch,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("{stage} retries exhausted after {attempts} attempts")]
    RetriesExhausted { stage: &'static str, attempts: u32 },
    #[error("accounting invariant violated: {0}")]
    InvariantViolation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("stale request number {got}, last accepted {expected}")]
    StaleRequest {
        got: RequestNumber,
        expected: RequestNumber,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no session for notary: {0}")]
    UnknownSession(String),
}
