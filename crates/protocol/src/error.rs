/// Errors produced while building or decoding protocol values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
