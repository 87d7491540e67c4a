use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("invalid transaction id")]
    InvalidTransactionId,

    #[error("query timed out")]
    Timeout,

    #[error("bootstrap failed")]
    BootstrapFailed,
}
