use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error binding UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("bootstrapping failed: no bootstrap node answered")]
    BootstrapFailed,

    #[error("too many in-flight transactions")]
    TooManyTransactions,

    #[error("timeout waiting for response after {0:?}")]
    Timeout(Duration),

    #[error("query cancelled")]
    Cancelled,

    #[error("peer returned an error response: {code} {message}")]
    RemoteError { code: i64, message: String },

    #[error("malformed bencode: {0}")]
    MalformedBencode(#[from] bencode::DecodeError),

    #[error("malformed DHT message: {0}")]
    MalformedMessage(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("error sending datagram: {0}")]
    Send(#[source] std::io::Error),

    #[error("error receiving datagram: {0}")]
    Recv(#[source] std::io::Error),

    #[error("persistence I/O error: {0}")]
    PersistenceIo(#[source] std::io::Error),

    #[error("persisted snapshot is corrupt: {0}")]
    PersistenceCorrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
