use thiserror::Error;

use kestrel_net::NetError;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("transfer aborted by caller")]
    Aborted,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("receive buffer too small")]
    BufferTooSmall,

    #[error("session not idle; reset() before starting another transfer")]
    NotIdle,

    #[error("network error: {0}")]
    Net(NetError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NetError> for TftpError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout => TftpError::Timeout,
            NetError::Aborted => TftpError::Aborted,
            NetError::BufferTooSmall { .. } => TftpError::BufferTooSmall,
            other => TftpError::Net(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
