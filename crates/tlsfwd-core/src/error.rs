use thiserror::Error;

/// Errors produced by the relay.
///
/// Per-session variants (`Connect`, `Upgrade`, `Io`) are contained by the
/// lifecycle manager; startup variants (`Bind`, `InvalidMode`, `Config`,
/// `Tls`) abort the process before the event loop runs.
#[derive(Debug, Error)]
pub enum FwdError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport upgrade failed: {0}")]
    Upgrade(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid mode '{0}' (expected 'start-tls' or 'recv-tls')")]
    InvalidMode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type FwdResult<T> = Result<T, FwdError>;
