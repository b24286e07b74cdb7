use molq_core::error::CoreError;
use molq_net::NetError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Job '{0}' is already being watched by this server")]
    DuplicateJob(String),

    #[error("Job '{0}' already has a request in flight")]
    BusyJob(String),

    #[error("Failed to connect to server '{name}': {source}")]
    ConnectionFailed {
        name: String,
        #[source]
        source: NetError,
    },

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
