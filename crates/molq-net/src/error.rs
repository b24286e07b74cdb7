use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Host lookup failed for '{0}'")]
    HostLookup(String),

    #[error("Connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {0} timed out")]
    ConnectionTimeout(String),

    #[error("Failed to establish a valid SSH session with {host}: {message}")]
    Handshake { host: String, message: String },

    #[error("Host key for '{0}' was not found in the known hosts file.\nConnect to the host once with ssh to record its key, then try again.")]
    HostKeyNotFound(String),

    #[error("Host key for '{0}' does not match the known hosts entry.\nThe server may have been reinstalled, or the connection may be intercepted.")]
    HostKeyMismatch(String),

    #[error("Host key check for '{host}' failed: {message}")]
    HostKeyCheckFailed { host: String, message: String },

    #[error("Failed to find SSH identity file: {0}")]
    IdentityFileNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authentication cancelled")]
    AuthenticationCancelled,

    #[error("{method} authentication is not supported by the server.\nSupported methods: {advertised}")]
    MethodNotSupported { method: String, advertised: String },

    #[error("Connection is not authenticated. Call open() and authenticate() before issuing requests.")]
    NotConnected,

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
