pub mod connection;
pub mod error;
pub mod http;
pub mod local;
pub mod reply;
pub mod ssh;

pub use connection::{Connection, ConnectionStatus, Credentials};
pub use error::{NetError, Result};
pub use http::HttpConnection;
pub use local::LocalConnection;
pub use reply::{Reply, ReplyStatus};
pub use ssh::SshConnection;
