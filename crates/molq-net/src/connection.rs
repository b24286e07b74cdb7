use crate::error::Result;
use crate::reply::{Reply, ReplyStatus};
use molq_core::config::AuthMethod;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Success sentinel echoed by the shell helpers so a command's own output
/// cannot be mistaken for success.
pub const SUCCESS_TOKEN: &str = "MOLQ_OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Opened,
    Authenticated,
    Error,
}

/// Callback used to obtain a password, key passphrase or keyboard
/// interactive response from the user. Returning None cancels the attempt.
pub type CredentialPrompt = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub known_hosts: Option<PathBuf>,
    pub cookie: Option<String>,
    pub prompt: Option<CredentialPrompt>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key)
            .field("known_hosts", &self.known_hosts)
            .field("cookie", &self.cookie.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl Credentials {
    pub fn for_user(user: &str) -> Self {
        Self {
            user: user.to_string(),
            ..Self::default()
        }
    }
}

/// An authenticated transport channel to a local or remote execution
/// environment. Factory methods hand back Replies in the Waiting state;
/// the caller starts them and owns them until they reach a terminal state.
pub trait Connection: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn authenticate(&mut self, method: AuthMethod, credentials: &Credentials) -> Result<()>;

    fn status(&self) -> ConnectionStatus;
    fn hostname(&self) -> &str;
    fn set_timeout(&mut self, timeout: Duration);

    fn execute(&self, command: &str) -> Result<Reply>;
    fn put_file(&self, source: &Path, destination: &str) -> Result<Reply>;
    fn get_file(&self, source: &str, destination: &Path) -> Result<Reply>;
    fn get_files(&self, sources: &[String], destination_dir: &Path) -> Result<Reply>;

    /// The session token handed out by transports that authenticate with a
    /// server-side session (HTTP); persisted back into the configuration.
    fn session_cookie(&self) -> Option<String> {
        None
    }

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Authenticated
    }

    /// Synchronous convenience wrapper for short idempotent probes. Spins
    /// on the reply until it terminates.
    fn blocking_execute(&self, command: &str) -> Result<(bool, String)> {
        let reply = self.execute(command)?;
        reply.start();
        let status = reply.wait();
        Ok((status == ReplyStatus::Finished, reply.message()))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let command = format!("test -e {} && echo {}", path, SUCCESS_TOKEN);
        let (ok, message) = self.blocking_execute(&command)?;
        Ok(ok && message.contains(SUCCESS_TOKEN))
    }

    fn make_directory(&self, path: &str) -> Result<bool> {
        let command = format!("mkdir -p {} && echo {}", path, SUCCESS_TOKEN);
        let (ok, message) = self.blocking_execute(&command)?;
        Ok(ok && message.contains(SUCCESS_TOKEN))
    }

    fn remove_directory(&self, path: &str) -> Result<bool> {
        let command = format!("rm -fr {} && echo {}", path, SUCCESS_TOKEN);
        let (ok, message) = self.blocking_execute(&command)?;
        Ok(ok && message.contains(SUCCESS_TOKEN))
    }
}
