use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse saved server configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse server configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to write server configuration file: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Server configuration '{server}' is missing the required field '{field}'")]
    MissingField { server: String, field: &'static str },

    #[error("Invalid value '{value}' for server configuration field '{field}'")]
    InvalidField { field: &'static str, value: String },

    #[error("Could not determine the state directory for saved server configurations.\nSet XDG_STATE_HOME or HOME and try again.")]
    StateDirNotFound,
}

pub type Result<T> = std::result::Result<T, CoreError>;
