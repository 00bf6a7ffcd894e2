// src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("XDG directory error: {0}")]
    XdgError(#[from] xdg::BaseDirectoriesError),

    #[error("TOML deserialization error: {0}")]
    TomlDeserializationError(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerializationError(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid regular expression: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Process not running")]
    ProcessNotRunning,

    #[error("Process already exited")]
    ProcessAlreadyExited,

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Stdin pipe unavailable")]
    StdinUnavailable,

    #[error("Sudo unavailable for privilege escalation")]
    SudoUnavailable,

    #[error("User '{0}' is not registered")]
    UserNotRegistered(String),

    #[error("User '{0}' is already registered")]
    UserAlreadyRegistered(String),

    #[error("Failed to provision OS user: {0}")]
    UserProvisioningFailed(String),

    #[error("Write to a closed sink")]
    ClosedSink,

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Unknown command type: {0}")]
    UnknownCommandType(String),

    #[error("{0}")]
    Lifecycle(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

impl From<anyhow::Error> for SupervisorError {
    fn from(err: anyhow::Error) -> Self {
        SupervisorError::PersistenceError(format!("{err}"))
    }
}
