use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Occurs when the configuration cannot be resolved into a usable set of options.
    #[error("{0}")]
    Config(#[from] ConfigError),
    /// Occurs when an operation requires a connection to the server that was never established.
    #[error("client is not configured to communicate with the server")]
    ClientNotConfigured,
    /// Occurs when a result is captured before any test case is declared.
    #[error("no test case is declared in the current execution context")]
    NoActiveCase,
    /// Occurs when an array or counter key is reused with an incompatible value.
    #[error("key \"{key}\" is already associated with a value that is not {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Occurs when the server reports that the requested version no longer accepts submissions.
    #[error("version \"{version}\" of suite \"{suite}\" is already sealed")]
    RemoteOptionsSealed { suite: String, version: String },
    #[error("failed to submit test results: {0}")]
    PostFailed(String),
    #[error("no workflow is registered")]
    WorkflowRegistrationMissing,
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("failed to communicate with the server: {0}")]
    Transport(String),
    #[error("malformed binary data: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reasons a configuration is rejected before anything runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("failed to parse config file {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("config file {0:?} is missing the top-level \"touca\" field")]
    MissingTopLevelKey(PathBuf),
    #[error("missing required option \"{0}\"")]
    MissingOption(&'static str),
    #[error("option \"{key}\" is expected to be {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("options \"team\", \"suite\" and \"version\" must all be present or all be absent")]
    IncompleteSlugs,
    #[error("no test case is specified for workflow \"{0}\"")]
    NoTestcases(String),
}
