use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadPortsRange(String),
    DirectoryDoesNotExist(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadPortsRange(e) => write!(f, "Port range error: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Errors raised while applying a single router event. These are always
/// logged and dropped by the ingest processor, never propagated upward.
#[derive(Debug)]
pub enum IngestError {
    DecodeFailed(String),
    MissingField(&'static str),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::DecodeFailed(e) => write!(f, "Event decode failed: {}", e),
            IngestError::MissingField(e) => write!(f, "Event payload missing field: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, PartialEq, Eq)]
pub enum QueryError {
    NotFound,
    BadRequest(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::NotFound => write!(f, "Record not found"),
            QueryError::BadRequest(e) => write!(f, "Bad request: {}", e),
        }
    }
}

impl std::error::Error for QueryError {}

#[derive(Debug)]
pub enum ControllerError {
    Config(ConfigError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Config(e) => write!(f, "Configuration error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::Config(err)
    }
}
