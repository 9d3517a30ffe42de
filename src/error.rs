use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading credentials
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid credential file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Credential field '{0}' is missing or blank")]
    MissingField(&'static str),
    #[error("Could not determine the user config directory")]
    NoConfigDir,
}

/// Errors reported by the remote directory and import services
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authentication rejected")]
    Unauthorized,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Server returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Read of {requested} bytes exceeds server limit of {max}")]
    ReadLimit { requested: u64, max: u64 },
    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for resolve, upload and retrieval operations
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Local file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Remote service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Import of {} produced no images", .file.display())]
    EmptyImport { file: PathBuf },
    #[error("Invalid shared link '{0}'")]
    InvalidLink(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;
