//! Centralized error types and handling

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main application error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Network backend error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network backend errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Bad user input: names, subnets, options, setup requests.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("unable to find network with name or ID {0}: network not found")]
    NoSuchNetwork(String),

    #[error("more than one result for network ID {0}")]
    Ambiguous(String),

    /// Name, bridge or subnet already taken.
    #[error("{0}")]
    Conflict(String),

    #[error("default network {0} cannot be removed")]
    DefaultNetworkRemoval(String),

    #[error("netavark (exit code {code}): {message}")]
    Netavark { code: i32, message: String },

    #[error("plugin type={plugin} failed (code {code}): {message}{}", details_suffix(.details))]
    CniPlugin {
        plugin: String,
        code: u32,
        message: String,
        details: String,
    },

    #[error("failed to execute {binary}: {source}")]
    Exec {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} did not finish within {timeout:?}")]
    Timeout { binary: String, timeout: Duration },

    #[error("config file {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<NetworkError>,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<NetworkError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetworkError {
    /// Wrap the error with the operation or object it happened on.
    pub fn context(self, context: impl Into<String>) -> Self {
        NetworkError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers.
    pub fn root(&self) -> &NetworkError {
        match self {
            NetworkError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

fn details_suffix(details: &str) -> String {
    if details.is_empty() {
        String::new()
    } else {
        format!(" ({})", details)
    }
}

fn join_errors(errors: &[NetworkError]) -> String {
    match errors.len() {
        0 => "no errors".to_string(),
        1 => errors[0].to_string(),
        n => {
            let list: Vec<String> = errors.iter().map(|e| format!("* {}", e)).collect();
            format!("{} errors occurred:\n\t{}", n, list.join("\n\t"))
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
