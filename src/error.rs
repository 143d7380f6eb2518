//! Custom error types for Pincer
//!
//! Provides structured error handling with context propagation
//! and user-friendly error messages.

use thiserror::Error;

/// Main error type for Pincer operations
#[derive(Error, Debug)]
pub enum PincerError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Proxy lifecycle errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Certificate authority errors
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Origin transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Intercept resolution errors
    #[error("Intercept error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Attack validation errors
    #[error("Attack error: {0}")]
    Validation(#[from] ValidationError),

    /// Rule errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// Proxy server errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to start proxy on {addr}: {reason}")]
    StartError { addr: String, reason: String },

    #[error("Invalid proxy request: {0}")]
    InvalidRequest(String),

    #[error("Proxy already running")]
    AlreadyRunning,

    #[error("Proxy not running")]
    NotRunning,
}

/// Certificate authority errors
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Root certificate has not been generated")]
    RootMissing,

    #[error("Failed to generate certificate for {host}: {reason}")]
    Generation { host: String, reason: String },

    #[error("Certificate storage error at {path}: {reason}")]
    Storage { path: String, reason: String },

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Failed to build TLS configuration: {0}")]
    TlsConfig(String),
}

/// Errors talking to the origin server
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("TLS handshake with {target} failed: {reason}")]
    Tls { target: String, reason: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Malformed response from origin: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors decoding bytes off the wire
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Incomplete frame: need {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Frame payload too large: {0} bytes")]
    PayloadTooLarge(u64),

    #[error("Unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Corrupt {encoding} body: {reason}")]
    CorruptBody { encoding: String, reason: String },
}

/// Match & replace rule errors
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid regex in rule {id}: {reason}")]
    InvalidRegex { id: String, reason: String },

    #[error("Rule not found: {0}")]
    NotFound(String),
}

/// Intercept queue integrity errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("No pending item with id {0}")]
    NotPending(u64),

    #[error("Item {0} is not awaiting a response decision")]
    NotMarked(u64),
}

/// Attack configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Attack requires a base request")]
    MissingTemplate,

    #[error("Attack requires at least one payload position")]
    NoPositions,

    #[error("Attack requires at least one non-empty payload set")]
    NoPayloads,

    #[error("Position {index} ({start}..{end}) is out of range for {location}")]
    PositionOutOfRange {
        index: usize,
        start: usize,
        end: usize,
        location: String,
    },

    #[error("Positions {first} and {second} overlap in {location}")]
    OverlappingPositions {
        first: usize,
        second: usize,
        location: String,
    },

    #[error("Attack not found: {0}")]
    UnknownAttack(String),
}

impl PincerError {
    /// Create an error with additional context
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PincerError::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PincerError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            PincerError::Proxy(e) => format!("Proxy issue: {}", e.user_hint()),
            PincerError::Certificate(e) => format!("Certificate issue: {}", e.user_hint()),
            PincerError::Transport(e) => format!("Network issue: {}", e.user_hint()),
            PincerError::Integrity(e) => format!("Intercept issue: {}", e),
            PincerError::Validation(e) => format!("Attack setup issue: {}", e),
            PincerError::Rule(e) => format!("Rule issue: {}", e),
            PincerError::Io(e) => format!("File system issue: {}", e),
            PincerError::WithContext { context, source } => {
                format!("{}: {}", context, source)
            }
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl UserHint for ProxyError {
    fn user_hint(&self) -> String {
        match self {
            ProxyError::StartError { addr, .. } => {
                format!("Could not start proxy on {}. The port may already be in use.", addr)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for CertificateError {
    fn user_hint(&self) -> String {
        match self {
            CertificateError::RootMissing => {
                "No root CA exists yet. Start the proxy or regenerate the CA first.".into()
            }
            CertificateError::Storage { path, .. } => {
                format!("Could not read or write CA material at '{}'. Check permissions.", path)
            }
            CertificateError::Generation { host, .. } => {
                format!("Could not create certificate for '{}'. Check CA configuration.", host)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for TransportError {
    fn user_hint(&self) -> String {
        match self {
            TransportError::Connect { target, .. } => {
                format!("Could not connect to {}. Check if it's running and accessible.", target)
            }
            TransportError::Timeout(ms) => {
                format!("Request timed out after {}ms. The server may be slow or unresponsive.", ms)
            }
            TransportError::InvalidUrl(url) => {
                format!("'{}' is not a valid URL. Check the format.", url)
            }
            _ => self.to_string(),
        }
    }
}

/// Extension trait for adding context to Result types
pub trait ResultExt<T, E> {
    fn with_context<C>(self, context: C) -> Result<T, PincerError>
    where
        C: Into<String>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<C>(self, context: C) -> Result<T, PincerError>
    where
        C: Into<String>,
    {
        self.map_err(|e| PincerError::with_context(context, e))
    }
}
