//! Typed errors for the two boundaries embedders need to `match` on.
//!
//! Everything else inside the orchestration modules uses `anyhow::Result`
//! with `.context(...)` annotations; these two enums exist because the CLI,
//! a future HTTP surface, and tests need to distinguish failure kinds rather
//! than parse a message string.

use std::path::PathBuf;

use thiserror::Error;

/// Errors loading or validating `docsd.toml` (plus environment overrides).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment override {var}={value}: {reason}")]
    InvalidEnvOverride {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid queue size: {0} (must be greater than zero)")]
    InvalidQueueSize(usize),

    #[error("invalid concurrent builds: {0} (must be greater than zero)")]
    InvalidConcurrentBuilds(usize),

    #[error("no repositories configured and no forges configured for discovery")]
    NoRepositories,
}

/// Errors verifying an inbound webhook payload's signature.
///
/// Distinguishes a missing/malformed signature header from a mismatched
/// HMAC so the HTTP layer (out of scope for this core) can return the
/// right status code (400 vs 401) without string-matching an error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("malformed signature header: expected `sha256=<hex>`, got `{0}`")]
    MalformedSignature(String),

    #[error("signature does not match payload")]
    SignatureMismatch,

    #[error("no secret configured for forge `{0}`")]
    NoSecretConfigured(String),
}
