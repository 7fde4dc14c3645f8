//! Defines the custom error types for the feed-sweep collector.

use std::io;
use thiserror::Error;
use url::ParseError as UrlParseError;

/// The primary error type for a collection run.
#[derive(Error, Debug)]
pub(crate) enum AppError {
    /// A deployment precondition is missing or a setting is unusable
    /// (missing ledger file, no node id in the output path, no seed date).
    #[error("Configuration Error: {0}")]
    Config(String),

    /// Historical batch data cannot anchor a query window.
    #[error("Data Integrity Error: {0}")]
    DataIntegrity(String),

    /// A single feed item could not be turned into a record.
    #[error("Extraction Failure: {0}")]
    Extraction(String),

    /// The browser surface failed to answer a command.
    #[error("Browser Error: {0}")]
    Browser(String),

    /// The run was stopped by an external interrupt signal.
    #[error("Run interrupted by signal")]
    Interrupted,

    /// Error related to file input/output operations.
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    /// Error reading or writing a batch table.
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),

    /// Error during JSON serialization or deserialization.
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error parsing a URL.
    #[error("URL Parsing Error: {0}")]
    UrlParse(#[from] UrlParseError),

    /// Error talking to the DevTools HTTP endpoint.
    #[cfg(feature = "browser")]
    #[error("HTTP Request Error: {0}")]
    Request(#[from] reqwest::Error),

    /// Error during SMTP communication with the notification relay.
    #[error("SMTP Error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Error assembling a notification message.
    #[error("Email Build Error: {0}")]
    EmailBuild(#[from] lettre::error::Error),

    /// A configured sender or recipient is not a valid mailbox.
    #[error("Email Address Error: {0}")]
    EmailAddress(#[from] lettre::address::AddressError),

    /// An underlying error that doesn't fit other categories, using anyhow.
    #[error("Generic Error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl AppError {
    /// Configuration and integrity failures happen before collection starts
    /// and are never followed by a flush.
    pub(crate) fn is_precondition(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::DataIntegrity(_))
    }
}

pub(crate) type Result<T> = std::result::Result<T, AppError>;
