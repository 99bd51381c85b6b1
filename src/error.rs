use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::session::ScanPhase;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    /// The scan service answered with a non-2xx status
    #[error("Scan service error ({status}): {body}")]
    ServiceError { status: u16, body: String },

    #[error("Invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("A scan is already in progress (phase: {phase})")]
    ScanInProgress { phase: ScanPhase },

    #[error("No scan is currently running")]
    NoActiveScan,

    #[error("Scan orchestrator is not running")]
    OrchestratorStopped,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
