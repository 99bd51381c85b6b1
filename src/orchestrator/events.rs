use serde::{Deserialize, Serialize};

use crate::session::ScanPhase;

/// Lifecycle notifications broadcast to dashboard collaborators.
///
/// Progress itself is not an event; collaborators read it from the
/// handle's watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    PhaseChanged { phase: ScanPhase },
    /// Fired on launch and again when a persisted scan is recovered
    Started { scan_id: String },
    /// Fired once per scan, on confirmed completion
    Completed { scan_id: String },
    Failed { scan_id: String, error: String },
    Stopped { scan_id: String },
    TimedOut { scan_id: String },
}
