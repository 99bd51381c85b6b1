use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of the orchestrator's scan session.
///
/// `Idle` is the resting phase. Initializing, Running and Stopping are active.
/// Completed, Failed, Stopped and TimedOut end a cycle and always funnel back
/// to `Idle`, either immediately or after a short grace delay.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Initializing,
    Running,
    Stopping,
    Completed,
    Failed,
    Stopped,
    TimedOut,
}

impl ScanPhase {
    pub fn full_name(&self) -> &'static str {
        match self {
            ScanPhase::Idle => "Idle",
            ScanPhase::Initializing => "Initializing",
            ScanPhase::Running => "Running",
            ScanPhase::Stopping => "Stopping",
            ScanPhase::Completed => "Completed",
            ScanPhase::Failed => "Failed",
            ScanPhase::Stopped => "Stopped",
            ScanPhase::TimedOut => "Timed Out",
        }
    }

    /// Returns true if this phase ends the current scan cycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanPhase::Completed | ScanPhase::Failed | ScanPhase::Stopped | ScanPhase::TimedOut
        )
    }

    /// Returns true while a scan job is being launched, tracked or stopped
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ScanPhase::Initializing | ScanPhase::Running | ScanPhase::Stopping
        )
    }
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// The orchestrator's working record.
///
/// Only the orchestrator mutates a session. Collaborators receive clones
/// through the handle's watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSession {
    pub target_url: String,
    pub scan_id: Option<String>, // None until the transport accepts the job
    pub phase: ScanPhase,
    pub progress_percent: u8,
    pub status_message: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    pub fn idle() -> Self {
        Self {
            target_url: String::new(),
            scan_id: None,
            phase: ScanPhase::Idle,
            progress_percent: 0,
            status_message: String::new(),
            started_at: None,
        }
    }

    /// The persistable subset of this session, if a job has been assigned
    pub fn to_record(&self) -> Option<PersistedScanRecord> {
        let scan_id = self.scan_id.clone()?;
        let started_at = self.started_at?;

        Some(PersistedScanRecord {
            target_url: self.target_url.clone(),
            phase: self.phase,
            progress_percent: self.progress_percent,
            status_message: self.status_message.clone(),
            scan_id,
            started_at,
        })
    }

    pub fn from_record(record: &PersistedScanRecord) -> Self {
        Self {
            target_url: record.target_url.clone(),
            scan_id: Some(record.scan_id.clone()),
            phase: record.phase,
            progress_percent: record.progress_percent,
            status_message: record.status_message.clone(),
            started_at: Some(record.started_at),
        }
    }
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::idle()
    }
}

/// The subset of a session written to the single persisted slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedScanRecord {
    pub target_url: String,
    pub phase: ScanPhase,
    pub progress_percent: u8,
    pub status_message: String,
    pub scan_id: String,
    pub started_at: DateTime<Utc>,
}

impl PersistedScanRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }

    /// A record from the future is treated as fresh
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.age(now).to_std() {
            Ok(age) => age > max_age,
            Err(_) => false,
        }
    }
}
