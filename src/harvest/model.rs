use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CANCELLED_MESSAGE: &str = "cancelled";
pub const INTERRUPTED_MESSAGE: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestStatus {
    Running,
    Success,
    Failed,
}

impl HarvestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestStatus::Running => "running",
            HarvestStatus::Success => "success",
            HarvestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for HarvestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(HarvestStatus::Running),
            "success" | "succeeded" => Ok(HarvestStatus::Success),
            "failed" | "failure" => Ok(HarvestStatus::Failed),
            other => Err(format!("unknown harvest status '{other}'")),
        }
    }
}

/// Operator overrides for a single run.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarvestOptions {
    /// Replaces the journal's last_harvested_at as the `from` window.
    pub from_date: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl HarvestSummary {
    pub fn harvested(&self) -> usize {
        self.created + self.updated
    }
}

/// Terminal state of one run, as returned by `run_journal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestReport {
    pub run_id: i32,
    pub journal_id: i32,
    pub journal_slug: String,
    pub status: HarvestStatus,
    pub record_count: usize,
    pub summary: HarvestSummary,
    pub error_message: String,
}
