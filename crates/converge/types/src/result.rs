//! Result of executing and verifying one action

use crate::decision::ActionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a terminal action after verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action: ActionKind,

    pub succeeded: bool,

    /// Ready replicas seen by the verifier
    pub final_ready_replicas: u32,

    /// Tail of the package-manager or workload output, if captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,

    /// Transient failures retried while executing
    pub retries_used: u32,

    /// The change was written but only takes effect on the next restart
    #[serde(default)]
    pub staged: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn duration_ms(&self) -> u64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_never_negative() {
        let started_at = Utc::now();
        let mut result = ExecutionResult {
            action: ActionKind::Upgrade,
            succeeded: true,
            final_ready_replicas: 1,
            log_excerpt: None,
            retries_used: 0,
            staged: false,
            started_at,
            completed_at: started_at + chrono::Duration::milliseconds(1500),
        };
        assert_eq!(result.duration_ms(), 1500);

        result.completed_at = started_at - chrono::Duration::seconds(1);
        assert_eq!(result.duration_ms(), 0);
    }
}
