use gridxfer_transfer::{Direction, ErrorKind};
use serde::Serialize;

/// Coarse outcome of a logical transfer as seen by its requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatusState {
    Pending,
    Succeeded,
    GaveUp { code: ErrorKind },
}

/// Most recent attempt failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub url: String,
}

/// Plain-data status of one logical transfer, re-read by callers every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub name: String,
    pub direction: Direction,
    pub state: StatusState,
    pub fraction_done: f64,
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    /// Current attempt throughput in bytes per second.
    pub speed: f64,
    /// Estimated seconds until the current attempt completes.
    pub eta_secs: Option<f64>,
    /// Attempts started so far.
    pub attempts: u32,
    /// Consecutive failures driving the backoff.
    pub num_retries: u32,
    /// Seconds until the next attempt, while waiting to retry.
    pub next_retry_secs: Option<f64>,
    pub last_error: Option<LastError>,
}

impl TransferStatus {
    pub fn is_pending(&self) -> bool {
        self.state == StatusState::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_with_code() {
        let json = serde_json::to_value(StatusState::GaveUp {
            code: ErrorKind::GiveUp,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"state": "gave_up", "code": {"kind": "give_up"}})
        );

        let pending = serde_json::to_value(StatusState::Pending).unwrap();
        assert_eq!(pending, serde_json::json!({"state": "pending"}));
    }
}
