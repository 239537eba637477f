use std::time::Duration;

use gridxfer_transfer::{TransferError, TransferId, TransferOutcome, TransferSet, TransferSpec};
use tokio::time::Instant;

/// Snapshot of a live attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptProgress {
    /// Body bytes moved by this attempt.
    pub bytes_transferred: u64,
    /// Absolute body position, resume offset included.
    pub position: u64,
    /// Full body size, once known.
    pub total: Option<u64>,
    /// Recent throughput in bytes per second.
    pub speed: f64,
    /// Estimated time to finish at the current speed.
    pub eta: Option<Duration>,
    /// No more I/O will happen; the outcome can be collected.
    pub done: bool,
}

/// Transport used by a persistent transfer to run its attempts.
///
/// [`TransferSet`] is the production implementation.
pub trait TransferDriver {
    /// Opens and connects a new transfer.
    fn start(&mut self, spec: TransferSpec, now: Instant) -> Result<TransferId, TransferError>;

    /// Returns `None` if the transfer is unknown.
    fn progress(&self, id: TransferId) -> Option<AttemptProgress>;

    /// Removes a finished transfer and returns its outcome.
    ///
    /// Returns `None` while the transfer is still running or if it is unknown.
    fn finish(&mut self, id: TransferId) -> Option<TransferOutcome>;

    /// Closes and removes a transfer. Unknown ids are ignored.
    fn abort(&mut self, id: TransferId);
}

impl TransferDriver for TransferSet {
    fn start(&mut self, spec: TransferSpec, now: Instant) -> Result<TransferId, TransferError> {
        TransferSet::start(self, spec, now)
    }

    fn progress(&self, id: TransferId) -> Option<AttemptProgress> {
        let transfer = self.get(id)?;
        Some(AttemptProgress {
            bytes_transferred: transfer.bytes_transferred(),
            position: transfer.position(),
            total: transfer.body_total(),
            speed: transfer.transfer_speed(),
            eta: transfer.eta(),
            done: transfer.is_done(),
        })
    }

    fn finish(&mut self, id: TransferId) -> Option<TransferOutcome> {
        if !self.get(id)?.is_done() {
            return None;
        }
        self.remove(id).map(|transfer| transfer.into_outcome())
    }

    fn abort(&mut self, id: TransferId) {
        if let Some(mut transfer) = self.remove(id) {
            transfer.close();
        }
    }
}
