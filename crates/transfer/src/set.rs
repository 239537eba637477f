//! Multiplexer driving every live transfer under shared bandwidth ceilings.

use std::collections::HashMap;
use std::future::Future;

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{BandwidthQuota, Direction, Transfer, TransferError, TransferSpec};

/// Opaque handle of a transfer inside a [`TransferSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    /// Builds a handle from a raw value, for drivers other than [`TransferSet`].
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xfer-{}", self.0)
    }
}

/// Owns all open transfers and the per-second bandwidth quota.
pub struct TransferSet {
    transfers: HashMap<TransferId, Transfer>,
    next_id: u64,
    quota: BandwidthQuota,
    bytes_up: u64,
    bytes_down: u64,
    upload_active: bool,
    download_active: bool,
}

impl TransferSet {
    /// Creates an empty set with the given ceilings in bytes/s (0 = unlimited).
    pub fn new(max_bytes_sec_up: u64, max_bytes_sec_down: u64) -> Self {
        Self {
            transfers: HashMap::new(),
            next_id: 1,
            quota: BandwidthQuota::new(max_bytes_sec_up, max_bytes_sec_down),
            bytes_up: 0,
            bytes_down: 0,
            upload_active: false,
            download_active: false,
        }
    }

    /// Adds a transfer and returns its handle.
    pub fn insert(&mut self, transfer: Transfer) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.transfers.insert(id, transfer);
        id
    }

    /// Removes a transfer. Removing an unknown handle is a no-op.
    pub fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        self.transfers.remove(&id)
    }

    /// Opens, connects and inserts a transfer.
    ///
    /// A failed connect is returned directly; nothing is inserted.
    pub fn start(&mut self, spec: TransferSpec, now: Instant) -> Result<TransferId, TransferError> {
        let mut transfer = Transfer::open(spec);
        transfer.connect(now)?;
        let target = transfer.target().to_string();
        let id = self.insert(transfer);
        debug!(%id, %target, "transfer started");
        Ok(id)
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Reconfigures the ceilings (e.g. after a preference change).
    pub fn set_limits(&mut self, max_bytes_sec_up: u64, max_bytes_sec_down: u64) {
        self.quota.set_limits(max_bytes_sec_up, max_bytes_sec_down);
    }

    pub fn limits(&self) -> (u64, u64) {
        self.quota.limits()
    }

    /// Lifetime bytes written to sockets.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Lifetime bytes read from sockets.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    /// Returns and clears the `(upload, download)` activity flags.
    pub fn check_active(&mut self) -> (bool, bool) {
        let flags = (self.upload_active, self.download_active);
        self.upload_active = false;
        self.download_active = false;
        flags
    }

    /// Runs one tick: waits until `deadline` or until any socket is ready,
    /// moves at most one block per ready transfer within the quota, then
    /// sweeps for timeouts.
    ///
    /// This is the only place the transfer layer suspends. Returns `true`
    /// if any bytes moved.
    pub async fn poll(&mut self, deadline: Instant) -> bool {
        self.quota.refresh(Instant::now());

        let ready = {
            let mut waits = FuturesUnordered::new();
            let mut throttled = false;
            for (&id, transfer) in &self.transfers {
                let (Some(stream), Some(interest)) = (transfer.stream(), transfer.interest())
                else {
                    continue;
                };
                if let Some(direction) = transfer.io_direction()
                    && self.quota.is_exhausted(direction)
                {
                    throttled = true;
                    continue;
                }
                waits.push(async move {
                    let _ = stream.ready(interest).await;
                    id
                });
            }
            let mut deadline = deadline;
            if throttled && let Some(next) = self.quota.next_window() {
                deadline = deadline.min(next);
            }
            wait_ready(waits, deadline).await
        };

        let now = Instant::now();
        self.quota.refresh(now);

        let mut moved_any = false;
        for id in ready {
            let Some(transfer) = self.transfers.get_mut(&id) else {
                continue;
            };
            let direction = transfer.io_direction();
            let grant = match direction {
                Some(direction) => self.quota.grant(direction, transfer.block_size()),
                None => transfer.block_size(),
            };
            if grant == 0 {
                continue;
            }
            match transfer.do_transfer(now, grant) {
                Ok(0) => {}
                Ok(moved) => {
                    let Some(direction) = direction else {
                        continue;
                    };
                    let moved = moved as u64;
                    self.quota.debit(direction, moved);
                    match direction {
                        Direction::Upload => {
                            self.bytes_up += moved;
                            self.upload_active = true;
                        }
                        Direction::Download => {
                            self.bytes_down += moved;
                            self.download_active = true;
                        }
                    }
                    trace!(%id, moved, %direction, "moved bytes");
                    moved_any = true;
                }
                Err(err) => {
                    warn!(%id, target_url = %transfer.target(), error = %err, "transfer error");
                    transfer.fail(err);
                }
            }
        }

        for (id, transfer) in &mut self.transfers {
            if transfer.is_done() {
                continue;
            }
            let quiesce = transfer
                .io_direction()
                .is_some_and(|direction| self.quota.is_exhausted(direction));
            if transfer.check_timeout(now, quiesce) {
                warn!(%id, target_url = %transfer.target(), "transfer timed out");
            }
        }

        moved_any
    }
}

/// Waits for the first ready transfer, then collects every other transfer
/// that is already ready, in the order they report.
async fn wait_ready<F>(mut waits: FuturesUnordered<F>, deadline: Instant) -> Vec<TransferId>
where
    F: Future<Output = TransferId>,
{
    if waits.is_empty() {
        tokio::time::sleep_until(deadline).await;
        return Vec::new();
    }

    let mut ready = Vec::new();
    if let Ok(Some(id)) = tokio::time::timeout_at(deadline, waits.next()).await {
        ready.push(id);
        while let Some(Some(id)) = waits.next().now_or_never() {
            ready.push(id);
        }
    }
    ready
}
