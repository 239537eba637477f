use std::collections::BTreeMap;
use std::path::PathBuf;

use gridxfer_transfer::TransferSet;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{PersistError, PersistentTransfer, TransferStatus, XferConfig};

/// Every logical transfer of the process plus the transport they share.
///
/// This is the only entry point the rest of the client uses: it requests
/// transfers, polls once per tick, and reads plain-data status back.
pub struct PersistentTransferSet {
    transfers: TransferSet,
    pending: BTreeMap<String, PersistentTransfer>,
    config: XferConfig,
}

impl PersistentTransferSet {
    pub fn new(config: XferConfig) -> Self {
        Self {
            transfers: TransferSet::new(config.max_bytes_sec_up, config.max_bytes_sec_down),
            pending: BTreeMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &XferConfig {
        &self.config
    }

    /// Adds a logical transfer. Names must be unique.
    pub fn insert(&mut self, transfer: PersistentTransfer) -> Result<(), PersistError> {
        let name = transfer.name().to_string();
        if self.pending.contains_key(&name) {
            return Err(PersistError::Duplicate(name));
        }
        info!(
            %name,
            direction = %transfer.direction(),
            path = %transfer.path().display(),
            "transfer requested"
        );
        self.pending.insert(name, transfer);
        Ok(())
    }

    /// Cancels and drops a logical transfer.
    pub fn remove(&mut self, name: &str) -> Option<PersistentTransfer> {
        let mut transfer = self.pending.remove(name)?;
        transfer.cancel(&mut self.transfers);
        Some(transfer)
    }

    /// Requests a download of `name` into `dest` using the configured policy.
    pub fn request_download<S: AsRef<str>>(
        &mut self,
        urls: &[S],
        dest: impl Into<PathBuf>,
        name: &str,
    ) -> Result<(), PersistError> {
        let transfer = PersistentTransfer::download(name, urls, dest)?
            .with_policy(self.config.retry_policy());
        self.insert(transfer)
    }

    /// Requests an upload of `src` to `url` using the configured policy.
    pub fn request_upload(
        &mut self,
        url: &str,
        src: impl Into<PathBuf>,
        name: &str,
    ) -> Result<(), PersistError> {
        let transfer =
            PersistentTransfer::upload(name, url, src)?.with_policy(self.config.retry_policy());
        self.insert(transfer)
    }

    /// Cancels `name`, closing any live connection. Repeated calls are
    /// harmless. Returns `false` if the name is unknown.
    pub fn cancel(&mut self, name: &str) -> bool {
        let Some(transfer) = self.pending.get_mut(name) else {
            return false;
        };
        transfer.cancel(&mut self.transfers);
        true
    }

    pub fn get(&self, name: &str) -> Option<&PersistentTransfer> {
        self.pending.get(name)
    }

    pub fn status(&self, name: &str) -> Option<TransferStatus> {
        let now = Instant::now();
        self.pending.get(name).map(|transfer| transfer.status(now))
    }

    /// Status of every logical transfer, ordered by name.
    pub fn statuses(&self) -> Vec<TransferStatus> {
        let now = Instant::now();
        self.pending
            .values()
            .map(|transfer| transfer.status(now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` when every logical transfer has finished or given up.
    pub fn is_idle(&self) -> bool {
        self.pending.values().all(PersistentTransfer::is_terminal)
    }

    pub fn set_bandwidth_limits(&mut self, max_bytes_sec_up: u64, max_bytes_sec_down: u64) {
        debug!(max_bytes_sec_up, max_bytes_sec_down, "bandwidth limits changed");
        self.config.max_bytes_sec_up = max_bytes_sec_up;
        self.config.max_bytes_sec_down = max_bytes_sec_down;
        self.transfers
            .set_limits(max_bytes_sec_up, max_bytes_sec_down);
    }

    /// Returns and clears the `(upload, download)` activity flags.
    pub fn check_active(&mut self) -> (bool, bool) {
        self.transfers.check_active()
    }

    /// Lifetime socket bytes as `(up, down)`.
    pub fn bytes_moved(&self) -> (u64, u64) {
        (self.transfers.bytes_up(), self.transfers.bytes_down())
    }

    /// Earliest retry or give-up instant among waiting transfers.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|transfer| transfer.wake_at(now))
            .min()
    }

    /// Runs one tick: a single readiness wait shared by every live attempt
    /// (cut short by the earliest pending retry), then one state-machine step
    /// per logical transfer.
    ///
    /// Returns `true` if any logical transfer finished or gave up.
    pub async fn poll(&mut self, deadline: Instant) -> bool {
        let deadline = match self.next_wakeup(Instant::now()) {
            Some(wake) => deadline.min(wake),
            None => deadline,
        };
        self.transfers.poll(deadline).await;

        let now = Instant::now();
        let mut finished = false;
        for transfer in self.pending.values_mut() {
            finished |= transfer.poll(now, &mut self.transfers);
        }
        finished
    }
}
