//! Retry state machine for one logical file transfer.
//!
//! ```text
//!   Idle ──poll──▶ Attempting ──ok──▶ Succeeded
//!                   │     ▲  │
//!             error │     │  └──give-up time──┐
//!                   │     │ retry_at reached  ▼
//!                   ▼     │                 GaveUp
//!               WaitingToRetry ──give-up time──┘
//! ```
//!
//! The give-up clock starts at the first attempt and also ends a live
//! attempt, so a server trickling bytes cannot keep a transfer pending.
//!
//! `cancel` moves any non-terminal state to `GaveUp { Cancelled }`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gridxfer_transfer::{
    Body, Direction, ErrorKind, Target, TransferError, TransferId, TransferOutcome, TransferSpec,
    calculate_file_checksum, existing_len,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    AttemptProgress, LastError, PersistError, RetryPolicy, StatusState, TransferDriver,
    TransferStatus,
};

/// Where a logical transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistState {
    /// Created, no attempt yet.
    Idle,
    /// An attempt is live in the driver.
    Attempting { transfer: TransferId, started: Instant },
    /// Between attempts.
    WaitingToRetry { retry_at: Instant },
    Succeeded,
    GaveUp { reason: ErrorKind },
}

impl PersistState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PersistState::Succeeded | PersistState::GaveUp { .. })
    }
}

/// One logical file moved through a sequence of attempts against a list of
/// candidate URLs.
#[derive(Debug)]
pub struct PersistentTransfer {
    name: String,
    urls: Vec<Target>,
    direction: Direction,
    path: PathBuf,
    state: PersistState,
    policy: RetryPolicy,
    url_index: usize,
    num_retries: u32,
    attempts: u32,
    first_attempt: Option<Instant>,
    last_progress: Option<Instant>,
    last_error: Option<LastError>,
    expected_sha256: Option<String>,
    resumable: bool,
    start_offset: u64,
    expected_size: Option<u64>,
    position: u64,
    total: Option<u64>,
    speed: f64,
    eta: Option<Duration>,
}

impl PersistentTransfer {
    /// Fetches `name` into `dest` from the first URL that works.
    ///
    /// Downloads resume from an existing partial file by default.
    pub fn download<S: AsRef<str>>(
        name: impl Into<String>,
        urls: &[S],
        dest: impl Into<PathBuf>,
    ) -> Result<Self, PersistError> {
        let name = name.into();
        if urls.is_empty() {
            return Err(PersistError::NoUrls(name));
        }
        let urls = urls
            .iter()
            .map(|url| Target::parse(url.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(name, urls, Direction::Download, dest.into()))
    }

    /// Sends `src` to the canonical upload endpoint `url`.
    pub fn upload(
        name: impl Into<String>,
        url: &str,
        src: impl Into<PathBuf>,
    ) -> Result<Self, PersistError> {
        let target = Target::parse(url)?;
        Ok(Self::new(name.into(), vec![target], Direction::Upload, src.into()))
    }

    fn new(name: String, urls: Vec<Target>, direction: Direction, path: PathBuf) -> Self {
        Self {
            name,
            urls,
            direction,
            path,
            state: PersistState::Idle,
            policy: RetryPolicy::default(),
            url_index: 0,
            num_retries: 0,
            attempts: 0,
            first_attempt: None,
            last_progress: None,
            last_error: None,
            expected_sha256: None,
            resumable: direction == Direction::Download,
            start_offset: 0,
            expected_size: None,
            position: 0,
            total: None,
            speed: 0.0,
            eta: None,
        }
    }

    /// Verifies the finished download against a hex SHA-256 digest.
    pub fn with_checksum(mut self, sha256_hex: impl Into<String>) -> Self {
        self.expected_sha256 = Some(sha256_hex.into());
        self
    }

    /// Whether a download continues from the bytes already on disk.
    pub fn with_resume(mut self, resumable: bool) -> Self {
        self.resumable = resumable;
        self
    }

    /// First byte of the file an upload sends.
    pub fn with_start_offset(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self.position = offset;
        self
    }

    /// Size used for `fraction_done` before the server announces one.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> PersistState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_progress(&self) -> Option<Instant> {
        self.last_progress
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Advances the state machine. Never blocks.
    ///
    /// Returns `true` if the transfer reached a terminal state in this call.
    pub fn poll(&mut self, now: Instant, driver: &mut dyn TransferDriver) -> bool {
        match self.state {
            PersistState::Succeeded | PersistState::GaveUp { .. } => return false,
            PersistState::Idle => {
                self.first_attempt = Some(now);
                self.begin_attempt(now, driver);
            }
            PersistState::WaitingToRetry { retry_at } => {
                if self.give_up_due(now) {
                    self.give_up(now, ErrorKind::GiveUp);
                } else if now >= retry_at {
                    self.begin_attempt(now, driver);
                }
            }
            PersistState::Attempting { transfer, .. } => match driver.progress(transfer) {
                None => {
                    let lost = std::io::Error::other("transfer vanished from the driver");
                    self.attempt_failed(now, TransferError::Io(lost), 0);
                }
                Some(progress) if !progress.done => {
                    self.observe(progress);
                    if self.give_up_due(now) {
                        driver.abort(transfer);
                        self.give_up(now, ErrorKind::GiveUp);
                    }
                }
                Some(progress) => {
                    self.observe(progress);
                    match driver.finish(transfer) {
                        Some(outcome) => self.attempt_finished(now, outcome),
                        None => {
                            let lost = std::io::Error::other("finished transfer had no outcome");
                            self.attempt_failed(now, TransferError::Io(lost), 0);
                        }
                    }
                }
            },
        }
        self.is_terminal()
    }

    /// Aborts any live attempt and gives up. Idempotent; a finished transfer
    /// is left untouched.
    pub fn cancel(&mut self, driver: &mut dyn TransferDriver) {
        match self.state {
            PersistState::Succeeded | PersistState::GaveUp { .. } => return,
            PersistState::Attempting { transfer, .. } => driver.abort(transfer),
            PersistState::Idle | PersistState::WaitingToRetry { .. } => {}
        }
        self.give_up(Instant::now(), ErrorKind::Cancelled);
    }

    /// Earliest instant at which polling can change the state.
    ///
    /// A live attempt is otherwise driven by socket readiness, so only its
    /// give-up instant is reported. `None` once terminal.
    pub fn wake_at(&self, now: Instant) -> Option<Instant> {
        match self.state {
            PersistState::Idle => Some(now),
            PersistState::Attempting { .. } => self.give_up_at(),
            PersistState::WaitingToRetry { retry_at } => Some(match self.give_up_at() {
                Some(give_up_at) => retry_at.min(give_up_at),
                None => retry_at,
            }),
            _ => None,
        }
    }

    pub fn status(&self, now: Instant) -> TransferStatus {
        let state = match self.state {
            PersistState::Succeeded => StatusState::Succeeded,
            PersistState::GaveUp { reason } => StatusState::GaveUp { code: reason },
            _ => StatusState::Pending,
        };
        let total = self.total.or(self.expected_size);
        let fraction_done = match (self.state, total) {
            (PersistState::Succeeded, _) => 1.0,
            (_, Some(total)) if total > 0 => (self.position as f64 / total as f64).min(1.0),
            _ => 0.0,
        };
        let next_retry_secs = match self.state {
            PersistState::WaitingToRetry { retry_at } => {
                Some(retry_at.saturating_duration_since(now).as_secs_f64())
            }
            _ => None,
        };
        let (speed, eta_secs) = match self.state {
            PersistState::Attempting { .. } => {
                (self.speed, self.eta.map(|eta| eta.as_secs_f64()))
            }
            _ => (0.0, None),
        };
        TransferStatus {
            name: self.name.clone(),
            direction: self.direction,
            state,
            fraction_done,
            bytes_done: self.position,
            total_bytes: total,
            speed,
            eta_secs,
            attempts: self.attempts,
            num_retries: self.num_retries,
            next_retry_secs,
            last_error: self.last_error.clone(),
        }
    }

    fn current_target(&self) -> &Target {
        match self.direction {
            Direction::Upload => &self.urls[0],
            Direction::Download => &self.urls[self.url_index % self.urls.len()],
        }
    }

    fn begin_attempt(&mut self, now: Instant, driver: &mut dyn TransferDriver) {
        let target = self.current_target().clone();
        let offset = match self.direction {
            Direction::Download if self.resumable => existing_len(&self.path),
            Direction::Download => 0,
            Direction::Upload => self.start_offset,
        };
        let body = Body::File {
            path: self.path.clone(),
            offset,
        };
        let spec = match self.direction {
            Direction::Download => TransferSpec::download(target, body),
            Direction::Upload => TransferSpec::upload(target, body),
        }
        .with_block_size(self.policy.block_size)
        .with_timeouts(self.policy.connect_timeout, self.policy.idle_timeout);

        self.attempts += 1;
        self.position = offset;
        self.speed = 0.0;
        self.eta = None;
        debug!(
            name = %self.name,
            url = %self.current_target(),
            attempt = self.attempts,
            offset,
            "starting attempt"
        );
        match driver.start(spec, now) {
            Ok(transfer) => {
                self.state = PersistState::Attempting {
                    transfer,
                    started: now,
                };
            }
            Err(err) => self.attempt_failed(now, err, 0),
        }
    }

    fn observe(&mut self, progress: AttemptProgress) {
        self.position = progress.position;
        self.speed = progress.speed;
        self.eta = progress.eta;
        if progress.total.is_some() {
            self.total = progress.total;
        }
    }

    fn attempt_finished(&mut self, now: Instant, outcome: TransferOutcome) {
        self.position = outcome.position;
        if let Err(err) = outcome.result {
            self.attempt_failed(now, err, outcome.bytes_transferred);
            return;
        }
        if let Err(err) = self.verify_checksum() {
            self.attempt_failed(now, err, 0);
            return;
        }
        self.total = Some(self.position);
        self.last_progress = Some(now);
        self.state = PersistState::Succeeded;
        info!(
            name = %self.name,
            direction = %self.direction,
            url = %self.current_target(),
            bytes = self.position,
            attempts = self.attempts,
            "transfer succeeded"
        );
    }

    fn verify_checksum(&mut self) -> Result<(), TransferError> {
        let (Direction::Download, Some(expected)) = (self.direction, &self.expected_sha256) else {
            return Ok(());
        };
        let actual = calculate_file_checksum(&self.path)?;
        if actual.eq_ignore_ascii_case(expected) {
            return Ok(());
        }
        warn!(name = %self.name, %expected, %actual, "checksum mismatch, discarding download");
        if let Err(e) = std::fs::File::create(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to truncate corrupt download");
        }
        self.position = 0;
        Err(TransferError::ChecksumMismatch)
    }

    fn attempt_failed(&mut self, now: Instant, err: TransferError, moved: u64) {
        let kind = err.kind();
        let url = self.current_target().to_string();
        warn!(name = %self.name, %url, error = %err, moved, "attempt failed");
        self.last_error = Some(LastError {
            kind,
            message: err.to_string(),
            url,
        });

        if moved > 0 {
            self.num_retries = 0;
            self.last_progress = Some(now);
        }
        self.num_retries += match kind {
            ErrorKind::Timeout => 2,
            _ => 1,
        };
        if self.direction == Direction::Download {
            self.url_index = (self.url_index + 1) % self.urls.len();
        }

        if self.give_up_due(now) {
            self.give_up(now, ErrorKind::GiveUp);
            return;
        }
        let delay = self.policy.backoff.delay_for_attempt(self.num_retries);
        debug!(name = %self.name, delay_secs = delay.as_secs_f64(), "waiting to retry");
        self.state = PersistState::WaitingToRetry {
            retry_at: now + delay,
        };
    }

    fn give_up_at(&self) -> Option<Instant> {
        self.first_attempt
            .map(|first| first + self.policy.give_up_after)
    }

    fn give_up_due(&self, now: Instant) -> bool {
        self.give_up_at().is_some_and(|at| now >= at)
    }

    fn give_up(&mut self, now: Instant, reason: ErrorKind) {
        let elapsed = match self.first_attempt {
            Some(first) => now.saturating_duration_since(first),
            None => Duration::ZERO,
        };
        info!(
            name = %self.name,
            %reason,
            attempts = self.attempts,
            elapsed_secs = elapsed.as_secs(),
            "giving up on transfer"
        );
        self.state = PersistState::GaveUp { reason };
    }
}
