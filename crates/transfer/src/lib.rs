//! Non-blocking socket/file transfers with shared bandwidth ceilings.
//!
//! A [`Transfer`] moves one HTTP/1.0 body over one TCP connection and never
//! blocks. A [`TransferSet`] owns every live transfer, performs the single
//! readiness wait of each tick and apportions the per-second upload and
//! download quota among the transfers that are ready.

mod body;
mod checksum;
mod error;
mod http;
mod quota;
mod set;
mod speed;
mod transfer;

pub use body::{Body, existing_len};
pub use checksum::{calculate_file_checksum, checksum_bytes};
pub use error::{ErrorKind, TransferError};
pub use crate::http::Target;
pub use quota::BandwidthQuota;
pub use set::{TransferId, TransferSet};
pub use speed::SpeedCalculator;
pub use transfer::{ConnectionState, Transfer, TransferOutcome, TransferSpec};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-call block size: 16 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Default budget for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget without any byte movement before a transfer times out.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Direction of a transfer, or of the socket I/O currently wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local file to server.
    Upload,
    /// Server to local file.
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}
