//! Retry layer over [`gridxfer_transfer`].
//!
//! A [`PersistentTransfer`] moves one logical file as a sequence of attempts
//! against ranked candidate URLs, backing off exponentially between failures
//! and giving up only after a bounded total time. A
//! [`PersistentTransferSet`] owns them all together with the shared
//! [`TransferSet`](gridxfer_transfer::TransferSet) and is polled once per
//! tick by the client's main loop.

mod backoff;
mod config;
mod driver;
mod error;
mod persistent;
mod set;
mod status;

pub use backoff::Backoff;
pub use config::{RetryPolicy, XferConfig};
pub use driver::{AttemptProgress, TransferDriver};
pub use error::PersistError;
pub use persistent::{PersistState, PersistentTransfer};
pub use set::PersistentTransferSet;
pub use status::{LastError, StatusState, TransferStatus};
