use gridxfer_transfer::TransferError;

/// Errors raised when requesting a logical transfer.
///
/// Failures of individual attempts never surface here; they are retried
/// and only reported through the transfer's status.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("a transfer named {0:?} already exists")]
    Duplicate(String),

    #[error("no candidate URLs for {0:?}")]
    NoUrls(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}
