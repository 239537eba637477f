//! Main loop: drives the requested transfer until it finishes, gives up or
//! is interrupted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gridxfer_persist::{PersistentTransfer, PersistentTransferSet, StatusState, TransferStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// What the user asked for on the command line.
#[derive(Debug, Clone)]
pub enum Job {
    Get {
        output: PathBuf,
        sha256: Option<String>,
        resume: bool,
        urls: Vec<String>,
    },
    Put {
        file: PathBuf,
        url: String,
        offset: u64,
    },
}

impl Job {
    fn into_transfer(self, config: &Config) -> anyhow::Result<PersistentTransfer> {
        let policy = config.transfer.retry_policy();
        let transfer = match self {
            Job::Get {
                output,
                sha256,
                resume,
                urls,
            } => {
                let name = logical_name(&output);
                let mut transfer = PersistentTransfer::download(name, &urls, output)?
                    .with_resume(resume)
                    .with_policy(policy);
                if let Some(digest) = sha256 {
                    transfer = transfer.with_checksum(digest);
                }
                transfer
            }
            Job::Put { file, url, offset } => {
                let size = std::fs::metadata(&file)
                    .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", file.display()))?
                    .len();
                if offset > size {
                    anyhow::bail!("offset {offset} is past the end of {} ({size} bytes)", file.display());
                }
                let name = logical_name(&file);
                PersistentTransfer::upload(name, &url, file)?
                    .with_start_offset(offset)
                    .with_expected_size(size)
                    .with_policy(policy)
            }
        };
        Ok(transfer)
    }
}

fn logical_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Runs `job` to completion and prints the final status as JSON on stdout.
pub async fn run(config: Config, job: Job) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, cancelling transfers");
            interrupt.cancel();
        }
    });

    let mut set = PersistentTransferSet::new(config.transfer.clone());
    set.insert(job.into_transfer(&config)?)?;

    let tick = Duration::from_millis(config.tick_ms.max(1));
    let report_every = Duration::from_secs(config.status_interval_secs.max(1));
    let mut next_report = Instant::now() + report_every;

    while !set.is_idle() {
        let finished = tokio::select! {
            _ = cancel.cancelled() => None,
            finished = set.poll(Instant::now() + tick) => Some(finished),
        };
        match finished {
            None => {
                for status in set.statuses() {
                    set.cancel(&status.name);
                }
                break;
            }
            Some(true) => tracing::debug!("a transfer reached a final state"),
            Some(false) => {}
        }

        if Instant::now() >= next_report {
            next_report += report_every;
            report_progress(&mut set);
        }
    }

    let statuses = set.statuses();
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    let failed = statuses
        .iter()
        .filter(|status| status.state != StatusState::Succeeded)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} transfer(s) did not complete");
    }
    Ok(())
}

fn report_progress(set: &mut PersistentTransferSet) {
    let (upload_active, download_active) = set.check_active();
    let (bytes_up, bytes_down) = set.bytes_moved();
    tracing::debug!(upload_active, download_active, bytes_up, bytes_down, "activity");

    for status in set.statuses().iter().filter(|status| status.is_pending()) {
        log_status(status);
    }
}

fn log_status(status: &TransferStatus) {
    match status.next_retry_secs {
        Some(wait) => tracing::info!(
            name = %status.name,
            attempts = status.attempts,
            retry_in_secs = format_args!("{wait:.0}"),
            last_error = ?status.last_error.as_ref().map(|e| &e.message),
            "waiting to retry"
        ),
        None => tracing::info!(
            name = %status.name,
            direction = %status.direction,
            done = format_args!("{:.1}%", status.fraction_done * 100.0),
            bytes = status.bytes_done,
            speed_bps = format_args!("{:.0}", status.speed),
            eta_secs = ?status.eta_secs.map(|secs| secs.round()),
            "in progress"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_name_is_file_name() {
        assert_eq!(logical_name(Path::new("/data/wu_12/input.dat")), "input.dat");
        assert_eq!(logical_name(Path::new("result")), "result");
    }

    #[test]
    fn get_job_builds_download() {
        let job = Job::Get {
            output: PathBuf::from("/tmp/out/input.dat"),
            sha256: None,
            resume: false,
            urls: vec!["http://a.example.org/input.dat".into()],
        };
        let transfer = job.into_transfer(&Config::default()).unwrap();
        assert_eq!(transfer.name(), "input.dat");
        assert_eq!(transfer.direction(), gridxfer_transfer::Direction::Download);
    }

    #[test]
    fn put_job_rejects_offset_past_end() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("result");
        std::fs::write(&file, b"1234").unwrap();

        let job = Job::Put {
            file: file.clone(),
            url: "http://a.example.org/upload".into(),
            offset: 5,
        };
        assert!(job.into_transfer(&Config::default()).is_err());

        let job = Job::Put {
            file,
            url: "http://a.example.org/upload".into(),
            offset: 2,
        };
        let transfer = job.into_transfer(&Config::default()).unwrap();
        let status = transfer.status(Instant::now());
        assert_eq!(status.bytes_done, 2);
        assert_eq!(status.total_bytes, Some(4));
    }

    #[test]
    fn https_is_rejected_up_front() {
        let job = Job::Get {
            output: PathBuf::from("/tmp/x"),
            sha256: None,
            resume: true,
            urls: vec!["https://secure.example.org/x".into()],
        };
        assert!(job.into_transfer(&Config::default()).is_err());
    }
}
