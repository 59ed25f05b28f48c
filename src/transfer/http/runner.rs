//! Fetch loop driving a single running transfer

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Shared;
use super::transfer::HttpTransfer;
use crate::transfer::facility::{TransferError, TransferEvent};
use crate::transfer::handle::{Transfer, TransferHandle, TransferState};

/// How a fetch stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Suspended,
    Cancelled,
    /// The session is shutting down; the transfer stays running on disk
    Detached,
}

pub(super) fn spawn(shared: &Arc<Shared>, transfer: Arc<HttpTransfer>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move { run(shared, transfer).await });
}

async fn run(shared: Arc<Shared>, transfer: Arc<HttpTransfer>) {
    let _guard = transfer.run_lock.lock().await;

    let mut state_rx = transfer.subscribe();
    let mut shutdown_rx = shared.shutdown_signal();
    if *shutdown_rx.borrow_and_update() {
        return;
    }

    match transfer.state() {
        TransferState::Running => {}
        TransferState::Canceling => {
            transfer.finish_cancelled(&shared);
            shared.flush_if_idle();
            return;
        }
        // Suspended again (or finished) before this runner got the partial file
        _ => return,
    }

    let handle = TransferHandle::new(transfer.clone());

    let outcome = fetch(&shared, &transfer, &handle, &mut state_rx, &mut shutdown_rx).await;

    // A cancel that lands after the last chunk still wins
    let outcome = match outcome {
        Ok(Outcome::Finished) if transfer.state().is_terminal() => Ok(Outcome::Cancelled),
        other => other,
    };

    match outcome {
        Ok(Outcome::Finished) => {
            transfer.set_state(TransferState::Completed);
            shared.forget(&transfer.id());
            info!(
                transfer_id = %transfer.id(),
                bytes = transfer.bytes_received(),
                "Transfer finished"
            );
            shared.emit(TransferEvent::FinishedToLocation {
                handle: handle.clone(),
                location: transfer.partial_path().to_path_buf(),
            });
            shared.emit(TransferEvent::Completed {
                handle,
                error: None,
            });
        }
        Ok(Outcome::Suspended) => {
            shared.persist(&transfer);
            debug!(transfer_id = %transfer.id(), "Transfer suspended");
        }
        Ok(Outcome::Cancelled) => transfer.finish_cancelled(&shared),
        Ok(Outcome::Detached) => {
            debug!(transfer_id = %transfer.id(), "Transfer detached for shutdown");
            return;
        }
        Err(error) => {
            let error = match transfer.resume_token() {
                Some(token) => error.with_resume_token(token),
                None => error,
            };
            warn!(transfer_id = %transfer.id(), error = %error, "Transfer failed");
            transfer.set_state(TransferState::Completed);
            shared.forget(&transfer.id());
            shared.emit(TransferEvent::Completed {
                handle,
                error: Some(error),
            });
        }
    }

    shared.flush_if_idle();
}

async fn fetch(
    shared: &Shared,
    transfer: &HttpTransfer,
    handle: &TransferHandle,
    state_rx: &mut watch::Receiver<TransferState>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Outcome, TransferError> {
    let offset = tokio::fs::metadata(transfer.partial_path())
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut request = shared.client().get(transfer.url());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", offset));
    }

    debug!(transfer_id = %transfer.id(), url = transfer.url(), offset, "Starting fetch");

    let mut response = tokio::select! {
        response = request.send() => response?,
        outcome = interrupted(state_rx, shutdown_rx) => return Ok(outcome),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::http(status.as_u16(), status.canonical_reason()));
    }

    // A server ignoring the range sends the whole body again
    let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    let start = if resuming { offset } else { 0 };
    transfer.set_received(start);
    transfer.set_expected(response.content_length().map(|len| len + start));
    shared.persist(transfer);

    let mut options = OpenOptions::new();
    if resuming {
        options.append(true);
    } else {
        options.create(true).write(true).truncate(true);
    }
    let mut file = options
        .open(transfer.partial_path())
        .await
        .map_err(TransferError::io)?;

    let interval = shared.progress_interval().max(1);
    let mut unreported = 0u64;

    let streamed: Result<Outcome, TransferError> = loop {
        tokio::select! {
            chunk = response.chunk() => match chunk {
                Ok(Some(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        break Err(TransferError::io(e));
                    }
                    let len = bytes.len() as u64;
                    let total = transfer.add_received(len);
                    unreported += len;
                    if unreported >= interval {
                        report_progress(shared, transfer, handle, unreported, total);
                        unreported = 0;
                    }
                }
                Ok(None) => break Ok(Outcome::Finished),
                Err(e) => break Err(TransferError::from(e)),
            },
            outcome = interrupted(state_rx, shutdown_rx) => break Ok(outcome),
        }
    };

    // Keep whatever arrived usable for a later resume
    if let Err(e) = file.flush().await {
        warn!(transfer_id = %transfer.id(), error = %e, "Failed to flush partial file");
    }

    if streamed == Ok(Outcome::Finished) {
        file.sync_all().await.map_err(TransferError::io)?;
        if unreported > 0 {
            report_progress(shared, transfer, handle, unreported, transfer.bytes_received());
        }
    }

    streamed
}

fn report_progress(
    shared: &Shared,
    transfer: &HttpTransfer,
    handle: &TransferHandle,
    bytes_written: u64,
    total_written: u64,
) {
    shared.emit(TransferEvent::Progress {
        handle: handle.clone(),
        bytes_written,
        total_written,
        total_expected: transfer.bytes_expected(),
    });
}

/// Resolves once the transfer is suspended, cancelled or the session shuts down
async fn interrupted(
    state_rx: &mut watch::Receiver<TransferState>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Outcome {
    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Outcome::Detached;
                }
                match *state_rx.borrow_and_update() {
                    TransferState::Idle | TransferState::Running => continue,
                    TransferState::Suspended => return Outcome::Suspended,
                    TransferState::Canceling | TransferState::Completed => {
                        return Outcome::Cancelled;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow_and_update() {
                    return Outcome::Detached;
                }
            }
        }
    }
}
