//! Download registry: the state machine owning every tracked download.
//!
//! Records are kept in insertion order and located by transfer identity. All
//! mutation happens through `&mut self`, so whoever owns the registry (see
//! [`super::DownloadManager`]) serializes every transition.
//!
//! ```text
//! add ----------------------------> Downloading
//! Downloading --pause--> Paused --resume--> Downloading
//! Failed --retry--> Downloading
//! Downloading --completed(ok)--> removed, Finished
//! Downloading --completed(cancelled)--> removed, Cancelled
//! Downloading --completed(error)--> Failed, transfer replaced
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, Result};
use super::events::{DownloadEvent, EventNotifier};
use super::progress::{ProgressReport, ProgressSample};
use super::record::{DownloadInfo, DownloadRecord, RequestStatus};
use crate::config::Config;
use crate::observability::Metrics;
use crate::transfer::{
    FacilityError, ResumeToken, ResumeTokenValidator, TaskDescription, TransferError,
    TransferErrorKind, TransferEvent, TransferFacility, TransferHandle, TransferState,
};

/// Filesystem and timing knobs of a registry
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Finished files are moved to `destination_dir/<file name>`
    pub destination_dir: PathBuf,
    /// Base directory for partial files named by resume tokens
    pub temp_dir: PathBuf,
    pub reconcile_timeout: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            destination_dir: config.downloads.destination_dir.clone(),
            temp_dir: config.session.temp_dir.clone(),
            reconcile_timeout: config.downloads.reconcile_timeout(),
        }
    }
}

type CompletionHandler = Box<dyn FnOnce() + Send>;

pub struct DownloadRegistry {
    facility: Arc<dyn TransferFacility>,
    notifier: Arc<dyn EventNotifier>,
    validator: ResumeTokenValidator,
    destination_dir: PathBuf,
    reconcile_timeout: Duration,
    records: Vec<DownloadRecord>,
    metrics: Arc<Metrics>,
    background_completion: Option<CompletionHandler>,
}

impl DownloadRegistry {
    pub fn new(
        facility: Arc<dyn TransferFacility>,
        notifier: Arc<dyn EventNotifier>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            facility,
            notifier,
            validator: ResumeTokenValidator::new(settings.temp_dir),
            destination_dir: settings.destination_dir,
            reconcile_timeout: settings.reconcile_timeout,
            records: Vec::new(),
            metrics: Arc::new(Metrics::new()),
            background_completion: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn records(&self) -> &[DownloadRecord] {
        &self.records
    }

    pub fn downloads(&self) -> Vec<DownloadInfo> {
        self.records.iter().map(DownloadRecord::info).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run `handler` once the facility reports that nothing is running
    pub fn set_background_completion(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.background_completion = Some(Box::new(handler));
    }

    /// Start downloading `url` into `file_name`; returns the new record's index
    pub fn add_download(&mut self, file_name: &str, url: &str) -> Result<usize> {
        if file_name.trim().is_empty() {
            return Err(DownloadError::InvalidRequest("file name is empty".to_string()));
        }
        if url.trim().is_empty() {
            return Err(DownloadError::InvalidRequest("URL is empty".to_string()));
        }

        let description = TaskDescription::new(url, file_name).encode()?;
        let handle = self.facility.create_transfer(url)?;
        // Must be durable before any byte moves
        handle.set_description(&description);
        handle.start()?;

        self.records.push(DownloadRecord::new(
            url,
            file_name,
            RequestStatus::Downloading,
            Some(handle),
        ));
        let index = self.records.len() - 1;

        info!(index, url, file_name, "Download started");
        self.emit_at(index, |download, index| DownloadEvent::Started { download, index });
        Ok(index)
    }

    pub fn pause(&mut self, index: usize) -> Result<()> {
        let record = self.record_mut(index)?;
        if record.status == RequestStatus::Paused {
            debug!(index, "Download already paused");
            return Ok(());
        }

        let Some(handle) = record.handle.as_ref() else {
            return Err(DownloadError::InvalidRequest(format!(
                "download {} has no transfer to pause",
                index
            )));
        };
        handle.suspend()?;
        record.status = RequestStatus::Paused;
        record.start_time = Instant::now();

        info!(index, file_name = %record.file_name, "Download paused");
        self.emit_at(index, |download, index| DownloadEvent::Paused { download, index });
        Ok(())
    }

    pub fn resume(&mut self, index: usize) -> Result<()> {
        if self.record(index)?.status == RequestStatus::Downloading {
            debug!(index, "Download already running");
            return Ok(());
        }

        let handle = self.ensure_handle(index)?;
        handle.resume()?;
        let record = self.record_mut(index)?;
        record.status = RequestStatus::Downloading;

        info!(index, file_name = %record.file_name, "Download resumed");
        self.emit_at(index, |download, index| DownloadEvent::Resumed { download, index });
        Ok(())
    }

    /// Restart a failed download with the transfer primed when it failed
    pub fn retry(&mut self, index: usize) -> Result<()> {
        if self.record(index)?.status == RequestStatus::Downloading {
            debug!(index, "Download already running");
            return Ok(());
        }

        let handle = self.ensure_handle(index)?;
        handle.resume()?;
        let record = self.record_mut(index)?;
        record.status = RequestStatus::Downloading;
        record.start_time = Instant::now();

        info!(index, file_name = %record.file_name, "Download retried");
        self.emit_at(index, |download, index| DownloadEvent::Retried { download, index });
        Ok(())
    }

    /// Request cancellation. The record goes away once the facility confirms.
    pub fn cancel(&mut self, index: usize) -> Result<()> {
        match self.record(index)?.handle.clone() {
            Some(handle) => {
                handle.cancel()?;
                debug!(index, transfer_id = %handle.id(), "Cancellation requested");
            }
            None => {
                // Nothing will ever confirm a transfer that does not exist
                let record = self.records.remove(index);
                info!(index, file_name = %record.file_name, "Download cancelled");
                self.emit(DownloadEvent::Cancelled {
                    download: record.info(),
                    index,
                });
            }
        }
        Ok(())
    }

    /// Rebuild records for transfers a previous process left behind.
    /// Returns how many records were appended.
    pub async fn reconcile_at_startup(&mut self) -> usize {
        let handles = match tokio::time::timeout(
            self.reconcile_timeout,
            self.facility.persisted_transfers(),
        )
        .await
        {
            Ok(handles) => handles,
            Err(_) => {
                warn!(
                    timeout_ms = self.reconcile_timeout.as_millis() as u64,
                    "Timed out enumerating persisted transfers; assuming none"
                );
                Vec::new()
            }
        };

        let mut appended = 0;
        for handle in handles {
            if self.position_of(&handle).is_some() {
                continue;
            }

            let description = match TaskDescription::from_slot(handle.description().as_deref()) {
                Ok(description) => description,
                Err(e) => {
                    warn!(transfer_id = %handle.id(), error = %e, "Dropping transfer with unreadable description");
                    cancel_quietly(&handle);
                    continue;
                }
            };

            let status = match handle.state() {
                TransferState::Running => RequestStatus::Downloading,
                TransferState::Suspended => RequestStatus::Paused,
                state => {
                    info!(transfer_id = %handle.id(), %state, url = %description.url, "Dropping transfer that cannot be continued");
                    cancel_quietly(&handle);
                    continue;
                }
            };

            debug!(transfer_id = %handle.id(), %status, file_name = %description.file_name, "Reconciled transfer");
            self.records.push(DownloadRecord::new(
                description.url,
                description.file_name,
                status,
                Some(handle),
            ));
            appended += 1;
        }

        info!(appended, total = self.records.len(), "Reconciled persisted transfers");
        self.emit(DownloadEvent::InterruptedTasksPopulated {
            downloads: self.downloads(),
        });
        appended
    }

    pub fn handle_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                handle,
                bytes_written,
                total_written,
                total_expected,
            } => self.handle_progress(&handle, bytes_written, total_written, total_expected),
            TransferEvent::FinishedToLocation { handle, location } => {
                self.handle_finished_to_location(&handle, &location)
            }
            TransferEvent::Completed { handle, error } => self.handle_completed(&handle, error),
            TransferEvent::AllEventsFlushed => self.handle_all_events_flushed(),
        }
    }

    pub fn handle_progress(
        &mut self,
        handle: &TransferHandle,
        bytes_written: u64,
        total_written: u64,
        total_expected: Option<u64>,
    ) {
        let Some(index) = self.position_of(handle) else {
            debug!(transfer_id = %handle.id(), "Progress for untracked transfer");
            return;
        };

        let record = &mut self.records[index];
        let report = ProgressReport::calculate(ProgressSample {
            total_written,
            total_expected,
            elapsed: record.start_time.elapsed(),
        });
        record.progress = report.fraction;
        record.detail_text = report.detail_text();

        debug!(index, bytes_written, total_written, ?total_expected, "Progress updated");
        self.emit_at(index, |download, index| DownloadEvent::ProgressUpdated { download, index });
    }

    /// Move a finished payload into the destination directory. A failed move
    /// is remembered on the record and reported when the transfer completes.
    pub fn handle_finished_to_location(&mut self, handle: &TransferHandle, location: &Path) {
        let index = self.position_of(handle);
        let file_name = match index {
            Some(index) => self.records[index].file_name.clone(),
            None => match TaskDescription::from_slot(handle.description().as_deref()) {
                Ok(description) => description.file_name,
                Err(e) => {
                    warn!(transfer_id = %handle.id(), error = %e, "Finished payload has no known destination");
                    return;
                }
            },
        };

        let destination = self.destination_dir.join(&file_name);
        match move_file(location, &destination) {
            Ok(()) => info!(
                file_name,
                destination = %destination.display(),
                "Moved finished download into place"
            ),
            Err(e) => {
                warn!(file_name, destination = %destination.display(), error = %e, "Failed to move finished download");
                if let Some(index) = index {
                    self.records[index].pending_move_error = Some(DownloadError::Move {
                        file_name,
                        source: Arc::new(e),
                    });
                }
            }
        }
    }

    pub fn handle_completed(&mut self, handle: &TransferHandle, error: Option<TransferError>) {
        if let Some(reason) = error.as_ref().and_then(TransferError::interrupt_reason) {
            info!(transfer_id = %handle.id(), ?reason, "Transfer lost to a session interruption");
            let token = error.and_then(|e| e.resume_token);
            self.recover_lost_record(handle, token);
            return;
        }

        let Some(index) = self.position_of(handle) else {
            debug!(transfer_id = %handle.id(), "Completion for untracked transfer");
            return;
        };

        match error {
            None => match self.records[index].pending_move_error.take() {
                Some(move_error) => self.fail_record(index, None, move_error),
                None => {
                    let record = self.records.remove(index);
                    info!(index, file_name = %record.file_name, "Download finished");
                    self.emit(DownloadEvent::Finished {
                        download: record.info(),
                        index,
                    });
                }
            },
            Some(e) if e.is_cancellation() => {
                let record = self.records.remove(index);
                info!(index, file_name = %record.file_name, "Download cancelled");
                self.emit(DownloadEvent::Cancelled {
                    download: record.info(),
                    index,
                });
            }
            Some(mut e) => {
                let token = e.resume_token.take();
                let error = match e.kind {
                    TransferErrorKind::Unknown => DownloadError::Unknown,
                    _ => DownloadError::Transfer(e),
                };
                self.fail_record(index, token, error);
            }
        }
    }

    pub fn handle_all_events_flushed(&mut self) {
        if let Some(handler) = self.background_completion.take() {
            handler();
        }
        debug!(tracked = self.records.len(), "All transfer events delivered");
    }

    /// Detach from the facility, leaving running transfers persisted
    pub async fn shutdown(&mut self) {
        let facility = self.facility.clone();
        facility.shutdown().await;
    }

    fn fail_record(&mut self, index: usize, token: Option<ResumeToken>, error: DownloadError) {
        self.records[index].resume_token = token;
        let replacement = self.prepare_replacement(index);

        let record = &mut self.records[index];
        record.handle = replacement;
        record.status = RequestStatus::Failed;
        record.pending_move_error = None;

        warn!(index, file_name = %record.file_name, error = %error, "Download failed");
        self.emit_at(index, |download, index| DownloadEvent::Failed {
            download,
            index,
            error,
        });
    }

    /// The process that tracked this transfer is gone; rebuild its record
    /// from the persisted description.
    fn recover_lost_record(&mut self, handle: &TransferHandle, token: Option<ResumeToken>) {
        let description = match TaskDescription::from_slot(handle.description().as_deref()) {
            Ok(description) => description,
            Err(e) => {
                warn!(transfer_id = %handle.id(), error = %e, "Cannot recover interrupted transfer");
                return;
            }
        };

        let mut record = DownloadRecord::new(
            description.url,
            description.file_name,
            RequestStatus::Failed,
            None,
        );
        record.resume_token = token;

        let index = match self.position_of(handle) {
            Some(index) => {
                self.records[index] = record;
                index
            }
            None => {
                self.records.push(record);
                self.records.len() - 1
            }
        };
        self.records[index].handle = self.prepare_replacement(index);

        info!(index, file_name = %self.records[index].file_name, "Recovered interrupted download");
        self.emit(DownloadEvent::InterruptedTasksPopulated {
            downloads: self.downloads(),
        });
    }

    /// Build the transfer a failed record continues with and carry the
    /// description over to it. Consumes the record's resume token.
    fn prepare_replacement(&mut self, index: usize) -> Option<TransferHandle> {
        let token = self.records[index].resume_token.take();
        let record = &self.records[index];

        match self.replacement_handle(&record.url, token.as_ref()) {
            Ok(replacement) => {
                match record.handle.as_ref().and_then(TransferHandle::description) {
                    Some(description) => replacement.set_description(&description),
                    None => attach_description(&replacement, &record.url, &record.file_name),
                }
                Some(replacement)
            }
            Err(e) => {
                error!(index, url = %record.url, error = %e, "Could not prepare a replacement transfer");
                None
            }
        }
    }

    /// Transfer continuing from `token` when its partial file is still there,
    /// otherwise a fresh one from `url`.
    fn replacement_handle(
        &self,
        url: &str,
        token: Option<&ResumeToken>,
    ) -> std::result::Result<TransferHandle, FacilityError> {
        match token {
            Some(token) if self.validator.is_valid(Some(token)) => {
                match self.facility.create_transfer_with_resume_token(token) {
                    Ok(handle) => {
                        debug!(url, transfer_id = %handle.id(), "Replacement resumes from token");
                        return Ok(handle);
                    }
                    Err(e) => warn!(url, error = %e, "Resume token rejected; restarting from URL"),
                }
            }
            Some(_) => warn!(url, "Discarding unusable resume token; restarting from URL"),
            None => {}
        }

        self.facility.create_transfer(url)
    }

    /// The record's transfer, building a fresh one if none could be prepared
    fn ensure_handle(&mut self, index: usize) -> Result<TransferHandle> {
        let record = self.record(index)?;
        if let Some(handle) = record.handle.clone() {
            return Ok(handle);
        }

        let (url, file_name) = (record.url.clone(), record.file_name.clone());
        let handle = self.facility.create_transfer(&url)?;
        attach_description(&handle, &url, &file_name);
        self.records[index].handle = Some(handle.clone());
        Ok(handle)
    }

    fn position_of(&self, handle: &TransferHandle) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.is_tracking(handle))
    }

    fn record(&self, index: usize) -> Result<&DownloadRecord> {
        let len = self.records.len();
        self.records
            .get(index)
            .ok_or(DownloadError::IndexOutOfRange { index, len })
    }

    fn record_mut(&mut self, index: usize) -> Result<&mut DownloadRecord> {
        let len = self.records.len();
        self.records
            .get_mut(index)
            .ok_or(DownloadError::IndexOutOfRange { index, len })
    }

    fn emit_at(&self, index: usize, event: impl FnOnce(DownloadInfo, usize) -> DownloadEvent) {
        self.emit(event(self.records[index].info(), index));
    }

    fn emit(&self, event: DownloadEvent) {
        self.metrics.record(&event);
        self.notifier.notify(event);
    }
}

fn attach_description(handle: &TransferHandle, url: &str, file_name: &str) {
    match TaskDescription::new(url, file_name).encode() {
        Ok(description) => handle.set_description(&description),
        Err(e) => warn!(url, error = %e, "Could not encode transfer description"),
    }
}

fn cancel_quietly(handle: &TransferHandle) {
    if let Err(e) = handle.cancel() {
        debug!(transfer_id = %handle.id(), error = %e, "Transfer already finished");
    }
}

/// Move `from` to `to`, never overwriting an existing file
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if to.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }

    match std::fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
        result => result,
    }
}
