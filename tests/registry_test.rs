use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use fetchlane::registry::{
    DownloadError, DownloadEvent, DownloadManager, DownloadRegistry, EventNotifier,
    RegistrySettings, RequestStatus,
};
use fetchlane::transfer::{
    FacilityError, HandleError, InterruptReason, ResumeInfo, ResumeToken, TaskDescription,
    Transfer, TransferError, TransferErrorKind, TransferEvent, TransferFacility, TransferHandle,
    TransferId, TransferState,
};

#[derive(Debug, Clone, PartialEq)]
enum Origin {
    Url(String),
    Token(ResumeToken),
}

#[derive(Debug)]
struct MockTransfer {
    id: TransferId,
    origin: Origin,
    state: Mutex<TransferState>,
    description: Mutex<Option<String>>,
    received: AtomicU64,
}

impl MockTransfer {
    fn new(origin: Origin) -> Self {
        Self {
            id: TransferId::new(),
            origin,
            state: Mutex::new(TransferState::Idle),
            description: Mutex::new(None),
            received: AtomicU64::new(0),
        }
    }

    fn with_state(state: TransferState, description: Option<&str>) -> Arc<Self> {
        let transfer = Self::new(Origin::Url("https://x/persisted".to_string()));
        *transfer.state.lock().unwrap() = state;
        *transfer.description.lock().unwrap() = description.map(str::to_string);
        Arc::new(transfer)
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock().unwrap() = state;
    }
}

impl Transfer for MockTransfer {
    fn id(&self) -> TransferId {
        self.id
    }

    fn state(&self) -> TransferState {
        *self.state.lock().unwrap()
    }

    fn resume(&self) {
        self.set_state(TransferState::Running);
    }

    fn suspend(&self) {
        self.set_state(TransferState::Suspended);
    }

    fn cancel(&self) {
        self.set_state(TransferState::Canceling);
    }

    fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    fn bytes_expected(&self) -> Option<u64> {
        None
    }

    fn description(&self) -> Option<String> {
        self.description.lock().unwrap().clone()
    }

    fn set_description(&self, description: &str) {
        *self.description.lock().unwrap() = Some(description.to_string());
    }
}

#[derive(Default)]
struct MockFacility {
    created: Mutex<Vec<Arc<MockTransfer>>>,
    persisted: Mutex<Vec<Arc<MockTransfer>>>,
    enumerate_delay: Option<Duration>,
    fail_create: AtomicBool,
    shut_down: AtomicBool,
}

impl MockFacility {
    fn transfer(&self, id: TransferId) -> Arc<MockTransfer> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .chain(self.persisted.lock().unwrap().iter())
            .find(|transfer| transfer.id == id)
            .cloned()
            .unwrap()
    }

    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn create(&self, origin: Origin) -> Result<TransferHandle, FacilityError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(FacilityError::Client("facility unavailable".to_string()));
        }
        let transfer = Arc::new(MockTransfer::new(origin));
        self.created.lock().unwrap().push(transfer.clone());
        Ok(TransferHandle::new(transfer))
    }
}

#[async_trait]
impl TransferFacility for MockFacility {
    fn create_transfer(&self, url: &str) -> Result<TransferHandle, FacilityError> {
        self.create(Origin::Url(url.to_string()))
    }

    fn create_transfer_with_resume_token(
        &self,
        token: &ResumeToken,
    ) -> Result<TransferHandle, FacilityError> {
        self.create(Origin::Token(token.clone()))
    }

    async fn persisted_transfers(&self) -> Vec<TransferHandle> {
        if let Some(delay) = self.enumerate_delay {
            tokio::time::sleep(delay).await;
        }
        self.persisted
            .lock()
            .unwrap()
            .iter()
            .map(|transfer| TransferHandle::new(transfer.clone()))
            .collect()
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<DownloadEvent>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<DownloadEvent> {
        self.events.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(DownloadEvent::kind).collect()
    }
}

impl EventNotifier for RecordingNotifier {
    fn notify(&self, event: DownloadEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Harness {
    facility: Arc<MockFacility>,
    notifier: Arc<RecordingNotifier>,
    registry: DownloadRegistry,
    temp_dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_facility(MockFacility::default())
    }

    fn with_facility(facility: MockFacility) -> Self {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("partial")).unwrap();

        let facility = Arc::new(facility);
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = DownloadRegistry::new(
            facility.clone(),
            notifier.clone(),
            RegistrySettings {
                destination_dir: temp_dir.path().join("dest"),
                temp_dir: temp_dir.path().join("partial"),
                reconcile_timeout: Duration::from_millis(50),
            },
        );

        Self {
            facility,
            notifier,
            registry,
            temp_dir,
        }
    }

    fn handle(&self, index: usize) -> TransferHandle {
        self.registry.records()[index].handle.clone().unwrap()
    }

    fn transfer(&self, index: usize) -> Arc<MockTransfer> {
        self.facility.transfer(self.handle(index).id())
    }

    fn partial_dir(&self) -> PathBuf {
        self.temp_dir.path().join("partial")
    }

    /// Token naming a partial file in the temp dir, created when `exists`
    fn token(&self, name: &str, exists: bool) -> ResumeToken {
        if exists {
            fs::write(self.partial_dir().join(name), b"0123456789").unwrap();
        }
        ResumeInfo {
            url: "https://x/a.zip".to_string(),
            local_path: None,
            temp_file_name: Some(name.to_string()),
            bytes_received: 10,
            bytes_expected: Some(100),
        }
        .encode()
        .unwrap()
    }
}

fn description(url: &str, file_name: &str) -> String {
    TaskDescription::new(url, file_name).encode().unwrap()
}

#[tokio::test]
async fn test_add_download_appends_running_record() {
    let mut h = Harness::new();

    assert_eq!(h.registry.add_download("a.zip", "https://x/a.zip").unwrap(), 0);
    assert_eq!(h.registry.add_download("b.zip", "https://x/a.zip").unwrap(), 1);

    assert_eq!(h.registry.len(), 2);
    for index in 0..2 {
        let record = &h.registry.records()[index];
        assert_eq!(record.status, RequestStatus::Downloading);
        assert_eq!(h.handle(index).state(), TransferState::Running);
    }

    let stored = TaskDescription::from_slot(h.handle(1).description().as_deref()).unwrap();
    assert_eq!(stored, TaskDescription::new("https://x/a.zip", "b.zip"));

    let events = h.notifier.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], DownloadEvent::Started { index: 1, download } if download.file_name == "b.zip"));
}

#[tokio::test]
async fn test_add_download_rejects_empty_inputs() {
    let mut h = Harness::new();

    assert!(matches!(
        h.registry.add_download("", "https://x/a.zip"),
        Err(DownloadError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.registry.add_download("a.zip", "  "),
        Err(DownloadError::InvalidRequest(_))
    ));

    assert!(h.registry.is_empty());
    assert_eq!(h.facility.created_count(), 0);
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_pausing_paused_record_is_noop() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    h.registry.pause(0).unwrap();
    assert_eq!(h.registry.records()[0].status, RequestStatus::Paused);
    assert_eq!(h.transfer(0).state(), TransferState::Suspended);

    let start_time = h.registry.records()[0].start_time;
    let transfer_id = h.handle(0).id();

    h.registry.pause(0).unwrap();

    assert_eq!(h.registry.records()[0].status, RequestStatus::Paused);
    assert_eq!(h.registry.records()[0].start_time, start_time);
    assert_eq!(h.handle(0).id(), transfer_id);
    assert_eq!(h.notifier.kinds(), vec!["started", "paused"]);
}

#[tokio::test]
async fn test_pause_then_resume_keeps_single_record() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    // Already downloading
    h.registry.resume(0).unwrap();
    assert_eq!(h.notifier.kinds(), vec!["started"]);

    h.registry.pause(0).unwrap();
    h.registry.resume(0).unwrap();

    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.registry.records()[0].status, RequestStatus::Downloading);
    assert_eq!(h.transfer(0).state(), TransferState::Running);
    assert_eq!(h.notifier.kinds(), vec!["started", "paused", "resumed"]);
}

#[tokio::test(start_paused = true)]
async fn test_progress_after_ten_seconds() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    let handle = h.handle(0);
    h.registry.handle_progress(&handle, 50, 50, Some(100));

    let record = &h.registry.records()[0];
    assert_eq!(record.progress, Some(0.5));
    assert_eq!(record.status, RequestStatus::Downloading);
    assert!(record.detail_text.contains("Speed: 5.00 Bytes/sec"));
    assert!(record.detail_text.ends_with("Time Left: 10 sec"));

    let events = h.notifier.events();
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::ProgressUpdated { index: 0, download }) if download.progress == Some(0.5)
    ));
}

#[tokio::test]
async fn test_progress_with_unknown_size_is_indeterminate() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    let handle = h.handle(0);
    h.registry.handle_progress(&handle, 10, 10, None);
    h.registry.handle_progress(&handle, 10, 20, Some(0));

    let record = &h.registry.records()[0];
    assert!(record.progress.is_none());
    assert!(record.detail_text.contains("Time Left: Unknown"));
}

#[tokio::test]
async fn test_progress_for_untracked_transfer_is_ignored() {
    let mut h = Harness::new();
    let stranger = TransferHandle::new(Arc::new(MockTransfer::new(Origin::Url("u".into()))));

    h.registry.handle_progress(&stranger, 1, 1, Some(2));

    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_progress_matches_by_transfer_not_url() {
    let mut h = Harness::new();
    h.registry.add_download("first.zip", "https://x/a.zip").unwrap();
    h.registry.add_download("second.zip", "https://x/a.zip").unwrap();

    let handle = h.handle(1);
    h.registry.handle_progress(&handle, 25, 25, Some(100));

    assert!(h.registry.records()[0].progress.is_none());
    assert_eq!(h.registry.records()[1].progress, Some(0.25));
}

#[tokio::test]
async fn test_successful_completion_removes_record() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();
    h.registry.add_download("b.zip", "https://x/b.zip").unwrap();

    let handle = h.handle(0);
    h.registry.handle_completed(&handle, None);

    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.registry.records()[0].file_name, "b.zip");

    let finished: Vec<_> = h
        .notifier
        .events()
        .into_iter()
        .filter(|event| matches!(event, DownloadEvent::Finished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(matches!(&finished[0], DownloadEvent::Finished { index: 0, download } if download.file_name == "a.zip"));
    assert_eq!(h.registry.metrics().snapshot().finished, 1);
}

#[tokio::test]
async fn test_cancel_removes_record_only_after_confirmation() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    h.registry.cancel(0).unwrap();
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.transfer(0).state(), TransferState::Canceling);

    // Terminal transfers accept no further transitions
    assert!(matches!(
        h.registry.pause(0),
        Err(DownloadError::Handle(HandleError::IllegalTransition { .. }))
    ));

    let handle = h.handle(0);
    h.registry
        .handle_completed(&handle, Some(TransferError::cancelled()));

    assert!(h.registry.is_empty());
    assert_eq!(h.notifier.kinds(), vec!["started", "cancelled"]);
}

#[tokio::test]
async fn test_failure_with_valid_token_resumes_from_token() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();
    h.registry.add_download("b.zip", "https://x/b.zip").unwrap();

    let original = h.handle(0);
    let token = h.token("abc.part", true);
    let error = TransferError::network("connection reset").with_resume_token(token.clone());
    h.registry.handle_completed(&original, Some(error));

    let record = &h.registry.records()[0];
    assert_eq!(record.status, RequestStatus::Failed);
    assert_eq!(record.file_name, "a.zip");
    assert!(record.resume_token.is_none());

    let replacement = h.transfer(0);
    assert_ne!(replacement.id, original.id());
    assert_eq!(replacement.origin, Origin::Token(token));
    assert_eq!(replacement.state(), TransferState::Idle);
    assert_eq!(replacement.description(), original.description());

    assert!(matches!(
        h.notifier.events().last(),
        Some(DownloadEvent::Failed {
            index: 0,
            error: DownloadError::Transfer(TransferError {
                kind: TransferErrorKind::Network,
                ..
            }),
            ..
        })
    ));
}

#[tokio::test]
async fn test_failure_with_stale_token_restarts_from_url() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    let original = h.handle(0);
    let token = h.token("purged.part", false);
    h.registry.handle_completed(
        &original,
        Some(TransferError::http(503, Some("Service Unavailable")).with_resume_token(token)),
    );

    assert_eq!(h.registry.records()[0].status, RequestStatus::Failed);
    assert_eq!(
        h.transfer(0).origin,
        Origin::Url("https://x/a.zip".to_string())
    );
}

#[tokio::test]
async fn test_unknown_failure_is_reported_generically() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    let handle = h.handle(0);
    h.registry.handle_completed(
        &handle,
        Some(TransferError::new(TransferErrorKind::Unknown, "")),
    );

    match h.notifier.events().last() {
        Some(DownloadEvent::Failed { error, .. }) => {
            assert!(matches!(error, DownloadError::Unknown));
            assert_eq!(error.to_string(), "Unknown error occurred");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_retry_resumes_replacement() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    let handle = h.handle(0);
    h.registry
        .handle_completed(&handle, Some(TransferError::network("timeout")));
    h.registry.retry(0).unwrap();

    assert_eq!(h.registry.records()[0].status, RequestStatus::Downloading);
    assert_eq!(h.transfer(0).state(), TransferState::Running);
    assert_eq!(h.notifier.kinds(), vec!["started", "failed", "retried"]);

    // Already downloading
    h.registry.retry(0).unwrap();
    assert_eq!(h.notifier.events().len(), 3);
}

#[tokio::test]
async fn test_failed_record_without_replacement() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();
    h.registry.add_download("b.zip", "https://x/b.zip").unwrap();

    h.facility.fail_create.store(true, Ordering::SeqCst);
    for index in 0..2 {
        let handle = h.handle(index);
        h.registry
            .handle_completed(&handle, Some(TransferError::network("down")));
    }
    assert!(h.registry.records().iter().all(|r| r.handle.is_none()));

    // Nothing can confirm a cancel, so the record goes right away
    h.registry.cancel(1).unwrap();
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.notifier.kinds().last(), Some(&"cancelled"));

    h.facility.fail_create.store(false, Ordering::SeqCst);
    h.registry.retry(0).unwrap();
    assert_eq!(h.registry.records()[0].status, RequestStatus::Downloading);
    assert_eq!(h.transfer(0).state(), TransferState::Running);
    assert_eq!(
        TaskDescription::from_slot(h.handle(0).description().as_deref()).unwrap(),
        TaskDescription::new("https://x/a.zip", "a.zip")
    );
}

#[tokio::test]
async fn test_operations_on_missing_index() {
    let mut h = Harness::new();

    assert!(matches!(
        h.registry.pause(5),
        Err(DownloadError::IndexOutOfRange { index: 5, len: 0 })
    ));
    assert!(h.registry.resume(0).is_err());
    assert!(h.registry.retry(0).is_err());
    assert!(h.registry.cancel(0).is_err());
}

#[tokio::test]
async fn test_reconcile_keeps_running_and_drops_terminal() {
    let facility = MockFacility::default();
    let running = MockTransfer::with_state(
        TransferState::Running,
        Some(&description("https://x/a.zip", "a.zip")),
    );
    let finished = MockTransfer::with_state(
        TransferState::Completed,
        Some(&description("https://x/b.zip", "b.zip")),
    );
    facility
        .persisted
        .lock()
        .unwrap()
        .extend([running.clone(), finished.clone()]);

    let mut h = Harness::with_facility(facility);
    assert_eq!(h.registry.reconcile_at_startup().await, 1);

    assert_eq!(h.registry.len(), 1);
    let record = &h.registry.records()[0];
    assert_eq!(record.status, RequestStatus::Downloading);
    assert_eq!(record.file_name, "a.zip");
    assert_eq!(record.transfer_id(), Some(running.id));

    assert_eq!(finished.state(), TransferState::Completed);
    assert_eq!(h.notifier.kinds(), vec!["interrupted_tasks_populated"]);
}

#[tokio::test]
async fn test_reconcile_maps_states_and_cancels_unknowns() {
    let facility = MockFacility::default();
    let running = MockTransfer::with_state(
        TransferState::Running,
        Some(&description("https://x/a.zip", "a.zip")),
    );
    let suspended = MockTransfer::with_state(
        TransferState::Suspended,
        Some(&description("https://x/b.zip", "b.zip")),
    );
    let idle = MockTransfer::with_state(
        TransferState::Idle,
        Some(&description("https://x/c.zip", "c.zip")),
    );
    let garbled = MockTransfer::with_state(TransferState::Running, Some("{not json"));
    let blank = MockTransfer::with_state(TransferState::Suspended, None);
    facility.persisted.lock().unwrap().extend([
        running.clone(),
        suspended.clone(),
        idle.clone(),
        garbled.clone(),
        blank.clone(),
    ]);

    let mut h = Harness::with_facility(facility);
    h.registry.reconcile_at_startup().await;

    let statuses: Vec<_> = h.registry.records().iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![RequestStatus::Downloading, RequestStatus::Paused]
    );
    for dropped in [&idle, &garbled, &blank] {
        assert_eq!(dropped.state(), TransferState::Canceling);
    }

    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        DownloadEvent::InterruptedTasksPopulated { downloads } => {
            assert_eq!(downloads.len(), 2);
            assert_eq!(downloads[1].file_name, "b.zip");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_timeout_means_no_tasks() {
    let facility = MockFacility {
        enumerate_delay: Some(Duration::from_secs(30)),
        ..MockFacility::default()
    };
    facility.persisted.lock().unwrap().push(MockTransfer::with_state(
        TransferState::Running,
        Some(&description("https://x/a.zip", "a.zip")),
    ));

    let mut h = Harness::with_facility(facility);
    assert_eq!(h.registry.reconcile_at_startup().await, 0);

    assert!(h.registry.is_empty());
    assert!(matches!(
        h.notifier.events().as_slice(),
        [DownloadEvent::InterruptedTasksPopulated { downloads }] if downloads.is_empty()
    ));
}

#[tokio::test]
async fn test_interrupted_session_rebuilds_lost_record() {
    let mut h = Harness::new();
    let lost = MockTransfer::with_state(
        TransferState::Completed,
        Some(&description("https://x/a.zip", "a.zip")),
    );
    let token = h.token("lost.part", true);
    let error = TransferError::interrupted(InterruptReason::UserForceQuit).with_resume_token(token.clone());

    h.registry
        .handle_completed(&TransferHandle::new(lost.clone()), Some(error));

    assert_eq!(h.registry.len(), 1);
    let record = &h.registry.records()[0];
    assert_eq!(record.status, RequestStatus::Failed);
    assert_eq!(record.url, "https://x/a.zip");
    assert_eq!(record.file_name, "a.zip");

    let replacement = h.transfer(0);
    assert_eq!(replacement.origin, Origin::Token(token));
    assert_eq!(replacement.description(), lost.description());

    assert_eq!(h.notifier.kinds(), vec!["interrupted_tasks_populated"]);
    assert_eq!(h.registry.metrics().snapshot().recovered, 1);
}

#[tokio::test]
async fn test_interrupted_session_without_description_is_dropped() {
    let mut h = Harness::new();
    let lost = MockTransfer::with_state(TransferState::Completed, None);

    h.registry.handle_completed(
        &TransferHandle::new(lost),
        Some(TransferError::interrupted(InterruptReason::BackgroundUpdatesDisabled)),
    );

    assert!(h.registry.is_empty());
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_finished_payload_is_moved_into_place() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    let payload = h.partial_dir().join("payload.part");
    fs::write(&payload, b"payload").unwrap();
    let handle = h.handle(0);
    h.registry.handle_finished_to_location(&handle, &payload);
    h.registry.handle_completed(&handle, None);

    let destination = h.temp_dir.path().join("dest/a.zip");
    assert_eq!(fs::read(destination).unwrap(), b"payload");
    assert!(!payload.exists());
    assert!(h.registry.is_empty());
    assert_eq!(h.notifier.kinds(), vec!["started", "finished"]);
}

#[tokio::test]
async fn test_move_failure_turns_success_into_failure() {
    let mut h = Harness::new();
    h.registry.add_download("a.zip", "https://x/a.zip").unwrap();

    let destination_dir = h.temp_dir.path().join("dest");
    fs::create_dir_all(&destination_dir).unwrap();
    fs::write(destination_dir.join("a.zip"), b"older").unwrap();

    let payload = h.partial_dir().join("payload.part");
    fs::write(&payload, b"payload").unwrap();
    let handle = h.handle(0);
    h.registry.handle_finished_to_location(&handle, &payload);

    // Nothing is reported until the transfer completes
    assert_eq!(h.notifier.kinds(), vec!["started"]);

    h.registry.handle_completed(&handle, None);

    assert_eq!(h.registry.len(), 1);
    let record = &h.registry.records()[0];
    assert_eq!(record.status, RequestStatus::Failed);
    assert!(record.pending_move_error.is_none());
    assert_ne!(record.transfer_id(), Some(handle.id()));
    assert_eq!(
        h.transfer(0).origin,
        Origin::Url("https://x/a.zip".to_string())
    );

    assert_eq!(h.notifier.kinds(), vec!["started", "failed"]);
    assert!(matches!(
        h.notifier.events().last(),
        Some(DownloadEvent::Failed { error: DownloadError::Move { file_name, .. }, .. }) if file_name == "a.zip"
    ));
    assert_eq!(fs::read(destination_dir.join("a.zip")).unwrap(), b"older");
}

#[tokio::test]
async fn test_all_events_flushed_runs_completion_once() {
    let mut h = Harness::new();
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    h.registry.set_background_completion(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.registry.handle_transfer_event(TransferEvent::AllEventsFlushed);
    h.registry.handle_transfer_event(TransferEvent::AllEventsFlushed);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_manager_serializes_commands_and_callbacks() {
    let h = Harness::new();
    let facility = h.facility.clone();
    let notifier = h.notifier.clone();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (manager, task) = DownloadManager::spawn(h.registry, events_rx, 8);

    let index = manager.add_download("a.zip", "https://x/a.zip").await.unwrap();
    assert_eq!(index, 0);
    manager.pause(0).await.unwrap();

    let downloads = manager.downloads().await.unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].status, RequestStatus::Paused);

    let transfer_id = downloads[0].transfer_id.unwrap();
    let handle = TransferHandle::new(facility.transfer(transfer_id));
    events_tx
        .send(TransferEvent::Completed {
            handle,
            error: None,
        })
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !manager.downloads().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        notifier.kinds(),
        vec!["interrupted_tasks_populated", "started", "paused", "finished"]
    );
    assert_eq!(manager.metrics().started, 1);

    manager.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(facility.shut_down.load(Ordering::SeqCst));
    assert!(matches!(
        manager.pause(0).await,
        Err(DownloadError::ManagerClosed)
    ));
}
