//! HTTP-backed background transfer facility.
//!
//! Transfers stream into partial files under the session's temp directory and
//! their state lives in a fjall store, so a new process can pick them up where
//! the previous one stopped:
//!
//! - transfers that were running are restarted with a `Range` request, or,
//!   with `resume_on_launch = false`, reported as interrupted so the registry
//!   rebuilds their records;
//! - suspended and idle transfers are restored as they were.
//!
//! Callbacks are delivered on the channel given to [`HttpFacility::open`].

mod runner;
mod store;
mod transfer;

pub use store::{PersistedTransfer, StoreError, TransferStore};
pub use transfer::HttpTransfer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, SessionConfig};
use crate::transfer::facility::{
    FacilityError, InterruptReason, TransferError, TransferEvent, TransferFacility,
};
use crate::transfer::handle::{Transfer, TransferHandle, TransferId, TransferState};
use crate::transfer::resume::{ResumeInfo, ResumeToken};

impl From<StoreError> for FacilityError {
    fn from(error: StoreError) -> Self {
        FacilityError::Persistence(error.to_string())
    }
}

/// State shared between the facility, its transfers and their runners
pub(crate) struct Shared {
    client: Client,
    temp_dir: PathBuf,
    progress_interval: u64,
    store: TransferStore,
    transfers: Mutex<HashMap<TransferId, Arc<HttpTransfer>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn emit(&self, event: TransferEvent) {
        if self.events.send(event).is_err() {
            debug!("Transfer event receiver dropped");
        }
    }

    pub(crate) fn persist(&self, transfer: &HttpTransfer) {
        if let Err(e) = self.store.upsert(&transfer.to_persisted()) {
            warn!(transfer_id = %transfer.id(), error = %e, "Failed to persist transfer state");
        }
    }

    fn register(&self, transfer: Arc<HttpTransfer>) {
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.insert(transfer.id(), transfer);
        }
    }

    pub(crate) fn lookup(&self, id: &TransferId) -> Option<Arc<HttpTransfer>> {
        self.transfers.lock().ok()?.get(id).cloned()
    }

    /// Drop a finished transfer from memory and from the store
    pub(crate) fn forget(&self, id: &TransferId) {
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.remove(id);
        }
        if let Err(e) = self.store.remove(id) {
            warn!(transfer_id = %id, error = %e, "Failed to remove persisted transfer");
        }
    }

    fn live(&self) -> Vec<Arc<HttpTransfer>> {
        let mut live: Vec<_> = self
            .transfers
            .lock()
            .map(|transfers| transfers.values().cloned().collect())
            .unwrap_or_default();
        live.sort_by_key(|transfer| transfer.id());
        live
    }

    /// Signal that nothing is running any more
    pub(crate) fn flush_if_idle(&self) {
        let running = self
            .live()
            .iter()
            .any(|transfer| transfer.state() == TransferState::Running);
        if !running {
            self.emit(TransferEvent::AllEventsFlushed);
        }
    }

    pub(crate) fn progress_interval(&self) -> u64 {
        self.progress_interval
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// [`TransferFacility`] performing downloads over HTTP(S)
pub struct HttpFacility {
    shared: Arc<Shared>,
}

impl HttpFacility {
    /// Open the session: build the client, open the store and restore
    /// persisted transfers. Must be called inside a tokio runtime.
    pub fn open(
        session: &SessionConfig,
        http: &HttpConfig,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Self, FacilityError> {
        std::fs::create_dir_all(&session.temp_dir)?;

        let client = build_client(http)?;
        let store = TransferStore::open(&session.state_path)?;
        let persisted = store.load_all()?;

        let shared = Arc::new(Shared {
            client,
            temp_dir: session.temp_dir.clone(),
            progress_interval: http.progress_interval.as_u64(),
            store,
            transfers: Mutex::new(HashMap::new()),
            events,
            shutdown: watch::Sender::new(false),
        });

        info!(
            restored = persisted.len(),
            temp_dir = %session.temp_dir.display(),
            "Transfer session opened"
        );

        for entry in persisted {
            restore(&shared, entry, session.resume_on_launch);
        }

        Ok(Self { shared })
    }

    fn register_new(
        &self,
        id: TransferId,
        url: &str,
        partial_path: PathBuf,
    ) -> Result<TransferHandle, FacilityError> {
        let transfer = Arc::new(HttpTransfer::new(
            id,
            url.to_string(),
            partial_path,
            Arc::downgrade(&self.shared),
        ));
        self.shared.store.upsert(&transfer.to_persisted())?;
        self.shared.register(transfer.clone());

        debug!(transfer_id = %id, url, "Created transfer");
        Ok(TransferHandle::new(transfer))
    }
}

#[async_trait]
impl TransferFacility for HttpFacility {
    fn create_transfer(&self, url: &str) -> Result<TransferHandle, FacilityError> {
        validate_url(url)?;
        let id = TransferId::new();
        let partial_path = self.shared.temp_dir.join(format!("{}.part", id));
        self.register_new(id, url, partial_path)
    }

    fn create_transfer_with_resume_token(
        &self,
        token: &ResumeToken,
    ) -> Result<TransferHandle, FacilityError> {
        let info = ResumeInfo::decode(token)
            .map_err(|e| FacilityError::InvalidResumeToken(e.to_string()))?;
        validate_url(&info.url)?;
        let partial_path = info
            .partial_path(&self.shared.temp_dir)
            .map_err(|e| FacilityError::InvalidResumeToken(e.to_string()))?;

        let handle = self.register_new(TransferId::new(), &info.url, partial_path)?;
        debug!(
            transfer_id = %handle.id(),
            offset = handle.bytes_received(),
            "Created transfer from resume token"
        );
        Ok(handle)
    }

    async fn persisted_transfers(&self) -> Vec<TransferHandle> {
        self.shared
            .live()
            .into_iter()
            .map(|transfer| TransferHandle::new(transfer as Arc<dyn Transfer>))
            .collect()
    }

    async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);

        let live = self.shared.live();
        for transfer in &live {
            // Wait for the runner to release the partial file
            let _guard = transfer.run_lock.lock().await;
            self.shared.persist(transfer);
        }

        if let Err(e) = self.shared.store.persist() {
            warn!(error = %e, "Failed to sync transfer store");
        }
        info!(transfers = live.len(), "Transfer session shut down");
    }
}

fn restore(shared: &Arc<Shared>, entry: PersistedTransfer, resume_on_launch: bool) {
    let transfer = Arc::new(HttpTransfer::restore(&entry, Arc::downgrade(shared)));

    match entry.state {
        TransferState::Running if resume_on_launch => {
            shared.register(transfer.clone());
            runner::spawn(shared, transfer);
        }
        TransferState::Running => {
            // The previous process died mid-transfer; hand it back as interrupted
            let mut error = TransferError::interrupted(InterruptReason::BackgroundUpdatesDisabled);
            if let Some(token) = transfer.resume_token() {
                error = error.with_resume_token(token);
            }
            transfer.set_state(TransferState::Completed);
            shared.forget(&entry.id);
            shared.emit(TransferEvent::Completed {
                handle: TransferHandle::new(transfer),
                error: Some(error),
            });
        }
        TransferState::Idle | TransferState::Suspended => shared.register(transfer),
        TransferState::Canceling | TransferState::Completed => shared.forget(&entry.id),
    }
}

fn validate_url(url: &str) -> Result<(), FacilityError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| FacilityError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FacilityError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn build_client(config: &HttpConfig) -> Result<Client, FacilityError> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout())
        .user_agent(&config.user_agent)
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

    if let Some(timeout) = config.request_timeout() {
        builder = builder.timeout(timeout);
    }

    if let Some(ref url) = config.proxy {
        let proxy = Proxy::all(url)
            .map_err(|e| FacilityError::Client(format!("Invalid proxy: {}", e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| FacilityError::Client(e.to_string()))
}
