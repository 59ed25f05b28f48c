//! Command runners: a console consumer of registry events.

use std::collections::HashMap;
use std::sync::Arc;

use fetchlane::config::Config;
use fetchlane::registry::{
    ChannelNotifier, DownloadEvent, DownloadInfo, DownloadManager, RequestStatus,
};
use fetchlane::transfer::TaskDescription;
use fetchlane::transfer::http::TransferStore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::{GetArgs, ListArgs, ResumeArgs};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn get(config: &Config, args: GetArgs) -> Result<(), AnyError> {
    let file_name = match args.name {
        Some(name) => name,
        None => file_name_from_url(&args.url),
    };

    let (notifier, events) = ChannelNotifier::new();
    let (manager, task) = DownloadManager::open(config, Arc::new(notifier)).await?;

    let index = manager.add_download(&file_name, &args.url).await?;
    info!(index, file_name, url = %args.url, "Queued download");

    let outcome = drive(&manager, events, args.retries).await;
    finish(&manager, task).await?;
    outcome
}

pub async fn resume(config: &Config, args: ResumeArgs) -> Result<(), AnyError> {
    let (notifier, events) = ChannelNotifier::new();
    let (manager, task) = DownloadManager::open(config, Arc::new(notifier)).await?;

    let outcome = drive(&manager, events, args.retries).await;
    finish(&manager, task).await?;
    outcome
}

pub fn list(config: &Config, args: ListArgs) -> Result<(), AnyError> {
    let store = TransferStore::open(&config.session.state_path)?;
    let transfers = store.load_all()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&transfers)?);
        return Ok(());
    }

    if transfers.is_empty() {
        println!("No persisted transfers");
        return Ok(());
    }

    for transfer in transfers {
        let file_name = TaskDescription::from_slot(transfer.description.as_deref())
            .map(|description| description.file_name)
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "{}  {:<10} {:<24} {}",
            transfer.id,
            transfer.state.as_str(),
            file_name,
            transfer.url
        );
    }
    Ok(())
}

/// Consume registry events until nothing is left to do: every download
/// finished, was cancelled, or failed more than `retries` times.
async fn drive(
    manager: &DownloadManager,
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
    retries: u32,
) -> Result<(), AnyError> {
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                info!("Stopping; running downloads continue on the next `resume`");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        match event {
            DownloadEvent::ProgressUpdated { download, index } => {
                debug!(index, file_name = %download.file_name, progress = ?download.progress, "{}", download.detail_text.replace('\n', ", "));
                continue;
            }
            DownloadEvent::Finished { download, .. } => {
                println!("Finished {}", download.file_name);
            }
            DownloadEvent::Cancelled { download, .. } => {
                println!("Cancelled {}", download.file_name);
            }
            DownloadEvent::Failed {
                download, error, ..
            } => {
                warn!(file_name = %download.file_name, error = %error, "Download failed");
                retry_failed(manager, &download, &mut attempts, retries).await?;
            }
            DownloadEvent::InterruptedTasksPopulated { downloads } => {
                info!(downloads = downloads.len(), "Restored downloads from an earlier run");
                for download in downloads
                    .iter()
                    .filter(|download| download.status == RequestStatus::Failed)
                {
                    retry_failed(manager, download, &mut attempts, retries).await?;
                }
            }
            other => debug!(event = other.kind(), "Download event"),
        }

        let remaining = manager.downloads().await?;
        let settled = remaining.iter().all(|download| {
            download.status == RequestStatus::Failed
                && attempts.get(&download.file_name).copied().unwrap_or(0) >= retries
        });
        if settled {
            let failed = remaining.len();
            if failed > 0 {
                return Err(format!("{} download(s) failed after {} retries", failed, retries).into());
            }
            return Ok(());
        }
    }
}

async fn retry_failed(
    manager: &DownloadManager,
    download: &DownloadInfo,
    attempts: &mut HashMap<String, u32>,
    retries: u32,
) -> Result<(), AnyError> {
    let attempt = attempts.entry(download.file_name.clone()).or_insert(0);
    if *attempt >= retries {
        return Ok(());
    }

    // Indexes go stale on removal; look the record up again
    let current = manager.downloads().await?;
    let Some(index) = current.iter().position(|candidate| {
        candidate.file_name == download.file_name && candidate.transfer_id == download.transfer_id
    }) else {
        return Ok(());
    };

    *attempt += 1;
    info!(file_name = %download.file_name, attempt = *attempt, retries, "Retrying download");
    manager.retry(index).await?;
    Ok(())
}

async fn finish(
    manager: &DownloadManager,
    task: tokio::task::JoinHandle<()>,
) -> Result<(), AnyError> {
    manager.shutdown().await?;
    task.await?;

    let metrics = manager.metrics();
    info!(
        started = metrics.started,
        finished = metrics.finished,
        failed = metrics.failed,
        cancelled = metrics.cancelled,
        recovered = metrics.recovered,
        "Session summary"
    );
    Ok(())
}

/// Last non-empty path segment of `url`, or `download`
fn file_name_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
