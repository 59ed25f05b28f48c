//! Single task owning the registry.
//!
//! Caller commands and facility callbacks arrive on two channels and are
//! applied one at a time by the same task, so no two transitions ever race.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::{DownloadError, Result};
use super::events::EventNotifier;
use super::record::DownloadInfo;
use super::registry::{DownloadRegistry, RegistrySettings};
use crate::config::Config;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::transfer::{HttpFacility, TransferEvent};

enum Command {
    Add {
        file_name: String,
        url: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    Pause {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Retry {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<DownloadInfo>>,
    },
    OnAllEventsFlushed {
        handler: Box<dyn FnOnce() + Send>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end of the registry task
#[derive(Clone)]
pub struct DownloadManager {
    commands: mpsc::Sender<Command>,
    metrics: Arc<Metrics>,
}

impl DownloadManager {
    /// Open the HTTP transfer session described by `config` and start the
    /// registry task on top of it.
    pub async fn open(
        config: &Config,
        notifier: Arc<dyn EventNotifier>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let facility = HttpFacility::open(&config.session, &config.http, events_tx)?;

        let registry = DownloadRegistry::new(
            Arc::new(facility),
            notifier,
            RegistrySettings::from_config(config),
        );

        Ok(Self::spawn(
            registry,
            events_rx,
            config.downloads.command_buffer,
        ))
    }

    /// Move `registry` into its own task. It reconciles persisted transfers
    /// before serving any command.
    pub fn spawn(
        registry: DownloadRegistry,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        buffer: usize,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(buffer.max(1));
        let metrics = registry.metrics();

        let task = tokio::spawn(run(registry, commands_rx, events));

        (
            Self {
                commands: commands_tx,
                metrics,
            },
            task,
        )
    }

    pub async fn add_download(&self, file_name: &str, url: &str) -> Result<usize> {
        let file_name = file_name.to_string();
        let url = url.to_string();
        self.request(|reply| Command::Add {
            file_name,
            url,
            reply,
        })
        .await?
    }

    pub async fn pause(&self, index: usize) -> Result<()> {
        self.request(|reply| Command::Pause { index, reply }).await?
    }

    pub async fn resume(&self, index: usize) -> Result<()> {
        self.request(|reply| Command::Resume { index, reply }).await?
    }

    pub async fn retry(&self, index: usize) -> Result<()> {
        self.request(|reply| Command::Retry { index, reply }).await?
    }

    pub async fn cancel(&self, index: usize) -> Result<()> {
        self.request(|reply| Command::Cancel { index, reply }).await?
    }

    /// Current records, in registry order
    pub async fn downloads(&self) -> Result<Vec<DownloadInfo>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Run `handler` the next time the facility reports nothing running
    pub async fn on_all_events_flushed(
        &self,
        handler: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.commands
            .send(Command::OnAllEventsFlushed {
                handler: Box::new(handler),
            })
            .await
            .map_err(|_| DownloadError::ManagerClosed)
    }

    /// Stop the registry task and detach from the facility
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| DownloadError::ManagerClosed)?;
        reply_rx.await.map_err(|_| DownloadError::ManagerClosed)
    }
}

async fn run(
    mut registry: DownloadRegistry,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
) {
    registry.reconcile_at_startup().await;
    info!(downloads = registry.len(), "Download manager running");

    let mut events_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    registry.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Some(command) => apply(&mut registry, command),
                None => {
                    registry.shutdown().await;
                    break;
                }
            },
            event = events.recv(), if events_open => match event {
                Some(event) => registry.handle_transfer_event(event),
                None => {
                    debug!("Transfer event channel closed");
                    events_open = false;
                }
            },
        }
    }

    info!("Download manager stopped");
}

fn apply(registry: &mut DownloadRegistry, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        Command::Add {
            file_name,
            url,
            reply,
        } => {
            let _ = reply.send(registry.add_download(&file_name, &url));
        }
        Command::Pause { index, reply } => {
            let _ = reply.send(registry.pause(index));
        }
        Command::Resume { index, reply } => {
            let _ = reply.send(registry.resume(index));
        }
        Command::Retry { index, reply } => {
            let _ = reply.send(registry.retry(index));
        }
        Command::Cancel { index, reply } => {
            let _ = reply.send(registry.cancel(index));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(registry.downloads());
        }
        Command::OnAllEventsFlushed { handler } => registry.set_background_completion(handler),
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
