//! Context-menu commands ("sync this path") for one sync root.
//!
//! Commands arrive from arbitrary threads on a channel; each one is routed
//! through the task queue and the path lock like any watcher event.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use cfsync_core::{ShellCommand, ShellCommandKind, SyncProviderContext};
use cfsync_remote::RemoteRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::locker::FileLocker;
use crate::metrics::SyncMetrics;
use crate::placeholders::{PlaceholdersService, UpdateOutcome};
use crate::task_queue::TaskQueue;
use crate::upload::RemoteUploader;

const SOURCE: &str = "shell";

/// Writer side of a root's command channel.
#[derive(Clone)]
pub struct ShellCommandSender {
    tx: mpsc::UnboundedSender<ShellCommand>,
}

impl ShellCommandSender {
    /// Returns false once the root has shut down.
    pub fn submit(&self, command: ShellCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

pub fn shell_channel() -> (ShellCommandSender, mpsc::UnboundedReceiver<ShellCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ShellCommandSender { tx }, rx)
}

pub struct ShellCommandQueue {
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

struct ShellHandler {
    context: Arc<SyncProviderContext>,
    read: Arc<dyn RemoteRead>,
    placeholders: Arc<PlaceholdersService>,
    uploader: Arc<RemoteUploader>,
    locker: FileLocker,
    metrics: SyncMetrics,
}

impl ShellCommandQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        context: Arc<SyncProviderContext>,
        read: Arc<dyn RemoteRead>,
        placeholders: Arc<PlaceholdersService>,
        uploader: Arc<RemoteUploader>,
        locker: FileLocker,
        queue: Arc<TaskQueue>,
        metrics: SyncMetrics,
        mut commands: mpsc::UnboundedReceiver<ShellCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let handler = Arc::new(ShellHandler {
            context,
            read,
            placeholders,
            uploader,
            locker,
            metrics,
        });
        let token = cancel.clone();
        let consumer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = commands.recv() => match next {
                        Some(command) => {
                            let handler = handler.clone();
                            let label = format!("shell {:?} {}", command.kind, command.path.display());
                            queue.enqueue(label, async move {
                                handler.handle(command).await;
                            });
                        }
                        None => break,
                    },
                }
            }
            debug!("shell command queue stopped");
        });
        Self {
            cancel,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = consumer {
            let _ = handle.await;
        }
    }
}

impl ShellHandler {
    async fn handle(&self, command: ShellCommand) {
        let result = match command.kind {
            ShellCommandKind::Sync => self.sync(&command.path).await,
        };
        if let Err(e) = result {
            warn!(path = %command.path.display(), "shell command failed: {e:#}");
            self.metrics.handler_failed(SOURCE);
        }
    }

    async fn sync(&self, path: &Path) -> Result<()> {
        let Some(rel) = self.context.relative_path(path) else {
            warn!(path = %path.display(), "shell command outside sync root");
            return Ok(());
        };
        let _guard = self.locker.lock(&rel).await;
        let on_remote = self.read.exists(&rel).await?;
        let local = self.placeholders.local_info(&rel)?;
        match local {
            None if on_remote => self.project(&rel).await,
            None => Ok(()),
            Some(info) if !info.is_placeholder => {
                if !on_remote {
                    info!(path = %rel, "uploading on request");
                    return self.uploader.create_remote(&rel).await;
                }
                if info.is_directory {
                    return self.placeholders.update_directory(&rel).await;
                }
                // Last writer wins: a newer local copy goes up instead
                match self.placeholders.update_file(&rel, false).await? {
                    UpdateOutcome::Skipped => self.uploader.push_update(&rel).await,
                    _ => Ok(()),
                }
            }
            Some(info) if info.is_partial() => {
                if info.is_directory {
                    return self.placeholders.create_or_update_directory(&rel).await;
                }
                self.placeholders.update_file(&rel, true).await?;
                Ok(())
            }
            Some(_) => self.uploader.push_update(&rel).await,
        }
    }

    /// Create or update the local placeholder from the remote.
    async fn project(&self, relative: &str) -> Result<()> {
        if self.read.is_directory(relative).await? {
            self.placeholders.create_or_update_directory(relative).await
        } else {
            self.placeholders.create_or_update_file(relative).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_fails_once_receiver_is_gone() {
        let (sender, mut rx) = shell_channel();
        assert!(sender.submit(ShellCommand::sync("/tmp/root/a.txt")));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, ShellCommandKind::Sync);
        drop(rx);
        assert!(!sender.submit(ShellCommand::sync("/tmp/root/b.txt")));
    }
}
