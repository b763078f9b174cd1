//! Filesystem watch pipeline for repositories.
//!
//! A thin wrapper around `notify`: one recursive watcher per repository root
//! feeds a bounded channel drained by a single loop task, so the changes of
//! one repository are applied in the order they were observed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use picteus_model::RepositoryID;
use tokio::sync::{RwLock, mpsc};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

pub mod echo;
pub mod handler;

use crate::config::WatchConfig;
use crate::context::SyncContext;
use crate::error::{PicteusError, Result};
use handler::{WatchFlow, classify, handle_change};

/// How long stopping a watch waits for already queued changes to be applied.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Observer hook for surfacing watcher errors.
pub trait WatchObserver: Send + Sync {
    fn on_error(&self, repository_id: RepositoryID, error: &str);
}

/// Observer used when nothing listens for watcher failures.
pub struct NoopWatchObserver;

impl WatchObserver for NoopWatchObserver {
    fn on_error(&self, _repository_id: RepositoryID, _error: &str) {}
}

impl fmt::Debug for NoopWatchObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoopWatchObserver")
    }
}

/// Registry of active repository watches.
pub struct RepositoryWatchService {
    config: WatchConfig,
    observer: Arc<dyn WatchObserver>,
    repositories: RwLock<HashMap<RepositoryID, RepositoryWatch>>,
}

impl fmt::Debug for RepositoryWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RepositoryWatchService");
        debug.field("config", &self.config);
        match self.repositories.try_read() {
            Ok(guard) => {
                debug.field("active_watches", &guard.len());
            }
            Err(_) => {
                debug.field("repositories", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl RepositoryWatchService {
    pub fn new(config: WatchConfig, observer: Arc<dyn WatchObserver>) -> Self {
        Self {
            config,
            observer,
            repositories: RwLock::new(HashMap::new()),
        }
    }

    /// Start watching `root`. The watch is live when this returns. Returns
    /// `false` when the repository was already watched.
    pub async fn register(
        &self,
        repository_id: RepositoryID,
        root: PathBuf,
        ctx: SyncContext,
    ) -> Result<bool> {
        if self.is_watching(repository_id).await {
            return Ok(false);
        }
        self.discard_stale(repository_id).await;

        let (tx, rx) = mpsc::channel::<WatchMessage>(self.config.channel_capacity.max(1));
        let watcher_root = root.clone();
        let watcher = spawn_blocking(move || init_watcher(&watcher_root, tx))
            .await
            .map_err(|err| {
                PicteusError::Internal(format!("watcher initialization panicked: {err}"))
            })?
            .inspect_err(|err| self.observer.on_error(repository_id, &err.to_string()))?;

        let mut guard = self.repositories.write().await;
        if guard.get(&repository_id).is_some_and(RepositoryWatch::is_live) {
            // Lost a registration race; dropping the watcher closes its stream.
            return Ok(false);
        }
        let loop_task = spawn_watch_loop(
            repository_id,
            root.clone(),
            ctx,
            Arc::clone(&self.observer),
            rx,
        );
        guard.insert(
            repository_id,
            RepositoryWatch {
                root: root.clone(),
                _watcher: watcher,
                loop_task,
            },
        );
        info!(repository_id = %repository_id, root = %root.display(), "watching repository");
        Ok(true)
    }

    /// Stop watching. Changes already queued are applied first. Returns
    /// `false` when the repository was not watched, or its watch had already
    /// ended on its own.
    pub async fn unregister(&self, repository_id: RepositoryID) -> bool {
        let watch = self.repositories.write().await.remove(&repository_id);
        match watch {
            Some(watch) => {
                let live = watch.is_live();
                watch.shutdown().await;
                if live {
                    info!(repository_id = %repository_id, "stopped watching repository");
                }
                live
            }
            None => false,
        }
    }

    /// Whether a watch is registered and its loop still running. A loop ends
    /// on its own when the root disappears.
    pub async fn is_watching(&self, repository_id: RepositoryID) -> bool {
        self.repositories
            .read()
            .await
            .get(&repository_id)
            .is_some_and(RepositoryWatch::is_live)
    }

    pub async fn watched_root(&self, repository_id: RepositoryID) -> Option<PathBuf> {
        self.repositories
            .read()
            .await
            .get(&repository_id)
            .map(|watch| watch.root.clone())
    }

    pub async fn watcher_count(&self) -> usize {
        self.repositories
            .read()
            .await
            .values()
            .filter(|watch| watch.is_live())
            .count()
    }

    async fn discard_stale(&self, repository_id: RepositoryID) {
        let stale = {
            let mut guard = self.repositories.write().await;
            match guard.get(&repository_id) {
                Some(watch) if !watch.is_live() => guard.remove(&repository_id),
                _ => None,
            }
        };
        if let Some(watch) = stale {
            debug!(repository_id = %repository_id, root = %watch.root.display(), "discarding ended watch");
            watch.shutdown().await;
        }
    }

    /// Tear down every registered watch.
    pub async fn shutdown(&self) {
        let watches: Vec<_> = self
            .repositories
            .write()
            .await
            .drain()
            .map(|(_, watch)| watch)
            .collect();
        for watch in watches {
            watch.shutdown().await;
        }
    }
}

struct RepositoryWatch {
    root: PathBuf,
    // Dropping the watcher stops the notify stream and closes the channel.
    _watcher: RecommendedWatcher,
    loop_task: JoinHandle<()>,
}

impl RepositoryWatch {
    fn is_live(&self) -> bool {
        !self.loop_task.is_finished()
    }

    async fn shutdown(self) {
        let RepositoryWatch {
            root,
            _watcher: watcher,
            mut loop_task,
        } = self;
        drop(watcher);
        if timeout(STOP_GRACE, &mut loop_task).await.is_err() {
            warn!(root = %root.display(), "watch loop did not drain in time; aborting");
            loop_task.abort();
        }
    }
}

impl fmt::Debug for RepositoryWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryWatch")
            .field("root", &self.root)
            .field("loop_task_finished", &self.loop_task.is_finished())
            .finish()
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

fn spawn_watch_loop(
    repository_id: RepositoryID,
    root: PathBuf,
    ctx: SyncContext,
    observer: Arc<dyn WatchObserver>,
    mut rx: mpsc::Receiver<WatchMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                WatchMessage::Event(event) => {
                    for change in classify(&root, &event) {
                        debug!(repository_id = %repository_id, ?change, "filesystem change");
                        match handle_change(&ctx, repository_id, &root, change).await {
                            Ok(WatchFlow::Continue) => {}
                            Ok(WatchFlow::RootRemoved) => {
                                info!(repository_id = %repository_id, root = %root.display(), "watch ended with its root");
                                return;
                            }
                            Err(err) => {
                                warn!(repository_id = %repository_id, error = %err, "failed to apply filesystem change");
                                observer.on_error(repository_id, &err.to_string());
                            }
                        }
                    }
                }
                WatchMessage::Error(error) => {
                    warn!(repository_id = %repository_id, %error, "watcher error");
                    observer.on_error(repository_id, &error);
                }
            }
        }
    })
}

fn init_watcher(root: &Path, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let path_clone = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if let Err(err) = tx.blocking_send(WatchMessage::Event(event)) {
                    warn!(
                        "watch channel send failed for {}: {}",
                        path_clone.display(),
                        err
                    );
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}
