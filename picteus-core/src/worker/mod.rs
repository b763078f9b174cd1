//! Bounded pool running per-file analysis off the coordinator's task.
//!
//! Every call is its own tokio task gated by a semaphore of `size` permits.
//! A panicking call is caught and surfaces as [`WorkerError::Panicked`] to its
//! caller only; the pool keeps serving. Each call owns a duplex
//! [`WorkerPort`] for progress reports and cancellation.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use picteus_model::{
    ImageID, ImageSummary, LocationType, RepositoryID, SyncAction,
};
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::catalog::CatalogStore;
use crate::config::WorkerPoolConfig;
use crate::error::{PicteusError, Result};
use crate::metadata::MetadataExtractor;

pub mod functions;
pub mod port;

pub use port::{PortMessage, WorkerPort, port_pair};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("worker call panicked: {0}")]
    Panicked(String),

    #[error("worker call cancelled")]
    Cancelled,

    #[error("worker call aborted before completion")]
    Aborted,
}

/// Stores the worker functions read from and write to.
#[derive(Clone)]
pub struct WorkerServices {
    pub catalog: Arc<dyn CatalogStore>,
    pub extractor: Arc<dyn MetadataExtractor>,
}

impl fmt::Debug for WorkerServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerServices").finish_non_exhaustive()
    }
}

/// A named function invocation.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    ListFiles {
        location_type: LocationType,
        root: Url,
    },
    DeclareImage {
        repository_id: RepositoryID,
        path: PathBuf,
        parent_id: Option<ImageID>,
        source_url: Option<String>,
        application_metadata: Option<String>,
    },
    UpdateImage {
        repository_id: RepositoryID,
        path: PathBuf,
        parent_id: Option<ImageID>,
        source_url: Option<String>,
    },
    SynchronizeImage {
        repository_id: RepositoryID,
        path: PathBuf,
    },
}

impl WorkerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerRequest::ListFiles { .. } => "listFiles",
            WorkerRequest::DeclareImage { .. } => "declareImage",
            WorkerRequest::UpdateImage { .. } => "updateImage",
            WorkerRequest::SynchronizeImage { .. } => "synchronizeImage",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Files(Vec<PathBuf>),
    Image(ImageSummary),
    Synchronized {
        summary: ImageSummary,
        action: SyncAction,
    },
}

/// An in-flight call: its caller-side port and its eventual result.
pub struct WorkerCall {
    port: WorkerPort,
    result: oneshot::Receiver<Result<WorkerResponse>>,
}

impl fmt::Debug for WorkerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCall")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl WorkerCall {
    pub fn port(&mut self) -> &mut WorkerPort {
        &mut self.port
    }

    pub fn cancel(&self) {
        self.port.cancel();
    }

    pub async fn response(self) -> Result<WorkerResponse> {
        match self.result.await {
            Ok(result) => result,
            // The task was aborted during shutdown.
            Err(_) => Err(WorkerError::Aborted.into()),
        }
    }
}

pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    services: WorkerServices,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available_permits", &self.semaphore.available_permits())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig, services: WorkerServices) -> Self {
        let size = config.resolved_size();
        info!(size, "starting worker pool");
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            services,
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// Pool with a single execution unit.
    pub fn singleton(services: WorkerServices) -> Self {
        Self::new(&WorkerPoolConfig::singleton(), services)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Calls spawned and not yet reaped.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Start a call and hand back its port. Must run inside a tokio runtime.
    pub fn dispatch(&self, request: WorkerRequest) -> Result<WorkerCall> {
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown.into());
        }

        let (caller_port, unit_port) = port_pair();
        let (tx, rx) = oneshot::channel();
        let semaphore = Arc::clone(&self.semaphore);
        let services = self.services.clone();
        let name = request.name();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = tx.send(Err(WorkerError::ShutDown.into()));
                return;
            };

            debug!(function = name, "worker call started");
            let outcome = AssertUnwindSafe(execute(&services, request, unit_port))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(function = name, %message, "worker call panicked");
                    Err(WorkerError::Panicked(message).into())
                }
            };
            let _ = tx.send(result);
        });

        Ok(WorkerCall {
            port: caller_port,
            result: rx,
        })
    }

    pub async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        self.dispatch(request)?.response().await
    }

    pub async fn list_files(
        &self,
        location_type: LocationType,
        root: Url,
    ) -> Result<Vec<PathBuf>> {
        match self
            .call(WorkerRequest::ListFiles {
                location_type,
                root,
            })
            .await?
        {
            WorkerResponse::Files(files) => Ok(files),
            other => Err(unexpected("listFiles", &other)),
        }
    }

    pub async fn declare_image(
        &self,
        repository_id: RepositoryID,
        path: PathBuf,
        parent_id: Option<ImageID>,
        source_url: Option<String>,
        application_metadata: Option<String>,
    ) -> Result<ImageSummary> {
        match self
            .call(WorkerRequest::DeclareImage {
                repository_id,
                path,
                parent_id,
                source_url,
                application_metadata,
            })
            .await?
        {
            WorkerResponse::Image(summary) => Ok(summary),
            other => Err(unexpected("declareImage", &other)),
        }
    }

    pub async fn update_image(
        &self,
        repository_id: RepositoryID,
        path: PathBuf,
        parent_id: Option<ImageID>,
        source_url: Option<String>,
    ) -> Result<ImageSummary> {
        match self
            .call(WorkerRequest::UpdateImage {
                repository_id,
                path,
                parent_id,
                source_url,
            })
            .await?
        {
            WorkerResponse::Image(summary) => Ok(summary),
            other => Err(unexpected("updateImage", &other)),
        }
    }

    pub async fn synchronize_image(
        &self,
        repository_id: RepositoryID,
        path: PathBuf,
    ) -> Result<(ImageSummary, SyncAction)> {
        match self
            .call(WorkerRequest::SynchronizeImage {
                repository_id,
                path,
            })
            .await?
        {
            WorkerResponse::Synchronized { summary, action } => Ok((summary, action)),
            other => Err(unexpected("synchronizeImage", &other)),
        }
    }

    /// Reject new calls, let in-flight ones finish within the grace period,
    /// then abort the rest. Calls still waiting for a permit are rejected.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();

        let mut tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let pending = tasks.len();
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "worker calls outlived the shutdown grace period; aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!(pending, "worker pool shut down");
    }
}

async fn execute(
    services: &WorkerServices,
    request: WorkerRequest,
    port: WorkerPort,
) -> Result<WorkerResponse> {
    match request {
        WorkerRequest::ListFiles {
            location_type,
            root,
        } => functions::list_files(location_type, &root, port)
            .await
            .map(WorkerResponse::Files),
        WorkerRequest::DeclareImage {
            repository_id,
            path,
            parent_id,
            source_url,
            application_metadata,
        } => functions::declare_image(
            services,
            repository_id,
            path,
            parent_id,
            source_url,
            application_metadata,
        )
        .await
        .map(WorkerResponse::Image),
        WorkerRequest::UpdateImage {
            repository_id,
            path,
            parent_id,
            source_url,
        } => functions::update_image(services, repository_id, path, parent_id, source_url)
            .await
            .map(WorkerResponse::Image),
        WorkerRequest::SynchronizeImage {
            repository_id,
            path,
        } => functions::synchronize_image(services, repository_id, path)
            .await
            .map(|(summary, action)| WorkerResponse::Synchronized { summary, action }),
    }
}

fn unexpected(function: &str, response: &WorkerResponse) -> PicteusError {
    PicteusError::Internal(format!("unexpected {function} response: {response:?}"))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
