//! Application worker pool.
//!
//! This module manages the set of application workers, tracking their state
//! and checking out sessions for incoming requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::WorkerConfig;
use crate::http::scgi::HeaderBlock;
use crate::proxy::session::{Session, WorkerAddr};

/// Options passed along with a checkout, copied from the request header.
#[derive(Debug, Default, Clone)]
pub struct PoolOptions {
    pub app_root: Option<String>,
    pub app_type: Option<String>,
    pub spawn_method: Option<String>,
    pub start_command: Option<String>,
    pub load_shell_envvars: Option<bool>,
    pub environment: Option<String>,
}

impl PoolOptions {
    pub fn from_headers(headers: &HeaderBlock) -> Self {
        fn string_option(headers: &HeaderBlock, name: &[u8]) -> Option<String> {
            headers.get_str(name).map(|v| v.to_string())
        }

        Self {
            app_root: string_option(headers, b"PASSENGER_APP_ROOT"),
            app_type: string_option(headers, b"PASSENGER_APP_TYPE"),
            spawn_method: string_option(headers, b"PASSENGER_SPAWN_METHOD"),
            start_command: string_option(headers, b"PASSENGER_START_COMMAND"),
            load_shell_envvars: headers
                .get(b"PASSENGER_LOAD_SHELL_ENVVARS")
                .map(|v| v == b"true"),
            environment: string_option(headers, b"PASSENGER_ENVIRONMENT"),
        }
    }
}

/// Details of a worker that failed to start, used to render the error page.
#[derive(Debug, Default, Clone)]
pub struct SpawnFailure {
    pub message: String,
    /// Pre-rendered error page content supplied by the spawner, if any
    pub error_page: Option<String>,
    /// Whether the failure content is HTML rather than plain text
    pub html: bool,
    pub annotations: HashMap<String, String>,
}

/// Errors a checkout can produce.
#[derive(Debug, Clone)]
pub enum CheckoutError {
    SpawnFailed(SpawnFailure),
    Other(String),
}

impl CheckoutError {
    pub fn message(&self) -> &str {
        match self {
            CheckoutError::SpawnFailed(failure) => &failure.message,
            CheckoutError::Other(message) => message,
        }
    }
}

/// Source of sessions, the seam between the request lifecycle and pool
/// policy. The checkout future may resolve on another runtime thread; the
/// caller awaits it from the client task, so client state is only ever
/// touched there.
pub trait SessionSource: Send + Sync {
    fn checkout(
        &self,
        options: &PoolOptions,
    ) -> impl Future<Output = Result<Session, CheckoutError>> + Send;

    /// Feedback after trying to initiate a checked-out session.
    fn report(&self, _worker: &str, _ok: bool) {}
}

/// Represents the current state of an application worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Worker is healthy and accepting sessions
    Up,
    /// Worker is down or unreachable
    Down,
}

/// An application worker with its bookkeeping
#[derive(Debug, Clone)]
pub struct Worker {
    pub addr: WorkerAddr,
    pub name: Option<String>,
    pub connect_password: String,
    pub state: WorkerState,
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
}

impl Worker {
    pub fn new(config: &WorkerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            addr: WorkerAddr::parse(&config.address)?,
            name: config.name.clone(),
            connect_password: config.connect_password.clone(),
            state: WorkerState::Up,
            last_check: None,
            consecutive_failures: 0,
        })
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => match &self.addr {
                WorkerAddr::Tcp(addr) => addr.clone(),
                WorkerAddr::Unix(path) => path.display().to_string(),
            },
        }
    }

    pub fn mark_failed(&mut self) {
        self.consecutive_failures += 1;
        self.last_check = Some(Instant::now());

        // Mark as down after 3 consecutive failures
        if self.consecutive_failures >= 3 {
            self.state = WorkerState::Down;
            tracing::warn!(
                worker = self.display_name(),
                failures = self.consecutive_failures,
                "Worker marked as down"
            );
        }
    }

    pub fn mark_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_check = Some(Instant::now());

        if self.state == WorkerState::Down {
            self.state = WorkerState::Up;
            tracing::info!(worker = self.display_name(), "Worker recovered");
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Up
    }
}

/// Pool of application workers with round-robin checkout.
#[derive(Clone)]
pub struct WorkerPool {
    workers: Arc<RwLock<Vec<Worker>>>,
    current_index: Arc<RwLock<usize>>,
    connect_timeout: Duration,
}

impl WorkerPool {
    pub fn new(configs: &[WorkerConfig], connect_timeout: Duration) -> anyhow::Result<Self> {
        let workers = configs
            .iter()
            .map(Worker::new)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            workers: Arc::new(RwLock::new(workers)),
            current_index: Arc::new(RwLock::new(0)),
            connect_timeout,
        })
    }

    /// Selects the next available worker using round-robin. Returns `None`
    /// if no workers are available.
    pub async fn select_worker(&self) -> Option<Worker> {
        let workers = self.workers.read().await;

        if workers.is_empty() {
            return None;
        }

        let mut index = *self.current_index.read().await % workers.len();
        let start_index = index;

        loop {
            if workers[index].is_available() {
                let worker = workers[index].clone();
                let next = (index + 1) % workers.len();
                drop(workers);
                *self.current_index.write().await = next;
                return Some(worker);
            }

            index = (index + 1) % workers.len();

            // All workers checked, none available
            if index == start_index {
                return None;
            }
        }
    }

    pub async fn mark_worker_failed(&self, name: &str) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.display_name() == name) {
            worker.mark_failed();
        }
    }

    pub async fn mark_worker_success(&self, name: &str) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.display_name() == name) {
            worker.mark_success();
        }
    }

    pub async fn available_count(&self) -> usize {
        self.workers
            .read()
            .await
            .iter()
            .filter(|w| w.is_available())
            .count()
    }
}

impl SessionSource for WorkerPool {
    async fn checkout(&self, options: &PoolOptions) -> Result<Session, CheckoutError> {
        match self.select_worker().await {
            Some(worker) => {
                tracing::debug!(
                    worker = worker.display_name(),
                    app_root = options.app_root.as_deref().unwrap_or(""),
                    "Checking out session"
                );
                Ok(Session::new(
                    worker.display_name(),
                    worker.addr.clone(),
                    worker.connect_password.clone(),
                    self.connect_timeout,
                ))
            }
            None => Err(CheckoutError::Other(
                "no application workers available".to_string(),
            )),
        }
    }

    fn report(&self, worker: &str, ok: bool) {
        let pool = self.clone();
        let worker = worker.to_string();
        tokio::spawn(async move {
            if ok {
                pool.mark_worker_success(&worker).await;
            } else {
                pool.mark_worker_failed(&worker).await;
            }
        });
    }
}
