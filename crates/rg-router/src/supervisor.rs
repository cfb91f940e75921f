//! Reconnection supervisor for connectors that hold a live connection
//!
//! State machine:
//! - `start()` makes one immediate attempt; success -> Connected (OK)
//! - failure -> Failed, and a background loop retries at a fixed delay
//!   until it succeeds, the attempt budget runs out, or `stop()` is called
//! - `connection_lost()` -> Failed, and a fresh loop supersedes any running one
//! - `stop()` -> Stopped, health back to UNKNOWN
//!
//! Only one retry loop is active at a time: each loop carries the
//! generation it was spawned for and exits once that generation is stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rg_common::MonitorStatus;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause between attempts after the first failure
    pub delay: Duration,
    /// Background attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Failed,
    Stopped,
}

struct Inner {
    name: String,
    connection: Arc<dyn Connection>,
    config: ReconnectConfig,
    started: AtomicBool,
    generation: AtomicU64,
    state: Mutex<(ConnectionState, MonitorStatus)>,
    wake: Notify,
}

impl Inner {
    fn set(&self, state: ConnectionState, status: MonitorStatus) {
        *self.state.lock() = (state, status);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.started.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn retry_loop(self: Arc<Self>, generation: u64) {
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.delay) => {}
                _ = self.wake.notified() => {}
            }
            if !self.is_current(generation) {
                debug!(connection = %self.name, generation, "Reconnect loop superseded");
                return;
            }

            attempts += 1;
            let last_status = self.state.lock().1.clone();
            self.set(ConnectionState::Connecting, last_status);

            match self.connection.connect().await {
                Ok(()) => {
                    if self.is_current(generation) {
                        self.set(ConnectionState::Connected, MonitorStatus::ok());
                        info!(connection = %self.name, attempts, "Reconnected");
                    } else if let Err(e) = self.connection.close().await {
                        warn!(connection = %self.name, error = %e, "Closing superseded connection failed");
                    }
                    return;
                }
                Err(e) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    self.set(ConnectionState::Failed, MonitorStatus::failed(e.to_string()));
                    warn!(connection = %self.name, attempts, error = %e, "Reconnect attempt failed");

                    if let Some(max) = self.config.max_attempts {
                        if attempts >= max {
                            warn!(connection = %self.name, attempts, "Giving up reconnecting");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ReconnectSupervisor {
    inner: Arc<Inner>,
}

impl ReconnectSupervisor {
    pub fn new(name: impl Into<String>, connection: Arc<dyn Connection>, config: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                connection,
                config,
                started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state: Mutex::new((ConnectionState::Unknown, MonitorStatus::unknown())),
                wake: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().0
    }

    pub fn status(&self) -> MonitorStatus {
        self.inner.state.lock().1.clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// One immediate attempt; on failure the retry loop takes over. A
    /// `stop()` that lands while the attempt is pending wins.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set(ConnectionState::Connecting, MonitorStatus::unknown());

        match self.inner.connection.connect().await {
            Ok(()) if !self.inner.is_current(generation) => {
                debug!(connection = %self.inner.name, "Stopped while connecting, closing");
                if let Err(e) = self.inner.connection.close().await {
                    warn!(connection = %self.inner.name, error = %e, "Closing superseded connection failed");
                }
            }
            Ok(()) => {
                self.inner.set(ConnectionState::Connected, MonitorStatus::ok());
                info!(connection = %self.inner.name, "Connected");
            }
            Err(e) if !self.inner.is_current(generation) => {
                debug!(connection = %self.inner.name, error = %e, "Stopped while connecting");
            }
            Err(e) => {
                self.inner
                    .set(ConnectionState::Failed, MonitorStatus::failed(e.to_string()));
                warn!(connection = %self.inner.name, error = %e, "Connection failed, will retry");
                self.spawn_loop(generation);
            }
        }
    }

    /// Report a dropped connection; reconnecting starts immediately in the
    /// background
    pub fn connection_lost(&self, error: impl std::fmt::Display) {
        if !self.is_started() {
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .set(ConnectionState::Failed, MonitorStatus::failed(error.to_string()));
        warn!(connection = %self.inner.name, error = %error, "Connection lost");

        // wake a sleeping loop so it notices it is stale
        self.inner.wake.notify_waiters();
        self.spawn_loop(generation);
    }

    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.wake.notify_waiters();

        if let Err(e) = self.inner.connection.close().await {
            warn!(connection = %self.inner.name, error = %e, "Closing connection failed");
        }
        self.inner.set(ConnectionState::Stopped, MonitorStatus::unknown());
        info!(connection = %self.inner.name, "Connection supervisor stopped");
    }

    fn spawn_loop(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.retry_loop(generation));
    }
}
