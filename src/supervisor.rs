// Sidekick Server Supervisor
// Handles spawning, health polling, and lifetime tracking of the local
// server process.
use crate::config::{ServerConfig, PORT_ENV, TOKEN_ENV, UPSTREAM_URL_ENV};
use crate::error::{Result, SidekickError};
use crate::logs::LogSink;
use reqwest::Client;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Server process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// State shared with the stdio drain threads and the exit watcher.
struct Shared {
    state: RwLock<ServerState>,
    process: Mutex<Option<Child>>,
    exit_code: RwLock<Option<i32>>,
    sink: Arc<dyn LogSink>,
    /// Bumped on every spawn so a watcher from a previous start never acts
    /// on a later child.
    generation: AtomicU64,
}

/// Owns the lifecycle of one server process: spawn with the merged
/// environment, poll the health endpoint until ready or timeout, forward
/// stdout/stderr to the diagnostic sink, and kill on shutdown.
///
/// The port is fixed at construction; at most one live process exists per
/// supervisor, and re-`start` after a stop or an observed exit re-spawns.
pub struct ServerSupervisor {
    config: ServerConfig,
    /// Serializes start/stop lifecycle transitions to prevent duplicate
    /// spawns.
    lifecycle_lock: Mutex<()>,
    http_client: Client,
    shared: Arc<Shared>,
}

impl ServerSupervisor {
    pub fn new(config: ServerConfig, sink: Arc<dyn LogSink>) -> Self {
        // Short timeout keeps startup retries responsive; this client is
        // only used for health probes.
        let http_client = Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            lifecycle_lock: Mutex::new(()),
            http_client,
            shared: Arc::new(Shared {
                state: RwLock::new(ServerState::Stopped),
                process: Mutex::new(None),
                exit_code: RwLock::new(None),
                sink,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Base URL for the server API. Pure function of the configured port,
    /// valid to call in any state (including before the first `start`).
    pub fn server_url(&self) -> String {
        self.config.server_url()
    }

    pub async fn state(&self) -> ServerState {
        *self.shared.state.read().await
    }

    /// True iff a process handle exists and has not been observed to exit.
    pub async fn is_running(&self) -> bool {
        self.shared.process.lock().await.is_some()
    }

    /// Exit code of the most recently observed process exit, if any.
    pub async fn exit_code(&self) -> Option<i32> {
        *self.shared.exit_code.read().await
    }

    /// Probe the health endpoint once. Any 2xx response counts as ready;
    /// anything else, including a connection failure, does not.
    pub async fn check_health(&self) -> bool {
        matches!(self.probe_health().await, Ok(status) if status.is_success())
    }

    /// Start the server process and wait until it reports healthy.
    ///
    /// No-op if already running. On timeout the half-started child is killed
    /// before `StartupTimeout` is returned, so a failed start never leaks a
    /// process. There is no internal retry; calling `start` again is the
    /// caller's decision.
    pub async fn start(&self, health_timeout: Duration) -> Result<()> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        {
            let state = self.shared.state.read().await;
            if *state == ServerState::Running {
                tracing::debug!("Server already running");
                return Ok(());
            }
        }

        if self.config.port == 0 {
            return Err(SidekickError::InvalidConfig(
                "server port must be in 1..=65535".to_string(),
            ));
        }

        {
            let mut state = self.shared.state.write().await;
            *state = ServerState::Starting;
        }
        {
            let mut exit_code = self.shared.exit_code.write().await;
            *exit_code = None;
        }

        tracing::info!(
            "Starting sidekick server from: {}",
            self.config.binary_path.display()
        );

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(&self.config.args);
        if let Some(upstream_url) = &self.config.upstream_url {
            cmd.env(UPSTREAM_URL_ENV, upstream_url);
        }
        if let Some(token) = &self.config.access_token {
            cmd.env(TOKEN_ENV, token);
        }
        cmd.env(PORT_ENV, self.config.port.to_string());
        if std::env::var_os("RUST_LOG").is_none() {
            cmd.env("RUST_LOG", "info");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut state = self.shared.state.write().await;
                *state = ServerState::Failed;
                return Err(SidekickError::Server(format!(
                    "Failed to spawn server: {}",
                    e
                )));
            }
        };

        // Always drain stdout/stderr when we pipe them; an undrained pipe
        // can deadlock the server once its stdio buffers fill up.
        if let Some(stdout) = child.stdout.take() {
            let sink = self.shared.sink.clone();
            std::thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines().flatten() {
                    sink.append(&format!("STDOUT {line}"));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = self.shared.sink.clone();
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().flatten() {
                    sink.append(&format!("STDERR {line}"));
                }
            });
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut process_guard = self.shared.process.lock().await;
            *process_guard = Some(child);
        }
        self.spawn_exit_watcher(generation);

        match self.wait_for_ready(health_timeout).await {
            Ok(()) => {
                let mut state = self.shared.state.write().await;
                *state = ServerState::Running;
                tracing::info!("sidekick server ready on port {}", self.config.port);
                Ok(())
            }
            Err(e) => {
                // Kill the half-started child so a failed start never leaks
                // it.
                let child = { self.shared.process.lock().await.take() };
                if let Some(mut child) = child {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                {
                    let mut state = self.shared.state.write().await;
                    *state = ServerState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Stop the server. Idempotent; sends a kill signal and clears the
    /// handle immediately without waiting for graceful shutdown.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let child = { self.shared.process.lock().await.take() };
        let Some(mut child) = child else {
            return Ok(());
        };

        tracing::info!("Stopping sidekick server");
        if let Err(e) = child.kill() {
            tracing::warn!("Failed to kill server process: {}", e);
        }
        // Reap so the killed child does not linger as a zombie.
        let _ = child.wait();

        {
            let mut state = self.shared.state.write().await;
            *state = ServerState::Stopped;
        }
        Ok(())
    }

    /// Wait for the server to answer its health endpoint.
    async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        tracing::debug!(
            "Waiting for server health on port {} (timeout {}ms)",
            self.config.port,
            timeout.as_millis()
        );

        while start.elapsed() < timeout {
            // Fail fast if the child died before ever becoming healthy.
            {
                let mut process_guard = self.shared.process.lock().await;
                match process_guard.as_mut() {
                    None => {
                        return Err(SidekickError::Server(
                            "server process exited before becoming healthy".to_string(),
                        ));
                    }
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            process_guard.take();
                            drop(process_guard);
                            {
                                let mut exit_code = self.shared.exit_code.write().await;
                                *exit_code = status.code();
                            }
                            return Err(SidekickError::Server(format!(
                                "server process exited early with status {}",
                                status
                            )));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("Failed to query server process status: {}", e);
                        }
                    },
                }
            }

            match self.probe_health().await {
                Ok(status) if status.is_success() => {
                    tracing::info!("Server is ready after {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(status) => {
                    tracing::trace!("Health check returned {}, retrying...", status);
                }
                Err(e) => {
                    // Not yet ready; only the timeout is fatal.
                    tracing::trace!("Health check failed: {}, retrying...", e);
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        tracing::error!(
            "Server failed to become healthy within {}ms",
            timeout.as_millis()
        );
        Err(SidekickError::StartupTimeout(timeout))
    }

    async fn probe_health(&self) -> std::result::Result<reqwest::StatusCode, reqwest::Error> {
        let url = format!("{}/health", self.server_url());
        let response = self.http_client.get(&url).send().await?;
        Ok(response.status())
    }

    // The watcher and stop() may race to clear the same handle; both clear
    // via Option::take on the shared slot, so the second clear is a no-op.
    fn spawn_exit_watcher(&self, generation: u64) {
        let shared = self.shared.clone();
        let poll_interval = self.config.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if shared.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let exited = {
                    let mut process_guard = shared.process.lock().await;
                    match process_guard.as_mut() {
                        // stop() or a failed start already cleared the slot.
                        None => return,
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                process_guard.take();
                                Some(status)
                            }
                            Ok(None) => None,
                            Err(e) => {
                                tracing::warn!("Failed to poll server process: {}", e);
                                None
                            }
                        },
                    }
                };
                if let Some(status) = exited {
                    {
                        let mut exit_code = shared.exit_code.write().await;
                        *exit_code = status.code();
                    }
                    {
                        let mut state = shared.state.write().await;
                        *state = ServerState::Stopped;
                    }
                    shared
                        .sink
                        .append(&format!("server exited with status {}", status));
                    tracing::info!("sidekick server exited with status {}", status);
                    return;
                }
            }
        });
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        // Best effort: Drop cannot be async, so only kill if the handle is
        // uncontended.
        if let Ok(mut process_guard) = self.shared.process.try_lock() {
            if let Some(mut child) = process_guard.take() {
                tracing::info!("Killing sidekick server on drop");
                let _ = child.kill();
            }
        }
    }
}
