//! Worker launching.
//!
//! The launcher turns an accepted start request into a running worker:
//! - [`CommandLauncher`] spawns the real worker executable
//! - [`MockLauncher`] fakes workers for tests and local development
//!
//! Spawning is synchronous so the capacity check and the registration of
//! the new process happen in one critical section.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleet_id::ProcessId;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a worker is told at launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub process_id: ProcessId,
    /// Base URL the worker posts its heartbeats to.
    pub manager_url: &'a str,
    pub params: &'a serde_json::Value,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to encode worker params: {0}")]
    Params(#[from] serde_json::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("launcher refused to start worker: {0}")]
    Refused(String),
}

/// Starts workers.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Box<dyn Worker>, LaunchError>;
}

/// Exclusive handle to one running worker.
#[async_trait]
pub trait Worker: Send {
    /// Resolves once the worker has exited, for any reason. Returns the exit
    /// code when one is known.
    async fn wait(&mut self) -> Option<i32>;

    /// Asks the worker to terminate. The exit is still observed via `wait`.
    async fn kill(&mut self);
}

// =============================================================================
// Subprocess launcher
// =============================================================================

/// Spawns the worker executable as a child process.
///
/// Invocation: `<program> --process-id <id> --manager-url <url> --params <json>`.
pub struct CommandLauncher {
    program: PathBuf,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Box<dyn Worker>, LaunchError> {
        let params = serde_json::to_string(spec.params)?;

        let mut child = Command::new(&self.program)
            .arg("--process-id")
            .arg(spec.process_id.to_string())
            .arg("--manager-url")
            .arg(spec.manager_url)
            .arg("--params")
            .arg(params)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            process_id = %spec.process_id,
            pid = child.id(),
            program = %self.program.display(),
            "Spawned worker"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(spec.process_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(spec.process_id, "stderr", stderr));
        }

        Ok(Box::new(ChildWorker {
            process_id: spec.process_id,
            child,
        }))
    }
}

async fn forward_output<R>(process_id: ProcessId, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(process_id = %process_id, stream, line = %line, "Worker output"),
            Ok(None) => break,
            Err(e) => {
                debug!(process_id = %process_id, stream, error = %e, "Worker output closed");
                break;
            }
        }
    }
}

struct ChildWorker {
    process_id: ProcessId,
    child: Child,
}

#[async_trait]
impl Worker for ChildWorker {
    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(process_id = %self.process_id, error = %e, "Failed to wait for worker");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(process_id = %self.process_id, error = %e, "Failed to signal worker");
        }
    }
}

// =============================================================================
// Mock launcher
// =============================================================================

/// A launch as seen by the [`MockLauncher`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub process_id: ProcessId,
    pub manager_url: String,
    pub params: serde_json::Value,
}

type ExitSender = Arc<watch::Sender<Option<i32>>>;

/// Launcher that spawns nothing. Workers live until killed or until a test
/// calls [`MockLauncher::exit`].
#[derive(Default)]
pub struct MockLauncher {
    launches: Mutex<Vec<LaunchRecord>>,
    exits: Mutex<HashMap<ProcessId, ExitSender>>,
    live: Arc<AtomicUsize>,
    fail_launches: AtomicBool,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose every launch fails.
    pub fn failing() -> Self {
        let launcher = Self::default();
        launcher.fail_launches.store(true, Ordering::SeqCst);
        launcher
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Workers that have not exited yet.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Makes a worker exit as if it crashed. Returns false for unknown ids.
    pub fn exit(&self, process_id: ProcessId, code: i32) -> bool {
        let sender = self
            .exits
            .lock()
            .ok()
            .and_then(|exits| exits.get(&process_id).cloned());
        match sender {
            Some(sender) => {
                sender.send_replace(Some(code));
                true
            }
            None => false,
        }
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Box<dyn Worker>, LaunchError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(LaunchError::Refused("mock launcher configured to fail".into()));
        }

        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);

        if let Ok(mut launches) = self.launches.lock() {
            launches.push(LaunchRecord {
                process_id: spec.process_id,
                manager_url: spec.manager_url.to_string(),
                params: spec.params.clone(),
            });
        }
        if let Ok(mut exits) = self.exits.lock() {
            exits.insert(spec.process_id, Arc::clone(&tx));
        }
        self.live.fetch_add(1, Ordering::SeqCst);

        debug!(process_id = %spec.process_id, "[MOCK] Launched worker");

        Ok(Box::new(MockWorker {
            exit_rx: rx,
            exit_tx: tx,
            live: Arc::clone(&self.live),
            exited: false,
        }))
    }
}

struct MockWorker {
    exit_rx: watch::Receiver<Option<i32>>,
    exit_tx: ExitSender,
    live: Arc<AtomicUsize>,
    exited: bool,
}

#[async_trait]
impl Worker for MockWorker {
    async fn wait(&mut self) -> Option<i32> {
        let code = loop {
            if let Some(code) = *self.exit_rx.borrow_and_update() {
                break Some(code);
            }
            if self.exit_rx.changed().await.is_err() {
                break None;
            }
        };
        if !self.exited {
            self.exited = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        code
    }

    async fn kill(&mut self) {
        // SIGKILL-style exit code
        self.exit_tx.send_replace(Some(137));
    }
}
