//! Notebook process supervisor
//!
//! The runner owns one [`NotebookHandle`] per notebook id. Each handle has a
//! fixed port and at most one live child process. A dedicated monitor task owns
//! the [`Child`] and is the only place the process is waited on or killed;
//! everything else asks it to stop through a oneshot channel.

use crate::config::{PortRange, RunnerConfig};
use crate::error::HubError;
use crate::notebook::{Notebook, RegistryAction, Status};
use crate::registry::{subscriber, Subscriber};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

type KillReply = oneshot::Sender<std::io::Result<()>>;

/// Live process owned by a monitor task
struct LiveProcess {
    pid: u32,
    kill_tx: oneshot::Sender<KillReply>,
}

struct HandleState {
    notebook: Notebook,
    status: Status,
    process: Option<LiveProcess>,
    /// Bumped on every start so a stale monitor never touches a newer process
    generation: u64,
}

/// Supervisor state for one notebook id
struct NotebookHandle {
    id: String,
    port: u16,
    /// Serializes start/stop/update for this id
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<HandleState>,
}

impl NotebookHandle {
    fn new(notebook: Notebook, port: u16) -> Self {
        Self {
            id: notebook.id.clone(),
            port,
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandleState {
                notebook,
                status: Status::Pending,
                process: None,
                generation: 0,
            }),
        }
    }

    fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }
}

/// Runs one notebook server process per registered notebook
pub struct Runner {
    config: RunnerConfig,
    port_range: PortRange,
    /// Last port handed out
    next_port: AtomicU32,
    handles: RwLock<HashMap<String, Arc<NotebookHandle>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runner {
    /// Create a runner. Ports are assigned upward starting at `port_range.start + 1`.
    ///
    /// Flipping `shutdown_rx` to `true` kills every process still alive.
    pub fn new(config: RunnerConfig, port_range: PortRange, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            port_range,
            next_port: AtomicU32::new(u32::from(port_range.start)),
            handles: RwLock::new(HashMap::new()),
            shutdown_rx,
        }
    }

    /// Registry subscriber that drives this runner
    pub fn subscriber(self: &Arc<Self>) -> Subscriber {
        let runner = Arc::clone(self);
        subscriber(move |notebook, action| {
            let runner = Arc::clone(&runner);
            async move { runner.handle_registry_event(notebook, action).await }
        })
    }

    /// React to a registry mutation. Failures are logged and leave the handle in
    /// `Error`; there is no caller to report them to.
    pub async fn handle_registry_event(&self, notebook: Notebook, action: RegistryAction) {
        debug!(id = %notebook.id, ?action, "Handling registry event");

        match action {
            RegistryAction::Added | RegistryAction::Updated => self.apply(notebook).await,
            RegistryAction::Deleted => self.remove(&notebook.id).await,
        }
    }

    async fn apply(&self, notebook: Notebook) {
        let id = notebook.id.clone();

        let existing = {
            let mut handles = self.handles.write();
            match handles.get(&id) {
                Some(handle) => Some(Arc::clone(handle)),
                None => {
                    let port = match self.allocate_port() {
                        Ok(port) => port,
                        Err(e) => {
                            error!(id = %id, error = %e, "Cannot allocate port for notebook");
                            return;
                        }
                    };
                    info!(id = %id, port, "Assigned port to notebook");
                    handles.insert(id.clone(), Arc::new(NotebookHandle::new(notebook.clone(), port)));
                    None
                }
            }
        };

        match existing {
            Some(handle) => self.restart(&handle, notebook).await,
            None => {
                if let Err(e) = self.start(&id).await {
                    error!(id = %id, error = %e, "Failed to start notebook");
                }
            }
        }
    }

    /// Replace the snapshot; a live process is relaunched on the same port
    async fn restart(&self, handle: &Arc<NotebookHandle>, notebook: Notebook) {
        let _op = handle.op_lock.lock().await;
        if let Err(e) = self.relaunch_locked(handle, notebook, false).await {
            error!(id = %handle.id, error = %e, "Failed to restart notebook");
        }
    }

    /// Relaunch a notebook with `notebook` as its configuration, starting it even
    /// when it is stopped or has crashed
    pub async fn reload(&self, notebook: Notebook) -> Result<(), HubError> {
        let handle = self.handle(&notebook.id)?;
        let _op = handle.op_lock.lock().await;
        self.relaunch_locked(&handle, notebook, true).await
    }

    async fn relaunch_locked(
        &self,
        handle: &Arc<NotebookHandle>,
        notebook: Notebook,
        start_idle: bool,
    ) -> Result<(), HubError> {
        let running = {
            let mut state = handle.state.lock();
            state.notebook = notebook;
            let running = state.process.is_some();
            if running {
                state.status = Status::Restarting;
            }
            running
        };

        if running {
            info!(id = %handle.id, port = handle.port, "Restarting notebook with new configuration");
            if let Err(e) = self.stop_locked(handle).await {
                handle.set_status(Status::Error);
                return Err(e);
            }
        } else if !start_idle {
            debug!(id = %handle.id, "Notebook not running, configuration updated");
            return Ok(());
        }

        self.start_locked(handle)
    }

    async fn remove(&self, id: &str) {
        let removed = self.handles.write().remove(id);
        let Some(handle) = removed else {
            debug!(id, "Delete for unknown notebook");
            return;
        };

        let _op = handle.op_lock.lock().await;
        match self.stop_locked(&handle).await {
            Ok(()) => info!(id, "Notebook stopped and removed"),
            Err(HubError::NotRunning(_)) => info!(id, "Notebook removed"),
            Err(e) => error!(id, error = %e, "Failed to stop removed notebook"),
        }
    }

    fn allocate_port(&self) -> Result<u16, HubError> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst) + 1;
        u16::try_from(port)
            .ok()
            .filter(|p| *p <= self.port_range.end)
            .ok_or(HubError::PortsExhausted {
                start: self.port_range.start,
                end: self.port_range.end,
            })
    }

    fn handle(&self, id: &str) -> Result<Arc<NotebookHandle>, HubError> {
        self.handles
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(id.to_string()))
    }

    /// Launch the notebook's process
    pub async fn start(&self, id: &str) -> Result<(), HubError> {
        let handle = self.handle(id)?;
        let _op = handle.op_lock.lock().await;
        self.start_locked(&handle)
    }

    /// Kill the notebook's process
    pub async fn stop(&self, id: &str) -> Result<(), HubError> {
        let handle = self.handle(id)?;
        let _op = handle.op_lock.lock().await;
        self.stop_locked(&handle).await
    }

    fn start_locked(&self, handle: &Arc<NotebookHandle>) -> Result<(), HubError> {
        let notebook = {
            let state = handle.state.lock();
            if state.process.is_some() {
                return Err(HubError::AlreadyRunning(handle.id.clone()));
            }
            state.notebook.clone()
        };

        if *self.shutdown_rx.borrow() {
            handle.set_status(Status::Error);
            return Err(HubError::ProcessLaunch {
                id: handle.id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "runner is shutting down"),
            });
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.launch_args(&notebook, handle.port));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                handle.set_status(Status::Error);
                return Err(HubError::ProcessLaunch {
                    id: handle.id.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        if let Some(stdout) = child.stdout.take() {
            forward_output(handle.id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(handle.id.clone(), "stderr", stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let generation = {
            let mut state = handle.state.lock();
            state.generation += 1;
            state.status = Status::Running;
            state.process = Some(LiveProcess { pid, kill_tx });
            state.generation
        };

        info!(id = %handle.id, pid, port = handle.port, path = %notebook.path, "Notebook process started");

        tokio::spawn(monitor(
            Arc::clone(handle),
            child,
            kill_rx,
            generation,
            self.shutdown_rx.clone(),
        ));

        Ok(())
    }

    async fn stop_locked(&self, handle: &NotebookHandle) -> Result<(), HubError> {
        // Taking the process first tells the monitor this exit is intentional
        let process = handle.state.lock().process.take();
        let Some(process) = process else {
            return Err(HubError::NotRunning(handle.id.clone()));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let result = match process.kill_tx.send(reply_tx) {
            // Monitor dropping the reply means the process exited on its own first
            Ok(()) => reply_rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };

        match result {
            Ok(()) => {
                handle.set_status(Status::Stopped);
                info!(id = %handle.id, pid = process.pid, "Notebook process stopped");
                Ok(())
            }
            Err(e) => {
                handle.set_status(Status::Error);
                Err(HubError::ProcessKill {
                    pid: process.pid,
                    source: e,
                })
            }
        }
    }

    /// Build the argument list for a notebook process
    pub fn launch_args(&self, notebook: &Notebook, port: u16) -> Vec<String> {
        let mut args = self.config.args.clone();
        args.extend([
            notebook.path.clone(),
            "--port".to_string(),
            port.to_string(),
            "--host".to_string(),
            self.config.host.clone(),
            "--headless".to_string(),
            "--no-token".to_string(),
        ]);
        if notebook.watch {
            args.push("--watch".to_string());
        }
        if notebook.show_code {
            args.push("--include-code".to_string());
        }
        args
    }

    pub fn get_status(&self, id: &str) -> Result<Status, HubError> {
        Ok(self.handle(id)?.state.lock().status)
    }

    pub fn get_port(&self, id: &str) -> Option<u16> {
        self.handles.read().get(id).map(|h| h.port)
    }

    /// PID of the live process, if any
    pub fn pid(&self, id: &str) -> Option<u32> {
        let handle = self.handles.read().get(id).cloned()?;
        let pid = handle.state.lock().process.as_ref().map(|p| p.pid);
        pid
    }

    /// Stop every managed process
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.handles.read().values().cloned().collect();
        info!(count = handles.len(), "Stopping all notebook processes");

        for handle in handles {
            let _op = handle.op_lock.lock().await;
            match self.stop_locked(&handle).await {
                Ok(()) | Err(HubError::NotRunning(_)) => {}
                Err(e) => warn!(id = %handle.id, error = %e, "Failed to stop notebook during shutdown"),
            }
        }
    }
}

/// Owns the child for its whole life. Exactly one of natural exit, a kill
/// request, or runner shutdown ends it.
async fn monitor(
    handle: Arc<NotebookHandle>,
    mut child: Child,
    kill_rx: oneshot::Receiver<KillReply>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        result = child.wait() => {
            let mut state = handle.state.lock();
            // A missing process means stop() already claimed this exit
            if state.generation != generation || state.process.is_none() {
                return;
            }
            state.process = None;
            state.status = match result {
                Ok(status) if status.success() => {
                    info!(id = %handle.id, "Notebook process exited");
                    Status::Stopped
                }
                Ok(status) => {
                    warn!(id = %handle.id, %status, "Notebook process exited abnormally");
                    Status::Error
                }
                Err(e) => {
                    error!(id = %handle.id, error = %e, "Failed waiting on notebook process");
                    Status::Error
                }
            };
        }
        Ok(reply) = kill_rx => {
            let result = child.kill().await;
            let _ = reply.send(result);
        }
        _ = shutdown_signalled(&mut shutdown_rx) => {
            if let Err(e) = child.kill().await {
                warn!(id = %handle.id, error = %e, "Failed to kill notebook process on shutdown");
            }
            let mut state = handle.state.lock();
            if state.generation == generation && state.process.is_some() {
                state.process = None;
                state.status = Status::Stopped;
            }
        }
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *rx.borrow_and_update();
        if stopping {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without signalling; never fire
            std::future::pending::<()>().await;
        }
    }
}

fn forward_output<R>(id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(notebook = %id, stream, "{}", line);
        }
    });
}
