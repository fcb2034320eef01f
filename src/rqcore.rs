//! The agent core: admission, frame launch, kill paths, and host lifecycle
//! actions. RPC handlers call into this; it owns no transport.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::environment;
use crate::error::{FrameNotFound, LaunchError};
use crate::frame::{
    signal_session, spawn_child, RunFrame, RunningFrame, SpawnedChild,
};
use crate::lock::{HostAction, LockManager};
use crate::machine::{self, HostFacts};
use crate::output::{OutStream, OutputMux};
use crate::reaper::{ChildWatcher, ExitRecord};
use crate::registry::FrameRegistry;

/// How long after child exit the output pipes are drained before the
/// multiplexer closes. Grandchildren can hold the write ends open
/// indefinitely; their output is captured only while it keeps flowing.
const PIPE_DRAIN: Duration = Duration::from_millis(500);

pub struct RqdCore {
    pub config: Config,
    pub facts: Arc<HostFacts>,
    pub registry: FrameRegistry,
    pub locks: LockManager,
    watcher: ChildWatcher,
    actions: mpsc::UnboundedSender<HostAction>,
}

impl RqdCore {
    /// Build the core and the channel on which armed host actions are
    /// delivered to the daemon main loop.
    pub fn new(
        config: Config,
        facts: Arc<HostFacts>,
        watcher: ChildWatcher,
    ) -> (Arc<RqdCore>, mpsc::UnboundedReceiver<HostAction>) {
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let core = Arc::new(RqdCore {
            locks: LockManager::new(facts.total_cores),
            registry: FrameRegistry::new(),
            config,
            facts,
            watcher,
            actions,
        });
        (core, actions_rx)
    }

    fn grace_terminal(&self) -> Duration {
        Duration::from_secs(self.config.frame.grace_terminal_seconds)
    }

    /// Admit and launch a frame. On success the frame is in the registry
    /// before this returns, so a status query issued after the ack finds
    /// it. An exec failure is not a launch error: the frame is accepted and
    /// parked in FAILED_TO_LAUNCH for the dispatcher to discover.
    pub fn launch(self: &Arc<Self>, request: RunFrame) -> Result<(), LaunchError> {
        if request.frame_id.is_empty() {
            return Err(LaunchError::Invalid("frame_id is empty".into()));
        }
        if request.command.trim().is_empty() {
            return Err(LaunchError::Invalid("command is empty".into()));
        }
        if request.num_cores <= 0 {
            return Err(LaunchError::Invalid("num_cores must be positive".into()));
        }
        if self.registry.contains(&request.frame_id) {
            return Err(LaunchError::AlreadyExists(request.frame_id));
        }

        let machine_config = &self.config.machine.linux;
        self.locks.admit(
            request.num_cores,
            self.registry.booked_units(),
            request.ignore_nimby,
            || machine::is_user_logged_in(machine_config),
        )?;

        let env = environment::frame_env(&self.config, &self.facts, &request);
        let log_path = request.log_path();

        let mut mux = OutputMux::new();
        if let Err(e) = mux.connect_file(&log_path) {
            warn!(
                frame_id = %request.frame_id,
                logfile = %log_path.display(),
                error = %e,
                "could not open frame logfile"
            );
        }

        let cwd = if request.frame_temp_dir.is_empty() {
            None
        } else {
            Some(request.frame_temp_dir.as_str())
        };

        let spawned = spawn_child(
            &request.argv(),
            &env,
            cwd,
            self.config.frame.nice,
            request.cpu_list(),
            request.uid,
            request.gid,
        );

        match spawned {
            Ok(child) => {
                info!(
                    frame_id = %request.frame_id,
                    resource_id = %request.resource_id,
                    pid = child.pid,
                    command = %request.command,
                    "frame launched"
                );
                let exit_rx = self.watcher.register(child.pid);
                let frame = Arc::new(RunningFrame::new(request, child.pid));
                if let Err(e) = self.registry.insert(frame.clone()) {
                    // Lost a duplicate race; put the stray child down.
                    self.watcher.forget(child.pid);
                    let _ = signal_session(child.pid, Signal::SIGKILL);
                    return Err(e);
                }
                let core = self.clone();
                tokio::spawn(async move {
                    core.monitor(frame, mux, child, exit_rx).await;
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    frame_id = %request.frame_id,
                    resource_id = %request.resource_id,
                    command = %request.command,
                    error = %e,
                    "frame failed to launch"
                );
                mux.write(
                    OutStream::Stderr,
                    format!("failed to launch frame: {}\n", e).as_bytes(),
                );
                mux.close();
                let frame = Arc::new(RunningFrame::failed_to_launch(request));
                let frame_id = frame.request.frame_id.clone();
                self.registry.insert(frame)?;
                self.registry
                    .remove_terminal_after(&frame_id, self.grace_terminal());
                Ok(())
            }
        }
    }

    /// Pump child output into the multiplexer until the child is reaped,
    /// then record the exit and fire any armed idle action.
    async fn monitor(
        self: Arc<Self>,
        frame: Arc<RunningFrame>,
        mut mux: OutputMux,
        child: SpawnedChild,
        exit_rx: oneshot::Receiver<ExitRecord>,
    ) {
        let SpawnedChild {
            pid,
            mut stdout,
            mut stderr,
        } = child;

        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;
        let mut exit_rx = exit_rx;

        let record = loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => mux.write(OutStream::Stdout, &out_buf[..n]),
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => mux.write(OutStream::Stderr, &err_buf[..n]),
                },
                reaped = &mut exit_rx => {
                    break reaped.unwrap_or_else(|_| ExitRecord {
                        pid,
                        exit_code: 255,
                        ..ExitRecord::default()
                    });
                }
            }
        };

        // The child is gone; whatever the pipes still hold arrives quickly
        // unless an orphan keeps writing.
        if out_open {
            drain_pipe(&mut stdout, OutStream::Stdout, &mut mux, &mut out_buf).await;
        }
        if err_open {
            drain_pipe(&mut stderr, OutStream::Stderr, &mut mux, &mut err_buf).await;
        }
        mux.close();

        frame.complete(&record, frame.run_time());
        info!(
            frame_id = %frame.request.frame_id,
            resource_id = %frame.request.resource_id,
            pid,
            state = ?frame.state(),
            exit_code = record.exit_code,
            user_time = record.user_time,
            system_time = record.system_time,
            max_rss_kb = record.max_rss_kb,
            "frame finished"
        );

        self.registry
            .remove_terminal_after(&frame.request.frame_id, self.grace_terminal());
        self.frame_finished();
    }

    /// Fire the armed idle action once the last frame drains.
    fn frame_finished(&self) {
        if self.registry.running_count() > 0 {
            return;
        }
        if let Some(action) = self.locks.pending_action() {
            info!(action = action.name(), "host is idle, firing pending action");
            let _ = self.actions.send(action);
        }
    }

    /// TERM the frame's session now, KILL it if it lingers. The ack means
    /// the signal was sent, not that the frame has exited.
    pub fn kill_frame(self: &Arc<Self>, frame_id: &str, reason: &str) -> Result<(), FrameNotFound> {
        let frame = self
            .registry
            .get_by_frame_id(frame_id)
            .ok_or_else(|| FrameNotFound(frame_id.to_string()))?;
        if frame.is_terminal() {
            return Ok(());
        }

        info!(
            frame_id = %frame_id,
            pid = frame.pid,
            reason = %reason,
            "killing frame"
        );
        frame.request_kill();
        if let Err(e) = signal_session(frame.pid, Signal::SIGTERM) {
            debug!(frame_id = %frame_id, pid = frame.pid, error = %e, "TERM not delivered");
        }

        let grace = Duration::from_secs(self.config.frame.kill_grace_seconds);
        let frame = frame.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !frame.is_terminal() {
                warn!(
                    frame_id = %frame.request.frame_id,
                    pid = frame.pid,
                    "frame survived TERM, escalating to KILL"
                );
                let _ = signal_session(frame.pid, Signal::SIGKILL);
            }
        });
        Ok(())
    }

    /// Kill every running frame.
    pub fn kill_all(self: &Arc<Self>, reason: &str) {
        for frame in self.registry.list_running() {
            let _ = self.kill_frame(&frame.request.frame_id, reason);
        }
    }

    /// Kill everything and hand the action to the main loop.
    pub fn host_action_now(self: &Arc<Self>, action: HostAction) {
        info!(action = action.name(), "immediate host action requested");
        self.locks.arm_action(action);
        self.kill_all(action.name());
        let _ = self.actions.send(action);
    }

    /// Lock all cores and fire the action when the host drains. Fires
    /// immediately when nothing is running.
    pub fn host_action_when_idle(self: &Arc<Self>, action: HostAction) {
        info!(action = action.name(), "idle host action armed");
        self.locks.arm_action(action);
        self.frame_finished();
    }

    /// Enable NIMBY. If a user is at the console the host is cleared right
    /// away.
    pub fn nimby_on(self: &Arc<Self>) {
        self.locks.set_nimby(true);
        if machine::is_user_logged_in(&self.config.machine.linux) {
            info!("NIMBY enabled with a user logged in, clearing running frames");
            self.kill_all("nimby");
        } else {
            info!("NIMBY enabled");
        }
    }

    pub fn nimby_off(self: &Arc<Self>) {
        info!("NIMBY disabled");
        self.locks.set_nimby(false);
    }

    pub fn unlock_all(self: &Arc<Self>) {
        if let Some(action) = self.locks.unlock_all() {
            info!(action = action.name(), "pending idle action cancelled by unlock");
        }
    }

    /// Wait for running frames to drain, escalating to a kill-all after
    /// `patience`. Used on signal-driven shutdown.
    pub async fn drain(self: &Arc<Self>, patience: Duration, kill_patience: Duration) {
        self.locks.lock_all();
        if !self.wait_idle(patience).await {
            warn!("frames still running after drain patience, killing them");
            self.kill_all("daemon shutdown");
            if !self.wait_idle(kill_patience).await {
                error!("frames still unreaped at shutdown, abandoning them");
            }
        }
    }

    async fn wait_idle(&self, patience: Duration) -> bool {
        let poll = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while self.registry.running_count() > 0 {
            if waited >= patience {
                return false;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        true
    }
}

async fn drain_pipe(
    pipe: &mut pipe::Receiver,
    stream: OutStream,
    mux: &mut OutputMux,
    buf: &mut [u8],
) {
    loop {
        match tokio::time::timeout(PIPE_DRAIN, pipe.read(buf)).await {
            Ok(Ok(n)) if n > 0 => mux.write(stream, &buf[..n]),
            _ => return,
        }
    }
}
