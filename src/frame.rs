//! Frame data model and the process that runs one frame.
//!
//! A frame's child is made a session leader between fork and exec, so the
//! whole subtree can be signalled through the process group even when the
//! command forks grandchildren. The setup order in the child is nice, then
//! CPU affinity, then setsid, then the uid/gid switch.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setgid, setsid, setuid, Gid, Pid, Uid};
use tokio::net::unix::pipe;

use crate::environment::ATTR_CPU_LIST;
use crate::reaper::ExitRecord;

/// Exit code reserved for frames that never reached exec.
pub const EXIT_FAILED_LAUNCH: i32 = 255;

/// The immutable launch request from the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct RunFrame {
    pub frame_id: String,
    pub resource_id: String,
    pub job_id: String,
    pub job_name: String,
    pub frame_name: String,
    pub layer_id: String,
    pub command: String,
    pub user_name: String,
    pub uid: u32,
    pub gid: u32,
    pub log_dir: String,
    pub log_file: String,
    pub show: String,
    pub shot: String,
    pub job_temp_dir: String,
    pub frame_temp_dir: String,
    /// Core-hundredths; 100 books one logical core.
    pub num_cores: i32,
    pub ignore_nimby: bool,
    pub environment: HashMap<String, String>,
    pub attributes: HashMap<String, String>,
}

impl RunFrame {
    /// Physical cores this frame is pinned to, from the CPU_LIST attribute.
    pub fn cpu_list(&self) -> Option<Vec<usize>> {
        let raw = self.attributes.get(ATTR_CPU_LIST)?;
        let cores: Vec<usize> = raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if cores.is_empty() {
            None
        } else {
            Some(cores)
        }
    }

    /// The argv actually exec'd. A plain command is split on whitespace and
    /// exec'd directly so exec failures are observable; anything with shell
    /// syntax runs under `/bin/sh -c`.
    pub fn argv(&self) -> Vec<String> {
        if command_needs_shell(&self.command) {
            vec!["/bin/sh".into(), "-c".into(), self.command.clone()]
        } else {
            self.command.split_whitespace().map(String::from).collect()
        }
    }

    /// Where this frame's logfile lives: `log_file` when set, otherwise
    /// `<log_dir>/<job_name>.<frame_name>.rqlog`.
    pub fn log_path(&self) -> PathBuf {
        if !self.log_file.is_empty() {
            return PathBuf::from(&self.log_file);
        }
        PathBuf::from(&self.log_dir).join(format!("{}.{}.rqlog", self.job_name, self.frame_name))
    }
}

fn command_needs_shell(command: &str) -> bool {
    command
        .bytes()
        .any(|b| b"|&;<>()$`\\\"'*?[]{}~#\n".contains(&b))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Exited,
    Killed,
    FailedToLaunch,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Exited | RunState::Killed | RunState::FailedToLaunch
        )
    }
}

/// Accumulated CPU and wall time for a finished frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameRusage {
    pub user_time: f64,
    pub system_time: f64,
    pub real_time: f64,
    pub max_rss_kb: u64,
}

/// One node of a frame's process tree as seen by the sampler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PtreeNode {
    pub pid: i32,
    pub running_time: f64,
    pub cpu_time: u64,
}

/// Per-session-leader resource roll-up from one sampler tick. Memory sizes
/// are bytes; cpu_time is clock ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcSample {
    pub rss: u64,
    pub max_rss: u64,
    pub vsize: u64,
    pub max_vsize: u64,
    pub pcpu: f64,
    pub cpu_time: u64,
    pub running_time: f64,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
    pub read_calls: u64,
    pub write_calls: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub ptree: Vec<PtreeNode>,
}

/// Mutable progress of a live frame, behind the one lock.
struct Progress {
    state: RunState,
    exit_code: Option<i32>,
    rusage: FrameRusage,
    kill_requested: bool,
    sample: Option<std::sync::Arc<ProcSample>>,
    max_rss: u64,
    max_vsize: u64,
}

/// The in-memory record for one live (or recently terminal) frame.
pub struct RunningFrame {
    pub request: RunFrame,
    /// Session leader pid; 0 for frames that never launched.
    pub pid: i32,
    pub start_time: SystemTime,
    started: Instant,
    progress: Mutex<Progress>,
}

impl RunningFrame {
    pub fn new(request: RunFrame, pid: i32) -> RunningFrame {
        RunningFrame {
            request,
            pid,
            start_time: SystemTime::now(),
            started: Instant::now(),
            progress: Mutex::new(Progress {
                state: RunState::Running,
                exit_code: None,
                rusage: FrameRusage::default(),
                kill_requested: false,
                sample: None,
                max_rss: 0,
                max_vsize: 0,
            }),
        }
    }

    /// A frame whose exec never happened. Terminal from birth, exit 255.
    pub fn failed_to_launch(request: RunFrame) -> RunningFrame {
        let frame = RunningFrame::new(request, 0);
        {
            let mut p = frame.progress.lock().unwrap();
            p.state = RunState::FailedToLaunch;
            p.exit_code = Some(EXIT_FAILED_LAUNCH);
        }
        frame
    }

    pub fn state(&self) -> RunState {
        self.progress.lock().unwrap().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.progress.lock().unwrap().exit_code
    }

    pub fn rusage(&self) -> FrameRusage {
        self.progress.lock().unwrap().rusage.clone()
    }

    pub fn start_epoch(&self) -> i64 {
        self.start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Seconds since spawn, monotonic.
    pub fn run_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Mark that a kill was requested so the exit is classified KILLED.
    /// Returns false when the frame was already asked to die.
    pub fn request_kill(&self) -> bool {
        let mut p = self.progress.lock().unwrap();
        let first = !p.kill_requested;
        p.kill_requested = true;
        first
    }

    /// Record the terminal state exactly once. Later calls are ignored.
    pub fn complete(&self, record: &ExitRecord, real_time: f64) {
        let mut p = self.progress.lock().unwrap();
        if p.state.is_terminal() {
            return;
        }
        p.state = if p.kill_requested {
            RunState::Killed
        } else {
            RunState::Exited
        };
        p.exit_code = Some(record.exit_code);
        p.rusage = FrameRusage {
            user_time: record.user_time,
            system_time: record.system_time,
            real_time,
            max_rss_kb: record.max_rss_kb,
        };
    }

    /// Atomic swap of the latest sample, carrying the running maxima
    /// forward so max_rss and max_vsize never decrease.
    pub fn publish_sample(&self, mut sample: ProcSample) {
        let mut p = self.progress.lock().unwrap();
        p.max_rss = p.max_rss.max(sample.rss);
        p.max_vsize = p.max_vsize.max(sample.vsize);
        sample.max_rss = p.max_rss;
        sample.max_vsize = p.max_vsize;
        p.sample = Some(std::sync::Arc::new(sample));
    }

    pub fn last_sample(&self) -> Option<std::sync::Arc<ProcSample>> {
        self.progress.lock().unwrap().sample.clone()
    }
}

/// Send `signal` to the frame's whole session via its process group.
pub fn signal_session(pid: i32, signal: Signal) -> nix::Result<()> {
    killpg(Pid::from_raw(pid), signal)
}

/// The spawned child's pid and its output pipes, ready for async reads.
pub struct SpawnedChild {
    pub pid: i32,
    pub stdout: pipe::Receiver,
    pub stderr: pipe::Receiver,
}

/// Fork and exec a frame command.
///
/// In the child, before exec: apply the niceness increment, pin to the
/// requested cores, become a session leader, and drop to the requested
/// uid/gid when the daemon runs as root. Exec failures (ENOENT, EPERM,
/// a missing working directory) surface as an Err here.
pub fn spawn_child(
    argv: &[String],
    env: &HashMap<String, String>,
    cwd: Option<&str>,
    nice: i32,
    cpu_list: Option<Vec<usize>>,
    uid: u32,
    gid: u32,
) -> io::Result<SpawnedChild> {
    if argv.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
    }

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let become_user = uid != 0 && Uid::effective().is_root();
    unsafe {
        command.pre_exec(move || {
            if nice != 0 {
                // A failed renice is not worth failing the frame over.
                let _ = libc::nice(nice);
            }
            if let Some(cores) = &cpu_list {
                let mut set = CpuSet::new();
                for core in cores {
                    let _ = set.set(*core);
                }
                let _ = sched_setaffinity(Pid::from_raw(0), &set);
            }
            setsid().map_err(errno_to_io)?;
            if become_user {
                setgid(Gid::from_raw(gid)).map_err(errno_to_io)?;
                setuid(Uid::from_raw(uid)).map_err(errno_to_io)?;
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = child.id() as i32;
    let missing = || io::Error::new(io::ErrorKind::Other, "child pipe missing");
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;
    // The Child handle is dropped without wait(); the child watcher owns
    // the reap so rusage is not lost.
    drop(child);

    Ok(SpawnedChild {
        pid,
        stdout: pipe::Receiver::from_owned_fd(OwnedFd::from(stdout))?,
        stderr: pipe::Receiver::from_owned_fd(OwnedFd::from(stderr))?,
    })
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_are_split() {
        let frame = RunFrame {
            command: "/bin/echo hello world".into(),
            ..RunFrame::default()
        };
        assert_eq!(frame.argv(), vec!["/bin/echo", "hello", "world"]);
    }

    #[test]
    fn shell_syntax_is_wrapped() {
        let frame = RunFrame {
            command: "for i in 1 2 3; do echo $i; done".into(),
            ..RunFrame::default()
        };
        assert_eq!(
            frame.argv(),
            vec!["/bin/sh", "-c", "for i in 1 2 3; do echo $i; done"]
        );
    }

    #[test]
    fn cpu_list_parses_and_rejects_empty() {
        let mut frame = RunFrame::default();
        assert_eq!(frame.cpu_list(), None);
        frame
            .attributes
            .insert(ATTR_CPU_LIST.into(), "0,2,4".into());
        assert_eq!(frame.cpu_list(), Some(vec![0, 2, 4]));
        frame.attributes.insert(ATTR_CPU_LIST.into(), ",".into());
        assert_eq!(frame.cpu_list(), None);
    }

    #[test]
    fn log_path_falls_back_to_log_dir() {
        let frame = RunFrame {
            job_name: "job".into(),
            frame_name: "0001".into(),
            log_dir: "/tmp/logs".into(),
            ..RunFrame::default()
        };
        assert_eq!(frame.log_path(), PathBuf::from("/tmp/logs/job.0001.rqlog"));

        let frame = RunFrame {
            log_file: "/tmp/direct.rqlog".into(),
            ..frame
        };
        assert_eq!(frame.log_path(), PathBuf::from("/tmp/direct.rqlog"));
    }

    #[test]
    fn exit_code_only_when_terminal() {
        let frame = RunningFrame::new(RunFrame::default(), 42);
        assert_eq!(frame.state(), RunState::Running);
        assert_eq!(frame.exit_code(), None);

        let record = ExitRecord {
            pid: 42,
            exit_code: 7,
            ..ExitRecord::default()
        };
        frame.complete(&record, 1.5);
        assert_eq!(frame.state(), RunState::Exited);
        assert_eq!(frame.exit_code(), Some(7));
        assert_eq!(frame.rusage().real_time, 1.5);

        // A second completion is ignored.
        let record2 = ExitRecord {
            pid: 42,
            exit_code: 9,
            ..ExitRecord::default()
        };
        frame.complete(&record2, 9.0);
        assert_eq!(frame.exit_code(), Some(7));
    }

    #[test]
    fn kill_request_classifies_exit_as_killed() {
        let frame = RunningFrame::new(RunFrame::default(), 42);
        assert!(frame.request_kill());
        assert!(!frame.request_kill());
        frame.complete(
            &ExitRecord {
                pid: 42,
                exit_code: 143,
                exit_signal: Some(15),
                ..ExitRecord::default()
            },
            0.2,
        );
        assert_eq!(frame.state(), RunState::Killed);
    }

    #[test]
    fn failed_to_launch_is_terminal_with_255() {
        let frame = RunningFrame::failed_to_launch(RunFrame::default());
        assert_eq!(frame.state(), RunState::FailedToLaunch);
        assert_eq!(frame.exit_code(), Some(EXIT_FAILED_LAUNCH));
        assert_eq!(frame.pid, 0);
    }

    #[test]
    fn sample_maxima_never_decrease() {
        let frame = RunningFrame::new(RunFrame::default(), 42);
        frame.publish_sample(ProcSample {
            rss: 100,
            vsize: 1000,
            ..ProcSample::default()
        });
        frame.publish_sample(ProcSample {
            rss: 300,
            vsize: 500,
            ..ProcSample::default()
        });
        frame.publish_sample(ProcSample {
            rss: 50,
            vsize: 2000,
            ..ProcSample::default()
        });

        let sample = frame.last_sample().unwrap();
        assert_eq!(sample.rss, 50);
        assert_eq!(sample.max_rss, 300);
        assert_eq!(sample.vsize, 2000);
        assert_eq!(sample.max_vsize, 2000);
    }
}
