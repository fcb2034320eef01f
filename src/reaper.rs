//! Process-wide child watcher.
//!
//! Children are reaped with `wait4(pid, WNOHANG)` so resource usage arrives
//! atomically with the exit status, and the pair is delivered together in
//! the completion value handed to whoever registered interest.
//!
//! Reaping is driven by a SIGCHLD stream with a coarse fallback poll, so a
//! coalesced or lost signal can never wedge a frame. A child that was
//! already reaped by some other path reports exit code 255 and zero rusage.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Exit status and resource usage captured at reap time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitRecord {
    pub pid: i32,
    /// Exit code; 128 + signal for signal deaths, 255 when the real status
    /// was lost to an external reap.
    pub exit_code: i32,
    /// Terminating signal, when the child died to one.
    pub exit_signal: Option<i32>,
    /// User CPU seconds from rusage.
    pub user_time: f64,
    /// System CPU seconds from rusage.
    pub system_time: f64,
    /// Peak resident set in kilobytes from rusage.
    pub max_rss_kb: u64,
}

struct WatchMap {
    interest: HashMap<i32, oneshot::Sender<ExitRecord>>,
}

/// Handle to the reaping service. Cloneable; all clones share one watch map
/// and one background task.
#[derive(Clone)]
pub struct ChildWatcher {
    shared: Arc<Mutex<WatchMap>>,
}

impl ChildWatcher {
    /// Install the watcher on the current runtime. The background task runs
    /// for the life of the process.
    pub fn spawn() -> io::Result<ChildWatcher> {
        let watcher = ChildWatcher {
            shared: Arc::new(Mutex::new(WatchMap {
                interest: HashMap::new(),
            })),
        };

        let mut sigchld = signal(SignalKind::child())?;
        let shared = watcher.shared.clone();
        tokio::spawn(async move {
            let mut fallback = tokio::time::interval(Duration::from_millis(500));
            fallback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sigchld.recv() => {}
                    _ = fallback.tick() => {}
                }
                reap_pending(&shared);
            }
        });

        Ok(watcher)
    }

    /// Record interest in `pid`. The returned future resolves exactly once
    /// with the exit record; dropping it is equivalent to `forget`.
    pub fn register(&self, pid: i32) -> oneshot::Receiver<ExitRecord> {
        let (tx, rx) = oneshot::channel();
        let mut map = self.shared.lock().unwrap();
        if map.interest.insert(pid, tx).is_some() {
            warn!(pid, "replacing existing reap interest for pid");
        }
        rx
    }

    /// Discard interest in `pid`; a pending reap result is dropped.
    pub fn forget(&self, pid: i32) {
        self.shared.lock().unwrap().interest.remove(&pid);
    }

    #[cfg(test)]
    fn watched(&self) -> usize {
        self.shared.lock().unwrap().interest.len()
    }
}

fn reap_pending(shared: &Arc<Mutex<WatchMap>>) {
    let pids: Vec<i32> = {
        let map = shared.lock().unwrap();
        map.interest.keys().copied().collect()
    };

    for pid in pids {
        if let Some(record) = try_reap(pid) {
            let sender = shared.lock().unwrap().interest.remove(&pid);
            if let Some(sender) = sender {
                debug!(
                    pid,
                    exit_code = record.exit_code,
                    user_time = record.user_time,
                    system_time = record.system_time,
                    "reaped child"
                );
                let _ = sender.send(record);
            }
        }
    }
}

/// One non-blocking wait4. None means the child is still running.
fn try_reap(pid: i32) -> Option<ExitRecord> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { mem::zeroed() };
    let rc = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut usage) };

    if rc == pid {
        return Some(decode(pid, status, &usage));
    }
    if rc == 0 {
        return None;
    }
    // wait4 failed. ECHILD means the child was reaped by another path and
    // the real status is unrecoverable; report 255 with zero rusage.
    let errno = io::Error::last_os_error().raw_os_error();
    if errno == Some(libc::ECHILD) {
        warn!(pid, "child already reaped elsewhere, reporting exit code 255");
        return Some(ExitRecord {
            pid,
            exit_code: 255,
            ..ExitRecord::default()
        });
    }
    warn!(pid, ?errno, "wait4 failed");
    None
}

fn decode(pid: i32, status: libc::c_int, usage: &libc::rusage) -> ExitRecord {
    let (exit_code, exit_signal) = if libc::WIFEXITED(status) {
        (libc::WEXITSTATUS(status), None)
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        (128 + sig, Some(sig))
    } else {
        (255, None)
    };

    ExitRecord {
        pid,
        exit_code,
        exit_signal,
        user_time: timeval_seconds(&usage.ru_utime),
        system_time: timeval_seconds(&usage.ru_stime),
        max_rss_kb: usage.ru_maxrss.max(0) as u64,
    }
}

fn timeval_seconds(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    async fn wait_record(rx: oneshot::Receiver<ExitRecord>) -> ExitRecord {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("reap timed out")
            .expect("watcher dropped interest")
    }

    #[tokio::test]
    async fn reaps_exit_zero_with_rusage() {
        let watcher = ChildWatcher::spawn().unwrap();
        let child = Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        // The Child is dropped without wait(); the watcher owns the reap.
        drop(child);

        let record = wait_record(watcher.register(pid)).await;
        assert_eq!(record.pid, pid);
        assert_eq!(record.exit_code, 0);
        assert_eq!(record.exit_signal, None);
        assert_eq!(watcher.watched(), 0);
    }

    #[tokio::test]
    async fn reaps_nonzero_exit() {
        let watcher = ChildWatcher::spawn().unwrap();
        let child = Command::new("/bin/sh").args(["-c", "exit 3"]).spawn().unwrap();
        let pid = child.id() as i32;
        drop(child);

        let record = wait_record(watcher.register(pid)).await;
        assert_eq!(record.exit_code, 3);
    }

    #[tokio::test]
    async fn signal_death_reports_128_plus_signal() {
        let watcher = ChildWatcher::spawn().unwrap();
        let child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        drop(child);

        let rx = watcher.register(pid);
        unsafe { libc::kill(pid, libc::SIGKILL) };
        let record = wait_record(rx).await;
        assert_eq!(record.exit_signal, Some(libc::SIGKILL));
        assert_eq!(record.exit_code, 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn externally_reaped_child_reports_255() {
        let watcher = ChildWatcher::spawn().unwrap();
        let mut child = Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let record = wait_record(watcher.register(pid)).await;
        assert_eq!(record.exit_code, 255);
        assert_eq!(record.user_time, 0.0);
        assert_eq!(record.max_rss_kb, 0);
    }

    #[tokio::test]
    async fn forget_drops_interest() {
        let watcher = ChildWatcher::spawn().unwrap();
        let child = Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        drop(child);

        let rx = watcher.register(pid);
        watcher.forget(pid);
        assert_eq!(watcher.watched(), 0);
        // The sender side is gone, so the receiver errors instead of
        // resolving.
        assert!(tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .is_err());
    }
}
