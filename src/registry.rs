//! Index of running frames.
//!
//! One mutex guards the whole map; every mutation happens on the event
//! loop. A frame id and a live pid each map to at most one frame for the
//! frame's registry lifetime. Terminal frames stay queryable for a grace
//! period so the dispatcher can collect a late exit status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::LaunchError;
use crate::frame::{ProcSample, RunningFrame};

#[derive(Default)]
struct Inner {
    by_frame_id: HashMap<String, Arc<RunningFrame>>,
    by_pid: HashMap<i32, String>,
    by_resource_id: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct FrameRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl FrameRegistry {
    pub fn new() -> FrameRegistry {
        FrameRegistry::default()
    }

    /// Insert a frame, rejecting a duplicate frame id. Frames that never
    /// launched carry pid 0 and are not pid-indexed.
    pub fn insert(&self, frame: Arc<RunningFrame>) -> Result<(), LaunchError> {
        let mut inner = self.inner.lock().unwrap();
        let frame_id = frame.request.frame_id.clone();
        if inner.by_frame_id.contains_key(&frame_id) {
            return Err(LaunchError::AlreadyExists(frame_id));
        }
        if frame.pid > 0 {
            inner.by_pid.insert(frame.pid, frame_id.clone());
        }
        if !frame.request.resource_id.is_empty() {
            inner
                .by_resource_id
                .insert(frame.request.resource_id.clone(), frame_id.clone());
        }
        inner.by_frame_id.insert(frame_id, frame);
        Ok(())
    }

    pub fn contains(&self, frame_id: &str) -> bool {
        self.inner.lock().unwrap().by_frame_id.contains_key(frame_id)
    }

    pub fn get_by_frame_id(&self, frame_id: &str) -> Option<Arc<RunningFrame>> {
        self.inner.lock().unwrap().by_frame_id.get(frame_id).cloned()
    }

    pub fn get_by_pid(&self, pid: i32) -> Option<Arc<RunningFrame>> {
        let inner = self.inner.lock().unwrap();
        let frame_id = inner.by_pid.get(&pid)?;
        inner.by_frame_id.get(frame_id).cloned()
    }

    pub fn get_by_resource_id(&self, resource_id: &str) -> Option<Arc<RunningFrame>> {
        let inner = self.inner.lock().unwrap();
        let frame_id = inner.by_resource_id.get(resource_id)?;
        inner.by_frame_id.get(frame_id).cloned()
    }

    pub fn remove(&self, frame_id: &str) -> Option<Arc<RunningFrame>> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.by_frame_id.remove(frame_id)?;
        if frame.pid > 0 {
            inner.by_pid.remove(&frame.pid);
        }
        inner.by_resource_id.remove(&frame.request.resource_id);
        Some(frame)
    }

    /// Purge a terminal frame after the grace period. A frame that somehow
    /// left the terminal state is left alone.
    pub fn remove_terminal_after(&self, frame_id: &str, grace: Duration) {
        let registry = self.clone();
        let frame_id = frame_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let terminal = registry
                .get_by_frame_id(&frame_id)
                .map(|f| f.is_terminal())
                .unwrap_or(false);
            if terminal {
                debug!(frame_id = %frame_id, "purging terminal frame after grace period");
                registry.remove(&frame_id);
            }
        });
    }

    /// Every frame, terminal or not, for status reporting.
    pub fn list_all(&self) -> Vec<Arc<RunningFrame>> {
        self.inner.lock().unwrap().by_frame_id.values().cloned().collect()
    }

    pub fn list_running(&self) -> Vec<Arc<RunningFrame>> {
        self.inner
            .lock()
            .unwrap()
            .by_frame_id
            .values()
            .filter(|f| !f.is_terminal())
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.list_running().len()
    }

    /// Sum of booked core-hundredths over non-terminal frames.
    pub fn booked_units(&self) -> i32 {
        self.list_running()
            .iter()
            .map(|f| f.request.num_cores)
            .sum()
    }

    /// Session-leader pids of currently running frames; the sampler's roots
    /// of interest.
    pub fn running_root_pids(&self) -> Vec<i32> {
        self.list_running()
            .iter()
            .map(|f| f.pid)
            .filter(|pid| *pid > 0)
            .collect()
    }

    /// Hand a fresh sample to the frame whose session leader is `pid`.
    pub fn publish_sample(&self, pid: i32, sample: ProcSample) {
        if let Some(frame) = self.get_by_pid(pid) {
            frame.publish_sample(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RunFrame, RunState, RunningFrame};
    use crate::reaper::ExitRecord;

    fn frame(id: &str, pid: i32, cores: i32) -> Arc<RunningFrame> {
        Arc::new(RunningFrame::new(
            RunFrame {
                frame_id: id.into(),
                resource_id: format!("res-{}", id),
                num_cores: cores,
                ..RunFrame::default()
            },
            pid,
        ))
    }

    #[test]
    fn duplicate_frame_id_is_rejected() {
        let registry = FrameRegistry::new();
        registry.insert(frame("F1", 10, 100)).unwrap();
        let err = registry.insert(frame("F1", 11, 100)).unwrap_err();
        assert!(matches!(err, LaunchError::AlreadyExists(_)));
        // The first insert is unaffected.
        assert_eq!(registry.get_by_frame_id("F1").unwrap().pid, 10);
    }

    #[test]
    fn lookups_by_every_index() {
        let registry = FrameRegistry::new();
        registry.insert(frame("F1", 10, 100)).unwrap();
        assert_eq!(registry.get_by_frame_id("F1").unwrap().pid, 10);
        assert_eq!(
            registry.get_by_pid(10).unwrap().request.frame_id,
            "F1"
        );
        assert_eq!(
            registry.get_by_resource_id("res-F1").unwrap().pid,
            10
        );
        assert!(registry.get_by_frame_id("F2").is_none());
        assert!(registry.get_by_pid(11).is_none());
    }

    #[test]
    fn booked_units_ignore_terminal_frames() {
        let registry = FrameRegistry::new();
        let f1 = frame("F1", 10, 150);
        let f2 = frame("F2", 11, 50);
        registry.insert(f1.clone()).unwrap();
        registry.insert(f2).unwrap();
        assert_eq!(registry.booked_units(), 200);
        assert_eq!(registry.running_root_pids().len(), 2);

        f1.complete(
            &ExitRecord {
                pid: 10,
                exit_code: 0,
                ..ExitRecord::default()
            },
            1.0,
        );
        assert_eq!(f1.state(), RunState::Exited);
        assert_eq!(registry.booked_units(), 50);
        assert_eq!(registry.running_count(), 1);
        // Terminal frames remain queryable until purged.
        assert!(registry.get_by_frame_id("F1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_frames_purge_after_grace() {
        let registry = FrameRegistry::new();
        let f = frame("F1", 10, 100);
        registry.insert(f.clone()).unwrap();
        f.complete(
            &ExitRecord {
                pid: 10,
                exit_code: 0,
                ..ExitRecord::default()
            },
            1.0,
        );

        registry.remove_terminal_after("F1", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(registry.get_by_frame_id("F1").is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.get_by_frame_id("F1").is_none());
        assert!(registry.get_by_pid(10).is_none());
    }
}
