//! Core reservation and NIMBY state.
//!
//! Admission arithmetic is in core-hundredths: a host with N logical cores
//! has N * 100 units of capacity, and locking a core removes 100 units.

use std::sync::Mutex;

use crate::error::LaunchError;

/// Host-level action armed by a lifecycle RPC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostAction {
    Shutdown,
    Restart,
    Reboot,
}

impl HostAction {
    pub fn name(self) -> &'static str {
        match self {
            HostAction::Shutdown => "shutdown",
            HostAction::Restart => "restart",
            HostAction::Reboot => "reboot",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LockSnapshot {
    pub locked_cores: i32,
    pub nimby_enabled: bool,
    pub pending_action: Option<HostAction>,
}

struct State {
    locked_cores: i32,
    nimby_enabled: bool,
    pending_action: Option<HostAction>,
}

pub struct LockManager {
    total_cores: i32,
    state: Mutex<State>,
}

impl LockManager {
    pub fn new(total_cores: i32) -> LockManager {
        LockManager {
            total_cores,
            state: Mutex::new(State {
                locked_cores: 0,
                nimby_enabled: false,
                pending_action: None,
            }),
        }
    }

    pub fn total_cores(&self) -> i32 {
        self.total_cores
    }

    /// Admission check for a launch needing `requested` core-hundredths,
    /// given `booked` units already held by running frames.
    /// `user_logged_in` is only consulted when NIMBY applies, because the
    /// answer requires a scan of host state.
    pub fn admit(
        &self,
        requested: i32,
        booked: i32,
        ignore_nimby: bool,
        user_logged_in: impl FnOnce() -> bool,
    ) -> Result<(), LaunchError> {
        let state = self.state.lock().unwrap();
        if let Some(action) = state.pending_action {
            return Err(LaunchError::PendingHostAction(action.name()));
        }
        let available = (self.total_cores - state.locked_cores) * 100 - booked;
        if requested > available {
            return Err(LaunchError::InsufficientCores {
                requested,
                available,
            });
        }
        if state.nimby_enabled && !ignore_nimby {
            // The scan runs with the lock held; it is a handful of reads and
            // only on the NIMBY path.
            if user_logged_in() {
                return Err(LaunchError::NimbyLocked);
            }
        }
        Ok(())
    }

    pub fn lock(&self, cores: i32) {
        let mut state = self.state.lock().unwrap();
        state.locked_cores = (state.locked_cores + cores.max(0)).min(self.total_cores);
    }

    pub fn unlock(&self, cores: i32) {
        let mut state = self.state.lock().unwrap();
        state.locked_cores = (state.locked_cores - cores.max(0)).max(0);
    }

    pub fn lock_all(&self) {
        self.state.lock().unwrap().locked_cores = self.total_cores;
    }

    /// Unlock every core. Also cancels a pending idle action, which is how
    /// the dispatcher aborts an armed idle shutdown or restart.
    /// Returns the cancelled action, if any.
    pub fn unlock_all(&self) -> Option<HostAction> {
        let mut state = self.state.lock().unwrap();
        state.locked_cores = 0;
        state.pending_action.take()
    }

    pub fn set_nimby(&self, enabled: bool) {
        self.state.lock().unwrap().nimby_enabled = enabled;
    }

    pub fn nimby_enabled(&self) -> bool {
        self.state.lock().unwrap().nimby_enabled
    }

    /// Arm a host action and lock all cores so no new work is admitted.
    pub fn arm_action(&self, action: HostAction) {
        let mut state = self.state.lock().unwrap();
        state.pending_action = Some(action);
        state.locked_cores = self.total_cores;
    }

    pub fn pending_action(&self) -> Option<HostAction> {
        self.state.lock().unwrap().pending_action
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock().unwrap();
        LockSnapshot {
            locked_cores: state.locked_cores,
            nimby_enabled: state.nimby_enabled,
            pending_action: state.pending_action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admit(locks: &LockManager, requested: i32, booked: i32) -> Result<(), LaunchError> {
        locks.admit(requested, booked, false, || false)
    }

    #[test]
    fn capacity_is_total_minus_locked_in_hundredths() {
        let locks = LockManager::new(4);
        assert!(admit(&locks, 400, 0).is_ok());
        assert!(admit(&locks, 401, 0).is_err());
        assert!(admit(&locks, 100, 300).is_ok());
        assert!(admit(&locks, 101, 300).is_err());

        locks.lock(2);
        assert!(admit(&locks, 200, 0).is_ok());
        assert!(admit(&locks, 201, 0).is_err());
    }

    #[test]
    fn forty_percent_frames_third_is_refused() {
        // Scenario S3: three launches each wanting 40% of the host.
        let locks = LockManager::new(8);
        let per_frame = 8 * 40;
        assert!(admit(&locks, per_frame, 0).is_ok());
        assert!(admit(&locks, per_frame, per_frame).is_ok());
        let err = admit(&locks, per_frame, 2 * per_frame).unwrap_err();
        assert!(matches!(err, LaunchError::InsufficientCores { .. }));
    }

    #[test]
    fn lock_and_unlock_clamp() {
        let locks = LockManager::new(4);
        locks.lock(100);
        assert_eq!(locks.snapshot().locked_cores, 4);
        locks.unlock(1);
        assert_eq!(locks.snapshot().locked_cores, 3);
        locks.unlock(100);
        assert_eq!(locks.snapshot().locked_cores, 0);
        locks.lock(-5);
        assert_eq!(locks.snapshot().locked_cores, 0);
    }

    #[test]
    fn pending_action_refuses_launches() {
        let locks = LockManager::new(4);
        locks.arm_action(HostAction::Shutdown);
        let err = admit(&locks, 100, 0).unwrap_err();
        assert!(matches!(err, LaunchError::PendingHostAction("shutdown")));
        assert_eq!(locks.snapshot().locked_cores, 4);
    }

    #[test]
    fn unlock_all_cancels_pending_action() {
        let locks = LockManager::new(4);
        locks.arm_action(HostAction::Restart);
        assert_eq!(locks.unlock_all(), Some(HostAction::Restart));
        assert_eq!(locks.pending_action(), None);
        assert!(admit(&locks, 100, 0).is_ok());
    }

    #[test]
    fn nimby_blocks_only_when_user_present() {
        let locks = LockManager::new(4);
        locks.set_nimby(true);
        assert!(locks.admit(100, 0, false, || false).is_ok());
        let err = locks.admit(100, 0, false, || true).unwrap_err();
        assert!(matches!(err, LaunchError::NimbyLocked));
        // ignore_nimby bypasses the user check entirely.
        assert!(locks.admit(100, 0, true, || true).is_ok());
    }
}
