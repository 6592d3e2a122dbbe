//! Network connectivity tracking and the reference-counted Wi-Fi lock.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// What the service should do after a connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityAction {
    /// Connection dropped while playing
    Pause,
    /// Connection came back
    TogglePause,
}

/// Connected/disconnected flag fed from host network broadcasts.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    connected: bool,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self { connected: true }
    }
}

impl ConnectivityMonitor {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Record a connectivity broadcast.
    ///
    /// Only real transitions produce an action: losing the network while
    /// connected (ignoring failover hand-offs) and regaining it while
    /// disconnected.
    pub fn on_change(
        &mut self,
        no_connectivity: bool,
        is_failover: bool,
        active_connected: bool,
    ) -> Option<ConnectivityAction> {
        if no_connectivity && self.connected && !is_failover {
            self.connected = false;
            return Some(ConnectivityAction::Pause);
        }
        if !no_connectivity && !self.connected && active_connected {
            self.connected = true;
            return Some(ConnectivityAction::TogglePause);
        }
        None
    }
}

/// Host Wi-Fi performance lock.
pub trait WifiLock: Send {
    fn acquire(&mut self, high_perf: bool);

    fn release(&mut self);
}

/// Lock for hosts without Wi-Fi power management.
#[derive(Debug, Default)]
pub struct NoopWifiLock;

impl WifiLock for NoopWifiLock {
    fn acquire(&mut self, _high_perf: bool) {}

    fn release(&mut self) {}
}

struct LockState {
    lock: Box<dyn WifiLock>,
    refs: usize,
    wanted: bool,
    held: bool,
    high_perf: bool,
}

impl LockState {
    fn reevaluate(&mut self) {
        let should_hold = self.refs > 0 && self.wanted;
        if should_hold && !self.held {
            debug!(target: "player::connectivity", refs = self.refs, "Acquiring Wi-Fi lock");
            self.lock.acquire(self.high_perf);
            self.held = true;
        } else if !should_hold && self.held {
            debug!(target: "player::connectivity", "Releasing Wi-Fi lock");
            self.lock.release();
            self.held = false;
        }
    }
}

/// Reference-counted owner of the Wi-Fi lock.
///
/// The lock is held iff at least one consumer is registered and the user
/// preference asks for it. Clones share the same count.
#[derive(Clone)]
pub struct WifiLockManager {
    state: Arc<Mutex<LockState>>,
}

impl WifiLockManager {
    pub fn new(lock: Box<dyn WifiLock>, wanted: bool, high_perf: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                lock,
                refs: 0,
                wanted,
                held: false,
                high_perf,
            })),
        }
    }

    pub fn inc_ref(&self) {
        let mut state = self.state.lock();
        state.refs += 1;
        state.reevaluate();
    }

    pub fn dec_ref(&self) {
        let mut state = self.state.lock();
        state.refs = state.refs.saturating_sub(1);
        state.reevaluate();
    }

    /// Apply a changed preference immediately.
    pub fn set_wanted(&self, wanted: bool) {
        let mut state = self.state.lock();
        state.wanted = wanted;
        state.reevaluate();
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    /// Register a consumer for as long as the guard lives.
    pub fn guard(&self) -> NetworkGuard {
        self.inc_ref();
        NetworkGuard {
            manager: self.clone(),
        }
    }
}

impl std::fmt::Debug for WifiLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WifiLockManager")
            .field("refs", &state.refs)
            .field("wanted", &state.wanted)
            .field("held", &state.held)
            .finish()
    }
}

/// One registered network consumer. Dropping it releases the reference.
#[derive(Debug)]
pub struct NetworkGuard {
    manager: WifiLockManager,
}

impl Drop for NetworkGuard {
    fn drop(&mut self) {
        self.manager.dec_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingWifiLock;

    #[test]
    fn test_loss_pauses_once() {
        let mut monitor = ConnectivityMonitor::default();
        assert_eq!(monitor.on_change(true, false, false), Some(ConnectivityAction::Pause));
        assert!(!monitor.is_connected());
        assert_eq!(monitor.on_change(true, false, false), None);
    }

    #[test]
    fn test_failover_is_ignored() {
        let mut monitor = ConnectivityMonitor::default();
        assert_eq!(monitor.on_change(true, true, false), None);
        assert!(monitor.is_connected());
    }

    #[test]
    fn test_restore_toggles_pause() {
        let mut monitor = ConnectivityMonitor::default();
        monitor.on_change(true, false, false);
        // Not yet connected on the active network
        assert_eq!(monitor.on_change(false, false, false), None);
        assert_eq!(
            monitor.on_change(false, false, true),
            Some(ConnectivityAction::TogglePause)
        );
        assert_eq!(monitor.on_change(false, false, true), None);
    }

    #[test]
    fn test_lock_follows_ref_count_across_zero() {
        let lock = RecordingWifiLock::default();
        let manager = WifiLockManager::new(Box::new(lock.clone()), true, false);

        manager.inc_ref();
        manager.inc_ref();
        assert!(manager.is_held());
        manager.dec_ref();
        assert!(manager.is_held());
        manager.dec_ref();
        assert!(!manager.is_held());

        assert_eq!(lock.acquired(), 1);
        assert_eq!(lock.released(), 1);
    }

    #[test]
    fn test_preference_reevaluates_immediately() {
        let lock = RecordingWifiLock::default();
        let manager = WifiLockManager::new(Box::new(lock.clone()), false, true);

        let guard = manager.guard();
        assert!(!manager.is_held());
        manager.set_wanted(true);
        assert!(manager.is_held());
        assert_eq!(lock.last_high_perf(), Some(true));
        manager.set_wanted(false);
        assert!(!manager.is_held());

        drop(guard);
        assert_eq!(manager.refs(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = WifiLockManager::new(Box::new(NoopWifiLock), true, false);
        {
            let _a = manager.guard();
            let _b = manager.guard();
            assert_eq!(manager.refs(), 2);
        }
        assert_eq!(manager.refs(), 0);
        assert!(!manager.is_held());
    }
}
