//! The "provisioning in progress" flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared between the arrival monitor and the provisioner. At most one
/// [`RunTicket`] exists at any time.
#[derive(Debug, Default)]
pub struct RunState {
    active: AtomicBool,
}

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims the flag, or returns `None` if a run already holds it.
    pub fn try_begin(self: &Arc<Self>) -> Option<RunTicket> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunTicket {
                state: Arc::clone(self),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Proof that the holder owns the current run. Dropping it clears the flag,
/// whichever way the run ends.
#[derive(Debug)]
pub struct RunTicket {
    state: Arc<RunState>,
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.state.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_ticket_at_a_time() {
        let state = RunState::new();
        assert!(!state.is_active());

        let ticket = state.try_begin().unwrap();
        assert!(state.is_active());
        assert!(state.try_begin().is_none());

        drop(ticket);
        assert!(!state.is_active());
        assert!(state.try_begin().is_some());
    }

    #[test]
    fn panicking_holder_still_clears_the_flag() {
        let state = RunState::new();
        let cloned = state.clone();
        let result = std::thread::spawn(move || {
            let _ticket = cloned.try_begin().unwrap();
            panic!("boom");
        })
        .join();

        assert!(result.is_err());
        assert!(!state.is_active());
    }
}
