use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// In-process set of polls currently being scored.
#[derive(Debug, Clone, Default)]
pub struct PollLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PollLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for `poll_id`, or `None` if another run holds it.
    pub fn try_acquire(&self, poll_id: &str) -> Option<PollLease> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if held.insert(poll_id.to_string()) {
            Some(PollLease {
                poll_id: poll_id.to_string(),
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, poll_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(poll_id)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct PollLease {
    poll_id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl PollLease {
    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }
}

impl Drop for PollLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.poll_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let leases = PollLeases::new();
        let lease = leases.try_acquire("p1").unwrap();
        assert_eq!(lease.poll_id(), "p1");
        assert!(leases.is_held("p1"));
        assert!(leases.try_acquire("p1").is_none());
        assert!(leases.try_acquire("p2").is_some());

        drop(lease);
        assert!(!leases.is_held("p1"));
        assert!(leases.try_acquire("p1").is_some());
    }

    #[test]
    fn clones_share_state() {
        let leases = PollLeases::new();
        let other = leases.clone();
        let _lease = leases.try_acquire("p1").unwrap();
        assert!(other.try_acquire("p1").is_none());
    }
}
