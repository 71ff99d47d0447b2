use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, Default)]
struct DedupState {
    /// SHA of the most recent delivery that started a run.
    last_sha: Option<String>,
    in_flight: HashSet<String>,
}

/// Drops redundant deliveries for a commit.
///
/// GitHub sends several `check_run.created` events for one push (one per check
/// suite). A delivery starts a run only when its SHA differs from the SHA that
/// last started one and no run for it is in flight. Distinct SHAs run
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct DedupGuard {
    state: Arc<Mutex<DedupState>>,
}

impl DedupGuard {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically decide whether `sha` may start a run. The returned permit
    /// marks the run in flight until it is dropped.
    pub fn check_and_set(&self, sha: &str) -> Option<RunPermit> {
        let mut state = self.lock();
        if state.last_sha.as_deref() == Some(sha) || state.in_flight.contains(sha) {
            return None;
        }
        let previous = state.last_sha.replace(sha.to_string());
        state.in_flight.insert(sha.to_string());
        Some(RunPermit { state: self.state.clone(), sha: sha.to_string(), previous })
    }

    pub fn is_in_flight(&self, sha: &str) -> bool { self.lock().in_flight.contains(sha) }
}

/// Held by a measurement run for its whole lifetime.
#[derive(Debug)]
pub struct RunPermit {
    state: Arc<Mutex<DedupState>>,
    sha: String,
    /// `last_sha` before this permit was granted.
    previous: Option<String>,
}

impl RunPermit {
    pub fn sha(&self) -> &str { &self.sha }

    /// Give back a permit whose run never started, so a redelivery of the same
    /// commit is not mistaken for a duplicate.
    pub fn revoke(self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.last_sha.as_deref() == Some(self.sha.as_str()) {
            state.last_sha = self.previous.clone();
        }
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight.remove(&self.sha);
    }
}
