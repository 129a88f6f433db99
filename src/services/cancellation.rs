//! Cancellation registry for running jobs
//!
//! Cooperative cancellation with RAII-based cleanup via `JobGuard`. The
//! optimizer receives a token clone and polls it at phase boundaries and
//! inside the search loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// RAII guard that removes the job from the registry when dropped. Must
/// be kept alive for the duration of job processing.
pub struct JobGuard {
    job_id: Uuid,
    registry: CancellationRegistry,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

/// Thread-safe registry of active jobs and their cancellation tokens.
/// All operations are O(1) map lookups under a short lock.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    /// Register a running job. Returns the guard that keeps the entry
    /// alive and a token clone to thread into the optimizer.
    pub fn register(&self, job_id: Uuid) -> (JobGuard, CancellationToken) {
        let token = self
            .jobs
            .lock()
            .entry(job_id)
            .or_insert_with(CancellationToken::new)
            .clone();
        (
            JobGuard {
                job_id,
                registry: self.clone(),
            },
            token,
        )
    }

    /// Cancel a job. Returns true when the job was registered. Cancelling
    /// twice is idempotent.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.jobs.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Pre-register a cancelled token for a job still in the queue. When
    /// a worker picks the job up it sees the cancellation immediately.
    pub fn pre_cancel(&self, job_id: Uuid) {
        let token = CancellationToken::new();
        token.cancel();
        self.jobs.lock().insert(job_id, token);
    }

    /// Hot-path check used by workers before heavy phases
    pub fn is_cancelled(&self, job_id: &Uuid) -> bool {
        self.jobs
            .lock()
            .get(job_id)
            .map_or(false, |t| t.is_cancelled())
    }

    /// Remove a finished job. Called automatically by `JobGuard::drop`.
    pub fn remove(&self, job_id: &Uuid) {
        self.jobs.lock().remove(job_id);
    }

    /// Signal every registered job. Used during graceful shutdown.
    pub fn cancel_all(&self) {
        for token in self.jobs.lock().values() {
            token.cancel();
        }
    }

    #[cfg(test)]
    fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.lock().contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_is_cancelled_false() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        let (_guard, token) = reg.register(job_id);

        assert!(!reg.is_cancelled(&job_id));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_flips_registered_token() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        let (_guard, token) = reg.register(job_id);

        assert!(reg.cancel(&job_id));
        assert!(token.is_cancelled());
        assert!(reg.is_cancelled(&job_id));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        let (_guard, _token) = reg.register(job_id);

        assert!(reg.cancel(&job_id));
        assert!(reg.cancel(&job_id));
        assert!(reg.is_cancelled(&job_id));
    }

    #[test]
    fn test_cancel_unknown_returns_false() {
        let reg = CancellationRegistry::default();
        assert!(!reg.cancel(&Uuid::new_v4()));
    }

    #[test]
    fn test_pre_cancel_is_immediately_cancelled() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        reg.pre_cancel(job_id);

        assert!(reg.is_cancelled(&job_id));
        // A worker registering afterwards sees the cancelled token
        let (_guard, token) = reg.register(job_id);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_guard_drop_removes_entry() {
        let reg = CancellationRegistry::default();
        let job_id = Uuid::new_v4();

        {
            let (_guard, _token) = reg.register(job_id);
            assert!(reg.contains(&job_id));
        }

        assert!(!reg.contains(&job_id));
    }
}
