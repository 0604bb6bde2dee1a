//! Limits how many surveys are extracted at the same time.
//!
//! The default of one slot gives the plain sequential run. Larger limits are
//! safe because the shared [`AuthSession`](crate::hotjar::AuthSession) logs in
//! single-flight.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// SurveyScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Semaphore-backed limiter for concurrent survey runs.
///
/// Permits are released when dropped.
#[derive(Clone)]
pub struct SurveyScheduler {
    sem: Arc<Semaphore>,
    max: usize,
}

impl Default for SurveyScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SurveyScheduler {
    /// Creates a scheduler with `max_concurrent` slots (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            sem: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<SurveyPermit, AppError> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("survey scheduler closed".into()))?;

        Ok(SurveyPermit {
            _permit: permit,
            max: self.max,
            sem: self.sem.clone(),
        })
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<SurveyPermit> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SurveyPermit {
                _permit: permit,
                max: self.max,
                sem: self.sem.clone(),
            })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max
    }

    pub fn active_surveys(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    pub fn available_slots(&self) -> usize {
        self.sem.available_permits()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SurveyPermit
// ─────────────────────────────────────────────────────────────────────────────

/// An occupied survey slot.
pub struct SurveyPermit {
    _permit: OwnedSemaphorePermit,
    max: usize,
    sem: Arc<Semaphore>,
}

impl SurveyPermit {
    /// Running surveys, this one included.
    pub fn active_surveys(&self) -> usize {
        self.max - self.sem.available_permits()
    }
}
