//! Tracking of user-initiated operations in flight against the room.
//!
//! Only one tracked operation may be open at a time, process-wide. Controls
//! that would start a conflicting operation watch
//! [`OperationTracker::subscribe`] and present themselves as busy while an
//! operation is open.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::{MatchError, Result};

/// Identifier of one tracked operation.
pub type OperationId = Uuid;

/// Process-wide registry of the in-flight room operation.
///
/// Cloning the tracker yields another handle to the same registry.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    current: Arc<watch::Sender<Option<OperationId>>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
        }
    }

    /// Open a new operation.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::OperationInProgress`] while another token is open.
    pub fn begin(&self) -> Result<OperationToken> {
        let id = Uuid::new_v4();
        let started = self.current.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(id);
            true
        });

        if !started {
            return Err(MatchError::OperationInProgress);
        }

        debug!("operation {id} started");
        Ok(OperationToken {
            id,
            tracker: Some(Arc::clone(&self.current)),
        })
    }

    /// Returns `true` while an operation is open.
    pub fn in_progress(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Observe the currently open operation, if any.
    pub fn subscribe(&self) -> watch::Receiver<Option<OperationId>> {
        self.current.subscribe()
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// An open operation. Ending or dropping the token releases the tracker.
#[derive(Debug)]
#[must_use = "dropping the token ends the operation immediately"]
pub struct OperationToken {
    id: OperationId,
    tracker: Option<Arc<watch::Sender<Option<OperationId>>>>,
}

impl OperationToken {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Returns `true` until [`end`](Self::end) has been called.
    pub fn is_open(&self) -> bool {
        self.tracker.is_some()
    }

    /// End the operation. Calling this more than once has no further effect.
    pub fn end(&mut self) {
        let Some(tracker) = self.tracker.take() else {
            return;
        };

        let id = self.id;
        let released = tracker.send_if_modified(|current| {
            if *current != Some(id) {
                return false;
            }
            *current = None;
            true
        });
        if released {
            debug!("operation {id} ended");
        }
    }
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn only_one_operation_at_a_time() {
        let tracker = OperationTracker::new();
        let token = tracker.begin().unwrap();
        assert!(tracker.in_progress());
        assert!(matches!(
            tracker.begin(),
            Err(MatchError::OperationInProgress)
        ));

        drop(token);
        assert!(!tracker.in_progress());
        assert!(tracker.begin().is_ok());
    }

    #[test]
    fn end_is_idempotent() {
        let tracker = OperationTracker::new();
        let mut token = tracker.begin().unwrap();
        token.end();
        token.end();
        assert!(!token.is_open());
        assert!(!tracker.in_progress());
    }

    #[test]
    fn clones_share_state() {
        let tracker = OperationTracker::new();
        let other = tracker.clone();
        let _token = tracker.begin().unwrap();
        assert!(other.in_progress());
        assert!(other.begin().is_err());
    }

    #[test]
    fn subscribers_see_the_open_operation() {
        let tracker = OperationTracker::new();
        let rx = tracker.subscribe();
        let token = tracker.begin().unwrap();
        assert_eq!(*rx.borrow(), Some(token.id()));
        drop(token);
        assert_eq!(*rx.borrow(), None);
    }

    #[test]
    fn token_survives_tracker_handle_drop() {
        let tracker = OperationTracker::new();
        let observer = tracker.subscribe();
        let token = tracker.begin().unwrap();
        drop(tracker);
        assert!(observer.borrow().is_some());
        drop(token);
        assert!(observer.borrow().is_none());
    }
}
