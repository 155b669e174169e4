//! Bookkeeping for one fan-out run.
//!
//! A tracker is shared by every delivery task of a distribution. Each
//! recipient of the current pass resolves exactly once; whatever is still
//! pending when the pass finishes (never attempted after a cancel, or lost
//! to a failed task) is counted as failed so that
//! `successful + failed == total` holds for every terminal result.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::strategy::DistributionStrategy;
use crate::{
    error::{DeliveryError, DistributionError},
    types::{DistributionId, GroupId, UserId},
};

/// Lifecycle of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionStatus {
    /// Sends are being issued or awaited
    InProgress,
    /// Every recipient resolved
    Completed,
    /// Stopped early; unattempted recipients counted as failed
    Cancelled,
}

impl DistributionStatus {
    /// Whether the distribution has stopped issuing sends.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Aggregated outcome of a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionResult {
    /// Distribution id
    pub distribution_id: DistributionId,
    /// Group the message was sent to
    pub group_id: GroupId,
    /// Strategy used for the initial pass
    pub strategy: DistributionStrategy,
    /// Lifecycle state
    pub status: DistributionStatus,
    /// Number of recipients
    pub total_recipients: usize,
    /// Recipients delivered
    pub successful_deliveries: usize,
    /// Recipients not delivered
    pub failed_deliveries: usize,
    /// Recipients not delivered, sorted by id
    pub failed_recipients: Vec<UserId>,
    /// Wall-clock millis of start
    pub started_at: u64,
    /// Wall-clock millis of the last pass end, `None` while in progress
    pub completed_at: Option<u64>,
}

/// Progress snapshot published on every resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionProgress {
    /// Distribution id
    pub distribution_id: DistributionId,
    /// Strategy used for the initial pass
    pub strategy: DistributionStrategy,
    /// Number of recipients
    pub total: usize,
    /// Recipients resolved either way
    pub completed: usize,
    /// Recipients delivered
    pub successful: usize,
    /// Recipients not delivered
    pub failed: usize,
    /// Lifecycle state
    pub status: DistributionStatus,
}

struct TrackerState {
    status: DistributionStatus,
    successful: usize,
    failures: BTreeMap<UserId, DeliveryError>,
    pending: HashSet<UserId>,
    cancel: CancellationToken,
    completed_at: Option<u64>,
}

/// Shared state of one distribution.
pub(crate) struct DistributionTracker {
    id: DistributionId,
    group_id: GroupId,
    sender_id: UserId,
    message: Bytes,
    strategy: DistributionStrategy,
    total: usize,
    started_at: u64,
    state: Mutex<TrackerState>,
    progress: watch::Sender<DistributionProgress>,
}

impl DistributionTracker {
    pub(crate) fn new(
        id: DistributionId,
        group_id: GroupId,
        sender_id: UserId,
        message: Bytes,
        strategy: DistributionStrategy,
        recipients: &[UserId],
        started_at: u64,
    ) -> Self {
        let (progress, _) = watch::channel(DistributionProgress {
            distribution_id: id,
            strategy,
            total: recipients.len(),
            completed: 0,
            successful: 0,
            failed: 0,
            status: DistributionStatus::InProgress,
        });

        Self {
            id,
            group_id,
            sender_id,
            message,
            strategy,
            total: recipients.len(),
            started_at,
            state: Mutex::new(TrackerState {
                status: DistributionStatus::InProgress,
                successful: 0,
                failures: BTreeMap::new(),
                pending: recipients.iter().cloned().collect(),
                cancel: CancellationToken::new(),
                completed_at: None,
            }),
            progress,
        }
    }

    pub(crate) fn id(&self) -> DistributionId {
        self.id
    }

    pub(crate) fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub(crate) fn sender_id(&self) -> &UserId {
        &self.sender_id
    }

    pub(crate) fn message(&self) -> &Bytes {
        &self.message
    }

    pub(crate) fn strategy(&self) -> DistributionStrategy {
        self.strategy
    }

    // Never held across an await; a poisoned lock still holds consistent
    // counters since every mutation completes before unlocking.
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token of the current pass.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    /// Resolve one recipient of the current pass. Recipients not pending are
    /// ignored.
    pub(crate) fn record(&self, recipient: &UserId, outcome: Result<(), DeliveryError>) {
        let mut state = self.lock();
        if !state.pending.remove(recipient) {
            return;
        }

        match outcome {
            Ok(()) => {
                state.failures.remove(recipient);
                state.successful += 1;
            },
            Err(error) => {
                state.failures.insert(recipient.clone(), error);
            },
        }
        self.publish(&state);
    }

    /// End the current pass. Pending recipients become failures.
    pub(crate) fn finish(&self, now: u64) -> DistributionResult {
        let mut state = self.lock();
        let cancelled = state.cancel.is_cancelled();

        let pending: Vec<UserId> = state.pending.drain().collect();
        for recipient in pending {
            let error = if cancelled {
                DeliveryError::Cancelled
            } else {
                DeliveryError::Task("no outcome reported".to_string())
            };
            state.failures.insert(recipient, error);
        }

        state.status =
            if cancelled { DistributionStatus::Cancelled } else { DistributionStatus::Completed };
        state.completed_at = Some(now);
        debug_assert_eq!(state.successful + state.failures.len(), self.total);

        self.publish(&state);
        self.result_from(&state)
    }

    /// Request cancellation of the current pass.
    pub(crate) fn cancel(&self) -> Result<(), DistributionError> {
        let state = self.lock();
        if state.status.is_terminal() || state.cancel.is_cancelled() {
            return Err(DistributionError::AlreadyTerminal(self.id));
        }
        state.cancel.cancel();
        Ok(())
    }

    /// Start a retry pass over the current failures, returned sorted by id.
    pub(crate) fn begin_retry(&self) -> Result<Vec<UserId>, DistributionError> {
        let mut state = self.lock();
        if !state.status.is_terminal() {
            return Err(DistributionError::StillInProgress(self.id));
        }

        let failed: Vec<UserId> = state.failures.keys().cloned().collect();
        state.pending = failed.iter().cloned().collect();
        state.status = DistributionStatus::InProgress;
        state.cancel = CancellationToken::new();
        state.completed_at = None;
        self.publish(&state);
        Ok(failed)
    }

    pub(crate) fn result(&self) -> DistributionResult {
        self.result_from(&self.lock())
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.lock().status.is_terminal()
    }

    /// Terminal, with its last pass finished at or before `cutoff`.
    pub(crate) fn finished_by(&self, cutoff: u64) -> bool {
        let state = self.lock();
        state.status.is_terminal() && state.completed_at.is_some_and(|at| at <= cutoff)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DistributionProgress> {
        self.progress.subscribe()
    }

    /// During a retry pass the recipients being retried still count as
    /// failed until they succeed.
    fn publish(&self, state: &TrackerState) {
        self.progress.send_replace(DistributionProgress {
            distribution_id: self.id,
            strategy: self.strategy,
            total: self.total,
            completed: state.successful + state.failures.len(),
            successful: state.successful,
            failed: state.failures.len(),
            status: state.status,
        });
    }

    fn result_from(&self, state: &TrackerState) -> DistributionResult {
        DistributionResult {
            distribution_id: self.id,
            group_id: self.group_id.clone(),
            strategy: self.strategy,
            status: state.status,
            total_recipients: self.total,
            successful_deliveries: state.successful,
            failed_deliveries: state.failures.len(),
            failed_recipients: state.failures.keys().cloned().collect(),
            started_at: self.started_at,
            completed_at: state.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn tracker(recipients: &[&str]) -> DistributionTracker {
        let recipients: Vec<UserId> = recipients.iter().map(|r| UserId::from(*r)).collect();
        DistributionTracker::new(
            DistributionId(1),
            "g".into(),
            "sender".into(),
            Bytes::from_static(b"hi"),
            DistributionStrategy::Direct,
            &recipients,
            100,
        )
    }

    fn failure() -> DeliveryError {
        DeliveryError::Transport(TransportError::Unreachable("x".into()))
    }

    #[test]
    fn progress_tracks_each_resolution() {
        let tracker = tracker(&["a", "b", "c"]);
        let progress = tracker.subscribe();

        tracker.record(&"a".into(), Ok(()));
        tracker.record(&"b".into(), Err(failure()));

        let snapshot = progress.borrow().clone();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.successful, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.status, DistributionStatus::InProgress);
    }

    #[test]
    fn duplicate_outcomes_are_ignored() {
        let tracker = tracker(&["a"]);
        tracker.record(&"a".into(), Ok(()));
        tracker.record(&"a".into(), Err(failure()));
        tracker.record(&"stranger".into(), Ok(()));

        let result = tracker.finish(200);
        assert_eq!(result.successful_deliveries, 1);
        assert_eq!(result.failed_deliveries, 0);
    }

    #[test]
    fn cancelled_pass_counts_unattempted_as_failed() {
        let tracker = tracker(&["a", "b", "c"]);
        tracker.record(&"a".into(), Ok(()));
        tracker.cancel().unwrap();

        let result = tracker.finish(200);

        assert_eq!(result.status, DistributionStatus::Cancelled);
        assert_eq!(result.successful_deliveries + result.failed_deliveries, 3);
        assert_eq!(result.failed_recipients, vec![UserId::from("b"), UserId::from("c")]);
        assert_eq!(result.completed_at, Some(200));
    }

    #[test]
    fn cancel_after_finish_is_rejected() {
        let tracker = tracker(&["a"]);
        tracker.record(&"a".into(), Ok(()));
        tracker.finish(200);

        assert!(matches!(tracker.cancel(), Err(DistributionError::AlreadyTerminal(_))));
    }

    #[test]
    fn retry_moves_successes_out_of_failed() {
        let tracker = tracker(&["a", "b", "c"]);
        tracker.record(&"a".into(), Ok(()));
        tracker.record(&"b".into(), Err(failure()));
        tracker.record(&"c".into(), Err(failure()));
        tracker.finish(200);

        let retried = tracker.begin_retry().unwrap();
        assert_eq!(retried, vec![UserId::from("b"), UserId::from("c")]);

        tracker.record(&"b".into(), Ok(()));
        tracker.record(&"c".into(), Err(failure()));
        let result = tracker.finish(300);

        assert_eq!(result.successful_deliveries, 2);
        assert_eq!(result.failed_deliveries, 1);
        assert_eq!(result.failed_recipients, vec![UserId::from("c")]);
        assert_eq!(result.status, DistributionStatus::Completed);
    }

    #[test]
    fn only_finished_passes_count_as_finished() {
        let tracker = tracker(&["a"]);
        assert!(!tracker.finished_by(u64::MAX));

        tracker.finish(200);
        assert!(!tracker.finished_by(199));
        assert!(tracker.finished_by(200));

        tracker.begin_retry().unwrap();
        assert!(!tracker.finished_by(u64::MAX));
    }

    #[test]
    fn retry_while_in_progress_is_rejected() {
        let tracker = tracker(&["a"]);
        assert!(matches!(tracker.begin_retry(), Err(DistributionError::StillInProgress(_))));
    }
}
