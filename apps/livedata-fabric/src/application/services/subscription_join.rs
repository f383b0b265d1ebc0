//! N-way Subscription Join
//!
//! Folds the asynchronous outcomes of one logical subscription request
//! across N constituent providers into a single result: failure as soon as
//! any constituent fails (the first observed failure wins), success only
//! when every constituent succeeded. The result is released exactly once,
//! after the last constituent has reported.

use parking_lot::Mutex;

use crate::application::ports::{SubscriptionFailure, SubscriptionResult};

#[derive(Debug)]
struct JoinState {
    pending: usize,
    first_failure: Option<SubscriptionFailure>,
}

/// Pending-count join for one logical subscription request.
///
/// Safe to record from any task in any order.
#[derive(Debug)]
pub struct SubscriptionJoin {
    state: Mutex<JoinState>,
}

impl SubscriptionJoin {
    /// Create a join expecting `constituents` outcomes.
    #[must_use]
    pub fn new(constituents: usize) -> Self {
        Self {
            state: Mutex::new(JoinState {
                pending: constituents,
                first_failure: None,
            }),
        }
    }

    /// Fold one constituent's outcome.
    ///
    /// A failure is attributed to `source`, the reporting constituent, and
    /// keeps that constituent's reason. Returns the aggregate result for
    /// the call that brings the pending count to zero and `None` for every
    /// other call.
    pub fn record(&self, source: &str, result: SubscriptionResult) -> Option<SubscriptionResult> {
        let mut state = self.state.lock();

        if state.pending == 0 {
            tracing::warn!(
                source,
                "Subscription outcome arrived after the join completed, ignoring"
            );
            return None;
        }

        if let Err(failure) = result
            && state.first_failure.is_none()
        {
            state.first_failure = Some(SubscriptionFailure::new(source, failure.reason));
        }

        state.pending -= 1;
        if state.pending > 0 {
            return None;
        }

        Some(state.first_failure.take().map_or(Ok(()), Err))
    }

    /// Outcomes still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }
}
