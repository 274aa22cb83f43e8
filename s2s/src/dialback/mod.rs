//! Server Dialback state machine (spec §4.4).
//!
//! The state machine itself is a pure, small enum; it is driven by
//! [`crate::registry::Connection`] which owns one `RouteState` per route key
//! carried over that connection, and by [`crate::mainloop`] which reacts to
//! state transitions by draining or bouncing the matching outbound queue.

pub mod key;
pub mod stanza;

use tokio::time::Instant;

pub use key::{dialback_key, Secret};
pub use stanza::{DbResult, DbType, DbVerify};

/// Per-(connection, route) dialback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// We intend to authorize this route; the next action is to send a
    /// `<db:result>` with a computed key.
    Want,
    /// Key sent (outgoing) or key received and verify dispatched
    /// (incoming); `started_at` arms the dialback timeout.
    InProgress { started_at: Instant },
    /// The peer returned `type='valid'`: stanzas may flow.
    Valid,
    /// Terminal failure for this route.
    Invalid,
}

impl RouteState {
    pub fn is_valid(&self) -> bool {
        matches!(self, RouteState::Valid)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, RouteState::InProgress { .. })
    }

    /// True once the `check_queue` timeout has elapsed since this state
    /// entered `InProgress`. Non-`InProgress` states never time out this
    /// way (dead connections are reaped by other sweep phases).
    pub fn timed_out(&self, now: Instant, check_queue: std::time::Duration) -> bool {
        match self {
            RouteState::InProgress { started_at } => now.saturating_duration_since(*started_at) >= check_queue,
            _ => false,
        }
    }

    pub fn begin_in_progress(now: Instant) -> Self {
        RouteState::InProgress { started_at: now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn in_progress_times_out_after_check_queue() {
        let start = Instant::now();
        let state = RouteState::begin_in_progress(start);
        assert!(!state.timed_out(start, Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(state.timed_out(Instant::now(), Duration::from_secs(60)));
    }

    #[test]
    fn want_and_valid_never_time_out() {
        let now = Instant::now();
        assert!(!RouteState::Want.timed_out(now, Duration::from_secs(0)));
        assert!(!RouteState::Valid.timed_out(now, Duration::from_secs(0)));
        assert!(!RouteState::Invalid.timed_out(now, Duration::from_secs(0)));
    }
}
