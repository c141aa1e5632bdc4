//! Peer Links
//!
//! Per-link state machine and reconnect backoff.
//!
//! ```text
//!  Discovered ──► Connecting ──► Connected ──► Active
//!                    ▲  │            │           │
//!                    │  ▼            ▼           ▼
//!                    └─ Disconnected ◄───────────┘
//! ```
//!
//! `Connected` means the socket is up; `Active` means the hello exchange
//! completed and admission passed.

use std::time::Duration;
use thiserror::Error;

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Address known, never dialed.
    Discovered,
    /// Dial in progress.
    Connecting,
    /// Socket open, handshake pending.
    Connected,
    /// Handshake done, exchanging batches.
    Active,
    /// Socket closed or dial failed.
    Disconnected,
}

/// Illegal link transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid link transition {from:?} -> {to:?}")]
pub struct LinkError {
    /// State before.
    pub from: LinkState,
    /// Requested state.
    pub to: LinkState,
}

impl LinkState {
    /// Whether `self -> next` is allowed.
    pub fn can_transition(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Active)
                | (Connected, Disconnected)
                | (Active, Disconnected)
                | (Disconnected, Connecting)
        )
    }
}

/// A tracked link to one remote address.
#[derive(Debug, Clone)]
pub struct Link {
    /// Remote `host:port`.
    pub addr: String,
    state: LinkState,
    failures: u32,
}

impl Link {
    /// A freshly discovered address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            state: LinkState::Discovered,
            failures: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Consecutive failed attempts since the last active session.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Move to `next`.
    pub fn transition(&mut self, next: LinkState) -> Result<(), LinkError> {
        if !self.state.can_transition(next) {
            return Err(LinkError { from: self.state, to: next });
        }
        match next {
            LinkState::Active => self.failures = 0,
            LinkState::Disconnected if self.state != LinkState::Active => {
                self.failures = self.failures.saturating_add(1);
            }
            _ => {}
        }
        self.state = next;
        Ok(())
    }
}

/// Reconnect schedule.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First retry delay.
    pub base_delay: Duration,
    /// Cap on the delay.
    pub max_delay: Duration,
    /// Failed attempts before the link is dropped.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Give up after this many failures.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut link = Link::new("127.0.0.1:9000");
        assert_eq!(link.state(), LinkState::Discovered);
        link.transition(LinkState::Connecting).unwrap();
        link.transition(LinkState::Connected).unwrap();
        link.transition(LinkState::Active).unwrap();
        link.transition(LinkState::Disconnected).unwrap();
        assert_eq!(link.failures(), 0);
        link.transition(LinkState::Connecting).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut link = Link::new("a:1");
        assert_eq!(
            link.transition(LinkState::Active),
            Err(LinkError { from: LinkState::Discovered, to: LinkState::Active })
        );
        link.transition(LinkState::Connecting).unwrap();
        assert!(link.transition(LinkState::Active).is_err());
        assert!(!LinkState::Disconnected.can_transition(LinkState::Active));
        assert!(!LinkState::Active.can_transition(LinkState::Connecting));
    }

    #[test]
    fn test_failures_count_until_active() {
        let mut link = Link::new("a:1");
        for _ in 0..3 {
            link.transition(LinkState::Connecting).unwrap();
            link.transition(LinkState::Disconnected).unwrap();
        }
        assert_eq!(link.failures(), 3);

        link.transition(LinkState::Connecting).unwrap();
        link.transition(LinkState::Connected).unwrap();
        link.transition(LinkState::Disconnected).unwrap();
        assert_eq!(link.failures(), 4);

        link.transition(LinkState::Connecting).unwrap();
        link.transition(LinkState::Connected).unwrap();
        link.transition(LinkState::Active).unwrap();
        assert_eq!(link.failures(), 0);
    }

    #[test]
    fn test_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
