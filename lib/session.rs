//! The account session the core reports into.
//!
//! Bootstrapping and authorizing a session against the network is someone
//! else's job. The core only needs somewhere to raise the sticky
//! "low balance" flag when the backend rejects a write for lack of funds or
//! quota.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// What the core needs from an account session.
pub trait Session: Send + Sync + 'static {
    /// Record that the backend refused work for lack of balance or quota.
    fn report_low_balance(&self);

    /// Whether the low-balance flag has been raised.
    fn low_balance(&self) -> bool;
}

/// A session that only tracks the low-balance flag.
///
/// The flag is sticky: once raised it stays raised until [`clear`](Self::clear).
#[derive(Debug, Default)]
pub struct SessionState {
    low_balance: AtomicBool,
}

impl SessionState {
    /// A fresh session with the flag lowered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower the flag, e.g. after the account was topped up.
    pub fn clear(&self) {
        self.low_balance.store(false, Ordering::Release);
    }
}

impl Session for SessionState {
    fn report_low_balance(&self) {
        if !self.low_balance.swap(true, Ordering::AcqRel) {
            warn!("backend reported exhausted balance or quota; further writes will likely fail");
        }
    }

    fn low_balance(&self) -> bool {
        self.low_balance.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_balance_flag_is_sticky() {
        let session = SessionState::new();
        assert!(!session.low_balance());
        session.report_low_balance();
        session.report_low_balance();
        assert!(session.low_balance());
        session.clear();
        assert!(!session.low_balance());
    }
}
