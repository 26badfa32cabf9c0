//! Rebalance safe mode.
//!
//! While engaged, no node may act on authority derived from cluster state,
//! whether or not it is the leader. It is entered explicitly around
//! rebalance and hand-off windows and exited explicitly afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::cluster::clock::{Clock, SystemClock};
use crate::cluster::metrics;

/// Outcome of a processing check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingDecision {
    pub allowed: bool,
    pub reason: String,
}

impl ProcessingDecision {
    pub fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

#[derive(Debug, Default)]
struct Engagement {
    reason: String,
    since_ms: Option<u64>,
}

#[derive(Debug)]
pub struct RebalanceSafeModeGuard {
    scope: String,
    active: AtomicBool,
    engagement: RwLock<Engagement>,
    clock: Arc<dyn Clock>,
}

impl RebalanceSafeModeGuard {
    /// Guard labelled `scope` (usually the group id) in metrics and logs.
    pub fn new(scope: impl Into<String>) -> Self {
        Self::with_clock(scope, Arc::new(SystemClock))
    }

    pub fn with_clock(scope: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            scope: scope.into(),
            active: AtomicBool::new(false),
            engagement: RwLock::new(Engagement::default()),
            clock,
        }
    }

    /// Engage safe mode. Re-entering replaces the reason and start time.
    ///
    /// Returns `true` if this call moved the guard out of normal mode.
    pub fn enter(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut engagement = self
                .engagement
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            engagement.reason = reason.clone();
            engagement.since_ms = Some(self.clock.now_ms());
        }
        let entered = !self.active.swap(true, Ordering::SeqCst);
        if entered {
            metrics::set_safe_mode(&self.scope, true);
            warn!(scope = %self.scope, reason = %reason, "Entered safe mode");
        }
        entered
    }

    /// Leave safe mode. Returns `false` if it was not engaged.
    pub fn exit(&self) -> bool {
        let exited = self.active.swap(false, Ordering::SeqCst);
        *self
            .engagement
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Engagement::default();
        if exited {
            metrics::set_safe_mode(&self.scope, false);
            info!(scope = %self.scope, "Exited safe mode");
        }
        exited
    }

    #[inline]
    pub fn is_safe_mode(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Reason given to the last `enter`, empty when not engaged.
    pub fn reason(&self) -> String {
        self.engagement
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reason
            .clone()
    }

    /// Epoch millis of the last `enter`.
    pub fn since(&self) -> Option<u64> {
        self.engagement
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .since_ms
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn allow_processing(&self) -> ProcessingDecision {
        if self.is_safe_mode() {
            ProcessingDecision::denied(format!("safe-mode:{}", self.reason()))
        } else {
            ProcessingDecision::allowed("active")
        }
    }
}
