//! Time source

use chrono::{DateTime, SubsecRound, Utc};

/// Source of "now" for reconciliation and lifecycle decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, truncated to the precision timestamps are stored with
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
