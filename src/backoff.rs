//! Shared exponential backoff policy for source and sink reconnection.
//!
//! Base 1s, factor 2, cap 30s, ±20% jitter — the numbers spec'd for CometD
//! reconnection (§4.D) and reused as-is for AMQP sink reconnection (§4.G),
//! which names "the same backoff schedule as 4.D".

use backon::ExponentialBuilder;
use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
pub const FACTOR: f32 = 2.0;

/// Per-publish retry budget for the Sink Manager (§4.G, §5, §7: "if repeated
/// beyond backoff budget per publish (default 30s)"). Unlike the CometD
/// client's `Budget` (bounded by the operator-configured
/// `source_connection_timeout`), this one is a fixed spec'd constant since
/// no config surface overrides it.
pub const SINK_PUBLISH_BUDGET: Duration = Duration::from_secs(30);

/// Build a fresh backoff iterator. Call again (instead of reusing an
/// exhausted one) whenever a connection attempt succeeds, so backoff
/// resets per spec §4.D ("A successful connect resets the backoff").
pub fn policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(BASE_DELAY)
        .with_max_delay(MAX_DELAY)
        .with_factor(FACTOR)
        .with_jitter()
        .without_max_times()
}

/// Tracks elapsed retry time against a budget (`source_connection_timeout`).
/// A budget of zero means "retry forever".
pub struct Budget {
    deadline: Option<std::time::Instant>,
}

impl Budget {
    pub fn new(seconds: u64) -> Self {
        if seconds == 0 {
            Budget { deadline: None }
        } else {
            Budget {
                deadline: Some(std::time::Instant::now() + Duration::from_secs(seconds)),
            }
        }
    }

    /// True once the budget has been exhausted. Always false for an
    /// infinite (zero-second) budget.
    pub fn expired(&self) -> bool {
        match self.deadline {
            None => false,
            Some(d) => std::time::Instant::now() >= d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_never_expires() {
        let b = Budget::new(0);
        assert!(!b.expired());
    }

    #[test]
    fn nonzero_budget_expires_after_deadline() {
        let b = Budget::new(0);
        assert!(!b.expired());
        // A budget constructed with an already-past deadline should report expired.
        let past = Budget {
            deadline: Some(std::time::Instant::now() - Duration::from_secs(1)),
        };
        assert!(past.expired());
    }
}
