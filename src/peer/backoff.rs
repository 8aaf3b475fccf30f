//! Redial pacing for outbound peer links

use std::time::Duration;

use uuid::Uuid;

/// Pacing for redialing a configured peer address
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed dial
    pub initial: Duration,
    /// Upper bound on any single delay
    pub ceiling: Duration,
    /// Share of each delay that is randomized, from 0.0 to 1.0
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

/// Attempt counter for one dial loop
///
/// Each failed dial doubles the nominal delay up to the ceiling. An
/// established session starts the sequence over.
#[derive(Debug, Clone)]
pub struct Redial {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Redial {
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Dials made since the last established session
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for `attempt` before jitter
    #[must_use]
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.policy
            .initial
            .saturating_mul(factor)
            .min(self.policy.ceiling)
    }

    /// Delay before the next dial; advances the attempt counter
    ///
    /// The randomized share is taken off the nominal delay, so a delay
    /// never exceeds the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        nominal.mul_f64(jitter.mul_add(-unit_random(), 1.0))
    }

    /// A session came up; the next failure redials at the initial delay
    pub fn session_established(&mut self) {
        self.attempt = 0;
    }
}

/// Uniform value in `[0, 1]` from the random bits of a v4 UUID
fn unit_random() -> f64 {
    let bits = u32::try_from(Uuid::new_v4().as_u128() >> 96).unwrap_or(0);
    f64::from(bits) / f64::from(u32::MAX)
}
