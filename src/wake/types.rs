//! Wake request and result types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::devices::DeviceId;

/// Unique per wake request; retries reuse it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to power on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRequest {
    pub device_id: DeviceId,
    pub request_id: RequestId,
    pub issued_at: DateTime<Utc>,
}

impl WakeRequest {
    /// New request with a fresh ID
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            request_id: RequestId::generate(),
            issued_at: Utc::now(),
        }
    }
}

/// How a wake attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOutcome {
    /// The magic packet went out
    Sent,
    /// No peer able to send it is connected
    UnreachablePeer,
    /// The capable peer did not answer in time
    TimedOut,
    /// The wake transport reported an error
    CapabilityFailed,
}

impl WakeOutcome {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Sent)
    }

    /// Suggested next step for the user
    #[must_use]
    pub const fn hint(self) -> &'static str {
        match self {
            Self::Sent => "wake signal sent",
            Self::UnreachablePeer => "pair or open the phone app first",
            Self::TimedOut => "no answer from the phone, try again",
            Self::CapabilityFailed => "the device did not accept the wake signal, try again",
        }
    }
}

impl fmt::Display for WakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::UnreachablePeer => write!(f, "unreachable_peer"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::CapabilityFailed => write!(f, "capability_failed"),
        }
    }
}

/// Outcome correlated to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeResult {
    pub request_id: RequestId,
    pub outcome: WakeOutcome,
}

impl WakeResult {
    #[must_use]
    pub const fn new(request_id: RequestId, outcome: WakeOutcome) -> Self {
        Self {
            request_id,
            outcome,
        }
    }
}
