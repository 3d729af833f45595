//! Timing knobs shared by every store, request and editor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts and cooldowns, in milliseconds.
///
/// Every [`CollectionStore`](crate::store::CollectionStore) reads its timers
/// from one of these instead of hard-coding them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// How long a refresh may stay in flight before it is abandoned
    pub refresh_timeout_ms: u64,
    /// How long to wait for an acknowledgment
    pub ack_timeout_ms: u64,
    /// How long a guarded action stays locked after it finishes
    pub guard_cooldown_ms: u64,
    /// How long a row stays busy after its mutation settles
    pub row_cooldown_ms: u64,
    /// Quiet period before an editor change is sent upward
    pub editor_throttle_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            refresh_timeout_ms: 10_000,
            ack_timeout_ms: 7_000,
            guard_cooldown_ms: 280,
            row_cooldown_ms: 700,
            editor_throttle_ms: 100,
        }
    }
}

impl SyncTuning {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn guard_cooldown(&self) -> Duration {
        Duration::from_millis(self.guard_cooldown_ms)
    }

    pub fn row_cooldown(&self) -> Duration {
        Duration::from_millis(self.row_cooldown_ms)
    }

    pub fn editor_throttle(&self) -> Duration {
        Duration::from_millis(self.editor_throttle_ms)
    }

    /// Upper bound on how long a running guarded action may hold its key.
    ///
    /// A guarded request finishes within the ack timeout, so anything still
    /// holding the key past this point is treated as lost.
    pub fn guard_hold_limit(&self) -> Duration {
        self.ack_timeout() + self.refresh_timeout()
    }
}

/// Reconnection behaviour of the websocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// First delay after a dropped connection
    pub initial_delay_ms: u64,
    /// Ceiling for the exponential backoff
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a fraction (0.5 = ±50%)
    pub jitter: f64,
    /// Limit for establishing a connection and completing the handshake
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.5,
            connect_timeout_ms: 20_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based), without
    /// jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let tuning = SyncTuning::default();
        assert_eq!(tuning.refresh_timeout(), Duration::from_secs(10));
        assert_eq!(tuning.ack_timeout(), Duration::from_secs(7));
        assert_eq!(tuning.guard_cooldown(), Duration::from_millis(280));
        assert_eq!(tuning.row_cooldown(), Duration::from_millis(700));
        assert_eq!(tuning.editor_throttle(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_tuning_fills_defaults() {
        let tuning: SyncTuning = serde_json::from_str(r#"{"ack_timeout_ms": 3000}"#).unwrap();
        assert_eq!(tuning.ack_timeout_ms, 3000);
        assert_eq!(tuning.refresh_timeout_ms, 10_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }
}
