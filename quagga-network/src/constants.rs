//! Transport constants.

use std::time::Duration;

/// The per-connection receive buffer size hint.
pub const RECEIVE_STREAM_SIZE: usize = 41_000;

/// Message bodies above this size are split into chunks.
pub const CHUNK_SIZE: usize = 8_000;

/// The maximum size of one frame, including its own 2-byte length prefix.
pub const MAX_MESSAGE_SIZE: usize = 9_000;

/// How many bytes one scheduling round may drain from the send queues.
pub const SEND_BUDGET_BYTES: usize = 250 * 1024;

/// Outgoing connections send a ping this often.
pub const PING_INTERVAL: Duration = Duration::from_secs(90);

/// Incoming connections drop the peer when no ping arrives for this long.
pub const PING_TIMEOUT: Duration = Duration::from_secs(120);

/// Ban a peer once its misbehavior score reaches this value.
pub const BAN_SCORE_THRESHOLD: u32 = 1000;

/// How long a banned endpoint stays banned, in seconds.
pub const BAN_SECONDS: i64 = 24 * 60 * 60;

/// The hourly maintenance sweep: ban expiry and score decay.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How much each misbehavior score decays per maintenance sweep.
pub const SCORE_DECAY: u32 = 100;

/// The misbehavior score added for an illegal message.
pub const ILLEGAL_MESSAGE_SCORE: u32 = 100;

/// Delay before retrying an unresolvable hostname.
pub const RESOLVE_RETRY_DELAY: Duration = Duration::from_secs(45);

/// Backoff after a peer accepted TCP but spoke a different protocol.
pub const GARBAGE_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Login cookies above this size are refused, protecting against memory
/// abuse through a mis-pointed cookie path.
pub const MAX_COOKIE_BYTES: u64 = 1000;

/// The reconnect delay for the given consecutive-failure count.
pub fn reconnect_timeout_for_step(step: u32) -> Duration {
    if step < 5 {
        Duration::from_millis((step * step * step) as u64 * 500)
    } else {
        Duration::from_secs(44)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_schedule() {
        quagga_test::init();

        // step³ / 2 seconds while ramping, then a flat 44s.
        assert_eq!(reconnect_timeout_for_step(1), Duration::from_millis(500));
        assert_eq!(reconnect_timeout_for_step(2), Duration::from_secs(4));
        assert_eq!(reconnect_timeout_for_step(3), Duration::from_millis(13_500));
        assert_eq!(reconnect_timeout_for_step(4), Duration::from_secs(32));
        assert_eq!(reconnect_timeout_for_step(5), Duration::from_secs(44));
        assert_eq!(reconnect_timeout_for_step(50), Duration::from_secs(44));
    }
}
