//! Latency compensation for reported playback positions
//!
//! A message or stored row that says "position P at time T, playing" is
//! already stale by the time it is read. The current position is
//! `P + max(0, now - T)`. Pauses are exact and never compensated; seeks are
//! compensated only when the receiver believes playback is ongoing.

/// How a reported position should be aged before it is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Playback was ongoing at `T`, add the elapsed time
    Elapsed,
    /// The position is exact (pause, or seek while paused)
    Exact,
}

impl Compensation {
    /// Compensation rule for a seek target given the receiver's play state
    pub fn for_seek(receiver_playing: bool) -> Self {
        if receiver_playing {
            Compensation::Elapsed
        } else {
            Compensation::Exact
        }
    }

    /// Compensation rule for a snapshot that claims `is_playing`
    pub fn for_snapshot(is_playing: bool) -> Self {
        if is_playing {
            Compensation::Elapsed
        } else {
            Compensation::Exact
        }
    }
}

/// Milliseconds elapsed since `reported_at_ms`, clamped at zero.
///
/// Clocks are independent per client, so a sender slightly ahead of us
/// produces a timestamp in our future; that counts as no elapsed time.
pub fn elapsed_since(reported_at_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(reported_at_ms)
}

/// Current position (seconds) for a position reported at `reported_at_ms`
pub fn compensate(position_secs: f64, reported_at_ms: u64, now_ms: u64, rule: Compensation) -> f64 {
    let position = position_secs.max(0.0);
    match rule {
        Compensation::Exact => position,
        Compensation::Elapsed => {
            let elapsed = elapsed_since(reported_at_ms, now_ms);
            tracing::trace!("Compensating {:.3}s by {}ms", position, elapsed);
            position + elapsed as f64 / 1000.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_playing_position_advances_by_transit_time() {
        let position = compensate(30.0, T0, T0 + 2_000, Compensation::Elapsed);
        assert!((position - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_pause_position_is_exact() {
        let position = compensate(30.0, T0, T0 + 2_000, Compensation::Exact);
        assert_eq!(position, 30.0);
    }

    #[test]
    fn test_future_timestamp_adds_nothing() {
        let position = compensate(30.0, T0 + 5_000, T0, Compensation::Elapsed);
        assert_eq!(position, 30.0);
    }

    #[test]
    fn test_negative_position_clamped() {
        assert_eq!(compensate(-4.0, T0, T0, Compensation::Exact), 0.0);
    }

    #[test]
    fn test_seek_rule_depends_on_receiver_state() {
        assert_eq!(Compensation::for_seek(true), Compensation::Elapsed);
        assert_eq!(Compensation::for_seek(false), Compensation::Exact);
    }
}
