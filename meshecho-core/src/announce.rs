//! Announce schedule and announce packet construction.

use std::time::{Duration, Instant};

use crate::destination::Destination;
use crate::protocol::{Packet, PROTOCOL_VERSION};

/// When periodic announces fire. The startup announce is not part of the schedule: it is
/// always sent.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AnnounceSchedule {
    period: Option<Duration>,
}

impl AnnounceSchedule {
    /// `interval_seconds <= 0` disables periodic announces.
    pub fn from_interval_seconds(interval_seconds: i64) -> Self {
        let period = u64::try_from(interval_seconds)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        Self { period }
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }

    /// First deadline `start + k * period` strictly after `now`. Deadlines keep the phase of
    /// `start`, so a late wakeup never pushes later announces back; missed deadlines are skipped.
    pub fn next_after(&self, start: Instant, now: Instant) -> Option<Instant> {
        let period = self.period?;
        let elapsed = now.saturating_duration_since(start);
        let ticks = elapsed.as_nanos() / period.as_nanos() + 1;
        let ticks = u32::try_from(ticks).ok()?;
        start.checked_add(period.checked_mul(ticks)?)
    }
}

/// Announce for `destination`, reachable over links on `link_port`. Inbound stamps are not
/// enforced, so no stamp cost is advertised.
pub fn announce_packet(destination: &Destination, link_port: u16) -> Packet {
    Packet::Announce {
        protocol_version: PROTOCOL_VERSION,
        destination: destination.hash(),
        public_key: destination.public_key().clone(),
        display_name: destination.display_name().to_string(),
        stamp_cost: None,
        link_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::AppNamespace;
    use crate::identity::Identity;

    #[test]
    fn non_positive_interval_disables_periodic() {
        let start = Instant::now();
        for secs in [0, -1, -3600] {
            let s = AnnounceSchedule::from_interval_seconds(secs);
            assert!(!s.is_periodic());
            assert_eq!(s.next_after(start, start), None);
        }
    }

    #[test]
    fn deadlines_keep_phase() {
        let s = AnnounceSchedule::from_interval_seconds(10);
        let start = Instant::now();
        assert_eq!(s.next_after(start, start), Some(start + Duration::from_secs(10)));
        // Woken 300ms late for the first tick: the second tick is still at 20s.
        assert_eq!(
            s.next_after(start, start + Duration::from_millis(10_300)),
            Some(start + Duration::from_secs(20))
        );
        // Exactly on a deadline: the next one is a full period later.
        assert_eq!(
            s.next_after(start, start + Duration::from_secs(20)),
            Some(start + Duration::from_secs(30))
        );
    }

    #[test]
    fn missed_deadlines_are_skipped() {
        let s = AnnounceSchedule::from_interval_seconds(5);
        let start = Instant::now();
        assert_eq!(
            s.next_after(start, start + Duration::from_secs(27)),
            Some(start + Duration::from_secs(30))
        );
    }

    #[test]
    fn announce_carries_address_and_display_name() {
        let id = Identity::generate();
        let dest = Destination::register(&id, AppNamespace::lxmf_delivery(), "Echo Bot");
        match announce_packet(&dest, 4243) {
            Packet::Announce {
                destination,
                display_name,
                stamp_cost,
                link_port,
                ..
            } => {
                assert_eq!(destination, dest.hash());
                assert_eq!(display_name, "Echo Bot");
                assert_eq!(stamp_cost, None);
                assert_eq!(link_port, 4243);
            }
            other => panic!("expected Announce, got {:?}", other),
        }
    }
}
