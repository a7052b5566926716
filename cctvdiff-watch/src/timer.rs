use std::time::{Duration, Instant};

/// Longest uninterrupted sleep, bounds how long a shutdown request can go unnoticed.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Fixed period tick schedule.
///
/// `next` is `None` once the schedule runs past the last representable instant, the next tick
/// then never comes due.
pub struct Cadence {
    period: Duration,
    next: Option<Instant>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Some(Instant::now()),
        }
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// How far behind schedule the current tick is.
    pub fn lag(&self) -> Duration {
        self.next
            .map(|next| Instant::now().saturating_duration_since(next))
            .unwrap_or_default()
    }

    /// A lag of more than two periods is worth reporting.
    pub fn is_lagging(&self, lag: Duration) -> bool {
        self.period.checked_mul(2).map_or(false, |limit| lag > limit)
    }

    /// Move on to the next scheduled tick.
    pub fn advance(&mut self) {
        self.next = self.next.and_then(|next| next.checked_add(self.period));
    }

    /// Time left until the next scheduled tick, zero if it is already due.
    pub fn remaining(&self) -> Duration {
        match self.next {
            Some(next) => next.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Sleep until the next tick, returning early once `interrupted` reports true.
    pub fn sleep(&self, interrupted: impl Fn() -> bool) {
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() || interrupted() {
                break;
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }

    /// Schedule the next tick for right now, dropping any backlog.
    pub fn resync(&mut self) {
        self.next = Some(Instant::now());
    }
}
