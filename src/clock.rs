use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Millisecond clock injected into all services.
///
/// Expiration windows and signature lookahead depend on "now"; tests use the
/// fixed variant and advance it explicitly instead of sleeping.
#[derive(Clone)]
pub enum Clock {
    System,
    Fixed(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn fixed(now_ms: i64) -> Self {
        Clock::Fixed(Arc::new(AtomicI64::new(now_ms)))
    }

    /// Current time as Unix epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp_millis(),
            Clock::Fixed(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Advance a fixed clock; no-op on the system clock.
    pub fn advance_ms(&self, delta: i64) {
        if let Clock::Fixed(ms) = self {
            ms.fetch_add(delta, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Clock::System => write!(f, "Clock::System"),
            Clock::Fixed(ms) => write!(f, "Clock::Fixed({})", ms.load(Ordering::SeqCst)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let clock = Clock::fixed(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(250);
        assert_eq!(clock.now_ms(), 1_250);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = Clock::system();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
