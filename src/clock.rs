//! Clock capability interface.
//!
//! Cyclic references between the scheduler and the task store are avoided by
//! passing small capability interfaces downward rather than having
//! components reach back up for shared state (see SPEC_FULL.md design
//! notes). `Clock` is one of these: it lets the task store and scheduler
//! observe time without owning a global, and lets tests inject deterministic
//! time instead of depending on the wall clock.

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Fixed/advanceable clock for deterministic tests.
    #[derive(Clone)]
    pub struct FakeClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FakeClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut now = self.now.lock();
            *now += delta;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
