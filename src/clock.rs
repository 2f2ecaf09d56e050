//! Time source shared by sessions.

use chrono::{DateTime, Local};
use std::sync::Arc;

/// Supplies the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Clock handle shared across connection tasks.
pub type SharedClock = Arc<dyn Clock>;

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    /// Returns a fixed instant, advancing by `step` on every call.
    pub struct SteppingClock {
        next: Mutex<DateTime<Local>>,
        step: Duration,
    }

    impl SteppingClock {
        pub fn new(start: DateTime<Local>, step: Duration) -> Self {
            Self {
                next: Mutex::new(start),
                step,
            }
        }

        pub fn fixed(start: DateTime<Local>) -> Self {
            Self::new(start, Duration::zero())
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Local> {
            let mut next = self.next.lock().unwrap();
            let now = *next;
            *next = now + self.step;
            now
        }
    }

    pub fn at(hour: u32, min: u32, sec: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 9, hour, min, sec)
            .single()
            .unwrap()
    }
}
