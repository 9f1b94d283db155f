use chrono::{Local, NaiveDateTime, SubsecRound};

/// Source of "now" for attempt timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time truncated to whole seconds, matching the table format.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local().trunc_subsecs(0)
    }
}

#[cfg(test)]
pub use testing::SteppingClock;
