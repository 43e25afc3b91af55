//! Traffic-light status and pass/fail tallies.

use std::fmt;
use std::ops::AddAssign;

/// Severity reported to the collector, ordered Green < Yellow < Red.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Green,
    Yellow,
    Red,
}

impl Status {
    /// Wire rendering of the color.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Green => "green",
            Status::Yellow => "yellow",
            Status::Red => "red",
        }
    }

    /// Overall status for a set of outcomes: any failure with no success is
    /// red, mixed evidence is yellow.
    pub fn from_counts(good: u64, bad: u64) -> Self {
        match (good, bad) {
            (_, 0) => Status::Green,
            (0, _) => Status::Red,
            _ => Status::Yellow,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count of good and bad outcomes accumulated by a probe or a monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub good: u64,
    pub bad: u64,
}

impl Tally {
    pub fn new(good: u64, bad: u64) -> Self {
        Self { good, bad }
    }

    pub fn record<T, E>(&mut self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.good += 1,
            Err(_) => self.bad += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.good + self.bad
    }

    pub fn status(&self) -> Status {
        Status::from_counts(self.good, self.bad)
    }
}

impl AddAssign for Tally {
    fn add_assign(&mut self, rhs: Self) {
        self.good += rhs.good;
        self.bad += rhs.bad;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        for good in 0..5 {
            for bad in 0..5 {
                let status = Status::from_counts(good, bad);
                let expected = if bad == 0 {
                    Status::Green
                } else if good == 0 {
                    Status::Red
                } else {
                    Status::Yellow
                };
                assert_eq!(status, expected, "good={} bad={}", good, bad);
            }
        }
    }

    #[test]
    fn test_status_order_and_strings() {
        assert!(Status::Green < Status::Yellow);
        assert!(Status::Yellow < Status::Red);
        assert_eq!(Status::Green.to_string(), "green");
        assert_eq!(Status::Yellow.to_string(), "yellow");
        assert_eq!(Status::Red.to_string(), "red");
    }

    #[test]
    fn test_tally_accumulates() {
        let mut tally = Tally::default();
        tally.record::<(), ()>(&Ok(()));
        tally.record::<(), ()>(&Err(()));
        tally += Tally::new(3, 1);
        assert_eq!(tally, Tally::new(4, 2));
        assert_eq!(tally.total(), 6);
        assert_eq!(tally.status(), Status::Yellow);
    }
}
