use std::time::Duration;

/// Doubling delay between reconnects, capped at `max`
#[derive(Clone, Debug)]
pub struct Backoff {
    cur: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { cur: min, min, max }
    }

    pub fn reset(&mut self) {
        self.cur = self.min;
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.cur;
        self.cur = std::cmp::min(self.cur * 2, self.max);
        d
    }
}
