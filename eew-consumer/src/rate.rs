use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Tokens left in the current window and the instant at which the window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub tokens: u32,
    pub window_end: Instant,
}

/// Bounds reads against a shard to `capacity` per `window`.
///
/// The budget is reset, not topped up: tokens left over at the end of a window
/// are lost. On top of the fixed window, the instants of the last `capacity`
/// grants are kept so that a burst at the end of one window cannot be followed
/// by a second burst at the start of the next. No rolling `window` ever sees
/// more than `capacity` grants.
#[derive(Debug)]
pub struct RateScheduler {
    capacity: u32,
    window: Duration,
    budget: RateBudget,
    grants: VecDeque<Instant>,
}

impl RateScheduler {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self::starting_at(capacity, window, Instant::now())
    }

    pub fn starting_at(capacity: u32, window: Duration, now: Instant) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            budget: RateBudget {
                tokens: capacity,
                window_end: now + window,
            },
            grants: VecDeque::with_capacity(capacity as usize),
        }
    }

    /// Kinesis allows five GetRecords calls per second per shard.
    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn budget(&self) -> RateBudget {
        self.budget
    }

    /// Take a token if one is available right now.
    pub fn acquire(&mut self) -> bool {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.budget.tokens == 0 || !self.rolling_window_open(now) {
            return false;
        }

        self.budget.tokens -= 1;
        if self.grants.len() == self.capacity as usize {
            self.grants.pop_front();
        }
        self.grants.push_back(now);
        true
    }

    /// Earliest instant at which `acquire` can succeed.
    pub fn next_permit_at(&self) -> Instant {
        self.next_permit_after(Instant::now())
    }

    pub fn next_permit_after(&self, now: Instant) -> Instant {
        let mut at = now;

        if self.budget.tokens == 0 && now < self.budget.window_end {
            at = self.budget.window_end;
        }

        if self.grants.len() == self.capacity as usize {
            if let Some(oldest) = self.grants.front() {
                at = at.max(*oldest + self.window);
            }
        }

        at
    }

    fn refill(&mut self, now: Instant) {
        if now < self.budget.window_end {
            return;
        }

        let mut window_end = self.budget.window_end + self.window;
        if window_end <= now {
            // Idle for more than a window: start a fresh one from now.
            window_end = now + self.window;
        }

        self.budget = RateBudget {
            tokens: self.capacity,
            window_end,
        };
    }

    fn rolling_window_open(&self, now: Instant) -> bool {
        if self.grants.len() < self.capacity as usize {
            return true;
        }
        match self.grants.front() {
            Some(oldest) => now >= *oldest + self.window,
            None => true,
        }
    }
}
