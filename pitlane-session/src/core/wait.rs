//! Resumable Waits
//!
//! Tick-driven wait sequences for the countdown, the ready-up window and the
//! last-participant departure delay. A wait never blocks: the owner calls
//! `advance` once per scheduler pass and acts on the returned step.
//!
//! Cancellation is a gate predicate supplied on every pass. The wait
//! remembers the previous value; a true-to-false transition cancels it.

/// Outcome of a single scheduler pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStep {
    /// Still waiting.
    Running {
        /// Ticks elapsed including this pass.
        elapsed: u32,
        /// Ticks left before the wait elapses.
        remaining: u32,
    },
    /// The completion condition was met before the limit.
    Satisfied,
    /// The full duration elapsed.
    Elapsed,
    /// The gate predicate dropped from true to false.
    Cancelled,
}

impl WaitStep {
    /// True for every step that ends the wait.
    pub fn is_finished(self) -> bool {
        !matches!(self, WaitStep::Running { .. })
    }
}

/// A wait bounded by a number of ticks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedWait {
    limit: u32,
    elapsed: u32,
    gate: bool,
    finished: bool,
}

impl TimedWait {
    /// Create a wait that elapses after `limit` passes.
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            elapsed: 0,
            gate: true,
            finished: false,
        }
    }

    /// Run one pass.
    ///
    /// `gate` is the abort predicate for this pass, `satisfied` the
    /// completion condition. Once finished, further passes repeat the
    /// cancelled step and never fire a second completion.
    pub fn advance(&mut self, gate: bool, satisfied: bool) -> WaitStep {
        if self.finished {
            return WaitStep::Cancelled;
        }

        self.elapsed = self.elapsed.saturating_add(1);

        let dropped = self.gate && !gate;
        self.gate = gate;
        if dropped {
            self.finished = true;
            return WaitStep::Cancelled;
        }

        if satisfied {
            self.finished = true;
            return WaitStep::Satisfied;
        }

        if self.elapsed >= self.limit {
            self.finished = true;
            return WaitStep::Elapsed;
        }

        WaitStep::Running {
            elapsed: self.elapsed,
            remaining: self.limit - self.elapsed,
        }
    }

    /// Ticks elapsed so far.
    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    /// Total ticks.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Has the wait produced a terminal step.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

// =============================================================================
// COUNTDOWN
// =============================================================================

/// Result of advancing a countdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountdownStep {
    /// Nothing visible changed this pass.
    Pending,
    /// A whole second boundary was crossed.
    Second {
        /// Whole seconds left, rounded up.
        remaining: u32,
    },
    /// Countdown reached zero with membership unchanged.
    Completed,
    /// Membership changed; the completion callback must not fire.
    Aborted,
}

/// Membership-gated countdown.
///
/// The player count is captured when the countdown is requested. It must
/// be unchanged on every pass and at completion.
#[derive(Clone, Debug)]
pub struct Countdown {
    wait: TimedWait,
    starting_count: usize,
    tick_rate: u32,
    last_second: u32,
}

impl Countdown {
    /// Start a countdown of `ticks` passes at `tick_rate` passes per second.
    pub fn new(ticks: u32, tick_rate: u32, starting_count: usize) -> Self {
        let wait = TimedWait::new(ticks);
        let tick_rate = tick_rate.max(1);
        let last_second = wait.limit().div_ceil(tick_rate);
        Self {
            wait,
            starting_count,
            tick_rate,
            last_second,
        }
    }

    /// Player count captured at request time.
    pub fn starting_count(&self) -> usize {
        self.starting_count
    }

    /// Whole seconds left, rounded up.
    pub fn seconds_remaining(&self) -> u32 {
        (self.wait.limit() - self.wait.elapsed().min(self.wait.limit())).div_ceil(self.tick_rate)
    }

    /// Run one pass with the current player count.
    pub fn advance(&mut self, player_count: usize) -> CountdownStep {
        let stable = player_count == self.starting_count;
        match self.wait.advance(stable, false) {
            WaitStep::Running { remaining, .. } => {
                let second = remaining.div_ceil(self.tick_rate);
                if second < self.last_second {
                    self.last_second = second;
                    CountdownStep::Second { remaining: second }
                } else {
                    CountdownStep::Pending
                }
            }
            WaitStep::Elapsed if stable => CountdownStep::Completed,
            WaitStep::Elapsed | WaitStep::Cancelled | WaitStep::Satisfied => CountdownStep::Aborted,
        }
    }
}
