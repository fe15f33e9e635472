//! Idle strategies for the dedicated polling thread
//!
//! The idle CPU level (1..=10) selects how aggressively a polling thread waits
//! when it has no work: level 10 busy spins for the lowest latency, level 1
//! sleeps a fixed millisecond per idle cycle, levels in between scale
//! spinning and parking linearly. The same level selects the threading mode of an
//! embedded medium.

use std::hint;
use std::thread;
use std::time::Duration;

/// Highest idle CPU level, selects busy spinning
pub const MAX_CPU_LEVEL: u8 = 10;

/// Lowest idle CPU level, selects the most conservative strategy
pub const MIN_CPU_LEVEL: u8 = 1;

/// Sleep per idle cycle at the lowest level
pub const MIN_LEVEL_SLEEP: Duration = Duration::from_millis(1);

/// Parameters of a spin → yield → park back-off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffParams {
    pub max_spins: u64,
    pub max_yields: u64,
    pub min_park: Duration,
    pub max_park: Duration,
}

/// How a polling loop waits when a duty cycle did no work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Never leave the CPU
    BusySpin,
    /// Give the time slice back to the scheduler on every idle cycle
    Yielding,
    /// Sleep a fixed period on every idle cycle
    Sleeping(Duration),
    /// Spin, then yield, then park with exponentially growing periods
    Backoff(BackoffParams),
}

impl IdleStrategy {
    /// Map an idle CPU level to a strategy; out-of-range levels fall back to
    /// the level-1 strategy
    pub fn for_cpu_level(level: u8) -> Self {
        match level {
            MAX_CPU_LEVEL => IdleStrategy::BusySpin,
            2..=9 => {
                let level = u64::from(level);
                IdleStrategy::Backoff(BackoffParams {
                    max_spins: 1100 * level - 1000,
                    max_yields: 5 * level,
                    min_park: Duration::from_nanos(1),
                    // 220µs at level 2 down to 10µs at level 9
                    max_park: Duration::from_micros(280 - 30 * level),
                })
            }
            _ => IdleStrategy::Sleeping(MIN_LEVEL_SLEEP),
        }
    }
}

/// Thread affinity of an embedded medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// One thread per duty (conductor, sender, receiver)
    Dedicated,
    /// Sender and receiver share a thread, conductor runs on its own
    SharedNetwork,
    /// Every duty on a single thread
    Shared,
}

impl ThreadingMode {
    pub fn for_cpu_level(level: u8) -> Self {
        match level {
            MAX_CPU_LEVEL => ThreadingMode::Dedicated,
            2..=9 => ThreadingMode::SharedNetwork,
            _ => ThreadingMode::Shared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotIdle,
    Spinning,
    Yielding,
    Parking,
}

/// Per-thread state applying an [`IdleStrategy`]
#[derive(Debug)]
pub struct IdleState {
    strategy: IdleStrategy,
    phase: Phase,
    spins: u64,
    yields: u64,
    park_period: Duration,
}

impl IdleState {
    pub fn new(strategy: IdleStrategy) -> Self {
        let park_period = match strategy {
            IdleStrategy::Backoff(params) => params.min_park,
            _ => Duration::ZERO,
        };
        Self {
            strategy,
            phase: Phase::NotIdle,
            spins: 0,
            yields: 0,
            park_period,
        }
    }

    pub fn strategy(&self) -> IdleStrategy {
        self.strategy
    }

    /// Wait according to the strategy if `work_count` is zero, reset otherwise
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        match self.strategy {
            IdleStrategy::BusySpin => hint::spin_loop(),
            IdleStrategy::Yielding => thread::yield_now(),
            IdleStrategy::Sleeping(period) => thread::sleep(period),
            IdleStrategy::Backoff(params) => self.backoff(params),
        }
    }

    pub fn reset(&mut self) {
        self.phase = Phase::NotIdle;
        self.spins = 0;
        self.yields = 0;
        if let IdleStrategy::Backoff(params) = self.strategy {
            self.park_period = params.min_park;
        }
    }

    /// Current park period, exposed for tests and diagnostics
    pub fn park_period(&self) -> Duration {
        self.park_period
    }

    fn backoff(&mut self, params: BackoffParams) {
        match self.phase {
            Phase::NotIdle => {
                self.phase = Phase::Spinning;
                self.spins += 1;
            }
            Phase::Spinning => {
                hint::spin_loop();
                self.spins += 1;
                if self.spins > params.max_spins {
                    self.phase = Phase::Yielding;
                    self.yields = 0;
                }
            }
            Phase::Yielding => {
                self.yields += 1;
                if self.yields > params.max_yields {
                    self.phase = Phase::Parking;
                    self.park_period = params.min_park;
                } else {
                    thread::yield_now();
                }
            }
            Phase::Parking => {
                thread::sleep(self.park_period);
                self.park_period = (self.park_period * 2).min(params.max_park);
            }
        }
    }
}
