//! Channel configuration.

use std::time::Duration;

/// Which of the two turn flags an endpoint owns.
///
/// The two runtimes sharing a channel must pick different sides. Two
/// endpoints on the same side share one flag, which is only useful for
/// single-process tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Side {
    /// Owns the flag at offset 12.
    #[default]
    Primary,
    /// Owns the flag at offset 13.
    Secondary,
}

impl Side {
    /// The other side.
    pub const fn peer(self) -> Side {
        match self {
            Side::Primary => Side::Secondary,
            Side::Secondary => Side::Primary,
        }
    }
}

/// How `wait_unblocked` spends time between two polls of the control block.
///
/// None of these change what the peer observes; they only trade CPU for
/// wake-up latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollStrategy {
    /// Busy-spin with a CPU spin hint. Lowest latency, burns a core.
    #[default]
    Spin,
    /// Yield the thread to the scheduler between polls.
    Yield,
    /// Sleep for a fixed interval between polls.
    Sleep(Duration),
}

impl PollStrategy {
    #[inline]
    pub(crate) fn pause(self) {
        match self {
            PollStrategy::Spin => std::hint::spin_loop(),
            PollStrategy::Yield => std::thread::yield_now(),
            PollStrategy::Sleep(interval) => std::thread::sleep(interval),
        }
    }
}

/// Default data segment capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default number of poll iterations between two clock reads.
pub const DEFAULT_CHECK_INTERVAL: u32 = 4096;

/// Configuration for opening or creating a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Data segment capacity in bytes. When joining, the existing data file
    /// must be at least this large.
    pub capacity: usize,
    /// Create the channel files instead of opening existing ones.
    pub create_new: bool,
    /// How long to wait for the peer before giving up. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Which turn flag this endpoint owns.
    pub side: Side,
    /// Backoff between polls.
    pub poll: PollStrategy,
    /// Poll iterations between two clock reads while waiting with a timeout.
    pub check_interval: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            create_new: false,
            timeout: None,
            side: Side::Primary,
            poll: PollStrategy::Spin,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ChannelConfig {
    /// Configuration for the endpoint that creates the channel.
    pub fn create(capacity: usize) -> Self {
        Self {
            capacity,
            create_new: true,
            ..Self::default()
        }
    }

    /// Configuration for the endpoint that joins an existing channel.
    ///
    /// The data segment is sized from the control block, so no capacity is
    /// required.
    pub fn join() -> Self {
        Self {
            capacity: 0,
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the timeout in seconds. Zero, negative or non-finite values mean
    /// "wait forever".
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = if secs.is_finite() && secs > 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        };
        self
    }

    pub fn with_poll(mut self, poll: PollStrategy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_check_interval(mut self, iterations: u32) -> Self {
        self.check_interval = iterations.max(1);
        self
    }
}
