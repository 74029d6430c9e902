//! Configuration parameters.
//!
//! Runtime settings live in [`Config`] and [`StackConfig`]. Compile time settings are cargo
//! features: `stats` turns on the counters in [`stats`](crate::stats), and `nightly` uses the
//! branch hint intrinsics.

use crate::{error::ConfigError, handshake::delivery, versioned::NIL};

/// How phases reach mutator threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A real asynchronous signal per posted phase. The handler runs on the mutator with its
    /// registers saved in the signal frame.
    Signal,

    /// Mutators pick up posted phases at [`Mutator::safepoint`](crate::mutator::Mutator::safepoint).
    ///
    /// Nothing interrupts a mutator between safepoints, and no register state is captured for the
    /// mark action. Use this where signals are unavailable, or in tests.
    Poll,
}

impl Default for DeliveryMode {
    #[inline]
    fn default() -> Self {
        if cfg!(unix) {
            DeliveryMode::Signal
        } else {
            DeliveryMode::Poll
        }
    }
}

/// Sizing of a [`LfStack`](crate::stack::LfStack) arena.
///
/// # Example
///
/// ```
/// use gcsync::{config::StackConfig, stack::LfStack};
///
/// let stack = LfStack::<u64>::with_config(&StackConfig {
///     capacity: 1024,
///     ..Default::default()
/// });
/// assert_eq!(stack.capacity(), 1024);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackConfig {
    /// Maximum number of simultaneously allocated entries.
    ///
    /// Nothing is reserved for it up front: chunks double in size, so the chunk table never has
    /// more than a few dozen slots.
    ///
    /// Default: every index a versioned link can address (`u32::MAX` entries)
    pub capacity: usize,

    /// Number of entries in the first arena chunk. Every further chunk is twice as long as the
    /// one before. Chunks are allocated on first use.
    ///
    /// Default: 256
    pub chunk_len: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            capacity:  NIL as usize,
            chunk_len: 256,
        }
    }
}

impl StackConfig {
    /// Checks that every entry can be addressed by a versioned link.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = NIL as usize;
        if self.capacity == 0 || self.capacity > max {
            return Err(ConfigError::Capacity {
                capacity: self.capacity,
                max,
            });
        }
        if self.chunk_len == 0 || self.chunk_len > self.capacity {
            return Err(ConfigError::ChunkLen {
                chunk_len: self.chunk_len,
                capacity:  self.capacity,
            });
        }
        Ok(())
    }
}

/// Configuration for a [`Handshake`](crate::handshake::Handshake).
///
/// # Example
///
/// ```
/// use gcsync::config::{Config, DeliveryMode};
///
/// let config = Config {
///     delivery: DeliveryMode::Poll,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// How posted phases reach mutators.
    ///
    /// Default: [`DeliveryMode::Signal`] on unix, [`DeliveryMode::Poll`] elsewhere.
    pub delivery: DeliveryMode,

    /// Which signal carries phases, counted from the first real-time signal on Linux and from
    /// `SIGUSR2` on other unixes. Every handshake in a process must agree on it.
    ///
    /// Default: 0
    pub signal_offset: i32,

    /// Sizing of each mutator's cross-thread hand-off stack.
    ///
    /// Default: [`StackConfig::default`]
    pub handoff: StackConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            delivery:      DeliveryMode::default(),
            signal_offset: 0,
            handoff:       StackConfig::default(),
        }
    }
}

impl Config {
    /// Checks every parameter. Called by the handshake builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.handoff.validate()?;
        if self.delivery == DeliveryMode::Signal {
            let _ = delivery::phase_signal(self.signal_offset)?;
        }
        Ok(())
    }
}
