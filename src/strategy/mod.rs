//! Text emission cadence.
//!
//! A [`ChunkStrategy`] decides, per text delta, whether the processor should
//! surface the accumulated text now or keep buffering. Strategies only
//! affect *when* text is surfaced: at stream end the buffer is flushed
//! regardless, so no text is ever lost.

mod config;

pub use config::{StrategyConfig, StrategyFactory};

use std::time::Duration;

/// Policy answering "emit now?" for each text delta.
pub trait ChunkStrategy: Send {
    /// Called once per text delta, in arrival order.
    fn should_emit(&mut self, chunk: &str, accumulated: &str) -> bool;

    /// Reset internal state (for reuse across streams).
    fn reset(&mut self) {}

    /// Delay after which buffered text should be flushed even though no
    /// further delta arrived. `None` means no timer is armed.
    fn flush_after(&self) -> Option<Duration> {
        None
    }

    /// Called when the processor flushed because the [`flush_after`] timer
    /// elapsed.
    ///
    /// [`flush_after`]: ChunkStrategy::flush_after
    fn on_timer_flush(&mut self) {}
}

/// Emit on every delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl ChunkStrategy for Immediate {
    fn should_emit(&mut self, _chunk: &str, _accumulated: &str) -> bool {
        true
    }
}

/// Emit when the delta itself contains sentence or clause punctuation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Punctuation;

impl Punctuation {
    const MARKS: [char; 7] = ['.', ',', '!', '?', ';', ':', '\n'];
}

impl ChunkStrategy for Punctuation {
    fn should_emit(&mut self, chunk: &str, _accumulated: &str) -> bool {
        chunk.contains(Self::MARKS)
    }
}

/// Emit on every `size`-th delta.
#[derive(Debug, Clone)]
pub struct Batch {
    size: usize,
    count: usize,
}

impl Batch {
    pub const DEFAULT_SIZE: usize = 5;

    /// A batch of zero is treated as one.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            count: 0,
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIZE)
    }
}

impl ChunkStrategy for Batch {
    fn should_emit(&mut self, _chunk: &str, _accumulated: &str) -> bool {
        self.count += 1;
        self.count % self.size == 0
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Emit when the delta ends on whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordBoundary;

impl ChunkStrategy for WordBoundary {
    fn should_emit(&mut self, chunk: &str, _accumulated: &str) -> bool {
        chunk.chars().last().is_some_and(char::is_whitespace)
    }
}

/// Never emits synchronously; arms a quiet-period timer instead.
///
/// Every delta restarts the timer. The processor's async driver flushes the
/// buffer once `delay` passes without a new delta.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    armed: bool,
}

impl Debounce {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: false,
        }
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

impl ChunkStrategy for Debounce {
    fn should_emit(&mut self, _chunk: &str, _accumulated: &str) -> bool {
        self.armed = true;
        false
    }

    fn reset(&mut self) {
        self.armed = false;
    }

    fn flush_after(&self) -> Option<Duration> {
        self.armed.then_some(self.delay)
    }

    fn on_timer_flush(&mut self) {
        self.armed = false;
    }
}

/// Emit when any child strategy emits.
///
/// Every child sees every delta, so stateful children (batch counters,
/// debounce timers) stay in step even when an earlier child already fired.
#[derive(Default)]
pub struct Composite {
    strategies: Vec<Box<dyn ChunkStrategy>>,
}

impl Composite {
    pub fn new(strategies: Vec<Box<dyn ChunkStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn with(mut self, strategy: impl ChunkStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }
}

impl std::fmt::Debug for Composite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composite")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

impl ChunkStrategy for Composite {
    fn should_emit(&mut self, chunk: &str, accumulated: &str) -> bool {
        self.strategies
            .iter_mut()
            .fold(false, |emit, s| s.should_emit(chunk, accumulated) || emit)
    }

    fn reset(&mut self) {
        self.strategies.iter_mut().for_each(|s| s.reset());
    }

    fn flush_after(&self) -> Option<Duration> {
        self.strategies.iter().filter_map(|s| s.flush_after()).min()
    }

    fn on_timer_flush(&mut self) {
        self.strategies.iter_mut().for_each(|s| s.on_timer_flush());
    }
}
