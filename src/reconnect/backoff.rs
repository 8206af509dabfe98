use std::{sync::Arc, time::Duration};

use crate::{pool::RandomSource, pool::ThreadRandom, Result, WebSocketError};

use super::ReconnectOptions;

/// Exponential backoff with a cap and bounded jitter.
///
/// The delay of attempt `n` is `initial_delay * multiplier^n`, capped at `max_delay`, then
/// scaled by a uniform factor in `[1 - jitter, 1 + jitter]` and clamped to
/// `[0, max_delay]`. Growth that overflows saturates to `max_delay`, so unbounded attempt
/// counts are fine.
#[derive(Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Backoff {
    /// Creates a calculator drawing jitter from the thread-local generator.
    ///
    /// # Errors
    /// [`WebSocketError::InvalidArgument`] when the multiplier is not positive or the jitter
    /// fraction is outside `[0, 1]`.
    pub fn new(options: &ReconnectOptions) -> Result<Self> {
        Self::with_random(options, Arc::new(ThreadRandom))
    }

    /// Creates a calculator drawing jitter from `random`.
    pub fn with_random(options: &ReconnectOptions, random: Arc<dyn RandomSource>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            initial_delay: options.initial_delay,
            max_delay: options.max_delay,
            multiplier: options.multiplier,
            jitter: options.jitter,
            random,
        })
    }

    /// The delay before reconnect attempt `attempt`, counting from 0.
    ///
    /// # Errors
    /// [`WebSocketError::InvalidArgument`] for a negative attempt number.
    pub fn delay(&self, attempt: i32) -> Result<Duration> {
        let raw = self.delay_without_jitter(attempt)?.as_secs_f64();

        let factor = 1.0 - self.jitter + 2.0 * self.jitter * self.random.next_f64();
        let delay = self.clamp(raw * factor);

        #[cfg(feature = "logging")]
        log::debug!("backoff attempt {attempt}: {delay:?}");

        Ok(delay)
    }

    /// The delay before reconnect attempt `attempt` without jitter applied.
    pub fn delay_without_jitter(&self, attempt: i32) -> Result<Duration> {
        if attempt < 0 {
            return Err(WebSocketError::InvalidArgument(
                "attempt number must not be negative",
            ));
        }

        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt);
        Ok(self.clamp(raw))
    }

    fn clamp(&self, secs: f64) -> Duration {
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            // overflow or infinity
            Err(_) => self.max_delay,
        }
    }
}
