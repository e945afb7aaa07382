//! Randomized parameter draws.
//!
//! Every tunable in an effect — reps, delays, volumes, durations — is a
//! [`Variable`]: a distribution around a mean, optionally drifting over
//! time through a schedule of linear deltas. Draws are non-negative;
//! the signed form exists only for noise terms that need symmetry.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as _, Normal};
use tokio::time::Instant;

pub use cricketconf::{DeltaConfig, Distribution, RandomConfig};

/// Runtime state for one random variable.
///
/// Cloning yields an independent variable with the same configuration
/// and current drift state; per-device fan-outs clone so concurrent
/// draws don't contend.
#[derive(Debug, Clone)]
pub struct Variable {
    config: RandomConfig,
    mean: f64,
    variance: f64,
    rng: StdRng,

    // Drift schedule state; only meaningful when config.changes is
    // non-empty.
    last_update: Option<Instant>,
    change_index: usize,
    change_remaining: f64,
}

impl Variable {
    pub fn new(config: &RandomConfig) -> Self {
        Variable {
            config: config.clone(),
            mean: config.mean,
            variance: config.variance,
            rng: StdRng::from_entropy(),
            last_update: None,
            change_index: 0,
            change_remaining: 0.0,
        }
    }

    /// Re-initialize to the configured state, forgetting any drift.
    pub fn reset(&mut self) {
        *self = Variable::new(&self.config.clone());
    }

    /// Draw a value. Always non-negative.
    ///
    /// For `Uniform`, the value lies in `[mean - variance/2, mean +
    /// variance/2)`. For `Normal`, the value is normally distributed
    /// with stdev `sqrt(variance)` (negative variance acts as zero).
    /// `None` yields the mean. Any drift schedule is advanced by the
    /// time elapsed since the previous draw before sampling.
    pub fn value(&mut self) -> f64 {
        self.raw_value().max(0.0)
    }

    /// Like [`Variable::value`] but without the non-negative clamp.
    /// Used for symmetric noise terms.
    pub fn signed_value(&mut self) -> f64 {
        self.raw_value()
    }

    fn raw_value(&mut self) -> f64 {
        self.advance_changes();

        let spread = match self.config.distribution {
            Distribution::None => 0.0,
            Distribution::Normal => {
                let stdev = self.variance.max(0.0).sqrt();
                match Normal::new(0.0, stdev) {
                    Ok(n) => n.sample(&mut self.rng),
                    Err(_) => 0.0, // stdev == 0 or non-finite
                }
            }
            Distribution::Uniform => {
                self.variance * self.rng.gen::<f64>() - self.variance / 2.0
            }
        };
        self.mean + spread
    }

    // Walk the drift schedule forward by the wall-clock time since the
    // last draw, possibly crossing several deltas (and wrapping, if the
    // schedule repeats).
    fn advance_changes(&mut self) {
        if self.config.changes.is_empty() {
            return;
        }
        let now = Instant::now();
        let last = match self.last_update {
            Some(t) => t,
            None => {
                // First draw starts the first delta's clock.
                self.change_remaining = self.config.changes[0].duration;
                self.last_update = Some(now);
                now
            }
        };
        if self.change_index >= self.config.changes.len() {
            self.last_update = Some(now);
            return;
        }

        let mut elapsed = (now - last).as_secs_f64();
        loop {
            let dt = elapsed.min(self.change_remaining).max(0.0);
            self.change_remaining -= dt;
            elapsed -= dt;

            let delta = self.config.changes[self.change_index];
            self.mean += dt * delta.mean_rate;
            self.variance += dt * delta.var_rate;

            if elapsed <= 0.0 {
                break;
            }

            let next = self.change_index + 1;
            if next == self.config.changes.len() {
                if !self.config.repeat_changes {
                    self.change_index = next;
                    break;
                }
                self.change_index = 0;
            } else {
                self.change_index = next;
            }
            self.change_remaining = self.config.changes[self.change_index].duration;
        }
        self.last_update = Some(now);
    }

    /// Draw, truncated toward zero.
    pub fn value_int(&mut self) -> u32 {
        self.value() as u32
    }

    /// Draw, interpreted as seconds.
    pub fn duration(&mut self) -> Duration {
        Duration::from_secs_f64(self.value())
    }

    /// The current mean, as seconds, without drawing.
    pub fn mean_duration(&self) -> Duration {
        Duration::from_secs_f64(self.mean.max(0.0))
    }

    /// The current variance, as seconds, without drawing.
    pub fn variance_duration(&self) -> Duration {
        Duration::from_secs_f64(self.variance.max(0.0))
    }

    #[cfg(test)]
    pub(crate) fn with_rng_seed(config: &RandomConfig, seed: u64) -> Self {
        let mut v = Variable::new(config);
        v.rng = StdRng::seed_from_u64(seed);
        v
    }
}
