//! Intensity controller for the storm algorithm.
//!
//! A [`Wander`] produces a value in `[0, 1]` that ramps piecewise-
//! linearly toward randomized targets, alternating ramp and hold
//! phases, and always arrives back at zero by the deadline.

use std::time::Duration;

use tokio::time::Instant;

use crate::random::Variable;

pub struct WanderConfig {
    /// Target intensity draws (clamped to [0, 1]).
    pub intensity: Variable,
    /// How quickly to move between targets, in [0, 1].
    pub acceleration: Variable,
    /// Symmetric noise added to every sample.
    pub noise: Variable,
    /// Base time scale for one ramp or hold phase.
    pub accel_scale: Duration,
    /// When the effect ends; intensity is pinned to 0 from here on.
    pub deadline: Instant,
}

pub struct Wander {
    config: WanderConfig,
    old_target: f64,
    new_target: f64,
    old_time: Instant,
    new_time: Instant,
    slope: f64,
    ramping: bool,
}

impl Wander {
    pub fn new(config: WanderConfig) -> Self {
        let now = Instant::now();
        Wander {
            config,
            old_target: 0.0,
            new_target: 0.0,
            old_time: now,
            new_time: now,
            slope: 0.0,
            ramping: true,
        }
    }

    /// Sample the current intensity, in `[0, 1]`.
    pub fn value(&mut self) -> f64 {
        self.value_at(Instant::now())
    }

    fn value_at(&mut self, now: Instant) -> f64 {
        if now >= self.config.deadline {
            return 0.0;
        }
        if now >= self.new_time {
            self.old_target = self.new_target;
            self.old_time = self.new_time;

            // accel = 1.0 -> rate =  1 * accel_scale
            // accel = 0.5 -> rate =  4 * accel_scale
            // accel = 0.0 -> rate = 16 * accel_scale
            let accel = self.config.acceleration.value().clamp(0.0, 1.0);
            let rate = 4.0_f64.powf((1.0 - accel) * 2.0);
            self.new_time = self.old_time + self.config.accel_scale.mul_f64(rate);

            // Alternate between ramping the intensity and holding it.
            if self.ramping {
                self.new_target = self.config.intensity.value().clamp(0.0, 1.0);
            }
            self.ramping = !self.ramping;

            // Always aim to finish at min intensity.
            if self.new_time > self.config.deadline {
                self.new_time = self.config.deadline;
                self.new_target = 0.0;
            }

            let delta = self.new_target - self.old_target;
            let duration = (self.new_time - self.old_time).as_secs_f64();
            self.slope = if duration > 0.0 { delta / duration } else { 0.0 };
        }

        let dt = (now - self.old_time).as_secs_f64();
        let intensity = self.old_target + dt * self.slope + self.config.noise.signed_value();
        intensity.clamp(0.0, 1.0)
    }
}
