//! Light algorithms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::context::RunContext;
use crate::device::Request;
use crate::effect::{Algorithm, Bindings, EffectContext, EffectError, Registry};
use crate::idset::{IdSet, LaunchFn};
use crate::random::Variable;
use crate::requests::Blink;
use crate::types::ClientId;

pub fn register(registry: &mut Registry) {
    registry.register_light("darkness", Arc::new(|_| Ok(Box::new(Darkness))));
    registry.register_light("blink", Arc::new(|b| Ok(Box::new(BlinkAlg::build(b)?))));
    registry.register_light("unison", Arc::new(|b| Ok(Box::new(Unison::build(b)?))));
}

// ------------------------------------------------------------------

/// Makes no light.
struct Darkness;

#[async_trait]
impl Algorithm for Darkness {
    async fn run(
        self: Box<Self>,
        ctx: RunContext,
        _members: Arc<dyn IdSet>,
        _fx: Arc<EffectContext>,
    ) {
        ctx.cancelled().await;
    }
}

// ------------------------------------------------------------------

/// Each member blinks on its own randomized cadence, out of sync with
/// the others.
struct BlinkAlg {
    blink_speed: Variable,
    blink_delay: Variable,
}

impl BlinkAlg {
    fn build(b: &Bindings) -> Result<BlinkAlg, EffectError> {
        Ok(BlinkAlg {
            blink_speed: b.variable("blink_speed")?,
            blink_delay: b.variable("blink_delay")?,
        })
    }
}

#[async_trait]
impl Algorithm for BlinkAlg {
    async fn run(
        self: Box<Self>,
        ctx: RunContext,
        members: Arc<dyn IdSet>,
        fx: Arc<EffectContext>,
    ) {
        let speed = self.blink_speed.clone();
        let delay = self.blink_delay.clone();
        let launch_ctx = ctx.clone();

        let per_device: LaunchFn = Arc::new(move |id: ClientId| {
            // Every device gets its own copy of the variables: the
            // delay may drift over time, and concurrent draws from a
            // shared variable would race that schedule.
            let mut speed = speed.clone();
            let mut delay = delay.clone();
            delay.reset();
            let ctx = launch_ctx.clone();
            let fx = fx.clone();

            Box::pin(async move {
                while !ctx.is_cancelled() {
                    let pause = delay.duration();
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = ctx.cancelled() => return,
                    }

                    let blink = Blink {
                        speed: speed.value(),
                        delay: Duration::ZERO,
                        jitter: Duration::ZERO,
                        reps: 1,
                    };
                    let duration = blink.duration();
                    fx.fleet
                        .enqueue_after_delay(&[id.clone()], &ctx, blink, Duration::ZERO);

                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = ctx.cancelled() => return,
                    }
                }
            })
        });

        members.launch(ctx, per_device).await;
    }
}

// ------------------------------------------------------------------

/// Every member blinks in lockstep, `group_reps` rounds of `blink_reps`
/// blinks each.
struct Unison {
    blink_speed: Variable,
    blink_delay: Variable,
    blink_reps: Variable,
    group_delay: Variable,
    group_reps: Variable,
}

impl Unison {
    fn build(b: &Bindings) -> Result<Unison, EffectError> {
        Ok(Unison {
            blink_speed: b.variable("blink_speed")?,
            blink_delay: b.variable("blink_delay")?,
            blink_reps: b.variable("blink_reps")?,
            group_delay: b.variable("group_delay")?,
            group_reps: b.variable("group_reps")?,
        })
    }
}

#[async_trait]
impl Algorithm for Unison {
    async fn run(
        mut self: Box<Self>,
        ctx: RunContext,
        members: Arc<dyn IdSet>,
        fx: Arc<EffectContext>,
    ) {
        let mut group_reps = self.group_reps.value_int().max(1);

        while !ctx.is_cancelled() && group_reps > 0 {
            let blink = Blink {
                speed: self.blink_speed.value(),
                delay: self.blink_delay.mean_duration(),
                jitter: self.blink_delay.variance_duration(),
                reps: self.blink_reps.value_int().max(1),
            };
            debug!(reps = blink.reps, "unison round");
            let duration = blink.duration();
            fx.fleet
                .enqueue_after_delay(&members.snapshot(), &ctx, blink, Duration::ZERO);

            let pause = duration + self.group_delay.duration();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = ctx.cancelled() => {}
            }
            group_reps -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cricketconf::RandomConfig;
    use std::collections::HashMap;

    fn bindings(params: &[(&str, f64)]) -> Bindings {
        Bindings::for_tests(
            "test-effect",
            params
                .iter()
                .map(|(k, v)| (k.to_string(), RandomConfig::fixed(*v)))
                .collect(),
            HashMap::new(),
        )
    }

    #[test]
    fn blink_requires_both_parameters() {
        let complete = bindings(&[("blink_speed", 2.0), ("blink_delay", 1.0)]);
        assert!(BlinkAlg::build(&complete).is_ok());

        let partial = bindings(&[("blink_speed", 2.0)]);
        assert!(matches!(
            BlinkAlg::build(&partial),
            Err(EffectError::MissingParameter { .. })
        ));
    }

    #[test]
    fn unison_requires_all_five_parameters() {
        let complete = bindings(&[
            ("blink_speed", 2.0),
            ("blink_delay", 1.0),
            ("blink_reps", 3.0),
            ("group_delay", 1.0),
            ("group_reps", 2.0),
        ]);
        assert!(Unison::build(&complete).is_ok());

        let partial = bindings(&[("blink_speed", 2.0), ("blink_delay", 1.0)]);
        assert!(matches!(
            Unison::build(&partial),
            Err(EffectError::MissingParameter { .. })
        ));
    }
}
