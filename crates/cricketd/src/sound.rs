//! Sound algorithms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::effect::{Algorithm, Bindings, EffectContext, EffectError, Registry};
use crate::fileset::{FileSet, PlaySpec};
use crate::idset::{FixedIdSet, IdSet, LaunchFn};
use crate::random::Variable;
use crate::requests::Play;
use crate::types::ClientId;
use crate::wander::{Wander, WanderConfig};
use cricketconf::{Distribution, RandomConfig};

pub fn register(registry: &mut Registry) {
    registry.register_sound("silence", Arc::new(|_| Ok(Box::new(Silence))));
    registry.register_sound("nonrandom", Arc::new(|b| Ok(Box::new(Nonrandom::build(b)?))));
    registry.register_sound("loop", Arc::new(|b| Ok(Box::new(Loop::build(b)?))));
    registry.register_sound(
        "shuffle",
        Arc::new(|b| {
            Ok(Box::new(Shuffle {
                proto: Loop::build(b)?,
            }))
        }),
    );
    registry.register_sound("storm", Arc::new(|b| Ok(Box::new(Storm::build(b)?))));
}

// ------------------------------------------------------------------

/// Plays no sound.
struct Silence;

#[async_trait]
impl Algorithm for Silence {
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

/// Walks the whole fileset in `(folder, file)` order, playing each file
/// once on every current member, in lockstep.
struct Nonrandom {
    group_delay: Variable,
    main: Arc<FileSet>,
}

impl Nonrandom {
    fn build(b: &Bindings) -> Result<Nonrandom, EffectError> {
        Ok(Nonrandom {
            group_delay: b.variable("group_delay")?,
            main: b.fileset("main")?,
        })
    }
}

#[async_trait]
impl Algorithm for Nonrandom {
    async fn run(
        mut self: Box<Self>,
        ctx: RunContext,
        members: Arc<dyn IdSet>,
        fx: Arc<EffectContext>,
    ) {
        for file in self.main.files() {
            if ctx.is_cancelled() {
                return;
            }
            let spec = PlaySpec {
                file: *file,
                reps: 1,
                delay: Duration::ZERO,
                jitter: Duration::ZERO,
            };
            fx.fleet.enqueue_after_delay(
                &members.snapshot(),
                &ctx,
                Play { volume: 0, spec },
                Duration::ZERO,
            );

            let pause = spec.duration() + self.group_delay.duration();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = ctx.cancelled() => return,
            }
        }
    }
}

// ------------------------------------------------------------------

/// Repeatedly picks a random file and plays it on every current member
/// at once. Near the effect deadline the pick is trimmed to whatever
/// still fits; when nothing fits, the run is over.
#[derive(Clone)]
struct Loop {
    file_reps: Variable,
    file_delay: Variable,
    group_delay: Variable,
    main: Arc<FileSet>,
}

impl Loop {
    fn build(b: &Bindings) -> Result<Loop, EffectError> {
        Ok(Loop {
            file_reps: b.variable("file_reps")?,
            file_delay: b.variable("file_delay")?,
            group_delay: b.variable("group_delay")?,
            main: b.fileset("main")?,
        })
    }

    async fn run_on(&mut self, ctx: &RunContext, members: &Arc<dyn IdSet>, fx: &Arc<EffectContext>) {
        while !ctx.is_cancelled() {
            let reps = self.file_reps.value_int();
            let delay = self.file_delay.mean_duration();
            let jitter = self.file_delay.variance_duration();

            let spec = match ctx.deadline() {
                Some(deadline) => {
                    let spec = self.main.pick_carefully(deadline, reps, delay, jitter);
                    if spec.reps > 0 && spec.reps < reps.max(1) {
                        info!(
                            "cutting short {}/{} play: {} reps rather than {}",
                            spec.file.folder, spec.file.file, spec.reps, reps,
                        );
                    }
                    spec
                }
                None => PlaySpec {
                    file: self.main.pick(),
                    reps: reps.max(1),
                    delay,
                    jitter,
                },
            };
            if spec.reps == 0 {
                // Nothing fits before the deadline.
                return;
            }

            fx.fleet.enqueue_after_delay(
                &members.snapshot(),
                ctx,
                Play { volume: 0, spec },
                Duration::ZERO,
            );

            let pause = spec.duration() + self.group_delay.duration();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = ctx.cancelled() => {}
            }
        }
    }
}

#[async_trait]
impl Algorithm for Loop {
    async fn run(
        mut self: Box<Self>,
        ctx: RunContext,
        members: Arc<dyn IdSet>,
        fx: Arc<EffectContext>,
    ) {
        self.run_on(&ctx, &members, &fx).await;
    }
}

// ------------------------------------------------------------------

/// Like [`Loop`], but fanned out one loop per device so members drift
/// through the fileset independently. A device that runs out of
/// playable time drains its own queue and leaves the set, keeping the
/// effect wrapper from draining it a second time.
struct Shuffle {
    proto: Loop,
}

#[async_trait]
impl Algorithm for Shuffle {
    async fn run(
        self: Box<Self>,
        ctx: RunContext,
        members: Arc<dyn IdSet>,
        fx: Arc<EffectContext>,
    ) {
        let proto = self.proto.clone();
        let launch_ctx = ctx.clone();
        let launch_members = members.clone();
        let launch_fx = fx.clone();

        let per_device: LaunchFn = Arc::new(move |id: ClientId| {
            let mut solo = proto.clone();
            let ctx = launch_ctx.clone();
            let members = launch_members.clone();
            let fx = launch_fx.clone();
            Box::pin(async move {
                solo.run_on(&ctx, &FixedIdSet::new(id.clone()), &fx).await;

                // Out of playable files before the deadline: adding
                // more members now would be a waste, so close the set,
                // and drain this device ourselves.
                info!(client = %id, "shuffle: closing and draining early");
                members.close();
                fx.drain_and_return(vec![id]).await;
            })
        });

        members.launch(ctx.clone(), per_device).await;

        // Every launched device drains itself; pull them all out of the
        // set so the effect wrapper doesn't drain them again.
        members.remove(&members.snapshot());

        // Hold the algorithm open until the deadline, so the context
        // isn't cancelled out from under loops still mid-playback.
        ctx.cancelled().await;
    }
}

// ------------------------------------------------------------------

/// A storm: intensity wanders over the effect's lifetime, steering
/// which intensity-tiered fileset feeds each device's queue and how
/// loud the playback is. Device queues are topped up whenever their
/// projected end comes within the refill threshold.
struct Storm {
    filesets: Vec<Arc<FileSet>>,
    volume_min: Variable,
    volume_max: Variable,
    intensity: Variable,
    acceleration: Variable,
    noise: Variable,
}

const QUEUE_REFILL_THRESHOLD: Duration = Duration::from_millis(1500);

impl Storm {
    fn build(b: &Bindings) -> Result<Storm, EffectError> {
        let mut filesets = Vec::new();
        for role in ["intensity1", "intensity2", "intensity3", "intensity4", "intensity5"] {
            if let Some(set) = b.fileset_opt(role) {
                filesets.push(set);
            }
        }
        if filesets.is_empty() {
            return Err(EffectError::MissingFileset {
                effect: b.effect_name().to_string(),
                role: "intensity1".to_string(),
            });
        }

        Ok(Storm {
            filesets,
            volume_min: b.variable("volume_min")?,
            volume_max: b.variable("volume_max")?,
            intensity: b.variable("intensity")?,
            acceleration: b.variable("acceleration")?,
            noise: b.variable("noise")?,
        })
    }

    /// Select the fileset for intensity `i`.
    ///
    /// `[0, 1]` is divided into one band per fileset. Within a band,
    /// the chance of using that band's fileset (rather than the one
    /// below) grows with how far into the band the intensity sits.
    fn pick_fileset<'a>(
        filesets: &'a [Arc<FileSet>],
        i: f64,
        region_draw: &mut Variable,
    ) -> &'a Arc<FileSet> {
        let count = filesets.len();
        let mut region = (i * count as f64) as usize;
        if region == 0 {
            return &filesets[0];
        }
        if region >= count {
            // i == 1.0
            return &filesets[count - 1];
        }

        let region_fraction = i * count as f64 - region as f64;
        if region_fraction < region_draw.value() {
            region -= 1;
        }
        &filesets[region]
    }
}

#[async_trait]
impl Algorithm for Storm {
    async fn run(
        mut self: Box<Self>,
        ctx: RunContext,
        members: Arc<dyn IdSet>,
        fx: Arc<EffectContext>,
    ) {
        let Some(deadline) = ctx.deadline() else {
            // Effects always run under a deadline; a storm with no
            // endpoint would never ramp back down.
            tracing::error!("storm requires a bounded effect duration");
            return;
        };

        // One ramp/hold phase scales with a typical file length.
        let total: f64 = self
            .filesets
            .iter()
            .map(|f| f.average_duration().as_secs_f64())
            .sum();
        let accel_scale = Duration::from_secs_f64(total / self.filesets.len() as f64);

        let mut wander = Wander::new(WanderConfig {
            intensity: self.intensity.clone(),
            acceleration: self.acceleration.clone(),
            noise: self.noise.clone(),
            accel_scale,
            deadline,
        });

        let volume_min = self.volume_min.value();
        let volume_max = self.volume_max.value();
        let volume_half = (volume_min + volume_max) / 2.0;
        let mut region_draw = Variable::new(&RandomConfig {
            mean: 0.5,
            variance: 0.5,
            distribution: Distribution::Uniform,
            ..Default::default()
        });

        while !ctx.is_cancelled() {
            let i = wander.value();

            // Volume interpolates in two segments meeting at
            // volume_half, so the quiet fifth of the range covers half
            // the dynamic range.
            let volume = if i < 0.2 {
                scale(i, 0.0, 0.2, volume_min, volume_half)
            } else {
                scale(i, 0.2, 1.0, volume_half, volume_max)
            } as u8;

            let fileset = Self::pick_fileset(&self.filesets, i, &mut region_draw);
            debug!(intensity = i, volume, fileset = fileset.name(), "storm tick");

            for id in members.snapshot() {
                // Keep each device's queue topped up through the next
                // refill threshold.
                while fx
                    .fleet
                    .sound_ends(&id)
                    .saturating_duration_since(Instant::now())
                    < QUEUE_REFILL_THRESHOLD
                {
                    let spec = PlaySpec {
                        file: fileset.pick(),
                        reps: 1,
                        delay: Duration::ZERO,
                        jitter: Duration::ZERO,
                    };
                    fx.fleet.enqueue_after_end(
                        &[id.clone()],
                        &ctx,
                        Play { volume, spec },
                        Duration::ZERO,
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.cancelled() => {}
            }
        }
    }
}

fn scale(value: f64, domain_min: f64, domain_max: f64, range_min: f64, range_max: f64) -> f64 {
    let slope = (range_max - range_min) / (domain_max - domain_min);
    (value - domain_min) * slope + range_min
}
