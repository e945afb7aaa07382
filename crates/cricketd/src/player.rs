//! The top-level launcher: one player per lease class.
//!
//! A player repeatedly picks an effect — probability proportional to
//! its current weight — and nudges the broker to launch it. A nudge
//! that fails (the effect is still running, or still draining) bumps
//! that effect's weight so it's more likely to be retried; a success
//! resets the weight to its configured base. The broker's own weighted
//! rotation keeps allocation fair; the player paces the churn.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use crate::lease::BrokerHandle;
use crate::random::Variable;
use crate::types::LeaseClass;
use cricketconf::PlayerConfig;

/// Floor on the inter-launch delay, to avoid spinning on a broker that
/// has nothing to give.
const MIN_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("{class} player references unknown effect {effect:?}")]
    UnknownEffect { class: LeaseClass, effect: String },
}

struct WeightedEffect {
    name: String,
    base_weight: f64,
    weight: f64,
}

pub struct Player {
    class: LeaseClass,
    startup_delay: Variable,
    delay: Variable,
    effects: Vec<WeightedEffect>,
}

impl Player {
    /// `known_effects` is the set of effect names registered with this
    /// class's broker; weights naming anything else are config errors.
    pub fn new<'a, I>(
        class: LeaseClass,
        config: &PlayerConfig,
        known_effects: I,
    ) -> Result<Player, PlayerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: Vec<&str> = known_effects.into_iter().collect();
        let mut effects = Vec::new();
        for (name, weight) in &config.weights {
            if !known.contains(&name.as_str()) {
                return Err(PlayerError::UnknownEffect {
                    class,
                    effect: name.clone(),
                });
            }
            effects.push(WeightedEffect {
                name: name.clone(),
                base_weight: *weight,
                weight: *weight,
            });
        }
        // Deterministic iteration order regardless of config map order.
        effects.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Player {
            class,
            startup_delay: Variable::new(&config.startup_delay),
            delay: Variable::new(&config.delay),
            effects,
        })
    }

    /// Run the launch loop forever.
    pub fn start(mut self, broker: BrokerHandle) {
        tokio::spawn(async move {
            let startup = self.startup_delay.duration();
            debug!(class = %self.class, ?startup, "player waiting to start");
            tokio::time::sleep(startup).await;
            info!(class = %self.class, effects = self.effects.len(), "player starting");

            loop {
                let draw = rand::thread_rng().gen::<f64>();
                if let Some(idx) = self.pick(draw) {
                    let name = self.effects[idx].name.clone();
                    let launched = broker.launch(&name).await;
                    match &launched {
                        Ok(()) => info!(class = %self.class, effect = %name, "launched"),
                        Err(err) => {
                            debug!(class = %self.class, effect = %name, "launch failed: {err}")
                        }
                    }
                    self.note_result(idx, launched.is_ok());
                }

                let pause = self.delay.duration().max(MIN_DELAY);
                tokio::time::sleep(pause).await;
            }
        });
    }

    /// Weighted pick: `draw` in [0, 1) selects an effect index with
    /// probability proportional to current weight.
    fn pick(&self, draw: f64) -> Option<usize> {
        let sum: f64 = self.effects.iter().map(|e| e.weight).sum();
        if sum <= 0.0 {
            return None;
        }
        let mut target = draw * sum;
        for (idx, effect) in self.effects.iter().enumerate() {
            target -= effect.weight;
            if target <= 0.0 {
                return Some(idx);
            }
        }
        Some(self.effects.len() - 1)
    }

    /// Successful launches reset the weight; failures bump it so the
    /// effect is likelier to be retried next round.
    fn note_result(&mut self, idx: usize, launched: bool) {
        let effect = &mut self.effects[idx];
        if launched {
            effect.weight = effect.base_weight;
        } else {
            effect.weight += 1.0;
        }
    }
}
