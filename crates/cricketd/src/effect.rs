//! Effects: algorithms bound to their configured parameters.
//!
//! An algorithm is registered as a *builder*: a closure that takes the
//! effect's resolved bindings (parameter shapes and filesets, looked up
//! by role name) and either produces a runnable instance or explains
//! what's missing. Effects run the builder once at startup so a bad
//! config dies before the fleet exists, and then once per launch so
//! every run starts from freshly initialized random variables.
//!
//! When an algorithm returns, the effect closes its membership set,
//! then polls each device's pending queue until it reports empty,
//! returning devices to the broker in one-second batches as they
//! drain. The batching avoids a thundering-herd reallocation after
//! long effects.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::fileset::FileSet;
use crate::fleet::Fleet;
use crate::idset::IdSet;
use crate::lease::{BrokerHandle, HolderRunner, Lease, LeaseError};
use crate::random::Variable;
use crate::requests::DrainQueue;
use crate::types::{ClientId, LeaseClass};
use cricketconf::{EffectConfig, RandomConfig};

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("no {class}-type algorithm named {algorithm:?} (effect {effect:?})")]
    UnknownAlgorithm {
        class: LeaseClass,
        algorithm: String,
        effect: String,
    },

    #[error("effect {effect:?}: no parameter configured for role {role:?}")]
    MissingParameter { effect: String, role: String },

    #[error("effect {effect:?}: no fileset configured for role {role:?}")]
    MissingFileset { effect: String, role: String },

    #[error("effect {effect:?}: fileset role {role:?} names unknown fileset {name:?}")]
    UnknownFileset {
        effect: String,
        role: String,
        name: String,
    },

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// The resolved inputs an algorithm builder draws from: parameter
/// shapes and filesets, keyed by the role names the algorithm asks for.
pub struct Bindings {
    effect: String,
    parameters: HashMap<String, RandomConfig>,
    filesets: HashMap<String, Arc<FileSet>>,
}

impl Bindings {
    /// A fresh [`Variable`] for the named parameter role.
    pub fn variable(&self, role: &str) -> Result<Variable, EffectError> {
        self.parameters
            .get(role)
            .map(Variable::new)
            .ok_or_else(|| EffectError::MissingParameter {
                effect: self.effect.clone(),
                role: role.to_string(),
            })
    }

    /// The fileset bound to the named role.
    pub fn fileset(&self, role: &str) -> Result<Arc<FileSet>, EffectError> {
        self.filesets
            .get(role)
            .cloned()
            .ok_or_else(|| EffectError::MissingFileset {
                effect: self.effect.clone(),
                role: role.to_string(),
            })
    }

    /// The fileset bound to the named role, if any. For algorithms with
    /// optional roles (storm's intensity tiers).
    pub fn fileset_opt(&self, role: &str) -> Option<Arc<FileSet>> {
        self.filesets.get(role).cloned()
    }

    pub fn effect_name(&self) -> &str {
        &self.effect
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        effect: &str,
        parameters: HashMap<String, RandomConfig>,
        filesets: HashMap<String, Arc<FileSet>>,
    ) -> Bindings {
        Bindings {
            effect: effect.to_string(),
            parameters,
            filesets,
        }
    }
}

/// A runnable algorithm instance. Consumed by `run`: each launch builds
/// a fresh instance, so parameter state never leaks between runs.
#[async_trait]
pub trait Algorithm: Send {
    async fn run(self: Box<Self>, ctx: RunContext, members: Arc<dyn IdSet>, fx: Arc<EffectContext>);
}

/// Builds an algorithm instance from an effect's bindings.
pub type AlgorithmBuilder =
    Arc<dyn Fn(&Bindings) -> Result<Box<dyn Algorithm>, EffectError> + Send + Sync>;

/// Registry of named algorithms, keyed by lease class. Built before the
/// workers start and read-only afterwards. Duplicate registrations
/// overwrite (last wins).
#[derive(Default)]
pub struct Registry {
    algorithms: HashMap<(LeaseClass, String), AlgorithmBuilder>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Every algorithm the daemon ships with.
    pub fn builtin() -> Registry {
        let mut registry = Registry::new();
        crate::sound::register(&mut registry);
        crate::light::register(&mut registry);
        registry
    }

    pub fn register_sound(&mut self, name: &str, builder: AlgorithmBuilder) {
        self.algorithms
            .insert((LeaseClass::Sound, name.to_string()), builder);
    }

    pub fn register_light(&mut self, name: &str, builder: AlgorithmBuilder) {
        self.algorithms
            .insert((LeaseClass::Light, name.to_string()), builder);
    }

    fn lookup(
        &self,
        class: LeaseClass,
        algorithm: &str,
        effect: &str,
    ) -> Result<AlgorithmBuilder, EffectError> {
        self.algorithms
            .get(&(class, algorithm.to_string()))
            .cloned()
            .ok_or_else(|| EffectError::UnknownAlgorithm {
                class,
                algorithm: algorithm.to_string(),
                effect: effect.to_string(),
            })
    }
}

/// What algorithms get to touch while running: the device registry for
/// enqueueing, and the broker for giving devices back.
pub struct EffectContext {
    pub fleet: Arc<Fleet>,
    pub broker: BrokerHandle,
    pub class: LeaseClass,
}

impl EffectContext {
    /// Drain the given devices' pending queues and return each to the
    /// broker as it empties. Acks are collected continuously but
    /// returns go out once a second; slow devices get named in the log
    /// after ten seconds.
    pub async fn drain_and_return(&self, clients: Vec<ClientId>) {
        if clients.is_empty() {
            return;
        }
        let drain_tag = client_hash(&clients);

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        self.fleet.enqueue_after_delay(
            &clients,
            &RunContext::background(),
            DrainQueue {
                ack: ack_tx,
                class: self.class,
            },
            Duration::ZERO,
        );

        let start = Instant::now();
        let mut remaining: HashSet<ClientId> = clients.into_iter().collect();
        let mut drained: Vec<ClientId> = Vec::new();
        let mut ticker =
            tokio::time::interval_at(start + Duration::from_secs(1), Duration::from_secs(1));

        while !remaining.is_empty() {
            tokio::select! {
                ack = ack_rx.recv() => {
                    match ack {
                        Some(id) => drained.push(id),
                        None => {
                            // Every pending poll was dropped (devices
                            // torn down mid-drain); nothing will ack.
                            warn!(
                                "[drain {drain_tag:016x}] abandoned with {} clients undrained",
                                remaining.len(),
                            );
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !drained.is_empty() {
                        for id in &drained {
                            remaining.remove(id);
                        }
                        self.broker.return_clients(std::mem::take(&mut drained));
                    }
                    let elapsed = start.elapsed();
                    if elapsed > Duration::from_secs(10) && !remaining.is_empty() {
                        let stragglers: Vec<&ClientId> = remaining.iter().collect();
                        info!(
                            "[drain {drain_tag:016x}] {} clients still draining after {:.1}s: {stragglers:?}",
                            remaining.len(),
                            elapsed.as_secs_f64(),
                        );
                    }
                }
            }
        }

        // Acks collected since the last tick (only reachable via the
        // abandoned-drain path).
        if !drained.is_empty() {
            self.broker.return_clients(drained);
        }
    }
}

// A stable tag for correlating one drain's log lines.
fn client_hash(clients: &[ClientId]) -> u64 {
    let mut sorted: Vec<&ClientId> = clients.iter().collect();
    sorted.sort();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for id in sorted {
        id.hash(&mut hasher);
    }
    hasher.finish()
}

struct EffectInner {
    name: String,
    class: LeaseClass,
    builder: AlgorithmBuilder,
    bindings: Bindings,
    duration: Mutex<Variable>,
    skip_drain: AtomicBool,
    fx: Arc<EffectContext>,
}

/// One configured effect. Implements [`HolderRunner`], so the broker
/// launches it directly whenever its holder goes active.
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Effect {
    /// Compile an effect config. The algorithm builder runs once here
    /// (and is discarded) so that missing parameters, missing filesets,
    /// and dangling references are startup errors, not launch-time
    /// surprises.
    pub fn new(
        name: &str,
        config: &EffectConfig,
        registry: &Registry,
        filesets: &HashMap<String, Arc<FileSet>>,
        fx: Arc<EffectContext>,
    ) -> Result<(Effect, Lease), EffectError> {
        let lease = Lease::new(&config.lease, name)?;
        let builder = registry.lookup(lease.class, &config.algorithm, name)?;

        let mut resolved = HashMap::new();
        for (role, fileset_name) in &config.filesets {
            let set = filesets
                .get(fileset_name)
                .ok_or_else(|| EffectError::UnknownFileset {
                    effect: name.to_string(),
                    role: role.clone(),
                    name: fileset_name.clone(),
                })?;
            resolved.insert(role.clone(), set.clone());
        }

        let bindings = Bindings {
            effect: name.to_string(),
            parameters: config.parameters.clone(),
            filesets: resolved,
        };

        builder(&bindings)?;

        Ok((
            Effect {
                inner: Arc::new(EffectInner {
                    name: name.to_string(),
                    class: lease.class,
                    builder,
                    bindings,
                    duration: Mutex::new(Variable::new(&config.duration)),
                    skip_drain: AtomicBool::new(false),
                    fx,
                }),
            },
            lease,
        ))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn class(&self) -> LeaseClass {
        self.inner.class
    }

    /// Testing knob: run the algorithm but skip the queue drain.
    pub fn set_skip_drain(&self) {
        self.inner.skip_drain.store(true, Ordering::SeqCst);
    }

    /// One run, start to finish: build a fresh algorithm instance, give
    /// it a deadline context, and when it returns, close the set and
    /// drain whatever the run enqueued.
    pub(crate) async fn run_to_completion(inner: Arc<EffectInner>, members: Arc<dyn IdSet>) {
        let algorithm = match (inner.builder)(&inner.bindings) {
            Ok(algorithm) => algorithm,
            Err(err) => {
                // Can't happen: the builder succeeded at startup.
                error!(effect = %inner.name, "algorithm construction failed: {err}");
                members.close();
                return;
            }
        };

        let duration = inner.duration.lock().unwrap().duration();
        let ctx = RunContext::with_timeout(duration);
        info!(effect = %inner.name, class = %inner.class, ?duration,
            members = members.describe(), "effect starting");

        algorithm.run(ctx.clone(), members.clone(), inner.fx.clone()).await;

        info!(effect = %inner.name, "effect finished");
        ctx.cancel();
        members.close();

        if !inner.skip_drain.load(Ordering::SeqCst) {
            inner.fx.drain_and_return(members.snapshot()).await;
        }
    }
}

impl HolderRunner for Effect {
    fn run(&self, members: Arc<dyn IdSet>) {
        let inner = self.inner.clone();
        tokio::spawn(Effect::run_to_completion(inner, members));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idset::FixedIdSet;
    use crate::lease::Broker;
    use crate::types::PhysLocation;
    use cricketconf::LeaseConfig;
    use std::sync::atomic::AtomicUsize;

    fn sound_fx() -> Arc<EffectContext> {
        let broker = Broker::new(LeaseClass::Sound);
        let handle = broker.handle();
        broker.start();
        Arc::new(EffectContext {
            fleet: Fleet::new(24, HashMap::new(), false),
            broker: handle,
            class: LeaseClass::Sound,
        })
    }

    fn filesets() -> HashMap<String, Arc<FileSet>> {
        let files = HashMap::from([(
            "chirp".to_string(),
            cricketconf::FileConfig {
                folder: 1,
                file: 1,
                duration: 2.0,
            },
        )]);
        HashMap::from([(
            "chirps".to_string(),
            Arc::new(FileSet::new("chirps", ".*", &files).unwrap()),
        )])
    }

    fn effect_config(algorithm: &str) -> EffectConfig {
        EffectConfig {
            algorithm: algorithm.to_string(),
            filesets: HashMap::from([("main".to_string(), "chirps".to_string())]),
            parameters: HashMap::from([
                ("file_reps".to_string(), RandomConfig::fixed(1.0)),
                ("file_delay".to_string(), RandomConfig::fixed(0.0)),
                ("group_delay".to_string(), RandomConfig::fixed(0.0)),
            ]),
            duration: RandomConfig::fixed(10.0),
            lease: LeaseConfig {
                class: "sound".to_string(),
                weight: 1.0,
                fleet_fraction: Some(RandomConfig::fixed(1.0)),
                ..Default::default()
            },
        }
    }

    /// A recording algorithm: remembers that it ran and with which
    /// members, then returns immediately.
    struct Recorder {
        runs: Arc<AtomicUsize>,
        members_seen: Arc<Mutex<Vec<ClientId>>>,
        reps: Variable,
    }

    fn register_recorder(
        registry: &mut Registry,
        runs: Arc<AtomicUsize>,
        members_seen: Arc<Mutex<Vec<ClientId>>>,
    ) {
        registry.register_sound(
            "recorder",
            Arc::new(move |bindings| {
                Ok(Box::new(Recorder {
                    runs: runs.clone(),
                    members_seen: members_seen.clone(),
                    reps: bindings.variable("file_reps")?,
                }))
            }),
        );
    }

    #[async_trait]
    impl Algorithm for Recorder {
        async fn run(
            mut self: Box<Self>,
            _ctx: RunContext,
            members: Arc<dyn IdSet>,
            _fx: Arc<EffectContext>,
        ) {
            assert_eq!(self.reps.value(), 1.0);
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.members_seen
                .lock()
                .unwrap()
                .extend(members.snapshot());
        }
    }

    #[tokio::test]
    async fn builds_and_runs_with_bound_parameters() {
        let mut registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        register_recorder(&mut registry, runs.clone(), seen.clone());

        let (effect, lease) = Effect::new(
            "recorded",
            &effect_config("recorder"),
            &registry,
            &filesets(),
            sound_fx(),
        )
        .unwrap();
        assert_eq!(lease.class, LeaseClass::Sound);
        effect.set_skip_drain();

        let members = FixedIdSet::new(ClientId::from("c00"));
        Effect::run_to_completion(effect.inner.clone(), members).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![ClientId::from("c00")]);
    }

    #[tokio::test]
    async fn same_algorithm_two_effects_stay_independent() {
        let mut registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        register_recorder(&mut registry, runs.clone(), seen.clone());

        let fx = sound_fx();
        let (e1, _) = Effect::new(
            "first",
            &effect_config("recorder"),
            &registry,
            &filesets(),
            fx.clone(),
        )
        .unwrap();
        let (e2, _) = Effect::new(
            "second",
            &effect_config("recorder"),
            &registry,
            &filesets(),
            fx,
        )
        .unwrap();
        e1.set_skip_drain();
        e2.set_skip_drain();

        Effect::run_to_completion(e1.inner.clone(), FixedIdSet::new(ClientId::from("a"))).await;
        Effect::run_to_completion(e2.inner.clone(), FixedIdSet::new(ClientId::from("b"))).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ClientId::from("a"), ClientId::from("b")]
        );
    }

    #[tokio::test]
    async fn unknown_algorithm_is_a_startup_error() {
        let registry = Registry::new();
        let err = Effect::new(
            "broken",
            &effect_config("loop"),
            &registry,
            &filesets(),
            sound_fx(),
        )
        .unwrap_err();
        assert!(matches!(err, EffectError::UnknownAlgorithm { .. }));
    }

    #[tokio::test]
    async fn missing_parameter_is_a_startup_error() {
        let mut registry = Registry::new();
        registry.register_sound(
            "needy",
            Arc::new(|bindings| {
                bindings.variable("does_not_exist")?;
                unreachable!()
            }),
        );

        let err = Effect::new(
            "broken",
            &effect_config("needy"),
            &registry,
            &filesets(),
            sound_fx(),
        )
        .unwrap_err();
        match err {
            EffectError::MissingParameter { effect, role } => {
                assert_eq!(effect, "broken");
                assert_eq!(role, "does_not_exist");
            }
            other => panic!("wanted MissingParameter, got {other}"),
        }
    }

    #[tokio::test]
    async fn dangling_fileset_reference_is_a_startup_error() {
        let mut registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        register_recorder(&mut registry, runs, seen);

        let mut config = effect_config("recorder");
        config
            .filesets
            .insert("main".to_string(), "no-such-set".to_string());

        let err = Effect::new("broken", &config, &registry, &filesets(), sound_fx()).unwrap_err();
        assert!(matches!(err, EffectError::UnknownFileset { .. }));
    }

    #[tokio::test]
    async fn duplicate_registration_last_wins() {
        let mut registry = Registry::new();
        let first_runs = Arc::new(AtomicUsize::new(0));
        let second_runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        register_recorder(&mut registry, first_runs.clone(), seen.clone());

        // Re-register under the same name.
        let runs = second_runs.clone();
        let members_seen = seen.clone();
        registry.register_sound(
            "recorder",
            Arc::new(move |bindings| {
                Ok(Box::new(Recorder {
                    runs: runs.clone(),
                    members_seen: members_seen.clone(),
                    reps: bindings.variable("file_reps")?,
                }))
            }),
        );

        let (effect, _) = Effect::new(
            "latest",
            &effect_config("recorder"),
            &registry,
            &filesets(),
            sound_fx(),
        )
        .unwrap();
        effect.set_skip_drain();
        Effect::run_to_completion(effect.inner.clone(), FixedIdSet::new(ClientId::from("x"))).await;

        assert_eq!(first_runs.load(Ordering::SeqCst), 0);
        assert_eq!(second_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_hash_is_order_independent() {
        let a = vec![ClientId::from("x"), ClientId::from("y")];
        let b = vec![ClientId::from("y"), ClientId::from("x")];
        assert_eq!(client_hash(&a), client_hash(&b));
        assert_ne!(client_hash(&a), client_hash(&[ClientId::from("z")]));
    }
}
