//! Lease brokering: deciding which effects get which devices.
//!
//! One broker per lease class. Each configured effect is assigned to
//! its broker at startup as a (lease, holder) pair; from then on the
//! broker autonomously rotates the fleet through holders. When part of
//! the fleet is unspoken-for, dormant holders are activated in weighted
//! random order, each drawing a fresh fleet fraction; arrivals and
//! returned devices are then dealt out to active holders, again by
//! weighted rotation. A holder whose effect has finished (producer
//! closed) or that has sat dormant too long is reset and its claim on
//! the fleet reclaimed.
//!
//! All broker state lives in a single worker task fed by one channel,
//! so arrivals, returns, and launch nudges are observed in order with
//! no locking. `HolderRunner::run` is invoked from that worker and must
//! return quickly — implementations spawn their real work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::idset::{IdSet, IdSetProducer};
use crate::random::Variable;
use crate::types::{ClientId, LeaseClass, PhysLocation};
use crate::weightedset::WeightedSet;
use cricketconf::{Distribution, LeaseConfig, RandomConfig};

/// Treat the fleet as fully spoken-for above this fraction.
const FULLY_LEASED: f64 = 0.9999;

/// Dormant holders older than this get their fraction reclaimed.
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease {name:?}: min_clients {min} > max_clients {max}")]
    MinOverMax {
        name: String,
        min: usize,
        max: usize,
    },

    #[error("lease {name:?}: max_clients and max_fleet_fraction are mutually exclusive")]
    TwoMaxes { name: String },

    #[error("lease {name:?}: {problem}")]
    BadClass { name: String, problem: String },

    #[error("no holder named {name:?}")]
    UnknownHolder { name: String },

    #[error("holder {name:?} is not dormant")]
    NotDormant { name: String },

    #[error("{class} broker worker is gone")]
    BrokerGone { class: LeaseClass },
}

/// Compiled form of a lease config.
#[derive(Debug)]
pub struct Lease {
    pub class: LeaseClass,
    pub weight: f64,
    min_clients: usize,
    max_clients: Option<usize>,
    max_fleet_fraction: Option<f64>,
    fleet_fraction: Variable,
}

impl Lease {
    pub fn new(config: &LeaseConfig, name: &str) -> Result<Lease, LeaseError> {
        let class: LeaseClass = config
            .class
            .parse()
            .map_err(|problem| LeaseError::BadClass {
                name: name.to_string(),
                problem,
            })?;

        if config.max_clients > 0 && config.max_fleet_fraction > 0.0 {
            return Err(LeaseError::TwoMaxes {
                name: name.to_string(),
            });
        }
        if config.max_clients > 0 && config.min_clients > config.max_clients {
            return Err(LeaseError::MinOverMax {
                name: name.to_string(),
                min: config.min_clients,
                max: config.max_clients,
            });
        }

        let fraction_config = config.fleet_fraction.clone().unwrap_or(RandomConfig {
            mean: 0.5,
            variance: 0.2,
            distribution: Distribution::Normal,
            ..Default::default()
        });

        Ok(Lease {
            class,
            weight: config.weight,
            min_clients: config.min_clients,
            max_clients: (config.max_clients > 0).then_some(config.max_clients),
            max_fleet_fraction: (config.max_fleet_fraction > 0.0)
                .then_some(config.max_fleet_fraction),
            fleet_fraction: Variable::new(&fraction_config),
        })
    }
}

/// The effect side of a holder. `run` is called from the broker worker
/// when the holder's membership first reaches `min_clients`; it must
/// kick off its own task and return immediately.
pub trait HolderRunner: Send + Sync {
    fn run(&self, members: Arc<dyn IdSet>);
}

/// Registry entry pairing a lease with an effect, plus the broker's
/// per-holder allocation state.
struct Holder {
    name: String,
    lease: Lease,
    runner: Arc<dyn HolderRunner>,

    /// Membership producer; `None` while dormant.
    producer: Option<IdSetProducer>,
    /// The fleet fraction drawn at activation.
    target_fraction: f64,
    /// How many clients this holder should end up with. Monotone
    /// non-decreasing while active.
    target_count: usize,
    /// When the holder was last activated (or created / reset).
    init_time: Instant,
    /// Whether `run` has been invoked for the current activation.
    started: bool,
    /// Testing knob: a disabled holder is never considered dormant, so
    /// it can't be activated.
    disabled: bool,
}

impl Holder {
    fn new(lease: Lease, runner: Arc<dyn HolderRunner>, name: String) -> Holder {
        Holder {
            name,
            lease,
            runner,
            producer: None,
            target_fraction: 0.0,
            target_count: 0,
            init_time: Instant::now(),
            started: false,
            disabled: false,
        }
    }

    fn is_dormant(&self) -> bool {
        self.target_count == 0 && !self.disabled
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.is_dormant() && now.saturating_duration_since(self.init_time) > STALE_AFTER
    }

    fn is_closed(&self) -> bool {
        self.producer.as_ref().is_some_and(|p| p.closed())
    }

    fn clients_wanted(&self) -> usize {
        match &self.producer {
            Some(producer) => self.target_count.saturating_sub(producer.size()),
            None => 0,
        }
    }

    /// Draw this activation's fleet fraction: clamped to [0, 1], then
    /// capped by max_fleet_fraction.
    fn draw_fraction(&mut self) -> f64 {
        let drawn = self.lease.fleet_fraction.value().clamp(0.0, 1.0);
        match self.lease.max_fleet_fraction {
            Some(cap) => drawn.min(cap),
            None => drawn,
        }
    }

    fn init(&mut self, fraction: f64) {
        self.target_fraction = fraction;
        self.init_time = Instant::now();
        self.producer = Some(IdSetProducer::new());
    }

    fn set_target_count(&mut self, count: usize) {
        assert!(
            count >= self.target_count,
            "holder {:?}: target client count would shrink ({} -> {})",
            self.name,
            self.target_count,
            count,
        );
        self.target_count = count;
    }

    /// Hand clients to the holder's producer. Returns false if the
    /// producer refused (closed in between broker decisions). Starts
    /// the effect once membership first reaches `min_clients`.
    fn add_clients(&mut self, clients: &[ClientId]) -> bool {
        let Some(producer) = &self.producer else {
            return false;
        };
        if !producer.add(clients) {
            return false;
        }
        if !self.started && producer.size() >= self.lease.min_clients {
            self.started = true;
            self.runner.run(producer.consumer());
        }
        true
    }

    fn reset(&mut self) {
        self.producer = None;
        self.target_fraction = 0.0;
        self.target_count = 0;
        self.started = false;
        self.init_time = Instant::now();
    }
}

/// Source of the draws that rotate allocation; swapped out in tests.
type Randomizer = Box<dyn FnMut() -> f64 + Send>;

pub(crate) struct BrokerState {
    class: LeaseClass,
    locations: HashMap<ClientId, PhysLocation>,
    leased: HashMap<ClientId, bool>,
    unallocated: Vec<ClientId>,
    fleet_size: usize,
    leased_count: usize,
    /// Sum of the active holders' target fractions. Can exceed 1.
    leased_fraction: f64,
    holders: Vec<Holder>,
    /// True once the first arrival has been seen; holders must all be
    /// assigned before then.
    started: bool,
    randomizer: Randomizer,
}

impl BrokerState {
    fn new(class: LeaseClass) -> BrokerState {
        BrokerState {
            class,
            locations: HashMap::new(),
            leased: HashMap::new(),
            unallocated: Vec::new(),
            fleet_size: 0,
            leased_count: 0,
            leased_fraction: 0.0,
            holders: Vec::new(),
            started: false,
            randomizer: Box::new(|| rand::thread_rng().gen::<f64>()),
        }
    }

    /// Register an effect's (lease, holder) pair. All assignments must
    /// happen before the first arrival; anything later is a bug in
    /// startup sequencing.
    fn assign(&mut self, lease: Lease, runner: Arc<dyn HolderRunner>, name: String) {
        assert!(
            !self.started,
            "{} broker: assign({name:?}) after the first arrival",
            self.class,
        );
        self.holders.push(Holder::new(lease, runner, name));
    }

    fn add_client(&mut self, id: ClientId, location: PhysLocation) {
        self.started = true;
        if self.leased.contains_key(&id) {
            panic!("{} broker: duplicate request to add client {id:?}", self.class);
        }
        debug!(class = %self.class, client = %id, "new client");

        self.locations.insert(id.clone(), location);
        self.leased.insert(id.clone(), false);
        self.unallocated.push(id);
        self.fleet_size += 1;

        self.update_leased_fraction();
        self.update_target_counts();
        self.assign_clients();
    }

    fn return_clients(&mut self, ids: Vec<ClientId>) {
        for id in &ids {
            match self.leased.get(id) {
                None => panic!("{} broker: returning unknown client {id:?}", self.class),
                Some(false) => {
                    panic!("{} broker: returning invalid lease on {id:?}", self.class)
                }
                Some(true) => {}
            }
            self.leased.insert(id.clone(), false);
            self.unallocated.push(id.clone());
            self.leased_count -= 1;
        }
        debug!(class = %self.class, count = ids.len(), "clients returned");

        self.clean_holders();
        self.update_leased_fraction();
        self.update_target_counts();
        self.assign_clients();
    }

    /// A nudge from the player: make sure `holder` is eligible to run
    /// and rebalance. Errs if the holder is still busy (active or
    /// draining) — the player uses that to bias its retry weights.
    fn launch(&mut self, holder: &str) -> Result<(), LeaseError> {
        let h = self
            .holders
            .iter()
            .find(|h| h.name == holder)
            .ok_or_else(|| LeaseError::UnknownHolder {
                name: holder.to_string(),
            })?;
        if !h.is_dormant() {
            return Err(LeaseError::NotDormant {
                name: holder.to_string(),
            });
        }

        self.clean_holders();
        self.update_leased_fraction();
        self.update_target_counts();
        self.assign_clients();
        Ok(())
    }

    /// Reclaim holders whose effect has finished or that have sat
    /// dormant past the staleness cutoff.
    fn clean_holders(&mut self) {
        let now = Instant::now();
        for h in &mut self.holders {
            if h.is_closed() || h.is_stale(now) {
                debug!(class = %self.class, holder = %h.name,
                    fraction = h.target_fraction, "reclaiming holder");
                self.leased_fraction -= h.target_fraction;
                h.reset();
            }
        }
    }

    /// Drive the leased fraction up to "fully leased" by activating
    /// dormant holders in weighted random order, each drawing a fresh
    /// fleet fraction.
    fn update_leased_fraction(&mut self) {
        if self.leased_fraction >= FULLY_LEASED {
            return;
        }

        let mut candidates = WeightedSet::new();
        for (idx, h) in self.holders.iter().enumerate() {
            if h.is_dormant() {
                candidates.add(idx, h.lease.weight);
            }
        }

        for idx in candidates.permute(&mut self.randomizer) {
            // A dormant holder can still be carrying a sliver of the
            // fleet from an earlier activation whose target rounded to
            // zero; reclaim it so the fraction isn't counted twice.
            self.leased_fraction -= self.holders[idx].target_fraction;
            let fraction = self.holders[idx].draw_fraction();
            self.holders[idx].init(fraction);
            self.leased_fraction += fraction;
            info!(class = %self.class, holder = %self.holders[idx].name,
                fraction, total = self.leased_fraction, "activating holder");
            if self.leased_fraction >= FULLY_LEASED {
                break;
            }
        }
    }

    /// Recompute every active holder's target client count from its
    /// fraction and the current fleet size. Shrinking is a programming
    /// error (the holder panics).
    fn update_target_counts(&mut self) {
        for h in &mut self.holders {
            if h.producer.is_none() {
                continue;
            }
            let mut target = (h.target_fraction * self.fleet_size as f64).round() as usize;
            if let Some(max) = h.lease.max_clients {
                target = target.min(max);
            }
            h.set_target_count(target);
        }
    }

    /// Deal unallocated clients to holders that want more, in weighted
    /// random order. Each holder in the permutation gets as many as it
    /// wants (or as many as remain) before the next holder is
    /// considered.
    fn assign_clients(&mut self) {
        assert_eq!(
            self.fleet_size - self.leased_count,
            self.unallocated.len(),
            "{} broker: fleet accounting out of balance",
            self.class,
        );

        let mut wanters = WeightedSet::new();
        for (idx, h) in self.holders.iter().enumerate() {
            if h.clients_wanted() > 0 {
                wanters.add(idx, h.lease.weight);
            }
        }
        if wanters.is_empty() {
            debug!(class = %self.class, "no holders want clients");
            return;
        }

        for idx in wanters.permute(&mut self.randomizer) {
            if self.unallocated.is_empty() {
                break;
            }
            let count = self.holders[idx]
                .clients_wanted()
                .min(self.unallocated.len());
            if count == 0 {
                continue;
            }

            let batch: Vec<ClientId> = self.unallocated[..count].to_vec();
            if self.holders[idx].add_clients(&batch) {
                self.unallocated.drain(..count);
                for id in &batch {
                    self.leased.insert(id.clone(), true);
                }
                self.leased_count += count;
                debug!(class = %self.class, holder = %self.holders[idx].name,
                    count, "assigned clients");
            } else {
                // Producer closed between broker decisions; reclaim and
                // leave the clients in the pool for the next wanter.
                warn!(class = %self.class, holder = %self.holders[idx].name,
                    "holder refused clients; resetting");
                self.leased_fraction -= self.holders[idx].target_fraction;
                self.holders[idx].reset();
            }
        }
    }
}

enum BrokerMessage {
    AddClient {
        id: ClientId,
        location: PhysLocation,
    },
    Return {
        ids: Vec<ClientId>,
    },
    Launch {
        holder: String,
        reply: oneshot::Sender<Result<(), LeaseError>>,
    },
}

/// A per-class broker, built and populated at startup, then converted
/// into a worker task via [`Broker::start`].
///
/// The handle can be taken (and cloned) before the worker starts;
/// messages sent early just queue until it does.
pub struct Broker {
    state: BrokerState,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
}

impl Broker {
    pub fn new(class: LeaseClass) -> Broker {
        let (tx, rx) = mpsc::unbounded_channel();
        Broker {
            state: BrokerState::new(class),
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            class: self.state.class,
            tx: self.tx.clone(),
        }
    }

    /// Register an effect before the broker starts.
    pub fn assign(&mut self, lease: Lease, runner: Arc<dyn HolderRunner>, name: &str) {
        self.state.assign(lease, runner, name.to_string());
    }

    /// Spawn the worker.
    pub fn start(self) {
        let mut state = self.state;
        let mut rx = self.rx;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    BrokerMessage::AddClient { id, location } => state.add_client(id, location),
                    BrokerMessage::Return { ids } => state.return_clients(ids),
                    BrokerMessage::Launch { holder, reply } => {
                        let _ = reply.send(state.launch(&holder));
                    }
                }
            }
        });
    }
}

/// Cheap-to-clone handle used by discovery (arrivals), effects
/// (returns), and players (launch nudges).
#[derive(Clone)]
pub struct BrokerHandle {
    class: LeaseClass,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl BrokerHandle {
    pub fn class(&self) -> LeaseClass {
        self.class
    }

    pub fn add_client(&self, id: ClientId, location: PhysLocation) {
        if self.tx.send(BrokerMessage::AddClient { id, location }).is_err() {
            warn!(class = %self.class, "broker worker is gone; dropping arrival");
        }
    }

    pub fn return_clients(&self, ids: Vec<ClientId>) {
        if ids.is_empty() {
            return;
        }
        if self.tx.send(BrokerMessage::Return { ids }).is_err() {
            warn!(class = %self.class, "broker worker is gone; dropping return");
        }
    }

    pub async fn launch(&self, holder: &str) -> Result<(), LeaseError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BrokerMessage::Launch {
                holder: holder.to_string(),
                reply,
            })
            .map_err(|_| LeaseError::BrokerGone { class: self.class })?;
        rx.await.map_err(|_| LeaseError::BrokerGone { class: self.class })?
    }
}
