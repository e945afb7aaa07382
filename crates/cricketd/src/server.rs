//! The server: one value that owns everything.
//!
//! Construction compiles the configuration into runtime state — file
//! catalog into filesets, effect descriptions into effects assigned to
//! their brokers, player weights into players — and fails loudly on
//! anything dangling. Nothing here is a process-wide singleton; tests
//! build as many servers as they like.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::discovery::Announcement;
use crate::effect::{Effect, EffectContext, EffectError, Registry};
use crate::fileset::{FileSet, FilesetError};
use crate::fleet::{ClientInfo, Fleet};
use crate::lease::Broker;
use crate::player::{Player, PlayerError};
use crate::types::{ClientId, LeaseClass, PerClass};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Fileset(#[from] FilesetError),

    #[error("failed to compile effect: {0}")]
    Effect(#[from] EffectError),

    #[error(transparent)]
    Player(#[from] PlayerError),
}

pub struct Server {
    fleet: Arc<Fleet>,
    brokers: PerClass<Broker>,
    players: Vec<(LeaseClass, Player)>,
}

impl Server {
    /// Compile a validated config. `virtual_mode` routes every device
    /// request through one shared listener (the virtual cricket).
    pub fn new(config: &cricketconf::Config, virtual_mode: bool) -> Result<Server, ServerError> {
        let registry = Registry::builtin();

        let mut filesets: HashMap<String, Arc<FileSet>> = HashMap::new();
        for (name, fs) in &config.filesets {
            filesets.insert(
                name.clone(),
                Arc::new(FileSet::new(name, &fs.regex, &config.files)?),
            );
        }

        let roster: HashMap<ClientId, ClientInfo> = config
            .clients
            .iter()
            .map(|(id, client)| {
                (
                    ClientId::from(id.as_str()),
                    ClientInfo {
                        name: client.name.clone(),
                        phys_location: Default::default(),
                    },
                )
            })
            .collect();
        let fleet = Fleet::new(config.default_volume as u8, roster, virtual_mode);

        let mut brokers = PerClass {
            sound: Broker::new(LeaseClass::Sound),
            light: Broker::new(LeaseClass::Light),
        };
        let contexts = PerClass {
            sound: Arc::new(EffectContext {
                fleet: fleet.clone(),
                broker: brokers.sound.handle(),
                class: LeaseClass::Sound,
            }),
            light: Arc::new(EffectContext {
                fleet: fleet.clone(),
                broker: brokers.light.handle(),
                class: LeaseClass::Light,
            }),
        };

        let mut effect_names: PerClass<Vec<String>> = PerClass::default();
        for (name, effect_config) in &config.effects {
            // Validated config guarantees the class parses.
            let class: LeaseClass = effect_config
                .lease
                .class
                .parse()
                .expect("config validation missed a lease class");
            let (effect, lease) = Effect::new(
                name,
                effect_config,
                &registry,
                &filesets,
                contexts.get(class).clone(),
            )?;
            brokers.get_mut(class).assign(lease, Arc::new(effect), name);
            effect_names.get_mut(class).push(name.clone());
            info!(effect = %name, class = %class, "effect compiled");
        }

        let mut players = Vec::new();
        for (class_name, player_config) in &config.players {
            let class: LeaseClass = class_name
                .parse()
                .expect("config validation missed a player class");
            let player = Player::new(
                class,
                player_config,
                effect_names.get(class).iter().map(String::as_str),
            )?;
            players.push((class, player));
        }

        Ok(Server {
            fleet,
            brokers,
            players,
        })
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    /// Start every worker: brokers, announcement intake, players.
    pub fn start(self, announcements: mpsc::Receiver<Announcement>) {
        let handles = PerClass {
            sound: self.brokers.sound.handle(),
            light: self.brokers.light.handle(),
        };
        self.brokers.sound.start();
        self.brokers.light.start();

        self.fleet.spawn_intake(announcements, handles.clone());

        if self.players.is_empty() {
            warn!("no players configured; nothing will launch effects");
        }
        for (class, player) in self.players {
            player.start(handles.get(class).clone());
        }
    }
}
