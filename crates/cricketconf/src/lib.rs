//! Configuration loading for the cricket server.
//!
//! This crate provides configuration parsing with minimal dependencies so
//! that every crate in the workspace can import it without dependency
//! cycles. It knows nothing about the runtime: it produces plain data
//! (file catalogs, effect descriptions, random-variable shapes) that the
//! daemon compiles into its own runtime types at startup.
//!
//! # Example Config
//!
//! ```toml
//! default_volume = 24
//!
//! [clients.a4cf12fe99c0]
//! name = "porch"
//!
//! [files.rain-soft]
//! folder = 2
//! file = 14
//! duration = 36.4
//!
//! [filesets.rain]
//! regex = "^rain-"
//!
//! [effects.drizzle]
//! algorithm = "loop"
//! duration = { mean = 120.0, variance = 30.0, distribution = "normal" }
//! lease = { class = "sound", weight = 1.0 }
//! filesets = { main = "rain" }
//! [effects.drizzle.parameters]
//! file_reps = { mean = 2.0 }
//! file_delay = { mean = 0.5, variance = 0.2, distribution = "uniform" }
//! group_delay = { mean = 3.0 }
//!
//! [players.sound]
//! startup_delay = { mean = 5.0 }
//! delay = { mean = 2.0 }
//! weights = { drizzle = 1.0 }
//! ```

pub mod loader;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("default_volume {0} is out of range (0..=48)")]
    VolumeRange(i64),

    #[error("file {name:?}: {problem}")]
    BadFile { name: String, problem: String },

    #[error("lease for effect {effect:?}: {problem}")]
    BadLease { effect: String, problem: String },

    #[error("player {player:?} is not a known lease class (sound, light)")]
    UnknownPlayerClass { player: String },

    #[error("player {player:?} references unknown effect {effect:?}")]
    UnknownPlayerEffect { player: String, effect: String },

    #[error("player {player:?} weight for effect {effect:?} is a {class} effect")]
    PlayerClassMismatch {
        player: String,
        effect: String,
        class: String,
    },

    #[error("effect {effect:?} references unknown fileset {fileset:?} for role {role:?}")]
    UnknownFileset {
        effect: String,
        fileset: String,
        role: String,
    },
}

/// The complete server configuration, as deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Volume crickets are set to on first contact (0..=48).
    #[serde(default = "default_volume")]
    pub default_volume: i64,

    /// Known clients, keyed by cricket ID.
    #[serde(default)]
    pub clients: HashMap<String, ClientConfig>,

    /// The global MP3 dictionary, keyed by a human-readable name.
    #[serde(default)]
    pub files: HashMap<String, FileConfig>,

    /// Named subsets of the file dictionary, selected by regex.
    #[serde(default)]
    pub filesets: HashMap<String, FileSetConfig>,

    /// Effect descriptions, keyed by effect name.
    #[serde(default)]
    pub effects: HashMap<String, EffectConfig>,

    /// One player per lease class, keyed by "sound" / "light".
    #[serde(default)]
    pub players: HashMap<String, PlayerConfig>,
}

fn default_volume() -> i64 {
    24 // midway between min (0) and max (48)
}

/// Per-client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// A more familiar name for the client.
    #[serde(default)]
    pub name: String,
}

/// One MP3 file as stored on the crickets' SD cards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileConfig {
    /// Folder number on the device (1..=99).
    pub folder: u8,
    /// File number within the folder (1..=255).
    pub file: u8,
    /// Playback duration in seconds, excluding any client-side delay.
    pub duration: f64,
}

/// A fileset is defined by a regex over file dictionary keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSetConfig {
    pub regex: String,
}

/// How to draw values for one random variable.
///
/// Means, variances, and delta durations are in the unit of whatever the
/// variable measures — seconds for delays and durations, plain counts for
/// reps and volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RandomConfig {
    #[serde(default)]
    pub mean: f64,
    #[serde(default)]
    pub variance: f64,
    #[serde(default)]
    pub distribution: Distribution,
    /// Optional schedule of drift applied to mean/variance over time.
    #[serde(default)]
    pub changes: Vec<DeltaConfig>,
    /// Cycle through `changes` forever instead of stopping after the last.
    #[serde(default)]
    pub repeat_changes: bool,
}

impl RandomConfig {
    /// A variable that always yields `value`. Mostly useful in tests.
    pub fn fixed(value: f64) -> Self {
        RandomConfig {
            mean: value,
            ..Default::default()
        }
    }
}

/// One linear segment of a variable's drift schedule.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Change in mean, per second.
    #[serde(default)]
    pub mean_rate: f64,
    /// Change in variance, per second.
    #[serde(default)]
    pub var_rate: f64,
    /// How long this segment lasts, in seconds.
    pub duration: f64,
}

/// Distribution used when drawing a random variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Always yields the mean.
    #[default]
    None,
    Normal,
    Uniform,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::None => write!(f, "none"),
            Distribution::Normal => write!(f, "normal"),
            Distribution::Uniform => write!(f, "uniform"),
        }
    }
}

// Distribution names in config files are case-insensitive.
impl<'de> Deserialize<'de> for Distribution {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "none" => Ok(Distribution::None),
            "normal" => Ok(Distribution::Normal),
            "uniform" => Ok(Distribution::Uniform),
            other => Err(de::Error::unknown_variant(
                other,
                &["none", "normal", "uniform"],
            )),
        }
    }
}

/// How many clients an effect wants, and how badly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// "sound" or "light" (case-insensitive).
    pub class: String,
    /// Relative weight among competing effects in the same class.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Desired fraction of the fleet. Defaults to Normal(0.5, 0.2),
    /// clamped to [0, 1] at draw time.
    #[serde(default)]
    pub fleet_fraction: Option<RandomConfig>,
    /// Minimum number of clients needed before the effect starts.
    #[serde(default)]
    pub min_clients: usize,
    /// Maximum number of clients allowed. Zero means unlimited.
    #[serde(default)]
    pub max_clients: usize,
    /// Cap on the fleet fraction. Zero means uncapped. Mutually
    /// exclusive with `max_clients`.
    #[serde(default)]
    pub max_fleet_fraction: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// One sound or light effect: an algorithm plus its bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EffectConfig {
    /// Name of a registered algorithm ("loop", "storm", "blink", ...).
    pub algorithm: String,
    /// Fileset role → fileset name.
    #[serde(default)]
    pub filesets: HashMap<String, String>,
    /// Parameter role → random variable shape.
    #[serde(default)]
    pub parameters: HashMap<String, RandomConfig>,
    /// How long one run of this effect lasts, in seconds.
    pub duration: RandomConfig,
    pub lease: LeaseConfig,
}

/// The top-level launcher for one lease class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Sleep before the first launch, in seconds.
    #[serde(default)]
    pub startup_delay: RandomConfig,
    /// Sleep between launches, in seconds (a minimum of 1s is enforced).
    #[serde(default)]
    pub delay: RandomConfig,
    /// Effect name → base weight.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = loader::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation that doesn't need the runtime: ranges,
    /// contradictory lease bounds, and dangling references. Regex
    /// compilation and algorithm lookup happen in the daemon, which
    /// owns those registries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=48).contains(&self.default_volume) {
            return Err(ConfigError::VolumeRange(self.default_volume));
        }

        for (name, f) in &self.files {
            let problem = if !(1..=99).contains(&f.folder) {
                Some(format!("folder {} out of range (1..=99)", f.folder))
            } else if f.file < 1 {
                Some(format!("file {} out of range (1..=255)", f.file))
            } else if f.duration <= 0.0 {
                Some(format!("duration {} must be positive", f.duration))
            } else {
                None
            };
            if let Some(problem) = problem {
                return Err(ConfigError::BadFile {
                    name: name.clone(),
                    problem,
                });
            }
        }

        for (name, e) in &self.effects {
            let lease = &e.lease;
            if !is_lease_class(&lease.class) {
                return Err(ConfigError::BadLease {
                    effect: name.clone(),
                    problem: format!("unknown lease class {:?}", lease.class),
                });
            }
            if lease.max_clients > 0 && lease.max_fleet_fraction > 0.0 {
                return Err(ConfigError::BadLease {
                    effect: name.clone(),
                    problem: "max_clients and max_fleet_fraction are mutually exclusive".into(),
                });
            }
            if lease.max_clients > 0 && lease.min_clients > lease.max_clients {
                return Err(ConfigError::BadLease {
                    effect: name.clone(),
                    problem: format!(
                        "min_clients {} > max_clients {}",
                        lease.min_clients, lease.max_clients
                    ),
                });
            }
            for (role, fileset) in &e.filesets {
                if !self.filesets.contains_key(fileset) {
                    return Err(ConfigError::UnknownFileset {
                        effect: name.clone(),
                        fileset: fileset.clone(),
                        role: role.clone(),
                    });
                }
            }
        }

        for (class, player) in &self.players {
            if !is_lease_class(class) {
                return Err(ConfigError::UnknownPlayerClass {
                    player: class.clone(),
                });
            }
            for effect in player.weights.keys() {
                let Some(e) = self.effects.get(effect) else {
                    return Err(ConfigError::UnknownPlayerEffect {
                        player: class.clone(),
                        effect: effect.clone(),
                    });
                };
                if !e.lease.class.eq_ignore_ascii_case(class) {
                    return Err(ConfigError::PlayerClassMismatch {
                        player: class.clone(),
                        effect: effect.clone(),
                        class: e.lease.class.to_lowercase(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn is_lease_class(s: &str) -> bool {
    s.eq_ignore_ascii_case("sound") || s.eq_ignore_ascii_case("light")
}
