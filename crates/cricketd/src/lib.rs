//! cricketd: the central controller for a fleet of networked
//! sound-and-light devices ("crickets").
//!
//! The daemon discovers crickets on the local network, keeps a timed
//! command queue per device, leases subsets of the fleet to competing
//! effects, and drives each cricket's tiny HTTP control surface with
//! paced, strictly serialized requests.
//!
//! Data flows in one direction: discovery announcements feed the lease
//! brokers, brokers hand device IDs to effect holders, effects enqueue
//! requests on per-device heaps, and a single executor task per device
//! talks HTTP. Returns flow back the same way once an effect's queues
//! drain.

pub mod context;
pub mod device;
pub mod discovery;
pub mod effect;
pub mod fileset;
pub mod fleet;
pub mod idset;
pub mod lease;
pub mod light;
pub mod player;
pub mod random;
pub mod requests;
pub mod server;
pub mod sound;
pub mod telemetry;
pub mod timedheap;
pub mod types;
pub mod wander;
pub mod weightedset;

pub use context::RunContext;
pub use server::Server;
pub use types::{ClientId, LeaseClass, NetLocation, PhysLocation};
