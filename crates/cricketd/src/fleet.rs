//! The device registry.
//!
//! One `Fleet` owns every known [`Device`]. Discovery announcements
//! flow in through `spawn_intake`: a new ID creates and seeds a device
//! and tells both brokers about it; a re-announcement just refreshes
//! the address in place. Devices are never destroyed at runtime — an
//! unreachable cricket keeps its queue and quietly degrades until it
//! answers again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use crate::context::RunContext;
use crate::device::{Device, DeviceConfig, EnqueueFrom, Request};
use crate::discovery::Announcement;
use crate::lease::BrokerHandle;
use crate::requests::{KeepVoltageUpdated, SetVolume, Stop};
use crate::types::{ClientId, LeaseClass, PerClass, PhysLocation};

/// Startup configuration for one known client.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub name: String,
    pub phys_location: PhysLocation,
}

pub struct Fleet {
    devices: Mutex<HashMap<ClientId, Arc<Device>>>,

    /// Client details from startup configuration; devices not listed
    /// here still work, they just have no friendly name.
    roster: HashMap<ClientId, ClientInfo>,
    default_volume: u8,
    /// True when driving a virtual cricket: device IDs ride along in
    /// the URL so one listener can demultiplex the whole fleet.
    virtual_mode: bool,
    http: reqwest::Client,
}

impl Fleet {
    pub fn new(
        default_volume: u8,
        roster: HashMap<ClientId, ClientInfo>,
        virtual_mode: bool,
    ) -> Arc<Fleet> {
        Arc::new(Fleet {
            devices: Mutex::new(HashMap::new()),
            roster,
            default_volume,
            virtual_mode,
            http: reqwest::Client::new(),
        })
    }

    /// Consume discovery announcements, registering each new device
    /// with both brokers.
    pub fn spawn_intake(
        self: &Arc<Self>,
        mut announcements: mpsc::Receiver<Announcement>,
        brokers: PerClass<BrokerHandle>,
    ) {
        let fleet = self.clone();
        tokio::spawn(async move {
            while let Some(announcement) = announcements.recv().await {
                let id = announcement.id.clone();
                if let Some(phys_location) = fleet.handle_announcement(announcement) {
                    for class in LeaseClass::ALL {
                        brokers.get(class).add_client(id.clone(), phys_location);
                    }
                }
            }
        });
    }

    /// Register or refresh one device. Returns the physical location
    /// for a brand-new device (the caller owes the brokers an
    /// arrival), `None` for a re-announcement.
    pub fn handle_announcement(&self, announcement: Announcement) -> Option<PhysLocation> {
        let mut devices = self.devices.lock().unwrap();

        if let Some(device) = devices.get(&announcement.id) {
            info!("re-announcement from known client {}", device.full_name());
            device.set_net_location(announcement.location);
            return None;
        }

        let info = self.roster.get(&announcement.id).cloned().unwrap_or_default();
        let device = Device::new(DeviceConfig {
            id: announcement.id.clone(),
            name: info.name,
            net_location: announcement.location,
            phys_location: info.phys_location,
            target_volume: self.default_volume,
            use_id_in_url: self.virtual_mode,
            http: self.http.clone(),
        });

        info!("adding new client {}", device.full_name());
        device.start();

        // Seed the newcomer: silence anything a firmware restart left
        // playing, set the configured volume, and start the voltage
        // poll loop.
        let ctx = RunContext::background();
        device.enqueue(ctx.clone(), Box::new(Stop), Duration::ZERO, EnqueueFrom::Now);
        device.enqueue(
            ctx.clone(),
            Box::new(SetVolume {
                volume: self.default_volume,
            }),
            Duration::ZERO,
            EnqueueFrom::Now,
        );
        device.enqueue(
            ctx,
            Box::new(KeepVoltageUpdated),
            Duration::ZERO,
            EnqueueFrom::Now,
        );

        devices.insert(announcement.id, device);
        Some(info.phys_location)
    }

    /// Look up a device. Requests are only ever addressed to devices
    /// the brokers handed out, so a miss is a programming error.
    pub fn device(&self, id: &ClientId) -> Arc<Device> {
        self.devices
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("request addressed to nonexistent client {id:?}"))
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.devices.lock().unwrap().contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// Enqueue `request` on each listed device, `delay` from now.
    pub fn enqueue_after_delay<R>(
        &self,
        ids: &[ClientId],
        ctx: &RunContext,
        request: R,
        delay: Duration,
    ) where
        R: Request + Clone + 'static,
    {
        for id in ids {
            self.device(id)
                .enqueue(ctx.clone(), Box::new(request.clone()), delay, EnqueueFrom::Now);
        }
    }

    /// Enqueue `request` on each listed device, `delay` after the last
    /// enqueued request of the same class finishes on that device.
    pub fn enqueue_after_end<R>(
        &self,
        ids: &[ClientId],
        ctx: &RunContext,
        request: R,
        delay: Duration,
    ) where
        R: Request + Clone + 'static,
    {
        for id in ids {
            self.device(id)
                .enqueue(ctx.clone(), Box::new(request.clone()), delay, EnqueueFrom::End);
        }
    }

    /// Best guess for when a device's server-side sound queue goes
    /// idle. Unsynchronized; used for queue-refill pacing.
    pub fn sound_ends(&self, id: &ClientId) -> Instant {
        self.device(id).sound_ends()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stamps;
    use std::net::{IpAddr, Ipv4Addr};
    use crate::types::NetLocation;

    fn announcement(id: &str, last_octet: u8) -> Announcement {
        Announcement {
            id: ClientId::from(id),
            location: NetLocation {
                addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
                port: 80,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_device_is_seeded_and_reported() {
        let roster = HashMap::from([(
            ClientId::from("c00"),
            ClientInfo {
                name: "porch".to_string(),
                phys_location: PhysLocation::default(),
            },
        )]);
        let fleet = Fleet::new(24, roster, false);

        let phys = fleet.handle_announcement(announcement("c00", 5));
        assert!(phys.is_some());
        assert!(fleet.contains(&ClientId::from("c00")));
        assert_eq!(fleet.size(), 1);

        let device = fleet.device(&ClientId::from("c00"));
        assert_eq!(device.name(), "porch");
        assert_eq!(device.target_volume(), 24);
        // The three seed requests are admin/sound zero-duration, so the
        // end-of-sound stamp exists but doesn't extend into the future.
        assert!(device.timestamp(stamps::END_OF_SOUND).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reannouncement_updates_address_in_place() {
        let fleet = Fleet::new(24, HashMap::new(), false);

        assert!(fleet.handle_announcement(announcement("c00", 5)).is_some());
        let device = fleet.device(&ClientId::from("c00"));
        assert_eq!(device.net_location().to_string(), "10.0.0.5:80");

        assert!(fleet.handle_announcement(announcement("c00", 9)).is_none());
        assert_eq!(fleet.size(), 1);
        // Same device object, new address.
        assert_eq!(device.net_location().to_string(), "10.0.0.9:80");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_roster_entry_gets_empty_name() {
        let fleet = Fleet::new(30, HashMap::new(), true);
        fleet.handle_announcement(announcement("mystery", 7));
        let device = fleet.device(&ClientId::from("mystery"));
        assert_eq!(device.name(), "");
        assert_eq!(device.target_volume(), 30);
    }

    #[tokio::test]
    #[should_panic(expected = "nonexistent client")]
    async fn unknown_device_lookup_panics() {
        let fleet = Fleet::new(24, HashMap::new(), false);
        fleet.device(&ClientId::from("ghost"));
    }
}
