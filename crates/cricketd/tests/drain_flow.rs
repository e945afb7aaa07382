//! End-to-end drain-and-return against a virtual cricket fleet: an
//! effect's devices are polled until their queues empty, returned to
//! the broker in batches, and immediately re-leased to the next run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cricketd::context::RunContext;
use cricketd::discovery::Announcement;
use cricketd::effect::EffectContext;
use cricketd::fileset::{File, PlaySpec};
use cricketd::fleet::Fleet;
use cricketd::idset::IdSet;
use cricketd::lease::{Broker, HolderRunner, Lease};
use cricketd::requests::Play;
use cricketd::types::{ClientId, LeaseClass, NetLocation};
use cricketconf::{LeaseConfig, RandomConfig};

/// Holder that just reports each membership set it's handed.
struct ReportingHolder {
    sets: mpsc::UnboundedSender<Arc<dyn IdSet>>,
}

impl HolderRunner for ReportingHolder {
    fn run(&self, members: Arc<dyn IdSet>) {
        let _ = self.sets.send(members);
    }
}

async fn virtual_fleet() -> (Arc<Fleet>, NetLocation) {
    let mut catalog = vcricket::Catalog::new();
    catalog.insert(1, 1, 0.3); // a short chirp

    let bound = vcricket::serve("127.0.0.1:0".parse().unwrap(), catalog)
        .await
        .unwrap();
    let location = NetLocation {
        addr: bound.ip(),
        port: bound.port(),
    };

    (Fleet::new(24, HashMap::new(), true), location)
}

#[tokio::test]
async fn effect_queues_drain_and_devices_return() {
    let (fleet, location) = virtual_fleet().await;

    let mut broker = Broker::new(LeaseClass::Sound);
    let (sets_tx, mut sets_rx) = mpsc::unbounded_channel();
    let lease = Lease::new(
        &LeaseConfig {
            class: "sound".to_string(),
            weight: 1.0,
            fleet_fraction: Some(RandomConfig::fixed(1.0)),
            ..Default::default()
        },
        "reporting",
    )
    .unwrap();
    broker.assign(lease, Arc::new(ReportingHolder { sets: sets_tx }), "reporting");
    let handle = broker.handle();
    broker.start();

    // Three crickets arrive; the sole holder gets them all.
    for i in 0..3 {
        let id = ClientId::from(format!("c{i:02}"));
        fleet.handle_announcement(Announcement {
            id: id.clone(),
            location,
        });
        handle.add_client(id, Default::default());
    }

    let members = tokio::time::timeout(Duration::from_secs(5), sets_rx.recv())
        .await
        .expect("holder was never run")
        .unwrap();
    let mut clients = members.snapshot();
    clients.sort();
    // Memberships can arrive in several adds; wait for all three.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while clients.len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "only got {clients:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
        clients = members.snapshot();
        clients.sort();
    }

    // Pretend to be an effect: queue a short play on each device, then
    // close the set and drain.
    let ctx = RunContext::background();
    let spec = PlaySpec {
        file: File {
            folder: 1,
            file: 1,
            duration: 0.3,
        },
        reps: 1,
        delay: Duration::ZERO,
        jitter: Duration::ZERO,
    };
    fleet.enqueue_after_delay(&clients, &ctx, Play { volume: 20, spec }, Duration::ZERO);

    members.close();
    let fx = EffectContext {
        fleet: fleet.clone(),
        broker: handle.clone(),
        class: LeaseClass::Sound,
    };
    fx.drain_and_return(members.snapshot()).await;

    // drain_and_return only finishes once every device acked an empty
    // queue. The returns then flow straight back into the only holder:
    // it gets re-run with the same three clients.
    let rerun = tokio::time::timeout(Duration::from_secs(5), sets_rx.recv())
        .await
        .expect("holder was never re-run")
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut again = rerun.snapshot();
        again.sort();
        if again == clients {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "re-run never saw all clients: {again:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn seeded_devices_report_voltage() {
    let (fleet, location) = virtual_fleet().await;

    // Announcing a device seeds it with stop, setvolume, and the
    // voltage poll; the virtual cricket answers 4.20.
    fleet.handle_announcement(Announcement {
        id: ClientId::from("c00"),
        location,
    });

    let device = fleet.device(&ClientId::from("c00"));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while device.statistic(cricketd::requests::VOLTAGE).is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "voltage never arrived"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(device.statistic(cricketd::requests::VOLTAGE), Some(4.20));
}

#[tokio::test]
async fn server_compiles_and_starts_against_virtual_fleet() {
    // A small but complete wiring test: config -> server -> announce ->
    // seeded devices.
    let toml = r#"
        default_volume = 20

        [clients.c00]
        name = "one"

        [clients.c01]
        name = "two"

        [files.chirp-1]
        folder = 1
        file = 1
        duration = 0.3

        [filesets.chirps]
        regex = "^chirp-"

        [effects.chorus]
        algorithm = "shuffle"
        duration = { mean = 2.0 }
        lease = { class = "sound", weight = 1.0, fleet_fraction = { mean = 1.0 } }
        filesets = { main = "chirps" }
        [effects.chorus.parameters]
        file_reps = { mean = 1.0 }
        file_delay = { mean = 0.0 }
        group_delay = { mean = 0.2 }

        [players.sound]
        delay = { mean = 1.0 }
        weights = { chorus = 1.0 }
    "#;
    let config: cricketconf::Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();

    let mut catalog = vcricket::Catalog::new();
    catalog.insert(1, 1, 0.3);
    let bound = vcricket::serve("127.0.0.1:0".parse().unwrap(), catalog)
        .await
        .unwrap();
    let location = NetLocation {
        addr: bound.ip(),
        port: bound.port(),
    };

    let server = cricketd::Server::new(&config, true).unwrap();
    let fleet = server.fleet().clone();

    let (tx, rx) = mpsc::channel(16);
    server.start(rx);
    for id in ["c00", "c01"] {
        tx.send(Announcement {
            id: ClientId::from(id),
            location,
        })
        .await
        .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fleet.size() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "devices never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let device = fleet.device(&ClientId::from("c00"));
    assert_eq!(device.name(), "one");
    assert_eq!(device.target_volume(), 20);
}
