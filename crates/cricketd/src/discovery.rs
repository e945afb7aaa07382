//! Device discovery.
//!
//! The daemon doesn't speak mDNS itself — discovery is a collaborator
//! that feeds [`Announcement`]s into a channel. This module owns the
//! bits the core cares about: parsing advertised instance names, and
//! the virtual announcer that simulates a fleet trickling onto the
//! network when running against a virtual cricket.

use std::net::IpAddr;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;

use crate::types::{ClientId, NetLocation};

/// One device arrival (or re-arrival) on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: ClientId,
    pub location: NetLocation,
}

/// Parse an mDNS service entry into an announcement.
///
/// Crickets advertise an instance name of the form `"Cricket <id> ..."`;
/// anything else on the network is ignored, as are entries with no IPv4
/// address.
pub fn parse_instance(instance: &str, addrs: &[IpAddr], port: u16) -> Option<Announcement> {
    let addr = *addrs.iter().find(|a| a.is_ipv4())?;
    let mut tokens = instance.split_whitespace();
    if !tokens.next()?.starts_with("Cricket") {
        return None;
    }
    let id = tokens.next()?;
    Some(Announcement {
        id: ClientId::from(id),
        location: NetLocation { addr, port },
    })
}

/// Announce a configured roster of IDs as if they were discovered on
/// the network, all pointing at one (virtual) cricket listener.
///
/// Arrival order is shuffled and inter-arrival delays are randomized,
/// spread across roughly two minutes, so allocation sees the same
/// trickle it would from a real fleet powering on.
pub fn spawn_virtual_announcer(
    ids: Vec<ClientId>,
    location: NetLocation,
    tx: mpsc::Sender<Announcement>,
) {
    let mut rng = rand::thread_rng();
    let mut arrivals: Vec<(ClientId, f64)> =
        ids.into_iter().map(|id| (id, rng.gen::<f64>())).collect();
    arrivals.shuffle(&mut rng);
    let total: f64 = arrivals.iter().map(|(_, w)| w).sum();

    tokio::spawn(async move {
        info!("virtual announcer: {} clients incoming", arrivals.len());
        for (id, weight) in arrivals {
            if tx
                .send(Announcement {
                    id,
                    location,
                })
                .await
                .is_err()
            {
                return; // intake is gone
            }
            let pause = Duration::from_secs_f64(120.0 * weight / total.max(f64::MIN_POSITIVE));
            tokio::time::sleep(pause).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn parses_cricket_instances() {
        let ann = parse_instance("Cricket a4cf12fe99c0", &[v4(10, 0, 0, 9)], 80).unwrap();
        assert_eq!(ann.id, ClientId::from("a4cf12fe99c0"));
        assert_eq!(ann.location.to_string(), "10.0.0.9:80");
    }

    #[test]
    fn ignores_foreign_services() {
        assert!(parse_instance("Printer upstairs", &[v4(10, 0, 0, 9)], 80).is_none());
        assert!(parse_instance("Cricket", &[v4(10, 0, 0, 9)], 80).is_none());
        assert!(parse_instance("", &[v4(10, 0, 0, 9)], 80).is_none());
    }

    #[test]
    fn requires_an_ipv4_address() {
        assert!(parse_instance("Cricket abc", &[], 80).is_none());
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(parse_instance("Cricket abc", &[v6], 80).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn virtual_announcer_delivers_everyone() {
        let (tx, mut rx) = mpsc::channel(16);
        let ids: Vec<ClientId> = (0..5).map(|i| ClientId::from(format!("c{i}"))).collect();
        let loc = NetLocation {
            addr: v4(127, 0, 0, 1),
            port: 8080,
        };
        spawn_virtual_announcer(ids.clone(), loc, tx);

        let mut seen = Vec::new();
        for _ in 0..5 {
            // Paused time auto-advances through the randomized pauses.
            let ann = rx.recv().await.unwrap();
            assert_eq!(ann.location, loc);
            seen.push(ann.id);
        }
        seen.sort();
        assert_eq!(seen, ids);
    }
}
