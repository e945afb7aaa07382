//! A virtual cricket: one HTTP listener that pretends to be a whole
//! fleet of sound-and-light devices.
//!
//! Every request carries a `cricket=<id>` query parameter so the
//! server can keep per-device state behind a single address. Play and
//! blink commands are "performed" by appending their projected end
//! time to the matching queue; the pending endpoints expire finished
//! entries against the wall clock and report what's left. That's
//! enough behavior for the daemon's scheduler, pacing, and drain
//! logic to be exercised end to end without a single real device.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VcricketError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// The files the virtual fleet can play: `(folder, file)` → duration
/// in seconds.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    files: HashMap<(u32, u32), f64>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog::default()
    }

    pub fn insert(&mut self, folder: u32, file: u32, duration: f64) {
        self.files.insert((folder, file), duration);
    }

    fn duration(&self, folder: u32, file: u32) -> Option<f64> {
        self.files.get(&(folder, file)).copied()
    }
}

#[derive(Default)]
struct CricketSim {
    /// End times of queued sound plays, oldest first.
    sound: Vec<Instant>,
    /// End times of queued blinks, oldest first.
    light: Vec<Instant>,
}

impl CricketSim {
    /// Queue a performance of `duration` seconds behind whatever is
    /// already queued; returns the new queue depth.
    fn enqueue(queue: &mut Vec<Instant>, duration: f64) -> usize {
        let start = queue.last().copied().unwrap_or_else(Instant::now);
        let start = start.max(Instant::now());
        queue.push(start + Duration::from_secs_f64(duration));
        queue.len()
    }

    /// Drop finished entries and report the remaining depth.
    fn pending(queue: &mut Vec<Instant>) -> usize {
        let now = Instant::now();
        queue.retain(|end| *end > now);
        queue.len()
    }
}

struct Shared {
    catalog: Catalog,
    crickets: Mutex<HashMap<String, CricketSim>>,
}

/// Serve a virtual fleet on `addr` (port 0 picks a free port).
/// Returns the actual bound address.
pub async fn serve(addr: SocketAddr, catalog: Catalog) -> Result<SocketAddr, VcricketError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| VcricketError::Bind { addr, source })?;
    let bound = listener.local_addr().map_err(|source| VcricketError::Bind { addr, source })?;

    let shared = Arc::new(Shared {
        catalog,
        crickets: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/ping", get(ok))
        .route("/play", get(play))
        .route("/setvolume", get(ok))
        .route("/blink", get(blink))
        .route("/pause", get(ok))
        .route("/unpause", get(ok))
        .route("/stop", get(ok))
        .route("/battery", get(battery))
        .route("/soundpending", get(sound_pending))
        .route("/lightpending", get(light_pending))
        .with_state(shared);

    info!("virtual cricket fleet listening on {bound}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("virtual cricket server died: {err}");
        }
    });

    Ok(bound)
}

type Params = Query<HashMap<String, String>>;

fn cricket_id(params: &Params) -> Result<String, (StatusCode, String)> {
    params
        .get("cricket")
        .cloned()
        .ok_or((StatusCode::BAD_REQUEST, "no cricket specified\n".to_string()))
}

fn number<T: std::str::FromStr>(params: &Params, key: &str) -> Result<T, (StatusCode, String)> {
    params
        .get(key)
        .and_then(|v| v.parse().ok())
        .ok_or((StatusCode::BAD_REQUEST, format!("bad or missing {key:?}\n")))
}

async fn ok(params: Params) -> Result<String, (StatusCode, String)> {
    cricket_id(&params)?;
    Ok(String::new())
}

async fn battery(params: Params) -> Result<String, (StatusCode, String)> {
    cricket_id(&params)?;
    Ok("4.20".to_string()) // nice
}

async fn play(
    State(shared): State<Arc<Shared>>,
    params: Params,
) -> Result<String, (StatusCode, String)> {
    let id = cricket_id(&params)?;
    let folder: u32 = number(&params, "folder")?;
    let file: u32 = number(&params, "file")?;
    let volume: u32 = number(&params, "volume")?;
    let reps: u32 = number(&params, "reps")?;
    let delay_ms: u64 = number(&params, "delay")?;

    let Some(duration) = shared.catalog.duration(folder, file) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("no such file {folder}/{file}\n"),
        ));
    };
    if reps < 1 {
        return Err((StatusCode::BAD_REQUEST, "reps must be positive\n".to_string()));
    }

    let full = duration * f64::from(reps) + (delay_ms as f64 / 1000.0) * f64::from(reps - 1);
    let depth = {
        let mut crickets = shared.crickets.lock().unwrap();
        let sim = crickets.entry(id.clone()).or_default();
        CricketSim::enqueue(&mut sim.sound, full)
    };
    debug!(cricket = %id, folder, file, reps, "play queued ({full:.3}s, depth {depth})");

    Ok(format!("playing at volume:{volume}\n"))
}

async fn blink(
    State(shared): State<Arc<Shared>>,
    params: Params,
) -> Result<String, (StatusCode, String)> {
    let id = cricket_id(&params)?;
    let speed: f64 = number(&params, "speed")?;
    let reps: u32 = number(&params, "reps")?;
    let delay_ms: u64 = number(&params, "delay")?;

    if speed < 0.001 {
        return Err((StatusCode::BAD_REQUEST, "speed must be faster\n".to_string()));
    }
    if reps < 1 {
        return Err((StatusCode::BAD_REQUEST, "reps must be positive\n".to_string()));
    }

    let one_blink = (256.0 / speed) * 2.0 / 1000.0;
    let full = one_blink * f64::from(reps) + (delay_ms as f64 / 1000.0) * f64::from(reps - 1);
    let depth = {
        let mut crickets = shared.crickets.lock().unwrap();
        let sim = crickets.entry(id.clone()).or_default();
        CricketSim::enqueue(&mut sim.light, full)
    };
    debug!(cricket = %id, speed, reps, "blink queued ({full:.3}s, depth {depth})");

    Ok(String::new())
}

async fn sound_pending(
    State(shared): State<Arc<Shared>>,
    params: Params,
) -> Result<String, (StatusCode, String)> {
    let id = cricket_id(&params)?;
    let mut crickets = shared.crickets.lock().unwrap();
    let sim = crickets.entry(id).or_default();
    Ok(format!("{}", CricketSim::pending(&mut sim.sound)))
}

async fn light_pending(
    State(shared): State<Arc<Shared>>,
    params: Params,
) -> Result<String, (StatusCode, String)> {
    let id = cricket_id(&params)?;
    let mut crickets = shared.crickets.lock().unwrap();
    let sim = crickets.entry(id).or_default();
    Ok(format!("{}", CricketSim::pending(&mut sim.light)))
}
