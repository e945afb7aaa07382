//! Device executor behavior against a real (local) HTTP server:
//! strict serialization, inter-request pacing, failure bookkeeping,
//! and the voltage poll.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use cricketd::context::RunContext;
use cricketd::device::{stamps, Device, DeviceConfig, EnqueueFrom, PACING_DELAY};
use cricketd::requests::{KeepVoltageUpdated, Ping, VOLTAGE};
use cricketd::types::{ClientId, NetLocation, PhysLocation};

#[derive(Default)]
struct Stub {
    /// Arrival time of each request.
    hits: Mutex<Vec<Instant>>,
    /// How many requests are in flight right now / the most ever.
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Stub {
    async fn handle(&self) {
        self.hits.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Linger a little so overlap would be observable.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_stub() -> (Arc<Stub>, SocketAddr) {
    let stub = Arc::new(Stub::default());

    async fn ping(State(stub): State<Arc<Stub>>) -> &'static str {
        stub.handle().await;
        ""
    }
    async fn battery(State(stub): State<Arc<Stub>>) -> &'static str {
        stub.handle().await;
        "4.07\n"
    }
    async fn broken(State(stub): State<Arc<Stub>>) -> (StatusCode, &'static str) {
        stub.handle().await;
        (StatusCode::INTERNAL_SERVER_ERROR, "on fire")
    }

    let app = Router::new()
        .route("/ping", get(ping))
        .route("/battery", get(battery))
        .route("/broken", get(broken))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (stub, addr)
}

fn device_at(addr: SocketAddr) -> Arc<Device> {
    Device::new(DeviceConfig {
        id: ClientId::from("t00"),
        name: "stub".to_string(),
        net_location: NetLocation {
            addr: addr.ip(),
            port: addr.port(),
        },
        phys_location: PhysLocation::default(),
        target_volume: 24,
        use_id_in_url: false,
        http: reqwest::Client::new(),
    })
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn requests_are_serialized_and_paced() {
    let (stub, addr) = serve_stub().await;
    let device = device_at(addr);
    device.start();

    let ctx = RunContext::background();
    for _ in 0..5 {
        device.enqueue(ctx.clone(), Box::new(Ping), Duration::ZERO, EnqueueFrom::Now);
    }

    wait_for("five pings", || stub.hits.lock().unwrap().len() == 5).await;

    // No overlap, ever.
    assert_eq!(stub.max_in_flight.load(Ordering::SeqCst), 1);

    // Consecutive requests are spaced by the pacing interval. The
    // pacing clock starts at the *response*, so arrival-to-arrival
    // gaps must be at least the pacing delay (minus scheduler slop).
    let hits = stub.hits.lock().unwrap();
    for pair in hits.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= PACING_DELAY - Duration::from_millis(5),
            "requests only {gap:?} apart"
        );
    }

    device.stop();
}

#[tokio::test]
async fn failures_are_recorded_and_do_not_stop_the_device() {
    let (stub, addr) = serve_stub().await;
    let device = device_at(addr);
    device.start();

    let ctx = RunContext::background();

    // A failing endpoint, called directly.
    let err = device.execute(&ctx, "broken", &[]).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("status 500"), "unhelpful error: {message}");
    assert!(message.contains("last success"), "no timing info: {message}");
    assert!(device.timestamp(stamps::LAST_FAILURE).is_some());
    assert!(device.timestamp(stamps::LAST_SUCCESS).is_none());

    // The device still works afterwards.
    device.execute(&ctx, "ping", &[]).await.unwrap();
    assert!(device.timestamp(stamps::LAST_SUCCESS).is_some());

    // Two hits total: broken + ping.
    assert_eq!(stub.hits.lock().unwrap().len(), 2);
    device.stop();
}

#[tokio::test]
async fn voltage_poll_stores_the_reading() {
    let (_stub, addr) = serve_stub().await;
    let device = device_at(addr);
    device.start();

    device.enqueue(
        RunContext::background(),
        Box::new(KeepVoltageUpdated),
        Duration::ZERO,
        EnqueueFrom::Now,
    );

    wait_for("voltage statistic", || device.statistic(VOLTAGE).is_some()).await;
    assert_eq!(device.statistic(VOLTAGE), Some(4.07));
    device.stop();
}

#[tokio::test]
async fn cancelled_context_fails_fast_without_bookkeeping() {
    let (stub, addr) = serve_stub().await;
    let device = device_at(addr);

    let ctx = RunContext::background();
    ctx.cancel();

    let err = device.execute(&ctx, "ping", &[]).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));

    // Nothing hit the wire and no failure was recorded.
    assert!(stub.hits.lock().unwrap().is_empty());
    assert!(device.timestamp(stamps::LAST_FAILURE).is_none());
}

#[tokio::test]
async fn transport_errors_name_the_endpoint() {
    // A port nothing listens on.
    let device = device_at("127.0.0.1:1".parse().unwrap());
    let ctx = RunContext::background();

    let err = device.execute(&ctx, "ping", &[]).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("ping"), "unhelpful error: {message}");
    assert!(device.timestamp(stamps::LAST_FAILURE).is_some());
}
