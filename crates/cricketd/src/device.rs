//! One `Device` per physical cricket.
//!
//! A device owns a timed heap of pending requests and a single executor
//! task that runs them serially over HTTP. Serial execution is not an
//! optimization: the cricket's embedded webserver cannot survive
//! overlapping requests, and back-to-back calls must be spaced by a
//! pacing interval or it resets the connection.
//!
//! The heap worker and the executor are the only two tasks per device,
//! regardless of how many effects are enqueueing onto it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info};

use crate::context::RunContext;
use crate::timedheap::TimedHeap;
use crate::types::{ClientId, NetLocation, PhysLocation};

/// Time between HTTP calls to a given device, to avoid "connection
/// reset by peer" errors from its flaky webserver.
pub const PACING_DELAY: Duration = Duration::from_millis(30);

/// Names of the device's bookkeeping timestamps.
pub mod stamps {
    pub const CREATION: &str = "first registration";
    pub const END_OF_ADMIN: &str = "end of last enqueued admin request";
    pub const END_OF_LIGHT: &str = "end of last enqueued light request";
    pub const END_OF_SOUND: &str = "end of last enqueued sound request";
    pub const LAST_FAILURE: &str = "last failed client call";
    pub const LAST_SUCCESS: &str = "last successful client call";
    pub const NEXT_EXECUTE: &str = "next time execute() can proceed";
}

/// What kind of on-device queue a request occupies. Selects which
/// end-of-queue timestamp advances when the request is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Sound,
    Light,
    Admin,
}

/// A command the device executor can run.
#[async_trait]
pub trait Request: Send + Sync {
    /// Run the request against the device. Called from the device's
    /// executor task, strictly serialized with every other request on
    /// the same device.
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError>;

    /// How long the request will occupy the device once it starts
    /// running there, in expectation.
    fn duration(&self) -> Duration {
        Duration::ZERO
    }

    fn class(&self) -> RequestClass;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Whether an enqueue delay counts from now or from the end of the
/// device's queue for that request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueFrom {
    Now,
    End,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("request cancelled")]
    Cancelled,

    #[error("GET {endpoint:?} failed [{timing}]: {source}")]
    Transport {
        endpoint: String,
        timing: String,
        source: reqwest::Error,
    },

    #[error("GET {endpoint:?} got failure status {status} [{timing}]: {body:?}")]
    Status {
        endpoint: String,
        status: u16,
        timing: String,
        body: String,
    },

    #[error("unparseable response from {endpoint:?}: {body:?}")]
    Parse { endpoint: String, body: String },
}

pub struct DeviceConfig {
    pub id: ClientId,
    pub name: String,
    pub net_location: NetLocation,
    pub phys_location: PhysLocation,
    pub target_volume: u8,
    /// Virtual crickets multiplex many device IDs behind one listener;
    /// this adds a `cricket=<id>` query parameter to every call so the
    /// mock can demultiplex.
    pub use_id_in_url: bool,
    pub http: reqwest::Client,
}

struct State {
    timestamps: HashMap<&'static str, Instant>,
    statistics: HashMap<&'static str, f32>,
    target_volume: u8,
}

pub struct Device {
    id: ClientId,
    name: String,
    phys: PhysLocation,
    use_id_in_url: bool,

    net: Mutex<NetLocation>,
    heap: TimedHeap<QueuedRequest>,
    state: Mutex<State>,
    http: reqwest::Client,
}

struct QueuedRequest {
    req: Box<dyn Request>,
    ctx: RunContext,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Arc<Device> {
        let device = Arc::new(Device {
            id: config.id,
            name: config.name,
            phys: config.phys_location,
            use_id_in_url: config.use_id_in_url,
            net: Mutex::new(config.net_location),
            heap: TimedHeap::new(),
            state: Mutex::new(State {
                timestamps: HashMap::new(),
                statistics: HashMap::new(),
                target_volume: config.target_volume,
            }),
            http: config.http,
        });
        device.set_timestamp(stamps::CREATION, Instant::now());
        device
    }

    /// Spawn the executor task. Requests popped with an already-
    /// cancelled context are logged and discarded without touching the
    /// wire; a failed request never stops the device.
    pub fn start(self: &Arc<Self>) {
        let device = self.clone();
        tokio::spawn(async move {
            while let Some(queued) = device.heap.next().await {
                if queued.ctx.is_cancelled() {
                    info!(device = %device.id, request = queued.req.name(),
                        "discarding expired request");
                    continue;
                }
                match queued.req.execute(&queued.ctx, &device).await {
                    Ok(()) => {}
                    Err(DeviceError::Cancelled) => {
                        info!(device = %device.id, request = queued.req.name(),
                            "request cancelled mid-flight");
                    }
                    Err(err) => {
                        error!(device = %device.id, request = queued.req.name(),
                            "request failed: {err}");
                    }
                }
            }
        });
    }

    /// Tear down the device's heap worker; pending requests are
    /// discarded and the executor task exits.
    pub fn stop(&self) {
        self.heap.stop();
    }

    /// Enqueue a request. The caller must already hold an appropriate
    /// lease on this device.
    ///
    /// The end-of-queue timestamp for the request's class advances
    /// monotonically to cover this request, so later `EnqueueFrom::End`
    /// requests land after it.
    pub fn enqueue(
        &self,
        ctx: RunContext,
        req: Box<dyn Request>,
        delay: Duration,
        from: EnqueueFrom,
    ) {
        let stamp = match req.class() {
            RequestClass::Sound => stamps::END_OF_SOUND,
            RequestClass::Light => stamps::END_OF_LIGHT,
            RequestClass::Admin => stamps::END_OF_ADMIN,
        };

        let earliest;
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let end_stamp = state.timestamps.get(stamp).copied();

            earliest = match from {
                EnqueueFrom::Now => now + delay,
                EnqueueFrom::End => end_stamp.map_or(now, |end| end.max(now)) + delay,
            };

            let this_end = earliest + req.duration();
            let advanced = end_stamp.map_or(this_end, |end| end.max(this_end));
            state.timestamps.insert(stamp, advanced);
        }

        self.heap.add(QueuedRequest { req, ctx }, earliest);
    }

    /// Perform one HTTP GET against the cricket.
    ///
    /// Waits out the pacing interval from the previous call, then
    /// issues `GET http://<net>/<endpoint>?k=v&…`. Any transport error,
    /// body read error, or status above 299 is a failure. Success and
    /// failure both re-arm the pacing timestamp — unless the context
    /// was already cancelled, in which case no bookkeeping changes.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        endpoint: &str,
        args: &[(&str, String)],
    ) -> Result<String, DeviceError> {
        let url = format!("http://{}/{}", self.net_location(), endpoint);
        let mut query: Vec<(&str, String)> = args.to_vec();
        if self.use_id_in_url {
            query.push(("cricket", self.id.to_string()));
        }

        // Wait until this call is allowed to proceed.
        if let Some(next) = self.timestamp(stamps::NEXT_EXECUTE) {
            if Instant::now() < next {
                tokio::time::sleep_until(next).await;
            }
        }

        let send = self.http.get(&url).query(&query).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(DeviceError::Cancelled),
            r = send => r,
        };

        let response = match response {
            Ok(r) => r,
            Err(source) => {
                return Err(self.call_failed(
                    ctx,
                    DeviceError::Transport {
                        endpoint: endpoint.to_string(),
                        timing: self.call_timing(),
                        source,
                    },
                ));
            }
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            _ = ctx.cancelled() => return Err(DeviceError::Cancelled),
            b = response.text() => b,
        };
        let body = match body {
            Ok(b) => b,
            Err(source) => {
                return Err(self.call_failed(
                    ctx,
                    DeviceError::Transport {
                        endpoint: endpoint.to_string(),
                        timing: self.call_timing(),
                        source,
                    },
                ));
            }
        };

        if status > 299 {
            return Err(self.call_failed(
                ctx,
                DeviceError::Status {
                    endpoint: endpoint.to_string(),
                    status,
                    timing: self.call_timing(),
                    body,
                },
            ));
        }

        let now = Instant::now();
        self.set_timestamp(stamps::LAST_SUCCESS, now);
        self.set_timestamp(stamps::NEXT_EXECUTE, now + PACING_DELAY);
        Ok(body)
    }

    // Record a failure, unless the caller's context was already
    // cancelled (a cancelled call says nothing about device health).
    fn call_failed(&self, ctx: &RunContext, err: DeviceError) -> DeviceError {
        if !ctx.is_cancelled() {
            let now = Instant::now();
            self.set_timestamp(stamps::LAST_FAILURE, now);
            self.set_timestamp(stamps::NEXT_EXECUTE, now + PACING_DELAY);
        }
        err
    }

    // "last success 2.13s ago, last failure never" — for failure
    // diagnostics.
    fn call_timing(&self) -> String {
        let describe = |name| match self.timestamp(name) {
            Some(t) => format!("{:.2}s ago", t.elapsed().as_secs_f64()),
            None => "never".to_string(),
        };
        format!(
            "last success {}, last failure {}",
            describe(stamps::LAST_SUCCESS),
            describe(stamps::LAST_FAILURE),
        )
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current best guess for when the device's sound queue will be
    /// idle. Unsynchronized with the device itself.
    pub fn sound_ends(&self) -> Instant {
        self.timestamp(stamps::END_OF_SOUND)
            .unwrap_or_else(Instant::now)
    }

    pub fn timestamp(&self, name: &'static str) -> Option<Instant> {
        self.state.lock().unwrap().timestamps.get(name).copied()
    }

    pub fn set_timestamp(&self, name: &'static str, t: Instant) {
        self.state.lock().unwrap().timestamps.insert(name, t);
    }

    pub fn statistic(&self, name: &'static str) -> Option<f32> {
        self.state.lock().unwrap().statistics.get(name).copied()
    }

    pub fn set_statistic(&self, name: &'static str, value: f32) {
        self.state.lock().unwrap().statistics.insert(name, value);
    }

    pub fn target_volume(&self) -> u8 {
        self.state.lock().unwrap().target_volume
    }

    pub fn set_target_volume(&self, volume: u8) {
        self.state.lock().unwrap().target_volume = volume;
    }

    pub fn net_location(&self) -> NetLocation {
        *self.net.lock().unwrap()
    }

    pub fn set_net_location(&self, new: NetLocation) {
        let mut net = self.net.lock().unwrap();
        if *net != new {
            info!(device = %self.id, "updating address to {new}");
            *net = new;
        }
    }

    /// Diagnostic name including id, configured name, and address.
    pub fn full_name(&self) -> String {
        format!(
            "[{} ({:?}, {}, {:?})]",
            self.id,
            self.name,
            self.net_location(),
            self.phys
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_device() -> Arc<Device> {
        Device::new(DeviceConfig {
            id: ClientId::from("d00"),
            name: "test".to_string(),
            net_location: NetLocation {
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 1,
            },
            phys_location: PhysLocation::default(),
            target_volume: 24,
            use_id_in_url: false,
            http: reqwest::Client::new(),
        })
    }

    #[derive(Clone)]
    struct Noop {
        class: RequestClass,
        duration: Duration,
        runs: Arc<AtomicUsize>,
    }

    impl Noop {
        fn new(class: RequestClass, duration: Duration) -> Self {
            Noop {
                class,
                duration,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Request for Noop {
        async fn execute(
            &self,
            _ctx: &RunContext,
            _device: &Arc<Device>,
        ) -> Result<(), DeviceError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn duration(&self) -> Duration {
            self.duration
        }

        fn class(&self) -> RequestClass {
            self.class
        }

        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_from_now_and_from_end() {
        let device = test_device();
        let ctx = RunContext::background();
        let start = Instant::now();

        // A 10-second sound request starting now.
        let req = Noop::new(RequestClass::Sound, Duration::from_secs(10));
        device.enqueue(ctx.clone(), Box::new(req), Duration::ZERO, EnqueueFrom::Now);
        assert_eq!(
            device.timestamp(stamps::END_OF_SOUND),
            Some(start + Duration::from_secs(10))
        );

        // FromEnd lands after it, plus the delay.
        let req = Noop::new(RequestClass::Sound, Duration::from_secs(5));
        device.enqueue(
            ctx.clone(),
            Box::new(req),
            Duration::from_secs(2),
            EnqueueFrom::End,
        );
        assert_eq!(
            device.timestamp(stamps::END_OF_SOUND),
            Some(start + Duration::from_secs(17))
        );

        // Light requests use their own stamp.
        let req = Noop::new(RequestClass::Light, Duration::from_secs(3));
        device.enqueue(ctx, Box::new(req), Duration::ZERO, EnqueueFrom::End);
        assert_eq!(
            device.timestamp(stamps::END_OF_LIGHT),
            Some(start + Duration::from_secs(3))
        );
        assert_eq!(
            device.timestamp(stamps::END_OF_SOUND),
            Some(start + Duration::from_secs(17))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_stamp_is_monotone() {
        let device = test_device();
        let ctx = RunContext::background();
        let start = Instant::now();

        let long = Noop::new(RequestClass::Sound, Duration::from_secs(100));
        device.enqueue(ctx.clone(), Box::new(long), Duration::ZERO, EnqueueFrom::Now);
        let high = device.timestamp(stamps::END_OF_SOUND).unwrap();
        assert_eq!(high, start + Duration::from_secs(100));

        // A short FromNow request must not pull the stamp backwards.
        let short = Noop::new(RequestClass::Sound, Duration::from_secs(1));
        device.enqueue(ctx, Box::new(short), Duration::ZERO, EnqueueFrom::Now);
        assert_eq!(device.timestamp(stamps::END_OF_SOUND), Some(high));
    }

    #[tokio::test(start_paused = true)]
    async fn from_end_with_stale_stamp_counts_from_now() {
        let device = test_device();
        let ctx = RunContext::background();

        let req = Noop::new(RequestClass::Sound, Duration::from_secs(1));
        device.enqueue(ctx.clone(), Box::new(req), Duration::ZERO, EnqueueFrom::Now);

        // Long after that request finished, FromEnd counts from now,
        // not from the stale end stamp.
        tokio::time::advance(Duration::from_secs(60)).await;
        let now = Instant::now();
        let req = Noop::new(RequestClass::Sound, Duration::from_secs(2));
        device.enqueue(ctx, Box::new(req), Duration::ZERO, EnqueueFrom::End);
        assert_eq!(
            device.timestamp(stamps::END_OF_SOUND),
            Some(now + Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_requests_are_discarded() {
        let device = test_device();
        device.start();

        let live = Noop::new(RequestClass::Admin, Duration::ZERO);
        let dead = Noop::new(RequestClass::Admin, Duration::ZERO);

        let cancelled = RunContext::background();
        cancelled.cancel();
        device.enqueue(
            cancelled,
            Box::new(dead.clone()),
            Duration::ZERO,
            EnqueueFrom::Now,
        );
        device.enqueue(
            RunContext::background(),
            Box::new(live.clone()),
            Duration::ZERO,
            EnqueueFrom::Now,
        );

        // Let the executor chew through both.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_millis(10)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(dead.runs.load(Ordering::SeqCst), 0);
        assert_eq!(live.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_run_in_ready_order() {
        let device = test_device();
        let order = Arc::new(Mutex::new(Vec::new()));

        #[derive(Clone)]
        struct Tagged {
            tag: u32,
            order: Arc<Mutex<Vec<u32>>>,
        }

        #[async_trait]
        impl Request for Tagged {
            async fn execute(
                &self,
                _ctx: &RunContext,
                _device: &Arc<Device>,
            ) -> Result<(), DeviceError> {
                self.order.lock().unwrap().push(self.tag);
                Ok(())
            }

            fn class(&self) -> RequestClass {
                RequestClass::Admin
            }

            fn name(&self) -> &'static str {
                "tagged"
            }
        }

        let ctx = RunContext::background();
        for (tag, delay_ms) in [(3u32, 300u64), (1, 100), (2, 200)] {
            device.enqueue(
                ctx.clone(),
                Box::new(Tagged {
                    tag,
                    order: order.clone(),
                }),
                Duration::from_millis(delay_ms),
                EnqueueFrom::Now,
            );
        }
        device.start();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(100)).await;
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }
}
