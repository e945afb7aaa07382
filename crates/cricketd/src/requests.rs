//! Concrete requests the device executor can run.
//!
//! Each type maps to one endpoint on the cricket's control surface.
//! Most are one-shot: a failure is logged by the executor and that's
//! that. The two polling requests — [`KeepVoltageUpdated`] and
//! [`DrainQueue`] — reschedule themselves instead, so a flaky device
//! degrades quietly rather than falling out of the bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::context::RunContext;
use crate::device::{Device, DeviceError, EnqueueFrom, Request, RequestClass};
use crate::fileset::PlaySpec;
use crate::types::{ClientId, LeaseClass};

/// Time between attempts to drain a queue in case of network failure.
const TRANSIENT_DELAY: Duration = Duration::from_secs(5);

/// Time between voltage polls.
const VOLTAGE_UPDATE_DELAY: Duration = Duration::from_secs(60);

// Timestamp and statistic names owned by this module.
const LAST_PING: &str = "last ping";
const LAST_VOLTAGE: &str = "last update of client voltage";
pub const VOLTAGE: &str = "voltage";

// ------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Ping;

#[async_trait]
impl Request for Ping {
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError> {
        device.execute(ctx, "ping", &[]).await?;
        device.set_timestamp(LAST_PING, Instant::now());
        Ok(())
    }

    fn class(&self) -> RequestClass {
        RequestClass::Admin
    }

    fn name(&self) -> &'static str {
        "ping"
    }
}

// ------------------------------------------------------------------

/// Play a file some number of times. A volume of zero means "use the
/// device's target volume". Zero reps is a no-op.
#[derive(Debug, Clone, Copy)]
pub struct Play {
    pub volume: u8,
    pub spec: PlaySpec,
}

#[async_trait]
impl Request for Play {
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError> {
        if self.spec.reps == 0 {
            return Ok(());
        }
        let volume = if self.volume == 0 {
            device.target_volume()
        } else {
            self.volume
        };

        debug!(device = %device.name(), "playing {}", self.spec);

        device
            .execute(
                ctx,
                "play",
                &[
                    ("folder", self.spec.file.folder.to_string()),
                    ("file", self.spec.file.file.to_string()),
                    ("volume", volume.to_string()),
                    ("reps", self.spec.reps.to_string()),
                    ("delay", self.spec.delay.as_millis().to_string()),
                    ("jitter", self.spec.jitter.as_millis().to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    fn duration(&self) -> Duration {
        self.spec.duration()
    }

    fn class(&self) -> RequestClass {
        RequestClass::Sound
    }

    fn name(&self) -> &'static str {
        "play"
    }
}

// ------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SetVolume {
    pub volume: u8,
}

#[async_trait]
impl Request for SetVolume {
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError> {
        let result = device
            .execute(
                ctx,
                "setvolume",
                &[
                    ("volume", self.volume.to_string()),
                    ("persist", "true".to_string()),
                ],
            )
            .await;

        // The target tracks intent, whether or not the device heard us.
        device.set_target_volume(self.volume);

        result.map(|_| ())
    }

    fn class(&self) -> RequestClass {
        RequestClass::Sound
    }

    fn name(&self) -> &'static str {
        "setvolume"
    }
}

// ------------------------------------------------------------------

/// Blink the LED. `speed` is the PWM ramp rate; one blink takes
/// `(256 / speed) * 2` milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Blink {
    pub speed: f64,
    pub delay: Duration,
    pub jitter: Duration,
    pub reps: u32,
}

#[async_trait]
impl Request for Blink {
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError> {
        device
            .execute(
                ctx,
                "blink",
                &[
                    ("speed", format!("{:.3}", self.speed)),
                    ("delay", self.delay.as_millis().to_string()),
                    ("jitter", self.jitter.as_millis().to_string()),
                    ("reps", self.reps.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    fn duration(&self) -> Duration {
        let one_blink_ms = (256.0 / self.speed) * 2.0 + self.delay.as_millis() as f64;
        Duration::from_secs_f64(one_blink_ms * f64::from(self.reps) / 1000.0)
    }

    fn class(&self) -> RequestClass {
        RequestClass::Light
    }

    fn name(&self) -> &'static str {
        "blink"
    }
}

// ------------------------------------------------------------------

macro_rules! plain_sound_request {
    ($name:ident, $endpoint:literal) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        #[async_trait]
        impl Request for $name {
            async fn execute(
                &self,
                ctx: &RunContext,
                device: &Arc<Device>,
            ) -> Result<(), DeviceError> {
                device.execute(ctx, $endpoint, &[]).await?;
                Ok(())
            }

            fn class(&self) -> RequestClass {
                RequestClass::Sound
            }

            fn name(&self) -> &'static str {
                $endpoint
            }
        }
    };
}

plain_sound_request!(Pause, "pause");
plain_sound_request!(Unpause, "unpause");
plain_sound_request!(Stop, "stop");

// ------------------------------------------------------------------

/// Poll `/battery` and remember the answer, forever: success or
/// failure, this request re-enqueues itself a minute out.
#[derive(Debug, Clone, Copy)]
pub struct KeepVoltageUpdated;

#[async_trait]
impl Request for KeepVoltageUpdated {
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError> {
        let result = device.execute(ctx, "battery", &[]).await;

        device.enqueue(
            ctx.clone(),
            Box::new(*self),
            VOLTAGE_UPDATE_DELAY,
            EnqueueFrom::Now,
        );

        let body = result?;
        let volts: f32 = body
            .trim()
            .parse()
            .map_err(|_| DeviceError::Parse {
                endpoint: "battery".to_string(),
                body: body.clone(),
            })?;

        device.set_statistic(VOLTAGE, volts);
        device.set_timestamp(LAST_VOLTAGE, Instant::now());
        debug!(device = %device.name(), "voltage is {volts:.2}");
        Ok(())
    }

    fn class(&self) -> RequestClass {
        RequestClass::Admin
    }

    fn name(&self) -> &'static str {
        "battery"
    }
}

// ------------------------------------------------------------------

/// Poll the device's pending-queue depth for one lease class, acking on
/// the channel once it reaches zero. Anything else — a non-zero depth,
/// a network failure, an unparseable body — means "try again in a few
/// seconds".
#[derive(Debug, Clone)]
pub struct DrainQueue {
    pub ack: mpsc::UnboundedSender<ClientId>,
    pub class: LeaseClass,
}

#[async_trait]
impl Request for DrainQueue {
    async fn execute(&self, ctx: &RunContext, device: &Arc<Device>) -> Result<(), DeviceError> {
        let endpoint = match self.class {
            LeaseClass::Sound => "soundpending",
            LeaseClass::Light => "lightpending",
        };

        let retry = |err| {
            device.enqueue(
                ctx.clone(),
                Box::new(self.clone()),
                TRANSIENT_DELAY,
                EnqueueFrom::Now,
            );
            err
        };

        let body = match device.execute(ctx, endpoint, &[]).await {
            Ok(body) => body,
            Err(err) => return Err(retry(err)),
        };
        let pending: i64 = match body.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                return Err(retry(DeviceError::Parse {
                    endpoint: endpoint.to_string(),
                    body,
                }))
            }
        };

        if pending == 0 {
            let _ = self.ack.send(device.id().clone());
            return Ok(());
        }

        device.enqueue(
            ctx.clone(),
            Box::new(self.clone()),
            TRANSIENT_DELAY,
            EnqueueFrom::Now,
        );
        Ok(())
    }

    fn class(&self) -> RequestClass {
        RequestClass::Admin
    }

    fn name(&self) -> &'static str {
        "drainqueue"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blink_duration_formula() {
        let blink = Blink {
            speed: 2.0,
            delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
            reps: 3,
        };
        // (256/2)*2 + 100 = 356 ms per blink, three blinks.
        assert_eq!(blink.duration(), Duration::from_millis(1068));
    }

    #[test]
    fn play_duration_delegates_to_spec() {
        let play = Play {
            volume: 0,
            spec: PlaySpec {
                file: crate::fileset::File {
                    folder: 1,
                    file: 2,
                    duration: 4.0,
                },
                reps: 2,
                delay: Duration::from_secs(1),
                jitter: Duration::ZERO,
            },
        };
        assert_eq!(play.duration(), Duration::from_secs(9));
        assert_eq!(play.class(), RequestClass::Sound);
    }

    #[test]
    fn classes_route_to_the_right_queues() {
        assert_eq!(Ping.class(), RequestClass::Admin);
        assert_eq!(Stop.class(), RequestClass::Sound);
        assert_eq!(Pause.class(), RequestClass::Sound);
        assert_eq!(Unpause.class(), RequestClass::Sound);
        assert_eq!(KeepVoltageUpdated.class(), RequestClass::Admin);
        assert_eq!(
            Blink {
                speed: 1.0,
                delay: Duration::ZERO,
                jitter: Duration::ZERO,
                reps: 1
            }
            .class(),
            RequestClass::Light
        );
    }
}
