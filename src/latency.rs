//! Continuous WAN round-trip measurement.
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::events::{Event, EventChannel};
use crate::types::LatencySample;

pub const DEFAULT_TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// A single reachability check. `None` means no answer within `timeout`.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn round_trip(&self, target: IpAddr, timeout: Duration) -> Option<Duration>;
}

/// ICMP echo through `surge-ping`. Needs raw-socket rights or unprivileged
/// ICMP enabled (`net.ipv4.ping_group_range`); without them every sample is
/// reported unreachable.
pub struct IcmpProbe;

const PAYLOAD: [u8; 8] = [0; 8];

#[async_trait]
impl LatencyProbe for IcmpProbe {
    async fn round_trip(&self, target: IpAddr, timeout: Duration) -> Option<Duration> {
        match time::timeout(timeout, surge_ping::ping(target, &PAYLOAD)).await {
            Ok(Ok((_packet, rtt))) => Some(rtt),
            Ok(Err(e)) => {
                debug!(%target, "ping failed: {e}");
                None
            }
            Err(_) => None,
        }
    }
}

/// Probes a fixed address forever and publishes every sample.
pub struct LatencyMonitor {
    probe: Arc<dyn LatencyProbe>,
    target: IpAddr,
    timeout: Duration,
    interval: Duration,
    events: EventChannel,
}

impl LatencyMonitor {
    pub fn new(probe: Arc<dyn LatencyProbe>, target: IpAddr, events: EventChannel) -> Self {
        Self {
            probe,
            target,
            timeout: PROBE_TIMEOUT,
            interval: PROBE_INTERVAL,
            events,
        }
    }

    pub fn with_timing(mut self, timeout: Duration, interval: Duration) -> Self {
        self.timeout = timeout;
        self.interval = interval;
        self
    }

    /// One probe, as it would be published.
    pub async fn sample(&self) -> LatencySample {
        match self.probe.round_trip(self.target, self.timeout).await {
            Some(rtt) => LatencySample::from_rtt(rtt),
            None => LatencySample::UNREACHABLE,
        }
    }

    /// Start the loop on its own task. It has no stop path; it ends with the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(target = %self.target, interval = ?self.interval, "latency monitor started");
        tokio::spawn(async move {
            loop {
                let sample = self.sample().await;
                self.events.publish(Event::Latency(sample));
                time::sleep(self.interval).await;
            }
        })
    }
}
