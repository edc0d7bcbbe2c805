//! Application probe tracking.
//!
//! A [`HealthTracker`] folds individual probe results into a backend's
//! routable status using consecutive thresholds, and backs off the probe
//! interval while the backend keeps failing.

use std::time::Duration;

use keygrid_core::ProbeSpec;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Outcome of one application probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx response.
    Healthy,
    /// Non-2xx response, e.g. 503 from a sealed node.
    Unhealthy,
    /// Connection error or timeout.
    Failed,
}

/// Routable status of a backend as seen by the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Not probed enough to decide.
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
}

impl HealthTracker {
    pub fn from_spec(spec: &ProbeSpec) -> Self {
        Self::with_thresholds(
            spec.unhealthy_threshold,
            spec.healthy_threshold,
            spec.interval,
        )
    }

    pub fn with_thresholds(
        unhealthy_threshold: u32,
        healthy_threshold: u32,
        interval: Duration,
    ) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
        }
    }

    /// Fold one probe result in and return the resulting status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.current_backoff = self.base_interval;

                if self.consecutive_successes >= self.healthy_threshold
                    && self.status != HealthStatus::Healthy
                {
                    debug!(successes = self.consecutive_successes, "backend healthy");
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);

                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != HealthStatus::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        ?result,
                        "backend out of rotation"
                    );
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_routable(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Interval to wait before probing this backend again.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// Probe `http://{address}{path}`.
///
/// `Healthy` for 2xx, `Unhealthy` for any other status, `Failed` when the
/// connection fails or the deadline passes.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let outcome = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connect failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "keygrid-front/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        debug!(%uri, "probe timed out");
        ProbeResult::Failed
    })
}
