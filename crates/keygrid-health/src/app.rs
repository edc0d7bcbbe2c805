//! Application-level health, owned by the load balancer front.

use std::time::Duration;

use async_trait::async_trait;
use keygrid_core::ProbeSpec;

use crate::checker::{ProbeResult, http_probe};

/// Probes whether a backend can serve traffic right now.
#[async_trait]
pub trait ApplicationHealth: Send + Sync {
    /// Probe one backend endpoint (`address:port`).
    async fn probe(&self, endpoint: &str) -> ProbeResult;
}

/// HTTP GET against a fixed path.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn from_spec(spec: &ProbeSpec) -> Self {
        Self::new(spec.path.clone(), spec.timeout)
    }
}

#[async_trait]
impl ApplicationHealth for HttpProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        http_probe(endpoint, &self.path, self.timeout).await
    }
}
