//! Node side: what an instance runs at first boot.
//!
//! Reads the boot payload, checks its digest, and asks the cloud for peers
//! carrying the payload's tag. Prints the retry-join list for the agent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use keygrid_cloud::SimulatedCloud;
use keygrid_discovery::{BootAgent, load_payload};
use tracing::info;

pub async fn run_boot(
    payload: &Path,
    instance_id: &str,
    cloud_state: &Path,
    max_wait: Option<Duration>,
) -> anyhow::Result<()> {
    let payload =
        load_payload(payload).with_context(|| format!("read boot payload {}", payload.display()))?;
    info!(role = %payload.role, instance = %instance_id, tag = %payload.tag(), "booting");

    let cloud = Arc::new(SimulatedCloud::load(cloud_state)?);
    let mut agent = BootAgent::new(cloud, instance_id, payload);
    if let Some(max_wait) = max_wait {
        agent = agent.with_max_wait(max_wait);
    }

    let outcome = agent.boot().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "role": outcome.role,
            "tag": outcome.tag.to_string(),
            "retry_join": outcome.retry_join(),
            "degraded": outcome.degraded,
        }))?
    );
    Ok(())
}
