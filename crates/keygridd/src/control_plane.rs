//! Operator side: plan, render, apply, and the long-running reconcile mode.
//!
//! In `run` mode the daemon:
//! 1. Applies the manifest once
//! 2. Probes the front's backends in the background
//! 3. Reconciles both fleets every interval
//! 4. Saves the simulated cloud after every pass and on shutdown

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use keygrid_cloud::SimulatedCloud;
use keygrid_core::{Manifest, RoleKind};
use keygrid_front::run_probe_loop;
use keygrid_health::HttpProbe;
use keygrid_orchestrator::{Orchestrator, resolve_deployment};
use keygrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let manifest =
        Manifest::from_file(path).with_context(|| format!("load manifest {}", path.display()))?;
    info!(path = ?path, cluster = %manifest.cluster.name, "manifest loaded");
    Ok(manifest)
}

fn open(
    manifest: &Path,
    state: &Path,
    cloud_state: &Path,
) -> anyhow::Result<(Orchestrator, Arc<SimulatedCloud>)> {
    let manifest = load_manifest(manifest)?;

    let store = StateStore::open(state)?;
    info!(path = ?state, "state store opened");

    let cloud = Arc::new(SimulatedCloud::load(cloud_state)?);
    info!(path = ?cloud_state, instances = cloud.instances().len(), "simulated cloud loaded");

    let probe = Arc::new(HttpProbe::from_spec(&manifest.front_spec()?.health));
    let orchestrator = Orchestrator::new(manifest, cloud.clone(), probe, store)?;
    Ok((orchestrator, cloud))
}

/// Print resolved images, tags, and payload digests.
pub fn run_plan(manifest: &Path) -> anyhow::Result<()> {
    let manifest = load_manifest(manifest)?;
    let resolved = resolve_deployment(&manifest, &manifest.image_catalog())?;

    let roles: Vec<_> = [RoleKind::Coordination, RoleKind::SecretStore]
        .into_iter()
        .map(|kind| {
            let role = resolved.role(kind);
            let payload = resolved.payload(kind);
            serde_json::json!({
                "kind": kind.label(),
                "name": role.name,
                "size": role.desired_size,
                "image_id": role.image_id,
                "zones": role.zones,
                "discovery_tag": role.discovery_tag.to_string(),
                "joins": payload.tag().to_string(),
                "payload_digest": payload.digest,
            })
        })
        .collect();
    let plan = serde_json::json!({
        "cluster": manifest.cluster.name,
        "roles": roles,
        "front": resolved.front,
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// Print (or write) one role's boot payload.
pub fn run_render(manifest: &Path, role: &str, out: Option<&Path>) -> anyhow::Result<()> {
    let manifest = load_manifest(manifest)?;
    let resolved = resolve_deployment(&manifest, &manifest.image_catalog())?;

    let kind = [RoleKind::Coordination, RoleKind::SecretStore]
        .into_iter()
        .find(|k| resolved.role(*k).name == role)
        .with_context(|| format!("no role named {role} in manifest"))?;
    let json = resolved.payload(kind).to_json()?;

    match out {
        Some(path) => {
            std::fs::write(path, &json).with_context(|| format!("write {}", path.display()))?;
            info!(%role, path = ?path, "payload written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Run the deployment once and save the cloud snapshot, even on failure.
pub async fn run_apply(manifest: &Path, state: &Path, cloud_state: &Path) -> anyhow::Result<()> {
    let (orchestrator, cloud) = open(manifest, state, cloud_state)?;
    let result = orchestrator.apply().await;
    cloud.save(cloud_state)?;

    let report = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "cluster": report.cluster,
            "coordination_launched": report.coordination.launched,
            "secret_store_launched": report.secret_store.launched,
            "grant": format!("{:?}", report.grant),
            "front": report.front_address,
            "backends": report.backends.iter().map(|b| b.endpoint()).collect::<Vec<_>>(),
            "dns": report.dns.map(|d| format!("{d:?}")),
        }))?
    );
    Ok(())
}

/// Apply, then reconcile until Ctrl-C.
pub async fn run_control_plane(
    manifest: &Path,
    state: &Path,
    cloud_state: &Path,
    interval: Duration,
) -> anyhow::Result<()> {
    info!("keygrid daemon starting in control-plane mode");
    let (orchestrator, cloud) = open(manifest, state, cloud_state)?;
    let orchestrator = Arc::new(orchestrator);

    let applied = orchestrator.apply().await;
    cloud.save(cloud_state)?;
    let report = applied?;
    info!(cluster = %report.cluster, front = %report.front_address, "initial deployment applied");

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────
    let front = orchestrator.front();
    let probe_interval = front.spec().health.interval;
    let probe_handle = tokio::spawn(run_probe_loop(front, probe_interval, shutdown_rx.clone()));

    let reconcile_handle = tokio::spawn(reconcile_loop(
        Arc::clone(&orchestrator),
        Arc::clone(&cloud),
        cloud_state.to_path_buf(),
        interval,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    join_background([("probe", probe_handle), ("reconcile", reconcile_handle)]).await;
    cloud.save(cloud_state)?;

    info!("control plane stopped");
    Ok(())
}

/// Wait for every background task. Returns how many ended abnormally.
async fn join_background<const N: usize>(tasks: [(&'static str, JoinHandle<()>); N]) -> usize {
    let mut failed = 0;
    for (task, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task, error = %e, "background task ended abnormally");
            failed += 1;
        }
    }
    failed
}

async fn reconcile_loop(
    orchestrator: Arc<Orchestrator>,
    cloud: Arc<SimulatedCloud>,
    cloud_state: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                // Simulated instances finish booting between passes.
                cloud.mark_all_ready();
                match orchestrator.reconcile_all().await {
                    Ok(report) if report.is_noop() => {
                        debug!(backends = report.backends.len(), "fleets at target");
                    }
                    Ok(report) => {
                        info!(
                            coordination = ?report.coordination.as_ref().map(|r| (r.launched.len(), r.terminated.len())),
                            secret_store = ?report.secret_store.as_ref().map(|r| (r.launched.len(), r.terminated.len())),
                            backends = report.backends.len(),
                            "reconcile pass made changes"
                        );
                    }
                    Err(e) => error!(error = %e, "reconcile pass failed"),
                }
                if let Err(e) = cloud.save(&cloud_state) {
                    warn!(error = %e, "failed to save cloud snapshot");
                }
            }
            _ = shutdown.changed() => {
                debug!("reconcile loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicked_background_task_is_reported() {
        let clean = tokio::spawn(async {});
        let panicked: JoinHandle<()> = tokio::spawn(async { panic!("reconcile blew up") });
        assert_eq!(join_background([("probe", clean), ("reconcile", panicked)]).await, 1);
    }
}
