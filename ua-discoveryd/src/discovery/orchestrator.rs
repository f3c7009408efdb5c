use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use shared::types::{
    DiscoveryConfig, DiscoveryMode, DiscoveryStatus, ReconcileSummary, ScanReport, ScanStats,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::config::BridgeConfig;
use crate::net;
use crate::registry::{ReconcileMode, Registry};
use super::options::DiscoveryOptions;
use super::probe::{handshake, EndpointDiscovery, ProbeOutcome};
use super::scheduler::{ProbeScheduler, ProbeSet};

/// How long a running scan may take to wind down at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Requests accepted by the orchestrator task
pub enum DiscoveryCommand {
    SetMode {
        mode: DiscoveryMode,
        config: Box<DiscoveryConfig>,
        reply: oneshot::Sender<bool>,
    },
    TriggerScan,
    CancelScan,
    Register {
        url: String,
        reply: oneshot::Sender<Result<ReconcileSummary>>,
    },
}

/// Control surface of the discovery loop
#[derive(Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::Sender<DiscoveryCommand>,
    status: watch::Receiver<DiscoveryStatus>,
}

impl DiscoveryHandle {
    /// Replace mode and configuration. Returns true when the change
    /// restarted scanning.
    pub async fn set_discovery_mode(&self, mode: DiscoveryMode, config: DiscoveryConfig) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DiscoveryCommand::SetMode {
                mode,
                config: Box::new(config),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Start a scan now unless one is already running
    pub async fn trigger_scan(&self) -> Result<()> {
        self.tx.send(DiscoveryCommand::TriggerScan).await?;
        Ok(())
    }

    pub async fn cancel_scan(&self) -> Result<()> {
        self.tx.send(DiscoveryCommand::CancelScan).await?;
        Ok(())
    }

    /// Handshake the server behind `url` and register what it reports
    pub async fn register(&self, url: String) -> Result<ReconcileSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DiscoveryCommand::Register { url, reply }).await?;
        rx.await?
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryStatus> {
        self.status.clone()
    }
}

struct ActiveScan {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<ScanReport>,
}

/// Collaborators a scan or register request needs, shared with spawned tasks
#[derive(Clone)]
struct ScanContext {
    scheduler: Arc<ProbeScheduler>,
    discovery: Arc<dyn EndpointDiscovery>,
    registry: Arc<Registry>,
    owner: Arc<BridgeConfig>,
}

/// Owns the discovery options and runs at most one scan at a time.
///
/// Scans repeat after the idle time of the current mode. A configuration
/// change that requires a restart cancels the running scan and starts a
/// fresh generation once it has wound down, so a run never mixes settings.
pub struct ScanOrchestrator {
    ctx: ScanContext,
    options: DiscoveryOptions,
    commands: mpsc::Receiver<DiscoveryCommand>,
    status: watch::Sender<DiscoveryStatus>,
    generation: u64,
}

impl ScanOrchestrator {
    pub fn new(
        probes: ProbeSet,
        registry: Arc<Registry>,
        owner: BridgeConfig,
        options: DiscoveryOptions,
    ) -> (Self, DiscoveryHandle) {
        let (tx, commands) = mpsc::channel(64);
        let (status, status_rx) = watch::channel(DiscoveryStatus {
            mode: options.mode(),
            ..Default::default()
        });

        let orchestrator = Self {
            ctx: ScanContext {
                discovery: probes.discovery.clone(),
                scheduler: Arc::new(ProbeScheduler::new(probes)),
                registry,
                owner: Arc::new(owner),
            },
            options,
            commands,
            status,
            generation: 0,
        };
        let handle = DiscoveryHandle {
            tx,
            status: status_rx,
        };
        (orchestrator, handle)
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut active: Option<ActiveScan> = None;
        let mut registrations = JoinSet::new();
        let mut next_scan = self.scans_periodically().then(Instant::now);

        info!("Discovery running in {:?} mode", self.options.mode());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        DiscoveryCommand::SetMode { mode, config, reply } => {
                            let restart = self.options.update_from_model(mode, &config);
                            let _ = reply.send(restart);
                            self.status.send_modify(|s| s.mode = mode);
                            if restart {
                                info!("Discovery settings changed, restarting in {:?} mode", mode);
                                if let Some(scan) = &active {
                                    scan.cancel.cancel();
                                }
                                next_scan = self.scans_periodically().then(Instant::now);
                            }
                        }
                        DiscoveryCommand::TriggerScan => {
                            if active.is_none() {
                                next_scan = Some(Instant::now());
                            } else {
                                debug!("Scan already running, ignoring trigger");
                            }
                        }
                        DiscoveryCommand::CancelScan => {
                            if let Some(scan) = &active {
                                info!("Cancelling scan {}", scan.generation);
                                scan.cancel.cancel();
                            }
                        }
                        DiscoveryCommand::Register { url, reply } => {
                            let ctx = self.ctx.clone();
                            let timeout = self.options.tuning().port_probe_timeout;
                            registrations.spawn(async move {
                                let _ = reply.send(register(ctx, &url, timeout).await);
                            });
                        }
                    }
                }
                joined = finished(&mut active) => {
                    let generation = active.take().map(|scan| scan.generation).unwrap_or_default();
                    self.complete_scan(generation, joined);
                    if next_scan.is_none() && self.scans_periodically() {
                        next_scan = Some(Instant::now() + self.options.tuning().idle_time_between_scans);
                    }
                }
                _ = wait_until(next_scan), if active.is_none() => {
                    next_scan = None;
                    active = Some(self.start_scan(&cancel));
                }
                Some(_) = registrations.join_next(), if !registrations.is_empty() => {}
            }
        }

        if let Some(scan) = active.take() {
            scan.cancel.cancel();
            let generation = scan.generation;
            match tokio::time::timeout(SHUTDOWN_GRACE, scan.task).await {
                Ok(joined) => self.complete_scan(generation, joined),
                Err(_) => warn!("Scan {} did not stop in time", generation),
            }
        }
        registrations.shutdown().await;

        info!("Discovery shutting down");
        Ok(())
    }

    /// Off mode only scans when asked to
    fn scans_periodically(&self) -> bool {
        self.options.mode() != DiscoveryMode::Off
    }

    fn start_scan(&mut self, shutdown: &CancellationToken) -> ActiveScan {
        self.generation += 1;
        let generation = self.generation;
        let cancel = shutdown.child_token();
        let snapshot = self.options.snapshot();

        info!("Starting scan {} in {:?} mode", generation, snapshot.mode());
        self.status.send_modify(|s| {
            s.generation = generation;
            s.scanning = true;
        });

        let task = tokio::spawn(scan(self.ctx.clone(), generation, snapshot, cancel.clone()));
        ActiveScan {
            generation,
            cancel,
            task,
        }
    }

    fn complete_scan(&mut self, generation: u64, joined: Result<ScanReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!("Scan {} task failed: {}", generation, e);
                let now = Utc::now();
                ScanReport {
                    generation,
                    mode: self.options.mode(),
                    started: now,
                    finished: now,
                    stats: ScanStats::default(),
                    cancelled: e.is_cancelled(),
                    deadline_expired: false,
                    summary: None,
                    error: Some(e.to_string()),
                }
            }
        };
        self.status.send_modify(|s| {
            s.scanning = false;
            s.last_scan = Some(report);
        });
    }
}

async fn finished(active: &mut Option<ActiveScan>) -> Result<ScanReport, JoinError> {
    match active {
        Some(scan) => (&mut scan.task).await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// One scan generation: probe, then merge into the registry. Complete runs
/// reconcile in full; truncated runs, cancelled ones included, only add and
/// refresh what they found.
async fn scan(
    ctx: ScanContext,
    generation: u64,
    options: Arc<DiscoveryOptions>,
    cancel: CancellationToken,
) -> ScanReport {
    let started = Utc::now();
    let deadline = Instant::now() + options.tuning().max_scan_duration;
    let mut report = ScanReport {
        generation,
        mode: options.mode(),
        started,
        finished: started,
        stats: ScanStats::default(),
        cancelled: false,
        deadline_expired: false,
        summary: None,
        error: None,
    };

    match ctx.scheduler.run(options.clone(), deadline, cancel).await {
        Err(e) => {
            error!("Scan {} failed: {:#}", generation, e);
            report.error = Some(format!("{:#}", e));
        }
        Ok(outcome) => {
            report.stats = outcome.stats;
            report.cancelled = outcome.cancelled;
            report.deadline_expired = outcome.deadline_expired;

            // Truncated runs and Off mode only saw part of the network
            let mode = if outcome.is_complete() && options.mode() != DiscoveryMode::Off {
                ReconcileMode::Full
            } else {
                ReconcileMode::RegisterOnly
            };
            if outcome.cancelled {
                info!(
                    "Scan {} cancelled, registering the {} endpoints found so far",
                    generation,
                    outcome.descriptors.len()
                );
            }
            match ctx
                .registry
                .reconcile(
                    &outcome.descriptors,
                    &ctx.owner.supervisor_id,
                    ctx.owner.site_id.as_deref(),
                    Utc::now(),
                    mode,
                )
                .await
            {
                Ok(summary) => {
                    info!(
                        "Scan {} reconciled: {} applications added, {} disabled; {} endpoints added, {} disabled",
                        generation,
                        summary.applications.added,
                        summary.applications.disabled,
                        summary.endpoints.added,
                        summary.endpoints.disabled
                    );
                    report.summary = Some(summary);
                }
                Err(e) => {
                    error!("Failed to reconcile scan {}: {}", generation, e);
                    report.error = Some(e.to_string());
                }
            }
        }
    }

    report.finished = Utc::now();
    report
}

/// Resolve a discovery URL, handshake every address it names and register
/// whatever answers. Never disables anything.
async fn register(ctx: ScanContext, url: &str, timeout: Duration) -> Result<ReconcileSummary> {
    let targets = net::resolve_discovery_url(url).await?;

    let mut descriptors = Vec::new();
    for target in targets {
        match handshake(ctx.discovery.as_ref(), target, timeout).await {
            ProbeOutcome::Ok(found) => descriptors.extend(found),
            other => debug!("Register target {} did not answer: {:?}", target, other),
        }
    }
    if descriptors.is_empty() {
        bail!("No OPC UA server answered at {}", url);
    }

    ctx.registry
        .reconcile(
            &descriptors,
            &ctx.owner.supervisor_id,
            ctx.owner.site_id.as_deref(),
            Utc::now(),
            ReconcileMode::RegisterOnly,
        )
        .await
        .map_err(|e| anyhow!("Failed to register {}: {}", url, e))
}
