use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use shared::types::{DiscoveryMode, EndpointDescriptor, NetworkClass, ScanStats};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use crate::net::{self, AddressRange, InterfaceSource, PortRange, SystemInterfaces};
use super::hello::UacpHelloDiscovery;
use super::options::{DiscoveryOptions, ScanTuning};
use super::probe::{
    handshake, probe_endpoint, EndpointDiscovery, HostProbe, PortProbe, ProbeOutcome,
    Reachability, TcpHostProbe, TcpPortProbe,
};

/// Resolved probes needed before the answer rate of an address is judged
const ABANDON_SAMPLE: u32 = 10;

/// How long in-flight probes may finish after a cancellation
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Network collaborators a scan run talks through.
#[derive(Clone)]
pub struct ProbeSet {
    pub host: Arc<dyn HostProbe>,
    pub port: Arc<dyn PortProbe>,
    pub discovery: Arc<dyn EndpointDiscovery>,
    pub interfaces: Arc<dyn InterfaceSource>,
}

impl ProbeSet {
    /// Real TCP probes against the interfaces of this host
    pub fn system() -> Self {
        Self {
            host: Arc::new(TcpHostProbe::default()),
            port: Arc::new(TcpPortProbe),
            discovery: Arc::new(UacpHelloDiscovery),
            interfaces: Arc::new(SystemInterfaces),
        }
    }
}

/// What a single run produced.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub descriptors: Vec<EndpointDescriptor>,
    /// Listening targets that failed the handshake
    pub not_discoverable: Vec<SocketAddr>,
    pub stats: ScanStats,
    pub cancelled: bool,
    pub deadline_expired: bool,
}

impl ScanOutcome {
    /// Every target was probed to the end
    pub fn is_complete(&self) -> bool {
        !self.cancelled && !self.deadline_expired
    }
}

/// Runs one discovery pass under bounded concurrency.
///
/// Addresses are handed out lazily as network permits free up; each address
/// task holds its permit while it checks reachability and probes ports, and
/// every port probe holds a permit of the shared port budget. Results flow
/// back through a channel, so nothing is retained beyond the run.
pub struct ProbeScheduler {
    probes: ProbeSet,
    cancel_grace: Duration,
}

enum ProbeEvent {
    Found(Vec<EndpointDescriptor>),
    NotDiscoverable(SocketAddr),
}

#[derive(Default)]
struct Counters {
    addresses_probed: AtomicU64,
    addresses_reachable: AtomicU64,
    ports_probed: AtomicU64,
    ports_open: AtomicU64,
    ports_timed_out: AtomicU64,
    ports_abandoned: AtomicU64,
    handshakes_failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self, endpoints_found: usize) -> ScanStats {
        ScanStats {
            addresses_probed: self.addresses_probed.load(Ordering::Relaxed),
            addresses_reachable: self.addresses_reachable.load(Ordering::Relaxed),
            ports_probed: self.ports_probed.load(Ordering::Relaxed),
            ports_open: self.ports_open.load(Ordering::Relaxed),
            ports_timed_out: self.ports_timed_out.load(Ordering::Relaxed),
            ports_abandoned: self.ports_abandoned.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            endpoints_found: endpoints_found as u64,
        }
    }
}

/// State shared by every task of one run
struct RunContext {
    probes: ProbeSet,
    tuning: ScanTuning,
    ports: Vec<PortRange>,
    port_budget: Arc<Semaphore>,
    check_reachability: bool,
    stop: CancellationToken,
    counters: Counters,
    events: mpsc::UnboundedSender<ProbeEvent>,
}

impl RunContext {
    fn emit(&self, event: ProbeEvent) {
        if !self.stop.is_cancelled() {
            let _ = self.events.send(event);
        }
    }
}

/// Tracks the answer rate of one address. Once enough probes resolved and
/// fewer than `min_percent` of them answered, the rest are skipped.
#[derive(Debug)]
struct AbandonTracker {
    min_percent: u32,
    answered: u32,
    timed_out: u32,
}

impl AbandonTracker {
    fn new(min_percent: u8) -> Self {
        Self {
            min_percent: min_percent as u32,
            answered: 0,
            timed_out: 0,
        }
    }

    fn record(&mut self, outcome: &ProbeOutcome) {
        if outcome.answered() {
            self.answered += 1;
        } else {
            self.timed_out += 1;
        }
    }

    fn should_abandon(&self) -> bool {
        let resolved = self.answered + self.timed_out;
        resolved >= ABANDON_SAMPLE && self.answered * 100 < self.min_percent * resolved
    }
}

impl ProbeScheduler {
    pub fn new(probes: ProbeSet) -> Self {
        Self {
            probes,
            cancel_grace: CANCEL_GRACE,
        }
    }

    /// Probe every target of `options` until done, `deadline` passes or
    /// `cancel` fires. Deadline and cancellation are not errors: the outcome
    /// carries what was collected and flags the truncation. Results reported
    /// before a cancellation are kept, those of probes that finish after it
    /// are dropped.
    pub async fn run(
        &self,
        options: Arc<DiscoveryOptions>,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<ScanOutcome> {
        let tuning = options.tuning().clone();
        let addresses = self.target_ranges(&options)?;
        let ports = options
            .port_ranges()
            .map(|ranges| ranges.to_vec())
            .unwrap_or_else(|| default_ports(options.mode()));

        debug!(
            "Scan in {:?} mode: {} addresses [{}], {} ports [{}], {} discovery URLs",
            options.mode(),
            addresses.iter().map(AddressRange::len).fold(0u128, u128::saturating_add),
            AddressRange::format_list(&addresses),
            ports.iter().map(PortRange::len).sum::<usize>(),
            PortRange::format_list(&ports),
            options.discovery_urls().len()
        );

        let mut outcome = ScanOutcome::default();
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let explicit = tokio::select! {
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            _ = tokio::time::sleep_until(deadline) => {
                outcome.deadline_expired = true;
                return Ok(outcome);
            }
            targets = resolve_discovery_urls(options.discovery_urls()) => targets,
        };

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let ctx = Arc::new(RunContext {
            probes: self.probes.clone(),
            port_budget: Arc::new(Semaphore::new(tuning.max_port_probes)),
            check_reachability: options.mode() != DiscoveryMode::Local,
            ports,
            tuning,
            stop: cancel.child_token(),
            counters: Counters::default(),
            events: events_tx,
        });
        let network_budget = Arc::new(Semaphore::new(ctx.tuning.max_network_probes));

        let mut hosts = JoinSet::new();
        for target in explicit {
            hosts.spawn(probe_discovery_url(ctx.clone(), target));
        }

        let mut targets = addresses.into_iter().flat_map(|range| range.iter());
        let mut exhausted = false;
        let deadline_timer = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_timer);

        loop {
            if exhausted && hosts.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                _ = &mut deadline_timer => {
                    outcome.deadline_expired = true;
                    break;
                }
                Some(event) = events.recv() => collect(&mut outcome, event),
                Some(joined) = hosts.join_next(), if !hosts.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("Address probe task panicked: {}", e);
                        }
                    }
                }
                permit = network_budget.clone().acquire_owned(), if !exhausted => {
                    let permit = permit.context("Network probe budget closed")?;
                    match targets.next() {
                        Some(address) => {
                            hosts.spawn(probe_address(ctx.clone(), address, permit));
                        }
                        None => exhausted = true,
                    }
                }
            }
        }

        ctx.stop.cancel();
        if outcome.cancelled {
            events.close();
            let drained = tokio::time::timeout(self.cancel_grace, async {
                while hosts.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                debug!("Probes still running after cancel grace period, aborting");
            }
        }
        hosts.shutdown().await;

        // Events queued before the stop still count, also on cancel
        while let Ok(event) = events.try_recv() {
            collect(&mut outcome, event);
        }

        outcome.stats = ctx.counters.snapshot(outcome.descriptors.len());
        info!(
            "Scan finished: {} addresses probed, {} reachable, {} ports probed, {} endpoints{}{}",
            outcome.stats.addresses_probed,
            outcome.stats.addresses_reachable,
            outcome.stats.ports_probed,
            outcome.stats.endpoints_found,
            if outcome.cancelled { " (cancelled)" } else { "" },
            if outcome.deadline_expired { " (deadline expired)" } else { "" },
        );
        Ok(outcome)
    }

    /// Address ranges to walk. Explicit ranges win; otherwise they derive
    /// from the local interfaces according to the mode.
    fn target_ranges(&self, options: &DiscoveryOptions) -> Result<Vec<AddressRange>> {
        if let Some(ranges) = options.address_ranges() {
            return Ok(ranges.to_vec());
        }

        let class = options.tuning().network_class;
        let ranges = match options.mode() {
            DiscoveryMode::Off => Vec::new(),
            DiscoveryMode::Local => {
                let mut ranges: Vec<AddressRange> = self
                    .probes
                    .interfaces
                    .list(NetworkClass::All)
                    .context("Failed to list local interfaces")?
                    .iter()
                    .filter(|iface| !iface.is_link_local())
                    .map(|iface| AddressRange::single(iface.address))
                    .collect();
                ranges.push(AddressRange::single(IpAddr::V4(Ipv4Addr::LOCALHOST)));
                ranges
            }
            DiscoveryMode::Fast | DiscoveryMode::Network | DiscoveryMode::Scan => {
                let cap = (options.mode() == DiscoveryMode::Fast).then_some(24);
                self.probes
                    .interfaces
                    .list(class)
                    .context("Failed to list local interfaces")?
                    .iter()
                    .filter(|iface| !iface.is_link_local())
                    .filter_map(|iface| iface.ipv4())
                    .map(|(address, netmask)| AddressRange::from_subnet(address, netmask, cap))
                    .collect()
            }
        };
        Ok(AddressRange::normalize(ranges))
    }
}

fn default_ports(mode: DiscoveryMode) -> Vec<PortRange> {
    match mode {
        DiscoveryMode::Local | DiscoveryMode::Scan => PortRange::all(),
        DiscoveryMode::Off | DiscoveryMode::Fast | DiscoveryMode::Network => {
            PortRange::well_known()
        }
    }
}

fn collect(outcome: &mut ScanOutcome, event: ProbeEvent) {
    match event {
        ProbeEvent::Found(descriptors) => outcome.descriptors.extend(descriptors),
        ProbeEvent::NotDiscoverable(target) => outcome.not_discoverable.push(target),
    }
}

async fn resolve_discovery_urls(urls: &[String]) -> Vec<SocketAddr> {
    let mut targets = Vec::new();
    for url in urls {
        match net::resolve_discovery_url(url).await {
            Ok(addrs) => targets.extend(addrs),
            Err(e) => warn!("Skipping discovery URL {}: {:#}", url, e),
        }
    }
    targets.sort();
    targets.dedup();
    targets
}

/// Handshake with a target named by a discovery URL. No reachability check
/// or port walk; the URL already says where the server listens.
async fn probe_discovery_url(ctx: Arc<RunContext>, target: SocketAddr) {
    let permit = tokio::select! {
        _ = ctx.stop.cancelled() => return,
        permit = ctx.port_budget.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };
    Counters::bump(&ctx.counters.ports_probed, 1);
    let outcome = handshake(
        ctx.probes.discovery.as_ref(),
        target,
        ctx.tuning.port_probe_timeout,
    )
    .await;
    drop(permit);
    account(&ctx, target, &outcome);
}

/// Check one address and walk its ports. Holds a network permit throughout.
async fn probe_address(ctx: Arc<RunContext>, address: IpAddr, _permit: OwnedSemaphorePermit) {
    Counters::bump(&ctx.counters.addresses_probed, 1);

    if ctx.check_reachability {
        let timeout = ctx.tuning.network_probe_timeout;
        let reach = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return,
            reach = tokio::time::timeout(timeout, ctx.probes.host.reach(address, timeout)) => {
                reach.unwrap_or(Reachability::Unreachable)
            }
        };
        if reach == Reachability::Unreachable {
            trace!("{} is unreachable", address);
            return;
        }
    }
    Counters::bump(&ctx.counters.addresses_reachable, 1);

    let mut tracker = AbandonTracker::new(ctx.tuning.min_port_probes_percent);
    let mut ports = ctx.ports.iter().flat_map(|range| range.iter());
    let mut remaining = true;
    let mut probes = JoinSet::new();

    loop {
        if remaining && tracker.should_abandon() {
            let skipped = ports.by_ref().count() as u64;
            Counters::bump(&ctx.counters.ports_abandoned, skipped);
            debug!(
                "Abandoning {} after {} of {} probes timed out, {} ports skipped",
                address,
                tracker.timed_out,
                tracker.answered + tracker.timed_out,
                skipped
            );
            remaining = false;
        }
        if !remaining && probes.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => break,
            Some(joined) = probes.join_next(), if !probes.is_empty() => {
                if let Ok(outcome) = joined {
                    tracker.record(&outcome);
                }
            }
            permit = ctx.port_budget.clone().acquire_owned(), if remaining => {
                let Ok(permit) = permit else { break };
                match ports.next() {
                    Some(port) => {
                        Counters::bump(&ctx.counters.ports_probed, 1);
                        probes.spawn(probe_port(ctx.clone(), SocketAddr::new(address, port), permit));
                    }
                    None => remaining = false,
                }
            }
        }
    }

    // In-flight probes are bounded by their timeouts; the run decides how
    // long it waits for them.
    while probes.join_next().await.is_some() {}
}

async fn probe_port(
    ctx: Arc<RunContext>,
    target: SocketAddr,
    _permit: OwnedSemaphorePermit,
) -> ProbeOutcome {
    let outcome = probe_endpoint(
        ctx.probes.port.as_ref(),
        ctx.probes.discovery.as_ref(),
        target,
        ctx.tuning.port_probe_timeout,
    )
    .await;
    if matches!(outcome, ProbeOutcome::Ok(_) | ProbeOutcome::HandshakeFailed(_)) {
        Counters::bump(&ctx.counters.ports_open, 1);
    }
    account(&ctx, target, &outcome);
    outcome
}

fn account(ctx: &RunContext, target: SocketAddr, outcome: &ProbeOutcome) {
    match outcome {
        ProbeOutcome::Ok(descriptors) => {
            debug!("Found {} endpoints at {}", descriptors.len(), target);
            ctx.emit(ProbeEvent::Found(descriptors.clone()));
        }
        ProbeOutcome::HandshakeFailed(reason) => {
            trace!("{} is listening but not discoverable: {}", target, reason);
            Counters::bump(&ctx.counters.handshakes_failed, 1);
            ctx.emit(ProbeEvent::NotDiscoverable(target));
        }
        ProbeOutcome::TimedOut => Counters::bump(&ctx.counters.ports_timed_out, 1),
        ProbeOutcome::Refused | ProbeOutcome::Unreachable => {}
    }
}
