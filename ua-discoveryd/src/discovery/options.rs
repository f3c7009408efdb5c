use std::sync::Arc;
use std::time::Duration;
use shared::types::{DiscoveryConfig, DiscoveryMode, NetworkClass};
use crate::net::{AddressRange, PortRange, RangeError};

/// Effective scan parameters after applying the mode defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTuning {
    pub idle_time_between_scans: Duration,
    pub port_probe_timeout: Duration,
    pub network_probe_timeout: Duration,
    pub max_port_probes: usize,
    pub max_network_probes: usize,
    pub min_port_probes_percent: u8,
    pub max_scan_duration: Duration,
    pub network_class: NetworkClass,
}

impl ScanTuning {
    pub fn for_mode(mode: DiscoveryMode) -> Self {
        let (port_ms, network_ms, max_port, max_network, idle_secs, duration_secs) = match mode {
            DiscoveryMode::Local => (500, 500, 1000, 1, 3600, 10 * 60),
            DiscoveryMode::Off | DiscoveryMode::Fast => (1000, 1000, 1000, 200, 3600, 30 * 60),
            DiscoveryMode::Network => (3000, 2000, 1000, 500, 6 * 3600, 2 * 3600),
            DiscoveryMode::Scan => (5000, 3000, 5000, 1000, 6 * 3600, 6 * 3600),
        };
        Self {
            idle_time_between_scans: Duration::from_secs(idle_secs),
            port_probe_timeout: Duration::from_millis(port_ms),
            network_probe_timeout: Duration::from_millis(network_ms),
            max_port_probes: max_port,
            max_network_probes: max_network,
            min_port_probes_percent: 80,
            max_scan_duration: Duration::from_secs(duration_secs),
            network_class: NetworkClass::Wired,
        }
    }

    /// Mode defaults overlaid with whatever the model sets explicitly
    pub fn resolve(mode: DiscoveryMode, config: &DiscoveryConfig) -> Self {
        let defaults = Self::for_mode(mode);
        Self {
            idle_time_between_scans: config
                .idle_time_between_scans_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_time_between_scans),
            port_probe_timeout: config
                .port_probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.port_probe_timeout),
            network_probe_timeout: config
                .network_probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.network_probe_timeout),
            max_port_probes: config.max_port_probes.unwrap_or(defaults.max_port_probes).max(1),
            max_network_probes: config
                .max_network_probes
                .unwrap_or(defaults.max_network_probes)
                .max(1),
            min_port_probes_percent: config
                .min_port_probes_percent
                .unwrap_or(defaults.min_port_probes_percent)
                .min(100),
            max_scan_duration: config
                .max_scan_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_scan_duration),
            network_class: config.network_class.unwrap_or(defaults.network_class),
        }
    }

    /// Fields whose change invalidates a scan in progress
    fn scan_affecting(&self) -> (Duration, Duration, usize, usize, NetworkClass) {
        (
            self.port_probe_timeout,
            self.network_probe_timeout,
            self.max_port_probes,
            self.max_network_probes,
            self.network_class,
        )
    }
}

/// Desired discovery settings, owned by the orchestrator. Scan runs get an
/// immutable snapshot through `snapshot`.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    mode: DiscoveryMode,
    tuning: ScanTuning,
    address_ranges: Option<Vec<AddressRange>>,
    port_ranges: Option<Vec<PortRange>>,
    discovery_urls: Vec<String>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Off,
            tuning: ScanTuning::for_mode(DiscoveryMode::Off),
            address_ranges: None,
            port_ranges: None,
            discovery_urls: Vec::new(),
        }
    }
}

impl DiscoveryOptions {
    pub fn new(mode: DiscoveryMode, config: &DiscoveryConfig) -> Self {
        let mut options = Self::default();
        options.update_from_model(mode, config);
        options
    }

    /// Apply a new mode and configuration model. Returns true when a scan in
    /// progress must be restarted to honour the change.
    ///
    /// Range text that fails to parse keeps the previous ranges and does not
    /// by itself request a restart; empty range text clears them.
    pub fn update_from_model(&mut self, mode: DiscoveryMode, config: &DiscoveryConfig) -> bool {
        let tuning = ScanTuning::resolve(mode, config);

        let mut restart = mode != self.mode
            || tuning.scan_affecting() != self.tuning.scan_affecting();

        self.mode = mode;
        self.tuning = tuning;
        self.discovery_urls = config.discovery_urls.clone();

        restart |= update_ranges(
            config.address_ranges.as_deref(),
            &mut self.address_ranges,
            AddressRange::parse_list,
            "address",
        );
        restart |= update_ranges(
            config.port_ranges.as_deref(),
            &mut self.port_ranges,
            PortRange::parse_list,
            "port",
        );

        restart
    }

    /// Independent copy for a scan run
    pub fn snapshot(&self) -> Arc<DiscoveryOptions> {
        Arc::new(self.clone())
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    pub fn tuning(&self) -> &ScanTuning {
        &self.tuning
    }

    pub fn address_ranges(&self) -> Option<&[AddressRange]> {
        self.address_ranges.as_deref()
    }

    pub fn port_ranges(&self) -> Option<&[PortRange]> {
        self.port_ranges.as_deref()
    }

    pub fn discovery_urls(&self) -> &[String] {
        &self.discovery_urls
    }
}

fn update_ranges<T: PartialEq>(
    text: Option<&str>,
    current: &mut Option<Vec<T>>,
    parse: impl Fn(&str) -> Result<Vec<T>, RangeError>,
    what: &str,
) -> bool {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return current.take().is_some();
    };

    match parse(text) {
        Ok(ranges) if current.as_ref() == Some(&ranges) => false,
        Ok(ranges) => {
            *current = Some(ranges);
            true
        }
        Err(e) => {
            tracing::warn!("Ignoring {} ranges '{}': {}", what, text, e);
            false
        }
    }
}
