//! OS-invariant drift detection.
//!
//! A periodic sweep re-asserts the node prerequisites that tend to decay
//! under an operator's feet: swap stays off, the overlay and br_netfilter
//! modules stay loaded, IPv4 forwarding stays on, declared sysctls hold
//! their values, and the critical services stay running. Every failure is
//! logged and the sweep continues; drift detection never takes a node down.

use std::time::Duration;

use tracing::{debug, error, info, warn};

/// Path of the optional sysctl declaration file asserted on every sweep.
pub const SYSCTL_CONFIG_PATH: &str = "/etc/hostpool/sysctl.conf";

/// Kernel modules required by container networking.
pub const REQUIRED_MODULES: [&str; 2] = ["overlay", "br_netfilter"];

/// Periodic drift detector.
pub struct DriftDetector {
    /// Interval between sweeps
    pub interval: Duration,
    /// Services that must stay active
    pub services: Vec<String>,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_DRIFT_INTERVAL_SECS),
            services: vec!["containerd".to_string(), "kubelet".to_string()],
        }
    }
}

impl DriftDetector {
    /// Run the sweep loop until the process exits.
    pub async fn run(self) {
        info!(interval = ?self.interval, "starting drift detector");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly
        // bootstrapped node is not remediated mid-join.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One full sweep over every asserted invariant.
    pub async fn sweep(&self) {
        check_swap().await;
        check_kernel_modules().await;
        check_ip_forwarding().await;
        check_sysctl_file().await;
        self.check_services().await;
    }

    async fn check_services(&self) {
        for service in &self.services {
            let active = run_quiet("systemctl", &["is-active", "--quiet", service]).await;
            if active {
                continue;
            }
            warn!(service = %service, "service not active, starting");
            if run_quiet("systemctl", &["start", service]).await {
                info!(service = %service, "service started");
            } else {
                error!(service = %service, "failed to start service");
            }
        }
    }
}

async fn run_quiet(program: &str, args: &[&str]) -> bool {
    match tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(program = %program, error = %e, "command unavailable");
            false
        }
    }
}

/// Whether a /proc/swaps table shows any active swap device (anything
/// beyond the header line).
pub fn swap_is_active(proc_swaps: &str) -> bool {
    proc_swaps.trim().lines().count() > 1
}

async fn check_swap() {
    let contents = match tokio::fs::read_to_string("/proc/swaps").await {
        Ok(contents) => contents,
        Err(e) => {
            error!(error = %e, "failed to read /proc/swaps");
            return;
        }
    };
    if swap_is_active(&contents) {
        warn!("swap is enabled, disabling");
        if run_quiet("swapoff", &["-a"]).await {
            info!("swap disabled");
        } else {
            error!("failed to disable swap");
        }
    }
}

async fn check_kernel_modules() {
    // modprobe is idempotent for already-loaded modules.
    for module in REQUIRED_MODULES {
        if !run_quiet("modprobe", &[module]).await {
            error!(module = %module, "failed to load kernel module");
        }
    }
}

/// Map a sysctl key to its /proc/sys path.
pub fn sysctl_proc_path(key: &str) -> String {
    format!("/proc/sys/{}", key.replace('.', "/"))
}

async fn check_ip_forwarding() {
    let path = sysctl_proc_path("net.ipv4.ip_forward");
    match tokio::fs::read_to_string(&path).await {
        Ok(value) if value.trim() == "1" => {}
        Ok(_) => {
            warn!("IPv4 forwarding disabled, enabling");
            if let Err(e) = tokio::fs::write(&path, "1").await {
                error!(error = %e, "failed to enable IPv4 forwarding");
            }
        }
        Err(e) => error!(error = %e, "failed to read ip_forward"),
    }
}

/// Parse a sysctl declaration file: `key = value` lines, comments and
/// blanks skipped.
pub fn parse_sysctl_declarations(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

async fn check_sysctl_file() {
    let contents = match tokio::fs::read_to_string(SYSCTL_CONFIG_PATH).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            error!(error = %e, path = SYSCTL_CONFIG_PATH, "failed to read sysctl declarations");
            return;
        }
    };

    for (key, wanted) in parse_sysctl_declarations(&contents) {
        let current = tokio::fs::read_to_string(sysctl_proc_path(&key)).await;
        match current {
            Ok(current) if current.trim() == wanted => {}
            Ok(current) => {
                warn!(
                    key = %key,
                    expected = %wanted,
                    actual = %current.trim(),
                    "sysctl drift detected, remediating"
                );
                let assignment = format!("{}={}", key, wanted);
                if !run_quiet("sysctl", &["-w", &assignment]).await {
                    error!(key = %key, "failed to apply sysctl");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "failed to read sysctl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Swap detection
    // =========================================================================

    /// /proc/swaps with only the header means no swap; any device line
    /// beyond it triggers remediation.
    #[test]
    fn swap_detection_reads_proc_swaps_shape() {
        let header_only = "Filename\tType\tSize\tUsed\tPriority\n";
        assert!(!swap_is_active(header_only));

        let with_device =
            "Filename\tType\tSize\tUsed\tPriority\n/dev/sda2 partition 8388604 0 -2\n";
        assert!(swap_is_active(with_device));

        assert!(!swap_is_active(""));
    }

    // =========================================================================
    // Sysctl declarations
    // =========================================================================

    /// Declarations parse as key=value with comments and blanks skipped.
    #[test]
    fn sysctl_declarations_skip_comments_and_blanks() {
        let contents = "# required for kube-proxy\n\
                        net.bridge.bridge-nf-call-iptables = 1\n\
                        \n\
                        net.ipv4.ip_forward=1\n\
                        malformed-line\n";
        let parsed = parse_sysctl_declarations(contents);
        assert_eq!(
            parsed,
            vec![
                (
                    "net.bridge.bridge-nf-call-iptables".to_string(),
                    "1".to_string()
                ),
                ("net.ipv4.ip_forward".to_string(), "1".to_string()),
            ]
        );
    }

    /// Dotted keys map to their /proc/sys paths.
    #[test]
    fn sysctl_keys_map_to_proc_paths() {
        assert_eq!(
            sysctl_proc_path("net.ipv4.ip_forward"),
            "/proc/sys/net/ipv4/ip_forward"
        );
    }
}
