//! Host capacity, platform and network probing.
//!
//! Everything the registry publishes about a host is collected here: CPU
//! and memory capacity, GPU inventory, OS release, and the network
//! topology with the default-gateway interface marked. Probing failures
//! degrade gracefully - a host without `lspci` simply advertises zero GPUs.

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::net::{Ipv4Addr, Ipv6Addr};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::{debug, warn};

use crate::crd::types::{HostDetails, NetworkStatus};

/// Resource name GPUs are advertised under
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

// =============================================================================
// Capacity
// =============================================================================

/// Detect the host's resources (CPU, memory, GPU) as a capacity map.
pub async fn capacity() -> BTreeMap<String, Quantity> {
    let mut capacity = BTreeMap::new();

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    capacity.insert("cpu".to_string(), Quantity(cpus.to_string()));

    match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(meminfo) => {
            if let Some(bytes) = parse_mem_total(&meminfo) {
                capacity.insert("memory".to_string(), Quantity(bytes.to_string()));
            }
        }
        Err(e) => warn!(error = %e, "failed to read /proc/meminfo"),
    }

    let gpu = gpu_info().await;
    if gpu.count > 0 {
        capacity.insert(GPU_RESOURCE.to_string(), Quantity(gpu.count.to_string()));
    }

    capacity
}

/// Parse `MemTotal:` out of /proc/meminfo, returning bytes.
pub fn parse_mem_total(meminfo: &str) -> Option<i64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: i64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

// =============================================================================
// GPU inventory
// =============================================================================

/// Detected GPU inventory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpuInfo {
    /// Number of NVIDIA devices found
    pub count: usize,
    /// Sanitized model name of the first device, if identifiable
    pub model: Option<String>,
}

/// Scan for NVIDIA GPUs via `lspci -d 10de:` (10de is the NVIDIA vendor
/// ID). A missing or failing lspci leaves the inventory empty, never fatal.
pub async fn gpu_info() -> GpuInfo {
    let output = match tokio::process::Command::new("lspci")
        .args(["-d", "10de:"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => output.stdout,
        Ok(_) | Err(_) => {
            debug!("lspci unavailable or failed, assuming no GPUs");
            return GpuInfo::default();
        }
    };

    parse_lspci_output(&String::from_utf8_lossy(&output))
}

/// Parse lspci output into an inventory.
pub fn parse_lspci_output(output: &str) -> GpuInfo {
    let count = output
        .lines()
        .filter(|line| line.contains("NVIDIA"))
        .count();
    GpuInfo {
        count,
        model: parse_gpu_model(output),
    }
}

/// Extract a label-safe model name from a line like
/// `00:06.0 3D controller: NVIDIA Corporation Tesla T4 (rev a1)`.
pub fn parse_gpu_model(output: &str) -> Option<String> {
    const MARKER: &str = "NVIDIA Corporation";
    let line = output.lines().find(|l| l.contains(MARKER))?;
    let idx = line.find(MARKER)?;
    let mut remaining = line[idx + MARKER.len()..].trim();
    if let Some(rev) = remaining.rfind('(') {
        remaining = remaining[..rev].trim();
    }
    if remaining.is_empty() {
        return None;
    }
    // Label values only allow alphanumerics, dash, underscore and dot.
    let sanitized: String = remaining
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    Some(sanitized)
}

// =============================================================================
// Platform details
// =============================================================================

/// Gather the host's platform details: architecture, OS, and distribution
/// pretty-name from os-release.
pub async fn host_details() -> HostDetails {
    let os_release = match tokio::fs::read_to_string("/etc/os-release").await {
        Ok(content) => content,
        // Stateless systems keep os-release under /usr/lib.
        Err(_) => tokio::fs::read_to_string("/usr/lib/os-release")
            .await
            .unwrap_or_default(),
    };

    HostDetails {
        os_name: std::env::consts::OS.to_string(),
        os_image: parse_os_pretty_name(&os_release),
        architecture: std::env::consts::ARCH.to_string(),
    }
}

/// Extract PRETTY_NAME from an os-release document, trimming quotes and
/// the " LTS" suffix.
pub fn parse_os_pretty_name(os_release: &str) -> String {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').replace(" LTS", ""))
        .unwrap_or_else(|| "Unknown".to_string())
}

// =============================================================================
// Network
// =============================================================================

/// The interface carrying the default route, from a /proc/net/route table.
pub fn parse_default_route(route_table: &str) -> Option<String> {
    for line in route_table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "00000000" {
            return Some(fields[0].to_string());
        }
    }
    None
}

/// Addresses of one interface as reported by getifaddrs.
#[derive(Clone, Debug, Default)]
pub struct InterfaceInfo {
    /// Whether the interface is administratively up
    pub up: bool,
    /// CIDR-notation addresses
    pub addrs: Vec<String>,
}

fn prefix_len_v4(netmask: *const libc::sockaddr) -> u32 {
    if netmask.is_null() {
        return 32;
    }
    // Safety: caller guarantees the sockaddr came from getifaddrs for an
    // AF_INET entry.
    let mask = unsafe { &*(netmask as *const libc::sockaddr_in) };
    u32::from_be(mask.sin_addr.s_addr).count_ones()
}

fn prefix_len_v6(netmask: *const libc::sockaddr) -> u32 {
    if netmask.is_null() {
        return 128;
    }
    let mask = unsafe { &*(netmask as *const libc::sockaddr_in6) };
    mask.sin6_addr
        .s6_addr
        .iter()
        .map(|b| b.count_ones())
        .sum()
}

/// Enumerate interface addresses via getifaddrs.
pub fn interface_addrs() -> std::io::Result<BTreeMap<String, InterfaceInfo>> {
    let mut interfaces: BTreeMap<String, InterfaceInfo> = BTreeMap::new();

    // Safety: getifaddrs allocates a list we walk exactly once and free
    // with freeifaddrs before returning.
    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut cursor = ifap;
        while !cursor.is_null() {
            let ifa = &*cursor;
            cursor = ifa.ifa_next;

            if ifa.ifa_name.is_null() {
                continue;
            }
            let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
            let entry = interfaces.entry(name).or_default();
            entry.up = ifa.ifa_flags & (libc::IFF_UP as libc::c_uint) != 0;

            if ifa.ifa_addr.is_null() {
                continue;
            }
            match i32::from((*ifa.ifa_addr).sa_family) {
                libc::AF_INET => {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    entry
                        .addrs
                        .push(format!("{}/{}", ip, prefix_len_v4(ifa.ifa_netmask)));
                }
                libc::AF_INET6 => {
                    let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    entry
                        .addrs
                        .push(format!("{}/{}", ip, prefix_len_v6(ifa.ifa_netmask)));
                }
                _ => {}
            }
        }

        libc::freeifaddrs(ifap);
    }

    Ok(interfaces)
}

/// Probe the host's network status: every interface with its MAC and
/// addresses, the default-gateway interface flagged `is_default`.
pub async fn network_status() -> Vec<NetworkStatus> {
    let default_iface = tokio::fs::read_to_string("/proc/net/route")
        .await
        .ok()
        .and_then(|table| parse_default_route(&table));

    let interfaces = match interface_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(error = %e, "failed to enumerate interfaces");
            return Vec::new();
        }
    };

    let mut statuses = Vec::new();
    for (name, info) in interfaces {
        let mac = tokio::fs::read_to_string(format!("/sys/class/net/{}/address", name))
            .await
            .map(|m| m.trim().to_string())
            .unwrap_or_default();
        statuses.push(NetworkStatus {
            connected: info.up,
            is_default: default_iface.as_deref() == Some(name.as_str()),
            network_interface_name: name,
            mac_addr: mac,
            ip_addrs: info.addrs,
        });
    }
    statuses
}

/// Name of the default-gateway interface, if one is known.
pub async fn default_interface_name() -> Option<String> {
    tokio::fs::read_to_string("/proc/net/route")
        .await
        .ok()
        .and_then(|table| parse_default_route(&table))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Memory probing
    // =========================================================================

    /// MemTotal is reported in kB and converted to bytes for the capacity
    /// map the scheduler compares against.
    #[test]
    fn mem_total_converts_kb_to_bytes() {
        let meminfo = "MemTotal:       16326656 kB\nMemFree:         1024 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16326656 * 1024));
    }

    #[test]
    fn missing_mem_total_yields_none() {
        assert_eq!(parse_mem_total("MemFree: 12 kB\n"), None);
        assert_eq!(parse_mem_total(""), None);
    }

    // =========================================================================
    // GPU probing
    // =========================================================================

    const LSPCI_T4: &str =
        "00:06.0 3D controller: NVIDIA Corporation Tesla T4 (rev a1)\n\
         00:07.0 3D controller: NVIDIA Corporation Tesla T4 (rev a1)\n";

    /// Each NVIDIA line counts as one device; the model name is extracted
    /// from the first.
    #[test]
    fn lspci_output_counts_and_names_gpus() {
        let info = parse_lspci_output(LSPCI_T4);
        assert_eq!(info.count, 2);
        assert_eq!(info.model.as_deref(), Some("Tesla_T4"));
    }

    /// Model names are sanitized to label-safe characters (spaces become
    /// underscores, revision suffixes drop).
    #[test]
    fn gpu_model_is_label_safe() {
        let model = parse_gpu_model(
            "01:00.0 VGA compatible controller: NVIDIA Corporation GeForce RTX 4090 (rev a1)\n",
        )
        .unwrap();
        assert_eq!(model, "GeForce_RTX_4090");
        assert!(model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
    }

    /// Non-NVIDIA output yields an empty inventory.
    #[test]
    fn foreign_devices_are_not_counted() {
        let info = parse_lspci_output("00:02.0 VGA compatible controller: Intel Corporation HD Graphics\n");
        assert_eq!(info.count, 0);
        assert_eq!(info.model, None);
    }

    // =========================================================================
    // OS release parsing
    // =========================================================================

    /// PRETTY_NAME is unquoted and the LTS suffix dropped, matching the
    /// compact form the pool reports.
    #[test]
    fn pretty_name_is_unquoted_and_trimmed() {
        let os_release = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\nID=ubuntu\n";
        assert_eq!(parse_os_pretty_name(os_release), "Ubuntu 22.04.3");
    }

    #[test]
    fn missing_pretty_name_reads_unknown() {
        assert_eq!(parse_os_pretty_name("ID=minimal\n"), "Unknown");
    }

    // =========================================================================
    // Default route parsing
    // =========================================================================

    /// The interface whose destination is 00000000 carries the default
    /// gateway; that is the interface marked is_default in host status.
    #[test]
    fn default_route_names_the_gateway_interface() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\n\
                     eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert_eq!(parse_default_route(table).as_deref(), Some("eth0"));
    }

    #[test]
    fn no_default_route_yields_none() {
        let table = "Iface\tDestination\tGateway \tFlags\n\
                     eth0\t0001A8C0\t00000000\t0001\n";
        assert_eq!(parse_default_route(table), None);
    }

    /// getifaddrs-based enumeration works on any Linux host this agent
    /// runs on; loopback is always present.
    #[test]
    fn interface_enumeration_sees_loopback() {
        let interfaces = interface_addrs().expect("getifaddrs should succeed");
        assert!(interfaces.contains_key("lo"), "loopback should exist");
        let lo = &interfaces["lo"];
        assert!(lo.addrs.iter().any(|a| a.starts_with("127.0.0.1/")));
    }
}
