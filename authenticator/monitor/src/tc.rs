//! Traffic-control enforcement.
//!
//! Every configured interface gets a default-drop ingress policy at
//! startup; EAPOL frames and explicitly unprotected ports are allowed
//! through, and per-client permit/deny filters are installed as
//! supplicants authenticate and disconnect.

use crate::netlink::LinkManager;
use crate::sriov::{self, PfInfo};
use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

/// Destination ports exempted from the default-drop policy.
#[derive(Clone, Debug, Default)]
pub struct UnprotectedPorts {
    pub tcp: Vec<u16>,
    pub udp: Vec<u16>,
}

/// Fails when the `tc` binary is not on the PATH. Enforcement is
/// impossible without it, so this is checked once at startup.
pub fn ensure_tc() -> Result<()> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        if dir.join("tc").is_file() {
            return Ok(());
        }
    }
    bail!("tc binary not found on PATH")
}

/// Marks a client MAC as allowed on the PF and all associated VF
/// netdevs. When this is the first authenticated address, the PF flips
/// to authenticated and all VFs are reconciled before the filters are
/// installed.
pub async fn allow_traffic_from_mac(
    pf: &mut PfInfo,
    mac: &str,
    lm: &dyn LinkManager,
) -> Result<()> {
    if !pf.authenticated && !pf.authenticated_addrs.is_empty() {
        pf.authenticated = true;
        pf.reconcile_all_vfs(lm).await?;
    }
    for iface in sriov::associated_interfaces(&pf.name)? {
        replace_mac_filter(&iface, mac, "ok").await?;
    }
    Ok(())
}

/// Marks a client MAC as denied. When the last authenticated address
/// has been removed, the PF flips back to unauthenticated and all VFs
/// are forced to the reserved VLAN with their link disabled.
pub async fn deny_traffic_from_mac(
    pf: &mut PfInfo,
    mac: &str,
    lm: &dyn LinkManager,
) -> Result<()> {
    if pf.authenticated && pf.authenticated_addrs.is_empty() {
        pf.authenticated = false;
        pf.reconcile_all_vfs(lm).await?;
    }
    for iface in sriov::associated_interfaces(&pf.name)? {
        replace_mac_filter(&iface, mac, "drop").await?;
    }
    Ok(())
}

async fn replace_mac_filter(iface: &str, mac: &str, action: &str) -> Result<()> {
    tc(&[
        "filter", "replace", "dev", iface, "ingress", "pref", "9000", "protocol", "all",
        "flower", "src_mac", mac, "action", action,
    ])
    .await
}

/// Installs the baseline policy on one interface: drop everything by
/// default, and on an SR-IOV PF additionally pass EAPOL frames and the
/// configured unprotected ports. Any previous policy is removed first.
pub async fn init_interface_for_eap_traffic(
    if_name: &str,
    ports: &UnprotectedPorts,
) -> Result<()> {
    reset_interface(if_name).await?;
    tc(&["qdisc", "add", "dev", if_name, "clsact"]).await?;
    tc(&[
        "filter", "add", "dev", if_name, "ingress", "pref", "10001", "protocol", "all",
        "matchall", "action", "drop", "index", "101",
    ])
    .await?;
    if !sriov::is_sriov_pf(if_name) {
        return Ok(());
    }
    tc(&[
        "filter", "add", "dev", if_name, "ingress", "pref", "10000", "protocol", "0x888e",
        "matchall", "action", "ok", "index", "100",
    ])
    .await?;
    unprotect_ports(if_name, "tcp", &ports.tcp).await;
    unprotect_ports(if_name, "udp", &ports.udp).await;
    let all = ports.tcp.iter().chain(ports.udp.iter()).copied().collect::<Vec<_>>();
    unprotect_ipv6_ports(if_name, &all).await;
    Ok(())
}

/// Removes any ingress/clsact queueing discipline from the interface.
/// Removal of an absent discipline is not an error.
pub async fn reset_interface(if_name: &str) -> Result<()> {
    for qdisc in ["ingress", "clsact"] {
        if let Err(error) = tc(&["qdisc", "del", "dev", if_name, qdisc]).await {
            debug!(interface = if_name, qdisc, %error, "qdisc removal skipped");
        }
    }
    Ok(())
}

// Filter failures on individual ports are logged rather than aborting
// interface setup, so a bad port in the config cannot take down the
// whole policy.
async fn unprotect_ports(if_name: &str, protocol: &str, ports: &[u16]) {
    for port in ports {
        let port = port.to_string();
        let result = tc(&[
            "filter", "add", "dev", if_name, "ingress", "pref", "9999", "protocol", "ip",
            "u32", "match", protocol, "dst", &port, "0xffff", "action", "ok", "index", "99",
        ])
        .await;
        if let Err(error) = result {
            warn!(interface = if_name, protocol, port = %port, %error, "failed to unprotect port");
        }
    }
}

async fn unprotect_ipv6_ports(if_name: &str, ports: &[u16]) {
    for port in ports {
        let port = port.to_string();
        let result = tc(&[
            "filter", "add", "dev", if_name, "ingress", "pref", "9999", "protocol", "ipv6",
            "u32", "match", "ip6", "dport", &port, "0xffff", "action", "ok", "index", "100",
        ])
        .await;
        if let Err(error) = result {
            warn!(interface = if_name, protocol = "ipv6", port = %port, %error, "failed to unprotect port");
        }
    }
}

async fn tc(args: &[&str]) -> Result<()> {
    let out = Command::new("tc")
        .args(args)
        .output()
        .await
        .context("failed to run tc")?;
    if !out.status.success() {
        bail!(
            "tc {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}
