//! Kernel link query and SR-IOV VF programming capability.
//!
//! The monitor and the SR-IOV/traffic-control components never talk to
//! the kernel directly; they go through [`LinkManager`] so that tests
//! can substitute a recording fake. The production implementation
//! drives the `ip` tool and parses its JSON output.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

/// Link attributes as reported by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub oper_state: LinkOperState,
    pub vfs: Vec<VfAttrs>,
}

/// Per-VF attributes reported on the parent PF link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VfAttrs {
    pub id: u32,
    pub vlan: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkOperState {
    Up,
    Down,
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VfLinkState {
    Auto,
    Enable,
    Disable,
}

impl VfLinkState {
    fn as_str(&self) -> &'static str {
        match self {
            VfLinkState::Auto => "auto",
            VfLinkState::Enable => "enable",
            VfLinkState::Disable => "disable",
        }
    }
}

#[async_trait]
pub trait LinkManager: Send + Sync + 'static {
    /// Resolves a link by name, including operational state and the
    /// per-VF VLANs reported on it.
    async fn link_by_name(&self, name: &str) -> Result<LinkInfo>;

    async fn set_vf_vlan(&self, pf: &str, vf: u32, vlan: u16) -> Result<()>;

    async fn set_vf_link_state(&self, pf: &str, vf: u32, state: VfLinkState) -> Result<()>;
}

/// `LinkManager` backed by the iproute2 `ip` tool.
#[derive(Clone, Copy, Debug, Default)]
pub struct IpLinkManager(());

impl IpLinkManager {
    pub fn new() -> Self {
        Self(())
    }
}

#[async_trait]
impl LinkManager for IpLinkManager {
    async fn link_by_name(&self, name: &str) -> Result<LinkInfo> {
        let out = Command::new("ip")
            .args(["-details", "-json", "link", "show", "dev", name])
            .output()
            .await
            .context("failed to run ip")?;
        if !out.status.success() {
            bail!(
                "ip link show dev {name} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let links = parse_links(&out.stdout)?;
        links
            .into_iter()
            .next()
            .map(Into::into)
            .with_context(|| format!("link {name} not found"))
    }

    async fn set_vf_vlan(&self, pf: &str, vf: u32, vlan: u16) -> Result<()> {
        ip_link_set(&[
            "link",
            "set",
            "dev",
            pf,
            "vf",
            &vf.to_string(),
            "vlan",
            &vlan.to_string(),
        ])
        .await
    }

    async fn set_vf_link_state(&self, pf: &str, vf: u32, state: VfLinkState) -> Result<()> {
        ip_link_set(&[
            "link",
            "set",
            "dev",
            pf,
            "vf",
            &vf.to_string(),
            "state",
            state.as_str(),
        ])
        .await
    }
}

async fn ip_link_set(args: &[&str]) -> Result<()> {
    let out = Command::new("ip")
        .args(args)
        .output()
        .await
        .context("failed to run ip")?;
    if !out.status.success() {
        bail!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

fn parse_links(bytes: &[u8]) -> Result<Vec<IpLink>> {
    serde_json::from_slice(bytes).context("failed to parse ip link output")
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    operstate: String,
    #[serde(default)]
    vfinfo_list: Vec<IpVfInfo>,
}

#[derive(Debug, Deserialize)]
struct IpVfInfo {
    vf: u32,
    #[serde(default)]
    vlan: Option<u16>,
    // Newer iproute2 reports VF VLANs as a list.
    #[serde(default)]
    vlan_list: Vec<IpVfVlan>,
}

#[derive(Debug, Deserialize)]
struct IpVfVlan {
    #[serde(default)]
    vlan: u16,
}

impl From<IpLink> for LinkInfo {
    fn from(link: IpLink) -> Self {
        let oper_state = match link.operstate.as_str() {
            "UP" => LinkOperState::Up,
            "DOWN" => LinkOperState::Down,
            _ => LinkOperState::Unknown,
        };
        let vfs = link
            .vfinfo_list
            .into_iter()
            .map(|vf| VfAttrs {
                id: vf.vf,
                vlan: vf
                    .vlan_list
                    .first()
                    .map(|v| v.vlan)
                    .or(vf.vlan)
                    .unwrap_or(0),
            })
            .collect();
        LinkInfo {
            index: link.ifindex,
            name: link.ifname,
            oper_state,
            vfs,
        }
    }
}
