//! SR-IOV topology and VF VLAN/link-state enforcement.
//!
//! A PF's VFs are forced onto the reserved VLAN with their link held
//! down while no client is authenticated on the PF; once any client
//! authenticates, the tracked VLANs are restored and link state is
//! returned to automatic.

use crate::netlink::{LinkManager, VfLinkState};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// Reserved VLAN programmed while the PF is unauthenticated.
pub const RESERVED_VLAN: u16 = 4095;

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Authentication state of a physical function and its VFs.
#[derive(Clone, Debug)]
pub struct PfInfo {
    pub name: String,
    pub authenticated: bool,
    pub authenticated_addrs: HashSet<String>,
    pub vfs: BTreeMap<u32, VfInfo>,
}

/// A VF is referenced by index on its parent PF; the tracked VLAN is
/// the last value observed from the kernel that was not the reserved
/// sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VfInfo {
    pub index: u32,
    pub vlan: u16,
}

impl PfInfo {
    /// Resolves the PF link and enumerates its VFs with their current
    /// VLANs. The PF starts unauthenticated.
    pub async fn discover(name: &str, lm: &dyn LinkManager) -> Result<Self> {
        let link = lm.link_by_name(name).await?;
        let vfs = link
            .vfs
            .iter()
            .map(|vf| {
                (
                    vf.id,
                    VfInfo {
                        index: vf.id,
                        vlan: vf.vlan,
                    },
                )
            })
            .collect();
        Ok(PfInfo {
            name: name.to_string(),
            authenticated: false,
            authenticated_addrs: HashSet::new(),
            vfs,
        })
    }

    /// Reapplies VLAN and link state on every VF. Always issues the
    /// kernel calls, even when no change is believed needed.
    pub async fn reconcile_all_vfs(&self, lm: &dyn LinkManager) -> Result<()> {
        for vf in self.vfs.values() {
            self.reconcile_vf(*vf, lm).await?;
        }
        Ok(())
    }

    pub async fn reconcile_vf(&self, vf: VfInfo, lm: &dyn LinkManager) -> Result<()> {
        let (vlan, state) = if self.authenticated {
            (vf.vlan, VfLinkState::Auto)
        } else {
            (RESERVED_VLAN, VfLinkState::Disable)
        };
        lm.set_vf_vlan(&self.name, vf.index, vlan).await?;
        lm.set_vf_link_state(&self.name, vf.index, state).await
    }

    /// Re-reads the PF link and, for each VF whose reported VLAN
    /// differs from the tracked value, updates the tracked VLAN and
    /// reapplies enforcement. A reported VLAN equal to the reserved
    /// sentinel is the echo of our own enforcement and never updates
    /// tracking.
    pub async fn handle_vlan_change(&mut self, lm: &dyn LinkManager) -> Result<()> {
        let link = lm.link_by_name(&self.name).await?;
        for reported in link.vfs {
            if reported.vlan == RESERVED_VLAN {
                continue;
            }
            let changed = match self.vfs.get_mut(&reported.id) {
                Some(vf) if vf.vlan != reported.vlan => {
                    vf.vlan = reported.vlan;
                    Some(*vf)
                }
                _ => None,
            };
            if let Some(vf) = changed {
                info!(
                    interface = %self.name,
                    vf = vf.index,
                    vlan = vf.vlan,
                    "vf vlan changed"
                );
                self.reconcile_vf(vf, lm).await?;
            }
        }
        Ok(())
    }
}

/// Whether the interface is an SR-IOV physical function.
pub fn is_sriov_pf(if_name: &str) -> bool {
    sriov_numvfs_path(Path::new(SYS_CLASS_NET), if_name).exists()
}

/// Names of the VF netdevs currently bound on a PF. VFs bound to a
/// userspace driver or moved into another network namespace have no
/// netdev and are skipped.
pub fn sriov_vf_names(if_name: &str) -> Result<Vec<String>> {
    vf_names_in(Path::new(SYS_CLASS_NET), if_name)
}

/// The interface itself plus, for an SR-IOV PF, every bound VF netdev.
/// This is the set of links that need traffic-control policy.
pub fn associated_interfaces(if_name: &str) -> Result<Vec<String>> {
    let mut interfaces = vec![if_name.to_string()];
    if is_sriov_pf(if_name) {
        interfaces.extend(sriov_vf_names(if_name)?);
    }
    Ok(interfaces)
}

fn sriov_numvfs_path(sys: &Path, if_name: &str) -> PathBuf {
    sys.join(if_name).join("device").join("sriov_numvfs")
}

fn vf_names_in(sys: &Path, if_name: &str) -> Result<Vec<String>> {
    let device_dir = sys.join(if_name).join("device");
    let mut names = Vec::new();
    let entries = std::fs::read_dir(&device_dir)
        .with_context(|| format!("failed to read {}", device_dir.display()))?;
    let mut virtfns = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("virtfn") {
            virtfns.push(entry.path());
        }
    }
    virtfns.sort();
    for virtfn in virtfns {
        let net_dir = virtfn.join("net");
        if !net_dir.is_dir() {
            continue;
        }
        let mut net = std::fs::read_dir(&net_dir)
            .with_context(|| format!("failed to read {}", net_dir.display()))?;
        if let Some(entry) = net.next() {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::netlink::VfLinkState;
    use crate::test_support::{FakeLinkManager, LinkCall};

    const PF: &str = "enp175s0f1";

    #[tokio::test]
    async fn discover_enumerates_vfs_unauthenticated() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 100), (1, 200)]);
        let pf = PfInfo::discover(PF, &lm).await.unwrap();
        assert!(!pf.authenticated);
        assert!(pf.authenticated_addrs.is_empty());
        assert_eq!(pf.vfs[&0], VfInfo { index: 0, vlan: 100 });
        assert_eq!(pf.vfs[&1], VfInfo { index: 1, vlan: 200 });
    }

    #[tokio::test]
    async fn unauthenticated_pf_forces_reserved_vlan_and_disabled_state() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 100)]);
        let pf = PfInfo::discover(PF, &lm).await.unwrap();
        pf.reconcile_all_vfs(&lm).await.unwrap();
        assert_eq!(
            lm.calls(),
            vec![
                LinkCall::SetVfVlan {
                    pf: PF.to_string(),
                    vf: 0,
                    vlan: RESERVED_VLAN,
                },
                LinkCall::SetVfLinkState {
                    pf: PF.to_string(),
                    vf: 0,
                    state: VfLinkState::Disable,
                },
            ]
        );
    }

    #[tokio::test]
    async fn authenticated_pf_restores_tracked_vlan() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 100)]);
        let mut pf = PfInfo::discover(PF, &lm).await.unwrap();
        pf.authenticated = true;
        pf.reconcile_all_vfs(&lm).await.unwrap();
        assert_eq!(
            lm.calls(),
            vec![
                LinkCall::SetVfVlan {
                    pf: PF.to_string(),
                    vf: 0,
                    vlan: 100,
                },
                LinkCall::SetVfLinkState {
                    pf: PF.to_string(),
                    vf: 0,
                    state: VfLinkState::Auto,
                },
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_is_not_suppressed_on_repeat() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 100)]);
        let pf = PfInfo::discover(PF, &lm).await.unwrap();
        pf.reconcile_all_vfs(&lm).await.unwrap();
        pf.reconcile_all_vfs(&lm).await.unwrap();
        assert_eq!(lm.calls().len(), 4);
    }

    #[tokio::test]
    async fn vlan_change_updates_tracking_and_reenforces() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 200)]);
        let mut pf = PfInfo::discover(PF, &lm).await.unwrap();
        lm.set_reported_vlan(PF, 0, 100);
        pf.handle_vlan_change(&lm).await.unwrap();
        assert_eq!(pf.vfs[&0].vlan, 100);
        // Unauthenticated PF: enforcement still pins the reserved vlan.
        assert_eq!(
            lm.calls(),
            vec![
                LinkCall::SetVfVlan {
                    pf: PF.to_string(),
                    vf: 0,
                    vlan: RESERVED_VLAN,
                },
                LinkCall::SetVfLinkState {
                    pf: PF.to_string(),
                    vf: 0,
                    state: VfLinkState::Disable,
                },
            ]
        );
    }

    #[tokio::test]
    async fn vlan_change_on_authenticated_pf_programs_new_vlan() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 200)]);
        let mut pf = PfInfo::discover(PF, &lm).await.unwrap();
        pf.authenticated = true;
        lm.set_reported_vlan(PF, 0, 300);
        pf.handle_vlan_change(&lm).await.unwrap();
        assert_eq!(pf.vfs[&0].vlan, 300);
        assert_eq!(
            lm.calls(),
            vec![
                LinkCall::SetVfVlan {
                    pf: PF.to_string(),
                    vf: 0,
                    vlan: 300,
                },
                LinkCall::SetVfLinkState {
                    pf: PF.to_string(),
                    vf: 0,
                    state: VfLinkState::Auto,
                },
            ]
        );
    }

    #[tokio::test]
    async fn reserved_vlan_report_is_ignored() {
        let lm = FakeLinkManager::with_link(PF, &[(0, 100)]);
        let mut pf = PfInfo::discover(PF, &lm).await.unwrap();
        lm.set_reported_vlan(PF, 0, RESERVED_VLAN);
        pf.handle_vlan_change(&lm).await.unwrap();
        assert_eq!(pf.vfs[&0].vlan, 100);
        assert!(lm.calls().is_empty());
    }

    #[test]
    fn vf_names_skips_unbound_vfs() {
        let tmp = tempfile::tempdir().unwrap();
        let device = tmp.path().join(PF).join("device");
        std::fs::create_dir_all(device.join("virtfn0").join("net").join("enp175s0f1v0"))
            .unwrap();
        // virtfn1 is bound to a userspace driver: no net directory.
        std::fs::create_dir_all(device.join("virtfn1")).unwrap();
        std::fs::create_dir_all(device.join("virtfn2").join("net").join("enp175s0f1v2"))
            .unwrap();
        let names = vf_names_in(tmp.path(), PF).unwrap();
        assert_eq!(names, vec!["enp175s0f1v0", "enp175s0f1v2"]);
    }
}
