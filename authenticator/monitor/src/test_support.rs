use crate::netlink::{LinkInfo, LinkManager, LinkOperState, VfAttrs, VfLinkState};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Recorded VF programming call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LinkCall {
    SetVfVlan { pf: String, vf: u32, vlan: u16 },
    SetVfLinkState { pf: String, vf: u32, state: VfLinkState },
}

/// In-memory `LinkManager` recording every VF programming call.
#[derive(Debug, Default)]
pub(crate) struct FakeLinkManager {
    links: Mutex<HashMap<String, LinkInfo>>,
    calls: Mutex<Vec<LinkCall>>,
}

impl FakeLinkManager {
    pub(crate) fn with_link(name: &str, vfs: &[(u32, u16)]) -> Self {
        let lm = Self::default();
        lm.links.lock().insert(
            name.to_string(),
            LinkInfo {
                index: 7,
                name: name.to_string(),
                oper_state: LinkOperState::Up,
                vfs: vfs
                    .iter()
                    .map(|&(id, vlan)| VfAttrs { id, vlan })
                    .collect(),
            },
        );
        lm
    }

    /// Changes the VLAN the fake kernel reports for one VF.
    pub(crate) fn set_reported_vlan(&self, name: &str, vf: u32, vlan: u16) {
        let mut links = self.links.lock();
        let link = links.get_mut(name).expect("unknown link");
        let attrs = link
            .vfs
            .iter_mut()
            .find(|attrs| attrs.id == vf)
            .expect("unknown vf");
        attrs.vlan = vlan;
    }

    pub(crate) fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LinkManager for FakeLinkManager {
    async fn link_by_name(&self, name: &str) -> Result<LinkInfo> {
        match self.links.lock().get(name) {
            Some(link) => Ok(link.clone()),
            None => bail!("link {name} not found"),
        }
    }

    async fn set_vf_vlan(&self, pf: &str, vf: u32, vlan: u16) -> Result<()> {
        self.calls.lock().push(LinkCall::SetVfVlan {
            pf: pf.to_string(),
            vf,
            vlan,
        });
        Ok(())
    }

    async fn set_vf_link_state(&self, pf: &str, vf: u32, state: VfLinkState) -> Result<()> {
        self.calls.lock().push(LinkCall::SetVfLinkState {
            pf: pf.to_string(),
            vf,
            state,
        });
        Ok(())
    }
}
