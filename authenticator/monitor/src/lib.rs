//! Per-node 802.1X enforcement: one interface monitor per physical
//! function, attached to the authentication daemon's control socket and
//! to the kernel's link-update stream, driving traffic-control filters
//! and SR-IOV VF VLAN/link-state programming.

pub mod hostapd;
pub mod link;
pub mod metrics;
pub mod netlink;
pub mod sriov;
pub mod status;
pub mod tc;


#[cfg(test)]
pub(crate) mod test_support;

pub use self::hostapd::{InterfaceMonitor, MonitorConfig};
pub use self::link::{LinkEventDispatcher, LinkEvents, LinkUpdate};
pub use self::metrics::Metrics;
pub use self::netlink::{IpLinkManager, LinkManager, LinkOperState};
pub use self::status::StatusPublisher;
