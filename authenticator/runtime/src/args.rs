use crate::monitor::{
    sriov, tc, InterfaceMonitor, IpLinkManager, LinkManager, Metrics, MonitorConfig,
    StatusPublisher,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "authenticator", about = "An 802.1X port authentication monitor")]
pub struct Args {
    #[clap(long, default_value = "eapol=info,warn", env = "EAPOL_AUTHENTICATOR_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Interfaces on which the authentication daemon listens.
    #[clap(long, env = "IFACES")]
    interfaces: Names,

    /// TCP destination ports exempted from the default-drop policy.
    #[clap(long, env = "UNPROTECTED_TCP_PORTS")]
    unprotected_tcp_ports: Option<Ports>,

    /// UDP destination ports exempted from the default-drop policy.
    #[clap(long, env = "UNPROTECTED_UDP_PORTS")]
    unprotected_udp_ports: Option<Ports>,

    /// Namespace of the Authenticator resource receiving status
    /// updates.
    #[clap(long, env = "AUTHENTICATOR_NAMESPACE")]
    authenticator_namespace: Option<String>,

    /// Name of the Authenticator resource receiving status updates.
    #[clap(long, env = "AUTHENTICATOR_NAME")]
    authenticator_name: Option<String>,

    /// Directory holding the daemon's per-interface control sockets.
    #[clap(long, default_value = "/var/run/hostapd")]
    socket_dir: PathBuf,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            interfaces: Names(interfaces),
            unprotected_tcp_ports,
            unprotected_udp_ports,
            authenticator_namespace,
            authenticator_name,
            socket_dir,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("authenticator_hostapd"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Enforcement is impossible without the tc binary.
        tc::ensure_tc()?;

        let ports = tc::UnprotectedPorts {
            tcp: unprotected_tcp_ports.unwrap_or_default().0,
            udp: unprotected_udp_ports.unwrap_or_default().0,
        };
        init_interfaces(&interfaces, &ports).await?;

        let status = match (authenticator_namespace, authenticator_name) {
            (Some(namespace), Some(name)) => {
                Some(StatusPublisher::new(runtime.client(), &namespace, &name))
            }
            _ => {
                warn!("authenticator resource not configured, status publishing disabled");
                None
            }
        };

        let dispatcher = crate::monitor::LinkEventDispatcher::start()?;
        let link_manager: Arc<dyn LinkManager> = Arc::new(IpLinkManager::new());

        let mut monitors = Vec::new();
        for if_name in &interfaces {
            info!(interface = %if_name, "starting interface monitor");
            let config = MonitorConfig {
                if_name: if_name.clone(),
                socket_dir: socket_dir.clone(),
                link_manager: link_manager.clone(),
                metrics: metrics.clone(),
                status: status.clone(),
            };
            match InterfaceMonitor::start(config, dispatcher.events()).await {
                Ok(monitor) => monitors.push(monitor),
                // One misbehaving interface must not take down the
                // others.
                Err(error) => {
                    error!(interface = %if_name, %error, "failed to start interface monitor");
                }
            }
        }

        // Hold the shutdown release until monitors are stopped, the
        // dispatcher has exited and the filters are removed.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                let release = shutdown.signaled().await;
                info!("starting shutdown");
                for monitor in monitors {
                    monitor.stop().await;
                }
                dispatcher.stop().await;
                if let Err(error) = reset_interfaces(&interfaces).await {
                    error!(%error, "failed to reset interfaces");
                }
                info!("shutdown complete");
                drop(release);
            }
            .instrument(info_span!("shutdown")),
        );

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Installs the baseline filters on every configured interface and its
/// bound VF netdevs.
async fn init_interfaces(interfaces: &[String], ports: &tc::UnprotectedPorts) -> Result<()> {
    for if_name in interfaces {
        for link in sriov::associated_interfaces(if_name)? {
            tc::init_interface_for_eap_traffic(&link, ports).await?;
        }
    }
    Ok(())
}

async fn reset_interfaces(interfaces: &[String]) -> Result<()> {
    for if_name in interfaces {
        for link in sriov::associated_interfaces(if_name)? {
            tc::reset_interface(&link).await?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct Names(Vec<String>);

impl std::str::FromStr for Names {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let names = s
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Into::into)
            .collect::<Vec<String>>();
        if names.is_empty() {
            bail!("at least one interface must be configured");
        }
        Ok(Self(names))
    }
}

#[derive(Clone, Debug, Default)]
struct Ports(Vec<u16>);

impl std::str::FromStr for Ports {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|port| !port.is_empty())
            .map(|port| port.parse().map_err(Into::into))
            .collect::<Result<Vec<u16>>>()
            .map(Self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_interface_names() {
        let Names(names) = "enp175s0f0, enp175s0f1".parse().unwrap();
        assert_eq!(names, vec!["enp175s0f0", "enp175s0f1"]);
        assert!("".parse::<Names>().is_err());
    }

    #[test]
    fn parses_port_lists() {
        let Ports(ports) = "22,6443".parse().unwrap();
        assert_eq!(ports, vec![22, 6443]);
        let Ports(ports) = "".parse().unwrap();
        assert!(ports.is_empty());
        assert!("22,not-a-port".parse::<Ports>().is_err());
    }
}
