//! Per-interface monitor attached to the authentication daemon's
//! control socket.
//!
//! The monitor owns a datagram connection to the daemon, the PF state
//! for its interface, and four concurrent activities: reading daemon
//! events, sending keepalives, consuming kernel link updates, and
//! aging out pending deauthentications.

use crate::link::{LinkEvents, LinkUpdate};
use crate::metrics::Metrics;
use crate::netlink::{LinkManager, LinkOperState};
use crate::sriov::PfInfo;
use crate::status::StatusPublisher;
use crate::tc;
use anyhow::{Context, Result};
use eapol_authenticator_k8s_api::{IfState, Interface};
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Duration, Instant};
use tracing::{error, info, warn};

const STA_CONNECTED_EVENT: &str = "AP-STA-CONNECTED";
const EAP_SUCCESS_EVENT: &str = "CTRL-EVENT-EAP-SUCCESS";
const STA_DISCONNECTED_EVENT: &str = "AP-STA-DISCONNECTED";
const EAP_FAILURE_EVENT: &str = "CTRL-EVENT-EAP-FAILURE";

const PING_COMMAND: &str = "PING";
const ATTACH_COMMAND: &str = "ATTACH";
const STATUS_COMMAND: &str = "STATUS";
const DEAUTHENTICATE_COMMAND: &str = "DEAUTHENTICATE";

const STATUS_REPLY: &str = "state=";
const SOLICITED_REPLIES: &[&str] = &["PONG\n", "OK\n", STATUS_REPLY];

const SOCK_READ_BUF_SIZE: usize = 4096;
const IO_DEADLINE: Duration = Duration::from_secs(1);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const DEAUTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a monitor needs to run on one interface.
pub struct MonitorConfig {
    pub if_name: String,
    /// Directory holding the daemon's per-interface control sockets.
    pub socket_dir: PathBuf,
    pub link_manager: Arc<dyn LinkManager>,
    pub metrics: Metrics,
    /// Optional so that node-local operation keeps working when the
    /// cluster apiserver is unreachable.
    pub status: Option<StatusPublisher>,
}

/// Address-keyed authentication state, guarded by one async mutex per
/// monitor.
pub(crate) struct AddrState {
    pub(crate) pf: PfInfo,
    pub(crate) deauth_requests: HashMap<String, Instant>,
    pub(crate) if_eap_state: IfState,
    pub(crate) oper_state: LinkOperState,
}

struct Inner {
    if_name: String,
    sock: UnixDatagram,
    link_manager: Arc<dyn LinkManager>,
    metrics: Metrics,
    status: Option<StatusPublisher>,
    state: Arc<Mutex<AddrState>>,
}

/// A running monitor. Dropping it without calling [`stop`] leaks the
/// background tasks until the runtime shuts down.
///
/// [`stop`]: InterfaceMonitor::stop
pub struct InterfaceMonitor {
    inner: Arc<Inner>,
    events: LinkEvents,
    shutdown: drain::Signal,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    local_path: PathBuf,
}

impl InterfaceMonitor {
    /// Connects to the daemon socket, discovers the PF and forces its
    /// VFs into the unauthenticated state, subscribes to link events
    /// and spawns the monitor activities. The monitor is torn back
    /// down if the daemon does not accept the event subscription.
    pub async fn start(config: MonitorConfig, events: LinkEvents) -> Result<Self> {
        let MonitorConfig {
            if_name,
            socket_dir,
            link_manager,
            metrics,
            status,
        } = config;

        let local_path = socket_dir.join(format!(".{}_monitor_{}", if_name, std::process::id()));
        let _ = std::fs::remove_file(&local_path);
        let sock = UnixDatagram::bind(&local_path)
            .with_context(|| format!("failed to bind {}", local_path.display()))?;
        sock.connect(socket_dir.join(&if_name))
            .with_context(|| format!("failed to connect to control socket for {if_name}"))?;

        let pf = PfInfo::discover(&if_name, &*link_manager).await?;
        pf.reconcile_all_vfs(&*link_manager).await?;

        let link_rx = events.subscribe(&[&if_name]);
        let (shutdown, watch) = drain::channel();
        let inner = Arc::new(Inner {
            if_name,
            sock,
            link_manager,
            metrics,
            status,
            state: Arc::new(Mutex::new(AddrState {
                pf,
                deauth_requests: HashMap::new(),
                if_eap_state: IfState::Unknown,
                oper_state: LinkOperState::Unknown,
            })),
        });

        let tasks = vec![
            tokio::spawn(inner.clone().run_reply_reader(watch.clone())),
            tokio::spawn(inner.clone().run_keepalive(watch.clone())),
            tokio::spawn(inner.clone().run_link_events(link_rx, watch.clone())),
            tokio::spawn(inner.clone().run_deauth_sweeper(watch)),
        ];

        let monitor = Self {
            inner,
            events,
            shutdown,
            tasks,
            local_path,
        };

        if let Err(error) = monitor.inner.attach().await {
            monitor.stop().await;
            return Err(error);
        }
        // The daemon can drop the connection between the attach and
        // the status request; the reply reader and keepalive notice a
        // dead socket on their own, so this send is not fatal.
        if let Err(error) = monitor.inner.write_command(STATUS_COMMAND).await {
            warn!(interface = %monitor.inner.if_name, %error, "failed to request daemon status");
        }
        monitor.inner.publish_status_logged().await;
        info!(interface = %monitor.inner.if_name, "interface monitor started");
        Ok(monitor)
    }

    /// Stops all monitor activities and leaves the VFs permissive: a
    /// PF still in the unauthenticated-enforcement state is restored
    /// before teardown so stopping the monitor does not lock out its
    /// VFs.
    pub async fn stop(self) {
        {
            let mut state = self.inner.state.lock().await;
            if !state.pf.authenticated {
                state.pf.authenticated = true;
                if let Err(error) = state.pf.reconcile_all_vfs(&*self.inner.link_manager).await {
                    error!(
                        interface = %self.inner.if_name,
                        %error,
                        "failed to restore vf state on shutdown"
                    );
                }
            }
        }
        self.shutdown.drain().await;
        self.events.unsubscribe(&self.inner.if_name);
        for task in self.tasks {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&self.local_path);
        info!(interface = %self.inner.if_name, "interface monitor stopped");
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<Mutex<AddrState>> {
        self.inner.state.clone()
    }

    #[cfg(test)]
    pub(crate) async fn handle_event(&self, event: &str) -> Result<()> {
        self.inner.handle_event(event).await
    }
}

impl Inner {
    /// Subscribes to unsolicited daemon events. A send that cannot
    /// complete within the deadline is retried; the daemon may still
    /// be draining its socket right after startup.
    async fn attach(&self) -> Result<()> {
        loop {
            match time::timeout(IO_DEADLINE, self.sock.send(ATTACH_COMMAND.as_bytes())).await {
                Err(_) => continue,
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(error)) => {
                    return Err(error).with_context(|| {
                        format!("failed to send attach command for {}", self.if_name)
                    });
                }
            }
        }
    }

    async fn write_command(&self, command: &str) -> Result<()> {
        self.sock
            .send(command.as_bytes())
            .await
            .with_context(|| format!("failed to send {command} command for {}", self.if_name))?;
        Ok(())
    }

    async fn deauthenticate(&self, addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Ok(());
        }
        self.write_command(&format!("{DEAUTHENTICATE_COMMAND} {addr}"))
            .await
    }

    /// Reads one datagram at a time with a short deadline so the stop
    /// signal is observed promptly.
    async fn run_reply_reader(self: Arc<Self>, watch: drain::Watch) {
        let mut buf = vec![0u8; SOCK_READ_BUF_SIZE];
        let mut signaled = pin!(watch.signaled());
        loop {
            tokio::select! {
                _ = &mut signaled => return,
                read = time::timeout(IO_DEADLINE, self.sock.recv(&mut buf)) => match read {
                    Err(_) => {}
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => {
                        let event = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if let Err(error) = self.handle_event(&event).await {
                            error!(
                                interface = %self.if_name,
                                event = %event.trim_end(),
                                %error,
                                "failed to handle daemon event"
                            );
                        }
                    }
                    Ok(Err(error)) => {
                        error!(interface = %self.if_name, %error, "control socket read failed");
                        return;
                    }
                },
            }
        }
    }

    async fn run_keepalive(self: Arc<Self>, watch: drain::Watch) {
        let mut signaled = pin!(watch.signaled());
        loop {
            tokio::select! {
                _ = &mut signaled => return,
                _ = time::sleep(KEEPALIVE_INTERVAL) => {
                    match time::timeout(IO_DEADLINE, self.sock.send(PING_COMMAND.as_bytes())).await {
                        Err(_) => {}
                        Ok(Ok(_)) => {}
                        Ok(Err(error)) => {
                            error!(interface = %self.if_name, %error, "keepalive write failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn run_link_events(
        self: Arc<Self>,
        mut link_rx: mpsc::Receiver<LinkUpdate>,
        watch: drain::Watch,
    ) {
        let mut signaled = pin!(watch.signaled());
        loop {
            tokio::select! {
                _ = &mut signaled => return,
                update = link_rx.recv() => match update {
                    Some(update) => self.handle_link_update(update).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_link_update(&self, update: LinkUpdate) {
        let changed = {
            let state = self.state.lock().await;
            state.oper_state != update.oper_state
        };
        if changed {
            self.handle_op_state_change(update.oper_state).await;
        }
        // A VLAN change surfaces as a link update without an
        // operational-state transition, so this runs on every event.
        let mut state = self.state.lock().await;
        if let Err(error) = state.pf.handle_vlan_change(&*self.link_manager).await {
            error!(interface = %self.if_name, %error, "failed to handle vlan change");
        }
    }

    /// Link-down requests deauthentication of every authenticated
    /// client and records each in the ledger; link-up clears pending
    /// requests for addresses that are still authenticated.
    async fn handle_op_state_change(&self, oper_state: LinkOperState) {
        info!(interface = %self.if_name, state = ?oper_state, "operational state changed");
        {
            let mut state = self.state.lock().await;
            state.oper_state = oper_state;
            match oper_state {
                LinkOperState::Down => {
                    let addrs: Vec<String> = state.pf.authenticated_addrs.iter().cloned().collect();
                    for addr in addrs {
                        if let Err(error) = self.deauthenticate(&addr).await {
                            error!(
                                interface = %self.if_name,
                                addr = %addr,
                                %error,
                                "failed to request deauthentication"
                            );
                        }
                        state.deauth_requests.insert(addr, Instant::now());
                    }
                }
                LinkOperState::Up => {
                    let authenticated = state.pf.authenticated_addrs.clone();
                    state
                        .deauth_requests
                        .retain(|addr, _| !authenticated.contains(addr));
                }
                LinkOperState::Unknown => {}
            }
        }
        if let Err(error) = self.write_command(STATUS_COMMAND).await {
            error!(interface = %self.if_name, %error, "failed to request daemon status");
        }
    }

    /// Once per second, forcibly denies every ledger entry older than
    /// the deauthentication timeout. The whole ledger is scanned each
    /// pass.
    async fn run_deauth_sweeper(self: Arc<Self>, watch: drain::Watch) {
        let mut signaled = pin!(watch.signaled());
        loop {
            tokio::select! {
                _ = &mut signaled => return,
                _ = time::sleep(SWEEP_INTERVAL) => {
                    let now = Instant::now();
                    let mut state = self.state.lock().await;
                    let expired: Vec<String> = state
                        .deauth_requests
                        .iter()
                        .filter(|(_, requested)| now.duration_since(**requested) >= DEAUTH_TIMEOUT)
                        .map(|(addr, _)| addr.clone())
                        .collect();
                    for addr in expired {
                        state.pf.authenticated_addrs.remove(&addr);
                        state.deauth_requests.remove(&addr);
                        let AddrState { pf, .. } = &mut *state;
                        if let Err(error) =
                            tc::deny_traffic_from_mac(pf, &addr, &*self.link_manager).await
                        {
                            error!(
                                interface = %self.if_name,
                                addr = %addr,
                                %error,
                                "failed to apply deny traffic"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: &str) -> Result<()> {
        let mut tokens = event.split(' ');
        let first = tokens.next().unwrap_or_default();
        let Some(arg) = tokens.next() else {
            if is_solicited_reply(event) {
                if event.contains(STATUS_REPLY) {
                    self.state.lock().await.if_eap_state = parse_if_state(event);
                    self.publish_status_logged().await;
                }
                return Ok(());
            }
            info!(interface = %self.if_name, event = %event.trim_end(), "unhandled event");
            return Ok(());
        };
        let addr = arg.trim_end();

        let result = match event_key(first) {
            STA_CONNECTED_EVENT => self.handle_authenticate(addr).await,
            EAP_SUCCESS_EVENT => {
                info!(interface = %self.if_name, addr = %addr, "authenticated supplicant");
                self.metrics.authenticated(&self.if_name);
                Ok(())
            }
            STA_DISCONNECTED_EVENT => {
                info!(interface = %self.if_name, addr = %addr, "deauthenticated supplicant");
                self.metrics.deauthenticated(&self.if_name);
                self.handle_deauthenticate(addr).await
            }
            EAP_FAILURE_EVENT => {
                warn!(interface = %self.if_name, addr = %addr, "authentication failure");
                self.metrics.auth_failed(&self.if_name);
                Ok(())
            }
            _ => {
                info!(interface = %self.if_name, event = %event.trim_end(), "unhandled event");
                Ok(())
            }
        };
        self.publish_status_logged().await;
        result
    }

    /// An associated client is allowed through immediately; EAP
    /// success only adds a metric on top.
    async fn handle_authenticate(&self, addr: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pf.authenticated_addrs.insert(addr.to_string());
        state.deauth_requests.remove(addr);
        let AddrState { pf, .. } = &mut *state;
        tc::allow_traffic_from_mac(pf, addr, &*self.link_manager).await
    }

    async fn handle_deauthenticate(&self, addr: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pf.authenticated_addrs.remove(addr);
        state.deauth_requests.remove(addr);
        let AddrState { pf, .. } = &mut *state;
        tc::deny_traffic_from_mac(pf, addr, &*self.link_manager).await
    }

    async fn publish_status(&self) -> Result<()> {
        let Some(status) = &self.status else {
            return Ok(());
        };
        // Snapshot under the lock, publish outside it.
        let interface = {
            let state = self.state.lock().await;
            let mut clients: Vec<String> = state.pf.authenticated_addrs.iter().cloned().collect();
            clients.sort();
            Interface {
                name: self.if_name.clone(),
                state: state.if_eap_state,
                authenticated_clients: clients,
            }
        };
        status.publish(interface).await
    }

    async fn publish_status_logged(&self) {
        if let Err(error) = self.publish_status().await {
            info!(interface = %self.if_name, %error, "failed to update interface status");
        }
    }
}

fn is_solicited_reply(event: &str) -> bool {
    SOLICITED_REPLIES.iter().any(|reply| event.contains(reply))
}

/// Daemon events carry a `<priority>` prefix on the first token.
fn event_key(token: &str) -> &str {
    token.rsplit_once('>').map_or(token, |(_, key)| key)
}

/// Extracts the interface state from a `STATUS` reply block.
fn parse_if_state(reply: &str) -> IfState {
    for line in reply.lines() {
        if let Some(value) = line.strip_prefix(STATUS_REPLY) {
            return IfState::parse(value.trim());
        }
    }
    IfState::Unknown
}
