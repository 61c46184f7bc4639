//! Kernel link-update subscription and per-interface fan-out.
//!
//! One dispatcher owns the rtnetlink multicast subscription for the
//! whole process; monitors subscribe by interface name and receive
//! only the updates for their own link.

use crate::netlink::LinkOperState;
use anyhow::{Context, Result};
use futures::StreamExt;
use rtnetlink::{
    constants::RTMGRP_LINK,
    packet_core::{NetlinkMessage, NetlinkPayload},
    packet_route::{
        link::{LinkAttribute, State},
        RouteNetlinkMessage,
    },
    sys::{AsyncSocket, SocketAddr},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

const SUBSCRIPTION_CAPACITY: usize = 16;

/// A change observed on one kernel link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkUpdate {
    pub if_name: String,
    pub oper_state: LinkOperState,
}

/// Subscription registry shared between the dispatcher and monitors.
#[derive(Clone, Debug, Default)]
pub struct LinkEvents(Arc<parking_lot::Mutex<HashMap<String, mpsc::Sender<LinkUpdate>>>>);

impl LinkEvents {
    /// Registers interest in one or more interfaces on a single
    /// channel, replacing any prior subscription for the same names.
    pub fn subscribe(&self, if_names: &[&str]) -> mpsc::Receiver<LinkUpdate> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut subscriptions = self.0.lock();
        for if_name in if_names {
            subscriptions.insert((*if_name).to_string(), tx.clone());
        }
        rx
    }

    /// Updates for this interface are silently dropped from now on.
    pub fn unsubscribe(&self, if_name: &str) {
        self.0.lock().remove(if_name);
    }

    pub(crate) async fn dispatch(&self, update: LinkUpdate) {
        // Clone the sender out of the registry so the lock is not held
        // across the send.
        let tx = self.0.lock().get(&update.if_name).cloned();
        if let Some(tx) = tx {
            if tx.send(update).await.is_err() {
                debug!("link update receiver dropped");
            }
        }
    }
}

/// Owns the rtnetlink connection and the dispatch loop.
pub struct LinkEventDispatcher {
    events: LinkEvents,
    shutdown: drain::Signal,
    task: tokio::task::JoinHandle<()>,
}

impl LinkEventDispatcher {
    /// Opens the kernel link-multicast subscription and spawns the
    /// dispatch loop.
    pub fn start() -> Result<Self> {
        let (mut connection, _handle, messages) =
            rtnetlink::new_connection().context("failed to open rtnetlink connection")?;
        connection
            .socket_mut()
            .socket_mut()
            .bind(&SocketAddr::new(0, RTMGRP_LINK))
            .context("failed to bind rtnetlink link multicast group")?;
        let connection = tokio::spawn(connection);

        let events = LinkEvents::default();
        let (shutdown, watch) = drain::channel();
        let task = tokio::spawn(dispatch(events.clone(), messages, connection, watch));
        Ok(Self {
            events,
            shutdown,
            task,
        })
    }

    pub fn events(&self) -> LinkEvents {
        self.events.clone()
    }

    /// Signals the dispatch loop, closes the kernel subscription and
    /// waits for the loop to exit.
    pub async fn stop(self) {
        self.shutdown.drain().await;
        let _ = self.task.await;
    }
}

async fn dispatch(
    events: LinkEvents,
    mut messages: futures::channel::mpsc::UnboundedReceiver<(
        NetlinkMessage<RouteNetlinkMessage>,
        SocketAddr,
    )>,
    connection: tokio::task::JoinHandle<()>,
    watch: drain::Watch,
) {
    let mut signaled = std::pin::pin!(watch.signaled());
    loop {
        tokio::select! {
            release = &mut signaled => {
                connection.abort();
                // Discard whatever the connection already buffered so
                // nothing blocks on a full channel during teardown.
                while let Ok(Some(_)) = messages.try_next() {}
                drop(release);
                info!("link event dispatcher stopped");
                return;
            }
            message = messages.next() => match message {
                Some((message, _)) => {
                    if let Some(update) = link_update(message) {
                        debug!(interface = %update.if_name, state = ?update.oper_state, "link update");
                        events.dispatch(update).await;
                    }
                }
                None => {
                    info!("rtnetlink connection closed");
                    return;
                }
            },
        }
    }
}

fn link_update(message: NetlinkMessage<RouteNetlinkMessage>) -> Option<LinkUpdate> {
    let NetlinkPayload::InnerMessage(message) = message.payload else {
        return None;
    };
    let link = match message {
        RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => link,
        _ => return None,
    };
    let mut if_name = None;
    let mut oper_state = LinkOperState::Unknown;
    for attr in link.attributes {
        match attr {
            LinkAttribute::IfName(name) => if_name = Some(name),
            LinkAttribute::OperState(state) => {
                oper_state = match state {
                    State::Up => LinkOperState::Up,
                    State::Down => LinkOperState::Down,
                    _ => LinkOperState::Unknown,
                };
            }
            _ => {}
        }
    }
    if_name.map(|if_name| LinkUpdate {
        if_name,
        oper_state,
    })
}
