//! Publishes observed per-interface state to the Authenticator
//! resource's status subresource.

use anyhow::{Context, Result};
use eapol_authenticator_k8s_api::{Authenticator, AuthenticatorStatus, Interface};
use kube::api::{Api, PostParams};
use tokio::time;
use tracing::debug;

const MAX_CONFLICT_RETRIES: usize = 5;
const INITIAL_BACKOFF: time::Duration = time::Duration::from_millis(10);

/// Writes interface state onto one named Authenticator resource.
#[derive(Clone)]
pub struct StatusPublisher {
    api: Api<Authenticator>,
    name: String,
}

impl StatusPublisher {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    /// Upserts one interface entry in the resource status. The
    /// read-modify-write is retried a bounded number of times when the
    /// apiserver rejects it with an optimistic-concurrency conflict;
    /// any other error is returned immediately.
    pub async fn publish(&self, interface: Interface) -> Result<()> {
        for attempt in 0.. {
            let mut authenticator = self
                .api
                .get(&self.name)
                .await
                .with_context(|| format!("failed to get authenticator {}", self.name))?;
            let status = authenticator.status.get_or_insert_with(AuthenticatorStatus::default);
            upsert_interface(status, interface.clone());

            let body = serde_json::to_vec(&authenticator)?;
            match self
                .api
                .replace_status(&self.name, &PostParams::default(), body)
                .await
            {
                Ok(_) => return Ok(()),
                Err(error) if retry_on_conflict(&error, attempt) => {
                    debug!(name = %self.name, attempt, "status update conflict");
                    time::sleep(conflict_backoff(attempt)).await;
                }
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!("failed to update authenticator {} status", self.name)
                    });
                }
            }
        }
        unreachable!()
    }
}

fn retry_on_conflict(error: &kube::Error, attempt: usize) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
        && attempt < MAX_CONFLICT_RETRIES
}

fn conflict_backoff(attempt: usize) -> time::Duration {
    INITIAL_BACKOFF * 2u32.pow(attempt as u32)
}

fn upsert_interface(status: &mut AuthenticatorStatus, interface: Interface) {
    match status
        .interfaces
        .iter_mut()
        .find(|existing| existing.name == interface.name)
    {
        Some(existing) => *existing = interface,
        None => status.interfaces.push(interface),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use eapol_authenticator_k8s_api::IfState;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "operation cannot be fulfilled".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    fn entry(name: &str, state: IfState, clients: &[&str]) -> Interface {
        Interface {
            name: name.to_string(),
            state,
            authenticated_clients: clients.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn upsert_replaces_matching_entry_and_appends_new() {
        let mut status = AuthenticatorStatus {
            interfaces: vec![entry("enp175s0f0", IfState::Enabled, &[])],
        };

        upsert_interface(
            &mut status,
            entry("enp175s0f0", IfState::Disabled, &["6e:16:06:0e:b7:e9"]),
        );
        upsert_interface(&mut status, entry("enp175s0f1", IfState::Enabled, &[]));

        assert_eq!(status.interfaces.len(), 2);
        assert_eq!(status.interfaces[0].state, IfState::Disabled);
        assert_eq!(
            status.interfaces[0].authenticated_clients,
            vec!["6e:16:06:0e:b7:e9"]
        );
        assert_eq!(status.interfaces[1].name, "enp175s0f1");
    }

    #[test]
    fn conflicts_are_retried_within_the_attempt_budget() {
        for attempt in 0..MAX_CONFLICT_RETRIES {
            assert!(retry_on_conflict(&api_error(409), attempt));
        }
    }

    #[test]
    fn conflicts_give_up_after_bounded_attempts() {
        assert!(!retry_on_conflict(&api_error(409), MAX_CONFLICT_RETRIES));
    }

    #[test]
    fn non_conflict_errors_are_not_retried() {
        assert!(!retry_on_conflict(&api_error(500), 0));
        assert!(!retry_on_conflict(&api_error(404), 0));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(conflict_backoff(0), time::Duration::from_millis(10));
        assert_eq!(conflict_backoff(1), time::Duration::from_millis(20));
        assert_eq!(conflict_backoff(4), time::Duration::from_millis(160));
    }
}
