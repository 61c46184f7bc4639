use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes an 802.1X authenticator deployment for a set of node
/// interfaces.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "eapol.io",
    version = "v1",
    kind = "Authenticator",
    namespaced,
    status = "AuthenticatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSpec {
    /// Whether 802.1X authentication is enabled on the selected
    /// interfaces.
    pub enabled: bool,

    /// Interfaces on which the authenticator daemon listens.
    pub interfaces: Vec<String>,

    pub authentication: Auth,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Config>,

    /// Authenticator image override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Backend used to authenticate supplicants: a local user file, a
/// RADIUS server, or both.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Local>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<Radius>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Local {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_file_secret: Option<SecretKeyRef>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Radius {
    pub auth_server: String,
    pub auth_port: u16,
    pub auth_secret: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Miscellaneous 802.1X and EAP tunables.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// EAP reauthentication period in seconds (0 disables periodic
    /// reauthentication).
    pub eap_reauth_period: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorStatus {
    /// Per-interface authentication state as observed by the node
    /// monitors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    #[serde(default)]
    pub state: IfState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authenticated_clients: Vec<String>,
}

/// Interface state as reported by the authentication daemon's status
/// reply.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum IfState {
    Uninitialized,
    Disabled,
    CountryUpdate,
    #[serde(rename = "ACS")]
    Acs,
    #[serde(rename = "HT-Scan")]
    HtScan,
    #[serde(rename = "DFS")]
    Dfs,
    Enabled,
    #[default]
    Unknown,
}

impl IfState {
    /// Maps the daemon's `state=` value to an interface state.
    pub fn parse(state: &str) -> Self {
        match state {
            "UNINITIALIZED" => IfState::Uninitialized,
            "DISABLED" => IfState::Disabled,
            "COUNTRY_UPDATE" => IfState::CountryUpdate,
            "ACS" => IfState::Acs,
            "HT_SCAN" => IfState::HtScan,
            "DFS" => IfState::Dfs,
            "ENABLED" => IfState::Enabled,
            _ => IfState::Unknown,
        }
    }
}

impl fmt::Display for IfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IfState::Uninitialized => "Uninitialized",
            IfState::Disabled => "Disabled",
            IfState::CountryUpdate => "CountryUpdate",
            IfState::Acs => "ACS",
            IfState::HtScan => "HT-Scan",
            IfState::Dfs => "DFS",
            IfState::Enabled => "Enabled",
            IfState::Unknown => "Unknown",
        };
        s.fmt(f)
    }
}
