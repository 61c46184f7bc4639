pub use eapol_authenticator_k8s_api as k8s;
pub use eapol_authenticator_monitor as monitor;

mod args;

pub use self::args::Args;
