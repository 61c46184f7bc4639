use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Per-interface authentication metrics.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    auth_success: Family<Labels, Gauge>,
    auth_failure: Family<Labels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Labels {
    interface: String,
}

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        // Gauges do not get the automatic `_total` suffix, so the full
        // name is spelled out to match the counter's convention.
        reg.register(
            "auth_success_total",
            "Clients currently authenticated per interface",
            metrics.auth_success.clone(),
        );
        reg.register(
            "auth_failure",
            "EAP authentication failures per interface",
            metrics.auth_failure.clone(),
        );
        metrics
    }

    pub fn authenticated(&self, interface: &str) {
        self.auth_success.get_or_create(&labels(interface)).inc();
    }

    pub fn deauthenticated(&self, interface: &str) {
        self.auth_success.get_or_create(&labels(interface)).dec();
    }

    pub fn auth_failed(&self, interface: &str) {
        self.auth_failure.get_or_create(&labels(interface)).inc();
    }
}

fn labels(interface: &str) -> Labels {
    Labels {
        interface: interface.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_per_interface_series() {
        let mut reg = Registry::default();
        let metrics = Metrics::register(&mut reg);
        metrics.authenticated("enp175s0f1");
        metrics.authenticated("enp175s0f1");
        metrics.deauthenticated("enp175s0f1");
        metrics.auth_failed("enp175s0f0");

        let mut out = String::new();
        encode(&mut out, &reg).unwrap();
        assert!(out.contains("auth_success_total{interface=\"enp175s0f1\"} 1"));
        assert!(out.contains("auth_failure_total{interface=\"enp175s0f0\"} 1"));
    }
}
