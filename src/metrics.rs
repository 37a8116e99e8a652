//! Process-wide Prometheus instruments, registered once under the
//! `docker_sock_authorizer` prefix and rendered in text exposition format by
//! the metrics route.

use std::sync::LazyLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

pub struct Telemetry {
    registry: Registry,
    pub approved: Counter,
    pub denied: Counter,
    pub errors: Counter,
    pub policy_loads: Counter,
    pub policy_load_seconds: Histogram,
    pub policy_mutex_wait_seconds: Histogram,
}

static TELEMETRY: LazyLock<Telemetry> = LazyLock::new(|| {
    let mut registry = Registry::with_prefix("docker_sock_authorizer");

    let approved = Counter::default();
    registry.register(
        "approved",
        "The total number of approved requests",
        approved.clone(),
    );

    let denied = Counter::default();
    registry.register(
        "denied",
        "The total number of denied requests",
        denied.clone(),
    );

    let errors = Counter::default();
    registry.register(
        "errors",
        "The total number of requests resulting in an internal server error",
        errors.clone(),
    );

    let policy_loads = Counter::default();
    registry.register(
        "configuration_loads",
        "The total number of times policies have been (re)loaded",
        policy_loads.clone(),
    );

    let policy_load_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 12));
    registry.register(
        "policy_load_seconds",
        "The time it takes to load policies for the authorizer",
        policy_load_seconds.clone(),
    );

    let policy_mutex_wait_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 12));
    registry.register(
        "policy_mutex_wait_seconds",
        "The time spent waiting for the policy load mutex",
        policy_mutex_wait_seconds.clone(),
    );

    Telemetry {
        registry,
        approved,
        denied,
        errors,
        policy_loads,
        policy_load_seconds,
        policy_mutex_wait_seconds,
    }
});

pub fn telemetry() -> &'static Telemetry {
    &TELEMETRY
}

impl Telemetry {
    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_instruments() {
        let before = telemetry().approved.get();
        telemetry().approved.inc();
        assert_eq!(telemetry().approved.get(), before + 1);

        let text = telemetry().render().unwrap();
        assert!(text.contains("docker_sock_authorizer_approved"));
        assert!(text.contains("docker_sock_authorizer_policy_load_seconds"));
        assert!(text.contains("docker_sock_authorizer_policy_mutex_wait_seconds"));
    }
}
