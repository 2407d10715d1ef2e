use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Counters and gauges shared across the service. Cloning is cheap; all
/// handles point at the same underlying atomics.
#[derive(Clone, Default)]
pub struct Metrics {
	pub client_logins: Counter,
	pub auth_failures: Counter,
	pub active_controls: Gauge,
	pub active_proxies: Gauge,
	pub work_conns: Counter,
	pub vhost_requests: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let metrics = Metrics::default();
		registry.register(
			"tungate_client_logins",
			"Login attempts, successful or not",
			metrics.client_logins.clone(),
		);
		registry.register(
			"tungate_auth_failures",
			"Logins rejected during the handshake",
			metrics.auth_failures.clone(),
		);
		registry.register(
			"tungate_active_controls",
			"Live client control sessions",
			metrics.active_controls.clone(),
		);
		registry.register(
			"tungate_active_proxies",
			"Registered proxies across all clients",
			metrics.active_proxies.clone(),
		);
		registry.register(
			"tungate_work_conns",
			"Work connections accepted into pools",
			metrics.work_conns.clone(),
		);
		registry.register(
			"tungate_vhost_requests",
			"HTTP requests handled by the vhost router",
			metrics.vhost_requests.clone(),
		);
		metrics
	}
}
