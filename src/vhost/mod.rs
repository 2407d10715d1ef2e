//! Virtual-host routing for external HTTP and HTTPS traffic. Two router
//! instances exist: one consulted per HTTP request by host and path, one
//! consulted per HTTPS connection by SNI.

use crate::control::Control;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};

pub mod http;
pub mod https;

#[derive(thiserror::Error, Debug)]
pub enum VhostError {
	#[error("vhost route {host}{location} is already in use")]
	RouteInUse { host: String, location: String },
}

/// Where a matched request goes: the owning control supplies the work
/// connection that carries the user's bytes.
#[derive(Clone)]
pub struct Route {
	pub proxy_name: String,
	pub ctl: Weak<Control>,
	pub host_header_rewrite: Option<String>,
}

#[derive(Default)]
pub struct VhostRouter {
	// Per host, location prefixes sorted longest first; ties keep
	// registration order, so the earliest registration wins.
	inner: Mutex<HashMap<String, Vec<(String, Route)>>>,
}

impl VhostRouter {
	pub fn register(&self, host: &str, location: &str, route: Route) -> Result<(), VhostError> {
		let host = host.to_ascii_lowercase();
		let mut inner = self.inner.lock().unwrap();
		let entries = inner.entry(host.clone()).or_default();
		if entries.iter().any(|(loc, _)| loc == location) {
			return Err(VhostError::RouteInUse {
				host,
				location: location.to_string(),
			});
		}
		entries.push((location.to_string(), route));
		entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
		Ok(())
	}

	pub fn unregister(&self, host: &str, location: &str) {
		let host = host.to_ascii_lowercase();
		let mut inner = self.inner.lock().unwrap();
		if let Some(entries) = inner.get_mut(&host) {
			entries.retain(|(loc, _)| loc != location);
			if entries.is_empty() {
				inner.remove(&host);
			}
		}
	}

	/// Longest matching location prefix for the host, if any.
	pub fn resolve(&self, host: &str, path: &str) -> Option<Route> {
		let host = host.to_ascii_lowercase();
		let inner = self.inner.lock().unwrap();
		inner
			.get(&host)?
			.iter()
			.find(|(loc, _)| path.starts_with(loc.as_str()))
			.map(|(_, route)| route.clone())
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().unwrap().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route(name: &str) -> Route {
		Route {
			proxy_name: name.to_string(),
			ctl: Weak::new(),
			host_header_rewrite: None,
		}
	}

	#[test]
	fn longest_location_prefix_wins() {
		let router = VhostRouter::default();
		router.register("a.example", "/", route("root")).unwrap();
		router.register("a.example", "/api", route("api")).unwrap();

		assert_eq!(
			router.resolve("a.example", "/api/users").unwrap().proxy_name,
			"api"
		);
		assert_eq!(router.resolve("a.example", "/index").unwrap().proxy_name, "root");
		assert_eq!(
			router.resolve("A.EXAMPLE", "/api").unwrap().proxy_name,
			"api"
		);
		assert!(router.resolve("b.example", "/").is_none());
	}

	#[test]
	fn duplicate_registration_fails_and_unregister_frees_the_slot() {
		let router = VhostRouter::default();
		router.register("a.example", "/", route("first")).unwrap();
		assert!(matches!(
			router.register("a.example", "/", route("second")),
			Err(VhostError::RouteInUse { .. })
		));
		assert_eq!(router.resolve("a.example", "/x").unwrap().proxy_name, "first");

		router.unregister("a.example", "/");
		assert!(router.resolve("a.example", "/x").is_none());
		router.register("a.example", "/", route("second")).unwrap();
		assert_eq!(
			router.resolve("a.example", "/x").unwrap().proxy_name,
			"second"
		);
	}
}
