//! Shared registries: live controls by run id, proxies by globally unique
//! name, and visitor queues for secret tunnels. All maps are coarse-locked;
//! every operation is a short critical section.

use crate::conn::Conn;
use crate::control::Control;
use crate::proxy::Proxy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
	#[error("proxy name {0:?} is already in use")]
	NameInUse(String),
}

#[derive(Default)]
pub struct ControlRegistry {
	inner: Mutex<HashMap<String, Arc<Control>>>,
}

impl ControlRegistry {
	/// Atomically install `ctl` as the owner of `run_id`, returning the
	/// replaced control if there was one. The caller must wait for the old
	/// control's shutdown to finish before letting the new one serve.
	pub fn add(&self, run_id: &str, ctl: Arc<Control>) -> Option<Arc<Control>> {
		self.inner
			.lock()
			.unwrap()
			.insert(run_id.to_string(), ctl)
	}

	pub fn get(&self, run_id: &str) -> Option<Arc<Control>> {
		self.inner.lock().unwrap().get(run_id).cloned()
	}

	/// Remove `run_id` only if it still maps to `ctl`; a control replaced by
	/// takeover must not delete its successor.
	pub fn del(&self, run_id: &str, ctl: &Arc<Control>) -> bool {
		let mut inner = self.inner.lock().unwrap();
		match inner.get(run_id) {
			Some(current) if Arc::ptr_eq(current, ctl) => {
				inner.remove(run_id);
				true
			},
			_ => false,
		}
	}

	pub fn run_ids(&self) -> Vec<String> {
		self.inner.lock().unwrap().keys().cloned().collect()
	}

	pub fn all(&self) -> Vec<Arc<Control>> {
		self.inner.lock().unwrap().values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
	pub name: String,
	pub proxy_type: String,
	pub run_id: String,
	pub remote_addr: String,
}

#[derive(Default)]
pub struct ProxyRegistry {
	inner: Mutex<HashMap<String, Arc<Proxy>>>,
}

impl ProxyRegistry {
	pub fn add(&self, name: &str, pxy: Arc<Proxy>) -> Result<(), RegistryError> {
		let mut inner = self.inner.lock().unwrap();
		if inner.contains_key(name) {
			return Err(RegistryError::NameInUse(name.to_string()));
		}
		inner.insert(name.to_string(), pxy);
		Ok(())
	}

	pub fn del(&self, name: &str) -> Option<Arc<Proxy>> {
		self.inner.lock().unwrap().remove(name)
	}

	pub fn get(&self, name: &str) -> Option<Arc<Proxy>> {
		self.inner.lock().unwrap().get(name).cloned()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn snapshot(&self) -> Vec<ProxyInfo> {
		self
			.inner
			.lock()
			.unwrap()
			.values()
			.map(|p| p.info())
			.collect()
	}
}

/// A secret-tunnel proxy's pairing queue: visitor connections are pushed
/// here and consumed by the proxy's pairing task.
#[derive(Clone)]
pub struct VisitorHandle {
	pub sk: String,
	pub tx: mpsc::Sender<Conn>,
}

#[derive(Default)]
pub struct VisitorRegistry {
	inner: Mutex<HashMap<String, VisitorHandle>>,
}

impl VisitorRegistry {
	pub fn add(&self, name: &str, handle: VisitorHandle) -> Result<(), RegistryError> {
		let mut inner = self.inner.lock().unwrap();
		if inner.contains_key(name) {
			return Err(RegistryError::NameInUse(name.to_string()));
		}
		inner.insert(name.to_string(), handle);
		Ok(())
	}

	pub fn del(&self, name: &str) {
		self.inner.lock().unwrap().remove(name);
	}

	pub fn get(&self, name: &str) -> Option<VisitorHandle> {
		self.inner.lock().unwrap().get(name).cloned()
	}
}
