//! Proxy port allocation. One manager per L4 flavor; at most one owner per
//! port at any time.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PortError {
	#[error("port unavailable: already in use")]
	InUse,
	#[error("port unavailable: not in the allowed ranges")]
	NotAllowed,
	#[error("port unavailable: no free port left")]
	Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
	pub start: u16,
	pub end: u16,
}

impl PortRange {
	fn contains(&self, port: u16) -> bool {
		self.start <= port && port <= self.end
	}
}

pub struct PortManager {
	allowed: Vec<PortRange>,
	used: Mutex<HashSet<u16>>,
}

impl PortManager {
	/// An empty allow-list permits any specific port but offers nothing to
	/// `acquire_any`.
	pub fn new(allowed: Vec<PortRange>) -> Self {
		Self {
			allowed,
			used: Mutex::new(HashSet::new()),
		}
	}

	pub fn acquire(&self, port: u16) -> Result<u16, PortError> {
		if !self.allowed.is_empty() && !self.allowed.iter().any(|r| r.contains(port)) {
			return Err(PortError::NotAllowed);
		}
		let mut used = self.used.lock().unwrap();
		if !used.insert(port) {
			return Err(PortError::InUse);
		}
		Ok(port)
	}

	pub fn acquire_any(&self) -> Result<u16, PortError> {
		let mut used = self.used.lock().unwrap();
		for range in &self.allowed {
			for port in range.start..=range.end {
				if used.insert(port) {
					return Ok(port);
				}
			}
		}
		Err(PortError::Exhausted)
	}

	pub fn release(&self, port: u16) {
		let removed = self.used.lock().unwrap().remove(&port);
		assert!(removed, "released port {port} that was never acquired");
	}

	pub fn used_count(&self) -> usize {
		self.used.lock().unwrap().len()
	}
}
