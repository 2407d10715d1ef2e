use crate::ports::PortRange;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("could not read config file: {0}")]
	Io(#[from] std::io::Error),
	#[error("could not parse config: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("invalid allowPorts entry {0:?}")]
	BadPortRange(String),
	#[error("{0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ServerConfig {
	pub bind_addr: String,
	pub bind_port: u16,
	/// Secondary transport port, 0 disables. Served as a plain additional
	/// listener feeding the same dispatch.
	pub kcp_bind_port: u16,
	/// NAT-hole rendezvous port, 0 disables. Not served by this build.
	pub bind_udp_port: u16,
	pub proxy_bind_addr: String,
	pub vhost_http_port: u16,
	pub vhost_https_port: u16,
	/// Per-request timeout for the HTTP vhost, in seconds.
	pub vhost_http_timeout: u64,
	/// Login timestamp window in seconds, 0 disables the window check.
	pub auth_timeout: i64,
	pub heartbeat_timeout: u64,
	/// Deadline for the first framed message on a fresh connection, seconds.
	pub user_conn_timeout: u64,
	pub token: String,
	/// Comma-separated port ranges, e.g. "2000-3000,3001".
	pub allow_ports: String,
	pub max_ports_per_client: usize,
	pub max_pool_count: usize,
	pub tcp_mux: bool,
	pub sub_domain_host: String,
	pub dashboard_addr: String,
	pub dashboard_port: u16,
	pub dashboard_user: String,
	pub dashboard_pwd: String,
	/// How long an external arrival waits for a work connection, seconds.
	/// Not part of the file format.
	#[serde(skip)]
	pub work_conn_timeout: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind_addr: "0.0.0.0".to_string(),
			bind_port: 7000,
			kcp_bind_port: 0,
			bind_udp_port: 0,
			proxy_bind_addr: String::new(),
			vhost_http_port: 0,
			vhost_https_port: 0,
			vhost_http_timeout: 60,
			auth_timeout: 900,
			heartbeat_timeout: 90,
			user_conn_timeout: 10,
			token: String::new(),
			allow_ports: String::new(),
			max_ports_per_client: 0,
			max_pool_count: 5,
			tcp_mux: false,
			sub_domain_host: String::new(),
			dashboard_addr: "0.0.0.0".to_string(),
			dashboard_port: 0,
			dashboard_user: String::new(),
			dashboard_pwd: String::new(),
			work_conn_timeout: 10,
		}
	}
}

impl ServerConfig {
	pub async fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
		let raw = tokio::fs::read_to_string(path).await?;
		Self::from_str(&raw)
	}

	pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
		let mut cfg: ServerConfig = serde_json::from_str(raw)?;
		cfg.normalize()?;
		Ok(cfg)
	}

	pub fn normalize(&mut self) -> Result<(), ConfigError> {
		if self.proxy_bind_addr.is_empty() {
			self.proxy_bind_addr = self.bind_addr.clone();
		}
		if self.work_conn_timeout == 0 {
			self.work_conn_timeout = 10;
		}
		if self.heartbeat_timeout == 0 {
			return Err(ConfigError::Invalid(
				"heartbeatTimeout must not be zero".to_string(),
			));
		}
		// Fail early rather than at the first NewProxy.
		self.allowed_ports()?;
		Ok(())
	}

	pub fn allowed_ports(&self) -> Result<Vec<PortRange>, ConfigError> {
		parse_port_ranges(&self.allow_ports)
	}

	pub fn vhost_http_enabled(&self) -> bool {
		self.vhost_http_port != 0
	}

	pub fn vhost_https_enabled(&self) -> bool {
		self.vhost_https_port != 0
	}
}

pub fn parse_port_ranges(raw: &str) -> Result<Vec<PortRange>, ConfigError> {
	let mut ranges = Vec::new();
	for piece in raw.split(',') {
		let piece = piece.trim();
		if piece.is_empty() {
			continue;
		}
		let bad = || ConfigError::BadPortRange(piece.to_string());
		let range = match piece.split_once('-') {
			Some((start, end)) => {
				let start: u16 = start.trim().parse().map_err(|_| bad())?;
				let end: u16 = end.trim().parse().map_err(|_| bad())?;
				if start > end {
					return Err(bad());
				}
				PortRange { start, end }
			},
			None => {
				let port: u16 = piece.parse().map_err(|_| bad())?;
				PortRange {
					start: port,
					end: port,
				}
			},
		};
		ranges.push(range);
	}
	Ok(ranges)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_ranges_and_single_ports() {
		let ranges = parse_port_ranges("2000-3000, 3001").unwrap();
		assert_eq!(
			ranges,
			vec![
				PortRange {
					start: 2000,
					end: 3000
				},
				PortRange {
					start: 3001,
					end: 3001
				}
			]
		);
	}

	#[test]
	fn rejects_backwards_ranges() {
		assert!(parse_port_ranges("3000-2000").is_err());
	}

	#[test]
	fn defaults_fill_in_and_proxy_bind_addr_follows_bind_addr() {
		let cfg = ServerConfig::from_str(r#"{"bindAddr": "127.0.0.1", "token": "s"}"#).unwrap();
		assert_eq!(cfg.bind_port, 7000);
		assert_eq!(cfg.proxy_bind_addr, "127.0.0.1");
		assert_eq!(cfg.max_pool_count, 5);
		assert_eq!(cfg.work_conn_timeout, 10);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		assert!(ServerConfig::from_str(r#"{"bindAddrs": "x"}"#).is_err());
	}
}
