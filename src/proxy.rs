//! Registered tunnels. A `Proxy` is created from a validated `NewProxy`
//! message: port proxies acquire a listener port from the allocator, vhost
//! proxies install routes in the HTTP/HTTPS routers, and secret tunnels
//! install a visitor pairing queue. A proxy's lifetime is bounded by its
//! owning control; closing it releases everything it acquired.

use crate::conn::Conn;
use crate::control::Control;
use crate::msg::{self, Message};
use crate::ports::PortError;
use crate::registry::{ProxyInfo, RegistryError, VisitorHandle};
use crate::service::ServiceContext;
use crate::vhost::{Route, VhostError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const VISITOR_QUEUE_LEN: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("proxy name must not be empty")]
	EmptyName,
	#[error("unsupported proxy type {0:?}")]
	UnknownType(String),
	#[error(transparent)]
	NameInUse(#[from] RegistryError),
	#[error(transparent)]
	Port(#[from] PortError),
	#[error("port unavailable: bind failed: {0}")]
	Bind(std::io::Error),
	#[error("exceeded the allowed number of ports for this client")]
	TooManyPorts,
	#[error("custom domain or subdomain required")]
	NoDomains,
	#[error("subdomain is not supported because subDomainHost is not configured")]
	SubdomainNotAllowed,
	#[error("invalid subdomain {0:?}")]
	BadSubdomain(String),
	#[error("vhost {0} port is not configured")]
	VhostDisabled(&'static str),
	#[error(transparent)]
	Route(#[from] VhostError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
	Tcp,
	Udp,
	Http,
	Https,
	Stcp,
	Xtcp,
}

impl ProxyType {
	pub fn parse(raw: &str) -> Option<Self> {
		match raw {
			"tcp" => Some(ProxyType::Tcp),
			"udp" => Some(ProxyType::Udp),
			"http" => Some(ProxyType::Http),
			"https" => Some(ProxyType::Https),
			"stcp" => Some(ProxyType::Stcp),
			"xtcp" => Some(ProxyType::Xtcp),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ProxyType::Tcp => "tcp",
			ProxyType::Udp => "udp",
			ProxyType::Http => "http",
			ProxyType::Https => "https",
			ProxyType::Stcp => "stcp",
			ProxyType::Xtcp => "xtcp",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFlavor {
	Tcp,
	Udp,
}

#[derive(Debug, Clone, Copy)]
enum RouterKind {
	Http,
	Https,
}

pub struct Proxy {
	name: String,
	kind: ProxyType,
	owner_run_id: String,
	remote_addr: String,
	ctl: Weak<Control>,
	bound: Option<(PortFlavor, u16)>,
	routes: Vec<(RouterKind, String, String)>,
	visitor_entry: bool,
	listener: StdMutex<Option<TcpListener>>,
	visitor_rx: StdMutex<Option<mpsc::Receiver<Conn>>>,
	cancel: CancellationToken,
	closed: AtomicBool,
}

impl Proxy {
	/// Validate a `NewProxy`, acquire its resources, and publish it under
	/// its globally unique name. Returns the proxy and the remote address
	/// reported back to the client.
	pub async fn register(
		srv: &Arc<ServiceContext>,
		ctl: &Arc<Control>,
		p: msg::NewProxy,
	) -> Result<(Arc<Proxy>, String), ProxyError> {
		if p.proxy_name.is_empty() {
			return Err(ProxyError::EmptyName);
		}
		let kind = ProxyType::parse(&p.proxy_type)
			.ok_or_else(|| ProxyError::UnknownType(p.proxy_type.clone()))?;
		let name = p.proxy_name.clone();

		let mut bound = None;
		let mut routes: Vec<(RouterKind, String, String)> = Vec::new();
		let mut listener = None;
		let mut visitor_rx = None;
		let mut visitor_entry = false;
		let remote_addr;

		match kind {
			ProxyType::Tcp | ProxyType::Udp => {
				let max = srv.cfg.max_ports_per_client;
				if max > 0 && ctl.used_ports() >= max {
					return Err(ProxyError::TooManyPorts);
				}
				let flavor = match kind {
					ProxyType::Tcp => PortFlavor::Tcp,
					_ => PortFlavor::Udp,
				};
				let pm = srv.ports(flavor);
				let port = if p.remote_port == 0 {
					pm.acquire_any()?
				} else {
					pm.acquire(p.remote_port)?
				};
				if kind == ProxyType::Tcp {
					match TcpListener::bind((srv.cfg.proxy_bind_addr.as_str(), port)).await {
						Ok(l) => listener = Some(l),
						Err(e) => {
							pm.release(port);
							return Err(ProxyError::Bind(e));
						},
					}
				}
				bound = Some((flavor, port));
				remote_addr = format!("{}:{}", srv.cfg.proxy_bind_addr, port);
			},
			ProxyType::Http => {
				if !srv.cfg.vhost_http_enabled() {
					return Err(ProxyError::VhostDisabled("http"));
				}
				let domains = collect_domains(&p, srv)?;
				let locations = if p.locations.is_empty() {
					vec!["/".to_string()]
				} else {
					p.locations.clone()
				};
				let rewrite =
					(!p.host_header_rewrite.is_empty()).then(|| p.host_header_rewrite.clone());
				for domain in &domains {
					for location in &locations {
						let route = Route {
							proxy_name: name.clone(),
							ctl: Arc::downgrade(ctl),
							host_header_rewrite: rewrite.clone(),
						};
						if let Err(e) = srv.http_router.register(domain, location, route) {
							unregister_routes(srv, &routes);
							return Err(e.into());
						}
						routes.push((RouterKind::Http, domain.clone(), location.clone()));
					}
				}
				remote_addr = format!("{}:{}", srv.cfg.proxy_bind_addr, srv.cfg.vhost_http_port);
			},
			ProxyType::Https => {
				if !srv.cfg.vhost_https_enabled() {
					return Err(ProxyError::VhostDisabled("https"));
				}
				let domains = collect_domains(&p, srv)?;
				for domain in &domains {
					let route = Route {
						proxy_name: name.clone(),
						ctl: Arc::downgrade(ctl),
						host_header_rewrite: None,
					};
					if let Err(e) = srv.https_router.register(domain, "/", route) {
						unregister_routes(srv, &routes);
						return Err(e.into());
					}
					routes.push((RouterKind::Https, domain.clone(), "/".to_string()));
				}
				remote_addr = format!("{}:{}", srv.cfg.proxy_bind_addr, srv.cfg.vhost_https_port);
			},
			ProxyType::Stcp | ProxyType::Xtcp => {
				let (tx, rx) = mpsc::channel(VISITOR_QUEUE_LEN);
				srv.visitors.add(
					&name,
					VisitorHandle {
						sk: p.sk.clone(),
						tx,
					},
				)?;
				visitor_entry = true;
				visitor_rx = Some(rx);
				remote_addr = String::new();
			},
		}

		let pxy = Arc::new(Proxy {
			name,
			kind,
			owner_run_id: ctl.run_id().to_string(),
			remote_addr: remote_addr.clone(),
			ctl: Arc::downgrade(ctl),
			bound,
			routes,
			visitor_entry,
			listener: StdMutex::new(listener),
			visitor_rx: StdMutex::new(visitor_rx),
			cancel: CancellationToken::new(),
			closed: AtomicBool::new(false),
		});

		if let Err(e) = srv.proxies.add(&pxy.name, pxy.clone()) {
			pxy.closed.store(true, Ordering::SeqCst);
			pxy.release_resources(srv);
			return Err(e.into());
		}
		srv.metrics.active_proxies.set(srv.proxies.len() as i64);
		pxy.start();
		Ok((pxy, remote_addr))
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> ProxyType {
		self.kind
	}

	pub fn bound_port(&self) -> Option<u16> {
		self.bound.map(|(_, port)| port)
	}

	pub fn info(&self) -> ProxyInfo {
		ProxyInfo {
			name: self.name.clone(),
			proxy_type: self.kind.as_str().to_string(),
			run_id: self.owner_run_id.clone(),
			remote_addr: self.remote_addr.clone(),
		}
	}

	fn start(self: &Arc<Self>) {
		match self.kind {
			ProxyType::Tcp => {
				if let Some(listener) = self.listener.lock().unwrap().take() {
					tokio::spawn(Self::run_tcp(self.clone(), listener));
				}
			},
			ProxyType::Stcp | ProxyType::Xtcp => {
				if let Some(rx) = self.visitor_rx.lock().unwrap().take() {
					tokio::spawn(Self::run_visitors(self.clone(), rx));
				}
			},
			// The UDP packet relay is an external collaborator; the port
			// stays reserved until the proxy closes.
			_ => {},
		}
	}

	async fn run_tcp(self: Arc<Self>, listener: TcpListener) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				res = listener.accept() => match res {
					Ok((stream, addr)) => {
						debug!(proxy = %self.name, user = %addr, "external connection");
						let pxy = self.clone();
						tokio::spawn(async move {
							pxy.splice_with_work_conn(Conn::from_tcp(stream)).await;
						});
					},
					Err(e) => {
						warn!(proxy = %self.name, "accept failed: {}", e);
						tokio::time::sleep(Duration::from_millis(100)).await;
					},
				},
			}
		}
	}

	async fn run_visitors(self: Arc<Self>, mut rx: mpsc::Receiver<Conn>) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				visitor = rx.recv() => match visitor {
					Some(conn) => {
						let pxy = self.clone();
						tokio::spawn(async move {
							pxy.splice_with_work_conn(conn).await;
						});
					},
					None => break,
				},
			}
		}
	}

	/// Pair one external (or visitor) connection with one work connection
	/// and copy until either side closes. The work connection is never
	/// reused.
	async fn splice_with_work_conn(&self, mut user: Conn) {
		let Some(ctl) = self.ctl.upgrade() else {
			return;
		};
		let mut work = match ctl.get_work_conn().await {
			Ok(w) => w,
			Err(e) => {
				debug!(proxy = %self.name, "dropping external connection: {}", e);
				return;
			},
		};
		let start = Message::StartWorkConn(msg::StartWorkConn {
			proxy_name: self.name.clone(),
		});
		if let Err(e) = msg::write_msg(&mut work, &start).await {
			debug!(proxy = %self.name, "work connection unusable: {}", e);
			return;
		}
		match tokio::io::copy_bidirectional(&mut user, &mut work).await {
			Ok((rx_bytes, tx_bytes)) => {
				debug!(proxy = %self.name, rx_bytes, tx_bytes, "session finished");
			},
			Err(e) => debug!(proxy = %self.name, "session ended: {}", e),
		}
	}

	/// Unpublish the proxy and give back every resource it held. Safe to
	/// call more than once.
	pub async fn close(&self, srv: &Arc<ServiceContext>) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.cancel.cancel();
		srv.proxies.del(&self.name);
		self.release_resources(srv);
		srv.metrics.active_proxies.set(srv.proxies.len() as i64);
		debug!(proxy = %self.name, "proxy closed");
	}

	fn release_resources(&self, srv: &Arc<ServiceContext>) {
		if let Some((flavor, port)) = self.bound {
			srv.ports(flavor).release(port);
		}
		unregister_routes(srv, &self.routes);
		if self.visitor_entry {
			srv.visitors.del(&self.name);
		}
	}
}

fn unregister_routes(srv: &Arc<ServiceContext>, routes: &[(RouterKind, String, String)]) {
	for (router, host, location) in routes {
		match router {
			RouterKind::Http => srv.http_router.unregister(host, location),
			RouterKind::Https => srv.https_router.unregister(host, location),
		}
	}
}

fn collect_domains(p: &msg::NewProxy, srv: &ServiceContext) -> Result<Vec<String>, ProxyError> {
	let mut domains: Vec<String> = p
		.custom_domains
		.iter()
		.map(|d| d.trim().to_ascii_lowercase())
		.filter(|d| !d.is_empty())
		.collect();
	if !p.sub_domain.is_empty() {
		if srv.cfg.sub_domain_host.is_empty() {
			return Err(ProxyError::SubdomainNotAllowed);
		}
		if p.sub_domain.contains('.') || p.sub_domain.contains('*') {
			return Err(ProxyError::BadSubdomain(p.sub_domain.clone()));
		}
		domains.push(format!(
			"{}.{}",
			p.sub_domain.to_ascii_lowercase(),
			srv.cfg.sub_domain_host.to_ascii_lowercase()
		));
	}
	if domains.is_empty() {
		return Err(ProxyError::NoDomains);
	}
	Ok(domains)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ServerConfig;

	async fn test_setup(update: impl FnOnce(&mut ServerConfig)) -> (Arc<ServiceContext>, Arc<Control>) {
		let mut cfg = ServerConfig::default();
		cfg.bind_addr = "127.0.0.1".to_string();
		cfg.token = "secret".to_string();
		update(&mut cfg);
		cfg.normalize().unwrap();
		let ctx = Arc::new(ServiceContext::new(cfg).unwrap());
		let login = msg::Login::default();
		let ctl = Control::new(ctx.clone(), "run-1".to_string(), None, &login);
		(ctx, ctl)
	}

	fn tcp_proxy(name: &str, port: u16) -> msg::NewProxy {
		msg::NewProxy {
			proxy_name: name.to_string(),
			proxy_type: "tcp".to_string(),
			remote_port: port,
			..Default::default()
		}
	}

	#[tokio::test]
	async fn unknown_type_and_empty_name_are_rejected() {
		let (ctx, ctl) = test_setup(|_| {}).await;
		let p = msg::NewProxy {
			proxy_name: "x".to_string(),
			proxy_type: "quic".to_string(),
			..Default::default()
		};
		assert!(matches!(
			Proxy::register(&ctx, &ctl, p).await,
			Err(ProxyError::UnknownType(_))
		));
		let p = msg::NewProxy {
			proxy_type: "tcp".to_string(),
			..Default::default()
		};
		assert!(matches!(
			Proxy::register(&ctx, &ctl, p).await,
			Err(ProxyError::EmptyName)
		));
	}

	#[tokio::test]
	async fn tcp_proxy_binds_inside_the_allow_list() {
		let (ctx, ctl) = test_setup(|cfg| cfg.allow_ports = "41300-41301".to_string()).await;
		let (pxy, remote_addr) = Proxy::register(&ctx, &ctl, tcp_proxy("t1", 41300))
			.await
			.unwrap();
		assert_eq!(remote_addr, "127.0.0.1:41300");
		assert_eq!(pxy.bound_port(), Some(41300));
		assert!(ctx.proxies.get("t1").is_some());

		assert!(matches!(
			Proxy::register(&ctx, &ctl, tcp_proxy("t2", 41300)).await,
			Err(ProxyError::Port(PortError::InUse))
		));
		assert!(matches!(
			Proxy::register(&ctx, &ctl, tcp_proxy("t3", 50000)).await,
			Err(ProxyError::Port(PortError::NotAllowed))
		));

		pxy.close(&ctx).await;
		assert!(ctx.proxies.get("t1").is_none());
		assert_eq!(ctx.tcp_ports.used_count(), 0);
	}

	#[tokio::test]
	async fn duplicate_name_rolls_the_port_back() {
		let (ctx, ctl) = test_setup(|cfg| cfg.allow_ports = "41310-41312".to_string()).await;
		let (_pxy, _) = Proxy::register(&ctx, &ctl, tcp_proxy("dup", 41310))
			.await
			.unwrap();
		assert!(matches!(
			Proxy::register(&ctx, &ctl, tcp_proxy("dup", 41311)).await,
			Err(ProxyError::NameInUse(_))
		));
		// Only the first proxy's port is still held.
		assert_eq!(ctx.tcp_ports.used_count(), 1);
	}

	#[tokio::test]
	async fn http_proxy_needs_a_vhost_port_and_a_domain() {
		let (ctx, ctl) = test_setup(|_| {}).await;
		let p = msg::NewProxy {
			proxy_name: "web".to_string(),
			proxy_type: "http".to_string(),
			custom_domains: vec!["a.example".to_string()],
			..Default::default()
		};
		assert!(matches!(
			Proxy::register(&ctx, &ctl, p).await,
			Err(ProxyError::VhostDisabled("http"))
		));

		let (ctx, ctl) = test_setup(|cfg| cfg.vhost_http_port = 8080).await;
		let p = msg::NewProxy {
			proxy_name: "web".to_string(),
			proxy_type: "http".to_string(),
			..Default::default()
		};
		assert!(matches!(
			Proxy::register(&ctx, &ctl, p).await,
			Err(ProxyError::NoDomains)
		));

		let p = msg::NewProxy {
			proxy_name: "web".to_string(),
			proxy_type: "http".to_string(),
			custom_domains: vec!["A.Example".to_string()],
			locations: vec!["/".to_string(), "/api".to_string()],
			..Default::default()
		};
		let (pxy, _) = Proxy::register(&ctx, &ctl, p).await.unwrap();
		assert!(ctx.http_router.resolve("a.example", "/api/x").is_some());
		pxy.close(&ctx).await;
		assert!(ctx.http_router.resolve("a.example", "/api/x").is_none());
		assert!(ctx.http_router.is_empty());
	}

	#[tokio::test]
	async fn subdomains_expand_under_the_configured_suffix() {
		let (ctx, ctl) = test_setup(|cfg| {
			cfg.vhost_http_port = 8080;
			cfg.sub_domain_host = "tunnel.example".to_string();
		})
		.await;
		let p = msg::NewProxy {
			proxy_name: "sub".to_string(),
			proxy_type: "http".to_string(),
			sub_domain: "team".to_string(),
			..Default::default()
		};
		let (pxy, _) = Proxy::register(&ctx, &ctl, p).await.unwrap();
		assert!(ctx.http_router.resolve("team.tunnel.example", "/").is_some());
		pxy.close(&ctx).await;

		let p = msg::NewProxy {
			proxy_name: "sub2".to_string(),
			proxy_type: "http".to_string(),
			sub_domain: "a.b".to_string(),
			..Default::default()
		};
		assert!(matches!(
			Proxy::register(&ctx, &ctl, p).await,
			Err(ProxyError::BadSubdomain(_))
		));
	}

	#[tokio::test]
	async fn secret_tunnels_install_a_visitor_queue() {
		let (ctx, ctl) = test_setup(|_| {}).await;
		let p = msg::NewProxy {
			proxy_name: "sec".to_string(),
			proxy_type: "stcp".to_string(),
			sk: "k".to_string(),
			..Default::default()
		};
		let (pxy, remote_addr) = Proxy::register(&ctx, &ctl, p).await.unwrap();
		assert!(remote_addr.is_empty());
		let handle = ctx.visitors.get("sec").unwrap();
		assert_eq!(handle.sk, "k");
		pxy.close(&ctx).await;
		assert!(ctx.visitors.get("sec").is_none());
	}

	#[tokio::test]
	async fn max_ports_per_client_is_enforced() {
		let (ctx, ctl) = test_setup(|cfg| {
			cfg.allow_ports = "41320-41329".to_string();
			cfg.max_ports_per_client = 1;
		})
		.await;
		let (pxy, _) = Proxy::register(&ctx, &ctl, tcp_proxy("p1", 0)).await.unwrap();
		ctl.adopt(pxy);
		assert!(matches!(
			Proxy::register(&ctx, &ctl, tcp_proxy("p2", 0)).await,
			Err(ProxyError::TooManyPorts)
		));
	}
}
