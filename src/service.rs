//! Lifecycle composer. Binds the listeners, wires the port muxer and vhost
//! routers, and runs the dispatch loop that turns each inbound connection's
//! first framed message into a control registration, a work-connection
//! hand-off, or a visitor pairing.

use crate::admin;
use crate::auth;
use crate::config::{ConfigError, ServerConfig};
use crate::conn::Conn;
use crate::control::Control;
use crate::metrics::Metrics;
use crate::msg::{self, Message};
use crate::muxer::{self, Acceptor, Muxer, SubListener};
use crate::ports::PortManager;
use crate::proxy::PortFlavor;
use crate::registry::{ControlRegistry, ProxyRegistry, VisitorRegistry};
use crate::tcpmux;
use crate::vhost::http::HttpVhost;
use crate::vhost::{VhostRouter, https};
use anyhow::Context as _;
use prometheus_client::registry::Registry;
use rand::Rng as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Visitor handshake timestamp window, seconds.
const VISITOR_AUTH_TIMEOUT: i64 = 900;

#[derive(thiserror::Error, Debug)]
enum LoginError {
	#[error("version incompatible with server")]
	Version,
	#[error(transparent)]
	Auth(#[from] auth::AuthError),
}

#[derive(thiserror::Error, Debug)]
enum VisitorError {
	#[error("no such secret tunnel")]
	NoSuchProxy,
	#[error(transparent)]
	Auth(#[from] auth::AuthError),
}

/// Everything the long-lived components share. Controls and proxies keep a
/// handle to this for registry and allocator lookups only; ownership of a
/// control stays with the registry.
pub struct ServiceContext {
	pub cfg: ServerConfig,
	pub controls: ControlRegistry,
	pub proxies: ProxyRegistry,
	pub visitors: VisitorRegistry,
	pub tcp_ports: PortManager,
	pub udp_ports: PortManager,
	pub http_router: Arc<VhostRouter>,
	pub https_router: Arc<VhostRouter>,
	pub metrics: Metrics,
	pub prom: Arc<Registry>,
	pub started: Instant,
}

impl ServiceContext {
	pub fn new(cfg: ServerConfig) -> Result<Self, ConfigError> {
		let allowed = cfg.allowed_ports()?;
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		Ok(Self {
			controls: ControlRegistry::default(),
			proxies: ProxyRegistry::default(),
			visitors: VisitorRegistry::default(),
			tcp_ports: PortManager::new(allowed.clone()),
			udp_ports: PortManager::new(allowed),
			http_router: Arc::new(VhostRouter::default()),
			https_router: Arc::new(VhostRouter::default()),
			metrics,
			prom: Arc::new(registry),
			started: Instant::now(),
			cfg,
		})
	}

	pub fn ports(&self, flavor: PortFlavor) -> &PortManager {
		match flavor {
			PortFlavor::Tcp => &self.tcp_ports,
			PortFlavor::Udp => &self.udp_ports,
		}
	}
}

pub struct Service;

impl Service {
	pub async fn bind(cfg: ServerConfig) -> anyhow::Result<BoundService> {
		let ctx = Arc::new(ServiceContext::new(cfg)?);
		let cfg = &ctx.cfg;

		let control_listener = TcpListener::bind((cfg.bind_addr.as_str(), cfg.bind_port))
			.await
			.with_context(|| format!("failed to listen on {}:{}", cfg.bind_addr, cfg.bind_port))?;
		let local_addr = control_listener.local_addr()?;
		info!("listening for tunnel clients on {}", local_addr);

		let mut mux = Muxer::new(
			control_listener,
			Duration::from_secs(cfg.user_conn_timeout),
		);
		let shares_control_port =
			|vhost_port: u16| vhost_port == local_addr.port() && cfg.proxy_bind_addr == cfg.bind_addr;

		let mut https_acceptor = None;
		let mut https_addr = None;
		if cfg.vhost_https_enabled() {
			let acceptor = if shares_control_port(cfg.vhost_https_port) {
				https_addr = Some(local_addr);
				Acceptor::Sub(mux.register("https", muxer::match_https))
			} else {
				let listener =
					TcpListener::bind((cfg.proxy_bind_addr.as_str(), cfg.vhost_https_port))
						.await
						.with_context(|| "failed to bind the https vhost listener")?;
				https_addr = Some(listener.local_addr()?);
				Acceptor::Direct(listener)
			};
			info!("https vhost on {}", https_addr.unwrap());
			https_acceptor = Some(acceptor);
		}

		let mut http = None;
		let mut http_addr = None;
		if cfg.vhost_http_enabled() {
			let acceptor = if shares_control_port(cfg.vhost_http_port) {
				http_addr = Some(local_addr);
				Acceptor::Sub(mux.register("http", muxer::match_http))
			} else {
				let listener = TcpListener::bind((cfg.proxy_bind_addr.as_str(), cfg.vhost_http_port))
					.await
					.with_context(|| "failed to bind the http vhost listener")?;
				http_addr = Some(listener.local_addr()?);
				Acceptor::Direct(listener)
			};
			info!("http vhost on {}", http_addr.unwrap());
			let vhost = HttpVhost::new(
				ctx.http_router.clone(),
				Duration::from_secs(cfg.vhost_http_timeout),
				ctx.metrics.clone(),
			);
			http = Some((vhost, acceptor));
		}

		let default_listener = mux.default_listener();

		let secondary = if cfg.kcp_bind_port != 0 {
			let listener = TcpListener::bind((cfg.bind_addr.as_str(), cfg.kcp_bind_port))
				.await
				.with_context(|| "failed to bind the secondary transport listener")?;
			info!("secondary transport on {}", listener.local_addr()?);
			Some(listener)
		} else {
			None
		};
		if cfg.bind_udp_port != 0 {
			warn!("bindUdpPort is configured but the NAT-hole rendezvous is not supported by this build");
		}

		let dashboard = if cfg.dashboard_port != 0 {
			let listener = TcpListener::bind((cfg.dashboard_addr.as_str(), cfg.dashboard_port))
				.await
				.with_context(|| "failed to bind the dashboard listener")?;
			info!("dashboard on {}", listener.local_addr()?);
			Some(listener)
		} else {
			None
		};

		Ok(BoundService {
			ctx,
			local_addr,
			mux,
			default_listener,
			http,
			http_addr,
			https_acceptor,
			https_addr,
			secondary,
			dashboard,
		})
	}
}

pub struct BoundService {
	ctx: Arc<ServiceContext>,
	local_addr: SocketAddr,
	mux: Muxer,
	default_listener: SubListener,
	http: Option<(Arc<HttpVhost>, Acceptor)>,
	http_addr: Option<SocketAddr>,
	https_acceptor: Option<Acceptor>,
	https_addr: Option<SocketAddr>,
	secondary: Option<TcpListener>,
	dashboard: Option<TcpListener>,
}

impl BoundService {
	pub fn context(&self) -> Arc<ServiceContext> {
		self.ctx.clone()
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn http_addr(&self) -> Option<SocketAddr> {
		self.http_addr
	}

	pub fn https_addr(&self) -> Option<SocketAddr> {
		self.https_addr
	}

	pub async fn serve(self, ct: CancellationToken) -> anyhow::Result<()> {
		let ctx = self.ctx;
		let mut tasks: JoinSet<()> = JoinSet::new();

		if let Some(acceptor) = self.https_acceptor {
			tasks.spawn(https::serve(
				ctx.https_router.clone(),
				acceptor,
				ct.child_token(),
			));
		}
		if let Some((vhost, acceptor)) = self.http {
			tasks.spawn(vhost.serve(acceptor, ct.child_token()));
		}
		tasks.spawn(self.mux.run(ct.child_token()));
		if let Some(listener) = self.secondary {
			let ctx = ctx.clone();
			let ct = ct.child_token();
			tasks.spawn(async move { run_secondary(ctx, listener, ct).await });
		}
		if let Some(listener) = self.dashboard {
			let app = admin::App::new(ctx.clone());
			let ct = ct.child_token();
			tasks.spawn(async move {
				let shutdown = async move { ct.cancelled().await };
				if let Err(e) = axum::serve(listener, app.router())
					.with_graceful_shutdown(shutdown)
					.await
				{
					warn!("dashboard server ended: {}", e);
				}
			});
		}

		let mut default_listener = self.default_listener;
		loop {
			tokio::select! {
				_ = ct.cancelled() => break,
				conn = default_listener.accept() => match conn {
					Some(conn) => {
						let ctx = ctx.clone();
						let child = ct.child_token();
						tokio::spawn(handle_conn(ctx, conn, child));
					},
					None => break,
				},
			}
		}
		tasks.shutdown().await;
		Ok(())
	}
}

async fn run_secondary(ctx: Arc<ServiceContext>, listener: TcpListener, ct: CancellationToken) {
	loop {
		tokio::select! {
			_ = ct.cancelled() => break,
			res = listener.accept() => match res {
				Ok((stream, _)) => {
					tokio::spawn(handle_conn(
						ctx.clone(),
						Conn::from_tcp(stream),
						ct.child_token(),
					));
				},
				Err(e) => {
					warn!("accept failed: {}", e);
					tokio::time::sleep(Duration::from_millis(100)).await;
				},
			},
		}
	}
}

async fn handle_conn(ctx: Arc<ServiceContext>, conn: Conn, ct: CancellationToken) {
	if ctx.cfg.tcp_mux {
		let ctx = ctx.clone();
		tcpmux::serve_session(conn, ct, move |stream| {
			tokio::spawn(handle_registration(ctx.clone(), stream));
		})
		.await;
	} else {
		handle_registration(ctx, conn).await;
	}
}

/// Read the connection's first framed message and dispatch on it. Anything
/// else closes the connection.
async fn handle_registration(ctx: Arc<ServiceContext>, mut conn: Conn) {
	let deadline = Duration::from_secs(ctx.cfg.user_conn_timeout);
	let first = match tokio::time::timeout(deadline, msg::read_msg(&mut conn)).await {
		Ok(Ok(m)) => m,
		Ok(Err(e)) => {
			debug!(peer = ?conn.peer_addr(), "bad first message: {}", e);
			return;
		},
		Err(_) => {
			debug!(peer = ?conn.peer_addr(), "timed out waiting for the first message");
			return;
		},
	};
	match first {
		Message::Login(login) => register_control(ctx, conn, login).await,
		Message::NewWorkConn(w) => register_work_conn(ctx, conn, w),
		Message::NewVisitorConn(v) => register_visitor_conn(ctx, conn, v).await,
		other => {
			debug!(
				peer = ?conn.peer_addr(),
				kind = other.kind(),
				"unexpected first message, closing"
			);
		},
	}
}

async fn register_control(ctx: Arc<ServiceContext>, mut conn: Conn, login: msg::Login) {
	ctx.metrics.client_logins.inc();
	if let Err(err) = check_login(&ctx.cfg, &login) {
		ctx.metrics.auth_failures.inc();
		warn!(peer = ?conn.peer_addr(), user = %login.user, "login rejected: {}", err);
		let resp = Message::LoginResp(msg::LoginResp {
			version: crate::VERSION.to_string(),
			run_id: String::new(),
			error: err.to_string(),
		});
		let _ = msg::write_msg(&mut conn, &resp).await;
		return;
	}

	let run_id = if login.run_id.is_empty() {
		new_run_id()
	} else {
		login.run_id.clone()
	};
	let peer = conn.peer_addr();
	let ctl = Control::new(ctx.clone(), run_id.clone(), peer, &login);
	if let Some(old) = ctx.controls.add(&run_id, ctl.clone()) {
		info!(%run_id, "new login takes over an existing session");
		// The old control finishes releasing its ports and proxies before
		// the replacement starts serving.
		old.close("replaced by a new login").await;
	}
	ctx.metrics.active_controls.set(ctx.controls.len() as i64);
	info!(%run_id, peer = ?peer, version = %login.version, "client logged in");
	ctl.start(conn);
}

fn check_login(cfg: &ServerConfig, login: &msg::Login) -> Result<(), LoginError> {
	if !version_compatible(&login.version) {
		return Err(LoginError::Version);
	}
	auth::validate_key(
		&cfg.token,
		&login.privilege_key,
		login.timestamp,
		auth::now_ts(),
		cfg.auth_timeout,
	)?;
	Ok(())
}

fn version_compatible(client: &str) -> bool {
	let major = |v: &str| v.split('.').next().and_then(|s| s.parse::<u64>().ok());
	match (major(client), major(crate::VERSION)) {
		(Some(c), Some(s)) => c == s,
		_ => false,
	}
}

fn new_run_id() -> String {
	format!("{:016x}", rand::rng().random::<u64>())
}

fn register_work_conn(ctx: Arc<ServiceContext>, conn: Conn, w: msg::NewWorkConn) {
	match ctx.controls.get(&w.run_id) {
		Some(ctl) => ctl.register_work_conn(conn),
		None => warn!(run_id = %w.run_id, "work connection for an unknown run id"),
	}
}

async fn register_visitor_conn(ctx: Arc<ServiceContext>, mut conn: Conn, v: msg::NewVisitorConn) {
	let checked = check_visitor(&ctx, &v);
	let resp = Message::NewVisitorConnResp(msg::NewVisitorConnResp {
		proxy_name: v.proxy_name.clone(),
		error: checked
			.as_ref()
			.err()
			.map(|e| e.to_string())
			.unwrap_or_default(),
	});
	if msg::write_msg(&mut conn, &resp).await.is_err() {
		return;
	}
	match checked {
		Ok(handle) => {
			if handle.tx.try_send(conn).is_err() {
				debug!(proxy = %v.proxy_name, "visitor queue full, dropping visitor");
			}
		},
		Err(e) => {
			debug!(proxy = %v.proxy_name, "visitor rejected: {}", e);
		},
	}
}

fn check_visitor(
	ctx: &ServiceContext,
	v: &msg::NewVisitorConn,
) -> Result<crate::registry::VisitorHandle, VisitorError> {
	let handle = ctx
		.visitors
		.get(&v.proxy_name)
		.ok_or(VisitorError::NoSuchProxy)?;
	auth::validate_key(
		&handle.sk,
		&v.sign_key,
		v.timestamp,
		auth::now_ts(),
		VISITOR_AUTH_TIMEOUT,
	)?;
	Ok(handle)
}
