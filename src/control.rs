//! Per-client session state. A `Control` owns one authenticated client: the
//! framed control channel, the pool of idle work connections, and every
//! proxy the client has registered. Three tasks run per control: a reader
//! feeding the manager, a writer draining the ordered outbound queue, and
//! the manager itself.

use crate::conn::Conn;
use crate::msg::{self, Message};
use crate::proxy::Proxy;
use crate::service::ServiceContext;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEND_QUEUE_LEN: usize = 64;
const READ_QUEUE_LEN: usize = 64;
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum WorkConnError {
	#[error("timed out waiting for a work connection")]
	Timeout,
	#[error("control is shut down")]
	Closed,
}

/// Client metadata from the login, kept for the admin snapshot.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
	pub version: String,
	pub hostname: String,
	pub os: String,
	pub arch: String,
	pub user: String,
	pub pool_count: usize,
	pub metas: HashMap<String, String>,
}

impl ClientInfo {
	pub fn from_login(login: &msg::Login) -> Self {
		Self {
			version: login.version.clone(),
			hostname: login.hostname.clone(),
			os: login.os.clone(),
			arch: login.arch.clone(),
			user: login.user.clone(),
			pool_count: login.pool_count,
			metas: login.metas.clone(),
		}
	}
}

pub struct Control {
	run_id: String,
	peer_addr: Option<SocketAddr>,
	client: ClientInfo,
	srv: Arc<ServiceContext>,

	sender: mpsc::Sender<Message>,
	send_rx: StdMutex<Option<mpsc::Receiver<Message>>>,
	work_tx: mpsc::Sender<Conn>,
	work_rx: Mutex<mpsc::Receiver<Conn>>,
	pool_capacity: usize,
	pending_pulls: AtomicUsize,

	proxies: StdMutex<HashMap<String, Arc<Proxy>>>,
	last_ping: StdMutex<Instant>,

	cancel: CancellationToken,
	closing: AtomicBool,
	done: watch::Sender<bool>,
}

impl Control {
	pub fn new(
		srv: Arc<ServiceContext>,
		run_id: String,
		peer_addr: Option<SocketAddr>,
		login: &msg::Login,
	) -> Arc<Self> {
		let pool_capacity = login
			.pool_count
			.min(srv.cfg.max_pool_count)
			.max(1);
		let (sender, send_rx) = mpsc::channel(SEND_QUEUE_LEN);
		let (work_tx, work_rx) = mpsc::channel(pool_capacity);
		let (done, _) = watch::channel(false);
		Arc::new(Self {
			run_id,
			peer_addr,
			client: ClientInfo::from_login(login),
			srv,
			sender,
			send_rx: StdMutex::new(Some(send_rx)),
			work_tx,
			work_rx: Mutex::new(work_rx),
			pool_capacity,
			pending_pulls: AtomicUsize::new(0),
			proxies: StdMutex::new(HashMap::new()),
			last_ping: StdMutex::new(Instant::now()),
			cancel: CancellationToken::new(),
			closing: AtomicBool::new(false),
			done,
		})
	}

	pub fn run_id(&self) -> &str {
		&self.run_id
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.peer_addr
	}

	pub fn client(&self) -> &ClientInfo {
		&self.client
	}

	/// Track a proxy this control now owns; it is closed with the control.
	pub(crate) fn adopt(&self, pxy: Arc<Proxy>) {
		self
			.proxies
			.lock()
			.unwrap()
			.insert(pxy.name().to_string(), pxy);
	}

	/// Ports currently held by this control's proxies.
	pub fn used_ports(&self) -> usize {
		self
			.proxies
			.lock()
			.unwrap()
			.values()
			.filter(|p| p.bound_port().is_some())
			.count()
	}

	/// Spawn the reader, writer, and manager tasks. The success `LoginResp`
	/// is the first message through the writer, so the client sees identical
	/// framing for success and failure.
	pub fn start(self: &Arc<Self>, conn: Conn) {
		let (read_half, write_half) = tokio::io::split(conn);
		let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_LEN);
		let send_rx = self
			.send_rx
			.lock()
			.unwrap()
			.take()
			.expect("control started twice");

		let resp = Message::LoginResp(msg::LoginResp {
			version: crate::VERSION.to_string(),
			run_id: self.run_id.clone(),
			error: String::new(),
		});
		// The queue is fresh; these cannot fail.
		let _ = self.sender.try_send(resp);
		for _ in 0..self.pool_capacity {
			self.request_work_conn();
		}

		tokio::spawn(Self::writer_loop(self.clone(), write_half, send_rx));
		tokio::spawn(Self::reader_loop(self.clone(), read_half, read_tx));
		tokio::spawn(Self::manager_loop(self.clone(), read_rx));
	}

	async fn reader_loop(
		self: Arc<Self>,
		mut r: ReadHalf<Conn>,
		read_tx: mpsc::Sender<Message>,
	) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				res = msg::read_msg(&mut r) => match res {
					Ok(m) => {
						if read_tx.send(m).await.is_err() {
							break;
						}
					},
					Err(e) => {
						debug!(run_id = %self.run_id, "control read ended: {}", e);
						break;
					},
				},
			}
		}
		self.close("control connection closed").await;
	}

	async fn writer_loop(
		self: Arc<Self>,
		mut w: WriteHalf<Conn>,
		mut send_rx: mpsc::Receiver<Message>,
	) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				m = send_rx.recv() => match m {
					Some(m) => {
						if let Err(e) = msg::write_msg(&mut w, &m).await {
							debug!(run_id = %self.run_id, "control write failed: {}", e);
							break;
						}
					},
					None => break,
				},
			}
		}
		self.close("control writer stopped").await;
	}

	async fn manager_loop(self: Arc<Self>, mut read_rx: mpsc::Receiver<Message>) {
		let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				_ = ticker.tick() => {
					let idle = self.last_ping.lock().unwrap().elapsed();
					if idle > Duration::from_secs(self.srv.cfg.heartbeat_timeout) {
						warn!(run_id = %self.run_id, "heartbeat timed out, tearing down control");
						break;
					}
				},
				m = read_rx.recv() => match m {
					Some(m) => self.handle_message(m).await,
					None => break,
				},
			}
		}
		self.close("control session ended").await;
	}

	async fn handle_message(self: &Arc<Self>, m: Message) {
		match m {
			Message::NewProxy(p) => {
				let name = p.proxy_name.clone();
				let resp = match Proxy::register(&self.srv, self, p).await {
					Ok((pxy, remote_addr)) => {
						info!(
							run_id = %self.run_id,
							proxy = %name,
							%remote_addr,
							"proxy registered"
						);
						self.adopt(pxy);
						msg::NewProxyResp {
							proxy_name: name,
							remote_addr,
							error: String::new(),
						}
					},
					Err(e) => {
						debug!(run_id = %self.run_id, proxy = %name, "proxy rejected: {}", e);
						msg::NewProxyResp {
							proxy_name: name,
							remote_addr: String::new(),
							error: e.to_string(),
						}
					},
				};
				self.send(Message::NewProxyResp(resp)).await;
			},
			Message::CloseProxy(c) => {
				let pxy = self.proxies.lock().unwrap().remove(&c.proxy_name);
				match pxy {
					Some(p) => {
						info!(run_id = %self.run_id, proxy = %c.proxy_name, "proxy closed by client");
						p.close(&self.srv).await;
					},
					None => warn!(
						run_id = %self.run_id,
						proxy = %c.proxy_name,
						"close for a proxy this control does not own"
					),
				}
			},
			Message::Ping(_) => {
				*self.last_ping.lock().unwrap() = Instant::now();
				self.send(Message::Pong(msg::Pong {})).await;
			},
			other => {
				warn!(
					run_id = %self.run_id,
					kind = other.kind(),
					"unexpected message on control channel"
				);
			},
		}
	}

	async fn send(&self, m: Message) {
		if self.sender.send(m).await.is_err() {
			debug!(run_id = %self.run_id, "outbound queue closed");
		}
	}

	/// Hand a freshly arrived work connection to the pool. Surplus beyond
	/// the pool capacity is closed.
	pub fn register_work_conn(&self, conn: Conn) {
		let _ = self
			.pending_pulls
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
		match self.work_tx.try_send(conn) {
			Ok(()) => {
				self.srv.metrics.work_conns.inc();
				debug!(run_id = %self.run_id, "work connection pooled");
			},
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(run_id = %self.run_id, "work pool full, dropping surplus work connection");
			},
			Err(mpsc::error::TrySendError::Closed(_)) => {},
		}
	}

	/// Ask the client for one more work connection, unless enough pulls are
	/// already outstanding.
	fn request_work_conn(&self) -> bool {
		let cap = self.pool_capacity;
		if self
			.pending_pulls
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
				(n < cap).then_some(n + 1)
			})
			.is_err()
		{
			return false;
		}
		if self
			.sender
			.try_send(Message::ReqWorkConn(msg::ReqWorkConn {}))
			.is_err()
		{
			let _ = self
				.pending_pulls
				.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
			return false;
		}
		true
	}

	/// Pop an idle work connection, or ask the client for one and wait.
	/// Every returned connection is consumed exactly once by its caller.
	pub async fn get_work_conn(&self) -> Result<Conn, WorkConnError> {
		if self.closing.load(Ordering::Acquire) {
			return Err(WorkConnError::Closed);
		}
		let wait = Duration::from_secs(self.srv.cfg.work_conn_timeout);
		let mut rx = self.work_rx.lock().await;
		match rx.try_recv() {
			Ok(conn) => {
				// Keep the pool warm for the next arrival.
				self.request_work_conn();
				return Ok(conn);
			},
			Err(mpsc::error::TryRecvError::Empty) => {},
			Err(mpsc::error::TryRecvError::Disconnected) => return Err(WorkConnError::Closed),
		}
		self.request_work_conn();
		tokio::select! {
			_ = self.cancel.cancelled() => Err(WorkConnError::Closed),
			res = tokio::time::timeout(wait, rx.recv()) => match res {
				Ok(Some(conn)) => Ok(conn),
				Ok(None) => Err(WorkConnError::Closed),
				Err(_) => {
					// The pull went unanswered; let the next arrival issue
					// a fresh one.
					let _ = self
						.pending_pulls
						.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
					Err(WorkConnError::Timeout)
				},
			},
		}
	}

	/// Tear the control down exactly once: cancel the tasks, close every
	/// owned proxy (releasing ports and routes), drain the work pool, and
	/// deregister, but only if the registry still points at this instance.
	/// Concurrent callers wait for the first to finish.
	pub async fn close(self: &Arc<Self>, reason: &str) {
		if self.closing.swap(true, Ordering::SeqCst) {
			self.wait_closed().await;
			return;
		}
		info!(run_id = %self.run_id, reason, "control shutting down");
		self.cancel.cancel();

		let proxies: Vec<Arc<Proxy>> = self
			.proxies
			.lock()
			.unwrap()
			.drain()
			.map(|(_, p)| p)
			.collect();
		for pxy in proxies {
			pxy.close(&self.srv).await;
		}

		{
			let mut rx = self.work_rx.lock().await;
			rx.close();
			while rx.try_recv().is_ok() {}
		}

		self.srv.controls.del(&self.run_id, self);
		self
			.srv
			.metrics
			.active_controls
			.set(self.srv.controls.len() as i64);
		let _ = self.done.send(true);
	}

	pub async fn wait_closed(&self) {
		let mut rx = self.done.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}

	pub fn is_closing(&self) -> bool {
		self.closing.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ServerConfig;

	fn test_ctx(pool: usize) -> (Arc<ServiceContext>, msg::Login) {
		let mut cfg = ServerConfig::default();
		cfg.token = "secret".to_string();
		cfg.work_conn_timeout = 1;
		cfg.normalize().unwrap();
		let ctx = ServiceContext::new(cfg).unwrap();
		let login = msg::Login {
			pool_count: pool,
			..Default::default()
		};
		(Arc::new(ctx), login)
	}

	fn pipe() -> (Conn, tokio::io::DuplexStream) {
		let (keep, side) = tokio::io::duplex(64);
		(Conn::new(Box::new(side), None), keep)
	}

	#[tokio::test]
	async fn pooled_work_conn_is_handed_out_in_order() {
		let (ctx, login) = test_ctx(2);
		let ctl = Control::new(ctx, "r1".to_string(), None, &login);
		let (conn, _keep) = pipe();
		ctl.register_work_conn(conn);
		assert!(ctl.get_work_conn().await.is_ok());
	}

	#[tokio::test]
	async fn empty_pool_times_out_and_requests_exactly_one_pull() {
		let (ctx, login) = test_ctx(1);
		let ctl = Control::new(ctx, "r1".to_string(), None, &login);
		let mut send_rx = ctl.send_rx.lock().unwrap().take().unwrap();

		let start = Instant::now();
		assert!(matches!(
			ctl.get_work_conn().await,
			Err(WorkConnError::Timeout)
		));
		assert!(start.elapsed() >= Duration::from_secs(1));

		// One ReqWorkConn for the unanswered pull, nothing else queued.
		assert!(matches!(
			send_rx.try_recv(),
			Ok(Message::ReqWorkConn(_))
		));
		assert!(send_rx.try_recv().is_err());

		// The abandoned pull does not suppress the next arrival's request.
		assert!(matches!(
			ctl.get_work_conn().await,
			Err(WorkConnError::Timeout)
		));
		assert!(matches!(
			send_rx.try_recv(),
			Ok(Message::ReqWorkConn(_))
		));
	}

	#[tokio::test]
	async fn surplus_work_conns_are_dropped_not_queued() {
		let (ctx, login) = test_ctx(1);
		let ctl = Control::new(ctx, "r1".to_string(), None, &login);
		let (first, _keep_first) = pipe();
		let (second, _keep_second) = pipe();
		ctl.register_work_conn(first);
		ctl.register_work_conn(second);
		assert!(ctl.get_work_conn().await.is_ok());
		// Only the first one made it into the pool.
		assert!(matches!(
			ctl.get_work_conn().await,
			Err(WorkConnError::Timeout)
		));
	}

	#[tokio::test]
	async fn close_is_idempotent_and_wakes_waiters() {
		let (ctx, login) = test_ctx(1);
		let ctl = Control::new(ctx.clone(), "r1".to_string(), None, &login);
		ctx.controls.add("r1", ctl.clone());
		ctl.close("test").await;
		ctl.close("test again").await;
		assert!(ctx.controls.get("r1").is_none());
		assert!(matches!(
			ctl.get_work_conn().await,
			Err(WorkConnError::Closed)
		));
	}
}
