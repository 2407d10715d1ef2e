//! Single-port demultiplexing. The first bytes of every accepted connection
//! are sniffed under a deadline and the connection is routed to the first
//! matching sub-listener; everything unmatched (including sniff timeouts)
//! lands on the default sub-listener carrying the framed control protocol.

use crate::conn::Conn;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many leading bytes a matcher may look at.
pub const PEEK_LEN: usize = 8;
/// Bounded accept queue per sub-listener; overflow drops the connection.
pub const SUB_QUEUE_LEN: usize = 64;

pub type MatchFn = fn(&[u8]) -> bool;

struct Matcher {
	name: &'static str,
	matches: MatchFn,
	tx: mpsc::Sender<Conn>,
}

pub struct SubListener {
	name: &'static str,
	rx: mpsc::Receiver<Conn>,
}

impl SubListener {
	/// Returns `None` once the muxer has shut down.
	pub async fn accept(&mut self) -> Option<Conn> {
		self.rx.recv().await
	}

	pub fn name(&self) -> &'static str {
		self.name
	}
}

pub struct Muxer {
	listener: TcpListener,
	peek_timeout: Duration,
	matchers: Vec<Matcher>,
	default_tx: mpsc::Sender<Conn>,
	default_rx: Option<mpsc::Receiver<Conn>>,
}

impl Muxer {
	pub fn new(listener: TcpListener, peek_timeout: Duration) -> Self {
		let (default_tx, default_rx) = mpsc::channel(SUB_QUEUE_LEN);
		Self {
			listener,
			peek_timeout,
			matchers: Vec::new(),
			default_tx,
			default_rx: Some(default_rx),
		}
	}

	/// Matchers are tried in registration order; the first hit claims the
	/// connection.
	pub fn register(&mut self, name: &'static str, matches: MatchFn) -> SubListener {
		let (tx, rx) = mpsc::channel(SUB_QUEUE_LEN);
		self.matchers.push(Matcher { name, matches, tx });
		SubListener { name, rx }
	}

	pub fn default_listener(&mut self) -> SubListener {
		SubListener {
			name: "default",
			rx: self
				.default_rx
				.take()
				.expect("default listener taken twice"),
		}
	}

	pub async fn run(self, ct: CancellationToken) {
		let matchers = Arc::new(self.matchers);
		let default_tx = self.default_tx;
		let peek_timeout = self.peek_timeout;
		loop {
			tokio::select! {
				_ = ct.cancelled() => break,
				res = self.listener.accept() => match res {
					Ok((stream, addr)) => {
						debug!(%addr, "connection accepted");
						let matchers = matchers.clone();
						let default_tx = default_tx.clone();
						tokio::spawn(async move {
							sniff(stream, peek_timeout, matchers, default_tx).await;
						});
					},
					Err(e) => {
						warn!("accept failed: {}", e);
						tokio::time::sleep(Duration::from_millis(100)).await;
					},
				},
			}
		}
	}
}

async fn sniff(
	mut stream: TcpStream,
	peek_timeout: Duration,
	matchers: Arc<Vec<Matcher>>,
	default_tx: mpsc::Sender<Conn>,
) {
	let mut buf = [0u8; PEEK_LEN];
	let mut n = 0;
	let deadline = tokio::time::Instant::now() + peek_timeout;
	while n < PEEK_LEN {
		match tokio::time::timeout_at(deadline, stream.read(&mut buf[n..])).await {
			Ok(Ok(0)) => break,
			Ok(Ok(read)) => n += read,
			// Sniff timeouts and errors fall through to the default
			// listener with whatever was read.
			Ok(Err(_)) | Err(_) => break,
		}
	}

	let mut conn = Conn::from_tcp(stream);
	if n > 0 {
		conn.rewind(Bytes::copy_from_slice(&buf[..n]));
	}
	match matchers.iter().find(|m| (m.matches)(&buf[..n])) {
		Some(m) => deliver(&m.tx, conn, m.name),
		None => deliver(&default_tx, conn, "default"),
	}
}

fn deliver(tx: &mpsc::Sender<Conn>, conn: Conn, name: &'static str) {
	match tx.try_send(conn) {
		Ok(()) => {},
		Err(mpsc::error::TrySendError::Full(conn)) => {
			warn!(
				listener = name,
				peer = ?conn.peer_addr(),
				"sub-listener queue full, dropping connection"
			);
		},
		Err(mpsc::error::TrySendError::Closed(_)) => {},
	}
}

/// TLS ClientHello: record type 0x16, major version 3.
pub fn match_https(prefix: &[u8]) -> bool {
	prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && prefix[2] <= 0x04
}

const HTTP_METHODS: [&[u8]; 9] = [
	b"GET ",
	b"POST ",
	b"PUT ",
	b"DELETE ",
	b"HEAD ",
	b"OPTIONS ",
	b"PATCH ",
	b"TRACE ",
	b"CONNECT ",
];

pub fn match_http(prefix: &[u8]) -> bool {
	HTTP_METHODS.iter().any(|m| prefix.starts_with(m))
}

/// A listener for external user traffic: either a dedicated TCP port or a
/// sub-listener of the shared muxed port.
pub enum Acceptor {
	Direct(TcpListener),
	Sub(SubListener),
}

impl Acceptor {
	pub async fn accept(&mut self) -> Option<Conn> {
		match self {
			Acceptor::Direct(listener) => loop {
				match listener.accept().await {
					Ok((stream, _)) => return Some(Conn::from_tcp(stream)),
					Err(e) => {
						warn!("accept failed: {}", e);
						tokio::time::sleep(Duration::from_millis(100)).await;
					},
				}
			},
			Acceptor::Sub(sub) => sub.accept().await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpStream;

	#[test]
	fn https_matcher_wants_a_client_hello() {
		assert!(match_https(&[0x16, 0x03, 0x01, 0x00, 0x05]));
		assert!(match_https(&[0x16, 0x03, 0x04, 0xff, 0xff]));
		assert!(!match_https(&[0x16, 0x02, 0x01, 0x00, 0x05]));
		assert!(!match_https(b"GET / HT"));
		assert!(!match_https(&[0x16]));
	}

	#[test]
	fn http_matcher_wants_a_method_token() {
		assert!(match_http(b"GET / HT"));
		assert!(match_http(b"OPTIONS "));
		assert!(!match_http(b"GETX/ HT"));
		assert!(!match_http(&[b'o', 0, 0, 0, 0, 0, 0, 0]));
	}

	#[tokio::test]
	async fn routes_by_first_bytes_and_replays_them() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let mut muxer = Muxer::new(listener, Duration::from_secs(1));
		let mut https = muxer.register("https", match_https);
		let mut http = muxer.register("http", match_http);
		let mut default = muxer.default_listener();
		let ct = CancellationToken::new();
		tokio::spawn(muxer.run(ct.clone()));

		let mut c = TcpStream::connect(addr).await.unwrap();
		c.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
		let mut conn = http.accept().await.unwrap();
		let mut buf = [0u8; 16];
		conn.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"GET / HTTP/1.1\r\n");

		let mut c2 = TcpStream::connect(addr).await.unwrap();
		c2.write_all(&[0x16, 0x03, 0x01, 0x01, 0x00, 0x01, 0x00, 0x00])
			.await
			.unwrap();
		let mut conn = https.accept().await.unwrap();
		let mut buf = [0u8; 8];
		conn.read_exact(&mut buf).await.unwrap();
		assert_eq!(buf[0], 0x16);

		let mut c3 = TcpStream::connect(addr).await.unwrap();
		c3.write_all(&[b'o', 0, 0, 0, 0, 0, 0, 0, 2]).await.unwrap();
		let mut conn = default.accept().await.unwrap();
		let mut buf = [0u8; 9];
		conn.read_exact(&mut buf).await.unwrap();
		assert_eq!(buf[0], b'o');

		ct.cancel();
		drop((c, c2, c3));
	}

	#[tokio::test]
	async fn short_writes_route_to_default_after_the_peek_deadline() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let mut muxer = Muxer::new(listener, Duration::from_millis(100));
		let _http = muxer.register("http", match_http);
		let mut default = muxer.default_listener();
		let ct = CancellationToken::new();
		tokio::spawn(muxer.run(ct.clone()));

		let mut c = TcpStream::connect(addr).await.unwrap();
		c.write_all(b"GE").await.unwrap();
		let mut conn = default.accept().await.unwrap();
		let mut buf = [0u8; 2];
		conn.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"GE");
		ct.cancel();
	}
}
