//! HTTP reverse proxy. Each inbound connection is served as an http1
//! connection; every request is matched against the vhost routing table and
//! forwarded over a work connection pulled from the owning control. Upgrade
//! requests (WebSocket) fall through to byte-level splicing once both sides
//! have agreed to switch protocols.

use crate::conn::Conn;
use crate::metrics::Metrics;
use crate::msg::{self, Message};
use crate::muxer::Acceptor;
use crate::vhost::VhostRouter;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

const NOT_FOUND_PAGE: &str = "<html><body><h1>404</h1><p>The page you visited was not found; the tunnel serving it may be offline.</p></body></html>";

pub struct HttpVhost {
	router: Arc<VhostRouter>,
	request_timeout: Duration,
	metrics: Metrics,
}

impl HttpVhost {
	pub fn new(router: Arc<VhostRouter>, request_timeout: Duration, metrics: Metrics) -> Arc<Self> {
		Arc::new(Self {
			router,
			request_timeout,
			metrics,
		})
	}

	pub async fn serve(self: Arc<Self>, mut acceptor: Acceptor, ct: CancellationToken) {
		loop {
			tokio::select! {
				_ = ct.cancelled() => break,
				conn = acceptor.accept() => match conn {
					Some(conn) => {
						let vh = self.clone();
						tokio::spawn(vh.serve_conn(conn));
					},
					None => break,
				},
			}
		}
	}

	async fn serve_conn(self: Arc<Self>, conn: Conn) {
		let io = TokioIo::new(conn);
		let vh = self.clone();
		let service = service_fn(move |req| {
			let vh = vh.clone();
			async move { vh.proxy_request(req).await }
		});
		let served = hyper::server::conn::http1::Builder::new()
			.preserve_header_case(true)
			.serve_connection(io, service)
			.with_upgrades()
			.await;
		if let Err(e) = served {
			debug!("vhost http connection ended: {}", e);
		}
	}

	async fn proxy_request(
		self: Arc<Self>,
		mut req: Request<Incoming>,
	) -> Result<Response<ProxyBody>, Infallible> {
		self.metrics.vhost_requests.inc();
		let Some(host) = request_host(&req) else {
			return Ok(synthesized(StatusCode::NOT_FOUND, NOT_FOUND_PAGE));
		};
		let path = req.uri().path().to_string();
		let Some(route) = self.router.resolve(&host, &path) else {
			debug!(%host, %path, "no vhost route");
			return Ok(synthesized(StatusCode::NOT_FOUND, NOT_FOUND_PAGE));
		};
		let Some(ctl) = route.ctl.upgrade() else {
			return Ok(synthesized(StatusCode::NOT_FOUND, NOT_FOUND_PAGE));
		};

		let mut work = match ctl.get_work_conn().await {
			Ok(w) => w,
			Err(e) => {
				warn!(%host, proxy = %route.proxy_name, "request failed: {}", e);
				return Ok(synthesized(StatusCode::GATEWAY_TIMEOUT, ""));
			},
		};
		let start = Message::StartWorkConn(msg::StartWorkConn {
			proxy_name: route.proxy_name.clone(),
		});
		if msg::write_msg(&mut work, &start).await.is_err() {
			return Ok(synthesized(StatusCode::BAD_GATEWAY, ""));
		}

		if let Some(rewrite) = &route.host_header_rewrite {
			if let Ok(value) = http::HeaderValue::from_str(rewrite) {
				req.headers_mut().insert(http::header::HOST, value);
			}
		}

		let wants_upgrade = req.headers().contains_key(http::header::UPGRADE);
		let client_upgrade = wants_upgrade.then(|| hyper::upgrade::on(&mut req));

		let result = tokio::time::timeout(self.request_timeout, async move {
			let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
				.preserve_header_case(true)
				.handshake(TokioIo::new(work))
				.await?;
			tokio::spawn(async move {
				if let Err(e) = conn.with_upgrades().await {
					debug!("work connection ended: {}", e);
				}
			});
			sender.send_request(req).await
		})
		.await;

		let mut resp = match result {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				debug!(%host, "upstream request failed: {}", e);
				return Ok(synthesized(StatusCode::BAD_GATEWAY, ""));
			},
			Err(_) => {
				debug!(%host, "request timed out");
				return Ok(synthesized(StatusCode::GATEWAY_TIMEOUT, ""));
			},
		};

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			if let Some(client_upgrade) = client_upgrade {
				let server_upgrade = hyper::upgrade::on(&mut resp);
				tokio::spawn(async move {
					let (downstream, upstream) = match (client_upgrade.await, server_upgrade.await) {
						(Ok(c), Ok(s)) => (c, s),
						(Err(e), _) | (_, Err(e)) => {
							debug!("upgrade failed: {}", e);
							return;
						},
					};
					let mut downstream = TokioIo::new(downstream);
					let mut upstream = TokioIo::new(upstream);
					if let Err(e) = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
						debug!("upgraded session ended: {}", e);
					}
				});
			}
		}

		Ok(resp.map(|b| b.boxed()))
	}
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
	let raw = match req.headers().get(http::header::HOST) {
		Some(v) => v.to_str().ok()?.to_string(),
		None => req.uri().authority()?.to_string(),
	};
	let host = raw.split(':').next().unwrap_or(raw.as_str());
	if host.is_empty() {
		return None;
	}
	Some(host.to_ascii_lowercase())
}

fn synthesized(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/html")
		.body(Full::new(Bytes::from_static(body.as_bytes())).map_err(|e| match e {}).boxed())
		.unwrap()
}
