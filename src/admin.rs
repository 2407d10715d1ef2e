use crate::service::ServiceContext;
use axum::{Router, extract::State, http::HeaderMap, http::StatusCode, routing::get};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use prometheus_client::encoding::text::encode;
use serde::Serialize;
use std::sync::Arc;

/// Observability endpoints served on the dashboard listener: Prometheus
/// metrics plus JSON snapshots of the live controls and proxies.
#[derive(Clone)]
pub struct App {
	ctx: Arc<ServiceContext>,
}

impl App {
	pub fn new(ctx: Arc<ServiceContext>) -> Self {
		Self { ctx }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/metrics", get(metrics_handler))
			.route("/api/serverinfo", get(serverinfo_handler))
			.route("/api/controls", get(controls_handler))
			.route("/api/proxies", get(proxies_handler))
			.with_state(self.clone())
	}
}

fn authorized(ctx: &ServiceContext, headers: &HeaderMap) -> bool {
	let (user, pwd) = (&ctx.cfg.dashboard_user, &ctx.cfg.dashboard_pwd);
	if user.is_empty() || pwd.is_empty() {
		return true;
	}
	let Some(value) = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
	else {
		return false;
	};
	let Some(encoded) = value.strip_prefix("Basic ") else {
		return false;
	};
	match STANDARD.decode(encoded) {
		Ok(decoded) => decoded == format!("{}:{}", user, pwd).into_bytes(),
		Err(_) => false,
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo {
	version: &'static str,
	bind_port: u16,
	uptime_secs: u64,
	control_count: usize,
	proxy_count: usize,
}

async fn metrics_handler(State(app): State<App>, headers: HeaderMap) -> Result<String, StatusCode> {
	if !authorized(&app.ctx, &headers) {
		return Err(StatusCode::UNAUTHORIZED);
	}
	let mut buffer = String::new();
	encode(&mut buffer, &app.ctx.prom).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}

async fn serverinfo_handler(
	State(app): State<App>,
	headers: HeaderMap,
) -> Result<String, StatusCode> {
	if !authorized(&app.ctx, &headers) {
		return Err(StatusCode::UNAUTHORIZED);
	}
	let info = ServerInfo {
		version: crate::VERSION,
		bind_port: app.ctx.cfg.bind_port,
		uptime_secs: app.ctx.started.elapsed().as_secs(),
		control_count: app.ctx.controls.len(),
		proxy_count: app.ctx.proxies.len(),
	};
	serde_json::to_string(&info).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlSnapshot {
	run_id: String,
	peer_addr: Option<String>,
	#[serde(flatten)]
	client: crate::control::ClientInfo,
}

async fn controls_handler(
	State(app): State<App>,
	headers: HeaderMap,
) -> Result<String, StatusCode> {
	if !authorized(&app.ctx, &headers) {
		return Err(StatusCode::UNAUTHORIZED);
	}
	let controls: Vec<ControlSnapshot> = app
		.ctx
		.controls
		.all()
		.into_iter()
		.map(|ctl| ControlSnapshot {
			run_id: ctl.run_id().to_string(),
			peer_addr: ctl.peer_addr().map(|a| a.to_string()),
			client: ctl.client().clone(),
		})
		.collect();
	serde_json::to_string(&controls).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn proxies_handler(
	State(app): State<App>,
	headers: HeaderMap,
) -> Result<String, StatusCode> {
	if !authorized(&app.ctx, &headers) {
		return Err(StatusCode::UNAUTHORIZED);
	}
	serde_json::to_string(&app.ctx.proxies.snapshot()).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ServerConfig;

	fn ctx_with_auth(user: &str, pwd: &str) -> Arc<ServiceContext> {
		let mut cfg = ServerConfig::default();
		cfg.dashboard_user = user.to_string();
		cfg.dashboard_pwd = pwd.to_string();
		cfg.normalize().unwrap();
		Arc::new(ServiceContext::new(cfg).unwrap())
	}

	#[test]
	fn open_dashboard_needs_no_credentials() {
		let ctx = ctx_with_auth("", "");
		assert!(authorized(&ctx, &HeaderMap::new()));
	}

	#[test]
	fn basic_auth_is_checked_when_configured() {
		let ctx = ctx_with_auth("admin", "pw");
		assert!(!authorized(&ctx, &HeaderMap::new()));

		let mut headers = HeaderMap::new();
		let value = format!("Basic {}", STANDARD.encode("admin:pw"));
		headers.insert(
			axum::http::header::AUTHORIZATION,
			value.parse().unwrap(),
		);
		assert!(authorized(&ctx, &headers));

		let mut headers = HeaderMap::new();
		let value = format!("Basic {}", STANDARD.encode("admin:nope"));
		headers.insert(
			axum::http::header::AUTHORIZATION,
			value.parse().unwrap(),
		);
		assert!(!authorized(&ctx, &headers));
	}
}
