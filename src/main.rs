use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};
use tungate::config::ServerConfig;
use tungate::service::Service;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from a literal JSON string
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();

	let cfg: ServerConfig = match (args.file, args.config) {
		(Some(filename), None) => ServerConfig::load(&filename).await?,
		(None, Some(config)) => ServerConfig::from_str(&config)?,
		(Some(_), Some(_)) => {
			eprintln!("config error: both --file and --config cannot be provided, exiting");
			std::process::exit(1);
		},
		(None, None) => {
			let mut cfg = ServerConfig::default();
			cfg.normalize()?;
			cfg
		},
	};

	let bound = Service::bind(cfg).await?;
	let ct = CancellationToken::new();

	let shutdown = ct.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("shutting down");
			shutdown.cancel();
		}
	});

	bound.serve(ct).await
}
