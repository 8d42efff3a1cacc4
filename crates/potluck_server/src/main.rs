#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use potluck_domain::SessionId;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use potluck_server::quic::config::QuicServerConfig;
use potluck_server::server::broadcast::{BroadcastEngine, EngineConfig};
use potluck_server::server::connection::{ConnectionSettings, handle_connection};
use potluck_server::server::health::{HealthState, spawn_health_server};
use potluck_server::server::registry::{RegistryConfig, RoomRegistry};
use potluck_server::server::session::SessionTable;
use potluck_server::server::store::{PersistentMessageStore, StoreService};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: potluck_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18303)\n\
\t         Format: quic://host:port\n\
\t--config  Config file path (default: ~/.potluck/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind_addr: SocketAddr,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18303".to_string();
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind_addr = parse_quic_bind(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind_addr, config_path }
}

fn parse_quic_bind(endpoint: &str) -> anyhow::Result<SocketAddr> {
	let rest = endpoint
		.strip_prefix("quic://")
		.ok_or_else(|| anyhow::anyhow!("bind endpoint must start with quic:// (got {endpoint:?})"))?;

	rest.parse::<SocketAddr>()
		.map_err(|e| anyhow::anyhow!("invalid bind address {rest:?}: {e}"))
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,potluck_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("potluck_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => potluck_server::config::default_config_path()?,
	};
	let server_cfg = potluck_server::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(args.bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind_addr,
			cert_der_len = server_cert_der.len(),
			"potluck_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings::from_config(&server_cfg)?;

	let store = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let backend = PersistentMessageStore::connect(database_url).await?;
		info!("message store connected (persistent)");
		StoreService::persistent(backend)
	} else {
		info!("message store running in memory");
		StoreService::in_memory()
	};

	let registry = RoomRegistry::new(RegistryConfig {
		create_on_demand: server_cfg.registry.create_on_demand,
	});
	for seed in &server_cfg.rooms {
		registry.seed(seed.room.clone(), seed.visibility.clone()).await;
	}
	info!(rooms = server_cfg.rooms.len(), "room catalog seeded");

	let engine = BroadcastEngine::new(
		registry,
		SessionTable::new(),
		store,
		EngineConfig {
			history_limit: server_cfg.server.history_limit,
		},
	);

	health_state.mark_ready();

	let mut next_session_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let session_id = SessionId(next_session_id);
		next_session_id += 1;
		metrics::counter!("potluck_server_connections_total").increment(1);

		let engine = engine.clone();
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(session = %session_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(session_id, connection, engine, conn_settings).await {
						warn!(session = %session_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(session = %session_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
