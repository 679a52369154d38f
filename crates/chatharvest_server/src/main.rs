#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::PersistenceSettings;
use crate::server::buffered::BufferedSink;
use crate::server::http::HttpState;
use crate::server::hub::{DEFAULT_SUBSCRIBER_CAPACITY, Hub};
use crate::server::metrics::{HttpMetrics, HubMetrics, SinkMetrics};
use crate::server::middleware::{CorsPolicy, IpRateLimiter};
use crate::server::store::{MemoryStore, Sink, SqliteStore, Store};
use crate::server::supervisor::{Ingest, Supervisor, build_receivers};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatharvest [--config <path>] [--http-bind host:port]\n\
\n\
Options:\n\
\t--config     Config file (default: ~/.chatharvest/config.toml)\n\
\t--http-bind  HTTP listen address (default: {})\n\
\t--help       Show this help\n\
",
		config::DEFAULT_HTTP_BIND
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
	http_bind: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config: None,
		http_bind: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--http-bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.parse::<SocketAddr>().is_err() {
					eprintln!("--http-bind expects host:port, got {v:?}");
					usage_and_exit();
				}
				args.http_bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatharvest_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("chatharvest_server");
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

async fn open_store(persistence: &PersistenceSettings) -> anyhow::Result<(Arc<dyn Sink>, Arc<dyn Store>)> {
	match persistence.database_url.as_deref() {
		Some(url) => {
			let store = Arc::new(SqliteStore::connect(url).await?);
			let sink: Arc<dyn Sink> = store.clone();
			let store: Arc<dyn Store> = store;
			Ok((sink, store))
		}
		None => {
			info!(
				max_rows = persistence.memory_max_rows,
				"no persistence.database_url; keeping recent messages in memory"
			);
			let store = Arc::new(MemoryStore::with_max_rows(persistence.memory_max_rows));
			let sink: Arc<dyn Sink> = store.clone();
			let store: Arc<dyn Store> = store;
			Ok((sink, store))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.http_bind {
		cfg.server.http_bind = bind;
	}
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	let recorder = Arc::new(PrometheusBuilder::new().build_recorder());
	let prometheus = recorder.handle();

	let (root_trigger, shutdown) = chatharvest_util::shutdown::channel();

	let (sink, store) = open_store(&cfg.persistence).await?;
	let sink_metrics = SinkMetrics::register(recorder.as_ref());
	let (sink_trigger, sink_shutdown) = chatharvest_util::shutdown::channel();
	let mut flusher = None;
	let buffered = (cfg.persistence.database_url.is_some() && cfg.persistence.is_buffered()).then(|| {
		let buffered = Arc::new(BufferedSink::new(sink.clone(), cfg.persistence.batch_size, sink_metrics.clone()));
		if !cfg.persistence.flush_max.is_zero() {
			flusher = Some(buffered.spawn_flusher(cfg.persistence.flush_max, sink_shutdown.clone()));
		}
		info!(
			batch_size = cfg.persistence.batch_size,
			flush_max_ms = cfg.persistence.flush_max.as_millis() as u64,
			"buffering sink writes"
		);
		buffered
	});
	let sink: Arc<dyn Sink> = match &buffered {
		Some(buffered) => Arc::clone(buffered) as Arc<dyn Sink>,
		None => sink,
	};
	let hub = Hub::new(DEFAULT_SUBSCRIBER_CAPACITY, HubMetrics::register(recorder.as_ref()));

	let receivers = build_receivers(&cfg, recorder.as_ref(), &shutdown).await?;
	let mut ingest = Ingest::new(sink, hub.clone(), sink_metrics.clone());
	if let Some((channel, enricher)) = receivers.badge_enricher.clone() {
		ingest = ingest.with_badge_enricher(channel, enricher);
	}

	let mut http_state = HttpState::new(store, hub.clone());
	http_state.prometheus = Some(prometheus);
	http_state.reloader = receivers.reloader.clone();
	http_state.metrics = HttpMetrics::register(recorder.clone());
	http_state.access_log = cfg.server.access_log;
	http_state.cors = CorsPolicy::new(&cfg.server.cors_origins);
	http_state.rate_limit = IpRateLimiter::new(cfg.server.rate_limit_rps, cfg.server.rate_limit_burst);
	let http_state = Arc::new(http_state);

	let listener = TcpListener::bind(&cfg.server.http_bind)
		.await
		.with_context(|| format!("bind http listener on {}", cfg.server.http_bind))?;
	info!(addr = %listener.local_addr()?, "http server listening");
	let http_task = tokio::spawn(server::http::serve(listener, Arc::clone(&http_state), shutdown.clone()));

	let supervisor = Supervisor::new(receivers, Arc::new(ingest), cfg.server.shutdown_grace);
	let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));
	http_state.health.mark_ready();

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");
	root_trigger.trigger();
	hub.shutdown();

	if let Err(err) = supervisor_task.await {
		warn!(error = %err, "supervisor task failed");
	}
	sink_trigger.trigger();
	if let Some(task) = flusher
		&& let Err(err) = task.await
	{
		warn!(error = %err, "sink flusher task failed");
	}
	if let Some(buffered) = &buffered
		&& let Err(err) = buffered.flush().await
	{
		sink_metrics.write_errors.increment(1);
		warn!(error = ?err, "final sink flush failed");
	}
	match http_task.await {
		Ok(Err(err)) => warn!(error = ?err, "http server failed"),
		Err(err) => warn!(error = %err, "http server task failed"),
		Ok(Ok(())) => {}
	}

	info!("shutdown complete");
	Ok(())
}
