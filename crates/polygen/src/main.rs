//! Process bootstrap: load config, wire up the registry/topology/store,
//! spawn the detector, demand, and control-plane tasks, and shut down
//! gracefully on Ctrl+C. Grounded on `apps/servers/file_host/src/main.rs`'s
//! `init_tracing`/`CancellationToken` shutdown pattern.

use anyhow::{Context, Result};
use clap::Parser;
use polygen::config::{Cli, EngineConfig, RawConfig};
use polygen::control::{self, RELOAD_LIMITS_REQUEST};
use polygen::detector::{self, BlockedUserTable, ProxyQueues};
use polygen::dispatch::ProxyDispatcher;
use polygen::limits::LimitRegistry;
use polygen::metrics::EngineMetrics;
use polygen::store::UsageStore;
use polygen::topology::Topology;
use polygen::{bookkeeper::Bookkeeper, demand};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::JsonFields;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

fn init_tracing(config: &EngineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
	let level = if config.log_level.is_empty() { "info" } else { config.log_level.as_str() };
	let filter = EnvFilter::from_str(level).unwrap_or_else(|_| EnvFilter::new("info"));

	let (writer, guard) = match &config.log_file_name {
		Some(path) => {
			let directory = std::path::Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
			let file_name = std::path::Path::new(path).file_name().map_or_else(|| "polygen.log".to_string(), |n| n.to_string_lossy().into_owned());
			// tracing-appender rotates by calendar day, not by size; this is the
			// closest fit to the source's size-based RotatingFileHandler.
			let appender = tracing_appender::rolling::RollingFileAppender::new(tracing_appender::rolling::Rotation::DAILY, directory, file_name);
			tracing_appender::non_blocking(appender)
		}
		None => tracing_appender::non_blocking(std::io::stdout()),
	};

	tracing_subscriber::registry()
		.with(if config.log_json {
			Box::new(
				tracing_subscriber::fmt::layer()
					.with_writer(writer)
					.fmt_fields(JsonFields::default())
					.event_format(tracing_subscriber::fmt::format().json().flatten_event(true).with_span_list(false))
					.with_filter(filter),
			) as Box<dyn Layer<_> + Send + Sync>
		} else {
			Box::new(tracing_subscriber::fmt::layer().with_writer(writer).event_format(tracing_subscriber::fmt::format().pretty()).with_filter(filter))
		})
		.init();

	Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let raw = RawConfig::load(&cli.config_file).with_context(|| format!("loading config from {}", cli.config_file.display()))?;
	let config = Arc::new(EngineConfig::from(raw));

	let _log_guard = init_tracing(&config);
	tracing::info!(zone = %config.zone, "polygen starting up");

	let topology = Arc::new(Topology::from_config(&config));
	let metrics = EngineMetrics::new().context("registering metrics")?;

	let cache_path = config.cache_limits_path();
	let initial_limits = LimitRegistry::load_from_disk(&cache_path);
	let registry = Arc::new(LimitRegistry::new(initial_limits, &config));

	let store = UsageStore::connect(&config.redis_server, &config.polygen_lua_path).await.context("connecting to redis")?;

	let reload_fifo = config.reload_fifo_path();
	control::ensure_fifo(&reload_fifo).with_context(|| format!("creating reload fifo at {}", reload_fifo.display()))?;
	tracing::info!(path = %reload_fifo.display(), command = RELOAD_LIMITS_REQUEST, "control fifo ready");

	let shutdown = CancellationToken::new();

	let mut queues: ProxyQueues = HashMap::new();
	for endpoint in topology.endpoints() {
		let handles = topology
			.proxies_for(endpoint)
			.iter()
			.map(|instance| ProxyDispatcher::new(instance.clone(), config.policy_msg_queue_size).spawn_writer(config.sleep_time, metrics.clone(), shutdown.clone()))
			.collect();
		queues.insert(endpoint.clone(), handles);
	}
	let queues = Arc::new(queues);

	let bookkeeper = Arc::new(Mutex::new(Bookkeeper::new()));
	let blocked = Arc::new(Mutex::new(BlockedUserTable::new()));

	let mut tasks = Vec::new();
	tasks.push(tokio::spawn(control::watch_reload_fifo(reload_fifo.clone(), Arc::clone(&registry))));
	tasks.push(tokio::spawn(detector::run_verb_loop(
		store.clone(),
		Arc::clone(&registry),
		Arc::clone(&bookkeeper),
		Arc::clone(&queues),
		metrics.clone(),
		Arc::clone(&config),
		shutdown.clone(),
	)));
	tasks.push(tokio::spawn(detector::run_connection_loop(
		store.clone(),
		Arc::clone(&registry),
		bookkeeper,
		blocked,
		queues,
		metrics.clone(),
		Arc::clone(&config),
		shutdown.clone(),
	)));
	tasks.push(tokio::spawn(demand::run_demand_loop(store, registry, topology, metrics, Arc::clone(&config), shutdown.clone())));

	let signal_shutdown = shutdown.clone();
	tokio::spawn(async move {
		tokio::signal::ctrl_c().await.ok();
		tracing::info!("received ctrl-c, shutting down");
		signal_shutdown.cancel();
	});

	shutdown.cancelled().await;

	let drain = async {
		for task in tasks {
			let _ = task.await;
		}
	};
	if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
		tracing::warn!("shutdown timed out waiting for tasks, exiting anyway");
	}

	tracing::info!("polygen shutdown complete");
	Ok(())
}
