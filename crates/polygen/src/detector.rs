//! Epoch scan and violation detection: the verb/throughput loop and the
//! connection loop, grounded on `policy_generator.py`'s `check_loop`,
//! `_check_violation_per_key_verb`, and `_check_all_conn_key_violations`.
//! Both loops share one [`LimitRegistry`] and one [`Bookkeeper`], per
//! SPEC_FULL §4.2's "two independent periodic loops share the registry and
//! the bookkeeper" — the bookkeeper is therefore guarded by a mutex here
//! rather than thread-confined to a single task.

use crate::bookkeeper::Bookkeeper;
use crate::config::EngineConfig;
use crate::dispatch::{self, ProxyQueueHandle};
use crate::error::PolygenError;
use crate::key_parser::{parse_connection_key, parse_verb_key};
use crate::limits::LimitRegistry;
use crate::metrics::EngineMetrics;
use crate::model::{ConnectionRecord, Endpoint, UsageCategory, UserKey, MB};
use crate::store::UsageStore;
use crate::timer::LoopTimer;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-endpoint outbound queues, one entry per proxy instance behind that
/// endpoint. Built once at startup from [`crate::topology::Topology`].
pub type ProxyQueues = HashMap<Endpoint, Vec<ProxyQueueHandle>>;

fn now_epoch_seconds() -> Result<f64, PolygenError> {
	Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
}

fn round1(value: f64) -> f64 {
	(value * 10.0).round() / 10.0
}

/// Pages through `pattern` via `SCAN`, deduplicating results (the source
/// notes `SCAN` may return duplicates across pages). If
/// `abort_if_second_changes_from` is set and the wall clock crosses into a
/// new second mid-scan, returns `Ok(None)` so the caller discards the
/// partial result rather than acting on a stale epoch (SPEC_FULL §4.2.1
/// step 2).
async fn scan_keys(store: &UsageStore, pattern: &str, batch_size: usize, abort_if_second_changes_from: Option<i64>) -> Result<Option<HashSet<String>>, PolygenError> {
	let mut cursor = 0u64;
	let mut keys = HashSet::new();
	loop {
		let (next_cursor, page) = store.scan_page(cursor, pattern, batch_size).await?;
		keys.extend(page);

		if let Some(epoch_sec) = abort_if_second_changes_from {
			#[allow(clippy::cast_possible_truncation)]
			let now = now_epoch_seconds()? as i64;
			if now != epoch_sec {
				debug!(pattern, "scan spilled into the next second, discarding partial result");
				return Ok(None);
			}
		}

		cursor = next_cursor;
		if cursor == 0 {
			break;
		}
	}
	Ok(Some(keys))
}

struct VerbViolation {
	endpoint: Endpoint,
	category: UsageCategory,
	user: UserKey,
	diff_ratio: f64,
}

/// Evaluates one `verb_*` key's flat `[field, value, field, value, …]`
/// fetch result against configured limits, returning every category the
/// user is currently over.
fn evaluate_verb_fields(registry: &LimitRegistry, key: &str, fields: &[String]) -> Vec<VerbViolation> {
	let record = match parse_verb_key(key) {
		Ok(record) => record,
		Err(err) => {
			warn!(key, error = %err, "could not parse verb key, skipping");
			return Vec::new();
		}
	};

	let mut violations = Vec::new();
	for pair in fields.chunks(2) {
		let [field, raw_value] = pair else {
			warn!(key, "odd-length field/value list from fetch script, skipping trailing field");
			break;
		};
		let Some(category) = UsageCategory::from_field_name(field) else {
			warn!(key, field, "unrecognized usage field, skipping");
			continue;
		};
		let Ok(value) = raw_value.parse::<f64>() else {
			warn!(key, field, raw_value, "non-numeric usage value, skipping");
			continue;
		};

		let limit = registry.get_limit(category, &record.access_key);
		#[allow(clippy::cast_precision_loss)]
		let limit_effective = if category.is_bandwidth() { (limit * MB) as f64 } else { limit as f64 };
		if value >= limit_effective {
			violations.push(VerbViolation {
				endpoint: record.endpoint.clone(),
				category,
				user: record.access_key.clone(),
				diff_ratio: round1(value / limit_effective),
			});
		}
	}
	violations
}

fn dispatch_violations(queues: &ProxyQueues, bookkeeper: &mut Bookkeeper, endpoint: &str, epoch_time: f64, metrics: &EngineMetrics) {
	let messages = bookkeeper.generate_violation_messages(endpoint, epoch_time);
	if messages.is_empty() {
		return;
	}
	#[allow(clippy::cast_precision_loss)]
	metrics.violations_emitted.inc_by(messages.len() as f64);
	let Some(handles) = queues.get(endpoint) else {
		return;
	};
	for handle in handles {
		for message in &messages {
			handle.enqueue(message.clone());
		}
	}
}

/// Runs one verb/throughput detector tick: scan, fan out fetch+evaluate
/// across `worker_count` tasks, fold results into the shared bookkeeper,
/// and dispatch any resulting violation messages.
///
/// # Errors
/// Returns [`PolygenError::Internal`] if the system clock cannot be read.
/// Store errors are logged and swallowed per the eventually-consistent
/// failure model in SPEC_FULL §4.2.4.
///
/// # Panics
/// Panics if the shared bookkeeper mutex is poisoned by a prior panic.
pub async fn run_verb_tick(
	store: &UsageStore, registry: &Arc<LimitRegistry>, bookkeeper: &Mutex<Bookkeeper>, queues: &ProxyQueues, metrics: &EngineMetrics, batch_size: usize, worker_count: usize,
) -> Result<(), PolygenError> {
	let epoch_time = now_epoch_seconds()?;
	#[allow(clippy::cast_possible_truncation)]
	let epoch_sec = epoch_time as i64;
	let pattern = format!("verb_{epoch_sec}_*");

	let Some(keys) = scan_keys(store, &pattern, batch_size, Some(epoch_sec)).await? else {
		return Ok(());
	};
	if keys.is_empty() {
		return Ok(());
	}

	let keys: Vec<String> = keys.into_iter().collect();
	let chunk_size = keys.len().div_ceil(worker_count.max(1)).max(1);
	let mut joins = Vec::new();
	for chunk in keys.chunks(chunk_size) {
		let chunk = chunk.to_vec();
		let store = store.clone();
		let registry = Arc::clone(registry);
		joins.push(tokio::spawn(async move {
			match store.fetch_fields(&chunk).await {
				Ok(values) => chunk.iter().zip(values).flat_map(|(key, fields)| evaluate_verb_fields(&registry, key, &fields)).collect::<Vec<_>>(),
				Err(err) => {
					warn!(error = %err, "verb batch fetch failed, skipping batch");
					Vec::new()
				}
			}
		}));
	}

	let mut endpoints_touched = HashSet::new();
	{
		let mut bk = bookkeeper.lock().expect("bookkeeper lock poisoned");
		for join in joins {
			let violations = join.await.unwrap_or_default();
			for v in violations {
				bk.add_violation(epoch_time, &v.endpoint, v.category, &v.user, Some(v.diff_ratio));
				endpoints_touched.insert(v.endpoint);
			}
		}
		for endpoint in &endpoints_touched {
			dispatch_violations(queues, &mut bk, endpoint, epoch_time, metrics);
		}
	}
	metrics.scan_iterations.inc();
	Ok(())
}

/// Tracks blocked users across ticks so the connection loop can apply
/// block/unblock hysteresis, grounded on `PolicyGenerator.blocked_users`
/// (a plain `dict[str, float]` of access key to the epoch it was last
/// (re)asserted). Deliberately keyed by user alone, not `(user, endpoint)`
/// — see DESIGN.md Open Question 2.
#[derive(Debug, Default)]
pub struct BlockedUserTable {
	blocked: HashMap<UserKey, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDecision {
	Block,
	Unblock,
	None,
}

impl BlockedUserTable {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Evaluates the hysteresis state machine in SPEC_FULL §4.2.3 for one
	/// user's current `ratio = observed / limit`, updating internal state
	/// as a side effect of a `Block`/`Unblock` decision.
	pub fn evaluate(&mut self, user: &str, ratio: f64, epoch_time: f64, backoff_secs: f64, unblock_ratio: f64) -> ConnDecision {
		let limit_reached = ratio >= 1.0;
		let is_blocked = self.blocked.contains_key(user);
		let ready_for_heartbeat = !is_blocked || self.blocked[user] + backoff_secs < epoch_time;

		if (limit_reached && !is_blocked) || (limit_reached && ready_for_heartbeat) || (!limit_reached && is_blocked && ready_for_heartbeat && ratio > unblock_ratio) {
			self.blocked.insert(user.to_string(), epoch_time);
			ConnDecision::Block
		} else if is_blocked && ratio <= unblock_ratio {
			self.blocked.remove(user);
			ConnDecision::Unblock
		} else {
			ConnDecision::None
		}
	}
}

/// Merges connection records sharing `(user, endpoint, epoch)`, collapsing
/// per-direction/per-instance v2 counters into one total, matching
/// `MetricService.merge_metrics_by_key`.
fn merge_connection_records(records: Vec<ConnectionRecord>) -> Vec<ConnectionRecord> {
	let mut merged: HashMap<(UserKey, Endpoint, i64), ConnectionRecord> = HashMap::new();
	for record in records {
		merged.entry(record.merge_key()).and_modify(|existing| existing.merge_from(&record)).or_insert(record);
	}
	merged.into_values().collect()
}

/// Runs one connection-loop detector tick: scan all `conn_*` keys
/// (epoch-agnostic), merge, and evaluate the block/unblock hysteresis
/// machine for each user.
///
/// # Errors
/// Returns [`PolygenError::Internal`] if the system clock cannot be read.
///
/// # Panics
/// Panics if the shared bookkeeper or blocked-user-table mutex is poisoned
/// by a prior panic.
#[allow(clippy::too_many_arguments)]
pub async fn run_connection_tick(
	store: &UsageStore, registry: &LimitRegistry, bookkeeper: &Mutex<Bookkeeper>, blocked: &Mutex<BlockedUserTable>, queues: &ProxyQueues, metrics: &EngineMetrics, batch_size: usize,
	backoff_secs: f64, unblock_ratio: f64,
) -> Result<(), PolygenError> {
	let epoch_time = now_epoch_seconds()?;
	#[allow(clippy::cast_possible_truncation)]
	let epoch_sec = epoch_time as i64;

	let keys: Vec<String> = scan_keys(store, "conn_*", batch_size, None).await?.unwrap_or_default().into_iter().collect();
	if keys.is_empty() {
		return Ok(());
	}

	let values = match store.fetch_fields(&keys).await {
		Ok(values) => values,
		Err(err) => {
			warn!(error = %err, "connection batch fetch failed, skipping tick");
			metrics.scan_failures.inc();
			return Ok(());
		}
	};

	let mut records = Vec::new();
	for (key, fields) in keys.iter().zip(values) {
		match parse_connection_key(key, epoch_sec) {
			Ok(mut record) => {
				let Some(raw) = fields.first() else {
					warn!(key, "connection key fetch returned no value, skipping");
					continue;
				};
				let Ok(count) = raw.parse::<i64>() else {
					warn!(key, raw, "non-integer connection count, skipping");
					continue;
				};
				record.data = count;
				records.push(record);
			}
			Err(err) => warn!(key, error = %err, "invalid connection key, skipping"),
		}
	}

	let merged = merge_connection_records(records);

	let mut bk = bookkeeper.lock().expect("bookkeeper lock poisoned");
	let mut blocked = blocked.lock().expect("blocked user table lock poisoned");
	let mut endpoints_touched = HashSet::new();
	for record in &merged {
		let limit = registry.get_limit(UsageCategory::Connections, &record.access_key);
		if limit <= 0 {
			continue;
		}
		#[allow(clippy::cast_precision_loss)]
		let ratio = record.data as f64 / limit as f64;
		let category = match blocked.evaluate(&record.access_key, ratio, epoch_time, backoff_secs, unblock_ratio) {
			ConnDecision::Block => UsageCategory::ReqsBlock,
			ConnDecision::Unblock => UsageCategory::ReqsUnblock,
			ConnDecision::None => continue,
		};
		bk.add_violation(epoch_time, &record.endpoint, category, &record.access_key, None);
		endpoints_touched.insert(record.endpoint.clone());
	}
	for endpoint in &endpoints_touched {
		dispatch_violations(queues, &mut bk, endpoint, epoch_time, metrics);
	}
	metrics.scan_iterations.inc();
	Ok(())
}

/// Drives the verb/throughput detector tick forever until `shutdown` fires,
/// pacing by `config.sleep_time` and checking for a pending limits reload
/// on every iteration (SPEC_FULL §4.2.1/§4.6).
pub async fn run_verb_loop(
	store: UsageStore, registry: Arc<LimitRegistry>, bookkeeper: Arc<Mutex<Bookkeeper>>, queues: Arc<ProxyQueues>, metrics: EngineMetrics, config: Arc<EngineConfig>, shutdown: CancellationToken,
) {
	let mut timer = LoopTimer::new(config.zone.clone(), "verb_check_loop", 1000);
	loop {
		if registry.reload_requested() {
			registry.reload();
		}
		registry.report_unknown_users();

		let start = Instant::now();
		let result = run_verb_tick(&store, &registry, &bookkeeper, &queues, &metrics, config.redis_keys_batch, config.violation_check_thread_num).await;
		timer.record(start.elapsed());
		if let Err(err) = result {
			warn!(error = %err, "verb check loop tick failed");
			metrics.scan_failures.inc();
		}

		tokio::select! {
			() = shutdown.cancelled() => break,
			() = tokio::time::sleep(config.sleep_time) => {}
		}
	}
}

/// Drives the connection-loop detector tick forever until `shutdown` fires.
#[allow(clippy::too_many_arguments)]
pub async fn run_connection_loop(
	store: UsageStore, registry: Arc<LimitRegistry>, bookkeeper: Arc<Mutex<Bookkeeper>>, blocked: Arc<Mutex<BlockedUserTable>>, queues: Arc<ProxyQueues>, metrics: EngineMetrics,
	config: Arc<EngineConfig>, shutdown: CancellationToken,
) {
	let mut timer = LoopTimer::new(config.zone.clone(), "conn_check_loop", 1000);
	#[allow(clippy::cast_precision_loss)]
	let backoff_secs = config.requests_unblock_backoff_time_ms as f64 / 1000.0;
	loop {
		let start = Instant::now();
		let result = run_connection_tick(&store, &registry, &bookkeeper, &blocked, &queues, &metrics, config.redis_keys_batch, backoff_secs, config.requests_unblock_ratio).await;
		timer.record(start.elapsed());
		if let Err(err) = result {
			warn!(error = %err, "connection check loop tick failed");
			metrics.scan_failures.inc();
		}

		tokio::select! {
			() = shutdown.cancelled() => break,
			() = tokio::time::sleep(config.sleep_time) => {}
		}
	}
}
