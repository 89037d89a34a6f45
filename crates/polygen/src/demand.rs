//! Demand aggregation and bandwidth fair-share computation, grounded on
//! `policy_generator.py`'s `aggregate_demand_from_conn_v2` and
//! `compute_bandwidth_limit_share`.

use crate::config::EngineConfig;
use crate::dispatch;
use crate::error::PolygenError;
use crate::key_parser::parse_demand_key;
use crate::limits::LimitRegistry;
use crate::metrics::EngineMetrics;
use crate::model::{Direction, DemandMap, UsageCategory, UserKey, MB};
use crate::store::UsageStore;
use crate::timer::LoopTimer;
use crate::topology::Topology;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Builds a [`DemandMap`] from `conn_v2_*` key/value pairs. Malformed keys
/// are logged and skipped individually (SPEC_FULL §4.4 step 2 — a
/// deliberate divergence from the source, which aborts the whole batch on
/// the first malformed key; see DESIGN.md Open Question 1).
pub fn aggregate_demand<'a>(pairs: impl IntoIterator<Item = (&'a str, Option<i64>)>) -> DemandMap {
	let mut demand = DemandMap::new();
	for (key, count) in pairs {
		let Some(count) = count else { continue };
		let parts = match parse_demand_key(key) {
			Ok(parts) => parts,
			Err(err) => {
				warn!(key, error = %err, "invalid connection demand key");
				continue;
			}
		};
		*demand.entry((parts.access_key, parts.direction)).or_default().entry(parts.instance_id).or_insert(0) += count;
	}
	demand
}

/// One user's computed per-instance bandwidth shares for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserShare {
	pub user: UserKey,
	pub direction: Direction,
	/// `(instance_id, share_bytes)`, already filtered to `share > 0`.
	pub shares: Vec<(String, i64)>,
}

/// Splits each user's bandwidth quota across proxy instances in
/// proportion to observed demand. Independent per `(user, direction)` —
/// one user's shares never depend on another user's demand (SPEC_FULL §8
/// invariant 7).
#[must_use]
pub fn compute_fair_share(demand: &DemandMap, registry: &LimitRegistry) -> Vec<UserShare> {
	let mut results = Vec::new();
	for ((user, direction), per_instance) in demand {
		let total: i64 = per_instance.values().sum();
		if total <= 0 {
			continue;
		}

		let category = match direction {
			Direction::Up => UsageCategory::BandwidthUp,
			Direction::Down => UsageCategory::BandwidthDown,
		};
		let quota_bytes = registry.get_limit(category, user) * MB;

		let mut shares: Vec<(String, i64)> = per_instance
			.iter()
			.filter_map(|(instance, &instance_demand)| {
				#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
				let share = ((quota_bytes as f64) * (instance_demand as f64) / (total as f64)).floor() as i64;
				(share > 0).then_some((instance.clone(), share))
			})
			.collect();
		shares.sort();

		results.push(UserShare { user: user.clone(), direction: *direction, shares });
	}
	results
}

/// Renders one `limit_share` message line per user:
/// `"<epoch_ms>,<user>,<instance1>_<dir1>_<share1>,…"`. Users whose
/// shares are all zero were already filtered out by [`compute_fair_share`].
#[must_use]
pub fn format_limit_share_lines(shares: &[UserShare], epoch_ms: i64) -> Vec<String> {
	shares
		.iter()
		.filter(|s| !s.shares.is_empty())
		.map(|s| {
			let entries = s.shares.iter().map(|(instance, share)| format!("{instance}_{}_{share}", s.direction)).collect::<Vec<_>>().join(",");
			format!("{epoch_ms},{},{entries}", s.user)
		})
		.collect()
}

/// Runs one demand-aggregation tick: scan `conn_v2_*` keys, bulk-fetch
/// their values, compute each user's fair share, and broadcast the
/// resulting `limit_share` block directly to every proxy instance
/// (SPEC_FULL §4.4 step 6 — this channel bypasses the per-proxy queue).
///
/// # Errors
/// Returns [`PolygenError::Internal`] if the system clock cannot be read.
/// Store errors are logged and swallowed, matching the detector's
/// eventually-consistent failure model.
pub async fn run_demand_tick(store: &UsageStore, registry: &LimitRegistry, topology: &Topology, metrics: &EngineMetrics, batch_size: usize) -> Result<(), PolygenError> {
	let mut cursor = 0u64;
	let mut keys = std::collections::HashSet::new();
	loop {
		let (next_cursor, page) = store.scan_page(cursor, "conn_v2_*", batch_size).await?;
		keys.extend(page);
		cursor = next_cursor;
		if cursor == 0 {
			break;
		}
	}
	if keys.is_empty() {
		return Ok(());
	}

	let keys: Vec<String> = keys.into_iter().collect();
	let values = match store.mget(&keys).await {
		Ok(values) => values,
		Err(err) => {
			warn!(error = %err, "demand batch fetch failed, skipping tick");
			return Ok(());
		}
	};

	let demand = aggregate_demand(keys.iter().map(String::as_str).zip(values));
	let shares = compute_fair_share(&demand, registry);
	if shares.is_empty() {
		return Ok(());
	}

	#[allow(clippy::cast_possible_truncation)]
	let epoch_ms = (SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64() * 1000.0).floor() as i64;
	let lines = format_limit_share_lines(&shares, epoch_ms);
	if lines.is_empty() {
		return Ok(());
	}
	let payload = dispatch::frame_limit_share(&lines);

	for proxy in topology.all_proxies() {
		dispatch::send_limit_share_direct(proxy, &payload, metrics).await;
	}
	Ok(())
}

/// Drives the demand-aggregation tick forever until `shutdown` fires, at a
/// cadence `demand_sleep_multiplier` times slower than the detector loops
/// (SPEC_FULL §4.4 intro).
pub async fn run_demand_loop(store: UsageStore, registry: Arc<LimitRegistry>, topology: Arc<Topology>, metrics: EngineMetrics, config: Arc<EngineConfig>, shutdown: CancellationToken) {
	let mut timer = LoopTimer::new(config.zone.clone(), "demand_check_loop", 1000);
	let sleep_time = config.sleep_time * u32::try_from(config.demand_sleep_multiplier).unwrap_or(u32::MAX);
	loop {
		let start = Instant::now();
		let result = run_demand_tick(&store, &registry, &topology, &metrics, config.redis_keys_batch).await;
		timer.record(start.elapsed());
		if let Err(err) = result {
			warn!(error = %err, "demand check loop tick failed");
		}

		tokio::select! {
			() = shutdown.cancelled() => break,
			() = tokio::time::sleep(sleep_time) => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::EngineConfig;
	use crate::model::{LimitConfig, QoSClass};
	use std::collections::HashMap;

	fn registry_with_quota(user: &str, up: i64, down: i64) -> LimitRegistry {
		let qos = HashMap::from([("DEFAULT".to_string(), QoSClass(HashMap::from([("user_bnd_up".to_string(), up), ("user_bnd_dwn".to_string(), down)])))]);
		let config = LimitConfig { user_to_qos_id: HashMap::from([(user.to_string(), "DEFAULT".to_string())]), qos };
		LimitRegistry::new(config, &EngineConfig::test())
	}

	#[test]
	fn aggregates_demand_from_v2_keys() {
		let pairs = vec![
			("conn_v2_user_dwn_instance1_KEY1$dev.dc", Some(100)),
			("conn_v2_user_dwn_instance2_KEY1$dev.dc", Some(300)),
		];
		let demand = aggregate_demand(pairs);
		let entry = &demand[&("KEY1".to_string(), Direction::Down)];
		assert_eq!(entry["instance1"], 100);
		assert_eq!(entry["instance2"], 300);
	}

	#[test]
	fn malformed_key_is_skipped_not_fatal() {
		let pairs = vec![("not_a_valid_key", Some(5)), ("conn_v2_user_dwn_instance1_KEY1$dev.dc", Some(10))];
		let demand = aggregate_demand(pairs);
		assert_eq!(demand.len(), 1);
	}

	#[test]
	fn fair_share_matches_spec_example() {
		let registry = registry_with_quota("KEY1", 200, 200);
		let demand = aggregate_demand(vec![
			("conn_v2_user_dwn_instance1_KEY1$dev.dc", Some(100)),
			("conn_v2_user_dwn_instance2_KEY1$dev.dc", Some(300)),
		]);

		let shares = compute_fair_share(&demand, &registry);
		assert_eq!(shares.len(), 1);
		let share = &shares[0];
		assert_eq!(share.user, "KEY1");
		assert_eq!(share.shares, vec![("instance1".to_string(), 52_428_800), ("instance2".to_string(), 157_286_400)]);

		let lines = format_limit_share_lines(&shares, 100);
		assert_eq!(lines, vec!["100,KEY1,instance1_dwn_52428800,instance2_dwn_157286400".to_string()]);
	}

	#[test]
	fn zero_total_demand_emits_nothing() {
		let registry = registry_with_quota("KEY1", 200, 200);
		let demand = aggregate_demand(vec![("conn_v2_user_dwn_instance1_KEY1$dev.dc", Some(0))]);
		assert!(compute_fair_share(&demand, &registry).is_empty());
	}

	#[test]
	fn zero_share_instances_are_omitted() {
		let registry = registry_with_quota("KEY1", 200, 200);
		// instance2's demand is so small relative to instance1 that its
		// floor share rounds down to zero.
		let demand = aggregate_demand(vec![
			("conn_v2_user_dwn_instance1_KEY1$dev.dc", Some(1_000_000)),
			("conn_v2_user_dwn_instance2_KEY1$dev.dc", Some(1)),
		]);
		let shares = compute_fair_share(&demand, &registry);
		assert_eq!(shares[0].shares.len(), 1);
		assert_eq!(shares[0].shares[0].0, "instance1");
	}

	#[test]
	fn shares_are_independent_per_user() {
		let registry = registry_with_quota("KEY1", 200, 200);
		let demand = aggregate_demand(vec![
			("conn_v2_user_dwn_instance1_KEY1$dev.dc", Some(100)),
			("conn_v2_user_dwn_instance1_KEY2$dev.dc", Some(999_999)),
		]);
		let shares = compute_fair_share(&demand, &registry);
		let key1 = shares.iter().find(|s| s.user == "KEY1").unwrap();
		// KEY1's share depends only on its own (single-instance) demand,
		// so it gets its full quota regardless of KEY2's huge demand.
		assert_eq!(key1.shares, vec![("instance1".to_string(), 200 * MB)]);
	}
}
