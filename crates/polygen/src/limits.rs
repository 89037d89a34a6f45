//! The limit registry: a hot-reloadable, lock-free snapshot of per-user QoS
//! limits, grounded on `policy_generator.py`'s `_get_limit`/`_use_hard_coded_limit`
//! and `UnknownUsers`. The snapshot-pointer pattern itself (`ArcSwap`) is
//! pack enrichment for the "hot config, cold write" shape.

use crate::config::EngineConfig;
use crate::error::PolygenError;
use crate::model::{
	LimitConfig, UsageCategory, UserKey, AREQ_LIMITING_PATTERN, DEFAULT_AREQ_LIMIT, DEFAULT_QOS_ID, DEFAULT_VERB_BDW_LIMIT, DEFAULT_VERB_RATE_LIMIT,
	VERB_BANDWIDTH_PATTERN,
};
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Accumulates users for which no configured limit was found, flushing a
/// single warning every `report_time_seconds`. A non-positive interval
/// disables the log line but the set is still drained so it never grows
/// unbounded across a long-running process.
pub struct UnknownUsersReporter {
	report_time_seconds: i64,
	users: Mutex<HashSet<UserKey>>,
	last_report_time_seconds: AtomicI64,
}

impl UnknownUsersReporter {
	#[must_use]
	pub fn new(report_time_seconds: i64) -> Self {
		Self { report_time_seconds, users: Mutex::new(HashSet::new()), last_report_time_seconds: AtomicI64::new(0) }
	}

	/// # Panics
	/// Panics if the internal mutex is poisoned by a prior panic.
	pub fn record(&self, user: &str) {
		self.users.lock().expect("unknown users lock poisoned").insert(user.to_string());
	}

	/// Flushes the accumulated set as a single WARN log if the report
	/// interval has elapsed. Called once per detector tick.
	///
	/// # Panics
	/// Panics if the system clock is set before the Unix epoch.
	pub fn report(&self) {
		if self.report_time_seconds <= 0 {
			self.users.lock().expect("unknown users lock poisoned").clear();
			return;
		}
		let now = i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()).unwrap_or(i64::MAX);
		let last = self.last_report_time_seconds.load(Ordering::Relaxed);
		if now - last > self.report_time_seconds {
			self.last_report_time_seconds.store(now, Ordering::Relaxed);
			let mut users = self.users.lock().expect("unknown users lock poisoned");
			if !users.is_empty() {
				warn!(users = ?*users, "users with no QoS limits");
				users.clear();
			}
		}
	}
}

/// Lock-free, hot-reloadable view over the current [`LimitConfig`].
pub struct LimitRegistry {
	config: ArcSwap<LimitConfig>,
	cache_path: std::path::PathBuf,
	should_reload: AtomicBool,
	default_active_request_if_qos_not_configured: i64,
	unknown_users: UnknownUsersReporter,
}

impl LimitRegistry {
	#[must_use]
	pub fn new(initial: LimitConfig, engine_config: &EngineConfig) -> Self {
		Self {
			config: ArcSwap::from_pointee(initial),
			cache_path: engine_config.cache_limits_path(),
			should_reload: AtomicBool::new(false),
			default_active_request_if_qos_not_configured: engine_config.default_active_request_if_qos_not_configured,
			unknown_users: UnknownUsersReporter::new(engine_config.unknown_users_report_time_seconds),
		}
	}

	/// Loads the on-disk limits cache, matching `_load_limits_from_file`:
	/// a missing or unparseable file yields an empty (all-defaults)
	/// [`LimitConfig`] rather than failing startup.
	#[must_use]
	pub fn load_from_disk(path: &std::path::Path) -> LimitConfig {
		let Ok(contents) = std::fs::read_to_string(path) else {
			warn!(path = %path.display(), "no limits cache file found, starting with empty limits");
			return LimitConfig::default();
		};
		match serde_json::from_str(&contents) {
			Ok(config) => config,
			Err(err) => {
				warn!(path = %path.display(), error = %err, "failed to parse limits cache, starting with empty limits");
				LimitConfig::default()
			}
		}
	}

	/// Signals that the registry should reload on the owning detector's
	/// next iteration. Does not itself touch disk or the current snapshot.
	pub fn request_reload(&self) {
		self.should_reload.store(true, Ordering::SeqCst);
	}

	#[must_use]
	pub fn reload_requested(&self) -> bool {
		self.should_reload.load(Ordering::SeqCst)
	}

	/// Re-reads the cache file and swaps in a fresh snapshot. Call only
	/// from the single thread that owns reload decisions (the detector).
	pub fn reload(&self) {
		self.should_reload.store(false, Ordering::SeqCst);
		let fresh = Self::load_from_disk(&self.cache_path);
		debug!("reloading limits from {}", self.cache_path.display());
		self.config.store(Arc::new(fresh));
	}

	fn hard_coded_limit(&self, category: UsageCategory) -> i64 {
		let key = category.limit_key();
		if key.contains(VERB_BANDWIDTH_PATTERN) {
			DEFAULT_VERB_BDW_LIMIT
		} else if key.contains(AREQ_LIMITING_PATTERN) {
			self.default_active_request_if_qos_not_configured
		} else {
			DEFAULT_VERB_RATE_LIMIT
		}
	}

	/// Returns the most specific configured limit for `(category, user)`,
	/// following the three-tier precedence in SPEC_FULL §4.1. Never fails.
	#[must_use]
	pub fn get_limit(&self, category: UsageCategory, user: &str) -> i64 {
		let snapshot = self.config.load();

		if let Some(class) = snapshot.user_to_qos_id.get(user) {
			if let Some(qos) = snapshot.qos.get(class) {
				if let Some(limit) = qos.get(category) {
					debug!(user, %category, limit, "limit found in user's own class");
					return limit;
				}
			}
		}

		self.unknown_users.record(user);
		let default_class = snapshot.user_to_qos_id.get(DEFAULT_QOS_ID).cloned().unwrap_or_else(|| "DEFAULT".to_string());
		if let Some(qos) = snapshot.qos.get(&default_class) {
			if let Some(limit) = qos.get(category) {
				debug!(user, %category, limit, class = %default_class, "limit found via default class");
				return limit;
			}
		}

		let limit = self.hard_coded_limit(category);
		warn!(user, %category, limit, "using hard-coded limit, no QoS configured");
		limit
	}

	/// Drains and logs the accumulated unknown-user set if the reporting
	/// interval has elapsed. Call once per detector tick.
	pub fn report_unknown_users(&self) {
		self.unknown_users.report();
	}

	#[must_use]
	pub fn default_active_request_limit(&self) -> i64 {
		self.default_active_request_if_qos_not_configured
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::QoSClass;
	use std::collections::HashMap;

	fn registry_with(user_to_qos_id: HashMap<String, String>, qos: HashMap<String, QoSClass>) -> LimitRegistry {
		let cfg = LimitConfig { user_to_qos_id, qos };
		LimitRegistry::new(cfg, &EngineConfig::test())
	}

	#[test]
	fn uses_users_own_class_when_configured() {
		let mut qos = HashMap::new();
		qos.insert("SILVER".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), 200)])));
		qos.insert("DEFAULT".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), 100)])));
		let registry = registry_with(HashMap::from([("KEY1".to_string(), "SILVER".to_string())]), qos);

		assert_eq!(registry.get_limit(UsageCategory::Get, "KEY1"), 200);
	}

	#[test]
	fn falls_back_to_default_class_for_unknown_user() {
		let mut qos = HashMap::new();
		qos.insert("DEFAULT".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), 100)])));
		let registry = registry_with(HashMap::new(), qos);

		assert_eq!(registry.get_limit(UsageCategory::Get, "UNKNOWN"), 100);
	}

	#[test]
	fn common_redirects_the_default_bundle() {
		let mut qos = HashMap::new();
		qos.insert("GOLD".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), 500)])));
		let registry = registry_with(HashMap::from([("common".to_string(), "GOLD".to_string())]), qos);

		assert_eq!(registry.get_limit(UsageCategory::Get, "ANYONE"), 500);
	}

	#[test]
	fn common_is_not_itself_rate_limited() {
		let mut qos = HashMap::new();
		qos.insert("GOLD".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), 500)])));
		let registry = registry_with(HashMap::from([("common".to_string(), "GOLD".to_string())]), qos);

		// "common" has no entry in user_to_qos_id keyed to itself as a user, so
		// looking it up as a user falls through to the same default resolution.
		assert_eq!(registry.get_limit(UsageCategory::Get, "common"), 500);
	}

	#[test]
	fn hard_coded_fallback_by_category_kind() {
		let registry = registry_with(HashMap::new(), HashMap::new());

		assert_eq!(registry.get_limit(UsageCategory::BandwidthDown, "X"), DEFAULT_VERB_BDW_LIMIT);
		assert_eq!(registry.get_limit(UsageCategory::Connections, "X"), DEFAULT_AREQ_LIMIT);
		assert_eq!(registry.get_limit(UsageCategory::Get, "X"), DEFAULT_VERB_RATE_LIMIT);
	}

	#[test]
	fn hard_coded_areq_limit_is_configurable() {
		let mut engine_cfg = EngineConfig::test();
		engine_cfg.default_active_request_if_qos_not_configured = 42;
		let registry = LimitRegistry::new(LimitConfig::default(), &engine_cfg);

		assert_eq!(registry.get_limit(UsageCategory::Connections, "X"), 42);
	}

	#[test]
	fn sentinel_not_configured_value_is_treated_as_absent() {
		let mut qos = HashMap::new();
		qos.insert("SILVER".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), -1)])));
		qos.insert("DEFAULT".to_string(), QoSClass(HashMap::from([("user_GET".to_string(), 100)])));
		let registry = registry_with(HashMap::from([("KEY1".to_string(), "SILVER".to_string())]), qos);

		assert_eq!(registry.get_limit(UsageCategory::Get, "KEY1"), 100);
	}

	#[test]
	fn reload_swaps_in_new_snapshot() {
		let dir = tempfile::tempdir().unwrap();
		// SAFETY-equivalent: single-threaded test, restored before returning.
		let prior_home = std::env::var("HOME").ok();
		std::env::set_var("HOME", dir.path());

		let mut engine_cfg = EngineConfig::test();
		engine_cfg.zone = "reload-test".to_string();
		let cache_path = engine_cfg.cache_limits_path();

		let registry = LimitRegistry::new(LimitRegistry::load_from_disk(&cache_path), &engine_cfg);
		assert_eq!(registry.get_limit(UsageCategory::Get, "X"), DEFAULT_VERB_RATE_LIMIT);

		std::fs::write(&cache_path, r#"{"user_to_qos_id":{},"qos":{"DEFAULT":{"user_GET":200}}}"#).unwrap();
		registry.request_reload();
		assert!(registry.reload_requested());
		registry.reload();
		assert!(!registry.reload_requested());

		assert_eq!(registry.get_limit(UsageCategory::Get, "X"), 200);

		match prior_home {
			Some(value) => std::env::set_var("HOME", value),
			None => std::env::remove_var("HOME"),
		}
	}

	#[test]
	fn unknown_users_reporter_disabled_still_drains() {
		let reporter = UnknownUsersReporter::new(0);
		reporter.record("KEY1");
		reporter.report();
		assert!(reporter.users.lock().unwrap().is_empty());
	}
}
