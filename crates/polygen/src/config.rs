use crate::error::PolygenError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// `polygen <config_file>` — the process takes exactly one positional
/// argument, the path to its YAML config.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
	pub config_file: PathBuf,
}

/// The on-disk YAML schema, deserialized verbatim before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
	pub zone: String,
	#[serde(default = "default_log_level")]
	pub log_level: String,
	pub log_file_name: Option<String>,
	#[serde(default)]
	pub log_json: bool,
	#[serde(default = "default_sleep_time_ms")]
	pub sleep_time: u64,
	#[serde(default = "default_demand_sleep_multiplier")]
	pub demand_sleep_multiplier: u64,
	pub redis_server: String,
	#[serde(default = "default_redis_keys_batch")]
	pub redis_keys_batch: usize,
	pub polygen_lua_path: PathBuf,
	pub haproxy_servers: HashMap<String, Vec<String>>,
	#[serde(default = "default_queue_size")]
	pub policy_msg_queue_size: usize,
	#[serde(default = "default_violation_threads")]
	pub violation_check_thread_num: usize,
	#[serde(default = "default_unblock_backoff_ms")]
	pub requests_unblock_backoff_time_ms: u64,
	#[serde(default = "default_unblock_ratio")]
	pub requests_unblock_ratio: f64,
	#[serde(default = "default_areq_limit")]
	pub default_active_request_if_qos_not_configured: i64,
	#[serde(default = "default_report_seconds")]
	pub unknown_users_report_time_seconds: i64,
}

const fn default_log_level() -> String {
	String::new()
}
const fn default_sleep_time_ms() -> u64 {
	200
}
const fn default_demand_sleep_multiplier() -> u64 {
	100
}
const fn default_redis_keys_batch() -> usize {
	500
}
const fn default_queue_size() -> usize {
	1024
}
const fn default_violation_threads() -> usize {
	4
}
const fn default_unblock_backoff_ms() -> u64 {
	500
}
const fn default_unblock_ratio() -> f64 {
	0.95
}
const fn default_areq_limit() -> i64 {
	5000
}
const fn default_report_seconds() -> i64 {
	60
}

impl RawConfig {
	/// # Errors
	/// Returns an error if the file cannot be read or does not parse as the
	/// expected YAML schema.
	pub fn load(path: &std::path::Path) -> Result<Self, PolygenError> {
		let contents = std::fs::read_to_string(path)?;
		let raw: Self = serde_yaml::from_str(&contents)?;
		Ok(raw)
	}
}

/// Normalized, typed configuration used by the running engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub zone: String,
	pub log_level: String,
	pub log_file_name: Option<String>,
	pub log_json: bool,
	pub sleep_time: Duration,
	pub demand_sleep_multiplier: u64,
	pub redis_server: String,
	pub redis_keys_batch: usize,
	pub polygen_lua_path: PathBuf,
	pub haproxy_servers: HashMap<String, Vec<String>>,
	pub policy_msg_queue_size: usize,
	pub violation_check_thread_num: usize,
	pub requests_unblock_backoff_time_ms: u64,
	pub requests_unblock_ratio: f64,
	pub default_active_request_if_qos_not_configured: i64,
	pub unknown_users_report_time_seconds: i64,
}

impl From<RawConfig> for EngineConfig {
	fn from(raw: RawConfig) -> Self {
		Self {
			zone: raw.zone,
			log_level: raw.log_level,
			log_file_name: raw.log_file_name,
			log_json: raw.log_json,
			sleep_time: Duration::from_millis(raw.sleep_time),
			demand_sleep_multiplier: raw.demand_sleep_multiplier,
			redis_server: raw.redis_server,
			redis_keys_batch: raw.redis_keys_batch,
			polygen_lua_path: raw.polygen_lua_path,
			haproxy_servers: raw.haproxy_servers,
			policy_msg_queue_size: raw.policy_msg_queue_size,
			violation_check_thread_num: raw.violation_check_thread_num,
			requests_unblock_backoff_time_ms: raw.requests_unblock_backoff_time_ms,
			requests_unblock_ratio: raw.requests_unblock_ratio,
			default_active_request_if_qos_not_configured: raw.default_active_request_if_qos_not_configured,
			unknown_users_report_time_seconds: raw.unknown_users_report_time_seconds,
		}
	}
}

impl EngineConfig {
	/// Path to the control FIFO for this zone, matching
	/// `/tmp/weir_<zone>_polygen_reload.fifo`.
	#[must_use]
	pub fn reload_fifo_path(&self) -> PathBuf {
		PathBuf::from(format!("/tmp/weir_{}_polygen_reload.fifo", self.zone))
	}

	/// Path to the on-disk limits cache, matching
	/// `~/weir_<zone>_cache_limits.json`.
	#[must_use]
	pub fn cache_limits_path(&self) -> PathBuf {
		let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
		PathBuf::from(format!("{home}/weir_{}_cache_limits.json", self.zone))
	}

	#[cfg(test)]
	#[must_use]
	pub fn test() -> Self {
		Self {
			zone: "test".to_string(),
			log_level: "info".to_string(),
			log_file_name: None,
			log_json: false,
			sleep_time: Duration::from_millis(100),
			demand_sleep_multiplier: 10,
			redis_server: "127.0.0.1:6379".to_string(),
			redis_keys_batch: 100,
			polygen_lua_path: PathBuf::from("/dev/null"),
			haproxy_servers: HashMap::new(),
			policy_msg_queue_size: 64,
			violation_check_thread_num: 2,
			requests_unblock_backoff_time_ms: 500,
			requests_unblock_ratio: 0.95,
			default_active_request_if_qos_not_configured: 5000,
			unknown_users_report_time_seconds: 60,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;

	#[test]
	fn defaults_apply_when_absent() {
		let yaml = r#"
zone: dev
redis_server: 127.0.0.1:6379
polygen_lua_path: /etc/polygen/fetch.lua
haproxy_servers:
  dev.dc: ["127.0.0.1:9001"]
"#;
		let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(raw.sleep_time, 200);
		assert_eq!(raw.demand_sleep_multiplier, 100);
		assert_relative_eq!(raw.requests_unblock_ratio, 0.95);
		assert_eq!(raw.default_active_request_if_qos_not_configured, 5000);
	}

	#[test]
	fn reload_fifo_path_is_zone_scoped() {
		let cfg = EngineConfig::test();
		assert_eq!(cfg.reload_fifo_path(), PathBuf::from("/tmp/weir_test_polygen_reload.fifo"));
	}
}
