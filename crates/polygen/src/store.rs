//! Async wrapper over `redis` for the paginated `SCAN` + batched
//! server-side-script fetch this engine relies on, grounded on
//! `file_host::cache::redis_cache::CacheStore`'s `redis::AsyncCommands` usage
//! and `policy_generator.py`'s `_load_redis_get_fields_lua`/`call_redis_eval`.

use crate::error::PolygenError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use sha1::{Digest, Sha1};
use std::path::Path;
use tracing::{debug, warn};

/// Async Redis client plus the content-hashed fetch script this engine
/// uses to pull all fields for a batch of keys in one round-trip.
#[derive(Clone)]
pub struct UsageStore {
	conn: ConnectionManager,
	fetch_script: String,
	fetch_script_sha1: String,
}

impl UsageStore {
	/// Connects to `redis_server` (`host:port`) and loads the fetch script
	/// from `lua_path`.
	///
	/// # Errors
	/// Returns [`PolygenError::Redis`] if the connection can't be
	/// established, or [`PolygenError::Io`] if the script file can't be read.
	pub async fn connect(redis_server: &str, lua_path: &Path) -> Result<Self, PolygenError> {
		let url = format!("redis://{redis_server}");
		let client = Client::open(url)?;
		let conn = ConnectionManager::new(client).await?;
		let fetch_script = std::fs::read_to_string(lua_path)?;
		let fetch_script_sha1 = hex_sha1(&fetch_script);
		Ok(Self { conn, fetch_script, fetch_script_sha1 })
	}

	/// One page of a `SCAN` over `pattern`. Callers drive the cursor loop
	/// themselves so they can bail out mid-scan (e.g. on a second boundary).
	///
	/// # Errors
	/// Returns [`PolygenError::Redis`] on any I/O failure.
	pub async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), PolygenError> {
		let mut conn = self.conn.clone();
		let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
			.arg(cursor)
			.arg("MATCH")
			.arg(pattern)
			.arg("COUNT")
			.arg(count)
			.query_async(&mut conn)
			.await?;
		Ok((next_cursor, keys))
	}

	/// Fetches all fields for `keys` in one round trip via the cached
	/// fetch script, falling back to inline `EVAL` on a `NOSCRIPT` miss.
	/// Returns, per key (same order as input), a flat `[field, value, ...]`
	/// list for hash keys or a single-element `[value]` list for scalar
	/// keys.
	///
	/// # Errors
	/// Returns [`PolygenError::ScriptFailed`] for any script error other
	/// than `NOSCRIPT`, or [`PolygenError::Redis`] for transport failures.
	pub async fn fetch_fields(&self, keys: &[String]) -> Result<Vec<Vec<String>>, PolygenError> {
		if keys.is_empty() {
			return Ok(Vec::new());
		}
		let mut conn = self.conn.clone();
		let mut cmd = redis::cmd("EVALSHA");
		cmd.arg(&self.fetch_script_sha1).arg(keys.len());
		for key in keys {
			cmd.arg(key);
		}

		match cmd.query_async::<_, Vec<Vec<String>>>(&mut conn).await {
			Ok(result) => Ok(result),
			Err(err) if err.code() == Some("NOSCRIPT") => {
				debug!("fetch script not cached, falling back to EVAL");
				let mut eval_cmd = redis::cmd("EVAL");
				eval_cmd.arg(&self.fetch_script).arg(keys.len());
				for key in keys {
					eval_cmd.arg(key);
				}
				Ok(eval_cmd.query_async(&mut conn).await?)
			}
			Err(err) => {
				warn!(error = %err, "fetch script execution failed");
				Err(PolygenError::ScriptFailed(err.to_string()))
			}
		}
	}

	/// Bulk `MGET` over plain integer-valued keys (used by the demand
	/// aggregator for `conn_v2_*` keys, which are never hashes).
	///
	/// # Errors
	/// Returns [`PolygenError::Redis`] on transport failure.
	pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>, PolygenError> {
		if keys.is_empty() {
			return Ok(Vec::new());
		}
		let mut conn = self.conn.clone();
		let values: Vec<Option<i64>> = conn.mget(keys).await?;
		Ok(values)
	}
}

fn hex_sha1(script: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(script.as_bytes());
	let digest = hasher.finalize();
	digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
