//! Parsing of the three redis key shapes this engine consumes, mirroring
//! `MetricService.create_user_level_metric` and the per-class constructors
//! in `user_metrics.py`.

use crate::error::PolygenError;
use crate::model::{ConnectionRecord, Direction, Endpoint, UsageRecord, UserKey};

fn split_access_endpoint(raw_key: &str, acc_endpoint: &str) -> Result<(UserKey, Endpoint), PolygenError> {
	let mut parts = acc_endpoint.splitn(2, '$');
	let access = parts.next().ok_or_else(|| PolygenError::InvalidKey(raw_key.to_string()))?;
	let endpoint = parts.next().ok_or_else(|| PolygenError::InvalidKey(raw_key.to_string()))?;
	if access.is_empty() || !access.chars().all(char::is_alphanumeric) {
		return Err(PolygenError::InvalidKey(raw_key.to_string()));
	}
	Ok((access.to_string(), endpoint.to_string()))
}

/// Parses a `verb_<epoch>_user_<access>$<endpoint>` key.
///
/// # Errors
/// Returns [`PolygenError::InvalidKey`] if the key doesn't have exactly the
/// four underscore-separated components the source expects, if the epoch
/// isn't a valid integer, or if the access key isn't alphanumeric.
pub fn parse_verb_key(key: &str) -> Result<UsageRecord, PolygenError> {
	let items: Vec<&str> = key.split('_').collect();
	if items.len() != 4 || items[0] != "verb" || items[2] != "user" {
		return Err(PolygenError::InvalidKey(key.to_string()));
	}
	let epoch: i64 = items[1].parse().map_err(|_| PolygenError::InvalidKey(key.to_string()))?;
	let (access_key, endpoint) = split_access_endpoint(key, items[3])?;
	Ok(UsageRecord { epoch, access_key, endpoint })
}

/// Parses a `conn_user_<access>$<endpoint>` (v1) or
/// `conn_v2_user_<dir>_<instance>_<access>$<endpoint>` (v2) key, stamping
/// the record with `current_epoch` (connection keys don't carry their own
/// epoch on the wire).
///
/// # Errors
/// Returns [`PolygenError::InvalidKey`] if the key doesn't match either
/// shape, the direction token is unrecognized, or the access key isn't
/// alphanumeric.
pub fn parse_connection_key(key: &str, current_epoch: i64) -> Result<ConnectionRecord, PolygenError> {
	let items: Vec<&str> = key.split('_').collect();
	if items.first().copied() != Some("conn") || items.len() < 2 {
		return Err(PolygenError::InvalidKey(key.to_string()));
	}

	if items[1] == "user" {
		if items.len() != 3 {
			return Err(PolygenError::InvalidKey(key.to_string()));
		}
		let (access_key, endpoint) = split_access_endpoint(key, items[2])?;
		return Ok(ConnectionRecord {
			epoch: current_epoch,
			access_key,
			endpoint,
			direction: None,
			instance_id: None,
			data: 0,
		});
	}

	if items[1] == "v2" {
		if items.len() != 6 || items[2] != "user" {
			return Err(PolygenError::InvalidKey(key.to_string()));
		}
		let direction = Direction::from_str(items[3]).ok_or_else(|| PolygenError::InvalidKey(key.to_string()))?;
		let instance_id = items[4].to_string();
		let (access_key, endpoint) = split_access_endpoint(key, items[5])?;
		return Ok(ConnectionRecord {
			epoch: current_epoch,
			access_key,
			endpoint,
			direction: Some(direction),
			instance_id: Some(instance_id),
			data: 0,
		});
	}

	Err(PolygenError::InvalidKey(key.to_string()))
}

/// Parsed shape of a `conn_v2_*` key, used by the demand aggregator which
/// needs the direction/instance split but not a full [`ConnectionRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandKeyParts {
	pub access_key: UserKey,
	pub direction: Direction,
	pub instance_id: String,
}

/// Parses a `conn_v2_user_<dir>_<instance>_<access>$<endpoint>` key for
/// demand aggregation, discarding the endpoint (demand is endpoint-agnostic).
///
/// # Errors
/// Returns [`PolygenError::InvalidKey`] on any shape mismatch.
pub fn parse_demand_key(key: &str) -> Result<DemandKeyParts, PolygenError> {
	let record = parse_connection_key(key, 0)?;
	let direction = record.direction.ok_or_else(|| PolygenError::InvalidKey(key.to_string()))?;
	let instance_id = record.instance_id.ok_or_else(|| PolygenError::InvalidKey(key.to_string()))?;
	Ok(DemandKeyParts { access_key: record.access_key, direction, instance_id })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_verb_key() {
		let rec = parse_verb_key("verb_1599322430_user_KEY1$dev.dc").unwrap();
		assert_eq!(rec.epoch, 1_599_322_430);
		assert_eq!(rec.access_key, "KEY1");
		assert_eq!(rec.endpoint, "dev.dc");
	}

	#[test]
	fn rejects_verb_key_with_non_alnum_access() {
		assert!(parse_verb_key("verb_1599322430_user_KEY-1$dev.dc").is_err());
	}

	#[test]
	fn rejects_malformed_verb_key() {
		assert!(parse_verb_key("verb_user_KEY1$dev.dc").is_err());
	}

	#[test]
	fn parses_v1_connection_key() {
		let rec = parse_connection_key("conn_user_KEY1$dev.dc", 42).unwrap();
		assert_eq!(rec.access_key, "KEY1");
		assert_eq!(rec.endpoint, "dev.dc");
		assert_eq!(rec.epoch, 42);
		assert!(rec.direction.is_none());
		assert!(rec.instance_id.is_none());
	}

	#[test]
	fn parses_v2_connection_key() {
		let rec = parse_connection_key("conn_v2_user_up_instance1234_KEY1$dev.dc", 42).unwrap();
		assert_eq!(rec.access_key, "KEY1");
		assert_eq!(rec.endpoint, "dev.dc");
		assert_eq!(rec.direction, Some(Direction::Up));
		assert_eq!(rec.instance_id.as_deref(), Some("instance1234"));
	}

	#[test]
	fn rejects_v2_key_with_bad_direction() {
		assert!(parse_connection_key("conn_v2_user_sideways_instance1234_KEY1$dev.dc", 42).is_err());
	}

	#[test]
	fn parses_demand_key() {
		let parts = parse_demand_key("conn_v2_user_dwn_instance1234_KEY1$dev.dc").unwrap();
		assert_eq!(parts.access_key, "KEY1");
		assert_eq!(parts.direction, Direction::Down);
		assert_eq!(parts.instance_id, "instance1234");
	}

	#[test]
	fn demand_key_rejects_v1_shape() {
		assert!(parse_demand_key("conn_user_KEY1$dev.dc").is_err());
	}
}
