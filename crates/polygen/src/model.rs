use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const MB: i64 = 1_048_576;
pub const USECS_IN_SEC: i64 = 1_000_000;
pub const MSECS_IN_SEC: i64 = 1_000;

pub const DEFAULT_QOS_ID: &str = "common";
pub const QOS_VERB_LIMIT_NOT_CONFIGURED: i64 = -1;
pub const DEFAULT_VERB_RATE_LIMIT: i64 = 1000;
pub const DEFAULT_VERB_BDW_LIMIT: i64 = 250;
pub const DEFAULT_AREQ_LIMIT: i64 = 5000;

pub const VERB_BANDWIDTH_PATTERN: &str = "_bnd_";
pub const AREQ_LIMITING_PATTERN: &str = "_conns";

/// Traffic direction as carried on the wire (`"up"` / `"dwn"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
	Up,
	Down,
}

impl Direction {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Up => "up",
			Self::Down => "dwn",
		}
	}

	#[must_use]
	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"up" => Some(Self::Up),
			"dwn" => Some(Self::Down),
			_ => None,
		}
	}
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A usage category that can be rate-limited. Mirrors the closed set of
/// verb/bandwidth/connection names a proxy reports under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageCategory {
	Get,
	Put,
	Post,
	Delete,
	Head,
	ListObjectsV2,
	ListMultipartUploads,
	ListObjectVersions,
	ListBuckets,
	ListObjects,
	GetObject,
	DeleteObjects,
	DeleteObject,
	CreateBucket,
	BandwidthDown,
	BandwidthUp,
	ReqsBlock,
	ReqsUnblock,
	Connections,
}

impl UsageCategory {
	/// All fourteen verb categories, in declaration order — the order in
	/// which violation messages must be generated for determinism.
	#[must_use]
	pub const fn verb_values() -> &'static [Self] {
		&[
			Self::Get,
			Self::Put,
			Self::Post,
			Self::Delete,
			Self::Head,
			Self::ListObjectsV2,
			Self::ListMultipartUploads,
			Self::ListObjectVersions,
			Self::ListBuckets,
			Self::ListObjects,
			Self::GetObject,
			Self::DeleteObjects,
			Self::DeleteObject,
			Self::CreateBucket,
		]
	}

	#[must_use]
	pub const fn throughput_values() -> &'static [Self] {
		&[Self::BandwidthDown, Self::BandwidthUp]
	}

	#[must_use]
	pub const fn requests_values() -> &'static [Self] {
		&[Self::ReqsBlock, Self::ReqsUnblock]
	}

	/// All enum members in declaration order, used to pre-populate
	/// per-endpoint violation tracking so message ordering is deterministic.
	#[must_use]
	pub fn all() -> Vec<Self> {
		Self::verb_values()
			.iter()
			.chain(Self::throughput_values())
			.chain(Self::requests_values())
			.copied()
			.collect()
	}

	/// The wire name for this category, e.g. `"GET"`, `"bnd_dwn"`.
	#[must_use]
	pub const fn field_name(self) -> &'static str {
		match self {
			Self::Get => "GET",
			Self::Put => "PUT",
			Self::Post => "POST",
			Self::Delete => "DELETE",
			Self::Head => "HEAD",
			Self::ListObjectsV2 => "LISTOBJECTSV2",
			Self::ListMultipartUploads => "LISTMULTIPARTUPLOADS",
			Self::ListObjectVersions => "LISTOBJECTVERSIONS",
			Self::ListBuckets => "LISTBUCKETS",
			Self::ListObjects => "LISTOBJECTS",
			Self::GetObject => "GETOBJECT",
			Self::DeleteObjects => "DELETEOBJECTS",
			Self::DeleteObject => "DELETEOBJECT",
			Self::CreateBucket => "CREATEBUCKET",
			Self::BandwidthDown => "bnd_dwn",
			Self::BandwidthUp => "bnd_up",
			Self::ReqsBlock => "reqs_block",
			Self::ReqsUnblock => "reqs_unblock",
			Self::Connections => "conns",
		}
	}

	/// The `user_<field>`-prefixed limit-config key this category is looked
	/// up under.
	#[must_use]
	pub fn limit_key(self) -> String {
		format!("user_{}", self.field_name())
	}

	#[must_use]
	pub fn from_field_name(field: &str) -> Option<Self> {
		Self::all().into_iter().find(|c| c.field_name() == field)
	}

	#[must_use]
	pub const fn is_bandwidth(self) -> bool {
		matches!(self, Self::BandwidthDown | Self::BandwidthUp)
	}
}

impl fmt::Display for UsageCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.limit_key().as_str())
	}
}

pub type UserKey = String;
pub type Endpoint = String;
pub type QoSClassName = String;

/// A bundle of per-category limits, keyed by the category's limit-config
/// name (e.g. `"user_GET"`, `"user_bnd_dwn"`). Missing entries mean
/// "not configured" rather than zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QoSClass(pub HashMap<String, i64>);

impl QoSClass {
	#[must_use]
	pub fn get(&self, category: UsageCategory) -> Option<i64> {
		self.0.get(&category.limit_key()).copied().filter(|&v| v != QOS_VERB_LIMIT_NOT_CONFIGURED)
	}
}

/// The full limit configuration: which class each user belongs to, and what
/// each class's limits are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitConfig {
	pub user_to_qos_id: HashMap<UserKey, QoSClassName>,
	pub qos: HashMap<QoSClassName, QoSClass>,
}

/// A proxy instance a limit-share or violation message can be addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyInstance {
	pub endpoint: Endpoint,
	pub host: String,
	pub port: u16,
}

impl fmt::Display for ProxyInstance {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// A verb/bandwidth usage sample parsed from a `verb_<epoch>_user_...` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
	pub epoch: i64,
	pub access_key: UserKey,
	pub endpoint: Endpoint,
}

/// A connection-count sample parsed from a `conn_*` key, after v1/v2
/// normalization and merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
	pub epoch: i64,
	pub access_key: UserKey,
	pub endpoint: Endpoint,
	pub direction: Option<Direction>,
	pub instance_id: Option<String>,
	pub data: i64,
}

impl ConnectionRecord {
	/// The `(access_key, endpoint, epoch)` grouping key used to merge
	/// per-direction/per-instance v2 records into one per-user total.
	#[must_use]
	pub fn merge_key(&self) -> (UserKey, Endpoint, i64) {
		(self.access_key.clone(), self.endpoint.clone(), self.epoch)
	}

	/// Sums `data` from `other` into `self`. Callers must ensure both
	/// records share a `merge_key()`.
	pub fn merge_from(&mut self, other: &Self) {
		self.data += other.data;
	}
}

/// `(user, direction) -> (instance_id -> outstanding demand)`.
pub type DemandMap = HashMap<(UserKey, Direction), HashMap<String, i64>>;
