//! Violation bookkeeping: per-epoch de-duplication and message formatting,
//! ported from `weir/models/violations.py` (`Violations`, `EndpointViolations`,
//! `UserLevelViolation`).

use crate::model::{Endpoint, UsageCategory, UserKey, USECS_IN_SEC};
use std::collections::{HashMap, HashSet};

/// Resend a previously-sent bandwidth violation only when the new ratio
/// exceeds the last-sent ratio by more than this factor.
pub const DIFF_RATIO_RESEND_FACTOR: f64 = 0.15;

/// Per-(endpoint, category) violation tracking: users not yet emitted this
/// epoch (`new_keys`) and users already emitted (`sent_keys`).
#[derive(Debug, Default)]
struct UserLevelViolation {
	new_keys: HashSet<UserKey>,
	sent_keys: HashSet<UserKey>,
	violation_ratios: HashMap<UserKey, f64>,
}

impl UserLevelViolation {
	fn add_new_key(&mut self, key: &str, diff_ratio: Option<f64>, remove_sent: bool) {
		self.new_keys.insert(key.to_string());
		if let Some(ratio) = diff_ratio {
			self.violation_ratios.insert(key.to_string(), ratio);
		}
		if remove_sent {
			self.sent_keys.remove(key);
		}
	}

	fn generate_message(&self, category: UsageCategory, epoch_time: f64) -> String {
		if category.is_bandwidth() {
			self.generate_bandwidth_message(category, epoch_time)
		} else if matches!(category, UsageCategory::ReqsBlock | UsageCategory::ReqsUnblock) {
			self.generate_requests_message(category)
		} else {
			self.generate_verb_message(category, epoch_time)
		}
	}

	#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
	fn generate_verb_message(&self, category: UsageCategory, epoch_time: f64) -> String {
		let epoch_us = (epoch_time * USECS_IN_SEC as f64).floor() as i64;
		let users = self.new_keys.iter().cloned().collect::<Vec<_>>().join(",");
		format!("{epoch_us},{category},{users}")
	}

	#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
	fn generate_bandwidth_message(&self, category: UsageCategory, epoch_time: f64) -> String {
		let epoch_us = (epoch_time * USECS_IN_SEC as f64).floor() as i64;
		let users = self
			.new_keys
			.iter()
			.map(|k| format!("{k}:{:.1}", self.violation_ratios.get(k).copied().unwrap_or(0.0)))
			.collect::<Vec<_>>()
			.join(",");
		format!("{epoch_us},{category},{users}")
	}

	fn generate_requests_message(&self, category: UsageCategory) -> String {
		let users = self.new_keys.iter().cloned().collect::<Vec<_>>().join(",");
		format!("{category},{users}")
	}
}

/// All tracked categories for one endpoint, pre-populated in declaration
/// order so message generation is deterministic across runs.
struct EndpointViolations {
	violations: HashMap<UsageCategory, UserLevelViolation>,
	order: Vec<UsageCategory>,
}

impl Default for EndpointViolations {
	fn default() -> Self {
		let order = UsageCategory::all();
		let violations = order.iter().map(|&c| (c, UserLevelViolation::default())).collect();
		Self { violations, order }
	}
}

/// Groups violations by `(endpoint, category)` for one epoch, suppressing
/// duplicates and re-arming bandwidth violations on significant ratio
/// movement. Thread-confined to the detector task that owns it.
#[derive(Default)]
pub struct Bookkeeper {
	epoch: i64,
	endpoints: HashMap<Endpoint, EndpointViolations>,
}

impl Bookkeeper {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[allow(clippy::cast_possible_truncation)]
	fn new_epoch(&mut self, epoch_time: f64) {
		self.epoch = epoch_time as i64;
		self.endpoints.clear();
	}

	/// Adds a violation for `(endpoint, category, user)`. If `epoch_time`
	/// falls in a later second than the bookkeeper's current epoch, all
	/// state is discarded first (SPEC_FULL §4.3 epoch reset).
	///
	/// # Panics
	/// Never panics in practice: every [`UsageCategory`] is pre-populated
	/// into a fresh `EndpointViolations`, so the lookup always succeeds.
	#[allow(clippy::cast_possible_truncation)]
	pub fn add_violation(&mut self, epoch_time: f64, endpoint: &str, category: UsageCategory, user: &str, diff_ratio: Option<f64>) {
		if epoch_time as i64 > self.epoch {
			self.new_epoch(epoch_time);
		}

		let endpoint_violations = self.endpoints.entry(endpoint.to_string()).or_default();
		let violation = endpoint_violations
			.violations
			.get_mut(&category)
			.expect("EndpointViolations is pre-populated with every UsageCategory");

		if !violation.sent_keys.contains(user) {
			violation.add_new_key(user, diff_ratio, false);
		} else if category.is_bandwidth() {
			if let Some(ratio) = diff_ratio {
				let sent_ratio = violation.violation_ratios.get(user).copied().unwrap_or(0.0);
				if ratio - sent_ratio > DIFF_RATIO_RESEND_FACTOR {
					violation.add_new_key(user, Some(ratio), true);
				}
			}
		}
	}

	/// All endpoints with at least one tracked violation group this epoch.
	pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
		self.endpoints.keys()
	}

	/// Produces one message per non-empty `(endpoint, category)` group for
	/// `endpoint`, moving their `new_keys` into `sent_keys` and clearing
	/// `new_keys` as a side effect.
	///
	/// # Panics
	/// Never panics in practice, for the same reason as [`Self::add_violation`].
	pub fn generate_violation_messages(&mut self, endpoint: &str, epoch_time: f64) -> Vec<String> {
		let Some(endpoint_violations) = self.endpoints.get_mut(endpoint) else {
			return Vec::new();
		};

		let mut messages = Vec::new();
		for category in &endpoint_violations.order {
			let violation = endpoint_violations.violations.get_mut(category).expect("pre-populated");
			if violation.new_keys.is_empty() {
				continue;
			}
			messages.push(violation.generate_message(*category, epoch_time));
			for key in violation.new_keys.drain() {
				violation.sent_keys.insert(key);
			}
		}
		messages
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verb_violation_message_format() {
		let mut bk = Bookkeeper::new();
		bk.add_violation(1_599_322_430.0, "dev.dc", UsageCategory::Get, "KEY1", None);
		let msgs = bk.generate_violation_messages("dev.dc", 1_599_322_430.0);
		assert_eq!(msgs, vec!["1599322430000000,user_GET,KEY1".to_string()]);
	}

	#[test]
	fn verb_dedup_within_epoch() {
		let mut bk = Bookkeeper::new();
		bk.add_violation(1_599_322_430.0, "dev.dc", UsageCategory::Head, "KEY1", None);
		let msgs = bk.generate_violation_messages("dev.dc", 1_599_322_430.0);
		assert_eq!(msgs.len(), 1);

		bk.add_violation(1_599_322_430.0, "dev.dc", UsageCategory::Head, "KEY1", None);
		let msgs = bk.generate_violation_messages("dev.dc", 1_599_322_430.0);
		assert!(msgs.is_empty());

		bk.add_violation(1_599_322_430.0, "dev.dc", UsageCategory::Get, "KEY1", None);
		let msgs = bk.generate_violation_messages("dev.dc", 1_599_322_430.0);
		assert_eq!(msgs, vec!["1599322430000000,user_GET,KEY1".to_string()]);
	}

	#[test]
	fn bandwidth_resend_on_significant_ratio_change() {
		let mut bk = Bookkeeper::new();
		let epoch = 1_730_129_134.120_075;

		bk.add_violation(epoch, "dev.dc", UsageCategory::BandwidthDown, "KEY1", Some(1.2));
		let msgs = bk.generate_violation_messages("dev.dc", epoch);
		assert_eq!(msgs, vec![format!("{},user_bnd_dwn,KEY1:1.2", (epoch * 1_000_000.0).floor() as i64)]);

		// delta 0.1 <= 0.15: suppressed
		bk.add_violation(epoch, "dev.dc", UsageCategory::BandwidthDown, "KEY1", Some(1.3));
		assert!(bk.generate_violation_messages("dev.dc", epoch).is_empty());

		// delta 0.2 > 0.15: resent
		bk.add_violation(epoch, "dev.dc", UsageCategory::BandwidthDown, "KEY1", Some(1.4));
		let msgs = bk.generate_violation_messages("dev.dc", epoch);
		assert_eq!(msgs, vec![format!("{},user_bnd_dwn,KEY1:1.4", (epoch * 1_000_000.0).floor() as i64)]);
	}

	#[test]
	fn verb_violations_ignore_diff_ratio_resend_logic() {
		let mut bk = Bookkeeper::new();
		let epoch = 1_730_129_134.120_075;

		bk.add_violation(epoch, "dev.dc", UsageCategory::Head, "KEY1", Some(1.2));
		assert_eq!(bk.generate_violation_messages("dev.dc", epoch).len(), 1);

		bk.add_violation(epoch, "dev.dc", UsageCategory::Head, "KEY1", Some(1.4));
		assert!(bk.generate_violation_messages("dev.dc", epoch).is_empty());
	}

	#[test]
	fn requests_block_message_has_no_timestamp() {
		let mut bk = Bookkeeper::new();
		bk.add_violation(1_599_322_430.0, "dev.dc", UsageCategory::ReqsBlock, "KEY1", None);
		let msgs = bk.generate_violation_messages("dev.dc", 1_599_322_430.0);
		assert_eq!(msgs, vec!["user_reqs_block,KEY1".to_string()]);
	}

	#[test]
	fn all_categories_emit_independent_messages() {
		let mut bk = Bookkeeper::new();
		let epoch = 1_599_322_430.0;
		for verb in UsageCategory::verb_values() {
			bk.add_violation(epoch, "dev.dc", *verb, "KEY1", None);
		}
		for thru in UsageCategory::throughput_values() {
			bk.add_violation(epoch, "dev.dc", *thru, "KEY1", Some(1.5));
		}
		for req in UsageCategory::requests_values() {
			bk.add_violation(epoch, "dev.dc", *req, "KEY1", None);
		}

		let msgs = bk.generate_violation_messages("dev.dc", epoch);
		assert_eq!(msgs.len(), 18);
		assert_eq!(msgs[0], "1599322430000000,user_GET,KEY1");
		assert_eq!(msgs[13], "1599322430000000,user_CREATEBUCKET,KEY1");
		assert_eq!(msgs[14], "1599322430000000,user_bnd_dwn,KEY1:1.5");
		assert_eq!(msgs[16], "user_reqs_block,KEY1");
	}

	#[test]
	fn epoch_rollover_discards_prior_state() {
		let mut bk = Bookkeeper::new();
		bk.add_violation(1.0, "dev.dc", UsageCategory::Get, "KEY1", None);
		bk.generate_violation_messages("dev.dc", 1.0);
		assert!(bk.endpoints().next().is_some());

		bk.add_violation(2.0, "dev.dc", UsageCategory::Get, "KEY1", None);
		// sent_keys from epoch 1 should have been wiped: this is a brand new
		// group so the key shows up as new again.
		let msgs = bk.generate_violation_messages("dev.dc", 2.0);
		assert_eq!(msgs, vec!["2000000,user_GET,KEY1".to_string()]);
	}

	#[test]
	fn unknown_endpoint_yields_no_messages() {
		let mut bk = Bookkeeper::new();
		assert!(bk.generate_violation_messages("nope", 1.0).is_empty());
	}
}
