//! The endpoint → proxy-instance topology, grounded on
//! `policy_generator.py`'s `_get_haproxies_from_config`.

use crate::config::EngineConfig;
use crate::model::{Endpoint, ProxyInstance};
use std::collections::HashMap;

/// Maps each configured endpoint to its list of proxy instances. Built
/// once at startup from `haproxy_servers` and never mutated afterward.
#[derive(Debug, Clone, Default)]
pub struct Topology {
	by_endpoint: HashMap<Endpoint, Vec<ProxyInstance>>,
}

impl Topology {
	/// Parses `host:port` entries under each configured endpoint. Entries
	/// that don't split into exactly two `:`-separated parts are skipped
	/// with a warning, matching the source's `len(items) == 2` guard.
	#[must_use]
	pub fn from_config(config: &EngineConfig) -> Self {
		let mut by_endpoint: HashMap<Endpoint, Vec<ProxyInstance>> = HashMap::new();
		for (endpoint, servers) in &config.haproxy_servers {
			for entry in servers {
				let Some((host, port)) = entry.trim().split_once(':') else {
					tracing::warn!(endpoint, entry, "skipping malformed haproxy_servers entry");
					continue;
				};
				let Ok(port) = port.parse::<u16>() else {
					tracing::warn!(endpoint, entry, "skipping haproxy_servers entry with invalid port");
					continue;
				};
				by_endpoint
					.entry(endpoint.clone())
					.or_default()
					.push(ProxyInstance { endpoint: endpoint.clone(), host: host.to_string(), port });
			}
		}
		Self { by_endpoint }
	}

	#[must_use]
	pub fn proxies_for(&self, endpoint: &str) -> &[ProxyInstance] {
		self.by_endpoint.get(endpoint).map_or(&[], Vec::as_slice)
	}

	#[must_use]
	pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
		self.by_endpoint.keys()
	}

	/// Every configured proxy instance across all endpoints, used by the
	/// demand aggregator which fans limit-share messages out globally.
	#[must_use]
	pub fn all_proxies(&self) -> Vec<&ProxyInstance> {
		self.by_endpoint.values().flatten().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap as Map;

	#[test]
	fn builds_endpoint_to_proxies_map() {
		let mut config = EngineConfig::test();
		config.haproxy_servers = Map::from([("dev.dc".to_string(), vec!["127.0.0.1:9001".to_string(), "127.0.0.1:9002".to_string()])]);
		let topology = Topology::from_config(&config);

		assert_eq!(topology.proxies_for("dev.dc").len(), 2);
		assert!(topology.proxies_for("missing.dc").is_empty());
		assert_eq!(topology.all_proxies().len(), 2);
	}

	#[test]
	fn skips_malformed_entries() {
		let mut config = EngineConfig::test();
		config.haproxy_servers = Map::from([("dev.dc".to_string(), vec!["not-a-valid-entry".to_string(), "127.0.0.1:9001".to_string()])]);
		let topology = Topology::from_config(&config);

		assert_eq!(topology.proxies_for("dev.dc").len(), 1);
	}
}
