//! In-process Prometheus metric registration, grounded on
//! `task_queue::pool::WorkerPool`'s `Counter`/`Gauge`/`Registry` pattern.
//! The HTTP exposer that would scrape this registry is the out-of-scope
//! sidecar named in SPEC_FULL §1; only the registration surface lives here.

use crate::error::PolygenError;
use prometheus::{Counter, Gauge, Registry};

/// The engine's in-process metric objects. Construct once at startup and
/// clone the `Arc`-backed handles into each task that needs to touch them.
#[derive(Clone)]
pub struct EngineMetrics {
	pub registry: Registry,
	pub violations_emitted: Counter,
	pub scan_iterations: Counter,
	pub scan_failures: Counter,
	pub queue_drops: Counter,
	pub proxy_reconnects: Counter,
	pub active_violation_workers: Gauge,
}

impl EngineMetrics {
	/// # Errors
	/// Returns [`PolygenError::Prometheus`] if a metric name collides with
	/// one already registered (should only happen if this is called twice).
	pub fn new() -> Result<Self, PolygenError> {
		let registry = Registry::new();

		let violations_emitted = Counter::new("polygen_violations_emitted_total", "Total violation messages emitted")?;
		let scan_iterations = Counter::new("polygen_scan_iterations_total", "Total detector scan iterations completed")?;
		let scan_failures = Counter::new("polygen_scan_failures_total", "Total detector scan iterations aborted on error")?;
		let queue_drops = Counter::new("polygen_queue_drops_total", "Total outbound messages dropped due to a full proxy queue")?;
		let proxy_reconnects = Counter::new("polygen_proxy_reconnects_total", "Total proxy TCP reconnect attempts")?;
		let active_violation_workers = Gauge::new("polygen_active_violation_workers", "Number of in-flight violation-check batches")?;

		registry.register(Box::new(violations_emitted.clone()))?;
		registry.register(Box::new(scan_iterations.clone()))?;
		registry.register(Box::new(scan_failures.clone()))?;
		registry.register(Box::new(queue_drops.clone()))?;
		registry.register(Box::new(proxy_reconnects.clone()))?;
		registry.register(Box::new(active_violation_workers.clone()))?;

		Ok(Self { registry, violations_emitted, scan_iterations, scan_failures, queue_drops, proxy_reconnects, active_violation_workers })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_without_collision() {
		let metrics = EngineMetrics::new().unwrap();
		assert_eq!(metrics.registry.gather().len(), 6);
	}
}
