//! Explicit loop-timing helper standing in for the source's `avg_time`
//! decorator (Python `functools.wraps`-based timing wrapper). Rust has no
//! attribute-macro equivalent worth building just for this, so it's an
//! object each loop calls explicitly around its body.

use std::time::Instant;
use tracing::info;

/// Samples iteration wall-clock duration and logs a running average every
/// `sample_size` samples, mirroring `policy_generator.py`'s `avg_time`.
pub struct LoopTimer {
	zone: String,
	label: &'static str,
	sample_size: usize,
	samples: Vec<u128>,
}

impl LoopTimer {
	#[must_use]
	pub fn new(zone: impl Into<String>, label: &'static str, sample_size: usize) -> Self {
		Self { zone: zone.into(), label, sample_size, samples: Vec::with_capacity(sample_size) }
	}

	/// Runs `body`, records its wall-clock duration in microseconds, and
	/// flushes a running-average log line once `sample_size` samples have
	/// accumulated.
	pub fn time<T>(&mut self, body: impl FnOnce() -> T) -> T {
		let start = Instant::now();
		let result = body();
		self.record(start.elapsed());
		result
	}

	/// Records a duration measured by the caller. Async loop bodies can't be
	/// wrapped in a plain closure the way `time` wraps a sync one, so they
	/// measure the `await` themselves and hand the elapsed duration here.
	pub fn record(&mut self, elapsed: std::time::Duration) {
		self.samples.push(elapsed.as_micros());
		if self.samples.len() >= self.sample_size {
			#[allow(clippy::cast_precision_loss)]
			let average = self.samples.iter().sum::<u128>() as f64 / self.samples.len() as f64;
			#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
			let average_us = average as u64;
			info!(zone = %self.zone, func = self.label, average_time_us = average_us, "loop timing");
			self.samples.clear();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accumulates_and_clears_after_sample_size() {
		let mut timer = LoopTimer::new("test", "check_loop", 3);
		for _ in 0..3 {
			timer.time(|| ());
		}
		assert!(timer.samples.is_empty());
	}
}
