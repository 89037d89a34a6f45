//! Outbound dispatch: one bounded queue and one writer task per proxy,
//! grounded on `policy_generator.py`'s `HaproxyServer` (`add_message`,
//! `_send_policies`, `run`) for control flow and
//! `apps/servers/file_host/src/utils/retry.rs::retry_async` for the
//! reconnect-with-backoff shape, generalized down to the source's fixed
//! max-2-attempt retry.

use crate::metrics::EngineMetrics;
use crate::model::ProxyInstance;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const VIOLATIONS_FRAME_HEADER: &str = "policies\n";
pub const VIOLATIONS_FRAME_TRAILER: &str = "\nEND_OF_POLICIES\n";
pub const LIMIT_SHARE_FRAME_HEADER: &str = "limit_share\n";
pub const LIMIT_SHARE_FRAME_TRAILER: &str = "\nend_limit_share\n";

const MAX_SEND_ATTEMPTS: u32 = 2;

/// Frames a batch of violation-message lines as `policies\n...\nEND_OF_POLICIES\n`.
#[must_use]
pub fn frame_violations(messages: &[String]) -> String {
	format!("{VIOLATIONS_FRAME_HEADER}{}{VIOLATIONS_FRAME_TRAILER}", messages.join("\n"))
}

/// Frames a batch of limit-share lines as `limit_share\n...\nend_limit_share\n`.
#[must_use]
pub fn frame_limit_share(lines: &[String]) -> String {
	format!("{LIMIT_SHARE_FRAME_HEADER}{}{LIMIT_SHARE_FRAME_TRAILER}", lines.join("\n"))
}

/// A handle producers use to enqueue already-formatted messages for one
/// proxy. Cloning is cheap (it's a `mpsc::Sender`); hand out clones to the
/// verb and connection detector loops.
#[derive(Clone)]
pub struct ProxyQueueHandle {
	instance: ProxyInstance,
	sender: mpsc::Sender<String>,
	metrics: EngineMetrics,
}

impl ProxyQueueHandle {
	/// Enqueues `message` without blocking. On a full queue, logs and
	/// drops it (SPEC_FULL §4.5/§7: backpressure signal, not fatal).
	pub fn enqueue(&self, message: String) {
		if let Err(mpsc::error::TrySendError::Full(_)) = self.sender.try_send(message) {
			self.metrics.queue_drops.inc();
			error!(proxy = %self.instance, "policy message queue full, dropping message");
		}
	}
}

/// Owns the bounded queue and persistent TCP connection for one proxy
/// instance. `spawn_writer` starts the dedicated writer task; producers
/// only ever see a [`ProxyQueueHandle`].
pub struct ProxyDispatcher {
	instance: ProxyInstance,
	queue_size: usize,
}

impl ProxyDispatcher {
	#[must_use]
	pub fn new(instance: ProxyInstance, queue_size: usize) -> Self {
		Self { instance, queue_size }
	}

	/// Spawns the writer task and returns a handle producers use to
	/// enqueue messages for it.
	pub fn spawn_writer(self, sleep_time: Duration, metrics: EngineMetrics, shutdown: CancellationToken) -> ProxyQueueHandle {
		let (tx, rx) = mpsc::channel(self.queue_size);
		let handle = ProxyQueueHandle { instance: self.instance.clone(), sender: tx, metrics: metrics.clone() };
		tokio::spawn(writer_loop(self.instance, rx, sleep_time, metrics, shutdown));
		handle
	}
}

async fn writer_loop(instance: ProxyInstance, mut rx: mpsc::Receiver<String>, sleep_time: Duration, metrics: EngineMetrics, shutdown: CancellationToken) {
	let mut socket: Option<TcpStream> = None;
	let pacing = sleep_time / 2;

	loop {
		let first = tokio::select! {
			() = shutdown.cancelled() => break,
			message = rx.recv() => message,
		};
		let Some(first) = first else { break };

		let mut batch = vec![first];
		while let Ok(message) = rx.try_recv() {
			batch.push(message);
		}

		let payload = frame_violations(&batch);
		send_with_retry(&instance, &mut socket, &payload, &metrics).await;

		tokio::select! {
			() = shutdown.cancelled() => break,
			() = tokio::time::sleep(pacing) => {}
		}
	}

	// Drain and flush whatever arrived during shutdown, up to a short deadline.
	let mut leftovers = Vec::new();
	while let Ok(message) = rx.try_recv() {
		leftovers.push(message);
	}
	if !leftovers.is_empty() {
		let payload = frame_violations(&leftovers);
		let _ = tokio::time::timeout(Duration::from_secs(1), send_with_retry(&instance, &mut socket, &payload, &metrics)).await;
	}
}

async fn send_with_retry(instance: &ProxyInstance, socket: &mut Option<TcpStream>, payload: &str, metrics: &EngineMetrics) {
	if payload.is_empty() {
		return;
	}

	for attempt in 1..=MAX_SEND_ATTEMPTS {
		if socket.is_none() || attempt > 1 {
			match TcpStream::connect((instance.host.as_str(), instance.port)).await {
				Ok(stream) => {
					debug!(proxy = %instance, "connected to proxy");
					*socket = Some(stream);
					if attempt > 1 {
						metrics.proxy_reconnects.inc();
					}
				}
				Err(err) => {
					warn!(proxy = %instance, attempt, error = %err, "failed to connect to proxy");
					continue;
				}
			}
		}

		if let Some(stream) = socket.as_mut() {
			match stream.write_all(payload.as_bytes()).await {
				Ok(()) => return,
				Err(err) => {
					warn!(proxy = %instance, attempt, error = %err, "error sending policies, will retry");
					*socket = None;
				}
			}
		}
	}

	error!(proxy = %instance, attempts = MAX_SEND_ATTEMPTS, "exhausted all retries sending to proxy, dropping batch");
}

/// Sends a limit-share block directly to `instance`, bypassing the queue
/// (SPEC_FULL §4.4 step 6: the block is self-contained and infrequent).
pub async fn send_limit_share_direct(instance: &ProxyInstance, payload: &str, metrics: &EngineMetrics) {
	let mut socket = None;
	send_with_retry(instance, &mut socket, payload, metrics).await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;

	#[test]
	fn frames_violations_exactly() {
		let msgs = vec!["1599322430000000,user_GET,KEY1".to_string()];
		assert_eq!(frame_violations(&msgs), "policies\n1599322430000000,user_GET,KEY1\nEND_OF_POLICIES\n");
	}

	#[test]
	fn frames_limit_share_exactly() {
		let lines = vec!["100,KEY1,instance1_dwn_52428800".to_string()];
		assert_eq!(frame_limit_share(&lines), "limit_share\n100,KEY1,instance1_dwn_52428800\nend_limit_share\n");
	}

	#[tokio::test]
	async fn queue_full_drops_and_counts() {
		let metrics = EngineMetrics::new().unwrap();
		let (tx, mut rx) = mpsc::channel(1);
		let handle = ProxyQueueHandle {
			instance: ProxyInstance { endpoint: "dev.dc".to_string(), host: "127.0.0.1".to_string(), port: 1 },
			sender: tx,
			metrics: metrics.clone(),
		};
		handle.enqueue("a".to_string());
		handle.enqueue("b".to_string());

		assert_relative_eq!(metrics.queue_drops.get(), 1.0);
		assert_eq!(rx.recv().await, Some("a".to_string()));
	}
}
